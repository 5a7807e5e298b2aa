use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Multi-tenant root. Teams hang off an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub slug: String,
    pub settings: TeamSettings,
    pub created_at: DateTime<Utc>,
}

/// Team-scoped knobs. Budget caps here override the global `[budgets]`
/// configuration; `None` falls through to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamSettings {
    pub daily_cap: Option<Decimal>,
    pub per_task_cap: Option<Decimal>,
    pub default_model: Option<String>,
    pub auto_merge: bool,
    pub branch_prefix: Option<String>,
    pub conventions: Vec<String>,
    pub prefer_agent_reviewer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Manager,
    Engineer,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Manager => "manager",
            AgentRole::Engineer => "engineer",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "manager" => Ok(AgentRole::Manager),
            "engineer" => Ok(AgentRole::Engineer),
            "reviewer" => Ok(AgentRole::Reviewer),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "paused" => Ok(AgentStatus::Paused),
            "error" => Ok(AgentStatus::Error),
            _ => Err(()),
        }
    }
}

/// A named actor that performs work by consuming inbox messages during a
/// dispatcher turn. The `adapter` tag names the external runner that
/// executes the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub model: String,
    pub adapter: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub local_path: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

/// Record of an inbound webhook hand-off. Ingestion and signature
/// verification happen outside the core; only the audit record lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub received_at: DateTime<Utc>,
}
