use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;

pub type HumanRequestId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Question,
    Approval,
    Review,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Question => "question",
            RequestKind::Approval => "approval",
            RequestKind::Review => "review",
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "question" => Ok(RequestKind::Question),
            "approval" => Ok(RequestKind::Approval),
            "review" => Ok(RequestKind::Review),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Resolved => "resolved",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "resolved" => Ok(RequestStatus::Resolved),
            "expired" => Ok(RequestStatus::Expired),
            _ => Err(()),
        }
    }
}

/// An agent-originated request for human input. Exactly one terminal
/// transition: pending → resolved or pending → expired; `response` is set
/// iff resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanRequest {
    pub id: HumanRequestId,
    pub team_id: Uuid,
    pub agent_id: Uuid,
    pub task_id: Option<TaskId>,
    pub kind: RequestKind,
    pub question: String,
    pub options: Vec<String>,
    pub status: RequestStatus,
    pub response: Option<String>,
    pub responded_by: Option<Uuid>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
