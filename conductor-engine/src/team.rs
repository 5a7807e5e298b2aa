//! Administration of the tenant hierarchy: organizations, teams (with their
//! auto-provisioned manager agent), agents, repositories, team settings and
//! webhook-delivery records.

use std::sync::Arc;

use chrono::Utc;
use conductor_core::ConductorError;
use conductor_core::event::{
    EventMetadata, EventPayload, agent_stream, repo_stream, team_stream,
};
use conductor_core::team::{
    Agent, AgentRole, AgentStatus, Organization, Repository, Team, TeamSettings, WebhookDelivery,
};
use conductor_store::{Store, storage, teams};
use uuid::Uuid;

use crate::clock::Clock;

const DEFAULT_AGENT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_ADAPTER: &str = "claude_code";

#[derive(Clone)]
pub struct TeamService {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl TeamService {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_org(&self, name: &str, slug: &str) -> Result<Organization, ConductorError> {
        if name.trim().is_empty() || slug.trim().is_empty() {
            return Err(ConductorError::Validation(
                "organization name and slug must not be empty".into(),
            ));
        }
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: slug.to_string(),
            created_at: self.clock.now(),
        };
        let mut tx = self.store.begin().await?;
        teams::insert_org(&mut tx, &org).await?;
        self.store.commit(tx).await?;
        Ok(org)
    }

    /// Creating a team atomically provisions its manager agent.
    pub async fn create_team(
        &self,
        org_id: Uuid,
        name: &str,
        slug: &str,
    ) -> Result<(Team, Agent), ConductorError> {
        if name.trim().is_empty() || slug.trim().is_empty() {
            return Err(ConductorError::Validation(
                "team name and slug must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        if teams::get_org(&mut tx, org_id).await?.is_none() {
            return Err(ConductorError::not_found("organization", org_id));
        }

        let team = Team {
            id: Uuid::new_v4(),
            org_id,
            name: name.to_string(),
            slug: slug.to_string(),
            settings: TeamSettings::default(),
            created_at: now,
        };
        teams::insert_team(&mut tx, &team).await?;

        let manager = Agent {
            id: Uuid::new_v4(),
            team_id: team.id,
            name: "manager".to_string(),
            role: AgentRole::Manager,
            model: DEFAULT_AGENT_MODEL.to_string(),
            adapter: DEFAULT_ADAPTER.to_string(),
            status: AgentStatus::Idle,
            created_at: now,
        };
        teams::insert_agent(&mut tx, &manager).await?;

        conductor_store::events::append(
            &mut tx,
            &team_stream(team.id),
            &EventPayload::TeamCreated {
                name: team.name.clone(),
                slug: team.slug.clone(),
                org_id,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        conductor_store::events::append(
            &mut tx,
            &agent_stream(manager.id),
            &EventPayload::AgentCreated {
                name: manager.name.clone(),
                role: manager.role,
                team_id: team.id,
                auto_created: true,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        tracing::info!(team_id = %team.id, manager_id = %manager.id, "team_created");
        Ok((team, manager))
    }

    pub async fn create_agent(
        &self,
        team_id: Uuid,
        name: &str,
        role: AgentRole,
        model: Option<&str>,
        adapter: Option<&str>,
    ) -> Result<Agent, ConductorError> {
        if name.trim().is_empty() {
            return Err(ConductorError::Validation(
                "agent name must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        if teams::get_team(&mut tx, team_id).await?.is_none() {
            return Err(ConductorError::not_found("team", team_id));
        }
        let agent = Agent {
            id: Uuid::new_v4(),
            team_id,
            name: name.to_string(),
            role,
            model: model.unwrap_or(DEFAULT_AGENT_MODEL).to_string(),
            adapter: adapter.unwrap_or(DEFAULT_ADAPTER).to_string(),
            status: AgentStatus::Idle,
            created_at: now,
        };
        teams::insert_agent(&mut tx, &agent).await?;
        conductor_store::events::append(
            &mut tx,
            &agent_stream(agent.id),
            &EventPayload::AgentCreated {
                name: agent.name.clone(),
                role,
                team_id,
                auto_created: false,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(agent)
    }

    pub async fn register_repo(
        &self,
        team_id: Uuid,
        name: &str,
        local_path: &str,
        default_branch: &str,
    ) -> Result<Repository, ConductorError> {
        if name.trim().is_empty() || local_path.trim().is_empty() {
            return Err(ConductorError::Validation(
                "repository name and path must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        if teams::get_team(&mut tx, team_id).await?.is_none() {
            return Err(ConductorError::not_found("team", team_id));
        }
        let repo = Repository {
            id: Uuid::new_v4(),
            team_id,
            name: name.to_string(),
            local_path: local_path.to_string(),
            default_branch: default_branch.to_string(),
            created_at: now,
        };
        teams::insert_repo(&mut tx, &repo).await?;
        conductor_store::events::append(
            &mut tx,
            &repo_stream(repo.id),
            &EventPayload::RepoRegistered {
                name: repo.name.clone(),
                local_path: repo.local_path.clone(),
                team_id,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(repo)
    }

    /// Replace the settings record, appending `settings.updated` with only
    /// the fields that actually changed. A no-op update appends nothing.
    pub async fn update_settings(
        &self,
        team_id: Uuid,
        settings: TeamSettings,
    ) -> Result<Team, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let Some(team) = teams::get_team(&mut tx, team_id).await? else {
            return Err(ConductorError::not_found("team", team_id));
        };

        let changes = settings_diff(&team.settings, &settings)?;
        if changes.is_empty() {
            return Ok(team);
        }

        teams::update_settings(&mut tx, team_id, &settings).await?;
        conductor_store::events::append(
            &mut tx,
            &team_stream(team_id),
            &EventPayload::SettingsUpdated { changes },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(Team { settings, ..team })
    }

    pub async fn get_team(&self, team_id: Uuid) -> Result<Team, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::get_team(&mut conn, team_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("team", team_id))
    }

    pub async fn list_teams(&self, org_id: Uuid) -> Result<Vec<Team>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::list_teams(&mut conn, org_id).await
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::get_agent(&mut conn, agent_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("agent", agent_id))
    }

    pub async fn list_agents(&self, team_id: Uuid) -> Result<Vec<Agent>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::list_agents(&mut conn, team_id).await
    }

    pub async fn get_repo(&self, repo_id: Uuid) -> Result<Repository, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::get_repo(&mut conn, repo_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("repository", repo_id))
    }

    pub async fn list_repos(&self, team_id: Uuid) -> Result<Vec<Repository>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::list_repos(&mut conn, team_id).await
    }

    pub async fn record_webhook_delivery(
        &self,
        webhook_id: Uuid,
        event: &str,
        payload: serde_json::Value,
        status: &str,
    ) -> Result<i64, ConductorError> {
        let mut tx = self.store.begin().await?;
        let id = teams::insert_webhook_delivery(
            &mut tx,
            webhook_id,
            event,
            &payload,
            status,
            self.clock.now(),
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(id)
    }

    pub async fn list_webhook_deliveries(
        &self,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        teams::list_webhook_deliveries(&mut conn, limit).await
    }
}

/// Field-level diff of two settings records, keyed by field name with the
/// new value.
fn settings_diff(
    old: &TeamSettings,
    new: &TeamSettings,
) -> Result<serde_json::Map<String, serde_json::Value>, ConductorError> {
    let old = serde_json::to_value(old).map_err(storage)?;
    let new = serde_json::to_value(new).map_err(storage)?;
    let (serde_json::Value::Object(old), serde_json::Value::Object(new)) = (old, new) else {
        return Err(ConductorError::Storage("settings must be objects".into()));
    };
    let mut changes = serde_json::Map::new();
    for (key, value) in new {
        if old.get(&key) != Some(&value) {
            changes.insert(key, value);
        }
    }
    Ok(changes)
}
