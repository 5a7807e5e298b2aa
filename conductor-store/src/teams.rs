//! Tenant hierarchy: organizations, teams, agents, repositories, plus the
//! webhook-delivery audit records.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::team::{
    Agent, AgentRole, AgentStatus, Organization, Repository, Team, TeamSettings, WebhookDelivery,
};
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_ts, parse_uuid, storage};

pub async fn insert_org(
    conn: &mut SqliteConnection,
    org: &Organization,
) -> Result<(), ConductorError> {
    sqlx::query("INSERT INTO organizations (id, name, slug, created_at) VALUES (?, ?, ?, ?)")
        .bind(org.id.to_string())
        .bind(&org.name)
        .bind(&org.slug)
        .bind(org.created_at.to_rfc3339())
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct OrgRow {
    id: String,
    name: String,
    slug: String,
    created_at: String,
}

pub async fn get_org(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Organization>, ConductorError> {
    let row = sqlx::query_as::<_, OrgRow>(
        "SELECT id, name, slug, created_at FROM organizations WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(|row| {
        Ok(Organization {
            id: parse_uuid(&row.id)?,
            name: row.name,
            slug: row.slug,
            created_at: parse_ts(&row.created_at)?,
        })
    })
    .transpose()
}

#[derive(Debug, FromRow)]
struct TeamRow {
    id: String,
    org_id: String,
    name: String,
    slug: String,
    settings: String,
    created_at: String,
}

fn parse_team(row: TeamRow) -> Result<Team, ConductorError> {
    Ok(Team {
        id: parse_uuid(&row.id)?,
        org_id: parse_uuid(&row.org_id)?,
        name: row.name,
        slug: row.slug,
        settings: serde_json::from_str::<TeamSettings>(&row.settings).map_err(storage)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub async fn insert_team(conn: &mut SqliteConnection, team: &Team) -> Result<(), ConductorError> {
    sqlx::query(
        "INSERT INTO teams (id, org_id, name, slug, settings, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(team.id.to_string())
    .bind(team.org_id.to_string())
    .bind(&team.name)
    .bind(&team.slug)
    .bind(serde_json::to_string(&team.settings).map_err(storage)?)
    .bind(team.created_at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn get_team(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Team>, ConductorError> {
    let row = sqlx::query_as::<_, TeamRow>(
        "SELECT id, org_id, name, slug, settings, created_at FROM teams WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_team).transpose()
}

pub async fn list_teams(
    conn: &mut SqliteConnection,
    org_id: Uuid,
) -> Result<Vec<Team>, ConductorError> {
    let rows = sqlx::query_as::<_, TeamRow>(
        "SELECT id, org_id, name, slug, settings, created_at FROM teams WHERE org_id = ? ORDER BY name",
    )
    .bind(org_id.to_string())
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_team).collect()
}

pub async fn update_settings(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    settings: &TeamSettings,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE teams SET settings = ? WHERE id = ?")
        .bind(serde_json::to_string(settings).map_err(storage)?)
        .bind(team_id.to_string())
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct AgentRow {
    id: String,
    team_id: String,
    name: String,
    role: String,
    model: String,
    adapter: String,
    status: String,
    created_at: String,
}

const AGENT_COLUMNS: &str = "id, team_id, name, role, model, adapter, status, created_at";

fn parse_agent(row: AgentRow) -> Result<Agent, ConductorError> {
    Ok(Agent {
        id: parse_uuid(&row.id)?,
        team_id: parse_uuid(&row.team_id)?,
        name: row.name,
        role: row
            .role
            .parse::<AgentRole>()
            .map_err(|_| storage(format!("bad agent role '{}'", row.role)))?,
        model: row.model,
        adapter: row.adapter,
        status: row
            .status
            .parse::<AgentStatus>()
            .map_err(|_| storage(format!("bad agent status '{}'", row.status)))?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub async fn insert_agent(
    conn: &mut SqliteConnection,
    agent: &Agent,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        INSERT INTO agents (id, team_id, name, role, model, adapter, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(agent.id.to_string())
    .bind(agent.team_id.to_string())
    .bind(&agent.name)
    .bind(agent.role.as_str())
    .bind(&agent.model)
    .bind(&agent.adapter)
    .bind(agent.status.as_str())
    .bind(agent.created_at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn get_agent(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Agent>, ConductorError> {
    let row =
        sqlx::query_as::<_, AgentRow>(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(conn)
            .await
            .map_err(storage)?;
    row.map(parse_agent).transpose()
}

pub async fn list_agents(
    conn: &mut SqliteConnection,
    team_id: Uuid,
) -> Result<Vec<Agent>, ConductorError> {
    let rows = sqlx::query_as::<_, AgentRow>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE team_id = ? ORDER BY name"
    ))
    .bind(team_id.to_string())
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_agent).collect()
}

/// First idle reviewer agent of the team, if any.
pub async fn idle_reviewer(
    conn: &mut SqliteConnection,
    team_id: Uuid,
) -> Result<Option<Agent>, ConductorError> {
    let row = sqlx::query_as::<_, AgentRow>(&format!(
        r#"
        SELECT {AGENT_COLUMNS}
        FROM agents
        WHERE team_id = ? AND role = 'reviewer' AND status = 'idle'
        ORDER BY name
        LIMIT 1
        "#
    ))
    .bind(team_id.to_string())
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_agent).transpose()
}

pub async fn set_agent_status(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: AgentStatus,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id.to_string())
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct RepoRow {
    id: String,
    team_id: String,
    name: String,
    local_path: String,
    default_branch: String,
    created_at: String,
}

fn parse_repo(row: RepoRow) -> Result<Repository, ConductorError> {
    Ok(Repository {
        id: parse_uuid(&row.id)?,
        team_id: parse_uuid(&row.team_id)?,
        name: row.name,
        local_path: row.local_path,
        default_branch: row.default_branch,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub async fn insert_repo(
    conn: &mut SqliteConnection,
    repo: &Repository,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        INSERT INTO repositories (id, team_id, name, local_path, default_branch, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(repo.id.to_string())
    .bind(repo.team_id.to_string())
    .bind(&repo.name)
    .bind(&repo.local_path)
    .bind(&repo.default_branch)
    .bind(repo.created_at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn get_repo(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<Repository>, ConductorError> {
    let row = sqlx::query_as::<_, RepoRow>(
        "SELECT id, team_id, name, local_path, default_branch, created_at FROM repositories WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_repo).transpose()
}

pub async fn list_repos(
    conn: &mut SqliteConnection,
    team_id: Uuid,
) -> Result<Vec<Repository>, ConductorError> {
    let rows = sqlx::query_as::<_, RepoRow>(
        "SELECT id, team_id, name, local_path, default_branch, created_at FROM repositories WHERE team_id = ? ORDER BY name",
    )
    .bind(team_id.to_string())
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_repo).collect()
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: i64,
    webhook_id: String,
    event: String,
    payload: String,
    status: String,
    received_at: String,
}

pub async fn insert_webhook_delivery(
    conn: &mut SqliteConnection,
    webhook_id: Uuid,
    event: &str,
    payload: &serde_json::Value,
    status: &str,
    at: DateTime<Utc>,
) -> Result<i64, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_deliveries (webhook_id, event, payload, status, received_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(webhook_id.to_string())
    .bind(event)
    .bind(serde_json::to_string(payload).map_err(storage)?)
    .bind(status)
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn list_webhook_deliveries(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<WebhookDelivery>, ConductorError> {
    let rows = sqlx::query_as::<_, DeliveryRow>(
        r#"
        SELECT id, webhook_id, event, payload, status, received_at
        FROM webhook_deliveries
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter()
        .map(|row| {
            Ok(WebhookDelivery {
                id: row.id,
                webhook_id: parse_uuid(&row.webhook_id)?,
                event: row.event,
                payload: serde_json::from_str(&row.payload).map_err(storage)?,
                status: row.status,
                received_at: parse_ts(&row.received_at)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn org() -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            slug: "acme".into(),
            created_at: Utc::now(),
        }
    }

    fn team(org_id: Uuid) -> Team {
        Team {
            id: Uuid::new_v4(),
            org_id,
            name: "Core".into(),
            slug: "core".into(),
            settings: TeamSettings::default(),
            created_at: Utc::now(),
        }
    }

    fn agent(team_id: Uuid, name: &str, role: AgentRole, status: AgentStatus) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            team_id,
            name: name.into(),
            role,
            model: "claude-sonnet-4".into(),
            adapter: "claude_code".into(),
            status,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn settings_update_round_trips() {
        let store = Store::in_memory().await.expect("store");
        let org = org();
        let team = team(org.id);
        let mut conn = store.pool().acquire().await.expect("conn");
        insert_org(&mut conn, &org).await.expect("org");
        insert_team(&mut conn, &team).await.expect("team");

        let settings = TeamSettings {
            auto_merge: true,
            branch_prefix: Some("agents/".into()),
            ..TeamSettings::default()
        };
        update_settings(&mut conn, team.id, &settings)
            .await
            .expect("update");
        let loaded = get_team(&mut conn, team.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.settings, settings);
    }

    #[tokio::test]
    async fn idle_reviewer_skips_busy_and_non_reviewers() {
        let store = Store::in_memory().await.expect("store");
        let org = org();
        let team = team(org.id);
        let mut conn = store.pool().acquire().await.expect("conn");
        insert_org(&mut conn, &org).await.expect("org");
        insert_team(&mut conn, &team).await.expect("team");

        insert_agent(
            &mut conn,
            &agent(team.id, "eng", AgentRole::Engineer, AgentStatus::Idle),
        )
        .await
        .expect("eng");
        insert_agent(
            &mut conn,
            &agent(team.id, "busy", AgentRole::Reviewer, AgentStatus::Working),
        )
        .await
        .expect("busy");
        assert!(
            idle_reviewer(&mut conn, team.id)
                .await
                .expect("query")
                .is_none()
        );

        let free = agent(team.id, "free", AgentRole::Reviewer, AgentStatus::Idle);
        insert_agent(&mut conn, &free).await.expect("free");
        let found = idle_reviewer(&mut conn, team.id)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(found.id, free.id);
    }

    #[tokio::test]
    async fn webhook_deliveries_list_newest_first() {
        let store = Store::in_memory().await.expect("store");
        let hook = Uuid::new_v4();
        let mut conn = store.pool().acquire().await.expect("conn");
        insert_webhook_delivery(
            &mut conn,
            hook,
            "push",
            &serde_json::json!({"ref": "main"}),
            "accepted",
            Utc::now(),
        )
        .await
        .expect("first");
        let second = insert_webhook_delivery(
            &mut conn,
            hook,
            "issue",
            &serde_json::json!({"action": "opened"}),
            "accepted",
            Utc::now(),
        )
        .await
        .expect("second");

        let deliveries = list_webhook_deliveries(&mut conn, 10).await.expect("list");
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].id, second);
        assert_eq!(deliveries[0].event, "issue");
    }
}
