//! Session rows and spend aggregation. Cost is persisted as integer
//! millionths so SQL sums stay exact.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::session::{Session, SessionId, TokenCounts};
use conductor_core::task::TaskId;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_opt_ts, parse_ts, parse_uuid, storage};

pub(crate) fn to_micros(cost: Decimal) -> Result<i64, ConductorError> {
    (cost * Decimal::from(1_000_000))
        .to_i64()
        .ok_or_else(|| storage(format!("cost out of range: {cost}")))
}

pub(crate) fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, 6)
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: i64,
    agent_id: String,
    task_id: Option<i64>,
    model: String,
    tokens_in: i64,
    tokens_out: i64,
    cache_read: i64,
    cache_write: i64,
    cost_micros: i64,
    started_at: String,
    ended_at: Option<String>,
    error: Option<String>,
}

const COLUMNS: &str = "id, agent_id, task_id, model, tokens_in, tokens_out, cache_read, \
                       cache_write, cost_micros, started_at, ended_at, error";

fn parse_row(row: SessionRow) -> Result<Session, ConductorError> {
    Ok(Session {
        id: row.id,
        agent_id: parse_uuid(&row.agent_id)?,
        task_id: row.task_id,
        model: row.model,
        counts: TokenCounts {
            tokens_in: row.tokens_in,
            tokens_out: row.tokens_out,
            cache_read: row.cache_read,
            cache_write: row.cache_write,
        },
        cost: from_micros(row.cost_micros),
        started_at: parse_ts(&row.started_at)?,
        ended_at: parse_opt_ts(&row.ended_at)?,
        error: row.error,
    })
}

pub async fn insert(
    conn: &mut SqliteConnection,
    agent_id: Uuid,
    task_id: Option<TaskId>,
    model: &str,
    at: DateTime<Utc>,
) -> Result<SessionId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO sessions (agent_id, task_id, model, started_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(agent_id.to_string())
    .bind(task_id)
    .bind(model)
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn get(
    conn: &mut SqliteConnection,
    id: SessionId,
) -> Result<Option<Session>, ConductorError> {
    let row =
        sqlx::query_as::<_, SessionRow>(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(storage)?;
    row.map(parse_row).transpose()
}

/// The at-most-one open session for an agent.
pub async fn open_session(
    conn: &mut SqliteConnection,
    agent_id: Uuid,
) -> Result<Option<SessionId>, ConductorError> {
    sqlx::query_scalar("SELECT id FROM sessions WHERE agent_id = ? AND ended_at IS NULL LIMIT 1")
        .bind(agent_id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(storage)
}

pub async fn update_usage(
    conn: &mut SqliteConnection,
    id: SessionId,
    counts: &TokenCounts,
    cost: Decimal,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE sessions
        SET tokens_in = ?, tokens_out = ?, cache_read = ?, cache_write = ?, cost_micros = ?
        WHERE id = ?
        "#,
    )
    .bind(counts.tokens_in)
    .bind(counts.tokens_out)
    .bind(counts.cache_read)
    .bind(counts.cache_write)
    .bind(to_micros(cost)?)
    .bind(id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn end(
    conn: &mut SqliteConnection,
    id: SessionId,
    at: DateTime<Utc>,
    error: Option<&str>,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE sessions SET ended_at = ?, error = ? WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(error)
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

pub async fn list(
    conn: &mut SqliteConnection,
    agent_id: Option<Uuid>,
    task_id: Option<TaskId>,
    limit: i64,
) -> Result<Vec<Session>, ConductorError> {
    let mut sql = format!("SELECT {COLUMNS} FROM sessions WHERE 1 = 1");
    if agent_id.is_some() {
        sql.push_str(" AND agent_id = ?");
    }
    if task_id.is_some() {
        sql.push_str(" AND task_id = ?");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, SessionRow>(&sql);
    if let Some(agent) = agent_id {
        query = query.bind(agent.to_string());
    }
    if let Some(task) = task_id {
        query = query.bind(task);
    }
    let rows = query.bind(limit).fetch_all(conn).await.map_err(storage)?;
    rows.into_iter().map(parse_row).collect()
}

/// Team spend across all its agents since `since` (rolling window).
pub async fn team_spend_since(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Decimal, ConductorError> {
    let micros: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(s.cost_micros), 0)
        FROM sessions s
        JOIN agents a ON a.id = s.agent_id
        WHERE a.team_id = ? AND s.started_at >= ?
        "#,
    )
    .bind(team_id.to_string())
    .bind(since.to_rfc3339())
    .fetch_one(conn)
    .await
    .map_err(storage)?;
    Ok(from_micros(micros))
}

pub async fn task_spend(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Decimal, ConductorError> {
    let micros: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(cost_micros), 0) FROM sessions WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(conn)
            .await
            .map_err(storage)?;
    Ok(from_micros(micros))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpend {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub cost: Decimal,
    pub sessions: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpend {
    pub model: String,
    pub cost: Decimal,
    pub sessions: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostSummary {
    pub total_cost: Decimal,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub session_count: i64,
    pub per_agent: Vec<AgentSpend>,
    pub per_model: Vec<ModelSpend>,
}

pub async fn cost_summary(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    since: DateTime<Utc>,
) -> Result<CostSummary, ConductorError> {
    let team = team_id.to_string();
    let since = since.to_rfc3339();

    let (total_micros, tokens_in, tokens_out, session_count): (i64, i64, i64, i64) =
        sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(s.cost_micros), 0), COALESCE(SUM(s.tokens_in), 0),
                   COALESCE(SUM(s.tokens_out), 0), COUNT(s.id)
            FROM sessions s
            JOIN agents a ON a.id = s.agent_id
            WHERE a.team_id = ? AND s.started_at >= ?
            "#,
        )
        .bind(&team)
        .bind(&since)
        .fetch_one(&mut *conn)
        .await
        .map_err(storage)?;

    let agent_rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT a.id, a.name, COALESCE(SUM(s.cost_micros), 0), COUNT(s.id)
        FROM sessions s
        JOIN agents a ON a.id = s.agent_id
        WHERE a.team_id = ? AND s.started_at >= ?
        GROUP BY a.id, a.name
        ORDER BY a.name
        "#,
    )
    .bind(&team)
    .bind(&since)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage)?;

    let model_rows: Vec<(String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT s.model, COALESCE(SUM(s.cost_micros), 0), COUNT(s.id)
        FROM sessions s
        JOIN agents a ON a.id = s.agent_id
        WHERE a.team_id = ? AND s.started_at >= ?
        GROUP BY s.model
        ORDER BY s.model
        "#,
    )
    .bind(&team)
    .bind(&since)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage)?;

    Ok(CostSummary {
        total_cost: from_micros(total_micros),
        tokens_in,
        tokens_out,
        session_count,
        per_agent: agent_rows
            .into_iter()
            .map(|(id, name, micros, sessions)| {
                Ok(AgentSpend {
                    agent_id: parse_uuid(&id)?,
                    agent_name: name,
                    cost: from_micros(micros),
                    sessions,
                })
            })
            .collect::<Result<_, ConductorError>>()?,
        per_model: model_rows
            .into_iter()
            .map(|(model, micros, sessions)| ModelSpend {
                model,
                cost: from_micros(micros),
                sessions,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use crate::teams;
    use chrono::Duration;
    use conductor_core::team::{Agent, AgentRole, AgentStatus, Organization, Team, TeamSettings};

    async fn seed_agent(store: &Store) -> (Uuid, Uuid) {
        let org = Organization {
            id: Uuid::new_v4(),
            name: "Org".into(),
            slug: "org".into(),
            created_at: Utc::now(),
        };
        let team = Team {
            id: Uuid::new_v4(),
            org_id: org.id,
            name: "Core".into(),
            slug: "core".into(),
            settings: TeamSettings::default(),
            created_at: Utc::now(),
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            team_id: team.id,
            name: "e1".into(),
            role: AgentRole::Engineer,
            model: "claude-sonnet-4".into(),
            adapter: "claude_code".into(),
            status: AgentStatus::Idle,
            created_at: Utc::now(),
        };
        let mut tx = store.begin().await.expect("begin");
        teams::insert_org(&mut tx, &org).await.expect("org");
        teams::insert_team(&mut tx, &team).await.expect("team");
        teams::insert_agent(&mut tx, &agent).await.expect("agent");
        store.commit(tx).await.expect("commit");
        (team.id, agent.id)
    }

    #[tokio::test]
    async fn micros_round_trip() {
        let cost = Decimal::new(999_999, 6);
        assert_eq!(from_micros(to_micros(cost).expect("micros")), cost);
    }

    #[tokio::test]
    async fn open_session_is_found_until_ended() {
        let store = Store::in_memory().await.expect("store");
        let (_, agent_id) = seed_agent(&store).await;

        let mut conn = store.pool().acquire().await.expect("conn");
        let id = insert(&mut conn, agent_id, None, "claude-sonnet-4", Utc::now())
            .await
            .expect("insert");
        assert_eq!(
            open_session(&mut conn, agent_id).await.expect("open"),
            Some(id)
        );
        end(&mut conn, id, Utc::now(), None).await.expect("end");
        assert_eq!(open_session(&mut conn, agent_id).await.expect("open"), None);
    }

    #[tokio::test]
    async fn team_spend_respects_the_window() {
        let store = Store::in_memory().await.expect("store");
        let (team_id, agent_id) = seed_agent(&store).await;
        let now = Utc::now();

        let mut conn = store.pool().acquire().await.expect("conn");
        let old = insert(&mut conn, agent_id, None, "m", now - Duration::hours(30))
            .await
            .expect("old");
        update_usage(&mut conn, old, &TokenCounts::default(), Decimal::new(5, 0))
            .await
            .expect("old usage");
        let fresh = insert(&mut conn, agent_id, Some(1), "m", now - Duration::hours(1))
            .await
            .expect("fresh");
        update_usage(
            &mut conn,
            fresh,
            &TokenCounts::default(),
            Decimal::new(250_000, 6),
        )
        .await
        .expect("fresh usage");

        let spend = team_spend_since(&mut conn, team_id, now - Duration::hours(24))
            .await
            .expect("spend");
        assert_eq!(spend, Decimal::new(250_000, 6));
        assert_eq!(
            task_spend(&mut conn, 1).await.expect("task spend"),
            Decimal::new(250_000, 6)
        );
    }

    #[tokio::test]
    async fn cost_summary_groups_by_agent_and_model() {
        let store = Store::in_memory().await.expect("store");
        let (team_id, agent_id) = seed_agent(&store).await;
        let now = Utc::now();

        let mut conn = store.pool().acquire().await.expect("conn");
        for model in ["a-model", "b-model"] {
            let id = insert(&mut conn, agent_id, None, model, now)
                .await
                .expect("insert");
            update_usage(
                &mut conn,
                id,
                &TokenCounts {
                    tokens_in: 10,
                    tokens_out: 5,
                    cache_read: 0,
                    cache_write: 0,
                },
                Decimal::new(1_000_000, 6),
            )
            .await
            .expect("usage");
        }

        let summary = cost_summary(&mut conn, team_id, now - Duration::hours(1))
            .await
            .expect("summary");
        assert_eq!(summary.session_count, 2);
        assert_eq!(summary.total_cost, Decimal::new(2_000_000, 6));
        assert_eq!(summary.tokens_in, 20);
        assert_eq!(summary.per_agent.len(), 1);
        assert_eq!(summary.per_agent[0].sessions, 2);
        assert_eq!(summary.per_model.len(), 2);
    }
}
