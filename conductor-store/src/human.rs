//! Human-in-the-loop request rows.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::human::{HumanRequest, HumanRequestId, RequestKind, RequestStatus};
use conductor_core::task::TaskId;
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, storage};

#[derive(Debug, FromRow)]
struct RequestRow {
    id: i64,
    team_id: String,
    agent_id: String,
    task_id: Option<i64>,
    kind: String,
    question: String,
    options: String,
    status: String,
    response: Option<String>,
    responded_by: Option<String>,
    timeout_at: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

const COLUMNS: &str = "id, team_id, agent_id, task_id, kind, question, options, status, \
                       response, responded_by, timeout_at, created_at, resolved_at";

fn parse_row(row: RequestRow) -> Result<HumanRequest, ConductorError> {
    Ok(HumanRequest {
        id: row.id,
        team_id: parse_uuid(&row.team_id)?,
        agent_id: parse_uuid(&row.agent_id)?,
        task_id: row.task_id,
        kind: row
            .kind
            .parse::<RequestKind>()
            .map_err(|_| storage(format!("bad request kind '{}'", row.kind)))?,
        question: row.question,
        options: serde_json::from_str(&row.options).map_err(storage)?,
        status: row
            .status
            .parse::<RequestStatus>()
            .map_err(|_| storage(format!("bad request status '{}'", row.status)))?,
        response: row.response,
        responded_by: parse_opt_uuid(&row.responded_by)?,
        timeout_at: parse_opt_ts(&row.timeout_at)?,
        created_at: parse_ts(&row.created_at)?,
        resolved_at: parse_opt_ts(&row.resolved_at)?,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    agent_id: Uuid,
    task_id: Option<TaskId>,
    kind: RequestKind,
    question: &str,
    options: &[String],
    timeout_at: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> Result<HumanRequestId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO human_requests (team_id, agent_id, task_id, kind, question, options, timeout_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(team_id.to_string())
    .bind(agent_id.to_string())
    .bind(task_id)
    .bind(kind.as_str())
    .bind(question)
    .bind(serde_json::to_string(options).map_err(storage)?)
    .bind(timeout_at.map(|at| at.to_rfc3339()))
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

/// Primary-key read; this is the poll path for subprocess adapters.
pub async fn get(
    conn: &mut SqliteConnection,
    id: HumanRequestId,
) -> Result<Option<HumanRequest>, ConductorError> {
    let row = sqlx::query_as::<_, RequestRow>(&format!(
        "SELECT {COLUMNS} FROM human_requests WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_row).transpose()
}

pub async fn resolve(
    conn: &mut SqliteConnection,
    id: HumanRequestId,
    response: &str,
    responded_by: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE human_requests
        SET status = 'resolved', response = ?, responded_by = ?, resolved_at = ?
        WHERE id = ?
        "#,
    )
    .bind(response)
    .bind(responded_by.map(|id| id.to_string()))
    .bind(at.to_rfc3339())
    .bind(id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn expire(
    conn: &mut SqliteConnection,
    id: HumanRequestId,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE human_requests SET status = 'expired', resolved_at = ? WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

pub async fn list(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    status: Option<RequestStatus>,
    agent_id: Option<Uuid>,
    task_id: Option<TaskId>,
    limit: i64,
) -> Result<Vec<HumanRequest>, ConductorError> {
    let mut sql = format!("SELECT {COLUMNS} FROM human_requests WHERE team_id = ?");
    if status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if agent_id.is_some() {
        sql.push_str(" AND agent_id = ?");
    }
    if task_id.is_some() {
        sql.push_str(" AND task_id = ?");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, RequestRow>(&sql).bind(team_id.to_string());
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    if let Some(agent) = agent_id {
        query = query.bind(agent.to_string());
    }
    if let Some(task) = task_id {
        query = query.bind(task);
    }
    let rows = query.bind(limit).fetch_all(conn).await.map_err(storage)?;
    rows.into_iter().map(parse_row).collect()
}

/// Pending requests whose deadline has passed.
pub async fn pending_past_timeout(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Vec<HumanRequest>, ConductorError> {
    let rows = sqlx::query_as::<_, RequestRow>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM human_requests
        WHERE status = 'pending' AND timeout_at IS NOT NULL AND timeout_at < ?
        ORDER BY id ASC
        "#
    ))
    .bind(now.to_rfc3339())
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::Duration;

    #[tokio::test]
    async fn insert_resolve_round_trip() {
        let store = Store::in_memory().await.expect("store");
        let team_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let mut conn = store.pool().acquire().await.expect("conn");

        let id = insert(
            &mut conn,
            team_id,
            agent_id,
            Some(3),
            RequestKind::Approval,
            "Deploy?",
            &["yes".to_string(), "no".to_string()],
            None,
            Utc::now(),
        )
        .await
        .expect("insert");

        let pending = get(&mut conn, id).await.expect("get").expect("present");
        assert_eq!(pending.status, RequestStatus::Pending);
        assert_eq!(pending.options, vec!["yes", "no"]);
        assert!(pending.response.is_none());

        let responder = Uuid::new_v4();
        resolve(&mut conn, id, "yes", Some(responder), Utc::now())
            .await
            .expect("resolve");
        let resolved = get(&mut conn, id).await.expect("get").expect("present");
        assert_eq!(resolved.status, RequestStatus::Resolved);
        assert_eq!(resolved.response.as_deref(), Some("yes"));
        assert_eq!(resolved.responded_by, Some(responder));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn timeout_scan_only_sees_past_due_pending() {
        let store = Store::in_memory().await.expect("store");
        let team_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let now = Utc::now();
        let mut conn = store.pool().acquire().await.expect("conn");

        let due = insert(
            &mut conn,
            team_id,
            agent_id,
            None,
            RequestKind::Question,
            "due",
            &[],
            Some(now - Duration::minutes(5)),
            now - Duration::minutes(30),
        )
        .await
        .expect("due");
        insert(
            &mut conn,
            team_id,
            agent_id,
            None,
            RequestKind::Question,
            "future",
            &[],
            Some(now + Duration::minutes(5)),
            now,
        )
        .await
        .expect("future");
        insert(
            &mut conn,
            team_id,
            agent_id,
            None,
            RequestKind::Question,
            "no deadline",
            &[],
            None,
            now,
        )
        .await
        .expect("no deadline");

        let past_due = pending_past_timeout(&mut conn, now).await.expect("scan");
        assert_eq!(past_due.len(), 1);
        assert_eq!(past_due[0].id, due);

        expire(&mut conn, due, now).await.expect("expire");
        let after = pending_past_timeout(&mut conn, now).await.expect("scan");
        assert!(after.is_empty());
    }
}
