//! Durable recipient-keyed message queues.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::message::{ActorKind, ActorRef, Message, MessageId};
use conductor_core::task::TaskId;
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_opt_ts, parse_ts, parse_uuid, storage};

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    team_id: String,
    sender_id: String,
    sender_kind: String,
    recipient_id: String,
    recipient_kind: String,
    task_id: Option<i64>,
    content: String,
    delivered_at: String,
    seen_at: Option<String>,
    processed_at: Option<String>,
}

const COLUMNS: &str = "id, team_id, sender_id, sender_kind, recipient_id, recipient_kind, \
                       task_id, content, delivered_at, seen_at, processed_at";

fn parse_actor(id: &str, kind: &str) -> Result<ActorRef, ConductorError> {
    Ok(ActorRef {
        id: parse_uuid(id)?,
        kind: kind
            .parse::<ActorKind>()
            .map_err(|_| storage(format!("bad actor kind '{kind}'")))?,
    })
}

fn parse_row(row: MessageRow) -> Result<Message, ConductorError> {
    Ok(Message {
        id: row.id,
        team_id: parse_uuid(&row.team_id)?,
        sender: parse_actor(&row.sender_id, &row.sender_kind)?,
        recipient: parse_actor(&row.recipient_id, &row.recipient_kind)?,
        task_id: row.task_id,
        content: row.content,
        delivered_at: parse_ts(&row.delivered_at)?,
        seen_at: parse_opt_ts(&row.seen_at)?,
        processed_at: parse_opt_ts(&row.processed_at)?,
    })
}

pub async fn insert(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    sender: ActorRef,
    recipient: ActorRef,
    task_id: Option<TaskId>,
    content: &str,
    at: DateTime<Utc>,
) -> Result<MessageId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (
            team_id, sender_id, sender_kind, recipient_id, recipient_kind,
            task_id, content, delivered_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(team_id.to_string())
    .bind(sender.id.to_string())
    .bind(sender.kind.as_str())
    .bind(recipient.id.to_string())
    .bind(recipient.kind.as_str())
    .bind(task_id)
    .bind(content)
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn get(
    conn: &mut SqliteConnection,
    id: MessageId,
) -> Result<Option<Message>, ConductorError> {
    let row =
        sqlx::query_as::<_, MessageRow>(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(storage)?;
    row.map(parse_row).transpose()
}

/// Per-recipient FIFO: id order equals send order.
pub async fn inbox(
    conn: &mut SqliteConnection,
    recipient_id: Uuid,
    unprocessed_only: bool,
    limit: i64,
) -> Result<Vec<Message>, ConductorError> {
    let mut sql = format!("SELECT {COLUMNS} FROM messages WHERE recipient_id = ?");
    if unprocessed_only {
        sql.push_str(" AND processed_at IS NULL");
    }
    sql.push_str(" ORDER BY id ASC LIMIT ?");

    let rows = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(recipient_id.to_string())
        .bind(limit)
        .fetch_all(conn)
        .await
        .map_err(storage)?;
    rows.into_iter().map(parse_row).collect()
}

/// First write wins; marking twice keeps the original timestamp.
pub async fn mark_seen(
    conn: &mut SqliteConnection,
    id: MessageId,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE messages SET seen_at = COALESCE(seen_at, ?) WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

pub async fn mark_processed(
    conn: &mut SqliteConnection,
    id: MessageId,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE messages
        SET seen_at = COALESCE(seen_at, ?), processed_at = COALESCE(processed_at, ?)
        WHERE id = ?
        "#,
    )
    .bind(at.to_rfc3339())
    .bind(at.to_rfc3339())
    .bind(id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

/// Agents with at least one unprocessed message, for the fallback poll.
pub async fn agents_with_unprocessed(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<Uuid>, ConductorError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT recipient_id
        FROM messages
        WHERE processed_at IS NULL AND recipient_kind = 'agent'
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.iter().map(|(id,)| parse_uuid(id)).collect()
}
