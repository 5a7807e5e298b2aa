//! The append-only event log. `append` is the only write; rows are never
//! updated or deleted, and ids reflect insertion order.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::event::{Event, EventId, EventMetadata, EventPayload};
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;

use crate::{parse_ts, storage};

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    stream_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    data: String,
    metadata: String,
    created_at: String,
}

fn parse_row(row: EventRow) -> Result<Event, ConductorError> {
    Ok(Event {
        id: row.id,
        stream_id: row.stream_id,
        event_type: row.event_type,
        data: serde_json::from_str(&row.data).map_err(storage)?,
        metadata: serde_json::from_str::<EventMetadata>(&row.metadata).map_err(storage)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub async fn append(
    conn: &mut SqliteConnection,
    stream_id: &str,
    payload: &EventPayload,
    metadata: &EventMetadata,
    at: DateTime<Utc>,
) -> Result<EventId, ConductorError> {
    let data = serde_json::to_string(&payload.data()).map_err(storage)?;
    let metadata = serde_json::to_string(metadata).map_err(storage)?;
    let result = sqlx::query(
        r#"
        INSERT INTO events (stream_id, type, data, metadata, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(stream_id)
    .bind(payload.event_type())
    .bind(data)
    .bind(metadata)
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

/// Events for one stream in id order, strictly after `since_id`.
pub async fn read_stream(
    conn: &mut SqliteConnection,
    stream_id: &str,
    since_id: EventId,
    limit: i64,
) -> Result<Vec<Event>, ConductorError> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, stream_id, type, data, metadata, created_at
        FROM events
        WHERE stream_id = ? AND id > ?
        ORDER BY id ASC
        LIMIT ?
        "#,
    )
    .bind(stream_id)
    .bind(since_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(storage)?;

    rows.into_iter().map(parse_row).collect()
}

/// Type-filtered scan across all streams, id order.
pub async fn read_by_type(
    conn: &mut SqliteConnection,
    event_type: &str,
    since_id: EventId,
    limit: i64,
) -> Result<Vec<Event>, ConductorError> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT id, stream_id, type, data, metadata, created_at
        FROM events
        WHERE type = ? AND id > ?
        ORDER BY id ASC
        LIMIT ?
        "#,
    )
    .bind(event_type)
    .bind(since_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(storage)?;

    rows.into_iter().map(parse_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use conductor_core::event::task_stream;
    use conductor_core::task::{TaskPriority, TaskStatus};
    use uuid::Uuid;

    fn created_payload() -> EventPayload {
        EventPayload::TaskCreated {
            title: "Fix login".to_string(),
            priority: TaskPriority::Medium,
            team_id: Uuid::new_v4(),
            assignee_id: None,
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let store = Store::in_memory().await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        let first = append(
            &mut tx,
            &task_stream(1),
            &created_payload(),
            &EventMetadata::default(),
            Utc::now(),
        )
        .await
        .expect("first");
        let second = append(
            &mut tx,
            &task_stream(2),
            &created_payload(),
            &EventMetadata::default(),
            Utc::now(),
        )
        .await
        .expect("second");
        store.commit(tx).await.expect("commit");
        assert!(second > first);
    }

    #[tokio::test]
    async fn stream_read_returns_payload_byte_for_byte() {
        let store = Store::in_memory().await.expect("store");
        let payload = EventPayload::TaskStatusChanged {
            from: TaskStatus::Todo,
            to: TaskStatus::InProgress,
            actor_id: Some(Uuid::new_v4()),
        };
        let mut tx = store.begin().await.expect("begin");
        append(
            &mut tx,
            &task_stream(7),
            &payload,
            &EventMetadata::default(),
            Utc::now(),
        )
        .await
        .expect("append");
        store.commit(tx).await.expect("commit");

        let mut conn = store.pool().acquire().await.expect("conn");
        let events = read_stream(&mut conn, &task_stream(7), 0, 10)
            .await
            .expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "task.status_changed");
        assert_eq!(events[0].data, payload.data());
    }

    #[tokio::test]
    async fn since_id_slices_the_stream() {
        let store = Store::in_memory().await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        let mut last = 0;
        for _ in 0..3 {
            last = append(
                &mut tx,
                &task_stream(1),
                &created_payload(),
                &EventMetadata::default(),
                Utc::now(),
            )
            .await
            .expect("append");
        }
        store.commit(tx).await.expect("commit");

        let mut conn = store.pool().acquire().await.expect("conn");
        let tail = read_stream(&mut conn, &task_stream(1), last - 1, 10)
            .await
            .expect("read");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, last);
    }

    #[tokio::test]
    async fn type_scan_filters_other_kinds() {
        let store = Store::in_memory().await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        append(
            &mut tx,
            &task_stream(1),
            &created_payload(),
            &EventMetadata::default(),
            Utc::now(),
        )
        .await
        .expect("append created");
        append(
            &mut tx,
            &task_stream(1),
            &EventPayload::TaskAssigned {
                from: None,
                to: Some(Uuid::new_v4()),
            },
            &EventMetadata::default(),
            Utc::now(),
        )
        .await
        .expect("append assigned");
        store.commit(tx).await.expect("commit");

        let mut conn = store.pool().acquire().await.expect("conn");
        let assigned = read_by_type(&mut conn, "task.assigned", 0, 10)
            .await
            .expect("read");
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].event_type, "task.assigned");
    }
}
