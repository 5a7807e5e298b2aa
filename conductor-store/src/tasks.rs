//! Task rows. Only the task engine writes here; everyone else reads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::task::{Task, TaskId, TaskPriority, TaskStatus};
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, storage};

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    team_id: String,
    title: String,
    description: String,
    status: String,
    priority: String,
    dri_id: Option<String>,
    assignee_id: Option<String>,
    depends_on: String,
    repo_ids: String,
    tags: String,
    branch: String,
    metadata: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

const COLUMNS: &str = "id, team_id, title, description, status, priority, dri_id, assignee_id, \
                       depends_on, repo_ids, tags, branch, metadata, created_at, updated_at, \
                       completed_at";

fn parse_row(row: TaskRow) -> Result<Task, ConductorError> {
    let status = row
        .status
        .parse::<TaskStatus>()
        .map_err(|_| storage(format!("bad task status '{}'", row.status)))?;
    let priority = row
        .priority
        .parse::<TaskPriority>()
        .map_err(|_| storage(format!("bad task priority '{}'", row.priority)))?;
    let repo_ids: Vec<String> = serde_json::from_str(&row.repo_ids).map_err(storage)?;
    Ok(Task {
        id: row.id,
        team_id: parse_uuid(&row.team_id)?,
        title: row.title,
        description: row.description,
        status,
        priority,
        dri_id: parse_opt_uuid(&row.dri_id)?,
        assignee_id: parse_opt_uuid(&row.assignee_id)?,
        depends_on: serde_json::from_str(&row.depends_on).map_err(storage)?,
        repo_ids: repo_ids
            .iter()
            .map(|id| parse_uuid(id))
            .collect::<Result<_, _>>()?,
        tags: serde_json::from_str(&row.tags).map_err(storage)?,
        branch: row.branch,
        metadata: serde_json::from_str(&row.metadata).map_err(storage)?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
        completed_at: parse_opt_ts(&row.completed_at)?,
    })
}

/// Fields the engine supplies at creation; id and branch come later in the
/// same transaction.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub team_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub dri_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub depends_on: Vec<TaskId>,
    pub repo_ids: Vec<Uuid>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    new: &NewTask,
    at: DateTime<Utc>,
) -> Result<TaskId, ConductorError> {
    let repo_ids: Vec<String> = new.repo_ids.iter().map(Uuid::to_string).collect();
    let result = sqlx::query(
        r#"
        INSERT INTO tasks (
            team_id, title, description, status, priority, dri_id, assignee_id,
            depends_on, repo_ids, tags, branch, metadata, created_at, updated_at
        )
        VALUES (?, ?, ?, 'todo', ?, ?, ?, ?, ?, ?, '', ?, ?, ?)
        "#,
    )
    .bind(new.team_id.to_string())
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.priority.as_str())
    .bind(new.dri_id.map(|id| id.to_string()))
    .bind(new.assignee_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&new.depends_on).map_err(storage)?)
    .bind(serde_json::to_string(&repo_ids).map_err(storage)?)
    .bind(serde_json::to_string(&new.tags).map_err(storage)?)
    .bind(serde_json::to_string(&new.metadata).map_err(storage)?)
    .bind(at.to_rfc3339())
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn set_branch(
    conn: &mut SqliteConnection,
    id: TaskId,
    branch: &str,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE tasks SET branch = ? WHERE id = ?")
        .bind(branch)
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

/// Rewrite `depends_on` after batch-index resolution.
pub async fn set_depends_on(
    conn: &mut SqliteConnection,
    id: TaskId,
    depends_on: &[TaskId],
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE tasks SET depends_on = ? WHERE id = ?")
        .bind(serde_json::to_string(depends_on).map_err(storage)?)
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    id: TaskId,
) -> Result<Option<Task>, ConductorError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(storage)?;
    row.map(parse_row).transpose()
}

/// Full-row update for mutable fields; the engine re-reads, mutates, writes.
pub async fn update(conn: &mut SqliteConnection, task: &Task) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET title = ?, description = ?, status = ?, priority = ?, dri_id = ?,
            assignee_id = ?, tags = ?, metadata = ?, updated_at = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.status.as_str())
    .bind(task.priority.as_str())
    .bind(task.dri_id.map(|id| id.to_string()))
    .bind(task.assignee_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&task.tags).map_err(storage)?)
    .bind(serde_json::to_string(&task.metadata).map_err(storage)?)
    .bind(task.updated_at.to_rfc3339())
    .bind(task.completed_at.map(|at| at.to_rfc3339()))
    .bind(task.id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn list(
    conn: &mut SqliteConnection,
    team_id: Uuid,
    status: Option<TaskStatus>,
    assignee_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<Task>, ConductorError> {
    let mut sql = format!("SELECT {COLUMNS} FROM tasks WHERE team_id = ?");
    if status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if assignee_id.is_some() {
        sql.push_str(" AND assignee_id = ?");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(team_id.to_string());
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    if let Some(assignee) = assignee_id {
        query = query.bind(assignee.to_string());
    }
    let rows = query
        .bind(limit)
        .fetch_all(conn)
        .await
        .map_err(storage)?;
    rows.into_iter().map(parse_row).collect()
}

/// Status of each requested id; ids absent from the map do not exist.
pub async fn statuses_of(
    conn: &mut SqliteConnection,
    ids: &[TaskId],
) -> Result<HashMap<TaskId, TaskStatus>, ConductorError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT id, status FROM tasks WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(conn).await.map_err(storage)?;
    rows.into_iter()
        .map(|(id, status)| {
            status
                .parse::<TaskStatus>()
                .map(|status| (id, status))
                .map_err(|_| storage(format!("bad task status '{status}'")))
        })
        .collect()
}
