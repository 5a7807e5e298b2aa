//! SQLite persistence for Conductor.
//!
//! The [`Store`] wraps a connection pool; each entity module exposes async
//! functions that take a `&mut SqliteConnection` so a service can compose a
//! business mutation and its event append inside one transaction. Nothing in
//! this crate commits on its own — the caller owns the transaction and
//! publishes notifications only after `commit()` returns.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

pub mod events;
pub mod human;
pub mod messages;
pub mod notify;
pub mod reviews;
pub mod sessions;
pub mod tasks;
pub mod teams;

pub use notify::NotifyHub;

/// Map any driver or serialization fault into the `Storage` taxon.
pub fn storage(err: impl std::fmt::Display) -> ConductorError {
    ConductorError::Storage(err.to_string())
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, ConductorError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| storage(format!("bad timestamp '{value}': {err}")))
}

pub(crate) fn parse_opt_ts(value: &Option<String>) -> Result<Option<DateTime<Utc>>, ConductorError> {
    value.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(value: &str) -> Result<uuid::Uuid, ConductorError> {
    value
        .parse()
        .map_err(|err| storage(format!("bad uuid '{value}': {err}")))
}

pub(crate) fn parse_opt_uuid(value: &Option<String>) -> Result<Option<uuid::Uuid>, ConductorError> {
    value.as_deref().map(parse_uuid).transpose()
}

#[derive(Clone)]
pub struct Store {
    pool: Arc<SqlitePool>,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, ConductorError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(storage)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(storage)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Fresh in-memory database, one connection so every handle sees the
    /// same data.
    pub async fn in_memory() -> Result<Self, ConductorError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, ConductorError> {
        self.pool.begin().await.map_err(storage)
    }

    pub async fn commit(&self, tx: Transaction<'_, Sqlite>) -> Result<(), ConductorError> {
        tx.commit().await.map_err(storage)
    }

    async fn migrate(&self) -> Result<(), ConductorError> {
        sqlx::raw_sql(SCHEMA)
            .execute(self.pool.as_ref())
            .await
            .map_err(storage)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations(id),
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    settings TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    UNIQUE (org_id, slug)
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL REFERENCES teams(id),
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    model TEXT NOT NULL,
    adapter TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    created_at TEXT NOT NULL,
    UNIQUE (team_id, name)
);

CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL REFERENCES teams(id),
    name TEXT NOT NULL,
    local_path TEXT NOT NULL,
    default_branch TEXT NOT NULL DEFAULT 'main',
    created_at TEXT NOT NULL,
    UNIQUE (team_id, name)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id TEXT NOT NULL,
    type TEXT NOT NULL,
    data TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_stream ON events(stream_id, id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type, id);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL REFERENCES teams(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'todo',
    priority TEXT NOT NULL DEFAULT 'medium',
    dri_id TEXT,
    assignee_id TEXT,
    depends_on TEXT NOT NULL DEFAULT '[]',
    repo_ids TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    branch TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_team_status ON tasks(team_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL REFERENCES teams(id),
    sender_id TEXT NOT NULL,
    sender_kind TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    recipient_kind TEXT NOT NULL,
    task_id INTEGER,
    content TEXT NOT NULL,
    delivered_at TEXT NOT NULL,
    seen_at TEXT,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id, processed_at);
CREATE INDEX IF NOT EXISTS idx_messages_task ON messages(task_id);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    task_id INTEGER,
    model TEXT NOT NULL,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cache_read INTEGER NOT NULL DEFAULT 0,
    cache_write INTEGER NOT NULL DEFAULT 0,
    cost_micros INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id, started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id);

CREATE TABLE IF NOT EXISTS human_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id TEXT NOT NULL REFERENCES teams(id),
    agent_id TEXT NOT NULL REFERENCES agents(id),
    task_id INTEGER,
    kind TEXT NOT NULL,
    question TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    response TEXT,
    responded_by TEXT,
    timeout_at TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_human_requests_team_status ON human_requests(team_id, status);
CREATE INDEX IF NOT EXISTS idx_human_requests_timeout ON human_requests(status, timeout_at);

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    attempt INTEGER NOT NULL,
    reviewer_id TEXT,
    reviewer_kind TEXT NOT NULL DEFAULT 'user',
    verdict TEXT,
    summary TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    UNIQUE (task_id, attempt)
);

CREATE TABLE IF NOT EXISTS review_comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    review_id INTEGER NOT NULL REFERENCES reviews(id),
    author_id TEXT NOT NULL,
    author_kind TEXT NOT NULL,
    file_path TEXT,
    line_number INTEGER,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_review_comments_review ON review_comments(review_id);

CREATE TABLE IF NOT EXISTS merge_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    repo_id TEXT NOT NULL REFERENCES repositories(id),
    status TEXT NOT NULL DEFAULT 'queued',
    strategy TEXT NOT NULL DEFAULT 'rebase',
    merge_commit TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_merge_jobs_status ON merge_jobs(status, id);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id TEXT NOT NULL,
    event TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    received_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::in_memory().await.expect("store");
        store.migrate().await.expect("second migrate");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);
    }
}
