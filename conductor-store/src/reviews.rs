//! Reviews, review comments and merge jobs.

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::message::{ActorKind, ActorRef};
use conductor_core::review::{
    MergeJob, MergeJobId, MergeStatus, MergeStrategy, Review, ReviewComment, ReviewCommentId,
    ReviewId, Verdict,
};
use conductor_core::task::TaskId;
use sqlx::SqliteConnection;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, storage};

#[derive(Debug, FromRow)]
struct ReviewRow {
    id: i64,
    task_id: i64,
    attempt: i64,
    reviewer_id: Option<String>,
    reviewer_kind: String,
    verdict: Option<String>,
    summary: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

const REVIEW_COLUMNS: &str =
    "id, task_id, attempt, reviewer_id, reviewer_kind, verdict, summary, created_at, resolved_at";

fn parse_review(row: ReviewRow) -> Result<Review, ConductorError> {
    let verdict = row
        .verdict
        .as_deref()
        .map(|value| {
            value
                .parse::<Verdict>()
                .map_err(|_| storage(format!("bad verdict '{value}'")))
        })
        .transpose()?;
    Ok(Review {
        id: row.id,
        task_id: row.task_id,
        attempt: row.attempt,
        reviewer_id: parse_opt_uuid(&row.reviewer_id)?,
        reviewer_kind: row
            .reviewer_kind
            .parse::<ActorKind>()
            .map_err(|_| storage(format!("bad reviewer kind '{}'", row.reviewer_kind)))?,
        verdict,
        summary: row.summary,
        created_at: parse_ts(&row.created_at)?,
        resolved_at: parse_opt_ts(&row.resolved_at)?,
    })
}

pub async fn next_attempt(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<i64, ConductorError> {
    let max: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(attempt), 0) FROM reviews WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(conn)
            .await
            .map_err(storage)?;
    Ok(max + 1)
}

pub async fn insert_review(
    conn: &mut SqliteConnection,
    task_id: TaskId,
    attempt: i64,
    reviewer_id: Option<Uuid>,
    reviewer_kind: ActorKind,
    at: DateTime<Utc>,
) -> Result<ReviewId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO reviews (task_id, attempt, reviewer_id, reviewer_kind, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(attempt)
    .bind(reviewer_id.map(|id| id.to_string()))
    .bind(reviewer_kind.as_str())
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn get_review(
    conn: &mut SqliteConnection,
    id: ReviewId,
) -> Result<Option<Review>, ConductorError> {
    let row =
        sqlx::query_as::<_, ReviewRow>(&format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = ?"))
            .bind(id)
            .fetch_optional(conn)
            .await
            .map_err(storage)?;
    row.map(parse_review).transpose()
}

pub async fn set_verdict(
    conn: &mut SqliteConnection,
    id: ReviewId,
    verdict: Verdict,
    summary: Option<&str>,
    reviewer_id: Option<Uuid>,
    reviewer_kind: ActorKind,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE reviews
        SET verdict = ?, summary = ?, reviewer_id = COALESCE(?, reviewer_id),
            reviewer_kind = ?, resolved_at = ?
        WHERE id = ?
        "#,
    )
    .bind(verdict.as_str())
    .bind(summary)
    .bind(reviewer_id.map(|id| id.to_string()))
    .bind(reviewer_kind.as_str())
    .bind(at.to_rfc3339())
    .bind(id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

/// All reviews for a task, newest attempt first.
pub async fn list_reviews(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Vec<Review>, ConductorError> {
    let rows = sqlx::query_as::<_, ReviewRow>(&format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE task_id = ? ORDER BY attempt DESC"
    ))
    .bind(task_id)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_review).collect()
}

/// Only the highest attempt counts for merge readiness.
pub async fn latest_review(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Option<Review>, ConductorError> {
    let row = sqlx::query_as::<_, ReviewRow>(&format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE task_id = ? ORDER BY attempt DESC LIMIT 1"
    ))
    .bind(task_id)
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_review).transpose()
}

#[derive(Debug, FromRow)]
struct CommentRow {
    id: i64,
    review_id: i64,
    author_id: String,
    author_kind: String,
    file_path: Option<String>,
    line_number: Option<i64>,
    content: String,
    created_at: String,
}

fn parse_comment(row: CommentRow) -> Result<ReviewComment, ConductorError> {
    Ok(ReviewComment {
        id: row.id,
        review_id: row.review_id,
        author: ActorRef {
            id: parse_uuid(&row.author_id)?,
            kind: row
                .author_kind
                .parse::<ActorKind>()
                .map_err(|_| storage(format!("bad author kind '{}'", row.author_kind)))?,
        },
        file_path: row.file_path,
        line_number: row.line_number,
        content: row.content,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub async fn insert_comment(
    conn: &mut SqliteConnection,
    review_id: ReviewId,
    author: ActorRef,
    file_path: Option<&str>,
    line_number: Option<i64>,
    content: &str,
    at: DateTime<Utc>,
) -> Result<ReviewCommentId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO review_comments (review_id, author_id, author_kind, file_path, line_number, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(review_id)
    .bind(author.id.to_string())
    .bind(author.kind.as_str())
    .bind(file_path)
    .bind(line_number)
    .bind(content)
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn comments(
    conn: &mut SqliteConnection,
    review_id: ReviewId,
) -> Result<Vec<ReviewComment>, ConductorError> {
    let rows = sqlx::query_as::<_, CommentRow>(
        r#"
        SELECT id, review_id, author_id, author_kind, file_path, line_number, content, created_at
        FROM review_comments
        WHERE review_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(review_id)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_comment).collect()
}

#[derive(Debug, FromRow)]
struct MergeJobRow {
    id: i64,
    task_id: i64,
    repo_id: String,
    status: String,
    strategy: String,
    merge_commit: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

const JOB_COLUMNS: &str =
    "id, task_id, repo_id, status, strategy, merge_commit, error, created_at, started_at, completed_at";

fn parse_job(row: MergeJobRow) -> Result<MergeJob, ConductorError> {
    Ok(MergeJob {
        id: row.id,
        task_id: row.task_id,
        repo_id: parse_uuid(&row.repo_id)?,
        status: row
            .status
            .parse::<MergeStatus>()
            .map_err(|_| storage(format!("bad merge status '{}'", row.status)))?,
        strategy: row
            .strategy
            .parse::<MergeStrategy>()
            .map_err(|_| storage(format!("bad merge strategy '{}'", row.strategy)))?,
        merge_commit: row.merge_commit,
        error: row.error,
        created_at: parse_ts(&row.created_at)?,
        started_at: parse_opt_ts(&row.started_at)?,
        completed_at: parse_opt_ts(&row.completed_at)?,
    })
}

pub async fn insert_merge_job(
    conn: &mut SqliteConnection,
    task_id: TaskId,
    repo_id: Uuid,
    strategy: MergeStrategy,
    at: DateTime<Utc>,
) -> Result<MergeJobId, ConductorError> {
    let result = sqlx::query(
        r#"
        INSERT INTO merge_jobs (task_id, repo_id, strategy, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(repo_id.to_string())
    .bind(strategy.as_str())
    .bind(at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(result.last_insert_rowid())
}

pub async fn get_merge_job(
    conn: &mut SqliteConnection,
    id: MergeJobId,
) -> Result<Option<MergeJob>, ConductorError> {
    let row = sqlx::query_as::<_, MergeJobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM merge_jobs WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_job).transpose()
}

/// Oldest queued job, the merge worker's claim order.
pub async fn next_queued_job(
    conn: &mut SqliteConnection,
) -> Result<Option<MergeJob>, ConductorError> {
    let row = sqlx::query_as::<_, MergeJobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM merge_jobs WHERE status = 'queued' ORDER BY id ASC LIMIT 1"
    ))
    .fetch_optional(conn)
    .await
    .map_err(storage)?;
    row.map(parse_job).transpose()
}

pub async fn mark_job_running(
    conn: &mut SqliteConnection,
    id: MergeJobId,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE merge_jobs SET status = 'running', started_at = ? WHERE id = ?")
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(conn)
        .await
        .map_err(storage)?;
    Ok(())
}

pub async fn finish_job(
    conn: &mut SqliteConnection,
    id: MergeJobId,
    status: MergeStatus,
    merge_commit: Option<&str>,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), ConductorError> {
    sqlx::query(
        r#"
        UPDATE merge_jobs
        SET status = ?, merge_commit = ?, error = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(merge_commit)
    .bind(error)
    .bind(at.to_rfc3339())
    .bind(id)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub async fn jobs_for_task(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Vec<MergeJob>, ConductorError> {
    let rows = sqlx::query_as::<_, MergeJobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM merge_jobs WHERE task_id = ? ORDER BY id ASC"
    ))
    .bind(task_id)
    .fetch_all(conn)
    .await
    .map_err(storage)?;
    rows.into_iter().map(parse_job).collect()
}
