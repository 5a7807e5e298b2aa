use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{ActorKind, ActorRef};
use crate::task::TaskId;

pub type ReviewId = i64;
pub type ReviewCommentId = i64;
pub type MergeJobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::RequestChanges => "request_changes",
            Verdict::Reject => "reject",
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "approve" => Ok(Verdict::Approve),
            "request_changes" => Ok(Verdict::RequestChanges),
            "reject" => Ok(Verdict::Reject),
            _ => Err(()),
        }
    }
}

/// One review cycle for a task. `attempt` is 1-based and unique per task;
/// `verdict` stays `None` while the review is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub task_id: TaskId,
    pub attempt: i64,
    pub reviewer_id: Option<Uuid>,
    pub reviewer_kind: ActorKind,
    pub verdict: Option<Verdict>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Inline comment, optionally anchored to a file and line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: ReviewCommentId,
    pub review_id: ReviewId,
    pub author: ActorRef,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ReviewComment {
    /// `a.py:10 — rename` anchor line used in feedback messages.
    pub fn anchor_line(&self) -> String {
        match (&self.file_path, self.line_number) {
            (Some(file), Some(line)) => format!("{file}:{line} — {}", self.content),
            (Some(file), None) => format!("{file} — {}", self.content),
            _ => self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::Queued => "queued",
            MergeStatus::Running => "running",
            MergeStatus::Success => "success",
            MergeStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MergeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "queued" => Ok(MergeStatus::Queued),
            "running" => Ok(MergeStatus::Running),
            "success" => Ok(MergeStatus::Success),
            "failed" => Ok(MergeStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Rebase,
    Merge,
    Squash,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Rebase => "rebase",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Squash => "squash",
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "rebase" => Ok(MergeStrategy::Rebase),
            "merge" => Ok(MergeStrategy::Merge),
            "squash" => Ok(MergeStrategy::Squash),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJob {
    pub id: MergeJobId,
    pub task_id: TaskId,
    pub repo_id: Uuid,
    pub status: MergeStatus,
    pub strategy: MergeStrategy,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn comment(file: Option<&str>, line: Option<i64>, content: &str) -> ReviewComment {
        ReviewComment {
            id: 1,
            review_id: 1,
            author: ActorRef::user(Uuid::new_v4()),
            file_path: file.map(str::to_string),
            line_number: line,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn anchor_line_formats_file_and_line() {
        assert_eq!(
            comment(Some("a.py"), Some(10), "rename").anchor_line(),
            "a.py:10 — rename"
        );
        assert_eq!(
            comment(Some("a.py"), None, "rename").anchor_line(),
            "a.py — rename"
        );
        assert_eq!(comment(None, None, "rename").anchor_line(), "rename");
    }

    #[test]
    fn verdict_parses() {
        assert_eq!(
            "request_changes".parse::<Verdict>(),
            Ok(Verdict::RequestChanges)
        );
        assert!("lgtm".parse::<Verdict>().is_err());
    }
}
