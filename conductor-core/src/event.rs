use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BudgetScope;
use crate::human::RequestKind;
use crate::message::ActorRef;
use crate::review::{MergeStrategy, Verdict};
use crate::session::SessionId;
use crate::task::{TaskId, TaskStatus};

pub type EventId = i64;

/// A persisted event as read back from the log. `data` stays raw JSON so
/// payload fields written by newer versions survive a round trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub metadata: EventMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetadata {
    pub actor_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventMetadata {
    pub fn actor(actor_id: Uuid) -> Self {
        Self {
            actor_id: Some(actor_id),
            ..Self::default()
        }
    }
}

pub fn task_stream(id: TaskId) -> String {
    format!("task:{id}")
}

pub fn team_stream(id: Uuid) -> String {
    format!("team:{id}")
}

pub fn agent_stream(id: Uuid) -> String {
    format!("agent:{id}")
}

pub fn repo_stream(id: Uuid) -> String {
    format!("repo:{id}")
}

pub fn message_stream(id: i64) -> String {
    format!("message:{id}")
}

pub fn review_stream(id: i64) -> String {
    format!("review:{id}")
}

pub fn human_request_stream(id: i64) -> String {
    format!("human_request:{id}")
}

/// Every event the system appends, as a tagged variant with a known payload
/// shape. The variant picks the `type` column; the fields become the `data`
/// JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    TaskCreated {
        title: String,
        priority: crate::task::TaskPriority,
        team_id: Uuid,
        assignee_id: Option<Uuid>,
        depends_on: Vec<TaskId>,
    },
    TaskUpdated {
        changes: serde_json::Map<String, serde_json::Value>,
    },
    TaskAssigned {
        from: Option<Uuid>,
        to: Option<Uuid>,
    },
    TaskStatusChanged {
        from: TaskStatus,
        to: TaskStatus,
        actor_id: Option<Uuid>,
    },
    TaskCommentAdded {
        author: ActorRef,
        content: String,
    },
    MessageSent {
        message_id: i64,
        sender: ActorRef,
        recipient: ActorRef,
        task_id: Option<TaskId>,
    },
    SessionStarted {
        session_id: SessionId,
        agent_id: Uuid,
        task_id: Option<TaskId>,
        model: String,
    },
    SessionUsageRecorded {
        session_id: SessionId,
        tokens_in: i64,
        tokens_out: i64,
        cache_read: i64,
        cache_write: i64,
        total_cost: Decimal,
    },
    SessionEnded {
        session_id: SessionId,
        agent_id: Uuid,
        task_id: Option<TaskId>,
        cost: Decimal,
        error: Option<String>,
    },
    AgentBudgetExceeded {
        agent_id: Uuid,
        task_id: Option<TaskId>,
        scope: BudgetScope,
        spent: Decimal,
        limit: Decimal,
    },
    CostUnknownModel {
        session_id: SessionId,
        model: String,
    },
    HumanRequestCreated {
        request_id: i64,
        agent_id: Uuid,
        task_id: Option<TaskId>,
        kind: RequestKind,
        question: String,
        options: Vec<String>,
    },
    HumanRequestResolved {
        request_id: i64,
        response: String,
        responded_by: Option<Uuid>,
    },
    HumanRequestExpired {
        request_id: i64,
        reason: String,
    },
    ReviewCreated {
        review_id: i64,
        task_id: TaskId,
        attempt: i64,
        reviewer_id: Option<Uuid>,
    },
    ReviewVerdict {
        review_id: i64,
        task_id: TaskId,
        verdict: Verdict,
        summary: Option<String>,
        reviewer_id: Option<Uuid>,
    },
    ReviewCommentAdded {
        review_id: i64,
        comment_id: i64,
        file_path: Option<String>,
        line_number: Option<i64>,
    },
    ReviewFeedbackSent {
        review_id: i64,
        task_id: TaskId,
        message_id: i64,
        comment_count: usize,
    },
    MergeQueued {
        job_id: i64,
        task_id: TaskId,
        repo_id: Uuid,
        strategy: MergeStrategy,
    },
    MergeStarted {
        job_id: i64,
        task_id: TaskId,
        strategy: MergeStrategy,
    },
    MergeCompleted {
        job_id: i64,
        task_id: TaskId,
        merge_commit: String,
        strategy: MergeStrategy,
    },
    MergeFailed {
        job_id: i64,
        task_id: TaskId,
        error: String,
        strategy: MergeStrategy,
    },
    TeamCreated {
        name: String,
        slug: String,
        org_id: Uuid,
    },
    AgentCreated {
        name: String,
        role: crate::team::AgentRole,
        team_id: Uuid,
        auto_created: bool,
    },
    RepoRegistered {
        name: String,
        local_path: String,
        team_id: Uuid,
    },
    SettingsUpdated {
        changes: serde_json::Map<String, serde_json::Value>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::TaskCreated { .. } => "task.created",
            EventPayload::TaskUpdated { .. } => "task.updated",
            EventPayload::TaskAssigned { .. } => "task.assigned",
            EventPayload::TaskStatusChanged { .. } => "task.status_changed",
            EventPayload::TaskCommentAdded { .. } => "task.comment_added",
            EventPayload::MessageSent { .. } => "message.sent",
            EventPayload::SessionStarted { .. } => "session.started",
            EventPayload::SessionUsageRecorded { .. } => "session.usage_recorded",
            EventPayload::SessionEnded { .. } => "session.ended",
            EventPayload::AgentBudgetExceeded { .. } => "agent.budget_exceeded",
            EventPayload::CostUnknownModel { .. } => "cost.unknown_model",
            EventPayload::HumanRequestCreated { .. } => "human_request.created",
            EventPayload::HumanRequestResolved { .. } => "human_request.resolved",
            EventPayload::HumanRequestExpired { .. } => "human_request.expired",
            EventPayload::ReviewCreated { .. } => "review.created",
            EventPayload::ReviewVerdict { .. } => "review.verdict",
            EventPayload::ReviewCommentAdded { .. } => "review.comment_added",
            EventPayload::ReviewFeedbackSent { .. } => "review.feedback_sent",
            EventPayload::MergeQueued { .. } => "merge.queued",
            EventPayload::MergeStarted { .. } => "merge.started",
            EventPayload::MergeCompleted { .. } => "merge.completed",
            EventPayload::MergeFailed { .. } => "merge.failed",
            EventPayload::TeamCreated { .. } => "team.created",
            EventPayload::AgentCreated { .. } => "agent.created",
            EventPayload::RepoRegistered { .. } => "repo.registered",
            EventPayload::SettingsUpdated { .. } => "settings.updated",
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            // Change-set payloads carry the changed fields directly.
            EventPayload::TaskUpdated { changes } | EventPayload::SettingsUpdated { changes } => {
                serde_json::Value::Object(changes.clone())
            }
            _ => serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }
}
