//! Review attempts, verdicts, the automated feedback loop and the merge
//! queue. A verdict and everything it triggers (status change, feedback
//! message, events) commit in one transaction; notifications follow commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::ConductorError;
use conductor_core::event::{
    EventMetadata, EventPayload, message_stream, review_stream, task_stream,
};
use conductor_core::message::{ActorKind, ActorRef};
use conductor_core::review::{
    MergeJob, MergeJobId, MergeStatus, MergeStrategy, Review, ReviewComment, ReviewId, Verdict,
};
use conductor_core::task::{Task, TaskId, TaskStatus, is_transition_allowed};
use conductor_store::notify::TaskStatusChange;
use conductor_store::{NotifyHub, Store, events, messages, reviews, storage, tasks, teams};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::clock::Clock;

/// Post-commit notifications collected while a transaction is open.
#[derive(Default)]
struct Outbox {
    status_changes: Vec<TaskStatusChange>,
    new_messages: Vec<Uuid>,
}

impl Outbox {
    fn flush(self, notify: &NotifyHub) {
        for change in self.status_changes {
            notify.publish_task_status_changed(change);
        }
        for recipient in self.new_messages {
            notify.publish_new_message(recipient);
        }
    }
}

/// Merge readiness snapshot for a task.
#[derive(Debug, Clone)]
pub struct MergeReadiness {
    pub task_id: TaskId,
    pub review_verdict: Option<Verdict>,
    pub review_attempt: i64,
    pub jobs: Vec<MergeJob>,
    pub can_merge: bool,
}

#[derive(Clone)]
pub struct ReviewCoordinator {
    store: Store,
    notify: NotifyHub,
    clock: Arc<dyn Clock>,
}

impl ReviewCoordinator {
    pub fn new(store: Store, notify: NotifyHub, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notify,
            clock,
        }
    }

    /// Open the next review attempt for a task. When an agent reviewer is
    /// requested (or team policy prefers one) and an idle reviewer exists,
    /// a "please review" message is enqueued for it.
    pub async fn request_review(
        &self,
        task_id: TaskId,
        reviewer_id: Option<Uuid>,
        reviewer_kind: ActorKind,
    ) -> Result<Review, ConductorError> {
        let now = self.clock.now();
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;
        let task = require_task(&mut tx, task_id).await?;

        let attempt = reviews::next_attempt(&mut tx, task_id).await?;
        let review_id =
            reviews::insert_review(&mut tx, task_id, attempt, reviewer_id, reviewer_kind, now)
                .await?;
        events::append(
            &mut tx,
            &review_stream(review_id),
            &EventPayload::ReviewCreated {
                review_id,
                task_id,
                attempt,
                reviewer_id,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;

        let team = teams::get_team(&mut tx, task.team_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("team", task.team_id))?;
        let wants_agent =
            reviewer_kind == ActorKind::Agent || team.settings.prefer_agent_reviewer;
        if wants_agent {
            let target = match reviewer_id {
                Some(id) if reviewer_kind == ActorKind::Agent => {
                    teams::get_agent(&mut tx, id).await?
                }
                _ => teams::idle_reviewer(&mut tx, task.team_id).await?,
            };
            if let Some(target) = target {
                // The assignee (or the DRI) asks for the review.
                let sender = task.assignee_id.or(task.dri_id);
                if let Some(sender) = sender {
                    let content = format!(
                        "please review task {task_id} (attempt {attempt}): {}",
                        task.title
                    );
                    send_in_tx(
                        &mut tx,
                        task.team_id,
                        ActorRef::agent(sender),
                        ActorRef::agent(target.id),
                        &content,
                        Some(task_id),
                        now,
                        &mut outbox,
                    )
                    .await?;
                }
            }
        }

        let review = reviews::get_review(&mut tx, review_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("review", review_id))?;
        self.store.commit(tx).await?;
        outbox.flush(&self.notify);
        tracing::info!(task_id, review_id, attempt, "review_requested");
        Ok(review)
    }

    pub async fn add_comment(
        &self,
        review_id: ReviewId,
        author: ActorRef,
        content: &str,
        file_path: Option<&str>,
        line_number: Option<i64>,
    ) -> Result<ReviewComment, ConductorError> {
        if content.trim().is_empty() {
            return Err(ConductorError::Validation(
                "comment must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        require_review(&mut tx, review_id).await?;
        let comment_id = reviews::insert_comment(
            &mut tx, review_id, author, file_path, line_number, content, now,
        )
        .await?;
        events::append(
            &mut tx,
            &review_stream(review_id),
            &EventPayload::ReviewCommentAdded {
                review_id,
                comment_id,
                file_path: file_path.map(str::to_string),
                line_number,
            },
            &EventMetadata::actor(author.id),
            now,
        )
        .await?;
        self.store.commit(tx).await?;

        let all = self.comments(review_id).await?;
        all.into_iter()
            .find(|comment| comment.id == comment_id)
            .ok_or_else(|| ConductorError::not_found("review comment", comment_id))
    }

    /// The central action: record the verdict and drive the task.
    ///
    /// * `approve` — task `in_review → in_approval`.
    /// * `reject` — task `in_review → in_progress`.
    /// * `request_changes` — same transition, plus one structured feedback
    ///   message to the assignee (summary and `file:line — comment` lines)
    ///   and a `review.feedback_sent` event.
    pub async fn set_verdict(
        &self,
        review_id: ReviewId,
        verdict: Verdict,
        summary: Option<&str>,
        reviewer_id: Option<Uuid>,
        reviewer_kind: ActorKind,
    ) -> Result<Review, ConductorError> {
        let now = self.clock.now();
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;

        let review = require_review(&mut tx, review_id).await?;
        if let Some(existing) = review.verdict {
            return Err(ConductorError::Conflict(format!(
                "review {review_id} already has verdict '{}'",
                existing.as_str()
            )));
        }
        let mut task = require_task(&mut tx, review.task_id).await?;

        reviews::set_verdict(
            &mut tx,
            review_id,
            verdict,
            summary,
            reviewer_id,
            reviewer_kind,
            now,
        )
        .await?;
        events::append(
            &mut tx,
            &review_stream(review_id),
            &EventPayload::ReviewVerdict {
                review_id,
                task_id: task.id,
                verdict,
                summary: summary.map(str::to_string),
                reviewer_id,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;

        let target = match verdict {
            Verdict::Approve => TaskStatus::InApproval,
            Verdict::RequestChanges | Verdict::Reject => TaskStatus::InProgress,
        };
        if task.status == TaskStatus::InReview {
            apply_status(&mut tx, &mut task, target, reviewer_id, now, &mut outbox).await?;
        }

        if verdict == Verdict::RequestChanges {
            if let Some(assignee) = task.assignee_id {
                let comments = reviews::comments(&mut tx, review_id).await?;
                let content = feedback_content(&review, summary, &comments);
                let sender_id = reviewer_id.or(review.reviewer_id).unwrap_or(assignee);
                let message_id = send_in_tx(
                    &mut tx,
                    task.team_id,
                    ActorRef {
                        id: sender_id,
                        kind: reviewer_kind,
                    },
                    ActorRef::agent(assignee),
                    &content,
                    Some(task.id),
                    now,
                    &mut outbox,
                )
                .await?;
                events::append(
                    &mut tx,
                    &review_stream(review_id),
                    &EventPayload::ReviewFeedbackSent {
                        review_id,
                        task_id: task.id,
                        message_id,
                        comment_count: comments.len(),
                    },
                    &EventMetadata::default(),
                    now,
                )
                .await?;
            }
        }

        let resolved = reviews::get_review(&mut tx, review_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("review", review_id))?;
        self.store.commit(tx).await?;
        outbox.flush(&self.notify);
        tracing::info!(review_id, task_id = task.id, verdict = verdict.as_str(), "review_verdict");
        Ok(resolved)
    }

    /// Move an approved task into `merging` and queue one job per touched
    /// repository. Only the highest-attempt review counts.
    pub async fn queue_merge(
        &self,
        task_id: TaskId,
        strategy: MergeStrategy,
    ) -> Result<Vec<MergeJob>, ConductorError> {
        let now = self.clock.now();
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;

        let latest = reviews::latest_review(&mut tx, task_id).await?;
        let approved = latest
            .as_ref()
            .map(|review| review.verdict == Some(Verdict::Approve))
            .unwrap_or(false);
        if !approved {
            return Err(ConductorError::Conflict(format!(
                "task {task_id} has no approved review"
            )));
        }
        if !is_transition_allowed(task.status, TaskStatus::Merging) {
            return Err(ConductorError::Conflict(format!(
                "cannot transition task {task_id} from '{}' to 'merging'",
                task.status
            )));
        }
        if task.repo_ids.is_empty() {
            return Err(ConductorError::Validation(format!(
                "task {task_id} touches no repositories"
            )));
        }

        let mut jobs = Vec::with_capacity(task.repo_ids.len());
        for &repo_id in &task.repo_ids {
            if teams::get_repo(&mut tx, repo_id).await?.is_none() {
                return Err(ConductorError::not_found("repository", repo_id));
            }
            let job_id = reviews::insert_merge_job(&mut tx, task_id, repo_id, strategy, now).await?;
            events::append(
                &mut tx,
                &task_stream(task_id),
                &EventPayload::MergeQueued {
                    job_id,
                    task_id,
                    repo_id,
                    strategy,
                },
                &EventMetadata::default(),
                now,
            )
            .await?;
            let job = reviews::get_merge_job(&mut tx, job_id)
                .await?
                .ok_or_else(|| ConductorError::not_found("merge job", job_id))?;
            jobs.push(job);
        }

        apply_status(&mut tx, &mut task, TaskStatus::Merging, None, now, &mut outbox).await?;
        self.store.commit(tx).await?;
        outbox.flush(&self.notify);
        tracing::info!(task_id, jobs = jobs.len(), "merge_queued");
        Ok(jobs)
    }

    /// Claim the oldest queued job for the merge worker: queued → running,
    /// `merge.started` appended.
    pub async fn claim_next_job(&self) -> Result<Option<MergeJob>, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let Some(job) = reviews::next_queued_job(&mut tx).await? else {
            return Ok(None);
        };
        reviews::mark_job_running(&mut tx, job.id, now).await?;
        events::append(
            &mut tx,
            &task_stream(job.task_id),
            &EventPayload::MergeStarted {
                job_id: job.id,
                task_id: job.task_id,
                strategy: job.strategy,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        let claimed = reviews::get_merge_job(&mut tx, job.id)
            .await?
            .ok_or_else(|| ConductorError::not_found("merge job", job.id))?;
        self.store.commit(tx).await?;
        Ok(Some(claimed))
    }

    /// Merge success: record the commit, task `merging → done`.
    pub async fn complete_job(
        &self,
        job_id: MergeJobId,
        merge_commit: &str,
    ) -> Result<MergeJob, ConductorError> {
        self.finish_job(job_id, MergeStatus::Success, Some(merge_commit), None)
            .await
    }

    /// Merge failure: record the error, task back to `in_progress`. Repeat
    /// failures append their own events even once the task has moved.
    pub async fn fail_job(
        &self,
        job_id: MergeJobId,
        error: &str,
    ) -> Result<MergeJob, ConductorError> {
        self.finish_job(job_id, MergeStatus::Failed, None, Some(error)).await
    }

    async fn finish_job(
        &self,
        job_id: MergeJobId,
        status: MergeStatus,
        merge_commit: Option<&str>,
        error: Option<&str>,
    ) -> Result<MergeJob, ConductorError> {
        let now = self.clock.now();
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;
        let job = reviews::get_merge_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("merge job", job_id))?;
        if job.status != MergeStatus::Running {
            return Err(ConductorError::Conflict(format!(
                "merge job {job_id} is {} and cannot finish",
                job.status.as_str()
            )));
        }

        reviews::finish_job(&mut tx, job_id, status, merge_commit, error, now).await?;
        let payload = match status {
            MergeStatus::Success => EventPayload::MergeCompleted {
                job_id,
                task_id: job.task_id,
                merge_commit: merge_commit.unwrap_or_default().to_string(),
                strategy: job.strategy,
            },
            _ => EventPayload::MergeFailed {
                job_id,
                task_id: job.task_id,
                error: error.unwrap_or_default().to_string(),
                strategy: job.strategy,
            },
        };
        events::append(
            &mut tx,
            &task_stream(job.task_id),
            &payload,
            &EventMetadata::default(),
            now,
        )
        .await?;

        let mut task = require_task(&mut tx, job.task_id).await?;
        if task.status == TaskStatus::Merging {
            let target = if status == MergeStatus::Success {
                TaskStatus::Done
            } else {
                TaskStatus::InProgress
            };
            apply_status(&mut tx, &mut task, target, None, now, &mut outbox).await?;
        }

        let finished = reviews::get_merge_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("merge job", job_id))?;
        self.store.commit(tx).await?;
        outbox.flush(&self.notify);
        Ok(finished)
    }

    pub async fn get_review(&self, review_id: ReviewId) -> Result<Review, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        require_review(&mut conn, review_id).await
    }

    pub async fn list_reviews(&self, task_id: TaskId) -> Result<Vec<Review>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        reviews::list_reviews(&mut conn, task_id).await
    }

    pub async fn comments(
        &self,
        review_id: ReviewId,
    ) -> Result<Vec<ReviewComment>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        reviews::comments(&mut conn, review_id).await
    }

    pub async fn merge_readiness(
        &self,
        task_id: TaskId,
    ) -> Result<MergeReadiness, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        let latest = reviews::latest_review(&mut conn, task_id).await?;
        let jobs = reviews::jobs_for_task(&mut conn, task_id).await?;
        Ok(MergeReadiness {
            task_id,
            review_verdict: latest.as_ref().and_then(|review| review.verdict),
            review_attempt: latest.as_ref().map(|review| review.attempt).unwrap_or(0),
            can_merge: latest
                .as_ref()
                .map(|review| review.verdict == Some(Verdict::Approve))
                .unwrap_or(false),
            jobs,
        })
    }
}

/// Status change inside an open transaction: mutate, persist, append the
/// event, queue the notification.
async fn apply_status(
    tx: &mut SqliteConnection,
    task: &mut Task,
    to: TaskStatus,
    actor_id: Option<Uuid>,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(), ConductorError> {
    let from = task.status;
    if !is_transition_allowed(from, to) {
        return Err(ConductorError::Conflict(format!(
            "cannot transition task {} from '{from}' to '{to}'",
            task.id
        )));
    }
    task.status = to;
    task.updated_at = now;
    if to == TaskStatus::Done {
        task.completed_at = Some(now);
    }
    tasks::update(tx, task).await?;
    events::append(
        tx,
        &task_stream(task.id),
        &EventPayload::TaskStatusChanged { from, to, actor_id },
        &EventMetadata::default(),
        now,
    )
    .await?;
    outbox.status_changes.push(TaskStatusChange {
        task_id: task.id,
        from,
        to,
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_in_tx(
    tx: &mut SqliteConnection,
    team_id: Uuid,
    sender: ActorRef,
    recipient: ActorRef,
    content: &str,
    task_id: Option<TaskId>,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<i64, ConductorError> {
    let message_id =
        messages::insert(tx, team_id, sender, recipient, task_id, content, now).await?;
    events::append(
        tx,
        &message_stream(message_id),
        &EventPayload::MessageSent {
            message_id,
            sender,
            recipient,
            task_id,
        },
        &EventMetadata::actor(sender.id),
        now,
    )
    .await?;
    if recipient.kind == ActorKind::Agent {
        outbox.new_messages.push(recipient.id);
    }
    Ok(message_id)
}

fn feedback_content(review: &Review, summary: Option<&str>, comments: &[ReviewComment]) -> String {
    let mut content = format!(
        "Review feedback for task {} (attempt {})",
        review.task_id, review.attempt
    );
    if let Some(summary) = summary {
        content.push_str(": ");
        content.push_str(summary);
    }
    for comment in comments {
        content.push_str("\n");
        content.push_str(&comment.anchor_line());
    }
    content
}

async fn require_task(
    conn: &mut SqliteConnection,
    task_id: TaskId,
) -> Result<Task, ConductorError> {
    tasks::get(conn, task_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("task", task_id))
}

async fn require_review(
    conn: &mut SqliteConnection,
    review_id: ReviewId,
) -> Result<Review, ConductorError> {
    reviews::get_review(conn, review_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("review", review_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_engine::CreateTask;
    use crate::testing::{Harness, Seed, harness, seed_team};
    use conductor_core::team::AgentRole;

    async fn task_in_review(h: &Harness, seed: &Seed, repo_ids: Vec<Uuid>) -> Task {
        let task = h
            .services
            .tasks
            .create_task(CreateTask {
                assignee_id: Some(seed.engineer.id),
                repo_ids,
                ..CreateTask::new(seed.team_id, "Fix login")
            })
            .await
            .expect("create");
        for status in [TaskStatus::InProgress, TaskStatus::InReview] {
            h.services
                .tasks
                .change_status(task.id, status, None)
                .await
                .expect("drive");
        }
        h.services.tasks.get_task(task.id).await.expect("get")
    }

    #[tokio::test]
    async fn attempts_increment_per_task() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let task = task_in_review(&h, &seed, vec![]).await;

        let first = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("first");
        assert_eq!(first.attempt, 1);
        h.services
            .reviews
            .set_verdict(first.id, Verdict::Reject, None, None, ActorKind::User)
            .await
            .expect("reject");

        h.services
            .tasks
            .change_status(task.id, TaskStatus::InReview, None)
            .await
            .expect("back to review");
        let second = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("second");
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn request_changes_runs_the_feedback_loop() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let task = task_in_review(&h, &seed, vec![]).await;
        let reviewer = Uuid::new_v4();

        let review = h
            .services
            .reviews
            .request_review(task.id, Some(reviewer), ActorKind::User)
            .await
            .expect("review");
        h.services
            .reviews
            .add_comment(
                review.id,
                ActorRef::user(reviewer),
                "rename",
                Some("a.py"),
                Some(10),
            )
            .await
            .expect("comment");

        let inbox_before = h
            .services
            .messages
            .inbox(seed.engineer.id, true, 50)
            .await
            .expect("inbox");

        h.services
            .reviews
            .set_verdict(
                review.id,
                Verdict::RequestChanges,
                Some("see below"),
                Some(reviewer),
                ActorKind::User,
            )
            .await
            .expect("verdict");

        // Task went back to in_progress.
        let task = h.services.tasks.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::InProgress);

        // Exactly one new message with summary and anchored comment.
        let inbox = h
            .services
            .messages
            .inbox(seed.engineer.id, true, 50)
            .await
            .expect("inbox");
        assert_eq!(inbox.len(), inbox_before.len() + 1);
        let feedback = inbox.last().expect("feedback");
        assert!(feedback.content.contains("see below"));
        assert!(feedback.content.contains("a.py:10 — rename"));
        assert_eq!(feedback.task_id, Some(task.id));

        // Both events appeared.
        let mut conn = h.store.pool().acquire().await.expect("conn");
        for event_type in ["review.verdict", "review.feedback_sent"] {
            let found = conductor_store::events::read_by_type(&mut conn, event_type, 0, 10)
                .await
                .expect("events");
            assert_eq!(found.len(), 1, "{event_type}");
        }
    }

    #[tokio::test]
    async fn approve_moves_to_in_approval_without_merging() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let task = task_in_review(&h, &seed, vec![]).await;

        let review = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("review");
        h.services
            .reviews
            .set_verdict(review.id, Verdict::Approve, Some("ship it"), None, ActorKind::User)
            .await
            .expect("approve");

        let task = h.services.tasks.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::InApproval);
        let readiness = h
            .services
            .reviews
            .merge_readiness(task.id)
            .await
            .expect("readiness");
        assert!(readiness.can_merge);
        assert!(readiness.jobs.is_empty(), "no job before queue_merge");
    }

    #[tokio::test]
    async fn double_verdict_is_a_conflict() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let task = task_in_review(&h, &seed, vec![]).await;
        let review = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("review");
        h.services
            .reviews
            .set_verdict(review.id, Verdict::Approve, None, None, ActorKind::User)
            .await
            .expect("first");
        let err = h
            .services
            .reviews
            .set_verdict(review.id, Verdict::Reject, None, None, ActorKind::User)
            .await
            .expect_err("second verdict");
        assert!(matches!(err, ConductorError::Conflict(_)));
    }

    #[tokio::test]
    async fn agent_review_request_messages_an_idle_reviewer() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let reviewer = h
            .services
            .teams
            .create_agent(seed.team_id, "r1", AgentRole::Reviewer, None, None)
            .await
            .expect("reviewer");
        let task = task_in_review(&h, &seed, vec![]).await;

        h.services
            .reviews
            .request_review(task.id, None, ActorKind::Agent)
            .await
            .expect("review");

        let inbox = h
            .services
            .messages
            .inbox(reviewer.id, true, 50)
            .await
            .expect("inbox");
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].content.contains(&format!("please review task {}", task.id)));
    }

    #[tokio::test]
    async fn merge_queue_success_path_finishes_the_task() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let repo = h
            .services
            .teams
            .register_repo(seed.team_id, "api", "/tmp/api", "main")
            .await
            .expect("repo");
        let task = task_in_review(&h, &seed, vec![repo.id]).await;

        let review = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("review");
        h.services
            .reviews
            .set_verdict(review.id, Verdict::Approve, None, None, ActorKind::User)
            .await
            .expect("approve");

        let jobs = h
            .services
            .reviews
            .queue_merge(task.id, MergeStrategy::Rebase)
            .await
            .expect("queue");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, MergeStatus::Queued);
        assert_eq!(
            h.services.tasks.get_task(task.id).await.expect("get").status,
            TaskStatus::Merging
        );

        let claimed = h
            .services
            .reviews
            .claim_next_job()
            .await
            .expect("claim")
            .expect("job present");
        assert_eq!(claimed.status, MergeStatus::Running);

        let finished = h
            .services
            .reviews
            .complete_job(claimed.id, "abc1234")
            .await
            .expect("complete");
        assert_eq!(finished.status, MergeStatus::Success);
        assert_eq!(finished.merge_commit.as_deref(), Some("abc1234"));

        let task = h.services.tasks.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn merge_failure_recovers_to_in_progress() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let repo = h
            .services
            .teams
            .register_repo(seed.team_id, "api", "/tmp/api", "main")
            .await
            .expect("repo");
        let task = task_in_review(&h, &seed, vec![repo.id]).await;
        let review = h
            .services
            .reviews
            .request_review(task.id, None, ActorKind::User)
            .await
            .expect("review");
        h.services
            .reviews
            .set_verdict(review.id, Verdict::Approve, None, None, ActorKind::User)
            .await
            .expect("approve");
        h.services
            .reviews
            .queue_merge(task.id, MergeStrategy::Squash)
            .await
            .expect("queue");

        let claimed = h
            .services
            .reviews
            .claim_next_job()
            .await
            .expect("claim")
            .expect("present");
        let failed = h
            .services
            .reviews
            .fail_job(claimed.id, "rebase conflict in src/auth.rs")
            .await
            .expect("fail");
        assert_eq!(failed.status, MergeStatus::Failed);
        assert!(failed.error.as_deref().unwrap_or("").contains("conflict"));

        let task = h.services.tasks.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.completed_at.is_none());

        let mut conn = h.store.pool().acquire().await.expect("conn");
        let failures = conductor_store::events::read_by_type(&mut conn, "merge.failed", 0, 10)
            .await
            .expect("events");
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn queue_merge_requires_an_approved_latest_review() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let repo = h
            .services
            .teams
            .register_repo(seed.team_id, "api", "/tmp/api", "main")
            .await
            .expect("repo");
        let task = task_in_review(&h, &seed, vec![repo.id]).await;

        let err = h
            .services
            .reviews
            .queue_merge(task.id, MergeStrategy::Rebase)
            .await
            .expect_err("no review at all");
        assert!(matches!(err, ConductorError::Conflict(_)));
    }
}
