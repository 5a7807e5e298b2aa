//! Commit-bound notification hub.
//!
//! The backing store has no native pub/sub, so the hub is an in-process
//! broadcast fanout with one channel per spec'd topic. Callers publish only
//! after their transaction commits, which preserves the contract that a
//! notification for a row is never seen before the row is.

use conductor_core::task::{TaskId, TaskStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Payload on `task_status_changed`. The other channels carry a bare id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatusChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Clone)]
pub struct NotifyHub {
    new_message: broadcast::Sender<Uuid>,
    human_request_resolved: broadcast::Sender<Uuid>,
    task_status_changed: broadcast::Sender<TaskStatusChange>,
}

impl NotifyHub {
    pub fn new(capacity: usize) -> Self {
        let (new_message, _) = broadcast::channel(capacity);
        let (human_request_resolved, _) = broadcast::channel(capacity);
        let (task_status_changed, _) = broadcast::channel(capacity);
        Self {
            new_message,
            human_request_resolved,
            task_status_changed,
        }
    }

    /// A message landed in `recipient`'s inbox.
    pub fn publish_new_message(&self, recipient: Uuid) {
        let _ = self.new_message.send(recipient);
    }

    /// The request `agent` was waiting on reached a terminal state.
    pub fn publish_human_request_resolved(&self, agent: Uuid) {
        let _ = self.human_request_resolved.send(agent);
    }

    pub fn publish_task_status_changed(&self, change: TaskStatusChange) {
        let _ = self.task_status_changed.send(change);
    }

    pub fn subscribe_new_message(&self) -> broadcast::Receiver<Uuid> {
        self.new_message.subscribe()
    }

    pub fn subscribe_human_request_resolved(&self) -> broadcast::Receiver<Uuid> {
        self.human_request_resolved.subscribe()
    }

    pub fn subscribe_task_status_changed(&self) -> broadcast::Receiver<TaskStatusChange> {
        self.task_status_changed.subscribe()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_ids() {
        let hub = NotifyHub::default();
        let mut rx = hub.subscribe_new_message();
        let recipient = Uuid::new_v4();
        hub.publish_new_message(recipient);
        assert_eq!(rx.recv().await.expect("recv"), recipient);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = NotifyHub::default();
        hub.publish_human_request_resolved(Uuid::new_v4());
        hub.publish_task_status_changed(TaskStatusChange {
            task_id: 1,
            from: TaskStatus::Todo,
            to: TaskStatus::InProgress,
        });
    }

    #[tokio::test]
    async fn status_changes_carry_from_and_to() {
        let hub = NotifyHub::default();
        let mut rx = hub.subscribe_task_status_changed();
        hub.publish_task_status_changed(TaskStatusChange {
            task_id: 9,
            from: TaskStatus::Merging,
            to: TaskStatus::Done,
        });
        let change = rx.recv().await.expect("recv");
        assert_eq!(change.task_id, 9);
        assert_eq!(change.to, TaskStatus::Done);
    }
}
