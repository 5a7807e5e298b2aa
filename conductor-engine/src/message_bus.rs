//! Durable recipient-keyed messaging. Inserts append `message.sent` and
//! publish on `new_message` after commit; mark operations move timestamps
//! only and append no events.

use std::sync::Arc;

use conductor_core::ConductorError;
use conductor_core::event::{EventMetadata, EventPayload, message_stream};
use conductor_core::message::{ActorKind, ActorRef, Message, MessageId};
use conductor_core::task::TaskId;
use conductor_store::{NotifyHub, Store, events, messages, storage};
use uuid::Uuid;

#[derive(Clone)]
pub struct MessageBus {
    store: Store,
    notify: NotifyHub,
    clock: Arc<dyn crate::clock::Clock>,
}

impl MessageBus {
    pub fn new(store: Store, notify: NotifyHub, clock: Arc<dyn crate::clock::Clock>) -> Self {
        Self {
            store,
            notify,
            clock,
        }
    }

    pub async fn send(
        &self,
        team_id: Uuid,
        sender: ActorRef,
        recipient: ActorRef,
        content: &str,
        task_id: Option<TaskId>,
    ) -> Result<Message, ConductorError> {
        if content.is_empty() {
            return Err(ConductorError::Validation(
                "message content must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let id = messages::insert(&mut tx, team_id, sender, recipient, task_id, content, now)
            .await?;
        events::append(
            &mut tx,
            &message_stream(id),
            &EventPayload::MessageSent {
                message_id: id,
                sender,
                recipient,
                task_id,
            },
            &EventMetadata::actor(sender.id),
            now,
        )
        .await?;
        let message = messages::get(&mut tx, id)
            .await?
            .ok_or_else(|| ConductorError::not_found("message", id))?;
        self.store.commit(tx).await?;

        if recipient.kind == ActorKind::Agent {
            self.notify.publish_new_message(recipient.id);
        }
        tracing::debug!(message_id = id, recipient = %recipient.id, "message_sent");
        Ok(message)
    }

    /// FIFO by message id. `unprocessed_only` is what the dispatcher reads.
    pub async fn inbox(
        &self,
        recipient_id: Uuid,
        unprocessed_only: bool,
        limit: i64,
    ) -> Result<Vec<Message>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        messages::inbox(&mut conn, recipient_id, unprocessed_only, limit).await
    }

    pub async fn mark_seen(&self, message_id: MessageId) -> Result<(), ConductorError> {
        let mut tx = self.store.begin().await?;
        require_message(&mut tx, message_id).await?;
        messages::mark_seen(&mut tx, message_id, self.clock.now()).await?;
        self.store.commit(tx).await
    }

    pub async fn mark_processed(&self, message_id: MessageId) -> Result<(), ConductorError> {
        let mut tx = self.store.begin().await?;
        require_message(&mut tx, message_id).await?;
        messages::mark_processed(&mut tx, message_id, self.clock.now()).await?;
        self.store.commit(tx).await
    }

    /// Agents that still have unprocessed inbox entries (fallback-poll scan).
    pub async fn agents_with_unprocessed(&self, limit: i64) -> Result<Vec<Uuid>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        messages::agents_with_unprocessed(&mut conn, limit).await
    }
}

async fn require_message(
    conn: &mut sqlx::SqliteConnection,
    message_id: MessageId,
) -> Result<Message, ConductorError> {
    messages::get(conn, message_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("message", message_id))
}
