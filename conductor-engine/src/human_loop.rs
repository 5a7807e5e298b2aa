//! Human-in-the-loop request lifecycle: create, respond, expire. Terminal
//! transitions publish on `human_request_resolved` so the dispatcher can
//! resume the waiting agent; subprocess adapters poll `get_request` instead.

use std::sync::Arc;

use chrono::Duration;
use conductor_core::ConductorError;
use conductor_core::event::{EventMetadata, EventPayload, human_request_stream};
use conductor_core::human::{HumanRequest, HumanRequestId, RequestKind, RequestStatus};
use conductor_core::task::TaskId;
use conductor_store::{NotifyHub, Store, events, human, storage};
use uuid::Uuid;

use crate::clock::Clock;

#[derive(Clone)]
pub struct HumanLoop {
    store: Store,
    notify: NotifyHub,
    clock: Arc<dyn Clock>,
}

impl HumanLoop {
    pub fn new(store: Store, notify: NotifyHub, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notify,
            clock,
        }
    }

    pub async fn create_request(
        &self,
        team_id: Uuid,
        agent_id: Uuid,
        kind: RequestKind,
        question: &str,
        options: Vec<String>,
        task_id: Option<TaskId>,
        timeout_minutes: Option<i64>,
    ) -> Result<HumanRequest, ConductorError> {
        if question.trim().is_empty() {
            return Err(ConductorError::Validation(
                "question must not be empty".into(),
            ));
        }
        let now = self.clock.now();
        let timeout_at = timeout_minutes.map(|minutes| now + Duration::minutes(minutes));

        let mut tx = self.store.begin().await?;
        if conductor_store::teams::get_agent(&mut tx, agent_id)
            .await?
            .is_none()
        {
            return Err(ConductorError::not_found("agent", agent_id));
        }
        let id = human::insert(
            &mut tx, team_id, agent_id, task_id, kind, question, &options, timeout_at, now,
        )
        .await?;
        events::append(
            &mut tx,
            &human_request_stream(id),
            &EventPayload::HumanRequestCreated {
                request_id: id,
                agent_id,
                task_id,
                kind,
                question: question.to_string(),
                options,
            },
            &EventMetadata::actor(agent_id),
            now,
        )
        .await?;
        let request = human::get(&mut tx, id)
            .await?
            .ok_or_else(|| ConductorError::not_found("human request", id))?;
        self.store.commit(tx).await?;
        tracing::info!(request_id = id, agent_id = %agent_id, kind = kind.as_str(), "human_request_created");
        Ok(request)
    }

    pub async fn respond(
        &self,
        request_id: HumanRequestId,
        response: &str,
        responded_by: Option<Uuid>,
    ) -> Result<HumanRequest, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let request = require_request(&mut tx, request_id).await?;
        if request.status != RequestStatus::Pending {
            return Err(ConductorError::Conflict(format!(
                "human request {request_id} is already {}",
                request.status.as_str()
            )));
        }

        human::resolve(&mut tx, request_id, response, responded_by, now).await?;
        events::append(
            &mut tx,
            &human_request_stream(request_id),
            &EventPayload::HumanRequestResolved {
                request_id,
                response: response.to_string(),
                responded_by,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        let resolved = human::get(&mut tx, request_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("human request", request_id))?;
        self.store.commit(tx).await?;

        self.notify.publish_human_request_resolved(request.agent_id);
        Ok(resolved)
    }

    /// Expire a pending request past its deadline. Expiring an
    /// already-terminal request is a no-op (`Ok(false)`, no second event).
    pub async fn expire(&self, request_id: HumanRequestId) -> Result<bool, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let request = require_request(&mut tx, request_id).await?;
        if request.status != RequestStatus::Pending {
            return Ok(false);
        }
        let due = match request.timeout_at {
            Some(timeout_at) => timeout_at < now,
            None => false,
        };
        if !due {
            return Err(ConductorError::Conflict(format!(
                "human request {request_id} is not past its timeout"
            )));
        }

        human::expire(&mut tx, request_id, now).await?;
        events::append(
            &mut tx,
            &human_request_stream(request_id),
            &EventPayload::HumanRequestExpired {
                request_id,
                reason: "timeout".to_string(),
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;

        self.notify.publish_human_request_resolved(request.agent_id);
        tracing::info!(request_id, "human_request_expired");
        Ok(true)
    }

    /// One sweep of the expiry poller. Returns how many requests expired.
    pub async fn expire_stale(&self) -> Result<usize, ConductorError> {
        let now = self.clock.now();
        let stale = {
            let mut conn = self.store.pool().acquire().await.map_err(storage)?;
            human::pending_past_timeout(&mut conn, now).await?
        };
        let mut expired = 0;
        for request in stale {
            // Each request expires in its own transaction; a race with a
            // concurrent respond simply turns into a no-op here.
            match self.expire(request.id).await {
                Ok(true) => expired += 1,
                Ok(false) | Err(ConductorError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }

    /// Primary-key read for polling adapters; O(1) in pending requests.
    pub async fn get_request(
        &self,
        request_id: HumanRequestId,
    ) -> Result<HumanRequest, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        require_request(&mut conn, request_id).await
    }

    pub async fn list_requests(
        &self,
        team_id: Uuid,
        status: Option<RequestStatus>,
        agent_id: Option<Uuid>,
        task_id: Option<TaskId>,
    ) -> Result<Vec<HumanRequest>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        human::list(&mut conn, team_id, status, agent_id, task_id, 50).await
    }
}

async fn require_request(
    conn: &mut sqlx::SqliteConnection,
    request_id: HumanRequestId,
) -> Result<HumanRequest, ConductorError> {
    human::get(conn, request_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("human request", request_id))
}
