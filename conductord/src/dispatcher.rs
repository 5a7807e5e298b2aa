//! The turn dispatcher: converts notifications into agent turns under a
//! concurrency cap, with per-agent exclusion, coalescing, fallback polling
//! and cooperative shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::ConductorError;
use conductor_core::config::DispatcherConfig;
use conductor_core::team::{Agent, AgentStatus};
use conductor_engine::Services;
use conductor_store::NotifyHub;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use uuid::Uuid;

use crate::runner::{AgentRunner, RealtimePublisher};

struct DispatcherState {
    /// Agents with a turn in flight (or queued on the semaphore). A second
    /// notification for such an agent is coalesced; the turn loop re-reads
    /// the inbox before exiting, so nothing is lost.
    in_flight: Mutex<HashSet<Uuid>>,
    turns: Semaphore,
}

#[derive(Clone)]
pub struct Dispatcher {
    services: Services,
    notify: NotifyHub,
    runner: Arc<dyn AgentRunner>,
    realtime: Arc<dyn RealtimePublisher>,
    config: DispatcherConfig,
    state: Arc<DispatcherState>,
}

impl Dispatcher {
    pub fn new(
        services: Services,
        notify: NotifyHub,
        runner: Arc<dyn AgentRunner>,
        realtime: Arc<dyn RealtimePublisher>,
        config: DispatcherConfig,
    ) -> Self {
        let turns = Semaphore::new(config.max_concurrent_turns);
        Self {
            services,
            notify,
            runner,
            realtime,
            config,
            state: Arc::new(DispatcherState {
                in_flight: Mutex::new(HashSet::new()),
                turns,
            }),
        }
    }

    /// Main loop: notifications first, the fallback poll as safety net.
    /// Runs until the shutdown channel flips, then drains in-flight turns
    /// within the grace period.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut new_message = self.notify.subscribe_new_message();
        let mut request_resolved = self.notify.subscribe_human_request_resolved();
        let mut status_changed = self.notify.subscribe_task_status_changed();

        let mut poll = interval(Duration::from_secs(
            self.config.fallback_poll_interval_seconds.max(1),
        ));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            max_concurrent_turns = self.config.max_concurrent_turns,
            "dispatcher_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = new_message.recv() => match received {
                    Ok(recipient) => self.try_dispatch(recipient, "new_message").await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "new_message_lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                received = request_resolved.recv() => match received {
                    Ok(agent_id) => self.try_dispatch(agent_id, "human_request_resolved").await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "human_request_resolved_lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                received = status_changed.recv() => {
                    if let Ok(change) = received {
                        // Observability only; agents react via messages.
                        tracing::info!(
                            task_id = change.task_id,
                            from = %change.from,
                            to = %change.to,
                            "task_status_changed"
                        );
                        self.realtime.publish(
                            &conductor_core::event::task_stream(change.task_id),
                            &serde_json::json!({
                                "type": "task.status_changed",
                                "task_id": change.task_id,
                                "from": change.from,
                                "to": change.to,
                            }),
                        );
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = self.fallback_poll().await {
                        tracing::error!(error = %err, "fallback_poll_failed");
                    }
                }
            }
        }

        self.drain().await;
        tracing::info!("dispatcher_stopped");
    }

    /// Catch agents whose notifications were lost.
    async fn fallback_poll(&self) -> Result<(), ConductorError> {
        let pending = self.services.messages.agents_with_unprocessed(10).await?;
        for agent_id in pending {
            self.try_dispatch(agent_id, "fallback_poll").await;
        }
        Ok(())
    }

    async fn try_dispatch(&self, agent_id: Uuid, reason: &'static str) {
        {
            let mut in_flight = self.state.in_flight.lock().await;
            if !in_flight.insert(agent_id) {
                tracing::debug!(agent_id = %agent_id, reason, "turn_coalesced");
                return;
            }
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = match dispatcher.state.turns.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(err) = dispatcher.run_agent_turn(agent_id).await {
                tracing::error!(agent_id = %agent_id, error = %err, "turn_failed");
            }
            dispatcher.state.in_flight.lock().await.remove(&agent_id);
        });
        tracing::debug!(agent_id = %agent_id, reason, "turn_dispatched");
    }

    async fn run_agent_turn(&self, agent_id: Uuid) -> Result<(), ConductorError> {
        let agent = match self.services.teams.get_agent(agent_id).await {
            Ok(agent) => agent,
            Err(ConductorError::NotFound { .. }) => {
                tracing::warn!(agent_id = %agent_id, "dispatch_for_unknown_agent");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        // Working agents are already mid-turn elsewhere; paused agents are
        // held back by an operator. Errored agents stay dispatchable so
        // their unprocessed messages are retried.
        if matches!(agent.status, AgentStatus::Working | AgentStatus::Paused) {
            tracing::debug!(agent_id = %agent_id, status = agent.status.as_str(), "dispatch_skipped");
            return Ok(());
        }

        let inbox = self.services.messages.inbox(agent_id, true, 50).await?;
        if inbox.is_empty() {
            return Ok(());
        }
        let task_hint = inbox.iter().find_map(|message| message.task_id);

        let session = match self
            .services
            .sessions
            .start_session(agent_id, task_hint, None)
            .await
        {
            Ok(session) => session,
            Err(err @ ConductorError::BudgetExceeded { .. }) => {
                tracing::warn!(agent_id = %agent_id, error = %err, "turn_refused_over_budget");
                return Ok(());
            }
            Err(ConductorError::Conflict(_)) => {
                // Open session from a parallel path; retry on the next cycle.
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match self.drive_turn(&agent, session.id, inbox).await {
            Ok(()) => {
                self.services.sessions.end_session(session.id, None).await?;
                Ok(())
            }
            Err(err) => {
                // Record the failure and leave the messages unprocessed for
                // the next notification or poll cycle.
                if let Err(end_err) = self
                    .services
                    .sessions
                    .end_session(session.id, Some(&err.to_string()))
                    .await
                {
                    tracing::error!(session_id = session.id, error = %end_err, "session_end_failed");
                }
                Err(err)
            }
        }
    }

    /// One cooperative turn: keep running the adapter over the unprocessed
    /// inbox until a re-read comes back empty, so messages that arrived
    /// while the adapter was busy are handled without a second dispatch.
    async fn drive_turn(
        &self,
        agent: &Agent,
        session_id: i64,
        mut inbox: Vec<conductor_core::message::Message>,
    ) -> Result<(), ConductorError> {
        let turn_timeout = Duration::from_secs(self.config.turn_timeout_seconds);
        while !inbox.is_empty() {
            for message in &inbox {
                self.services.messages.mark_seen(message.id).await?;
            }

            let run = timeout(turn_timeout, self.runner.run_turn(agent, &inbox))
                .await
                .map_err(|_| {
                    ConductorError::External(format!(
                        "turn timed out after {}s",
                        turn_timeout.as_secs()
                    ))
                })??;
            self.services
                .sessions
                .record_usage(session_id, run.usage)
                .await?;

            for message in &inbox {
                self.services.messages.mark_processed(message.id).await?;
            }
            inbox = self.services.messages.inbox(agent.id, true, 50).await?;
        }
        Ok(())
    }

    /// Cooperative drain: wait for in-flight turns up to the grace period.
    async fn drain(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.state.in_flight.lock().await.len();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining, "shutdown_grace_elapsed_abandoning_turns");
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}
