//! Session lifecycle and budget gating. A session opens only if the team's
//! rolling-24h spend and the per-task spend are under their caps; usage is
//! repriced from cumulative counters on every record; ending a session
//! returns the agent to idle (or error).

use std::sync::Arc;

use chrono::Duration;
use conductor_core::config::COST_SCALE;
use conductor_core::error::BudgetScope;
use conductor_core::event::{EventMetadata, EventPayload, agent_stream};
use conductor_core::session::{Session, SessionId, UsageDelta};
use conductor_core::task::TaskId;
use conductor_core::team::{Agent, AgentStatus, Team};
use conductor_core::{ConductorConfig, ConductorError};
use conductor_store::{Store, events, sessions, storage, teams};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::clock::Clock;

/// Non-mutating budget snapshot for an agent (and optionally a task).
#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub daily_spent: Decimal,
    pub daily_cap: Option<Decimal>,
    pub task_spent: Decimal,
    pub task_cap: Option<Decimal>,
    pub over_budget: bool,
}

impl BudgetStatus {
    pub fn daily_remaining(&self) -> Option<Decimal> {
        self.daily_cap
            .map(|cap| (cap - self.daily_spent).max(Decimal::ZERO))
    }

    pub fn task_remaining(&self) -> Option<Decimal> {
        self.task_cap
            .map(|cap| (cap - self.task_spent).max(Decimal::ZERO))
    }
}

#[derive(Clone)]
pub struct SessionLedger {
    store: Store,
    clock: Arc<dyn Clock>,
    config: Arc<ConductorConfig>,
}

impl SessionLedger {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: Arc<ConductorConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Open a session for an agent. Refuses with `BudgetExceeded` at
    /// `spent >= cap` for either the team's daily cap or the task cap, and
    /// with `Conflict` when the agent already has an open session.
    pub async fn start_session(
        &self,
        agent_id: Uuid,
        task_id: Option<TaskId>,
        model: Option<&str>,
    ) -> Result<Session, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let agent = require_agent(&mut tx, agent_id).await?;
        let team = teams::get_team(&mut tx, agent.team_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("team", agent.team_id))?;

        if sessions::open_session(&mut tx, agent_id).await?.is_some() {
            return Err(ConductorError::Conflict(format!(
                "agent {agent_id} already has an open session"
            )));
        }

        let (daily_cap, task_cap) = self.caps_for(&team);

        if let Some(cap) = daily_cap {
            let since = now - Duration::hours(24);
            let spent = sessions::team_spend_since(&mut tx, team.id, since).await?;
            if spent >= cap {
                drop(tx);
                return self
                    .refuse(agent_id, task_id, BudgetScope::TeamDaily, spent, cap)
                    .await;
            }
        }
        if let (Some(cap), Some(task)) = (task_cap, task_id) {
            let spent = sessions::task_spend(&mut tx, task).await?;
            if spent >= cap {
                drop(tx);
                return self
                    .refuse(agent_id, task_id, BudgetScope::PerTask, spent, cap)
                    .await;
            }
        }

        let model = model.unwrap_or(&agent.model);
        let session_id = sessions::insert(&mut tx, agent_id, task_id, model, now).await?;
        teams::set_agent_status(&mut tx, agent_id, AgentStatus::Working).await?;
        events::append(
            &mut tx,
            &agent_stream(agent_id),
            &EventPayload::SessionStarted {
                session_id,
                agent_id,
                task_id,
                model: model.to_string(),
            },
            &EventMetadata::actor(agent_id),
            now,
        )
        .await?;
        let session = sessions::get(&mut tx, session_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("session", session_id))?;
        self.store.commit(tx).await?;
        tracing::info!(session_id, agent_id = %agent_id, model, "session_started");
        Ok(session)
    }

    /// Accumulate a usage delta and reprice the session. Unknown models
    /// price at zero and flag the session instead of failing the record.
    pub async fn record_usage(
        &self,
        session_id: SessionId,
        delta: UsageDelta,
    ) -> Result<Session, ConductorError> {
        if !delta.is_non_negative() {
            return Err(ConductorError::Validation(
                "usage deltas must be non-negative".into(),
            ));
        }
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut session = require_session(&mut tx, session_id).await?;
        if session.ended_at.is_some() {
            return Err(ConductorError::Conflict(format!(
                "session {session_id} has already ended"
            )));
        }

        session.counts.add(&delta);
        let cost = match self.config.price_for(&session.model) {
            Some(price) => price.cost_of(&session.counts),
            None => {
                events::append(
                    &mut tx,
                    &agent_stream(session.agent_id),
                    &EventPayload::CostUnknownModel {
                        session_id,
                        model: session.model.clone(),
                    },
                    &EventMetadata::default(),
                    now,
                )
                .await?;
                Decimal::ZERO
            }
        };
        session.cost = cost.round_dp(COST_SCALE);

        sessions::update_usage(&mut tx, session_id, &session.counts, session.cost).await?;
        events::append(
            &mut tx,
            &agent_stream(session.agent_id),
            &EventPayload::SessionUsageRecorded {
                session_id,
                tokens_in: delta.tokens_in,
                tokens_out: delta.tokens_out,
                cache_read: delta.cache_read,
                cache_write: delta.cache_write,
                total_cost: session.cost,
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        self.store.commit(tx).await?;
        Ok(session)
    }

    /// Close the session and return the agent to `idle`, or `error` when an
    /// error is recorded.
    pub async fn end_session(
        &self,
        session_id: SessionId,
        error: Option<&str>,
    ) -> Result<Session, ConductorError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let session = require_session(&mut tx, session_id).await?;
        if session.ended_at.is_some() {
            return Err(ConductorError::Conflict(format!(
                "session {session_id} has already ended"
            )));
        }

        sessions::end(&mut tx, session_id, now, error).await?;
        let agent_status = match error {
            Some(message) if !message.is_empty() => AgentStatus::Error,
            _ => AgentStatus::Idle,
        };
        teams::set_agent_status(&mut tx, session.agent_id, agent_status).await?;
        events::append(
            &mut tx,
            &agent_stream(session.agent_id),
            &EventPayload::SessionEnded {
                session_id,
                agent_id: session.agent_id,
                task_id: session.task_id,
                cost: session.cost,
                error: error.map(str::to_string),
            },
            &EventMetadata::default(),
            now,
        )
        .await?;
        let ended = sessions::get(&mut tx, session_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("session", session_id))?;
        self.store.commit(tx).await?;
        tracing::info!(session_id, agent_id = %session.agent_id, error = ?error, "session_ended");
        Ok(ended)
    }

    /// Read-only view of the same caps `start_session` enforces.
    pub async fn check_budget(
        &self,
        agent_id: Uuid,
        task_id: Option<TaskId>,
    ) -> Result<BudgetStatus, ConductorError> {
        let now = self.clock.now();
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        let agent = require_agent(&mut conn, agent_id).await?;
        let team = teams::get_team(&mut conn, agent.team_id)
            .await?
            .ok_or_else(|| ConductorError::not_found("team", agent.team_id))?;
        let (daily_cap, task_cap) = self.caps_for(&team);

        let daily_spent =
            sessions::team_spend_since(&mut conn, team.id, now - Duration::hours(24)).await?;
        let task_spent = match task_id {
            Some(task) => sessions::task_spend(&mut conn, task).await?,
            None => Decimal::ZERO,
        };

        let over_daily = daily_cap.map(|cap| daily_spent >= cap).unwrap_or(false);
        let over_task = match (task_cap, task_id) {
            (Some(cap), Some(_)) => task_spent >= cap,
            _ => false,
        };
        Ok(BudgetStatus {
            daily_spent,
            daily_cap,
            task_spent,
            task_cap,
            over_budget: over_daily || over_task,
        })
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Session, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        require_session(&mut conn, session_id).await
    }

    pub async fn list_sessions(
        &self,
        agent_id: Option<Uuid>,
        task_id: Option<TaskId>,
    ) -> Result<Vec<Session>, ConductorError> {
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        sessions::list(&mut conn, agent_id, task_id, 50).await
    }

    /// Spend aggregation for the cost dashboard.
    pub async fn cost_summary(
        &self,
        team_id: Uuid,
        days: i64,
    ) -> Result<sessions::CostSummary, ConductorError> {
        let since = self.clock.now() - Duration::days(days);
        let mut conn = self.store.pool().acquire().await.map_err(storage)?;
        sessions::cost_summary(&mut conn, team_id, since).await
    }

    /// Team settings override the global `[budgets]` section.
    fn caps_for(&self, team: &Team) -> (Option<Decimal>, Option<Decimal>) {
        (
            team.settings
                .daily_cap
                .or(self.config.budgets.team_daily_cap),
            team.settings
                .per_task_cap
                .or(self.config.budgets.per_task_cap),
        )
    }

    /// Record the refusal as an event in its own transaction, then fail.
    async fn refuse(
        &self,
        agent_id: Uuid,
        task_id: Option<TaskId>,
        scope: BudgetScope,
        spent: Decimal,
        limit: Decimal,
    ) -> Result<Session, ConductorError> {
        let mut tx = self.store.begin().await?;
        events::append(
            &mut tx,
            &agent_stream(agent_id),
            &EventPayload::AgentBudgetExceeded {
                agent_id,
                task_id,
                scope,
                spent,
                limit,
            },
            &EventMetadata::default(),
            self.clock.now(),
        )
        .await?;
        self.store.commit(tx).await?;
        tracing::warn!(agent_id = %agent_id, scope = scope.as_str(), %spent, %limit, "budget_exceeded");
        Err(ConductorError::BudgetExceeded { scope, spent, limit })
    }
}

async fn require_agent(
    conn: &mut sqlx::SqliteConnection,
    agent_id: Uuid,
) -> Result<Agent, ConductorError> {
    teams::get_agent(conn, agent_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("agent", agent_id))
}

async fn require_session(
    conn: &mut sqlx::SqliteConnection,
    session_id: SessionId,
) -> Result<Session, ConductorError> {
    sessions::get(conn, session_id)
        .await?
        .ok_or_else(|| ConductorError::not_found("session", session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, harness_with, seed_team};
    use conductor_core::config::ModelPrice;

    fn dec(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    fn priced_config(daily_cap: &str) -> ConductorConfig {
        let mut config = ConductorConfig::default();
        config.budgets.team_daily_cap = Some(dec(daily_cap));
        config.prices.insert(
            "metered".to_string(),
            ModelPrice {
                input: dec("1.0"),
                output: dec("1.0"),
                cache_read: Decimal::ZERO,
                cache_write: Decimal::ZERO,
            },
        );
        config
    }

    #[tokio::test]
    async fn session_lifecycle_tracks_usage_and_agent_status() {
        let h = harness_with(priced_config("50")).await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let session = ledger
            .start_session(seed.engineer.id, Some(1), Some("metered"))
            .await
            .expect("start");
        assert_eq!(
            h.services
                .teams
                .get_agent(seed.engineer.id)
                .await
                .expect("agent")
                .status,
            AgentStatus::Working
        );

        let after_first = ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 500_000,
                    tokens_out: 100_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        assert_eq!(after_first.cost, dec("0.600000"));

        let after_second = ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 400_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        assert_eq!(after_second.counts.tokens_in, 900_000);
        assert!(after_second.cost >= after_first.cost, "cost regressed");

        let ended = ledger.end_session(session.id, None).await.expect("end");
        assert!(ended.ended_at.is_some());
        assert_eq!(
            h.services
                .teams
                .get_agent(seed.engineer.id)
                .await
                .expect("agent")
                .status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn one_open_session_per_agent() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let session = ledger
            .start_session(seed.engineer.id, None, None)
            .await
            .expect("first");
        let err = ledger
            .start_session(seed.engineer.id, None, None)
            .await
            .expect_err("second open session");
        assert!(matches!(err, ConductorError::Conflict(_)));

        ledger.end_session(session.id, None).await.expect("end");
        ledger
            .start_session(seed.engineer.id, None, None)
            .await
            .expect("after close");
    }

    #[tokio::test]
    async fn budget_refusal_at_exactly_the_cap() {
        let h = harness_with(priced_config("1.000000")).await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        // Spend 0.999999, one millionth below the cap.
        let session = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect("start");
        ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 999_999,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        ledger.end_session(session.id, None).await.expect("end");

        let under = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect("still under the cap");
        // Push the total to exactly 1.000000.
        ledger
            .record_usage(
                under.id,
                UsageDelta {
                    tokens_in: 1,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        ledger.end_session(under.id, None).await.expect("end");

        let err = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect_err("at the cap");
        match err {
            ConductorError::BudgetExceeded {
                scope,
                spent,
                limit,
            } => {
                assert_eq!(scope, BudgetScope::TeamDaily);
                assert_eq!(spent, dec("1.000000"));
                assert_eq!(limit, dec("1.000000"));
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }

        let mut conn = h.store.pool().acquire().await.expect("conn");
        let refusals =
            conductor_store::events::read_by_type(&mut conn, "agent.budget_exceeded", 0, 10)
                .await
                .expect("events");
        assert_eq!(refusals.len(), 1);
    }

    #[tokio::test]
    async fn daily_window_rolls_over() {
        let h = harness_with(priced_config("1.000000")).await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let session = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect("start");
        ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 1_000_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        ledger.end_session(session.id, None).await.expect("end");

        let err = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect_err("cap hit");
        assert!(matches!(err, ConductorError::BudgetExceeded { .. }));

        // 25 hours later the window has rolled past yesterday's spend.
        h.clock.advance(Duration::hours(25));
        ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect("fresh window");
    }

    #[tokio::test]
    async fn per_task_cap_fires_independently() {
        let mut config = priced_config("1000");
        config.budgets.per_task_cap = Some(dec("0.500000"));
        let h = harness_with(config).await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let session = ledger
            .start_session(seed.engineer.id, Some(7), Some("metered"))
            .await
            .expect("start");
        ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 500_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        ledger.end_session(session.id, None).await.expect("end");

        let err = ledger
            .start_session(seed.engineer.id, Some(7), Some("metered"))
            .await
            .expect_err("task cap");
        assert!(matches!(
            err,
            ConductorError::BudgetExceeded {
                scope: BudgetScope::PerTask,
                ..
            }
        ));
        // A different task is unaffected.
        ledger
            .start_session(seed.engineer.id, Some(8), Some("metered"))
            .await
            .expect("other task");
    }

    #[tokio::test]
    async fn unknown_model_prices_at_zero_with_a_flag_event() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let session = ledger
            .start_session(seed.engineer.id, None, Some("mystery-model"))
            .await
            .expect("start");
        let after = ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 1_000_000,
                    tokens_out: 1_000_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage never fails on unknown model");
        assert_eq!(after.cost, Decimal::ZERO);

        let mut conn = h.store.pool().acquire().await.expect("conn");
        let flags = conductor_store::events::read_by_type(&mut conn, "cost.unknown_model", 0, 10)
            .await
            .expect("events");
        assert_eq!(flags.len(), 1);
    }

    #[tokio::test]
    async fn negative_delta_is_validation() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let session = h
            .services
            .sessions
            .start_session(seed.engineer.id, None, None)
            .await
            .expect("start");
        let err = h
            .services
            .sessions
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_out: -5,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect_err("negative");
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[tokio::test]
    async fn failed_session_marks_the_agent_errored() {
        let h = harness().await;
        let seed = seed_team(&h.services.teams).await;
        let session = h
            .services
            .sessions
            .start_session(seed.engineer.id, None, None)
            .await
            .expect("start");
        h.services
            .sessions
            .end_session(session.id, Some("adapter crashed"))
            .await
            .expect("end with error");
        assert_eq!(
            h.services
                .teams
                .get_agent(seed.engineer.id)
                .await
                .expect("agent")
                .status,
            AgentStatus::Error
        );
    }

    #[tokio::test]
    async fn check_budget_matches_start_session_view() {
        let h = harness_with(priced_config("1.000000")).await;
        let seed = seed_team(&h.services.teams).await;
        let ledger = &h.services.sessions;

        let status = ledger
            .check_budget(seed.engineer.id, None)
            .await
            .expect("budget");
        assert!(!status.over_budget);
        assert_eq!(status.daily_remaining(), Some(dec("1.000000")));

        let session = ledger
            .start_session(seed.engineer.id, None, Some("metered"))
            .await
            .expect("start");
        ledger
            .record_usage(
                session.id,
                UsageDelta {
                    tokens_in: 1_000_000,
                    ..UsageDelta::default()
                },
            )
            .await
            .expect("usage");
        ledger.end_session(session.id, None).await.expect("end");

        let status = ledger
            .check_budget(seed.engineer.id, None)
            .await
            .expect("budget");
        assert!(status.over_budget);
        assert_eq!(status.daily_remaining(), Some(Decimal::ZERO));
    }
}
