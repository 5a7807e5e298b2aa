//! Shared fixtures for service tests: an in-memory store, a manual clock and
//! a seeded org/team/agent trio.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use conductor_core::ConductorConfig;
use conductor_core::team::{Agent, AgentRole, AgentStatus};
use conductor_store::{NotifyHub, Store};
use uuid::Uuid;

use crate::clock::ManualClock;
use crate::{Services, TeamService};

pub(crate) struct Harness {
    pub services: Services,
    pub store: Store,
    pub notify: NotifyHub,
    pub clock: Arc<ManualClock>,
}

pub(crate) async fn harness() -> Harness {
    harness_with(ConductorConfig::default()).await
}

pub(crate) async fn harness_with(config: ConductorConfig) -> Harness {
    let store = Store::in_memory().await.expect("in-memory store");
    let notify = NotifyHub::default();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let services = Services::new(
        store.clone(),
        notify.clone(),
        clock.clone(),
        Arc::new(config),
    );
    Harness {
        services,
        store,
        notify,
        clock,
    }
}

pub(crate) struct Seed {
    pub org_id: Uuid,
    pub team_id: Uuid,
    pub manager: Agent,
    pub engineer: Agent,
}

/// One org, one team (with its auto-created manager) and one engineer.
pub(crate) async fn seed_team(teams: &TeamService) -> Seed {
    let org = teams.create_org("Acme", "acme").await.expect("org");
    let (team, manager) = teams
        .create_team(org.id, "Core", "core")
        .await
        .expect("team");
    let engineer = teams
        .create_agent(team.id, "e1", AgentRole::Engineer, None, None)
        .await
        .expect("engineer");
    assert_eq!(engineer.status, AgentStatus::Idle);
    Seed {
        org_id: org.id,
        team_id: team.id,
        manager,
        engineer,
    }
}
