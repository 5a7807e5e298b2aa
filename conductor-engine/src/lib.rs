//! The seven core services of the Conductor orchestration backbone.
//!
//! Each service owns one entity family and is the only writer for it; every
//! mutation runs in a single store transaction that also appends the
//! matching event, and notifications go out only after commit. Services are
//! cheap to clone and share the store pool, the notify hub and the clock.

use std::sync::Arc;

use conductor_core::ConductorConfig;
use conductor_store::{NotifyHub, Store};

pub mod clock;
pub mod human_loop;
pub mod message_bus;
pub mod review;
pub mod session_ledger;
pub mod task_engine;
pub mod team;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use human_loop::HumanLoop;
pub use message_bus::MessageBus;
pub use review::ReviewCoordinator;
pub use session_ledger::{BudgetStatus, SessionLedger};
pub use task_engine::TaskEngine;
pub use team::TeamService;

/// Bundle of all services wired to one store, hub, clock and config.
#[derive(Clone)]
pub struct Services {
    pub teams: TeamService,
    pub tasks: TaskEngine,
    pub messages: MessageBus,
    pub humans: HumanLoop,
    pub reviews: ReviewCoordinator,
    pub sessions: SessionLedger,
}

impl Services {
    pub fn new(
        store: Store,
        notify: NotifyHub,
        clock: Arc<dyn Clock>,
        config: Arc<ConductorConfig>,
    ) -> Self {
        Self {
            teams: TeamService::new(store.clone(), clock.clone()),
            tasks: TaskEngine::new(
                store.clone(),
                notify.clone(),
                clock.clone(),
                config.branching.clone(),
            ),
            humans: HumanLoop::new(store.clone(), notify.clone(), clock.clone()),
            reviews: ReviewCoordinator::new(store.clone(), notify.clone(), clock.clone()),
            sessions: SessionLedger::new(store.clone(), clock.clone(), config),
            messages: MessageBus::new(store, notify, clock),
        }
    }
}
