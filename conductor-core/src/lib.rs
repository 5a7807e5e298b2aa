//! Domain model for the Conductor orchestration backbone.
//!
//! This crate holds the entities shared by every other crate: tasks and the
//! task state machine, teams and agents, messages, reviews and merge jobs,
//! sessions, human requests, the event taxonomy, the error taxonomy, and the
//! runtime configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod human;
pub mod message;
pub mod review;
pub mod session;
pub mod task;
pub mod team;

pub use config::ConductorConfig;
pub use error::ConductorError;
