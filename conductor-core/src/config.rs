use std::collections::HashMap;
use std::path::PathBuf;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::session::TokenCounts;

/// Top-level configuration loaded from TOML by the daemon. Every section has
/// serde defaults so a minimal file (or none at all) yields a working setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub human_loop: HumanLoopConfig,
    pub merge: MergeConfig,
    pub budgets: BudgetConfig,
    /// Price schedule per model, currency per million tokens.
    pub prices: HashMap<String, ModelPrice>,
    pub branching: BranchingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("conductor.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent_turns: usize,
    pub fallback_poll_interval_seconds: u64,
    pub turn_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_turns: 32,
            fallback_poll_interval_seconds: 30,
            turn_timeout_seconds: 3600,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanLoopConfig {
    pub expiry_poll_interval_seconds: u64,
}

impl Default for HumanLoopConfig {
    fn default() -> Self {
        Self {
            expiry_poll_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub job_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            job_timeout_seconds: 600,
            poll_interval_seconds: 5,
        }
    }
}

/// Global budget caps; absent means unlimited. Team settings override these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub team_daily_cap: Option<Decimal>,
    pub per_task_cap: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchingConfig {
    pub prefix: String,
    pub slug_max_length: usize,
}

impl Default for BranchingConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            slug_max_length: 50,
        }
    }
}

/// Per-model rates in currency per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPrice {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_read: Decimal,
    pub cache_write: Decimal,
}

const TOKENS_PER_UNIT: i64 = 1_000_000;

/// Fixed-point cost scale: six fractional digits, rounded toward positive
/// infinity at record time.
pub const COST_SCALE: u32 = 6;

impl ModelPrice {
    pub fn cost_of(&self, counts: &TokenCounts) -> Decimal {
        let raw = Decimal::from(counts.tokens_in) * self.input
            + Decimal::from(counts.tokens_out) * self.output
            + Decimal::from(counts.cache_read) * self.cache_read
            + Decimal::from(counts.cache_write) * self.cache_write;
        (raw / Decimal::from(TOKENS_PER_UNIT))
            .round_dp_with_strategy(COST_SCALE, RoundingStrategy::ToPositiveInfinity)
    }
}

impl ConductorConfig {
    /// `None` for unknown models; the ledger prices those at zero and flags
    /// the session with a `cost.unknown_model` event.
    pub fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        self.prices.get(model)
    }
}
