use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;

pub type SessionId = i64;

/// Cumulative token counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read: i64,
    pub cache_write: i64,
}

impl TokenCounts {
    pub fn add(&mut self, delta: &UsageDelta) {
        self.tokens_in += delta.tokens_in;
        self.tokens_out += delta.tokens_out;
        self.cache_read += delta.cache_read;
        self.cache_write += delta.cache_write;
    }
}

/// One usage report from an adapter run. All fields must be non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read: i64,
    pub cache_write: i64,
}

impl UsageDelta {
    pub fn is_non_negative(&self) -> bool {
        self.tokens_in >= 0 && self.tokens_out >= 0 && self.cache_read >= 0 && self.cache_write >= 0
    }
}

/// One agent work unit. At most one session per agent is open
/// (`ended_at` null) at any time; cost only grows until the session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: Uuid,
    pub task_id: Option<TaskId>,
    pub model: String,
    pub counts: TokenCounts,
    pub cost: Decimal,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_deltas() {
        let mut counts = TokenCounts::default();
        counts.add(&UsageDelta {
            tokens_in: 100,
            tokens_out: 40,
            cache_read: 0,
            cache_write: 10,
        });
        counts.add(&UsageDelta {
            tokens_in: 5,
            tokens_out: 5,
            cache_read: 2,
            cache_write: 0,
        });
        assert_eq!(counts.tokens_in, 105);
        assert_eq!(counts.tokens_out, 45);
        assert_eq!(counts.cache_read, 2);
        assert_eq!(counts.cache_write, 10);
    }

    #[test]
    fn negative_delta_is_detected() {
        let delta = UsageDelta {
            tokens_in: -1,
            ..UsageDelta::default()
        };
        assert!(!delta.is_non_negative());
        assert!(UsageDelta::default().is_non_negative());
    }
}
