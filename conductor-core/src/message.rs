use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;

pub type MessageId = i64;

/// Both agents and humans send and receive messages; the kind tells the
/// dispatcher whether an inbox belongs to a runnable agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Agent,
    User,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Agent => "agent",
            ActorKind::User => "user",
        }
    }
}

impl std::str::FromStr for ActorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "agent" => Ok(ActorKind::Agent),
            "user" => Ok(ActorKind::User),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: Uuid,
    pub kind: ActorKind,
}

impl ActorRef {
    pub fn agent(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorKind::Agent,
        }
    }

    pub fn user(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorKind::User,
        }
    }
}

/// A durable inbox entry. Never deleted; the three timestamps only move
/// forward: delivered (set on insert), seen, processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub team_id: Uuid,
    pub sender: ActorRef,
    pub recipient: ActorRef,
    pub task_id: Option<TaskId>,
    pub content: String,
    pub delivered_at: DateTime<Utc>,
    pub seen_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_kind_round_trips() {
        assert_eq!("agent".parse::<ActorKind>(), Ok(ActorKind::Agent));
        assert_eq!(ActorKind::User.as_str(), "user");
        assert!("service".parse::<ActorKind>().is_err());
    }
}
