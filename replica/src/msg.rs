use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::ChatError;

pub type NodeId = u64;
pub type MessageId = u64;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
/// A follower starts an election once its leader has been silent this long.
pub const LEADER_TIMEOUT: Duration = Duration::from_millis(3000);
/// Upper bound on a single heartbeat, election or snapshot call.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const REPLICATION_TIMEOUT: Duration = Duration::from_millis(1000);
pub const SUBSCRIPTION_POLL: Duration = Duration::from_millis(1000);

/// Peer acks required before the leader applies a write. Fixed, independent
/// of cluster size: tolerating f failures by majority needs floor(N/2)+1.
pub const DEFAULT_QUORUM_THRESHOLD: usize = 2;
/// Peer snapshots a new leader collects before merging.
pub const DEFAULT_SYNC_QUORUM: usize = 2;
pub const DEFAULT_READ_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// A message as handed to clients, either pulled or pushed live.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Success half of every chat RPC reply. Failures are carried by [`ChatError`]
/// and convert into the same shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub success: bool,
    pub message: String,
}

impl ChatReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

impl From<ChatError> for ChatReply {
    fn from(err: ChatError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LoginReply {
    pub message: String,
    pub unread_count: usize,
}

///////////////////////////////////////////////////
// The rest of this module supports local testing.
///////////////////////////////////////////////////
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaSummary {
    pub id: NodeId,
    pub address: String,
    pub role: Role,
    pub leader_address: Option<String>,
    pub usernames: Vec<String>,
    pub message_ids: Vec<MessageId>,
}

impl ReplicaSummary {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
