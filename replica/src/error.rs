use std::io;

use crate::msg::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("Hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Node {0} is not in the cluster configuration")]
    UnknownNode(NodeId),
}

/// Failure of one call to one peer. Callers treat every variant as "peer
/// currently unreachable" and never propagate it.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Peer {0} timed out")]
    Timeout(String),

    #[error("Peer {peer} failed to serve the call: {reason}")]
    Remote { peer: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Not leader, current leader is {}", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("Failed to replicate ({acks}/{required} acks)")]
    ReplicationFailed { acks: usize, required: usize },

    #[error("{0}")]
    Validation(String),

    #[error("Username already exists")]
    AlreadyExists,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("User not subscribed to instant messages")]
    NotSubscribed,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Password error: {0}")]
    Password(#[from] PasswordError),
}

impl ChatError {
    /// Address a rejected caller should retry against, if one is known.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            ChatError::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }
}
