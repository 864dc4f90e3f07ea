use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio::time;

use crate::{error::PeerError, store::Snapshot};

/// Client side of the peer-to-peer RPCs. Every call names the target peer
/// by its configured address.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn heartbeat(&self, peer: &str, sender: &str) -> Result<(), PeerError>;

    /// Ok(true) means the peer answered the probe affirmatively.
    async fn request_election(&self, peer: &str, sender: &str) -> Result<bool, PeerError>;

    async fn set_leader(&self, peer: &str, leader: &str) -> Result<(), PeerError>;

    /// Ok(true) is an acknowledgement: the peer has applied the operation.
    async fn replicate_operation(&self, peer: &str, operation: Vec<u8>)
        -> Result<bool, PeerError>;

    async fn get_state(&self, peer: &str) -> Result<Snapshot, PeerError>;
}

/// Runs one peer call under `limit`. Expiry becomes [`PeerError::Timeout`].
pub async fn bounded<T, F>(peer: &str, limit: Duration, call: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PeerError::Timeout(peer.to_string())),
    }
}
