use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

use quorumchat_replica::{
    error::PeerError, store::Snapshot, transport::PeerClient, ReplicaNode,
};

#[derive(Default)]
struct Link {
    /// None while the node is dead.
    node: Option<Arc<ReplicaNode>>,
    is_disconnected: bool,
}

/// In-process stand-in for the network between replicas. A call is
/// delivered only when both ends are running and connected.
#[derive(Default)]
pub struct LocalNetwork {
    links: RwLock<HashMap<String, Link>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
        })
    }

    pub fn attach(&self, address: &str, node: Arc<ReplicaNode>) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        links.entry(address.to_string()).or_default().node = Some(node);
    }

    pub fn detach(&self, address: &str) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = links.get_mut(address) {
            link.node = None;
        }
    }

    pub fn set_disconnected(&self, address: &str, is_disconnected: bool) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        links.entry(address.to_string()).or_default().is_disconnected = is_disconnected;
    }

    /// The running node at `address`, whether or not it is connected.
    pub fn node(&self, address: &str) -> Option<Arc<ReplicaNode>> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        links.get(address).and_then(|link| link.node.clone())
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<ReplicaNode>, PeerError> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let reachable = |address: &str| {
            links
                .get(address)
                .filter(|link| !link.is_disconnected)
                .and_then(|link| link.node.clone())
        };
        if reachable(from).is_none() {
            return Err(PeerError::Unreachable(to.to_string()));
        }
        reachable(to).ok_or_else(|| PeerError::Unreachable(to.to_string()))
    }
}

/// Peer client handed to one replica: every call it makes originates at
/// `from`.
pub struct LocalPeerClient {
    from: String,
    network: Arc<LocalNetwork>,
}

impl LocalPeerClient {
    pub fn new(from: impl Into<String>, network: Arc<LocalNetwork>) -> Self {
        Self {
            from: from.into(),
            network,
        }
    }

    async fn deliver(&self, to: &str) -> Result<Arc<ReplicaNode>, PeerError> {
        let node = self.network.route(&self.from, to)?;
        // Hand the scheduler a turn, as a real round trip would.
        tokio::task::yield_now().await;
        Ok(node)
    }
}

#[async_trait]
impl PeerClient for LocalPeerClient {
    async fn heartbeat(&self, peer: &str, sender: &str) -> Result<(), PeerError> {
        self.deliver(peer).await?.receive_heartbeat(sender);
        Ok(())
    }

    async fn request_election(&self, peer: &str, sender: &str) -> Result<bool, PeerError> {
        Ok(self.deliver(peer).await?.receive_election_request(sender))
    }

    async fn set_leader(&self, peer: &str, leader: &str) -> Result<(), PeerError> {
        self.deliver(peer).await?.receive_set_leader(leader);
        Ok(())
    }

    async fn replicate_operation(
        &self,
        peer: &str,
        operation: Vec<u8>,
    ) -> Result<bool, PeerError> {
        Ok(self.deliver(peer).await?.receive_operation(&operation))
    }

    async fn get_state(&self, peer: &str) -> Result<Snapshot, PeerError> {
        self.deliver(peer)
            .await?
            .receive_get_state()
            .map_err(|e| PeerError::Remote {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}
