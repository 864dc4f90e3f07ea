use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod chat;
pub mod config;
pub mod detector;
pub mod election;
pub mod error;
pub mod msg;
pub mod op;
pub mod password;
pub mod replicator;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod transport;

use config::NodeConfig;
use detector::PeerLiveness;
use error::{ChatError, StoreError};
use msg::{ReplicaSummary, Role};
use op::Operation;
use password::{Bcrypt, PasswordHasher};
use store::{Snapshot, Store};
use subscriptions::SubscriptionRegistry;
use transport::PeerClient;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Leadership {
    pub role: Role,
    /// Last leader this node heard about, possibly itself.
    pub leader_address: Option<String>,
}

/// One member of the replicated message store.
///
/// Serves both the chat surface (see [`chat`]) and the peer surface (the
/// `receive_*` handlers below). All shared state lives here behind its own
/// lock: role and leader address, peer liveness, subscriptions and the store.
/// No std lock is held across an await.
pub struct ReplicaNode {
    config: NodeConfig,
    peers: Arc<dyn PeerClient>,
    hasher: Arc<dyn PasswordHasher>,
    leadership: Mutex<Leadership>,
    liveness: Mutex<PeerLiveness>,
    subscriptions: Arc<SubscriptionRegistry>,
    store: Mutex<Store>,
    /// Serializes elections on this node.
    election_gate: tokio::sync::Mutex<()>,
    /// Held from id assignment through local apply, so writes commit in the
    /// order the leader assigned them.
    write_gate: tokio::sync::Mutex<()>,
}

impl ReplicaNode {
    /// Opens (or creates) the node's store under its data directory.
    pub fn new(config: NodeConfig, peers: Arc<dyn PeerClient>) -> Result<Self, StoreError> {
        let store = Store::open(config.store_path())?;
        let hasher = Arc::new(Bcrypt::new(config.password_cost));
        Ok(Self::with_store(config, store, peers, hasher))
    }

    pub fn with_store(
        config: NodeConfig,
        store: Store,
        peers: Arc<dyn PeerClient>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        let liveness = PeerLiveness::new(config.peers.iter().map(|p| p.address.clone()));
        Self {
            config,
            peers,
            hasher,
            leadership: Mutex::new(Leadership {
                role: Role::Follower,
                leader_address: None,
            }),
            liveness: Mutex::new(liveness),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            store: Mutex::new(store),
            election_gate: tokio::sync::Mutex::new(()),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> msg::NodeId {
        self.config.id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.leadership().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn leader_address(&self) -> Option<String> {
        self.leadership().leader_address.clone()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    fn leadership(&self) -> MutexGuard<'_, Leadership> {
        self.leadership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn liveness(&self) -> MutexGuard<'_, PeerLiveness> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_leader(&self) -> Result<(), ChatError> {
        let leadership = self.leadership();
        if leadership.role == Role::Leader {
            Ok(())
        } else {
            Err(ChatError::NotLeader {
                leader: leadership.leader_address.clone(),
            })
        }
    }

    // Replication service handlers. Each records the caller as alive where
    // the protocol says so and never fails.

    pub fn receive_heartbeat(&self, sender: &str) {
        tracing::trace!("{} heartbeat from {sender}", self.config.id);
        self.liveness().record(sender);
    }

    pub fn receive_set_leader(&self, leader: &str) {
        let stepped_down = {
            let mut leadership = self.leadership();
            let was_leader = leadership.role == Role::Leader;
            leadership.leader_address = Some(leader.to_string());
            leadership.role = if leader == self.config.address {
                Role::Leader
            } else {
                Role::Follower
            };
            was_leader && leadership.role == Role::Follower
        };
        self.liveness().record(leader);
        tracing::info!("{} now follows leader {leader}", self.config.id);
        if stepped_down {
            let dropped = self.subscriptions.clear();
            tracing::info!(
                "{} stepped down, closed {dropped} subscriptions",
                self.config.id
            );
        }
    }

    /// Applies a replicated operation immediately. The returned flag is the
    /// acknowledgement sent back to the leader.
    pub fn receive_operation(&self, encoded: &[u8]) -> bool {
        let operation = match Operation::decode(encoded) {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!("{} rejected undecodable operation: {e}", self.config.id);
                return false;
            }
        };
        match operation.apply(&mut self.store()) {
            Ok(()) => {
                tracing::debug!("{} applied {}", self.config.id, operation.kind());
                true
            }
            Err(e) => {
                tracing::error!(
                    "{} failed to apply {}: {e}",
                    self.config.id,
                    operation.kind()
                );
                false
            }
        }
    }

    pub fn receive_get_state(&self) -> Result<Snapshot, StoreError> {
        self.store().snapshot().inspect_err(|e| {
            tracing::error!("{} cannot read its store: {e}", self.config.id);
        })
    }

    pub fn summary(&self) -> ReplicaSummary {
        let leadership = self.leadership().clone();
        let store = self.store();
        ReplicaSummary {
            id: self.config.id,
            address: self.config.address.clone(),
            role: leadership.role,
            leader_address: leadership.leader_address,
            usernames: store.usernames_matching("").unwrap_or_default(),
            message_ids: store.message_ids().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake peer transport with per-peer up/down switches.

    use ahash::{HashMap, HashMapExt};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use crate::{
        config::{ClusterConfig, NodeConfig, ServerEntry, Timing},
        error::PeerError,
        op::Operation,
        password::Bcrypt,
        store::{Snapshot, Store},
        transport::PeerClient,
        ReplicaNode,
    };

    #[derive(Clone, Debug, Default)]
    pub struct FakePeer {
        pub alive: bool,
        pub election_ok: bool,
        pub snapshot: Snapshot,
    }

    #[derive(Default)]
    pub struct FakePeers {
        pub peers: Mutex<HashMap<String, FakePeer>>,
        pub replicated: Mutex<Vec<(String, Operation)>>,
        pub announcements: Mutex<Vec<(String, String)>>,
    }

    impl FakePeers {
        pub fn new(addresses: &[&str]) -> Self {
            let mut peers = HashMap::new();
            for address in addresses {
                peers.insert(
                    address.to_string(),
                    FakePeer {
                        alive: true,
                        ..FakePeer::default()
                    },
                );
            }
            Self {
                peers: Mutex::new(peers),
                ..Self::default()
            }
        }

        pub fn set_alive(&self, address: &str, alive: bool) {
            self.peers.lock().unwrap().get_mut(address).unwrap().alive = alive;
        }

        pub fn set_election_ok(&self, address: &str, ok: bool) {
            self.peers.lock().unwrap().get_mut(address).unwrap().election_ok = ok;
        }

        pub fn set_snapshot(&self, address: &str, snapshot: Snapshot) {
            self.peers.lock().unwrap().get_mut(address).unwrap().snapshot = snapshot;
        }

        fn reachable(&self, address: &str) -> Result<FakePeer, PeerError> {
            match self.peers.lock().unwrap().get(address) {
                Some(peer) if peer.alive => Ok(peer.clone()),
                _ => Err(PeerError::Unreachable(address.to_string())),
            }
        }
    }

    #[async_trait]
    impl PeerClient for FakePeers {
        async fn heartbeat(&self, peer: &str, _sender: &str) -> Result<(), PeerError> {
            self.reachable(peer).map(|_| ())
        }

        async fn request_election(&self, peer: &str, _sender: &str) -> Result<bool, PeerError> {
            Ok(self.reachable(peer)?.election_ok)
        }

        async fn set_leader(&self, peer: &str, leader: &str) -> Result<(), PeerError> {
            self.reachable(peer)?;
            self.announcements
                .lock()
                .unwrap()
                .push((peer.to_string(), leader.to_string()));
            Ok(())
        }

        async fn replicate_operation(
            &self,
            peer: &str,
            operation: Vec<u8>,
        ) -> Result<bool, PeerError> {
            self.reachable(peer)?;
            let operation = Operation::decode(&operation).unwrap();
            self.replicated
                .lock()
                .unwrap()
                .push((peer.to_string(), operation));
            Ok(true)
        }

        async fn get_state(&self, peer: &str) -> Result<Snapshot, PeerError> {
            Ok(self.reachable(peer)?.snapshot)
        }
    }

    pub fn five_node_cluster() -> ClusterConfig {
        let servers = (7..=11)
            .map(|id| ServerEntry {
                id,
                address: format!("127.0.0.1:500{}", 50 + id),
            })
            .collect();
        let mut cluster = ClusterConfig::new(servers);
        cluster.timing = Timing {
            heartbeat_interval_ms: 20,
            leader_timeout_ms: 60,
            probe_timeout_ms: 50,
            replication_timeout_ms: 50,
            subscription_poll_ms: 20,
        };
        cluster
    }

    /// Node `id` of the five-node cluster, wired to fake peers that are all up.
    pub fn node(id: u64) -> (Arc<ReplicaNode>, Arc<FakePeers>) {
        let cluster = five_node_cluster();
        let config = NodeConfig::for_server(&cluster, id, "/unused").unwrap();
        let addresses: Vec<&str> = config.peers.iter().map(|p| p.address.as_str()).collect();
        let peers = Arc::new(FakePeers::new(&addresses));
        let node = ReplicaNode::with_store(
            config,
            Store::in_memory().unwrap(),
            peers.clone(),
            Arc::new(Bcrypt::new(crate::password::MIN_COST)),
        );
        (Arc::new(node), peers)
    }

    pub fn address(id: u64) -> String {
        format!("127.0.0.1:500{}", 50 + id)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{address, node};
    use super::*;

    #[test]
    fn set_leader_assigns_role_by_address() {
        let (n, _) = node(9);
        n.receive_set_leader(&address(11));
        assert_eq!(n.role(), Role::Follower);
        assert_eq!(n.leader_address(), Some(address(11)));

        n.receive_set_leader(&address(9));
        assert!(n.is_leader());
    }

    #[tokio::test]
    async fn stepping_down_closes_subscriptions() {
        let (n, _) = node(9);
        n.receive_set_leader(&address(9));
        let mut bob = n.subscribe("bob").unwrap();
        n.receive_set_leader(&address(11));
        assert_eq!(bob.next().await, None);
        assert!(n.subscriptions().is_empty());
    }

    #[test]
    fn receive_operation_acks_valid_records_only() {
        let (n, _) = node(8);
        let op = Operation::CreateAccount {
            username: "alice".to_string(),
            password_digest: vec![1, 2, 3],
        };
        assert!(n.receive_operation(&op.encode().unwrap()));
        assert!(n.receive_operation(&op.encode().unwrap()));
        assert!(!n.receive_operation(b"\xff\xff\xff\xff"));
        assert_eq!(n.receive_get_state().unwrap().accounts.len(), 1);
    }

    #[test]
    fn refused_operation_leaves_no_partial_state() {
        let (n, _) = node(8);
        let ops = [
            Operation::CreateAccount {
                username: "alice".to_string(),
                password_digest: vec![1],
            },
            Operation::SendMessage {
                id: 1,
                sender: "alice".to_string(),
                recipient: "bob".to_string(),
                body: "hi".to_string(),
                timestamp: 0,
            },
        ];
        for op in &ops {
            assert!(n.receive_operation(&op.encode().unwrap()));
        }
        n.store()
            .execute_batch(
                "CREATE TRIGGER full_disk BEFORE DELETE ON accounts
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        let delete = Operation::DeleteAccount {
            username: "alice".to_string(),
        };
        assert!(!n.receive_operation(&delete.encode().unwrap()));
        let state = n.receive_get_state().unwrap();
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(state.messages.len(), 1);
    }
}
