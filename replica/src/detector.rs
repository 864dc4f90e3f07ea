use ahash::{HashMap, HashMapExt};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{msg::Role, transport::bounded, ReplicaNode};

/// Last time each peer was heard from. Only a staleness signal; never
/// persisted.
#[derive(Debug)]
pub struct PeerLiveness {
    last_seen: HashMap<String, Option<Instant>>,
}

impl PeerLiveness {
    pub fn new(peers: impl IntoIterator<Item = String>) -> Self {
        let mut last_seen = HashMap::new();
        for peer in peers {
            last_seen.insert(peer, None);
        }
        Self { last_seen }
    }

    pub fn record(&mut self, peer: &str) {
        self.last_seen.insert(peer.to_string(), Some(Instant::now()));
    }

    pub fn last_seen(&self, peer: &str) -> Option<Instant> {
        self.last_seen.get(peer).copied().flatten()
    }

    /// A peer never heard from is always stale.
    pub fn is_stale(&self, peer: &str, timeout: Duration) -> bool {
        match self.last_seen(peer) {
            Some(at) => at.elapsed() > timeout,
            None => true,
        }
    }
}

impl ReplicaNode {
    /// Heartbeat and failure-detection loop. Runs until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("{} starting at {}", self.config.id, self.config.address);
        let mut interval = time::interval(self.config.timing.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("{} shutting down", self.config.id);
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One detector cycle: probe every peer, then decide whether the leader
    /// has been lost.
    pub async fn tick(&self) {
        self.broadcast_heartbeats().await;
        if self.leader_lost() {
            self.initiate_election().await;
        }
    }

    async fn broadcast_heartbeats(&self) {
        let limit = self.config.timing.probe_timeout();
        let probes = self.config.peers.iter().map(|peer| async move {
            let call = self.peers.heartbeat(&peer.address, &self.config.address);
            if let Err(e) = bounded(&peer.address, limit, call).await {
                tracing::trace!("{} heartbeat skipped: {e}", self.config.id);
            }
        });
        join_all(probes).await;
    }

    fn leader_lost(&self) -> bool {
        let mut leadership = self.leadership();
        if leadership.role == Role::Leader {
            return false;
        }
        let Some(leader) = leadership.leader_address.clone() else {
            tracing::debug!("{} knows no leader", self.config.id);
            return true;
        };
        if leader == self.config.address {
            leadership.role = Role::Leader;
            return false;
        }
        drop(leadership);
        let stale = self
            .liveness()
            .is_stale(&leader, self.config.timing.leader_timeout());
        if stale {
            tracing::info!("{} lost contact with leader {leader}", self.config.id);
        }
        stale
    }
}
