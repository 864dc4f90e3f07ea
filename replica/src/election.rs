use futures::{stream::FuturesUnordered, StreamExt};
use std::sync::Arc;

use crate::{msg::Role, transport::bounded, ReplicaNode};

impl ReplicaNode {
    /// Bully-style bid for leadership. Returns whether this node leads
    /// afterwards.
    ///
    /// Only peers ranked above this node are probed. Any affirmative answer
    /// means a live, better candidate exists and the bid is dropped.
    pub async fn initiate_election(&self) -> bool {
        let _gate = self.election_gate.lock().await;
        if self.is_leader() {
            return true;
        }

        let higher: Vec<_> = self.config.higher_ranked_peers().collect();
        if higher.is_empty() {
            tracing::info!("{} has no higher-ranked peer", self.config.id);
            self.become_leader().await;
            return true;
        }

        tracing::info!(
            "{} starting election against {} higher-ranked peers",
            self.config.id,
            higher.len()
        );
        let limit = self.config.timing.probe_timeout();
        let mut probes: FuturesUnordered<_> = higher
            .iter()
            .map(|peer| async move {
                let call = self.peers.request_election(&peer.address, &self.config.address);
                (peer, bounded(&peer.address, limit, call).await)
            })
            .collect();
        while let Some((peer, answer)) = probes.next().await {
            match answer {
                Ok(true) => {
                    tracing::info!(
                        "{} yields to higher-ranked {} ({})",
                        self.config.id,
                        peer.id,
                        peer.address
                    );
                    return false;
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("{} election probe failed: {e}", self.config.id),
            }
        }
        drop(probes);

        self.become_leader().await;
        true
    }

    /// Takes the leader role, reconciles the store with peers, then
    /// announces. Writes wait on the write gate until the store is merged.
    async fn become_leader(&self) {
        {
            let _writes = self.write_gate.lock().await;
            {
                let mut leadership = self.leadership();
                leadership.role = Role::Leader;
                leadership.leader_address = Some(self.config.address.clone());
            }
            tracing::info!(
                "{} elected as leader at {}",
                self.config.id,
                self.config.address
            );
            match self.synchronize().await {
                Ok(outcome) => tracing::info!("{} sync: {outcome}", self.config.id),
                Err(e) => tracing::error!("{} sync failed: {e}", self.config.id),
            }
        }

        // Someone else may have announced while we were syncing.
        if !self.is_leader() {
            tracing::info!("{} lost leadership during sync", self.config.id);
            return;
        }
        self.announce_leadership().await;
    }

    async fn announce_leadership(&self) {
        let limit = self.config.timing.probe_timeout();
        let announcements = self.config.peers.iter().map(|peer| async move {
            let call = self.peers.set_leader(&peer.address, &self.config.address);
            if let Err(e) = bounded(&peer.address, limit, call).await {
                tracing::debug!("{} announcement skipped: {e}", self.config.id);
            }
        });
        futures::future::join_all(announcements).await;
    }

    /// Answers an election probe from `candidate`.
    ///
    /// A leader that tells a candidate to stand down also re-announces
    /// itself to it, since a restarted node otherwise never learns who
    /// leads.
    pub fn receive_election_request(&self, candidate: &str) -> bool {
        self.liveness().record(candidate);
        let candidate_rank = self.config.rank_of(candidate).unwrap_or(0);
        let affirmative = self
            .config
            .election_reply
            .affirmative(self.config.id, candidate_rank);
        tracing::debug!(
            "{} election request from {candidate} (rank {candidate_rank}): {affirmative}",
            self.config.id
        );
        if affirmative && self.is_leader() {
            let peers = Arc::clone(&self.peers);
            let candidate = candidate.to_string();
            let leader = self.config.address.clone();
            let limit = self.config.timing.probe_timeout();
            tokio::spawn(async move {
                let call = peers.set_leader(&candidate, &leader);
                if let Err(e) = bounded(&candidate, limit, call).await {
                    tracing::debug!("Re-announcement to {candidate} failed: {e}");
                }
            });
        }
        affirmative
    }
}
