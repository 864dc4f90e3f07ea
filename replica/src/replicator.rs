use futures::{stream::FuturesUnordered, StreamExt};

use crate::{error::ChatError, op::Operation, transport::bounded, ReplicaNode};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QuorumOutcome {
    pub acks: usize,
    pub required: usize,
}

impl QuorumOutcome {
    pub fn reached(&self) -> bool {
        self.acks >= self.required
    }
}

impl ReplicaNode {
    /// Fans `operation` out to every peer and counts acknowledgements,
    /// returning as soon as the quorum threshold is met. Calls still in
    /// flight at that point are dropped; those peers catch up at the next
    /// election. Failed or slow peers are never retried.
    pub async fn replicate(&self, operation: &Operation) -> QuorumOutcome {
        let required = self.config.quorum_threshold;
        let encoded = match operation.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("{} cannot encode {}: {e}", self.config.id, operation.kind());
                return QuorumOutcome { acks: 0, required };
            }
        };

        let limit = self.config.timing.replication_timeout();
        let mut pending: FuturesUnordered<_> = self
            .config
            .peers
            .iter()
            .map(|peer| {
                let call = self.peers.replicate_operation(&peer.address, encoded.clone());
                async move { (peer, bounded(&peer.address, limit, call).await) }
            })
            .collect();

        let mut acks = 0;
        while let Some((peer, result)) = pending.next().await {
            match result {
                Ok(true) => {
                    acks += 1;
                    if acks >= required {
                        break;
                    }
                }
                Ok(false) => tracing::debug!("{} refused {}", peer.address, operation.kind()),
                Err(e) => tracing::debug!("{} replication skipped: {e}", self.config.id),
            }
        }
        QuorumOutcome { acks, required }
    }

    /// Replicates, then applies locally only if the quorum was reached.
    /// Callers hold the write gate. A node that is no longer leader by the
    /// time it gets here sends nothing.
    pub(crate) async fn commit(&self, operation: &Operation) -> Result<(), ChatError> {
        self.ensure_leader()?;
        let outcome = self.replicate(operation).await;
        if !outcome.reached() {
            tracing::warn!(
                "{} could not replicate {}: {}/{} acks",
                self.config.id,
                operation.kind(),
                outcome.acks,
                outcome.required
            );
            return Err(ChatError::ReplicationFailed {
                acks: outcome.acks,
                required: outcome.required,
            });
        }
        operation.apply(&mut self.store())?;
        tracing::debug!(
            "{} committed {} with {} acks",
            self.config.id,
            operation.kind(),
            outcome.acks
        );
        Ok(())
    }
}
