use std::fmt;

use crate::{
    error::StoreError,
    msg::MessageId,
    store::Snapshot,
    transport::bounded,
    ReplicaNode,
};

/// What one synchronizer run did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncOutcome {
    /// Peers whose snapshot was collected, in the order they answered.
    pub responders: Vec<String>,
    /// False when too few peers answered and the merge was skipped.
    pub merged: bool,
    pub imported_accounts: usize,
    pub imported_messages: usize,
    pub next_message_id: Option<MessageId>,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.merged {
            return write!(
                f,
                "skipped, only {} peers answered",
                self.responders.len()
            );
        }
        write!(
            f,
            "merged {} accounts and {} messages from {:?}",
            self.imported_accounts, self.imported_messages, self.responders
        )?;
        if let Some(next) = self.next_message_id {
            write!(f, ", next message id {next}")?;
        }
        Ok(())
    }
}

impl ReplicaNode {
    /// Reconciles the local store with peer snapshots. Runs once, on the
    /// transition to leader.
    ///
    /// Peers are asked in configuration order until `sync_quorum` snapshots
    /// are in hand. With fewer, the node leads on its own data rather than
    /// waiting.
    pub(crate) async fn synchronize(&self) -> Result<SyncOutcome, StoreError> {
        let needed = self.config.sync_quorum;
        let limit = self.config.timing.probe_timeout();
        let mut outcome = SyncOutcome::default();
        let mut snapshots: Vec<Snapshot> = Vec::new();
        for peer in &self.config.peers {
            if snapshots.len() >= needed {
                break;
            }
            match bounded(&peer.address, limit, self.peers.get_state(&peer.address)).await {
                Ok(snapshot) => {
                    outcome.responders.push(peer.address.clone());
                    snapshots.push(snapshot);
                }
                Err(e) => tracing::debug!("{} snapshot unavailable: {e}", self.config.id),
            }
        }

        if snapshots.len() < needed {
            tracing::warn!(
                "{} leading without sync: {}/{needed} peers answered",
                self.config.id,
                snapshots.len()
            );
            return Ok(outcome);
        }

        let mut store = self.store();
        for snapshot in &snapshots {
            let (accounts, messages) = store.merge(snapshot)?;
            outcome.imported_accounts += accounts;
            outcome.imported_messages += messages;
        }
        outcome.next_message_id = Some(store.reset_message_sequence()?);
        outcome.merged = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{Account, StoredMessage, MESSAGE_ID_SEQUENCE},
        testing::{address, node},
    };

    fn message(id: MessageId) -> StoredMessage {
        StoredMessage {
            id,
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            body: format!("m{id}"),
            timestamp: 0,
            delivered: false,
        }
    }

    fn account(username: &str) -> Account {
        Account {
            username: username.to_string(),
            password_digest: b"digest".to_vec(),
        }
    }

    #[tokio::test]
    async fn merges_two_snapshots_and_advances_sequence() {
        let (n, peers) = node(11);
        peers.set_snapshot(
            &address(7),
            Snapshot {
                accounts: vec![account("alice")],
                messages: vec![message(1), message(2)],
            },
        );
        peers.set_snapshot(
            &address(8),
            Snapshot {
                accounts: vec![account("alice"), account("bob")],
                messages: vec![message(2), message(3)],
            },
        );

        let outcome = n.synchronize().await.unwrap();
        assert!(outcome.merged);
        assert_eq!(outcome.responders, vec![address(7), address(8)]);
        assert_eq!(outcome.imported_accounts, 2);
        assert_eq!(outcome.imported_messages, 3);
        assert_eq!(outcome.next_message_id, Some(4));

        let mut store = n.store();
        assert_eq!(store.message_ids().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.sequence(MESSAGE_ID_SEQUENCE).unwrap(), Some(4));
        assert_eq!(store.next_message_id().unwrap(), 4);
    }

    #[tokio::test]
    async fn stops_after_two_responders() {
        let (n, peers) = node(11);
        peers.set_alive(&address(7), false);
        peers.set_snapshot(
            &address(10),
            Snapshot {
                accounts: vec![account("late")],
                messages: vec![],
            },
        );
        let outcome = n.synchronize().await.unwrap();
        assert_eq!(outcome.responders, vec![address(8), address(9)]);
        assert!(!n.store().has_account("late").unwrap());
    }

    #[tokio::test]
    async fn leads_unsynchronized_with_one_responder() {
        let (n, peers) = node(11);
        for id in [8, 9, 10] {
            peers.set_alive(&address(id), false);
        }
        peers.set_snapshot(
            &address(7),
            Snapshot {
                accounts: vec![account("alice")],
                messages: vec![message(5)],
            },
        );
        let outcome = n.synchronize().await.unwrap();
        assert!(!outcome.merged);
        assert_eq!(outcome.responders, vec![address(7)]);
        assert!(n.store().message_ids().unwrap().is_empty());

        // Leadership is taken regardless.
        assert!(n.initiate_election().await);
        assert!(n.is_leader());
    }
}
