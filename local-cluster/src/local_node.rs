use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use quorumchat_replica::{
    config::NodeConfig,
    msg::{NodeId, ReplicaSummary},
    ReplicaNode,
};

use crate::network::{LocalNetwork, LocalPeerClient};

pub enum LocalNodeMsg {
    SummaryRequest {
        tx: oneshot::Sender<LocalNodeSummary>,
    },
    Kill,
    Start,
    Connect,
    Disconnect,
    Shutdown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalNodeSummary {
    pub id: NodeId,
    pub address: String,
    pub is_dead: bool,
    pub is_disconnected: bool,
    /// None while the node is dead.
    pub replica: Option<ReplicaSummary>,
}

impl LocalNodeSummary {
    pub fn is_live(&self) -> bool {
        !self.is_dead && !self.is_disconnected
    }

    pub fn is_leader(&self) -> bool {
        self.replica.as_ref().is_some_and(ReplicaSummary::is_leader)
    }
}

/// Simulates a replica process on a network but run locally.
///
/// Killing drops the running replica and its volatile state. Starting again
/// builds a fresh replica from the node's data directory, the way a real
/// restart would.
pub struct LocalNode {
    pub id: NodeId,
    pub is_disconnected: bool,
    pub is_dead: bool,
    config: NodeConfig,
    network: Arc<LocalNetwork>,
    /// Channel for control messages from the cluster
    incoming_rx: mpsc::Receiver<LocalNodeMsg>,
    replica: Option<Arc<ReplicaNode>>,
    /// Stops the current incarnation's detector loop
    shutdown: CancellationToken,
}

impl LocalNode {
    pub fn new(
        config: NodeConfig,
        network: Arc<LocalNetwork>,
        incoming_rx: mpsc::Receiver<LocalNodeMsg>,
    ) -> Self {
        Self {
            id: config.id,
            is_disconnected: false,
            is_dead: true,
            config,
            network,
            incoming_rx,
            replica: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn run(&mut self) {
        while let Some(msg) = self.incoming_rx.recv().await {
            use LocalNodeMsg::*;
            match msg {
                SummaryRequest { tx } => {
                    if tx.send(self.summary()).is_err() {
                        tracing::warn!("Node {}: summary requester went away", self.id);
                    }
                }
                Kill => self.kill(),
                Start => self.start(),
                Disconnect => self.disconnect(),
                Connect => self.connect(),
                Shutdown => break,
            }
        }
        self.kill();
    }

    pub fn summary(&self) -> LocalNodeSummary {
        LocalNodeSummary {
            id: self.id,
            address: self.config.address.clone(),
            is_dead: self.is_dead,
            is_disconnected: self.is_disconnected,
            replica: self.replica.as_ref().map(|r| r.summary()),
        }
    }

    pub fn start(&mut self) {
        if !self.is_dead {
            return;
        }
        let peers = Arc::new(LocalPeerClient::new(
            self.config.address.clone(),
            Arc::clone(&self.network),
        ));
        let replica = match ReplicaNode::new(self.config.clone(), peers) {
            Ok(replica) => Arc::new(replica),
            Err(e) => {
                tracing::error!("Node {}: failed to open store: {e}", self.id);
                return;
            }
        };
        self.network.attach(&self.config.address, Arc::clone(&replica));

        self.shutdown = CancellationToken::new();
        let shutdown = self.shutdown.clone();
        let running = Arc::clone(&replica);
        tokio::spawn(async move {
            running.run(shutdown).await;
        });
        self.replica = Some(replica);
        self.is_dead = false;
        tracing::info!("Node {} started", self.id);
    }

    fn kill(&mut self) {
        if self.is_dead {
            return;
        }
        self.shutdown.cancel();
        self.network.detach(&self.config.address);
        self.replica = None;
        self.is_dead = true;
        tracing::info!("Node {} killed", self.id);
    }

    fn connect(&mut self) {
        self.network.set_disconnected(&self.config.address, false);
        self.is_disconnected = false;
    }

    fn disconnect(&mut self) {
        self.network.set_disconnected(&self.config.address, true);
        self.is_disconnected = true;
    }
}
