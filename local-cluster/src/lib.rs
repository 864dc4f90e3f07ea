use ahash::{HashMap, HashMapExt};
use std::{path::Path, sync::Arc};
use tokio::sync::{mpsc, oneshot};

pub mod local_cluster_tester;
pub mod local_node;
pub mod network;

use crate::{
    local_node::{LocalNode, LocalNodeMsg, LocalNodeSummary},
    network::LocalNetwork,
};
use quorumchat_replica::{
    config::{ClusterConfig, NodeConfig},
    error::ConfigError,
    msg::NodeId,
};

/// Control messages between the cluster runner and the cluster.
#[derive(Debug)]
pub enum CtlMsg {
    GetClusterState,
    SendClusterState { nodes: Vec<LocalNodeSummary> },
    Kill { dest: NodeId },
    Start { dest: NodeId },
    Connect { dest: NodeId },
    Disconnect { dest: NodeId },
    Shutdown,
}

pub struct Cluster {
    /// Channels for sending to individual nodes, in configuration order
    node_txs: Vec<(NodeId, mpsc::Sender<LocalNodeMsg>)>,
    /// Channel for messages from cluster runner
    ctl_requests: mpsc::Receiver<CtlMsg>,
    /// Channel for sending messages to cluster runner
    ctl_replies: mpsc::Sender<CtlMsg>,
}

impl Cluster {
    /// Starts every configured node on `network`. Each node keeps its store
    /// under `data_dir`.
    pub fn new(
        config: &ClusterConfig,
        data_dir: &Path,
        network: Arc<LocalNetwork>,
        ctl_requests: mpsc::Receiver<CtlMsg>,
        ctl_replies: mpsc::Sender<CtlMsg>,
    ) -> Result<Self, ConfigError> {
        let mut node_txs = Vec::new();
        for server in &config.servers {
            let node_config = NodeConfig::for_server(config, server.id, data_dir)?;
            let (incoming_tx, incoming_rx) = mpsc::channel(1024);
            let mut node = LocalNode::new(node_config, Arc::clone(&network), incoming_rx);
            node.start();
            tokio::spawn(async move {
                node.run().await;
            });
            node_txs.push((server.id, incoming_tx));
        }
        Ok(Self {
            node_txs,
            ctl_requests,
            ctl_replies,
        })
    }

    pub async fn run(&mut self) {
        while let Some(msg) = self.ctl_requests.recv().await {
            tracing::debug!("Cluster received CtlMsg {:?}", msg);
            if matches!(msg, CtlMsg::Shutdown) {
                return self.shutdown().await;
            }
            self.process_ctl_msg(msg).await;
        }
        self.shutdown().await;
    }

    /// Process messages sent from cluster runner
    async fn process_ctl_msg(&mut self, msg: CtlMsg) {
        use CtlMsg::*;
        match msg {
            GetClusterState => {
                let mut nodes = Vec::new();
                for (id, n_tx) in &self.node_txs {
                    let (tx, rx) = oneshot::channel();
                    if n_tx.send(LocalNodeMsg::SummaryRequest { tx }).await.is_err() {
                        tracing::warn!("Node {id} is gone");
                        continue;
                    }
                    if let Ok(summary) = rx.await {
                        nodes.push(summary);
                    }
                }
                if self.ctl_replies.send(SendClusterState { nodes }).await.is_err() {
                    tracing::warn!("Cluster runner went away");
                }
            }
            SendClusterState { .. } => {
                tracing::error!("Cluster shouldn't receive SendClusterState!");
            }
            Kill { dest } => self.send_to_node(dest, LocalNodeMsg::Kill).await,
            Start { dest } => self.send_to_node(dest, LocalNodeMsg::Start).await,
            Connect { dest } => self.send_to_node(dest, LocalNodeMsg::Connect).await,
            Disconnect { dest } => self.send_to_node(dest, LocalNodeMsg::Disconnect).await,
            Shutdown => self.shutdown().await,
        }
    }

    async fn send_to_node(&self, dest: NodeId, msg: LocalNodeMsg) {
        let Some((_, n_tx)) = self.node_txs.iter().find(|(id, _)| *id == dest) else {
            tracing::error!("No node {dest} in the cluster");
            return;
        };
        if n_tx.send(msg).await.is_err() {
            tracing::warn!("Node {dest} is gone");
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Local cluster shutting down");
        for (_, n_tx) in &self.node_txs {
            let _ = n_tx.send(LocalNodeMsg::Shutdown).await;
        }
    }
}

/// Node addresses used by the local cluster: id `n` listens on
/// `127.0.0.1:{50050 + n}`.
pub fn local_address(id: NodeId) -> String {
    format!("127.0.0.1:{}", 50050 + id)
}

pub fn index_by_id(nodes: &[LocalNodeSummary]) -> HashMap<NodeId, LocalNodeSummary> {
    let mut by_id = HashMap::with_capacity(nodes.len());
    for node in nodes {
        by_id.insert(node.id, node.clone());
    }
    by_id
}
