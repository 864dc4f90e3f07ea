use color_eyre::eyre::{bail, eyre, Result};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::{sync::mpsc, time::sleep};

use quorumchat_replica::{
    config::{ClusterConfig, ServerEntry, Timing},
    msg::NodeId,
    password, ReplicaNode,
};

use crate::{
    index_by_id, local_address, local_node::LocalNodeSummary, network::LocalNetwork, Cluster,
    CtlMsg,
};

pub type Nodes = Vec<LocalNodeSummary>;

/// Timing for in-process clusters, scaled down so tests see elections in
/// well under a second.
pub fn fast_timing() -> Timing {
    Timing {
        heartbeat_interval_ms: 50,
        leader_timeout_ms: 200,
        probe_timeout_ms: 100,
        replication_timeout_ms: 100,
        subscription_poll_ms: 50,
    }
}

/// Nodes `1..=node_count` at their local addresses, with cheap password
/// hashing.
pub fn local_config(node_count: u64) -> ClusterConfig {
    let servers = (1..=node_count)
        .map(|id| ServerEntry {
            id,
            address: local_address(id),
        })
        .collect();
    let mut config = ClusterConfig::new(servers);
    config.timing = fast_timing();
    config.password_cost = password::MIN_COST;
    config
}

pub struct LocalClusterRunner {
    config: ClusterConfig,
    network: Arc<LocalNetwork>,
    tx: mpsc::Sender<CtlMsg>,
    rx: mpsc::Receiver<CtlMsg>,
    /// Stores outlive kills and restarts; removed when the runner drops.
    _data_dir: TempDir,
}

impl LocalClusterRunner {
    pub fn new(node_count: u64) -> Result<Self> {
        Self::with_config(local_config(node_count))
    }

    pub fn with_config(config: ClusterConfig) -> Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let network = LocalNetwork::new();
        let (requests_tx, requests_rx) = mpsc::channel(1024);
        let (replies_tx, replies_rx) = mpsc::channel(1024);
        let mut c = Cluster::new(
            &config,
            data_dir.path(),
            Arc::clone(&network),
            requests_rx,
            replies_tx,
        )?;
        tokio::spawn(async move {
            c.run().await;
        });
        Ok(Self {
            config,
            network,
            tx: requests_tx,
            rx: replies_rx,
            _data_dir: data_dir,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub async fn get_cluster_state(&mut self) -> Result<Nodes> {
        self.send(CtlMsg::GetClusterState).await?;
        match self.rx.recv().await {
            Some(CtlMsg::SendClusterState { nodes }) => Ok(nodes),
            _ => Err(eyre!("No state received!")),
        }
    }

    pub async fn summary(&mut self, id: NodeId) -> Result<LocalNodeSummary> {
        let nodes = self.get_cluster_state().await?;
        index_by_id(&nodes)
            .remove(&id)
            .ok_or_else(|| eyre!("No node {id} in the cluster"))
    }

    pub async fn sleep(&mut self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    pub async fn kill(&mut self, id: NodeId) -> Result<()> {
        self.control(CtlMsg::Kill { dest: id }).await
    }

    /// Starts a killed node again from its persisted store.
    pub async fn restart(&mut self, id: NodeId) -> Result<()> {
        self.control(CtlMsg::Start { dest: id }).await
    }

    pub async fn connect(&mut self, id: NodeId) -> Result<()> {
        self.control(CtlMsg::Connect { dest: id }).await
    }

    pub async fn disconnect(&mut self, id: NodeId) -> Result<()> {
        self.control(CtlMsg::Disconnect { dest: id }).await
    }

    /// Running replica for `id`, for issuing chat calls directly.
    pub fn node(&self, id: NodeId) -> Result<Arc<ReplicaNode>> {
        let Some(server) = self.config.servers.iter().find(|s| s.id == id) else {
            bail!("No node {id} in the cluster");
        };
        self.network
            .node(&server.address)
            .ok_or_else(|| eyre!("Node {id} is not running"))
    }

    // Exactly one leader among live, connected nodes
    pub async fn check_one_leader(&mut self) -> Result<LocalNodeSummary> {
        let iterations = 40;
        for _ in 0..iterations {
            self.sleep(100).await;
            let nodes = &self.get_cluster_state().await?;
            let live_leaders = leaders(nodes);
            match live_leaders.len() {
                1 => return Ok(live_leaders[0].clone()),
                l if l > 1 => bail!("More than one live leader: {live_leaders:?}"),
                _ => {}
            }
        }
        bail!("No leader elected in time!")
    }

    /// Waits until `id` is the only live leader and every live node follows
    /// it.
    pub async fn await_leader(&mut self, id: NodeId) -> Result<LocalNodeSummary> {
        let Some(address) = self
            .config
            .servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.address.clone())
        else {
            bail!("No node {id} in the cluster");
        };
        for _ in 0..40 {
            self.sleep(100).await;
            let nodes = self.get_cluster_state().await?;
            let live_leaders = leaders(&nodes);
            let agreed = nodes
                .iter()
                .filter(|n| n.is_live())
                .filter_map(|n| n.replica.as_ref())
                .all(|r| r.leader_address.as_deref() == Some(address.as_str()));
            if agreed && live_leaders.len() == 1 && live_leaders[0].id == id {
                return Ok(live_leaders[0].clone());
            }
        }
        bail!("Node {id} did not take over leadership in time!")
    }

    pub async fn leader_node(&mut self) -> Result<Arc<ReplicaNode>> {
        let leader = self.check_one_leader().await?;
        self.node(leader.id)
    }

    pub async fn has_no_leader(&mut self) -> Result<bool> {
        Ok(leaders(&self.get_cluster_state().await?).is_empty())
    }

    /// Live nodes whose store holds message `id`.
    pub async fn n_holding_message(&mut self, id: u64) -> Result<usize> {
        let nodes = self.get_cluster_state().await?;
        Ok(nodes
            .iter()
            .filter(|n| n.is_live())
            .filter_map(|n| n.replica.as_ref())
            .filter(|r| r.message_ids.contains(&id))
            .count())
    }

    /// Sends a control message and returns once the node has acted on it.
    /// Nodes handle their messages in order, so the state request that
    /// follows is answered only after the change.
    async fn control(&mut self, msg: CtlMsg) -> Result<()> {
        self.send(msg).await?;
        self.get_cluster_state().await.map(|_| ())
    }

    async fn send(&self, msg: CtlMsg) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| eyre!("Cluster is gone: {e}"))
    }
}

impl Drop for LocalClusterRunner {
    fn drop(&mut self) {
        if self.tx.try_send(CtlMsg::Shutdown).is_err() {
            tracing::warn!("Failed to send Shutdown");
        }
    }
}

pub fn leaders(nodes: &Nodes) -> Vec<LocalNodeSummary> {
    nodes
        .iter()
        .filter(|n| n.is_live() && n.is_leader())
        .cloned()
        .collect()
}
