use ahash::{HashSet, HashSetExt};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::ConfigError,
    msg::{
        NodeId, DEFAULT_QUORUM_THRESHOLD, DEFAULT_SYNC_QUORUM, HEARTBEAT_INTERVAL,
        LEADER_TIMEOUT, PROBE_TIMEOUT, REPLICATION_TIMEOUT, SUBSCRIPTION_POLL,
    },
};

/// One entry of the static membership list.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: NodeId,
    pub address: String,
}

/// How a node answers `RequestElection`.
///
/// Candidates only probe higher-ranked peers and abandon their bid on any
/// affirmative answer. `ClaimIfHigher` answers yes when the responder
/// outranks the candidate ("I am alive and better, stand down").
/// `YieldIfLower` reads the answer the other way round ("go ahead") and
/// only says yes to a candidate that outranks the responder, so probes from
/// lower-ranked candidates are always refused and every candidate claims
/// leadership; the last `SetLeader` announcement wins.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionReply {
    #[default]
    ClaimIfHigher,
    YieldIfLower,
}

impl ElectionReply {
    pub fn affirmative(self, own_rank: NodeId, candidate_rank: NodeId) -> bool {
        match self {
            ElectionReply::ClaimIfHigher => own_rank > candidate_rank,
            ElectionReply::YieldIfLower => own_rank < candidate_rank,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub heartbeat_interval_ms: u64,
    pub leader_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub replication_timeout_ms: u64,
    pub subscription_poll_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
            leader_timeout_ms: LEADER_TIMEOUT.as_millis() as u64,
            probe_timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
            replication_timeout_ms: REPLICATION_TIMEOUT.as_millis() as u64,
            subscription_poll_ms: SUBSCRIPTION_POLL.as_millis() as u64,
        }
    }
}

impl Timing {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn subscription_poll(&self) -> Duration {
        Duration::from_millis(self.subscription_poll_ms)
    }

    /// Every interval and timeout must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("leader_timeout_ms", self.leader_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("replication_timeout_ms", self.replication_timeout_ms),
            ("subscription_poll_ms", self.subscription_poll_ms),
        ];
        match fields.iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Static cluster membership plus the tunables shared by every node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default = "default_quorum_threshold")]
    pub quorum_threshold: usize,
    #[serde(default = "default_sync_quorum")]
    pub sync_quorum: usize,
    #[serde(default)]
    pub election_reply: ElectionReply,
    /// bcrypt work factor for account passwords.
    #[serde(default = "default_password_cost")]
    pub password_cost: u32,
}

fn default_password_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_quorum_threshold() -> usize {
    DEFAULT_QUORUM_THRESHOLD
}

fn default_sync_quorum() -> usize {
    DEFAULT_SYNC_QUORUM
}

impl ClusterConfig {
    pub fn new(servers: Vec<ServerEntry>) -> Self {
        Self {
            servers,
            timing: Timing::default(),
            quorum_threshold: DEFAULT_QUORUM_THRESHOLD,
            sync_quorum: DEFAULT_SYNC_QUORUM,
            election_reply: ElectionReply::default(),
            password_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".to_string()));
        }
        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for server in &self.servers {
            if server.address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {} has an empty address",
                    server.id
                )));
            }
            if !ids.insert(server.id) {
                return Err(ConfigError::Invalid(format!("duplicate id {}", server.id)));
            }
            if !addresses.insert(server.address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate address {}",
                    server.address
                )));
            }
        }
        if self.quorum_threshold == 0 {
            return Err(ConfigError::Invalid(
                "quorum_threshold must be at least 1".to_string(),
            ));
        }
        if self.sync_quorum == 0 {
            return Err(ConfigError::Invalid(
                "sync_quorum must be at least 1".to_string(),
            ));
        }
        self.timing.validate()?;
        if !(crate::password::MIN_COST..=crate::password::MAX_COST).contains(&self.password_cost) {
            return Err(ConfigError::Invalid(format!(
                "password_cost must be within {}..={}",
                crate::password::MIN_COST,
                crate::password::MAX_COST
            )));
        }
        Ok(())
    }
}

/// Configuration of a single node, derived from the cluster config.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeConfig {
    pub id: NodeId,
    pub address: String,
    /// Every other member, in configuration order.
    pub peers: Vec<ServerEntry>,
    pub data_dir: PathBuf,
    pub timing: Timing,
    pub quorum_threshold: usize,
    pub sync_quorum: usize,
    pub election_reply: ElectionReply,
    pub password_cost: u32,
}

impl NodeConfig {
    pub fn for_server(
        cluster: &ClusterConfig,
        id: NodeId,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        cluster.validate()?;
        let me = cluster
            .servers
            .iter()
            .find(|s| s.id == id)
            .ok_or(ConfigError::UnknownNode(id))?;
        let peers = cluster
            .servers
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        Ok(Self {
            id,
            address: me.address.clone(),
            peers,
            data_dir: data_dir.into(),
            timing: cluster.timing.clone(),
            quorum_threshold: cluster.quorum_threshold,
            sync_quorum: cluster.sync_quorum,
            election_reply: cluster.election_reply,
            password_cost: cluster.password_cost,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}.db", self.id))
    }

    /// Rank of a member by address. Rank is the configured id.
    pub fn rank_of(&self, address: &str) -> Option<NodeId> {
        if address == self.address {
            return Some(self.id);
        }
        self.peers
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.id)
    }

    pub fn higher_ranked_peers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.peers.iter().filter(move |p| p.id > self.id)
    }
}
