use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dht::Record;
use crate::ranges::RangeSet;

/// Unique node identifier
pub type NodeId = String;

/// A flat parameter or momentum buffer. Stored in single precision.
pub type Tensor = Vec<f32>;

/// Lifecycle of a partition claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Claimed,
    Completed,
    Abandoned,
}

/// A record asserting one peer is working a subset of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionClaim {
    pub id: String,
    pub owner: NodeId,
    pub ranges: RangeSet,
    pub claimed_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
    pub status: ClaimStatus,
}

impl PartitionClaim {
    /// Claimed and the lease has not run out yet.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Claimed && now < self.lease_expiry
    }

    /// Claimed but the lease ran out; any peer may reap it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Claimed && now >= self.lease_expiry
    }
}

/// Optimizer scalar plus one momentum buffer per parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f64,
    pub momentum: Vec<Tensor>,
}

/// The model and optimizer state every peer holds a copy of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedTrainingState {
    pub run_id: String,
    /// Only ever increases.
    pub step: u64,
    pub parameters: Vec<Tensor>,
    pub optimizer: OptimizerState,
}

impl SharedTrainingState {
    /// Fresh state at step 0 with zeroed momentum.
    pub fn new(run_id: impl Into<String>, parameters: Vec<Tensor>, learning_rate: f64) -> Self {
        let momentum = parameters.iter().map(|p| vec![0.0; p.len()]).collect();
        Self {
            run_id: run_id.into(),
            step: 0,
            parameters,
            optimizer: OptimizerState { learning_rate, momentum },
        }
    }

    /// Length of every parameter tensor, in order.
    pub fn shape(&self) -> Vec<usize> {
        self.parameters.iter().map(Vec::len).collect()
    }

    /// Same tensor layout for parameters and momentum, so the two can be
    /// averaged element-wise.
    pub fn is_compatible_with(&self, other: &SharedTrainingState) -> bool {
        self.run_id == other.run_id
            && self.shape() == other.shape()
            && self.optimizer.momentum.len() == other.optimizer.momentum.len()
            && self
                .optimizer
                .momentum
                .iter()
                .zip(&other.optimizer.momentum)
                .all(|(a, b)| a.len() == b.len())
    }

    pub fn is_finite(&self) -> bool {
        self.optimizer.learning_rate.is_finite()
            && self
                .parameters
                .iter()
                .chain(&self.optimizer.momentum)
                .all(|t| t.iter().all(|v| v.is_finite()))
    }
}

/// Work handed to a peer for one evaluation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub run_id: String,
    pub round: u64,
    /// Step of the requester's shared state when the round started.
    pub step: u64,
    pub claim_id: String,
    pub indices: RangeSet,
}

/// A peer's answer to an [`EvaluationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResponse {
    pub node_id: NodeId,
    /// One output per requested index, in index order.
    pub outputs: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
}

/// Announcement of a peer's existence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub node_id: NodeId,
    /// The address where this peer's HTTP endpoint lives
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

/// A gossip message exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipMessage {
    /// "Here are the peers I know about"
    PeerSync {
        sender: NodeId,
        peers: Vec<PeerAnnouncement>,
    },
    /// "What is your copy of this key?"
    Get { sender: NodeId, key: String },
    /// "I wrote this record, merge it"
    Put {
        sender: NodeId,
        key: String,
        record: Record,
    },
}

/// Response to a gossip message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipResponse {
    pub node_id: NodeId,
    #[serde(default)]
    pub peers: Vec<PeerAnnouncement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
}

/// Configuration for the gossip transport
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This node's unique ID
    pub node_id: NodeId,
    /// Public address other nodes can reach us at (e.g. "myhost.com:7435")
    pub public_addr: String,
    /// DHT bootstrap addresses
    pub seed_peers: Vec<String>,
    /// How often to exchange peer lists
    pub gossip_interval: Duration,
    /// How long before a silent peer is considered dead
    pub peer_timeout: Duration,
    /// Peers contacted per push or pull
    pub fanout: usize,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Auth token for the network
    pub auth_token: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            public_addr: "127.0.0.1:7435".into(),
            seed_peers: vec![],
            gossip_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(120),
            fanout: 3,
            request_timeout: Duration::from_secs(10),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("run id must not be empty")]
    EmptyRunId,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("trust decay must be in [0, 1), got {0}")]
    TrustDecay(f64),
    #[error("{name} must be in {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },
    #[error("lease of {lease:?} must outlast the dispatch timeout of {dispatch:?}")]
    LeaseTooShort { lease: Duration, dispatch: Duration },
}

/// Operational parameters of one training run. Fixed for the lifetime of
/// the process.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    /// Rows in the dataset; the index space is `[0, dataset_size)`.
    pub dataset_size: u64,
    /// Rows claimed per evaluation round.
    pub claim_size: u64,
    pub lease_duration: Duration,
    /// Optimistic-write attempts per partition operation.
    pub claim_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    /// Sleep after finding no claimable rows; doubles up to the max.
    pub idle_backoff: Duration,
    pub idle_backoff_max: Duration,
    /// Peers queried per round.
    pub sample_size: usize,
    pub dispatch_timeout: Duration,
    /// Weight kept from the old score in the moving average.
    pub trust_decay: f64,
    /// Minimum averaging weight of any known peer.
    pub trust_floor: f64,
    /// Minimum share of the local state in every merge.
    pub local_floor_weight: f64,
    pub averaging_interval: Duration,
    pub averaging_timeout: Duration,
    /// Evaluation rounds between checkpoint uploads.
    pub checkpoint_interval: u64,
    /// Finished claim records kept in the partition table.
    pub claim_history: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: format!("tessera_run_v{}", env!("CARGO_PKG_VERSION").replace('.', "_")),
            dataset_size: 0,
            claim_size: 25 * 20,
            lease_duration: Duration::from_secs(600),
            claim_retries: 5,
            retry_backoff: Duration::from_millis(250),
            retry_backoff_max: Duration::from_secs(5),
            idle_backoff: Duration::from_secs(2),
            idle_backoff_max: Duration::from_secs(60),
            sample_size: 20,
            dispatch_timeout: Duration::from_secs(30),
            trust_decay: 0.95,
            trust_floor: 0.01,
            local_floor_weight: 0.25,
            averaging_interval: Duration::from_secs(300),
            averaging_timeout: Duration::from_secs(60),
            checkpoint_interval: 900,
            claim_history: 256,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_id.trim().is_empty() {
            return Err(ConfigError::EmptyRunId);
        }
        let positive = [
            ("dataset_size", self.dataset_size == 0),
            ("claim_size", self.claim_size == 0),
            ("lease_duration", self.lease_duration.is_zero()),
            ("claim_retries", self.claim_retries == 0),
            ("sample_size", self.sample_size == 0),
            ("dispatch_timeout", self.dispatch_timeout.is_zero()),
            ("averaging_interval", self.averaging_interval.is_zero()),
            ("averaging_timeout", self.averaging_timeout.is_zero()),
            ("checkpoint_interval", self.checkpoint_interval == 0),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero(*name));
        }
        // A claim must stay live until every dispatched evaluation returns.
        if self.lease_duration <= self.dispatch_timeout {
            return Err(ConfigError::LeaseTooShort {
                lease: self.lease_duration,
                dispatch: self.dispatch_timeout,
            });
        }
        if !(0.0..1.0).contains(&self.trust_decay) {
            return Err(ConfigError::TrustDecay(self.trust_decay));
        }
        if !(0.0..=1.0).contains(&self.trust_floor) {
            return Err(ConfigError::OutOfRange {
                name: "trust_floor",
                range: "[0, 1]",
                value: self.trust_floor,
            });
        }
        if !(self.local_floor_weight > 0.0 && self.local_floor_weight <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "local_floor_weight",
                range: "(0, 1]",
                value: self.local_floor_weight,
            });
        }
        Ok(())
    }

    /// DHT key of the partition table.
    pub fn partition_key(&self) -> String {
        format!("{}:partition", self.run_id)
    }

    /// DHT key under which `node_id` publishes its shared state.
    pub fn state_key(&self, node_id: &str) -> String {
        format!("{}:state:{}", self.run_id, node_id)
    }
}
