//! Tessera coordination protocol
//!
//! Decentralized coordination for collaborative training. Peers split a
//! dataset through leases in a shared DHT, validators score each other's
//! outputs, and model state is kept in sync by trust-weighted averaging.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────┐  claim / complete  ┌─────────────┐
//!  │Validator│◄──────────────────►│ DHT records │◄──── averaging (all nodes)
//!  └────┬────┘                    └─────────────┘
//!       │ evaluate (fan-out, deadline)
//!       ▼
//!  ┌──────┐ ┌──────┐ ┌──────┐
//!  │Peer A│ │Peer B│ │Peer C│
//!  └──────┘ └──────┘ └──────┘
//! ```
//!
//! ## Dataset partitioning
//! - The partition table is one DHT record, updated by compare-and-swap
//! - Claims are leases; anyone may reap an expired lease
//! - Completed rows never return to the pool
//!
//! ## Evaluation
//! - Each cycle claims rows, dispatches them to a random peer sample and
//!   scores the answers against the local model
//! - Scores feed a local moving-average trust table
//!
//! ## State averaging
//! - Nodes publish their state under their own key
//! - On a fixed cadence each node merges peer states, weighted by trust
//!
//! The DHT, the model and checkpoint storage are collaborators behind the
//! [`Dht`], [`Model`] and [`CheckpointStore`] traits.

pub mod averager;
pub mod checkpoint;
pub mod dht;
pub mod evaluation;
pub mod gossip;
pub mod model;
pub mod partition;
pub mod peer;
pub mod pool;
pub mod ranges;
pub mod trust;
pub mod types;

pub use averager::{merge_states, resolve_weights, RoundOutcome, StateAverager};
pub use checkpoint::{
    decode_checkpoint, encode_checkpoint, sha256_hex, CheckpointError, CheckpointMeta, CheckpointStore,
    MemoryCheckpointStore,
};
pub use dht::{Dht, DhtError, MemoryDht, PutOutcome, Record, RecordStore};
pub use evaluation::{
    similarity_score, CycleError, CycleOutcome, EvaluationLoop, IdleReason, LoopState, LoopStatus, RoundReport,
};
pub use gossip::{GossipDht, NetworkStatus};
pub use model::{check_shape, shared_model, train_step, Model, ModelError, SharedModel};
pub use partition::{Completion, DatasetPartitionState, PartitionStats, PartitionTable};
pub use peer::{PeerInfo, PeerRegistry};
pub use pool::{HttpTransport, PeerError, PeerOutcome, PeerRequestPool, PeerTransport};
pub use ranges::{IndexRange, RangeSet};
pub use trust::{PeerTrustScore, TrustTable};
pub use types::*;
