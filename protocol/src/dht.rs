//! The key/value collaborator the coordination layer is written against.
//!
//! Only three primitives are consumed: a read, a compare-and-swap write
//! keyed on the record version the caller last saw, and the membership
//! view. Storage, replication and transport belong to the implementation
//! ([`MemoryDht`] in-process, [`crate::GossipDht`] over HTTP).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::peer::PeerInfo;
use crate::types::NodeId;

/// A versioned value as stored under one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub version: u64,
    pub writer: NodeId,
    pub written_at: DateTime<Utc>,
    pub value: serde_json::Value,
}

impl Record {
    /// Replica merge order: higher version wins, equal versions are broken
    /// by writer id so every replica converges on the same record.
    pub fn supersedes(&self, other: &Record) -> bool {
        (self.version, &self.writer) > (other.version, &other.writer)
    }

    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<T, DhtError> {
        serde_json::from_value(self.value.clone()).map_err(|source| DhtError::Malformed {
            key: key.to_string(),
            source,
        })
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored(Record),
    /// The key moved on since the caller read it. Carries what is there now.
    Conflict { current: Option<Record> },
}

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("dht unavailable: {0}")]
    Unavailable(String),
    #[error("malformed record under {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("version counter exhausted for {key}")]
    VersionExhausted { key: String },
}

#[async_trait]
pub trait Dht: Send + Sync {
    /// Identity this handle writes as.
    fn node_id(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Record>, DhtError>;

    /// Write `value` only if the key is still at `expected_previous`
    /// (`None` meaning the key must be absent).
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_previous: Option<u64>,
    ) -> Result<PutOutcome, DhtError>;

    /// Currently reachable peers, excluding ourselves.
    async fn peers(&self) -> Result<Vec<PeerInfo>, DhtError>;
}

/// Local replica of DHT records.
#[derive(Clone, Default)]
pub struct RecordStore {
    records: Arc<RwLock<HashMap<String, Record>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Record> {
        self.records.read().await.get(key).cloned()
    }

    /// Atomic compare-and-swap against this replica.
    pub async fn compare_and_put(
        &self,
        key: &str,
        writer: &str,
        value: serde_json::Value,
        expected_previous: Option<u64>,
    ) -> Result<PutOutcome, DhtError> {
        let mut records = self.records.write().await;
        let current = records.get(key);
        if current.map(|r| r.version) != expected_previous {
            return Ok(PutOutcome::Conflict {
                current: current.cloned(),
            });
        }
        let version = expected_previous
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| DhtError::VersionExhausted { key: key.to_string() })?;
        let record = Record {
            version,
            writer: writer.to_string(),
            written_at: Utc::now(),
            value,
        };
        records.insert(key.to_string(), record.clone());
        Ok(PutOutcome::Stored(record))
    }

    /// Merge a record received from another replica. Returns true if it
    /// replaced what we had.
    pub async fn merge(&self, key: &str, incoming: Record) -> bool {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(key) {
            if !incoming.supersedes(existing) {
                return false;
            }
        }
        records.insert(key.to_string(), incoming);
        true
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

/// In-process DHT: every handle shares one linearizable store and one
/// member list. Used by tests and single-machine simulations.
#[derive(Clone)]
pub struct MemoryDht {
    node_id: NodeId,
    store: RecordStore,
    members: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
}

impl MemoryDht {
    /// A new network with one member.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let mut members = HashMap::new();
        members.insert(node_id.clone(), Self::member_info(&node_id));
        Self {
            node_id,
            store: RecordStore::new(),
            members: Arc::new(RwLock::new(members)),
        }
    }

    /// Another member of the same network.
    pub async fn join(&self, node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        self.members
            .write()
            .await
            .insert(node_id.clone(), Self::member_info(&node_id));
        Self {
            node_id,
            store: self.store.clone(),
            members: self.members.clone(),
        }
    }

    fn member_info(node_id: &str) -> PeerInfo {
        PeerInfo::new(node_id.to_string(), format!("mem://{node_id}"))
    }

    /// Drop a member from discovery, as if it went offline.
    pub async fn leave(&self, node_id: &str) {
        self.members.write().await.remove(node_id);
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }
}

#[async_trait]
impl Dht for MemoryDht {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, DhtError> {
        Ok(self.store.get(key).await)
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_previous: Option<u64>,
    ) -> Result<PutOutcome, DhtError> {
        self.store
            .compare_and_put(key, &self.node_id, value, expected_previous)
            .await
    }

    async fn peers(&self) -> Result<Vec<PeerInfo>, DhtError> {
        let members = self.members.read().await;
        Ok(members
            .values()
            .filter(|p| p.node_id != self.node_id)
            .cloned()
            .collect())
    }
}
