//! Periodic snapshots of the shared training state.
//!
//! A checkpoint is the JSON encoding of a [`SharedTrainingState`] plus its
//! SHA-256. Where the bytes end up is up to the [`CheckpointStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::SharedTrainingState;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint digest mismatch: expected {expected}, got {found}")]
    Integrity { expected: String, found: String },
    #[error("checkpoint upload failed: {0}")]
    Upload(String),
}

/// Where and what was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub run_id: String,
    pub step: u64,
    pub sha256: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn encode_checkpoint(state: &SharedTrainingState) -> Result<Vec<u8>, CheckpointError> {
    Ok(serde_json::to_vec(state)?)
}

/// Decode checkpoint bytes, checking them against `expected_sha256` first
/// when one is given.
pub fn decode_checkpoint(
    bytes: &[u8],
    expected_sha256: Option<&str>,
) -> Result<SharedTrainingState, CheckpointError> {
    if let Some(expected) = expected_sha256 {
        let found = sha256_hex(bytes);
        if !found.eq_ignore_ascii_case(expected) {
            return Err(CheckpointError::Integrity {
                expected: expected.to_string(),
                found,
            });
        }
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn upload(&self, run_id: &str, step: u64, bytes: Vec<u8>) -> Result<CheckpointMeta, CheckpointError>;

    /// Most advanced checkpoint stored for `run_id`, if the store can read
    /// back at all.
    async fn latest(&self, _run_id: &str) -> Result<Option<SharedTrainingState>, CheckpointError> {
        Ok(None)
    }
}

/// Keeps uploads in memory. Handy for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    uploads: Arc<RwLock<Vec<(CheckpointMeta, Vec<u8>)>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn uploads(&self) -> Vec<CheckpointMeta> {
        self.uploads.read().await.iter().map(|(m, _)| m.clone()).collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn upload(&self, run_id: &str, step: u64, bytes: Vec<u8>) -> Result<CheckpointMeta, CheckpointError> {
        let meta = CheckpointMeta {
            run_id: run_id.to_string(),
            step,
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        self.uploads.write().await.push((meta.clone(), bytes));
        Ok(meta)
    }

    async fn latest(&self, run_id: &str) -> Result<Option<SharedTrainingState>, CheckpointError> {
        let uploads = self.uploads.read().await;
        let Some((meta, bytes)) = uploads
            .iter()
            .filter(|(m, _)| m.run_id == run_id)
            .max_by_key(|(m, _)| m.step)
        else {
            return Ok(None);
        };
        decode_checkpoint(bytes, Some(&meta.sha256)).map(Some)
    }
}
