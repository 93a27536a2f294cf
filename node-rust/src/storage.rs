use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

use tessera_protocol::{decode_checkpoint, sha256_hex, CheckpointError, CheckpointMeta, CheckpointStore, SharedTrainingState};

/// Checkpoints as files: `<root>/<run_id>/step-<step>.json` plus a
/// `.meta.json` sidecar holding the digest.
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.contains("..") {
            return Err(CheckpointError::Upload(format!("invalid run id {run_id:?}")));
        }
        Ok(self.root.join(run_id))
    }

    pub async fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let dir = self.run_dir(run_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(".meta.json") {
                continue;
            }
            match read_meta(&path).await {
                Ok(meta) => metas.push(meta),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint metadata"),
            }
        }
        metas.sort_by_key(|m| m.step);
        Ok(metas)
    }
}

async fn read_meta(path: &Path) -> Result<CheckpointMeta, CheckpointError> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write through a temp file so readers never see a partial checkpoint.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn upload(&self, run_id: &str, step: u64, bytes: Vec<u8>) -> Result<CheckpointMeta, CheckpointError> {
        let dir = self.run_dir(run_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let meta = CheckpointMeta {
            run_id: run_id.to_string(),
            step,
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        let stem = format!("step-{step:012}");
        write_atomic(&dir.join(format!("{stem}.json")), &bytes).await?;
        write_atomic(&dir.join(format!("{stem}.meta.json")), &serde_json::to_vec_pretty(&meta)?).await?;
        Ok(meta)
    }

    async fn latest(&self, run_id: &str) -> Result<Option<SharedTrainingState>, CheckpointError> {
        let Some(meta) = self.list(run_id).await?.pop() else {
            return Ok(None);
        };
        let path = self.run_dir(run_id)?.join(format!("step-{:012}.json", meta.step));
        let bytes = tokio::fs::read(&path).await?;
        decode_checkpoint(&bytes, Some(&meta.sha256)).map(Some)
    }
}
