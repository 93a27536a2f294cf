use anyhow::Result;
use std::collections::HashMap;

use tessera_protocol::CheckpointMeta;

use crate::state::AppState;

const INDEX_FILE: &str = "index.json";

pub async fn save_checkpoint(state: &AppState, meta: &CheckpointMeta, bytes: &[u8]) -> Result<()> {
    let path = state.checkpoint_path(&meta.run_id, meta.step);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

pub async fn read_checkpoint(state: &AppState, meta: &CheckpointMeta) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(state.checkpoint_path(&meta.run_id, meta.step)).await?)
}

/// Callers hold `AppState::uploads`, which also guards the temp file.
pub async fn save_index(state: &AppState) -> Result<()> {
    tokio::fs::create_dir_all(&state.data_dir).await?;
    let checkpoints = state.checkpoints.read().await;
    let json = serde_json::to_string_pretty(&*checkpoints)?;
    let tmp = state.data_dir.join("index.json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, state.data_dir.join(INDEX_FILE)).await?;
    Ok(())
}

/// Load the index, dropping entries whose checkpoint file is gone.
pub async fn load_index(state: &AppState) -> Result<()> {
    let data = match tokio::fs::read_to_string(state.data_dir.join(INDEX_FILE)).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let loaded: HashMap<String, Vec<CheckpointMeta>> = serde_json::from_str(&data)?;

    let mut index = HashMap::new();
    let mut dropped = 0usize;
    for (run_id, metas) in loaded {
        let mut present = Vec::with_capacity(metas.len());
        for meta in metas {
            if tokio::fs::try_exists(state.checkpoint_path(&run_id, meta.step)).await? {
                present.push(meta);
            } else {
                dropped += 1;
            }
        }
        present.sort_by_key(|m| m.step);
        if !present.is_empty() {
            index.insert(run_id, present);
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, "Index entries without checkpoint files were dropped");
    }
    tracing::info!(runs = index.len(), "Loaded checkpoint index");
    *state.checkpoints.write().await = index;
    Ok(())
}
