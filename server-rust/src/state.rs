use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use tessera_protocol::CheckpointMeta;

pub struct AppState {
    /// Stored checkpoints per run, sorted by step.
    pub checkpoints: RwLock<HashMap<String, Vec<CheckpointMeta>>>,
    /// Serializes uploads from the existence check through the index
    /// write. Readers only take `checkpoints`.
    pub uploads: Mutex<()>,
    pub auth_token: String,
    pub data_dir: PathBuf,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(auth_token: String, data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            checkpoints: RwLock::new(HashMap::new()),
            uploads: Mutex::new(()),
            auth_token,
            data_dir: data_dir.into(),
            start_time: Utc::now(),
        })
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("checkpoints").join(run_id)
    }

    pub fn checkpoint_path(&self, run_id: &str, step: u64) -> PathBuf {
        self.run_dir(run_id).join(format!("step-{step:012}.json"))
    }
}

/// Run ids become directory names.
pub fn valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id.len() <= 128
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !run_id.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_cannot_escape_the_data_dir() {
        assert!(valid_run_id("run-1"));
        assert!(valid_run_id("llama_7b.v2"));
        assert!(!valid_run_id(""));
        assert!(!valid_run_id(".."));
        assert!(!valid_run_id("../etc"));
        assert!(!valid_run_id("a/b"));
        assert!(!valid_run_id(".hidden"));
    }
}
