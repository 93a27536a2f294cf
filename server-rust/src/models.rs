use chrono::{DateTime, Utc};
use serde::Serialize;

use tessera_protocol::CheckpointMeta;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub checkpoints: usize,
    pub latest_step: u64,
    pub latest_at: DateTime<Utc>,
    pub total_bytes: u64,
}

impl RunSummary {
    /// `None` for a run with nothing stored.
    pub fn from_metas(run_id: &str, metas: &[CheckpointMeta]) -> Option<Self> {
        let latest = metas.last()?;
        Some(Self {
            run_id: run_id.to_string(),
            checkpoints: metas.len(),
            latest_step: latest.step,
            latest_at: latest.stored_at,
            total_bytes: metas.iter().map(|m| m.size).sum(),
        })
    }
}
