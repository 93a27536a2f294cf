use anyhow::{Context, Result};
use std::path::PathBuf;

use tessera_protocol::{GossipConfig, RunConfig};

/// Where checkpoints go.
#[derive(Debug, Clone)]
pub enum CheckpointTarget {
    Directory(PathBuf),
    Server { url: String, token: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub gossip: GossipConfig,
    pub run: RunConfig,
    pub model_path: PathBuf,
    pub learning_rate: f64,
    pub checkpoint: CheckpointTarget,
    /// Start from the latest stored checkpoint if there is one.
    pub restore: bool,
    /// Answer `/evaluate` and average, but never claim work.
    pub worker_only: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.run.validate().context("invalid run configuration")?;
        if self.gossip.node_id.trim().is_empty() {
            anyhow::bail!("node id must not be empty");
        }
        if self.gossip.public_addr.trim().is_empty() {
            anyhow::bail!("public address must not be empty");
        }
        if self.gossip.fanout == 0 {
            anyhow::bail!("fanout must be greater than zero");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            anyhow::bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if let CheckpointTarget::Server { url, .. } = &self.checkpoint {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("checkpoint server must be an http(s) URL, got {url}");
            }
        }
        Ok(())
    }

    /// The token peers must present, if any.
    pub fn auth_token(&self) -> Option<String> {
        let token = self.gossip.auth_token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}
