use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use tessera_node::model::ProjectionModel;
use tessera_node::{CheckpointTarget, Config};
use tessera_protocol::{shared_model, GossipConfig, RunConfig};

#[derive(Parser)]
#[command(name = "tessera-node", about = "Tessera collaborative training node")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:7435", env = "TESSERA_LISTEN")]
    listen: String,

    /// Address other nodes reach us at (e.g. myhost.com:7435)
    #[arg(long, default_value = "127.0.0.1:7435", env = "TESSERA_PUBLIC_ADDR")]
    public_addr: String,

    /// DHT bootstrap addresses, comma separated
    #[arg(long, env = "TESSERA_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Network auth token (empty disables auth)
    #[arg(long, default_value = "", env = "TESSERA_TOKEN")]
    token: String,

    /// Node id (random if unset)
    #[arg(long, env = "TESSERA_NODE_ID")]
    node_id: Option<String>,

    /// Model description (JSON)
    #[arg(long, env = "TESSERA_MODEL")]
    model: PathBuf,

    /// Store checkpoints in this directory
    #[arg(long, env = "TESSERA_CHECKPOINT_DIR", conflicts_with = "checkpoint_server")]
    checkpoint_dir: Option<PathBuf>,

    /// Upload checkpoints to this checkpoint server URL
    #[arg(long, env = "TESSERA_CHECKPOINT_SERVER")]
    checkpoint_server: Option<String>,

    /// Auth token for the checkpoint server
    #[arg(long, default_value = "", env = "TESSERA_CHECKPOINT_TOKEN")]
    checkpoint_token: String,

    /// Resume from the latest stored checkpoint
    #[arg(long, default_value = "false", env = "TESSERA_RESTORE")]
    restore: bool,

    /// Serve evaluations and average state, but never claim work
    #[arg(long, default_value = "false", env = "TESSERA_WORKER_ONLY")]
    worker_only: bool,

    /// Training run identifier
    #[arg(long, env = "TESSERA_RUN_ID")]
    run_id: String,

    /// Rows in the dataset
    #[arg(long, env = "TESSERA_DATASET_SIZE")]
    dataset_size: u64,

    /// Rows claimed per evaluation round
    #[arg(long, default_value = "500", env = "TESSERA_CLAIM_SIZE")]
    claim_size: u64,

    /// Claim lease in seconds
    #[arg(long, default_value = "600", env = "TESSERA_LEASE_SECS")]
    lease_secs: u64,

    /// Write attempts per partition update
    #[arg(long, default_value = "5", env = "TESSERA_CLAIM_RETRIES")]
    claim_retries: u32,

    /// Peers queried per round
    #[arg(long, default_value = "20", env = "TESSERA_SAMPLE_SIZE")]
    sample_size: usize,

    /// First wait after a lost partition write, in milliseconds
    #[arg(long, default_value = "250", env = "TESSERA_RETRY_BACKOFF_MS")]
    retry_backoff_ms: u64,

    /// Longest wait between partition write attempts, in milliseconds
    #[arg(long, default_value = "5000", env = "TESSERA_RETRY_BACKOFF_MAX_MS")]
    retry_backoff_max_ms: u64,

    /// First wait when no rows are left to claim, in seconds
    #[arg(long, default_value = "2", env = "TESSERA_IDLE_BACKOFF_SECS")]
    idle_backoff_secs: u64,

    /// Longest idle wait, in seconds
    #[arg(long, default_value = "60", env = "TESSERA_IDLE_BACKOFF_MAX_SECS")]
    idle_backoff_max_secs: u64,

    /// Completed claims remembered per partition
    #[arg(long, default_value = "256", env = "TESSERA_CLAIM_HISTORY")]
    claim_history: usize,

    /// Per-peer evaluation timeout in seconds
    #[arg(long, default_value = "30", env = "TESSERA_DISPATCH_TIMEOUT_SECS")]
    dispatch_timeout_secs: u64,

    /// Weight kept from the previous trust score
    #[arg(long, default_value = "0.95", env = "TESSERA_TRUST_DECAY")]
    trust_decay: f64,

    /// Minimum averaging weight of a known peer
    #[arg(long, default_value = "0.01", env = "TESSERA_TRUST_FLOOR")]
    trust_floor: f64,

    /// Minimum share of the local state in each average
    #[arg(long, default_value = "0.25", env = "TESSERA_LOCAL_FLOOR_WEIGHT")]
    local_floor_weight: f64,

    /// Seconds between averaging rounds
    #[arg(long, default_value = "300", env = "TESSERA_AVERAGING_INTERVAL_SECS")]
    averaging_interval_secs: u64,

    /// Seconds an averaging round may take before falling back to local state
    #[arg(long, default_value = "60", env = "TESSERA_AVERAGING_TIMEOUT_SECS")]
    averaging_timeout_secs: u64,

    /// Evaluation rounds between checkpoints
    #[arg(long, default_value = "900", env = "TESSERA_CHECKPOINT_INTERVAL")]
    checkpoint_interval: u64,

    /// Learning rate recorded in the shared optimizer state
    #[arg(long, default_value = "0.001", env = "TESSERA_LEARNING_RATE")]
    learning_rate: f64,

    /// Seconds between peer list exchanges
    #[arg(long, default_value = "30", env = "TESSERA_GOSSIP_INTERVAL_SECS")]
    gossip_interval_secs: u64,

    /// Seconds before a silent peer is dropped
    #[arg(long, default_value = "120", env = "TESSERA_PEER_TIMEOUT_SECS")]
    peer_timeout_secs: u64,

    /// Timeout for gossip and record requests, in seconds
    #[arg(long, default_value = "10", env = "TESSERA_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,

    /// Peers contacted per gossip round and per read
    #[arg(long, default_value = "3", env = "TESSERA_FANOUT")]
    fanout: usize,
}

impl Cli {
    fn into_config(self) -> Config {
        let checkpoint = match (self.checkpoint_server, self.checkpoint_dir) {
            (Some(url), _) => CheckpointTarget::Server {
                url,
                token: self.checkpoint_token,
            },
            (None, Some(dir)) => CheckpointTarget::Directory(dir),
            (None, None) => CheckpointTarget::Directory(PathBuf::from("./checkpoints")),
        };

        Config {
            listen_addr: self.listen,
            gossip: GossipConfig {
                node_id: self.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                public_addr: self.public_addr,
                seed_peers: self.seeds,
                gossip_interval: Duration::from_secs(self.gossip_interval_secs),
                peer_timeout: Duration::from_secs(self.peer_timeout_secs),
                fanout: self.fanout,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                auth_token: self.token,
                ..Default::default()
            },
            run: RunConfig {
                run_id: self.run_id,
                dataset_size: self.dataset_size,
                claim_size: self.claim_size,
                lease_duration: Duration::from_secs(self.lease_secs),
                claim_retries: self.claim_retries,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
                retry_backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
                idle_backoff: Duration::from_secs(self.idle_backoff_secs),
                idle_backoff_max: Duration::from_secs(self.idle_backoff_max_secs),
                claim_history: self.claim_history,
                sample_size: self.sample_size,
                dispatch_timeout: Duration::from_secs(self.dispatch_timeout_secs),
                trust_decay: self.trust_decay,
                trust_floor: self.trust_floor,
                local_floor_weight: self.local_floor_weight,
                averaging_interval: Duration::from_secs(self.averaging_interval_secs),
                averaging_timeout: Duration::from_secs(self.averaging_timeout_secs),
                checkpoint_interval: self.checkpoint_interval,
                ..Default::default()
            },
            model_path: self.model,
            learning_rate: self.learning_rate,
            checkpoint,
            restore: self.restore,
            worker_only: self.worker_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Cli::parse().into_config();
    cfg.validate().context("invalid configuration")?;
    tracing::info!(
        node_id = %cfg.gossip.node_id,
        run = %cfg.run.run_id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Tessera node"
    );

    let model = ProjectionModel::load(&cfg.model_path)
        .await
        .context("failed to load model")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tessera_node::run(cfg, shared_model(model), shutdown_rx).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "tessera-node",
        "--model",
        "model.json",
        "--run-id",
        "run",
        "--dataset-size",
        "1000",
    ];

    #[test]
    fn defaults_match_run_config() {
        let cfg = Cli::try_parse_from(REQUIRED).unwrap().into_config();
        let defaults = RunConfig::default();
        assert_eq!(cfg.run.retry_backoff, defaults.retry_backoff);
        assert_eq!(cfg.run.retry_backoff_max, defaults.retry_backoff_max);
        assert_eq!(cfg.run.idle_backoff, defaults.idle_backoff);
        assert_eq!(cfg.run.idle_backoff_max, defaults.idle_backoff_max);
        assert_eq!(cfg.run.claim_history, defaults.claim_history);
        assert_eq!(cfg.gossip.request_timeout, GossipConfig::default().request_timeout);
    }

    #[test]
    fn backoff_and_history_flags_reach_the_config() {
        let args = REQUIRED.iter().copied().chain([
            "--retry-backoff-ms",
            "100",
            "--retry-backoff-max-ms",
            "900",
            "--idle-backoff-secs",
            "1",
            "--idle-backoff-max-secs",
            "7",
            "--claim-history",
            "16",
            "--request-timeout-secs",
            "3",
        ]);
        let cfg = Cli::try_parse_from(args).unwrap().into_config();
        assert_eq!(cfg.run.retry_backoff, Duration::from_millis(100));
        assert_eq!(cfg.run.retry_backoff_max, Duration::from_millis(900));
        assert_eq!(cfg.run.idle_backoff, Duration::from_secs(1));
        assert_eq!(cfg.run.idle_backoff_max, Duration::from_secs(7));
        assert_eq!(cfg.run.claim_history, 16);
        assert_eq!(cfg.gossip.request_timeout, Duration::from_secs(3));
    }
}
