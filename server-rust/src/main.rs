mod models;
mod routes;
mod state;
mod storage;

use anyhow::Result;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera-checkpoint-server", about = "Tessera checkpoint store")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "7434", env = "TESSERA_PORT")]
    port: u16,

    /// Auth token (required for all endpoints)
    #[arg(long, env = "TESSERA_TOKEN")]
    token: String,

    /// Data directory for checkpoints and the index
    #[arg(long, default_value = "./checkpoint-data", env = "TESSERA_DATA_DIR")]
    data_dir: String,

    /// Largest accepted checkpoint, in MiB
    #[arg(long, default_value = "1024", env = "TESSERA_MAX_CHECKPOINT_MB")]
    max_checkpoint_mb: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    tracing::info!(port = cli.port, data_dir = %cli.data_dir, "Starting Tessera checkpoint server");

    let state = state::AppState::new(cli.token, cli.data_dir);

    if let Err(e) = storage::load_index(&state).await {
        tracing::warn!("Failed to load checkpoint index: {e}");
    }

    let app = routes::create_router(state, body_limit(cli.max_checkpoint_mb)).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}

fn body_limit(max_checkpoint_mb: usize) -> usize {
    max_checkpoint_mb.saturating_mul(1024 * 1024)
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
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
