use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use tessera_protocol::{
    CheckpointStore, Dht, EvaluationLoop, GossipDht, HttpTransport, PeerRequestPool, SharedModel,
    SharedTrainingState, StateAverager, TrustTable,
};

use crate::client::CheckpointClient;
use crate::config::{CheckpointTarget, Config};
use crate::server::{create_router, NodeState};
use crate::storage::FsCheckpointStore;

fn checkpoint_store(target: &CheckpointTarget) -> Arc<dyn CheckpointStore> {
    match target {
        CheckpointTarget::Directory(dir) => Arc::new(FsCheckpointStore::new(dir)),
        CheckpointTarget::Server { url, token } => Arc::new(CheckpointClient::new(url, token)),
    }
}

/// Pick the starting state: the latest checkpoint if asked to restore,
/// else the model's own parameters at step 0. Peers that are further
/// along win over both.
async fn initial_state(
    config: &Config,
    model: &SharedModel,
    checkpoints: &dyn CheckpointStore,
    averager: &StateAverager,
) -> Result<SharedTrainingState> {
    let mut state = SharedTrainingState::new(&config.run.run_id, model.read().await.parameters(), config.learning_rate);

    if config.restore {
        match checkpoints.latest(&config.run.run_id).await {
            Ok(Some(restored)) if state.is_compatible_with(&restored) => {
                tracing::info!(step = restored.step, "📂 Restored checkpoint");
                state = restored;
            }
            Ok(Some(restored)) => {
                tracing::warn!(shape = ?restored.shape(), "Checkpoint does not fit the model, ignoring it");
            }
            Ok(None) => tracing::info!("No checkpoint to restore"),
            Err(e) => tracing::warn!(error = %e, "Failed to restore checkpoint"),
        }
    }

    if let Some(adopted) = averager.load_from_peers(&state).await {
        state = adopted;
    }
    if state.step > 0 {
        model
            .write()
            .await
            .load_parameters(&state.parameters)
            .context("starting state does not fit the model")?;
    }
    Ok(state)
}

/// Run a node until `shutdown` flips: DHT replica, HTTP endpoints,
/// averaging and (unless worker-only) the evaluation loop.
pub async fn run(config: Config, model: SharedModel, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    config.validate()?;
    let run = Arc::new(config.run.clone());

    let gossip = GossipDht::new(config.gossip.clone());
    let dht: Arc<dyn Dht> = Arc::new(gossip.clone());
    let trust = TrustTable::from_config(&run);
    let checkpoints = checkpoint_store(&config.checkpoint);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, node_id = %config.gossip.node_id, "Listening");

    gossip.bootstrap().await?;

    let averager = StateAverager::new(dht.clone(), trust.clone(), run.clone());
    let training = Arc::new(RwLock::new(
        initial_state(&config, &model, checkpoints.as_ref(), &averager).await?,
    ));

    let evaluation = (!config.worker_only).then(|| {
        let pool = PeerRequestPool::new(Arc::new(HttpTransport::new(config.gossip.auth_token.clone())));
        EvaluationLoop::new(
            run.clone(),
            dht.clone(),
            pool,
            trust.clone(),
            model.clone(),
            training.clone(),
            checkpoints.clone(),
        )
    });

    let state = Arc::new(NodeState {
        auth_token: config.auth_token(),
        gossip: gossip.clone(),
        run: run.clone(),
        model: model.clone(),
        training: training.clone(),
        trust,
        evaluation: evaluation.as_ref().map(EvaluationLoop::subscribe),
        started_at: Utc::now(),
    });

    let server = {
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state))
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        })
    };
    let gossip_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gossip.run_gossip_loop(shutdown).await })
    };
    let averaging = tokio::spawn(averager.run(training, model, shutdown.clone()));

    match evaluation {
        Some(evaluation) => {
            tracing::info!(run = %run.run_id, dataset = run.dataset_size, "🚀 Starting evaluation loop");
            evaluation.run(shutdown.clone()).await;
        }
        None => {
            tracing::info!(run = %run.run_id, "🚀 Running as worker only");
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
    }

    let _ = tokio::join!(gossip_task, averaging);
    server.await.context("server task panicked")?.context("server failed")?;
    tracing::info!("Node shut down");
    Ok(())
}
