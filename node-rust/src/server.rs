use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tower_http::limit::RequestBodyLimitLayer;

use tessera_protocol::{
    train_step, DatasetPartitionState, EvaluationRequest, EvaluationResponse, GossipDht, GossipMessage, GossipResponse,
    LoopStatus, RangeSet, RunConfig, SharedModel, SharedTrainingState, TrustTable,
};

/// Largest request body accepted, gossip records included.
const BODY_LIMIT: usize = 64 * 1024 * 1024;
/// Rows a single `/evaluate` call may ask for.
const MAX_ROWS_PER_REQUEST: u64 = 1_000_000;

pub struct NodeState {
    pub auth_token: Option<String>,
    pub gossip: GossipDht,
    pub run: Arc<RunConfig>,
    pub model: SharedModel,
    pub training: Arc<RwLock<SharedTrainingState>>,
    pub trust: TrustTable,
    /// Absent on worker-only nodes.
    pub evaluation: Option<watch::Receiver<LoopStatus>>,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/gossip", post(gossip_handler))
        .route("/evaluate", post(evaluate_handler))
        .route("/api/status", get(status_handler))
        .route("/api/trust", get(trust_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(state)
}

fn check_auth(state: &NodeState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if let Some(ref expected) = state.auth_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if token == expected => Ok(()),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    } else {
        Ok(())
    }
}

async fn gossip_handler(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    Json(msg): Json<GossipMessage>,
) -> Result<Json<GossipResponse>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.gossip.handle_message(msg).await))
}

/// Worker side of an evaluation round: run the local model over the
/// requested rows.
async fn evaluate_handler(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
    Json(req): Json<EvaluationRequest>,
) -> Result<Json<EvaluationResponse>, StatusCode> {
    check_auth(&state, &headers)?;
    if req.run_id != state.run.run_id {
        tracing::debug!(run = %req.run_id, "Evaluation request for another run");
        return Err(StatusCode::CONFLICT);
    }
    if req.indices.len() > MAX_ROWS_PER_REQUEST {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    let out_of_range = req
        .indices
        .ranges()
        .last()
        .is_some_and(|r| r.end > state.run.dataset_size);
    if out_of_range {
        return Err(StatusCode::BAD_REQUEST);
    }

    let outputs = state.model.read().await.forward(&req.indices).map_err(|e| {
        tracing::warn!(claim = %req.claim_id, error = %e, "Evaluation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    tracing::debug!(claim = %req.claim_id, round = req.round, rows = outputs.len(), "Evaluated rows");
    let loss = train_on(&state, &req.indices).await;

    Ok(Json(EvaluationResponse {
        node_id: state.gossip.config.node_id.clone(),
        outputs,
        loss,
    }))
}

/// Take one optimizer step on rows we were just asked to evaluate and fold
/// the new parameters into the shared training state. A failed step only
/// costs the loss report.
async fn train_on(state: &NodeState, rows: &RangeSet) -> Option<f64> {
    let learning_rate = state.training.read().await.optimizer.learning_rate;
    let trained = {
        let mut model = state.model.write().await;
        train_step(&mut **model, rows, learning_rate).map(|loss| (loss, model.parameters()))
    };
    match trained {
        Ok((loss, parameters)) => {
            let mut training = state.training.write().await;
            training.parameters = parameters;
            training.step += 1;
            tracing::debug!(step = training.step, loss, rows = rows.len(), "Trained on evaluated rows");
            Some(loss)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipped training step");
            None
        }
    }
}

async fn status_handler(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let uptime = Utc::now() - state.started_at;
    let network = state.gossip.network_status().await;
    let step = state.training.read().await.step;
    let evaluation = state.evaluation.as_ref().map(|rx| rx.borrow().clone());
    let partition = DatasetPartitionState::new(Arc::new(state.gossip.clone()), &state.run)
        .snapshot()
        .await
        .ok()
        .map(|table| table.stats(Utc::now()));

    Ok(Json(json!({
        "node_id": network.node_id,
        "run_id": state.run.run_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime.num_seconds(),
        "step": step,
        "network": network,
        "evaluation": evaluation,
        "partition": partition,
    })))
}

/// Trust snapshot for the external weighting mechanism.
async fn trust_handler(
    State(state): State<Arc<NodeState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let scores = state.trust.snapshot().await;
    let weights: serde_json::Map<String, Value> = state
        .trust
        .incentive_weights()
        .await
        .into_iter()
        .map(|(peer, w)| (peer, json!(w)))
        .collect();

    Ok(Json(json!({
        "node_id": state.gossip.config.node_id,
        "scores": scores,
        "weights": weights,
    })))
}
