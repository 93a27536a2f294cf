use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use tessera_protocol::{decode_checkpoint, sha256_hex, CheckpointError, CheckpointMeta};

use crate::models::RunSummary;
use crate::state::{valid_run_id, AppState};
use crate::storage;

pub const SHA256_HEADER: &str = "x-checkpoint-sha256";
pub const STEP_HEADER: &str = "x-checkpoint-step";

type ApiError = (StatusCode, String);

pub fn create_router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/api/checkpoints/{run_id}", get(list_checkpoints))
        .route("/api/checkpoints/{run_id}/latest", get(latest_checkpoint))
        .route("/api/checkpoints/{run_id}/{step}", get(get_checkpoint).post(upload_checkpoint))
        .route("/api/status", get(status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == state.auth_token => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "unauthorized".into())),
    }
}

fn check_run_id(run_id: &str) -> Result<(), ApiError> {
    if valid_run_id(run_id) {
        Ok(())
    } else {
        Err((StatusCode::BAD_REQUEST, format!("invalid run id {run_id:?}")))
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "Checkpoint storage failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "storage failure".into())
}

async fn upload_checkpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((run_id, step)): Path<(String, u64)>,
    body: Bytes,
) -> Result<Json<CheckpointMeta>, ApiError> {
    check_auth(&state, &headers)?;
    check_run_id(&run_id)?;

    let expected = headers.get(SHA256_HEADER).and_then(|v| v.to_str().ok());
    let decoded = decode_checkpoint(&body, expected).map_err(|e| match e {
        CheckpointError::Integrity { .. } => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        _ => (StatusCode::BAD_REQUEST, e.to_string()),
    })?;
    if decoded.run_id != run_id || decoded.step != step {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("body holds {}@{}, not {run_id}@{step}", decoded.run_id, decoded.step),
        ));
    }

    let sha256 = sha256_hex(&body);
    let _upload = state.uploads.lock().await;
    let existing = state
        .checkpoints
        .read()
        .await
        .get(&run_id)
        .and_then(|metas| metas.iter().find(|m| m.step == step).cloned());
    if let Some(existing) = existing {
        if existing.sha256 == sha256 {
            return Ok(Json(existing));
        }
        return Err((StatusCode::CONFLICT, format!("step {step} already stored with other contents")));
    }

    let meta = CheckpointMeta {
        run_id: run_id.clone(),
        step,
        sha256,
        size: body.len() as u64,
        stored_at: Utc::now(),
    };
    storage::save_checkpoint(&state, &meta, &body).await.map_err(internal)?;
    {
        let mut checkpoints = state.checkpoints.write().await;
        let metas = checkpoints.entry(run_id.clone()).or_default();
        let at = metas.partition_point(|m| m.step < step);
        metas.insert(at, meta.clone());
    }
    storage::save_index(&state).await.map_err(internal)?;

    tracing::info!(run = %run_id, step, size = meta.size, "💾 Stored checkpoint");
    Ok(Json(meta))
}

async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<CheckpointMeta>>, ApiError> {
    check_auth(&state, &headers)?;
    check_run_id(&run_id)?;
    let metas = state.checkpoints.read().await.get(&run_id).cloned().unwrap_or_default();
    Ok(Json(metas))
}

async fn serve(state: &AppState, meta: CheckpointMeta) -> Result<impl IntoResponse, ApiError> {
    let bytes = storage::read_checkpoint(state, &meta).await.map_err(internal)?;
    Ok((
        [
            ("content-type", "application/json".to_string()),
            (SHA256_HEADER, meta.sha256),
            (STEP_HEADER, meta.step.to_string()),
        ],
        bytes,
    ))
}

async fn latest_checkpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    check_run_id(&run_id)?;
    let meta = state
        .checkpoints
        .read()
        .await
        .get(&run_id)
        .and_then(|metas| metas.last().cloned())
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no checkpoints for {run_id}")))?;
    serve(&state, meta).await
}

async fn get_checkpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((run_id, step)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    check_run_id(&run_id)?;
    let meta = state
        .checkpoints
        .read()
        .await
        .get(&run_id)
        .and_then(|metas| metas.iter().find(|m| m.step == step).cloned())
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no checkpoint {run_id}@{step}")))?;
    serve(&state, meta).await
}

async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_auth(&state, &headers)?;
    let checkpoints = state.checkpoints.read().await;
    let mut runs: Vec<RunSummary> = checkpoints
        .iter()
        .filter_map(|(run_id, metas)| RunSummary::from_metas(run_id, metas))
        .collect();
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.start_time).num_seconds(),
        "runs": runs,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::{encode_checkpoint, SharedTrainingState};

    const TOKEN: &str = "secret";

    struct TestServer {
        base: String,
        http: reqwest::Client,
        _dir: tempfile::TempDir,
    }

    async fn spawn_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(TOKEN.into(), dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state, 1024 * 1024)).await.unwrap();
        });
        TestServer {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn checkpoint(run_id: &str, step: u64, value: f32) -> Vec<u8> {
        let mut state = SharedTrainingState::new(run_id, vec![vec![value; 4]], 0.01);
        state.step = step;
        encode_checkpoint(&state).unwrap()
    }

    impl TestServer {
        async fn upload(&self, run_id: &str, step: u64, body: Vec<u8>, sha: Option<String>) -> reqwest::Response {
            let mut req = self
                .http
                .post(format!("{}/api/checkpoints/{run_id}/{step}", self.base))
                .bearer_auth(TOKEN)
                .body(body);
            if let Some(sha) = sha {
                req = req.header(SHA256_HEADER, sha);
            }
            req.send().await.unwrap()
        }

        async fn get(&self, path: &str) -> reqwest::Response {
            self.http
                .get(format!("{}{path}", self.base))
                .bearer_auth(TOKEN)
                .send()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn stored_checkpoints_are_listed_and_served() {
        let server = spawn_server().await;
        assert_eq!(server.get("/api/checkpoints/run/latest").await.status(), StatusCode::NOT_FOUND);

        for step in [5, 12] {
            let body = checkpoint("run", step, step as f32);
            let sha = sha256_hex(&body);
            let resp = server.upload("run", step, body, Some(sha.clone())).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let meta: CheckpointMeta = resp.json().await.unwrap();
            assert_eq!(meta.sha256, sha);
        }

        let list: Vec<CheckpointMeta> = server.get("/api/checkpoints/run").await.json().await.unwrap();
        assert_eq!(list.iter().map(|m| m.step).collect::<Vec<_>>(), vec![5, 12]);

        let latest = server.get("/api/checkpoints/run/latest").await;
        assert_eq!(latest.headers()[STEP_HEADER], "12");
        let sha = latest.headers()[SHA256_HEADER].to_str().unwrap().to_string();
        let bytes = latest.bytes().await.unwrap();
        let state = decode_checkpoint(&bytes, Some(&sha)).unwrap();
        assert_eq!(state.step, 12);

        let older = server.get("/api/checkpoints/run/5").await;
        assert_eq!(older.status(), StatusCode::OK);
        assert_eq!(older.headers()[STEP_HEADER], "5");

        let status: Value = server.get("/api/status").await.json().await.unwrap();
        assert_eq!(status["runs"][0]["latest_step"], 12);
        assert_eq!(status["runs"][0]["checkpoints"], 2);
    }

    #[tokio::test]
    async fn rejects_bad_uploads() {
        let server = spawn_server().await;

        let body = checkpoint("run", 3, 1.0);
        let resp = server.upload("run", 3, body.clone(), Some(sha256_hex(b"other"))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = server.upload("run", 4, body.clone(), None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server.upload("run", 3, b"not json".to_vec(), None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server
            .http
            .post(format!("{}/api/checkpoints/run/3", server.base))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let list: Vec<CheckpointMeta> = server.get("/api/checkpoints/run").await.json().await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn concurrent_uploads_of_one_step_leave_a_single_consistent_copy() {
        let server = Arc::new(spawn_server().await);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let server = server.clone();
            tasks.spawn(async move {
                let body = checkpoint("run", 9, i as f32);
                let sha = sha256_hex(&body);
                let status = server.upload("run", 9, body, None).await.status();
                (status, sha)
            });
        }

        let mut stored = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (status, sha) = joined.unwrap();
            match status {
                StatusCode::OK => stored.push(sha),
                StatusCode::CONFLICT => {}
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(stored.len(), 1);

        let latest = server.get("/api/checkpoints/run/latest").await;
        let sha = latest.headers()[SHA256_HEADER].to_str().unwrap().to_string();
        assert_eq!(sha, stored[0]);
        let bytes = latest.bytes().await.unwrap();
        assert_eq!(sha256_hex(&bytes), stored[0]);
    }

    #[tokio::test]
    async fn same_step_is_idempotent_but_never_overwritten() {
        let server = spawn_server().await;
        let body = checkpoint("run", 7, 1.0);

        assert_eq!(server.upload("run", 7, body.clone(), None).await.status(), StatusCode::OK);
        assert_eq!(server.upload("run", 7, body, None).await.status(), StatusCode::OK);
        let resp = server.upload("run", 7, checkpoint("run", 7, 2.0), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let list: Vec<CheckpointMeta> = server.get("/api/checkpoints/run").await.json().await.unwrap();
        assert_eq!(list.len(), 1);
    }
}
