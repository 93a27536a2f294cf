use async_trait::async_trait;

use tessera_protocol::{decode_checkpoint, sha256_hex, CheckpointError, CheckpointMeta, CheckpointStore, SharedTrainingState};

/// Header carrying the hex SHA-256 of a checkpoint body.
pub const SHA256_HEADER: &str = "x-checkpoint-sha256";

/// Uploads checkpoints to a `tessera-checkpoint-server`.
pub struct CheckpointClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl CheckpointClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl CheckpointStore for CheckpointClient {
    async fn upload(&self, run_id: &str, step: u64, bytes: Vec<u8>) -> Result<CheckpointMeta, CheckpointError> {
        let url = format!("{}/api/checkpoints/{}/{}", self.base_url, run_id, step);
        let resp = self
            .auth(self.http.post(&url))
            .header(SHA256_HEADER, sha256_hex(&bytes))
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|e| CheckpointError::Upload(format!("failed to reach checkpoint server: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(CheckpointError::Upload(format!("HTTP {status}: {detail}")));
        }
        resp.json()
            .await
            .map_err(|e| CheckpointError::Upload(format!("bad upload response: {e}")))
    }

    async fn latest(&self, run_id: &str) -> Result<Option<SharedTrainingState>, CheckpointError> {
        let url = format!("{}/api/checkpoints/{}/latest", self.base_url, run_id);
        let resp = self
            .auth(self.http.get(&url))
            .send()
            .await
            .map_err(|e| CheckpointError::Upload(format!("failed to reach checkpoint server: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(CheckpointError::Upload(format!("fetch latest failed: HTTP {}", resp.status())));
        }
        let expected = resp
            .headers()
            .get(SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CheckpointError::Upload(format!("failed to read checkpoint: {e}")))?;
        decode_checkpoint(&bytes, expected.as_deref()).map(Some)
    }
}
