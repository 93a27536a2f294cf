//! Fan-out of one request to many peers with a hard deadline.
//!
//! Every peer gets its own task and its own timeout. Collection joins on
//! the deadline, not on every peer answering, and a peer that fails only
//! ever produces its own error entry.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::peer::PeerInfo;
use crate::types::{EvaluationRequest, EvaluationResponse, NodeId};

/// Slack after the per-request timeout before collection stops waiting on
/// tasks that ignore cancellation.
const COLLECT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type PeerOutcome = Result<EvaluationResponse, PeerError>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request(&self, peer: &PeerInfo, payload: &EvaluationRequest) -> PeerOutcome;
}

/// Fraction of outcomes that are successful responses.
pub fn response_rate(outcomes: &HashMap<NodeId, PeerOutcome>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let ok = outcomes.values().filter(|o| o.is_ok()).count();
    ok as f64 / outcomes.len() as f64
}

#[derive(Clone)]
pub struct PeerRequestPool {
    transport: Arc<dyn PeerTransport>,
}

impl PeerRequestPool {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Send `payload` to every peer concurrently and return whatever came
    /// back within `timeout`. Every distinct peer gets exactly one entry.
    pub async fn dispatch(
        &self,
        peers: &[PeerInfo],
        payload: &EvaluationRequest,
        timeout: Duration,
    ) -> HashMap<NodeId, PeerOutcome> {
        let deadline = tokio::time::Instant::now() + timeout + COLLECT_GRACE;
        let payload = Arc::new(payload.clone());
        let mut pending: HashSet<NodeId> = HashSet::with_capacity(peers.len());
        let mut results = HashMap::with_capacity(peers.len());
        let mut tasks = JoinSet::new();

        for peer in peers {
            if !pending.insert(peer.node_id.clone()) {
                continue;
            }
            let transport = self.transport.clone();
            let payload = payload.clone();
            let peer = peer.clone();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, transport.request(&peer, &payload)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PeerError::Timeout(timeout)),
                };
                (peer.node_id, outcome)
            });
        }

        let mut timed_out = false;
        while !tasks.is_empty() {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((node_id, outcome)))) => {
                    if let Err(e) = &outcome {
                        tracing::debug!(peer = %node_id, error = %e, "Peer request failed");
                    }
                    pending.remove(&node_id);
                    results.insert(node_id, outcome);
                }
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "Peer request task died"),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        for node_id in pending {
            let outcome = if timed_out {
                Err(PeerError::Timeout(timeout))
            } else {
                Err(PeerError::Transport("request task panicked".into()))
            };
            results.insert(node_id, outcome);
        }

        let ok = results.values().filter(|o| o.is_ok()).count();
        tracing::debug!(peers = results.len(), responded = ok, "Dispatch collected");
        results
    }
}

/// Sends evaluation requests to `http://{address}/evaluate`.
pub struct HttpTransport {
    http: reqwest::Client,
    auth_token: String,
}

impl HttpTransport {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn request(&self, peer: &PeerInfo, payload: &EvaluationRequest) -> PeerOutcome {
        let url = format!("http://{}/evaluate", peer.address);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .json(payload)
            .send()
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PeerError::Transport(format!("HTTP {}", resp.status())));
        }

        let response: EvaluationResponse = resp
            .json()
            .await
            .map_err(|e| PeerError::Malformed(e.to_string()))?;
        if response.node_id != peer.node_id {
            return Err(PeerError::Malformed(format!(
                "answered as {} instead of {}",
                response.node_id, peer.node_id
            )));
        }
        Ok(response)
    }
}
