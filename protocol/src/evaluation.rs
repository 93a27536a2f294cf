//! The validator's evaluation cycle.
//!
//! ```text
//!  Idle ─► Claiming ─► Dispatching ─► Scoring ─► Publishing ─► Idle
//!    ▲                                                      │
//!    └──────────────────── abort (logged) ◄─────────────────┘
//! ```
//!
//! Each cycle claims a slice of the dataset, asks a sample of peers to run
//! it, scores their outputs against the local model, folds the scores
//! into trust, marks the slice done and, every `checkpoint_interval`
//! cycles, uploads a checkpoint. No cycle failure ends the loop.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::checkpoint::{encode_checkpoint, CheckpointError, CheckpointMeta, CheckpointStore};
use crate::dht::{Dht, DhtError};
use crate::model::{ModelError, SharedModel};
use crate::partition::{jittered, Completion, DatasetPartitionState};
use crate::peer::{sample_peers, PeerInfo};
use crate::pool::{response_rate, PeerOutcome, PeerRequestPool};
use crate::trust::TrustTable;
use crate::types::{EvaluationRequest, NodeId, PartitionClaim, RunConfig, SharedTrainingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Claiming,
    Dispatching,
    Scoring,
    Publishing,
}

/// What the loop is doing, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub rounds: u64,
    pub aborts: u64,
    pub last_response_rate: Option<f64>,
    pub last_checkpoint_step: Option<u64>,
}

/// Local failures that abort one cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("model failed: {0}")]
    Model(#[from] ModelError),
    #[error("peer discovery failed: {0}")]
    Discovery(#[from] DhtError),
    #[error("model returned {found} outputs for {expected} rows")]
    ReferenceLength { expected: u64, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    NoPeers,
    NoWork,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub round: u64,
    pub claim_id: String,
    pub rows: u64,
    pub scores: HashMap<NodeId, f64>,
    pub response_rate: f64,
    /// Mean training loss the workers reported, if any did.
    pub worker_loss: Option<f64>,
    pub completion: Completion,
    pub checkpoint: Option<CheckpointMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Round(RoundReport),
    Idle(IdleReason),
}

/// Quality of a peer's outputs: cosine similarity to the reference,
/// clipped to [0, 1]. Wrong length or non-finite output scores zero.
pub fn similarity_score(reference: &[f32], outputs: &[f32]) -> f64 {
    if reference.len() != outputs.len() || outputs.iter().any(|v| !v.is_finite()) {
        return 0.0;
    }
    let (mut dot, mut ref_norm, mut out_norm) = (0.0f64, 0.0f64, 0.0f64);
    for (r, o) in reference.iter().zip(outputs) {
        let (r, o) = (f64::from(*r), f64::from(*o));
        dot += r * o;
        ref_norm += r * r;
        out_norm += o * o;
    }
    if ref_norm == 0.0 || out_norm == 0.0 {
        return if ref_norm == out_norm { 1.0 } else { 0.0 };
    }
    (dot / (ref_norm.sqrt() * out_norm.sqrt())).clamp(0.0, 1.0)
}

/// Mean of the finite losses reported by responding peers.
pub fn mean_reported_loss(outcomes: &HashMap<NodeId, PeerOutcome>) -> Option<f64> {
    let losses: Vec<f64> = outcomes
        .values()
        .filter_map(|o| o.as_ref().ok()?.loss)
        .filter(|l| l.is_finite())
        .collect();
    (!losses.is_empty()).then(|| losses.iter().sum::<f64>() / losses.len() as f64)
}

/// Round scores for every sampled peer; failures score zero.
pub fn score_round(reference: &[f32], outcomes: &HashMap<NodeId, PeerOutcome>) -> HashMap<NodeId, f64> {
    outcomes
        .iter()
        .map(|(peer, outcome)| {
            let score = match outcome {
                Ok(response) => similarity_score(reference, &response.outputs),
                Err(_) => 0.0,
            };
            (peer.clone(), score)
        })
        .collect()
}

pub struct EvaluationLoop {
    config: Arc<RunConfig>,
    dht: Arc<dyn Dht>,
    partitions: DatasetPartitionState,
    pool: PeerRequestPool,
    trust: TrustTable,
    model: SharedModel,
    state: Arc<RwLock<SharedTrainingState>>,
    checkpoints: Arc<dyn CheckpointStore>,
    status: watch::Sender<LoopStatus>,
    round: u64,
    since_checkpoint: u64,
}

impl EvaluationLoop {
    pub fn new(
        config: Arc<RunConfig>,
        dht: Arc<dyn Dht>,
        pool: PeerRequestPool,
        trust: TrustTable,
        model: SharedModel,
        state: Arc<RwLock<SharedTrainingState>>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (status, _) = watch::channel(LoopStatus {
            state: LoopState::Idle,
            rounds: 0,
            aborts: 0,
            last_response_rate: None,
            last_checkpoint_step: None,
        });
        Self {
            partitions: DatasetPartitionState::new(dht.clone(), &config),
            config,
            dht,
            pool,
            trust,
            model,
            state,
            checkpoints,
            status,
            round: 0,
            since_checkpoint: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn partitions(&self) -> &DatasetPartitionState {
        &self.partitions
    }

    fn enter(&self, state: LoopState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// One pass through the state machine. Leaves the loop in `Idle`
    /// whichever way it ends.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        let outcome = self.cycle().await;
        self.enter(LoopState::Idle);
        outcome
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        self.enter(LoopState::Claiming);
        let peers = sample_peers(self.dht.peers().await?, self.config.sample_size);
        if peers.is_empty() {
            return Ok(CycleOutcome::Idle(IdleReason::NoPeers));
        }
        let Some(claim) = self.partitions.claim(self.config.claim_size).await else {
            return Ok(CycleOutcome::Idle(IdleReason::NoWork));
        };

        let (scores, rate, worker_loss) = match self.evaluate_claim(&claim, &peers).await {
            Ok(scored) => scored,
            Err(e) => {
                // return the rows to the pool now rather than at lease expiry
                self.partitions.release(&claim).await;
                return Err(e);
            }
        };
        self.trust.record_round(&scores).await;
        let completion = self.partitions.complete(&claim).await;

        self.enter(LoopState::Publishing);
        self.since_checkpoint += 1;
        let checkpoint = if self.since_checkpoint >= self.config.checkpoint_interval {
            match self.publish_checkpoint().await {
                Ok(meta) => {
                    self.since_checkpoint = 0;
                    Some(meta)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Checkpoint upload failed, retrying next cycle");
                    None
                }
            }
        } else {
            None
        };

        let report = RoundReport {
            round: self.round,
            claim_id: claim.id,
            rows: claim.ranges.len(),
            scores,
            response_rate: rate,
            worker_loss,
            completion,
            checkpoint,
        };
        self.round += 1;
        self.status.send_modify(|s| {
            s.rounds = self.round;
            s.last_response_rate = Some(rate);
            if let Some(meta) = &report.checkpoint {
                s.last_checkpoint_step = Some(meta.step);
            }
        });
        tracing::info!(
            round = report.round,
            rows = report.rows,
            peers = report.scores.len(),
            response_rate = rate,
            worker_loss = ?report.worker_loss,
            "🔁 Evaluation round complete"
        );
        Ok(CycleOutcome::Round(report))
    }

    /// Dispatch the claimed rows and score the answers against our own
    /// forward pass.
    async fn evaluate_claim(
        &self,
        claim: &PartitionClaim,
        peers: &[PeerInfo],
    ) -> Result<(HashMap<NodeId, f64>, f64, Option<f64>), CycleError> {
        self.enter(LoopState::Dispatching);
        let request = EvaluationRequest {
            run_id: self.config.run_id.clone(),
            round: self.round,
            step: self.state.read().await.step,
            claim_id: claim.id.clone(),
            indices: claim.ranges.clone(),
        };
        let outcomes = self
            .pool
            .dispatch(peers, &request, self.config.dispatch_timeout)
            .await;
        let rate = response_rate(&outcomes);

        self.enter(LoopState::Scoring);
        let reference = self.model.read().await.forward(&claim.ranges)?;
        if reference.len() as u64 != claim.ranges.len() {
            return Err(CycleError::ReferenceLength {
                expected: claim.ranges.len(),
                found: reference.len(),
            });
        }
        Ok((score_round(&reference, &outcomes), rate, mean_reported_loss(&outcomes)))
    }

    async fn publish_checkpoint(&self) -> Result<CheckpointMeta, CheckpointError> {
        let state = self.state.read().await.clone();
        let bytes = encode_checkpoint(&state)?;
        let meta = self.checkpoints.upload(&state.run_id, state.step, bytes).await?;
        tracing::info!(step = meta.step, sha256 = %meta.sha256, size = meta.size, "💾 Checkpoint uploaded");
        Ok(meta)
    }

    /// Cycle until `shutdown` flips. Idle cycles back off exponentially;
    /// aborted cycles wait one base backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let base = self.config.idle_backoff;
        let mut idle = base;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = shutdown.changed() => break,
            };
            let pause = match outcome {
                Ok(CycleOutcome::Round(_)) => {
                    idle = base;
                    Duration::ZERO
                }
                Ok(CycleOutcome::Idle(reason)) => {
                    tracing::debug!(?reason, backoff = ?idle, "Nothing to evaluate");
                    let pause = jittered(idle);
                    idle = (idle * 2).min(self.config.idle_backoff_max);
                    pause
                }
                Err(e) => {
                    tracing::warn!(error = %e, "⚠️ Evaluation cycle aborted");
                    self.status.send_modify(|s| s.aborts += 1);
                    idle = base;
                    base
                }
            };
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.enter(LoopState::Idle);
        tracing::info!(rounds = self.round, "Evaluation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::dht::MemoryDht;
    use crate::model::{shared_model, Model};
    use crate::peer::PeerInfo;
    use crate::pool::{PeerError, PeerTransport};
    use crate::ranges::RangeSet;
    use crate::types::{ClaimStatus, EvaluationResponse, Tensor};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Output of row `i` is `i + 1`. Fails the first `failures` forwards.
    struct RowModel {
        parameters: Vec<Tensor>,
        failures: AtomicUsize,
    }

    impl RowModel {
        fn new(failures: usize) -> Self {
            Self {
                parameters: vec![vec![0.0; 2]],
                failures: AtomicUsize::new(failures),
            }
        }
    }

    fn reference(indices: &RangeSet) -> Vec<f32> {
        indices.indices().map(|i| i as f32 + 1.0).collect()
    }

    impl Model for RowModel {
        fn forward(&self, inputs: &RangeSet) -> Result<Vec<f32>, ModelError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ModelError::Load("weights missing".into()));
            }
            Ok(reference(inputs))
        }

        fn parameters(&self) -> Vec<Tensor> {
            self.parameters.clone()
        }

        fn load_parameters(&mut self, parameters: &[Tensor]) -> Result<(), ModelError> {
            self.parameters = parameters.to_vec();
            Ok(())
        }

        fn optimizer_step(&mut self, _gradients: &[Tensor], _learning_rate: f64) -> Result<(), ModelError> {
            Ok(())
        }
    }

    /// "honest" peers echo the reference, "liar" negates it, anyone else
    /// is unreachable.
    struct ScriptedPeers;

    #[async_trait]
    impl PeerTransport for ScriptedPeers {
        async fn request(&self, peer: &PeerInfo, payload: &EvaluationRequest) -> PeerOutcome {
            let outputs = reference(&payload.indices);
            let (outputs, loss) = match peer.node_id.as_str() {
                id if id.starts_with("honest") => (outputs, 0.25),
                "liar" => (outputs.into_iter().map(|v| -v).collect(), 0.75),
                _ => return Err(PeerError::Transport("connection refused".into())),
            };
            Ok(EvaluationResponse {
                node_id: peer.node_id.clone(),
                outputs,
                loss: Some(loss),
            })
        }
    }

    /// Fails the first `failures` uploads.
    struct FlakyStore {
        inner: MemoryCheckpointStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn upload(&self, run_id: &str, step: u64, bytes: Vec<u8>) -> Result<CheckpointMeta, CheckpointError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CheckpointError::Upload("HTTP 503".into()));
            }
            self.inner.upload(run_id, step, bytes).await
        }
    }

    struct Harness {
        evaluation: EvaluationLoop,
        trust: TrustTable,
        store: MemoryCheckpointStore,
    }

    async fn harness(peers: &[&str], config: RunConfig, model_failures: usize, upload_failures: usize) -> Harness {
        let dht = MemoryDht::new("validator");
        for peer in peers {
            dht.join(*peer).await;
        }
        let config = Arc::new(config);
        let trust = TrustTable::from_config(&config);
        let store = MemoryCheckpointStore::new();
        let checkpoints = Arc::new(FlakyStore {
            inner: store.clone(),
            failures: AtomicUsize::new(upload_failures),
        });
        let state = Arc::new(RwLock::new(SharedTrainingState::new(&config.run_id, vec![vec![0.0; 2]], 0.1)));
        let evaluation = EvaluationLoop::new(
            config,
            Arc::new(dht),
            PeerRequestPool::new(Arc::new(ScriptedPeers)),
            trust.clone(),
            shared_model(RowModel::new(model_failures)),
            state,
            checkpoints,
        );
        Harness { evaluation, trust, store }
    }

    fn config(dataset_size: u64, claim_size: u64) -> RunConfig {
        RunConfig {
            run_id: "eval".into(),
            dataset_size,
            claim_size,
            trust_decay: 0.5,
            trust_floor: 0.0,
            dispatch_timeout: Duration::from_secs(1),
            checkpoint_interval: 2,
            ..Default::default()
        }
    }

    #[test]
    fn similarity_rewards_matching_outputs() {
        let reference = [1.0, 2.0, 3.0];
        assert!((similarity_score(&reference, &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-9);
        assert_eq!(similarity_score(&reference, &[-1.0, -2.0, -3.0]), 0.0);
        assert_eq!(similarity_score(&reference, &[1.0, 2.0]), 0.0);
        assert_eq!(similarity_score(&reference, &[1.0, f32::NAN, 3.0]), 0.0);
        assert_eq!(similarity_score(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        let partial = similarity_score(&reference, &[3.0, 2.0, 1.0]);
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[tokio::test]
    async fn round_scores_peers_and_completes_claim() {
        let mut h = harness(&["honest-1", "liar", "gone"], config(100, 10), 0, 0).await;
        let CycleOutcome::Round(report) = h.evaluation.run_cycle().await.unwrap() else {
            panic!("expected a round");
        };

        assert_eq!(report.rows, 10);
        assert_eq!(report.completion, Completion::Recorded);
        assert!((report.scores["honest-1"] - 1.0).abs() < 1e-9);
        assert_eq!(report.scores["liar"], 0.0);
        assert_eq!(report.scores["gone"], 0.0);
        assert!((report.response_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.worker_loss, Some(0.5));

        assert!((h.trust.get("honest-1").await.unwrap().score - 0.5).abs() < 1e-9);
        assert_eq!(h.trust.get("gone").await.unwrap().score, 0.0);

        let table = h.evaluation.partitions().snapshot().await.unwrap();
        assert_eq!(table.completed, RangeSet::full(10));
        assert_eq!(h.evaluation.subscribe().borrow().state, LoopState::Idle);
    }

    #[tokio::test]
    async fn idles_without_peers_or_work() {
        let mut lonely = harness(&[], config(100, 10), 0, 0).await;
        assert_eq!(
            lonely.evaluation.run_cycle().await.unwrap(),
            CycleOutcome::Idle(IdleReason::NoPeers)
        );
        // nothing was leased while there was nobody to ask
        let table = lonely.evaluation.partitions().snapshot().await.unwrap();
        assert!(table.claims.is_empty());

        let mut h = harness(&["honest-1"], config(10, 10), 0, 0).await;
        assert!(matches!(h.evaluation.run_cycle().await.unwrap(), CycleOutcome::Round(_)));
        assert_eq!(
            h.evaluation.run_cycle().await.unwrap(),
            CycleOutcome::Idle(IdleReason::NoWork)
        );
    }

    #[tokio::test]
    async fn failed_checkpoint_is_retried_next_cycle() {
        let mut h = harness(&["honest-1"], config(100, 10), 0, 1).await;
        let mut checkpoints = Vec::new();
        for _ in 0..4 {
            let CycleOutcome::Round(report) = h.evaluation.run_cycle().await.unwrap() else {
                panic!("expected a round");
            };
            checkpoints.push(report.checkpoint.is_some());
        }
        // due at the 2nd cycle, failed, retried at the 3rd, next due at the 5th
        assert_eq!(checkpoints, vec![false, false, true, false]);
        assert_eq!(h.store.uploads().await.len(), 1);
    }

    #[tokio::test]
    async fn model_failure_aborts_cycle_only() {
        let mut h = harness(&["honest-1"], config(100, 10), 1, 0).await;
        assert!(matches!(h.evaluation.run_cycle().await, Err(CycleError::Model(_))));
        assert_eq!(h.evaluation.subscribe().borrow().state, LoopState::Idle);
        assert!(matches!(h.evaluation.run_cycle().await.unwrap(), CycleOutcome::Round(_)));
    }

    #[tokio::test]
    async fn aborted_cycle_returns_its_rows() {
        let mut h = harness(&["honest-1"], config(10, 10), 1, 0).await;
        assert!(h.evaluation.run_cycle().await.is_err());

        let table = h.evaluation.partitions().snapshot().await.unwrap();
        assert_eq!(table.available(Utc::now()), RangeSet::full(10));
        assert!(table.claims.iter().all(|c| c.status == ClaimStatus::Abandoned));

        // the same rows are evaluated right away, not after the lease
        let CycleOutcome::Round(report) = h.evaluation.run_cycle().await.unwrap() else {
            panic!("expected a round");
        };
        assert_eq!(report.rows, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_abort_and_stops_on_shutdown() {
        let h = harness(&["honest-1", "honest-2"], config(40, 10), 1, 0).await;
        let mut status = h.evaluation.subscribe();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(h.evaluation.run(shutdown));

        let seen = status.wait_for(|s| s.rounds >= 2).await.unwrap().clone();
        assert_eq!(seen.aborts, 1);

        stop.send(true).unwrap();
        task.await.unwrap();
        assert!(h.trust.get("honest-2").await.unwrap().rounds >= 2);
    }
}
