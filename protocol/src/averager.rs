//! Periodic weighted averaging of model and optimizer state with peers.
//!
//! Each node publishes its state under its own DHT key and, on a fixed
//! cadence, pulls the states its peers published and merges them with its
//! own. Weights come from the local trust table; the local state always
//! keeps at least `local_floor_weight` of the mix. Merging is a weighted
//! arithmetic mean, so rounds on different nodes commute and converge.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::dht::{Dht, DhtError, PutOutcome};
use crate::model::SharedModel;
use crate::trust::TrustTable;
use crate::types::{NodeId, OptimizerState, RunConfig, SharedTrainingState, Tensor};

/// Attempts at writing our own state record before giving up for the round.
const PUBLISH_ATTEMPTS: u32 = 3;

/// Split the unit mass between the local state and its peers.
///
/// Raw weights are normalized over everyone present; the local share is
/// then raised to `local_floor` if needed, with peers scaled down
/// proportionally. With no usable peer weight the local state takes all.
pub fn resolve_weights(local_raw: f64, peer_raw: &[f64], local_floor: f64) -> (f64, Vec<f64>) {
    let sanitize = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let local_raw = sanitize(local_raw);
    let peer_raw: Vec<f64> = peer_raw.iter().copied().map(sanitize).collect();
    let peer_total: f64 = peer_raw.iter().sum();
    if peer_total <= 0.0 {
        return (1.0, vec![0.0; peer_raw.len()]);
    }
    let total = local_raw + peer_total;
    let local = (local_raw / total).max(local_floor.clamp(0.0, 1.0));
    let peers = peer_raw.iter().map(|w| w / peer_total * (1.0 - local)).collect();
    (local, peers)
}

/// Weighted element-wise mean of `local` and compatible peer states.
///
/// Weights are renormalized over the states actually merged. Accumulation
/// is done in f64 and rounded to f32 once at the end, so repeated rounds
/// do not drift. Peers with a different layout, run, or non-finite values
/// are skipped. The merged step is one past the highest step merged.
pub fn merge_states(
    local: &SharedTrainingState,
    local_weight: f64,
    peers: &[(&SharedTrainingState, f64)],
) -> SharedTrainingState {
    let mut members: Vec<(&SharedTrainingState, f64)> = vec![(local, local_weight.max(0.0))];
    for (peer, weight) in peers {
        if !local.is_compatible_with(peer) {
            tracing::warn!(run = %peer.run_id, shape = ?peer.shape(), "Skipping peer state with incompatible layout");
            continue;
        }
        if !peer.is_finite() {
            tracing::warn!(step = peer.step, "Skipping peer state with non-finite values");
            continue;
        }
        if weight.is_finite() && *weight > 0.0 {
            members.push((*peer, *weight));
        }
    }

    let mut total: f64 = members.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        members[0].1 = 1.0;
        total = 1.0;
    }

    let parameters = weighted_mean(&members, total, |s| &s.parameters);
    let momentum = weighted_mean(&members, total, |s| &s.optimizer.momentum);
    let learning_rate = members
        .iter()
        .map(|(s, w)| s.optimizer.learning_rate * w / total)
        .sum();
    let step = members.iter().map(|(s, _)| s.step).max().unwrap_or(local.step) + 1;

    SharedTrainingState {
        run_id: local.run_id.clone(),
        step,
        parameters,
        optimizer: OptimizerState { learning_rate, momentum },
    }
}

fn weighted_mean(
    members: &[(&SharedTrainingState, f64)],
    total: f64,
    pick: fn(&SharedTrainingState) -> &Vec<Tensor>,
) -> Vec<Tensor> {
    let (first, _) = members[0];
    pick(first)
        .iter()
        .enumerate()
        .map(|(t, tensor)| {
            let mut acc = vec![0.0f64; tensor.len()];
            for (state, weight) in members {
                let w = weight / total;
                for (a, v) in acc.iter_mut().zip(&pick(state)[t]) {
                    *a += w * f64::from(*v);
                }
            }
            acc.into_iter().map(|v| v as f32).collect()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Merged { peers: usize, step: u64 },
    /// Nothing was merged; the local state is unchanged.
    LocalOnly { reason: String },
}

#[derive(Clone)]
pub struct StateAverager {
    dht: Arc<dyn Dht>,
    trust: TrustTable,
    config: Arc<RunConfig>,
}

impl StateAverager {
    pub fn new(dht: Arc<dyn Dht>, trust: TrustTable, config: Arc<RunConfig>) -> Self {
        Self { dht, trust, config }
    }

    /// Write our state under our own key.
    pub async fn publish(&self, state: &SharedTrainingState) -> Result<(), DhtError> {
        let key = self.config.state_key(self.dht.node_id());
        let value = serde_json::to_value(state)?;
        let mut expected = self.dht.get(&key).await?.map(|r| r.version);
        for _ in 0..PUBLISH_ATTEMPTS {
            match self.dht.put(&key, value.clone(), expected).await? {
                PutOutcome::Stored(_) => return Ok(()),
                PutOutcome::Conflict { current } => expected = current.map(|r| r.version),
            }
        }
        Err(DhtError::Unavailable(format!("could not publish {key}")))
    }

    /// States our current peers published. Missing or unreadable records
    /// are skipped.
    pub async fn fetch_peer_states(&self) -> Result<Vec<(NodeId, SharedTrainingState)>, DhtError> {
        let mut states = Vec::new();
        for peer in self.dht.peers().await? {
            let key = self.config.state_key(&peer.node_id);
            match self.dht.get(&key).await {
                Ok(Some(record)) => match record.decode::<SharedTrainingState>(&key) {
                    Ok(state) => states.push((peer.node_id, state)),
                    Err(e) => tracing::debug!(peer = %peer.node_id, error = %e, "Unreadable peer state"),
                },
                Ok(None) => {}
                Err(e) => tracing::debug!(peer = %peer.node_id, error = %e, "Failed to fetch peer state"),
            }
        }
        Ok(states)
    }

    /// One averaging round. Falls back to the unchanged local state if the
    /// round does not finish within `averaging_timeout` or no peer state
    /// carries any weight. `Merged { peers }` counts contributing peers.
    pub async fn average_round(&self, local: &SharedTrainingState) -> (SharedTrainingState, RoundOutcome) {
        match tokio::time::timeout(self.config.averaging_timeout, self.merge_with_peers(local)).await {
            Ok(Ok((_, 0))) => {
                tracing::debug!("No peer state carried weight, keeping local state");
                (local.clone(), RoundOutcome::LocalOnly { reason: "no weighted peer state".into() })
            }
            Ok(Ok((merged, peers))) => {
                let outcome = RoundOutcome::Merged { peers, step: merged.step };
                (merged, outcome)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Averaging round failed, keeping local state");
                (local.clone(), RoundOutcome::LocalOnly { reason: e.to_string() })
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.config.averaging_timeout, "Averaging round timed out, keeping local state");
                (local.clone(), RoundOutcome::LocalOnly { reason: "timed out".into() })
            }
        }
    }

    async fn merge_with_peers(&self, local: &SharedTrainingState) -> Result<(SharedTrainingState, usize), DhtError> {
        if let Err(e) = self.publish(local).await {
            tracing::warn!(error = %e, "Failed to publish local state");
        }
        let peer_states: Vec<_> = self
            .fetch_peer_states()
            .await?
            .into_iter()
            .filter(|(_, s)| local.is_compatible_with(s) && s.is_finite())
            .collect();

        let ids: Vec<NodeId> = peer_states.iter().map(|(id, _)| id.clone()).collect();
        let raw = self.trust.weights(&ids).await;
        // we trust ourselves as much as the most trusted peer
        let local_raw = raw.iter().copied().fold(0.0, f64::max);
        let (local_weight, peer_weights) = resolve_weights(local_raw, &raw, self.config.local_floor_weight);

        let weighted: Vec<(&SharedTrainingState, f64)> = peer_states
            .iter()
            .zip(peer_weights)
            .map(|((_, s), w)| (s, w))
            .collect();
        let contributors = weighted.iter().filter(|(_, w)| *w > 0.0).count();
        let merged = merge_states(local, local_weight, &weighted);
        Ok((merged, contributors))
    }

    /// Adopt the most advanced compatible state any peer published, if it
    /// is ahead of ours.
    pub async fn load_from_peers(&self, local: &SharedTrainingState) -> Option<SharedTrainingState> {
        let states = match self.fetch_peer_states().await {
            Ok(states) => states,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load state from peers");
                return None;
            }
        };
        let (peer, best) = states
            .into_iter()
            .filter(|(_, s)| local.is_compatible_with(s) && s.is_finite())
            .max_by_key(|(_, s)| s.step)?;
        if best.step <= local.step {
            return None;
        }
        tracing::info!(peer = %peer, step = best.step, local_step = local.step, "📥 Loaded state from peer");
        Some(best)
    }

    /// Background averaging on a fixed cadence until shutdown.
    pub async fn run(
        self,
        shared: Arc<RwLock<SharedTrainingState>>,
        model: SharedModel,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut timer = tokio::time::interval(self.config.averaging_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately; the first round waits one interval
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let local = shared.read().await.clone();
            let (merged, outcome) = self.average_round(&local).await;
            let RoundOutcome::Merged { peers, step } = outcome else {
                continue;
            };

            // lock order: shared state, then model
            let mut current = shared.write().await;
            if merged.step <= current.step {
                tracing::debug!(step, current = current.step, "Local state moved past the merge, skipping");
                continue;
            }
            if let Err(e) = model.write().await.load_parameters(&merged.parameters) {
                tracing::error!(error = %e, "Merged parameters rejected by model, keeping local state");
                continue;
            }
            *current = merged;
            tracing::info!(peers, step, "🔀 Averaging round complete");
        }
        tracing::info!("Averaging loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{MemoryDht, Record};
    use crate::peer::PeerInfo;
    use async_trait::async_trait;
    use std::time::Duration;

    fn scalar(step: u64, value: f32) -> SharedTrainingState {
        let mut s = SharedTrainingState::new("run", vec![vec![value]], 0.1);
        s.step = step;
        s
    }

    #[test]
    fn weighted_scalar_average() {
        let local = scalar(3, 1.0);
        let a = scalar(2, 2.0);
        let b = scalar(5, 3.0);
        let merged = merge_states(&local, 0.5, &[(&a, 0.25), (&b, 0.25)]);
        assert!((merged.parameters[0][0] - 1.75).abs() < 1e-6);
        assert_eq!(merged.step, 6);
    }

    #[test]
    fn floor_scenario_matches_explicit_weights() {
        let (local, peers) = resolve_weights(1.0, &[1.0, 1.0], 0.5);
        assert_eq!(local, 0.5);
        assert_eq!(peers, vec![0.25, 0.25]);

        // low trust locally is lifted to the floor
        let (local, peers) = resolve_weights(0.0, &[3.0, 1.0], 0.2);
        assert!((local - 0.2).abs() < 1e-12);
        assert!((peers[0] - 0.6).abs() < 1e-12 && (peers[1] - 0.2).abs() < 1e-12);

        // no usable peer weight: local only
        assert_eq!(resolve_weights(0.3, &[0.0, f64::NAN], 0.1), (1.0, vec![0.0, 0.0]));
    }

    #[test]
    fn peer_order_does_not_matter() {
        let dims = 4096;
        let make = |seed: f32| {
            let params = (0..dims).map(|i| ((i as f32) * 0.37 + seed).sin() * 1e3).collect();
            SharedTrainingState::new("run", vec![params], 0.01)
        };
        let (a, b, c) = (make(0.1), make(0.7), make(1.3));
        let abc = merge_states(&a, 0.4, &[(&b, 0.3), (&c, 0.3)]);
        let acb = merge_states(&a, 0.4, &[(&c, 0.3), (&b, 0.3)]);
        for (x, y) in abc.parameters[0].iter().zip(&acb.parameters[0]) {
            assert!((x - y).abs() <= 1e-3, "{x} vs {y}");
        }
    }

    #[test]
    fn incompatible_and_poisoned_peers_are_skipped() {
        let local = scalar(1, 1.0);
        let mut wrong_shape = scalar(1, 100.0);
        wrong_shape.parameters.push(vec![0.0]);
        let poisoned = scalar(1, f32::NAN);
        let merged = merge_states(&local, 0.5, &[(&wrong_shape, 0.25), (&poisoned, 0.25)]);
        assert_eq!(merged.parameters[0][0], 1.0);
        assert_eq!(merged.step, 2);
    }

    #[test]
    fn step_never_decreases() {
        let local = scalar(10, 0.0);
        let behind = scalar(2, 1.0);
        let merged = merge_states(&local, 0.5, &[(&behind, 0.5)]);
        assert_eq!(merged.step, 11);
    }

    fn config() -> Arc<RunConfig> {
        Arc::new(RunConfig {
            run_id: "run".into(),
            dataset_size: 10,
            local_floor_weight: 0.5,
            averaging_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn round_merges_published_peer_states() {
        let cfg = config();
        let dht_local = MemoryDht::new("local");
        let dht_a = dht_local.join("a").await;
        let dht_b = dht_local.join("b").await;
        let trust = TrustTable::new(0.0, 0.0);
        trust.record("a", 1.0).await;
        trust.record("b", 1.0).await;

        StateAverager::new(Arc::new(dht_a), TrustTable::new(0.5, 0.0), cfg.clone())
            .publish(&scalar(4, 2.0))
            .await
            .unwrap();
        StateAverager::new(Arc::new(dht_b), TrustTable::new(0.5, 0.0), cfg.clone())
            .publish(&scalar(4, 3.0))
            .await
            .unwrap();

        let averager = StateAverager::new(Arc::new(dht_local.clone()), trust, cfg.clone());
        let (merged, outcome) = averager.average_round(&scalar(4, 1.0)).await;
        assert_eq!(outcome, RoundOutcome::Merged { peers: 2, step: 5 });
        assert!((merged.parameters[0][0] - 1.75).abs() < 1e-6);

        // our own state was published for the others
        let own = dht_local.get(&cfg.state_key("local")).await.unwrap().unwrap();
        assert_eq!(own.decode::<SharedTrainingState>("k").unwrap().parameters[0][0], 1.0);
    }

    #[tokio::test]
    async fn zero_weight_peers_are_not_counted() {
        let cfg = config();
        let dht_local = MemoryDht::new("local");
        for (id, value) in [("a", 2.0), ("b", 3.0)] {
            let dht = dht_local.join(id).await;
            StateAverager::new(Arc::new(dht), TrustTable::new(0.5, 0.0), cfg.clone())
                .publish(&scalar(4, value))
                .await
                .unwrap();
        }

        // nobody has earned trust and there is no floor
        let trust = TrustTable::new(0.0, 0.0);
        let averager = StateAverager::new(Arc::new(dht_local.clone()), trust.clone(), cfg.clone());
        let local = scalar(4, 1.0);
        let (state, outcome) = averager.average_round(&local).await;
        assert!(matches!(outcome, RoundOutcome::LocalOnly { .. }), "{outcome:?}");
        assert_eq!(state, local);

        trust.record("a", 1.0).await;
        let (merged, outcome) = averager.average_round(&local).await;
        assert_eq!(outcome, RoundOutcome::Merged { peers: 1, step: 5 });
        assert!((merged.parameters[0][0] - 1.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn load_from_peers_only_moves_forward() {
        let cfg = config();
        let dht_local = MemoryDht::new("local");
        let dht_a = dht_local.join("a").await;
        StateAverager::new(Arc::new(dht_a), TrustTable::new(0.5, 0.0), cfg.clone())
            .publish(&scalar(9, 7.0))
            .await
            .unwrap();
        let averager = StateAverager::new(Arc::new(dht_local), TrustTable::new(0.5, 0.0), cfg);

        let adopted = averager.load_from_peers(&scalar(3, 1.0)).await.unwrap();
        assert_eq!(adopted.step, 9);
        assert!(averager.load_from_peers(&scalar(9, 1.0)).await.is_none());
    }

    /// Reads never complete.
    struct StalledDht(MemoryDht);

    #[async_trait]
    impl Dht for StalledDht {
        fn node_id(&self) -> &str {
            self.0.node_id()
        }

        async fn get(&self, _key: &str) -> Result<Option<Record>, DhtError> {
            std::future::pending().await
        }

        async fn put(&self, key: &str, value: serde_json::Value, expected: Option<u64>) -> Result<PutOutcome, DhtError> {
            self.0.put(key, value, expected).await
        }

        async fn peers(&self) -> Result<Vec<PeerInfo>, DhtError> {
            self.0.peers().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_round_keeps_local_state() {
        let cfg = config();
        let averager = StateAverager::new(Arc::new(StalledDht(MemoryDht::new("local"))), TrustTable::new(0.5, 0.0), cfg);
        let local = scalar(7, 1.0);
        let (state, outcome) = averager.average_round(&local).await;
        assert!(matches!(outcome, RoundOutcome::LocalOnly { .. }));
        assert_eq!(state, local);
    }
}
