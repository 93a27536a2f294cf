//! Local, per-validator reputation of peers.
//!
//! Scores are an exponential moving average of per-round quality in
//! [0, 1]. Nothing here is shared with other nodes; the table is only
//! guarded against the evaluation loop and the averaging timer touching
//! it at the same time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{NodeId, RunConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerTrustScore {
    pub peer: NodeId,
    pub score: f64,
    pub last_updated: DateTime<Utc>,
    /// Rounds this peer was scored in, responding or not.
    pub rounds: u64,
}

/// `decay * old + (1 - decay) * round`, with the round score clamped to
/// [0, 1] and non-finite scores counted as zero.
pub fn moving_average(decay: f64, old: f64, round: f64) -> f64 {
    let round = if round.is_finite() { round.clamp(0.0, 1.0) } else { 0.0 };
    decay * old + (1.0 - decay) * round
}

#[derive(Clone)]
pub struct TrustTable {
    scores: Arc<RwLock<HashMap<NodeId, PeerTrustScore>>>,
    decay: f64,
    floor: f64,
}

impl TrustTable {
    pub fn new(decay: f64, floor: f64) -> Self {
        Self {
            scores: Arc::new(RwLock::new(HashMap::new())),
            decay,
            floor,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.trust_decay, config.trust_floor)
    }

    /// Fold one round's score into the peer's average. First contact
    /// starts from zero.
    pub async fn record(&self, peer: &str, round_score: f64) -> f64 {
        self.record_at(peer, round_score, Utc::now()).await
    }

    pub async fn record_at(&self, peer: &str, round_score: f64, now: DateTime<Utc>) -> f64 {
        let mut scores = self.scores.write().await;
        let entry = scores.entry(peer.to_string()).or_insert_with(|| PeerTrustScore {
            peer: peer.to_string(),
            score: 0.0,
            last_updated: now,
            rounds: 0,
        });
        entry.score = moving_average(self.decay, entry.score, round_score);
        entry.last_updated = now;
        entry.rounds += 1;
        entry.score
    }

    /// Fold a whole round in under one lock.
    pub async fn record_round(&self, round: &HashMap<NodeId, f64>) {
        let now = Utc::now();
        let mut scores = self.scores.write().await;
        for (peer, &round_score) in round {
            let entry = scores.entry(peer.clone()).or_insert_with(|| PeerTrustScore {
                peer: peer.clone(),
                score: 0.0,
                last_updated: now,
                rounds: 0,
            });
            entry.score = moving_average(self.decay, entry.score, round_score);
            entry.last_updated = now;
            entry.rounds += 1;
        }
    }

    pub async fn get(&self, peer: &str) -> Option<PeerTrustScore> {
        self.scores.read().await.get(peer).cloned()
    }

    /// Averaging weights: trust scores, never below the floor. Unknown
    /// peers get the floor.
    pub async fn weights(&self, peers: &[NodeId]) -> Vec<f64> {
        let scores = self.scores.read().await;
        peers
            .iter()
            .map(|p| scores.get(p).map_or(0.0, |s| s.score).max(self.floor))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerTrustScore> {
        let mut all: Vec<_> = self.scores.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.peer.cmp(&b.peer));
        all
    }

    /// Scores normalized to sum to one, for an external incentive
    /// mechanism. Empty if nobody has earned anything yet.
    pub async fn incentive_weights(&self) -> Vec<(NodeId, f64)> {
        let snapshot = self.snapshot().await;
        let total: f64 = snapshot.iter().map(|s| s.score).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        snapshot.into_iter().map(|s| (s.peer, s.score / total)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_peer_never_gains_trust() {
        let table = TrustTable::new(0.9, 0.01);
        table.record("p", 1.0).await;
        table.record("p", 1.0).await;
        let mut last = table.get("p").await.unwrap().score;
        for _ in 0..20 {
            let next = table.record("p", 0.0).await;
            assert!(next <= last, "score rose from {last} to {next} without responses");
            last = next;
        }
        assert!(last < 0.03);
        assert_eq!(table.weights(&["p".into(), "unknown".into()]).await, vec![last.max(0.01), 0.01]);
    }

    #[tokio::test]
    async fn first_contact_starts_from_zero() {
        let table = TrustTable::new(0.95, 0.0);
        let score = table.record("new", 1.0).await;
        assert!((score - 0.05).abs() < 1e-12);
        assert_eq!(table.get("new").await.unwrap().rounds, 1);
    }

    #[tokio::test]
    async fn weights_respect_floor_and_incentives_normalize() {
        let table = TrustTable::new(0.5, 0.1);
        let round: HashMap<NodeId, f64> = [("a".to_string(), 1.0), ("b".to_string(), 0.0)].into();
        table.record_round(&round).await;
        let w = table.weights(&["a".into(), "b".into(), "unknown".into()]).await;
        assert_eq!(w, vec![0.5, 0.1, 0.1]);

        let incentives = table.incentive_weights().await;
        assert_eq!(incentives, vec![("a".to_string(), 1.0), ("b".to_string(), 0.0)]);
    }

    #[test]
    fn garbage_round_scores_count_as_zero() {
        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        assert!(close(moving_average(0.5, 0.4, f64::NAN), 0.2));
        assert!(close(moving_average(0.5, 0.4, 7.0), 0.7));
        assert!(close(moving_average(0.5, 0.4, -3.0), 0.2));
    }
}
