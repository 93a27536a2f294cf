//! Local membership view.
//!
//! A peer is *live* while it was heard from within the peer timeout and
//! has not failed [`MAX_CONSECUTIVE_FAILURES`] requests in a row. Only
//! live peers are sampled for evaluation, averaging and gossip. A peer
//! that fails repeatedly stays known until it times out, and is live
//! again as soon as it contacts us.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::{NodeId, PeerAnnouncement};

/// Failed requests in a row after which a peer is no longer sampled.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    /// `host:port` of the peer's HTTP endpoint.
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub failed_requests: u32,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: String) -> Self {
        Self {
            node_id,
            address,
            last_seen: Utc::now(),
            failed_requests: 0,
        }
    }

    fn heard_within(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_seen);
        age.num_milliseconds() < timeout.as_millis() as i64
    }

    pub fn is_live(&self, timeout: Duration) -> bool {
        self.failed_requests < MAX_CONSECUTIVE_FAILURES && self.heard_within(timeout, Utc::now())
    }

    pub fn to_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            last_seen: self.last_seen,
        }
    }
}

#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    self_id: NodeId,
    peer_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, peer_timeout: Duration) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            peer_timeout,
        }
    }

    /// Learn about a peer from someone's announcement. Second-hand news
    /// only moves `last_seen` forward; it never clears failures.
    pub async fn merge_peer(&self, announcement: &PeerAnnouncement) {
        if announcement.node_id == self.self_id {
            return;
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&announcement.node_id) {
            Some(known) => {
                if announcement.last_seen > known.last_seen {
                    known.last_seen = announcement.last_seen;
                    known.address = announcement.address.clone();
                }
            }
            None => {
                tracing::info!(
                    peer = %announcement.node_id,
                    addr = %announcement.address,
                    "🌐 Discovered new peer"
                );
                peers.insert(
                    announcement.node_id.clone(),
                    PeerInfo {
                        node_id: announcement.node_id.clone(),
                        address: announcement.address.clone(),
                        last_seen: announcement.last_seen,
                        failed_requests: 0,
                    },
                );
            }
        }
    }

    pub async fn merge_peers(&self, announcements: &[PeerAnnouncement]) {
        for ann in announcements {
            self.merge_peer(ann).await;
        }
    }

    /// First-hand contact: the peer answered us or sent us something.
    pub async fn touch(&self, node_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            peer.last_seen = Utc::now();
            peer.failed_requests = 0;
        }
    }

    pub async fn record_failure(&self, node_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            peer.failed_requests += 1;
            if peer.failed_requests == MAX_CONSECUTIVE_FAILURES {
                tracing::info!(peer = %node_id, "📵 Peer unreachable, no longer sampled");
            }
        }
    }

    /// Forget peers not heard from within the timeout.
    pub async fn prune_dead(&self) {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|id, peer| {
            let keep = peer.heard_within(self.peer_timeout, now);
            if !keep {
                tracing::info!(peer = %id, "💀 Peer timed out, removing");
            }
            keep
        });
        let removed = before - peers.len();
        if removed > 0 {
            tracing::info!(removed, remaining = peers.len(), "Pruned dead peers");
        }
    }

    pub async fn alive_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_live(self.peer_timeout))
            .cloned()
            .collect()
    }

    /// What we tell others about the network: live peers only.
    pub async fn announcements(&self) -> Vec<PeerAnnouncement> {
        self.alive_peers().await.iter().map(PeerInfo::to_announcement).collect()
    }

    pub async fn random_peers(&self, n: usize) -> Vec<PeerInfo> {
        sample_peers(self.alive_peers().await, n)
    }

    pub async fn count(&self) -> usize {
        self.alive_peers().await.len()
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(node_id).cloned()
    }
}

/// Uniform sample of at most `n` peers.
pub fn sample_peers(mut peers: Vec<PeerInfo>, n: usize) -> Vec<PeerInfo> {
    if peers.len() > n {
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(n);
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(id: &str, last_seen: DateTime<Utc>) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: id.into(),
            address: format!("{id}.example:7435"),
            last_seen,
        }
    }

    #[tokio::test]
    async fn merge_skips_self_and_prunes_stale() {
        let registry = PeerRegistry::new("me".into(), Duration::from_secs(60));
        let now = Utc::now();
        registry
            .merge_peers(&[
                announce("me", now),
                announce("fresh", now),
                announce("stale", now - chrono::Duration::seconds(300)),
            ])
            .await;

        assert!(registry.get("me").await.is_none());
        assert_eq!(registry.count().await, 1);

        registry.prune_dead().await;
        assert!(registry.get("stale").await.is_none());
        assert!(registry.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn repeated_failures_stop_sampling_until_contact() {
        let registry = PeerRegistry::new("me".into(), Duration::from_secs(60));
        registry.merge_peer(&announce("p", Utc::now())).await;

        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            registry.record_failure("p").await;
        }
        assert_eq!(registry.alive_peers().await.len(), 1);

        registry.record_failure("p").await;
        assert!(registry.alive_peers().await.is_empty());
        assert!(registry.announcements().await.is_empty());

        // Hearsay does not revive it, direct contact does.
        registry.merge_peer(&announce("p", Utc::now())).await;
        assert!(registry.alive_peers().await.is_empty());
        registry.touch("p").await;
        assert_eq!(registry.get("p").await.unwrap().failed_requests, 0);
        assert_eq!(registry.random_peers(5).await.len(), 1);
    }

    #[test]
    fn sample_is_bounded() {
        let peers: Vec<_> = (0..10).map(|i| PeerInfo::new(format!("p{i}"), String::new())).collect();
        assert_eq!(sample_peers(peers.clone(), 3).len(), 3);
        assert_eq!(sample_peers(peers, 30).len(), 10);
    }
}
