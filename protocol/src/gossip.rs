use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::dht::{Dht, DhtError, PutOutcome, Record, RecordStore};
use crate::peer::{PeerInfo, PeerRegistry};
use crate::types::*;

/// A DHT node replicating records between peers over HTTP gossip.
///
/// Each GossipDht:
/// 1. Answers gossip messages posted to `/gossip` by other nodes
/// 2. Periodically exchanges peer lists with random peers (fan-out gossip)
/// 3. Pushes every local write to all live peers and pulls from a few
///    peers before every read
///
/// Replicas converge on the record with the highest (version, writer).
#[derive(Clone)]
pub struct GossipDht {
    pub config: GossipConfig,
    pub peers: PeerRegistry,
    store: RecordStore,
    http: reqwest::Client,
}

impl GossipDht {
    pub fn new(config: GossipConfig) -> Self {
        let peers = PeerRegistry::new(config.node_id.clone(), config.peer_timeout);
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            peers,
            store: RecordStore::new(),
            http,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn announce_self(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: self.config.node_id.clone(),
            address: self.config.public_addr.clone(),
            last_seen: Utc::now(),
        }
    }

    /// Bootstrap: connect to seed peers and exchange peer lists
    pub async fn bootstrap(&self) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            seeds = ?self.config.seed_peers,
            "🌱 Bootstrapping gossip node"
        );

        for seed_addr in &self.config.seed_peers {
            match self.sync_with_peer(seed_addr).await {
                Ok(count) => {
                    tracing::info!(seed = %seed_addr, new_peers = count, "Synced with seed");
                }
                Err(e) => {
                    tracing::warn!(seed = %seed_addr, error = %e, "Failed to sync with seed");
                }
            }
        }

        let peer_count = self.peers.count().await;
        tracing::info!(peers = peer_count, "Bootstrap complete");
        Ok(())
    }

    async fn send(&self, peer_addr: &str, msg: &GossipMessage) -> Result<GossipResponse> {
        let url = format!("http://{}/gossip", peer_addr);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.auth_token))
            .json(msg)
            .send()
            .await
            .context("Failed to reach peer")?;

        if !resp.status().is_success() {
            anyhow::bail!("Peer returned HTTP {}", resp.status());
        }

        resp.json().await.context("Failed to parse peer response")
    }

    /// Send our peer list to a peer and receive theirs
    async fn sync_with_peer(&self, peer_addr: &str) -> Result<usize> {
        let mut all = self.peers.announcements().await;
        all.push(self.announce_self());

        let msg = GossipMessage::PeerSync {
            sender: self.config.node_id.clone(),
            peers: all,
        };
        let response = self.send(peer_addr, &msg).await?;

        let before = self.peers.count().await;
        self.peers.merge_peers(&response.peers).await;
        self.peers.touch(&response.node_id).await;
        let after = self.peers.count().await;

        Ok(after.saturating_sub(before))
    }

    /// Periodically sync with random peers until shutdown
    pub async fn run_gossip_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => break,
            }

            self.peers.prune_dead().await;

            let targets = self.peers.random_peers(self.config.fanout).await;
            if targets.is_empty() {
                // Re-try seeds if we lost all peers
                for seed in &self.config.seed_peers {
                    if let Err(e) = self.sync_with_peer(seed).await {
                        tracing::debug!(seed = %seed, error = %e, "Seed unreachable");
                    }
                }
                continue;
            }

            for peer in targets {
                if let Err(e) = self.sync_with_peer(&peer.address).await {
                    tracing::debug!(peer = %peer.node_id, error = %e, "Gossip sync failed");
                    self.peers.record_failure(&peer.node_id).await;
                }
            }

            let count = self.peers.count().await;
            tracing::debug!(peers = count, "Gossip round complete");
        }
        tracing::info!("Gossip loop stopped");
    }

    /// Handle an incoming gossip message
    pub async fn handle_message(&self, msg: GossipMessage) -> GossipResponse {
        let mut response = GossipResponse {
            node_id: self.config.node_id.clone(),
            peers: vec![],
            record: None,
        };

        match msg {
            GossipMessage::PeerSync { sender, peers } => {
                self.peers.merge_peers(&peers).await;
                self.peers.touch(&sender).await;

                response.peers = self.peers.announcements().await;
                response.peers.push(self.announce_self());
            }

            GossipMessage::Get { sender, key } => {
                self.peers.touch(&sender).await;
                response.record = self.store.get(&key).await;
            }

            GossipMessage::Put { sender, key, record } => {
                self.peers.touch(&sender).await;
                let version = record.version;
                if self.store.merge(&key, record).await {
                    tracing::debug!(key = %key, version, from = %sender, "Merged pushed record");
                }
                // Tell the writer what we hold now, so a losing writer learns
                response.record = self.store.get(&key).await;
            }
        }

        response
    }

    /// Send `msg` to each target concurrently and merge any record that
    /// comes back under `key`.
    async fn exchange(&self, targets: Vec<PeerInfo>, key: &str, msg: GossipMessage) -> usize {
        let mut tasks = JoinSet::new();
        for peer in targets {
            let node = self.clone();
            let msg = msg.clone();
            tasks.spawn(async move {
                let result = node.send(&peer.address, &msg).await;
                (peer, result)
            });
        }

        let mut reached = 0;
        while let Some(joined) = tasks.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(response) => {
                    reached += 1;
                    self.peers.touch(&peer.node_id).await;
                    if let Some(record) = response.record {
                        self.store.merge(key, record).await;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.node_id, key = %key, error = %e, "Record exchange failed");
                    self.peers.record_failure(&peer.node_id).await;
                }
            }
        }
        reached
    }

    /// Get network status summary
    pub async fn network_status(&self) -> NetworkStatus {
        let peers = self.peers.alive_peers().await;
        NetworkStatus {
            node_id: self.config.node_id.clone(),
            peer_count: peers.len(),
            records: self.store.len().await,
            peers: peers.into_iter().map(|p| p.to_announcement()).collect(),
        }
    }
}

#[async_trait]
impl Dht for GossipDht {
    fn node_id(&self) -> &str {
        &self.config.node_id
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, DhtError> {
        let targets = self.peers.random_peers(self.config.fanout).await;
        if !targets.is_empty() {
            let msg = GossipMessage::Get {
                sender: self.config.node_id.clone(),
                key: key.to_string(),
            };
            self.exchange(targets, key, msg).await;
        }
        Ok(self.store.get(key).await)
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_previous: Option<u64>,
    ) -> Result<PutOutcome, DhtError> {
        let outcome = self
            .store
            .compare_and_put(key, &self.config.node_id, value, expected_previous)
            .await?;

        if let PutOutcome::Stored(record) = &outcome {
            let targets = self.peers.alive_peers().await;
            let total = targets.len();
            let msg = GossipMessage::Put {
                sender: self.config.node_id.clone(),
                key: key.to_string(),
                record: record.clone(),
            };
            let reached = self.exchange(targets, key, msg).await;
            tracing::debug!(key = %key, version = record.version, reached, total, "Pushed record");
        }
        Ok(outcome)
    }

    async fn peers(&self) -> Result<Vec<PeerInfo>, DhtError> {
        Ok(self.peers.alive_peers().await)
    }
}

/// Network status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub node_id: NodeId,
    pub peer_count: usize,
    pub records: usize,
    pub peers: Vec<PeerAnnouncement>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> GossipDht {
        GossipDht::new(GossipConfig {
            node_id: id.into(),
            public_addr: format!("{id}.invalid:7435"),
            ..Default::default()
        })
    }

    fn record(version: u64, writer: &str, value: serde_json::Value) -> Record {
        Record {
            version,
            writer: writer.into(),
            written_at: Utc::now(),
            value,
        }
    }

    #[tokio::test]
    async fn peer_sync_answers_with_our_view_and_ourselves() {
        let a = node("a");
        let response = a
            .handle_message(GossipMessage::PeerSync {
                sender: "b".into(),
                peers: vec![PeerAnnouncement {
                    node_id: "b".into(),
                    address: "b.invalid:7435".into(),
                    last_seen: Utc::now(),
                }],
            })
            .await;

        let ids: Vec<_> = response.peers.iter().map(|p| p.node_id.as_str()).collect();
        assert!(ids.contains(&"a") && ids.contains(&"b"));
        assert_eq!(a.peers.count().await, 1);
    }

    #[tokio::test]
    async fn pushed_records_merge_by_version_then_writer() {
        let a = node("a");
        let push = |version, writer: &str, value| GossipMessage::Put {
            sender: writer.to_string(),
            key: "k".into(),
            record: record(version, writer, value),
        };

        a.handle_message(push(2, "x", json!("x2"))).await;
        let stale = a.handle_message(push(1, "y", json!("y1"))).await;
        assert_eq!(stale.record.unwrap().value, json!("x2"));

        let tie = a.handle_message(push(2, "z", json!("z2"))).await;
        assert_eq!(tie.record.unwrap().value, json!("z2"));

        let got = a
            .handle_message(GossipMessage::Get {
                sender: "q".into(),
                key: "k".into(),
            })
            .await;
        assert_eq!(got.record.unwrap().writer, "z");
    }

    #[tokio::test]
    async fn isolated_node_behaves_as_local_store() {
        let a = node("a");
        assert!(a.get("k").await.unwrap().is_none());
        assert!(matches!(a.put("k", json!(1), None).await.unwrap(), PutOutcome::Stored(_)));
        assert!(matches!(
            a.put("k", json!(2), None).await.unwrap(),
            PutOutcome::Conflict { current: Some(_) }
        ));
        assert_eq!(a.get("k").await.unwrap().unwrap().value, json!(1));
        assert_eq!(a.network_status().await.records, 1);
    }
}
