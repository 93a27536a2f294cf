//! Dataset partitioning shared through the DHT.
//!
//! The whole table lives under one key and every mutation is an optimistic
//! read-modify-write: read the record and its version, change it locally,
//! write it back conditioned on the version. A conflict means somebody
//! else got there first, so we re-read and recompute from scratch.
//!
//! Conservation: at any instant `completed`, the union of live claims and
//! the available pool partition `[0, dataset_size)`. Expired claims that
//! nobody has reaped yet count as available, which is why claiming reaps
//! them in the same write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::dht::{Dht, DhtError, PutOutcome};
use crate::ranges::RangeSet;
use crate::types::{ClaimStatus, PartitionClaim, RunConfig};

/// The replicated record under `"{run_id}:partition"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub dataset_size: u64,
    /// Indices whose work was reported done. Never shrinks.
    pub completed: RangeSet,
    /// Live claims plus a bounded tail of finished ones.
    pub claims: Vec<PartitionClaim>,
}

/// Counts for logging and status pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub completed: u64,
    pub in_progress: u64,
    pub available: u64,
}

impl PartitionTable {
    pub fn new(dataset_size: u64) -> Self {
        Self {
            dataset_size,
            completed: RangeSet::new(),
            claims: Vec::new(),
        }
    }

    /// Union of every claim still under lease.
    pub fn in_progress(&self, now: DateTime<Utc>) -> RangeSet {
        let mut live = RangeSet::new();
        for claim in self.claims.iter().filter(|c| c.is_live(now)) {
            live.extend(&claim.ranges);
        }
        live
    }

    pub fn available(&self, now: DateTime<Utc>) -> RangeSet {
        RangeSet::full(self.dataset_size)
            .difference(&self.completed)
            .difference(&self.in_progress(now))
    }

    pub fn stats(&self, now: DateTime<Utc>) -> PartitionStats {
        PartitionStats {
            completed: self.completed.len(),
            in_progress: self.in_progress(now).len(),
            available: self.available(now).len(),
        }
    }

    pub fn find(&self, claim_id: &str) -> Option<&PartitionClaim> {
        self.claims.iter().find(|c| c.id == claim_id)
    }

    /// Mark every expired claim abandoned and return what was reaped.
    /// Already-abandoned claims are left alone, so this is idempotent.
    pub fn reap_expired(&mut self, now: DateTime<Utc>) -> Vec<PartitionClaim> {
        let mut reaped = Vec::new();
        for claim in self.claims.iter_mut().filter(|c| c.is_expired(now)) {
            claim.status = ClaimStatus::Abandoned;
            reaped.push(claim.clone());
        }
        reaped
    }

    /// Drop the oldest finished claims beyond `keep`. Claims still in
    /// `Claimed` status are never dropped, expired or not.
    pub fn prune_history(&mut self, keep: usize) {
        let finished = self
            .claims
            .iter()
            .filter(|c| c.status != ClaimStatus::Claimed)
            .count();
        let mut excess = finished.saturating_sub(keep);
        if excess == 0 {
            return;
        }
        self.claims.retain(|c| {
            if excess > 0 && c.status != ClaimStatus::Claimed {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Outcome of reporting a claim as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Recorded,
    /// Another peer reaped the lease first; the work is discarded.
    Reaped,
    /// The table could not be updated within the allowed attempts.
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
enum PartitionError {
    #[error(transparent)]
    Dht(#[from] DhtError),
    #[error("partition table covers {found} rows, this node expects {expected}")]
    SizeMismatch { expected: u64, found: u64 },
}

enum Step<T> {
    /// Write the mutated table, then hand back the value.
    Write(T),
    /// Nothing to write.
    Done(T),
}

/// A node's handle on the shared partition table.
#[derive(Clone)]
pub struct DatasetPartitionState {
    dht: Arc<dyn Dht>,
    key: String,
    dataset_size: u64,
    lease: chrono::Duration,
    retries: u32,
    backoff: Duration,
    backoff_max: Duration,
    history: usize,
}

impl DatasetPartitionState {
    pub fn new(dht: Arc<dyn Dht>, config: &RunConfig) -> Self {
        Self {
            key: config.partition_key(),
            dataset_size: config.dataset_size,
            lease: chrono::Duration::from_std(config.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::days(3650)),
            retries: config.claim_retries.max(1),
            backoff: config.retry_backoff,
            backoff_max: config.retry_backoff_max,
            history: config.claim_history,
            dht,
        }
    }

    /// Authoritative copy of the table, or a fresh one if nobody wrote it yet.
    pub async fn snapshot(&self) -> Result<PartitionTable, DhtError> {
        match self.read().await {
            Ok((table, _)) => Ok(table),
            Err(PartitionError::Dht(e)) => Err(e),
            Err(e @ PartitionError::SizeMismatch { .. }) => Err(DhtError::Unavailable(e.to_string())),
        }
    }

    pub async fn claim(&self, requested: u64) -> Option<PartitionClaim> {
        self.claim_at(requested, Utc::now()).await
    }

    /// Claim up to `requested` of the lowest available indices. `None` when
    /// the pool is empty or the write kept losing races.
    pub async fn claim_at(&self, requested: u64, now: DateTime<Utc>) -> Option<PartitionClaim> {
        let (claim, reaped) = self.claim_and_reap(requested, now).await?;
        for r in &reaped {
            tracing::info!(claim = %r.id, owner = %r.owner, rows = r.ranges.len(), "♻️ Reaped expired claim");
        }
        match claim {
            Some(claim) => {
                tracing::info!(
                    claim = %claim.id,
                    rows = claim.ranges.len(),
                    ranges = %claim.ranges,
                    "📋 Claimed dataset rows"
                );
                Some(claim)
            }
            None => {
                tracing::debug!("No dataset rows left to claim");
                None
            }
        }
    }

    /// Claim and reap expired leases in one write. The reaped claims are
    /// those of the attempt that committed, not of retried ones.
    async fn claim_and_reap(
        &self,
        requested: u64,
        now: DateTime<Utc>,
    ) -> Option<(Option<PartitionClaim>, Vec<PartitionClaim>)> {
        if requested == 0 {
            return None;
        }
        let owner = self.dht.node_id().to_string();
        let lease = self.lease;
        self.commit(
            "claim",
            |table| {
                let reaped = table.reap_expired(now);
                let picked = table.available(now).take_first(requested);
                if picked.is_empty() {
                    return if reaped.is_empty() {
                        Step::Done((None, reaped))
                    } else {
                        Step::Write((None, reaped))
                    };
                }
                let claim = PartitionClaim {
                    id: uuid::Uuid::new_v4().to_string(),
                    owner: owner.clone(),
                    ranges: picked,
                    claimed_at: now,
                    lease_expiry: now + lease,
                    status: ClaimStatus::Claimed,
                };
                table.claims.push(claim.clone());
                Step::Write((Some(claim), reaped))
            },
            |stored, (claim, _)| match claim {
                Some(claim) => stored
                    .find(&claim.id)
                    .is_some_and(|c| c.owner == claim.owner && c.status == ClaimStatus::Claimed),
                None => true,
            },
        )
        .await
    }

    pub async fn complete(&self, claim: &PartitionClaim) -> Completion {
        self.complete_at(claim, Utc::now()).await
    }

    /// Move the claim's rows into `completed`. A claim that expired but was
    /// not reaped yet still completes: nobody else can hold its rows.
    pub async fn complete_at(&self, claim: &PartitionClaim, now: DateTime<Utc>) -> Completion {
        let outcome = self
            .commit(
                "complete",
                |table| {
                    let found = table.claims.iter_mut().find(|c| c.id == claim.id);
                    match found {
                        Some(c) if c.status == ClaimStatus::Claimed && c.owner == claim.owner => {
                            c.status = ClaimStatus::Completed;
                            let ranges = c.ranges.clone();
                            table.completed.extend(&ranges);
                            Step::Write(Completion::Recorded)
                        }
                        Some(c) if c.status == ClaimStatus::Completed => Step::Done(Completion::Recorded),
                        _ => Step::Done(Completion::Reaped),
                    }
                },
                |stored, outcome| match outcome {
                    // the record may already be pruned; the rows must still be done
                    Completion::Recorded => stored.find(&claim.id).map_or_else(
                        || claim.ranges.difference(&stored.completed).is_empty(),
                        |c| c.status == ClaimStatus::Completed,
                    ),
                    _ => true,
                },
            )
            .await;

        match outcome {
            Some(Completion::Recorded) => {
                if now >= claim.lease_expiry {
                    tracing::debug!(claim = %claim.id, "Completed after lease expiry, before reap");
                }
                tracing::info!(claim = %claim.id, rows = claim.ranges.len(), "✅ Claim completed");
                Completion::Recorded
            }
            Some(other) => {
                tracing::warn!(claim = %claim.id, "Claim was reaped before completion, work discarded");
                other
            }
            None => {
                tracing::warn!(claim = %claim.id, "Could not record completion");
                Completion::Unavailable
            }
        }
    }

    /// Give a claim's rows back before its lease runs out. Only the owner's
    /// live claim is released; anything else is left as it is.
    pub async fn release(&self, claim: &PartitionClaim) -> bool {
        let released = self
            .commit(
                "release",
                |table| match table.claims.iter_mut().find(|c| c.id == claim.id) {
                    Some(c) if c.status == ClaimStatus::Claimed && c.owner == claim.owner => {
                        c.status = ClaimStatus::Abandoned;
                        Step::Write(true)
                    }
                    _ => Step::Done(false),
                },
                |stored, released| {
                    !*released || stored.find(&claim.id).map_or(true, |c| c.status != ClaimStatus::Claimed)
                },
            )
            .await
            .unwrap_or(false);
        if released {
            tracing::info!(claim = %claim.id, rows = claim.ranges.len(), "↩️ Released claim");
        }
        released
    }

    pub async fn reap_expired(&self) -> Vec<PartitionClaim> {
        self.reap_expired_at(Utc::now()).await
    }

    /// Abandon every expired claim, returning their rows to the pool.
    /// Safe to run from any number of peers at once.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> Vec<PartitionClaim> {
        let reaped = self
            .commit(
                "reap",
                |table| {
                    let reaped = table.reap_expired(now);
                    if reaped.is_empty() {
                        Step::Done(reaped)
                    } else {
                        Step::Write(reaped)
                    }
                },
                |stored, reaped| {
                    reaped
                        .iter()
                        .all(|r| stored.find(&r.id).map_or(true, |c| c.status != ClaimStatus::Claimed))
                },
            )
            .await
            .unwrap_or_default();
        for claim in &reaped {
            tracing::info!(claim = %claim.id, owner = %claim.owner, rows = claim.ranges.len(), "♻️ Reaped expired claim");
        }
        reaped
    }

    async fn read(&self) -> Result<(PartitionTable, Option<u64>), PartitionError> {
        match self.dht.get(&self.key).await? {
            None => Ok((PartitionTable::new(self.dataset_size), None)),
            Some(record) => {
                let table: PartitionTable = record.decode(&self.key)?;
                if table.dataset_size != self.dataset_size {
                    return Err(PartitionError::SizeMismatch {
                        expected: self.dataset_size,
                        found: table.dataset_size,
                    });
                }
                Ok((table, Some(record.version)))
            }
        }
    }

    /// Optimistic read-modify-write with bounded, jittered exponential
    /// backoff. `durable` re-checks the effect after a successful write, so
    /// a write that lost a last-writer-wins race is retried too.
    async fn commit<T, F, V>(&self, op: &'static str, mut mutate: F, durable: V) -> Option<T>
    where
        F: FnMut(&mut PartitionTable) -> Step<T>,
        V: Fn(&PartitionTable, &T) -> bool,
    {
        let mut backoff = self.backoff;
        for attempt in 1..=self.retries {
            match self.try_commit(&mut mutate, &durable).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => tracing::debug!(op, attempt, "Partition table moved, retrying"),
                Err(e) => tracing::warn!(op, attempt, error = %e, "Partition table update failed"),
            }
            if attempt < self.retries {
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(self.backoff_max);
            }
        }
        tracing::warn!(op, retries = self.retries, "Giving up on partition table update");
        None
    }

    async fn try_commit<T, F, V>(&self, mutate: &mut F, durable: &V) -> Result<Option<T>, PartitionError>
    where
        F: FnMut(&mut PartitionTable) -> Step<T>,
        V: Fn(&PartitionTable, &T) -> bool,
    {
        let (mut table, version) = self.read().await?;
        let value = match mutate(&mut table) {
            Step::Done(value) => return Ok(Some(value)),
            Step::Write(value) => value,
        };
        table.prune_history(self.history);
        let payload = serde_json::to_value(&table).map_err(DhtError::from)?;
        match self.dht.put(&self.key, payload, version).await? {
            PutOutcome::Conflict { .. } => Ok(None),
            PutOutcome::Stored(_) => {
                let (stored, _) = self.read().await?;
                Ok(durable(&stored, &value).then_some(value))
            }
        }
    }
}

/// Scale a delay by a random factor in [0.5, 1.5) so racing peers spread out.
pub(crate) fn jittered(delay: Duration) -> Duration {
    use rand::Rng;
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}
