//! Peer recovery retention leases
//!
//! The primary of a shard keeps one lease per copy, `peer_recovery/<node>`.
//! A lease pins the operation history a copy still needs so that it can be
//! brought back by replaying operations instead of copying files. Leases
//! only move forward, and a lease whose copy stays unreachable for longer
//! than the retention window is dropped.

use crate::allocation::shard::{PeerRecoveryRetentionLease, ShardId};
use crate::common::{Error, Result};
use crate::coordinator::voting::NodeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub trait RetentionLeaseStore: Send + Sync {
    fn get(&self, shard: &ShardId, node: &NodeId) -> Result<Option<PeerRecoveryRetentionLease>>;

    /// Create or advance a lease; a lower retaining sequence number never
    /// replaces a higher one. Returns the lease as stored.
    fn renew(
        &self,
        shard: &ShardId,
        node: &NodeId,
        retaining_seq_no: u64,
    ) -> Result<PeerRecoveryRetentionLease>;

    /// Returns whether a lease existed
    fn remove(&self, shard: &ShardId, node: &NodeId) -> Result<bool>;

    /// Drop the leases of copies outside `live` that have been unreachable
    /// for at least `window`, returning their nodes
    fn expire_unreachable(
        &self,
        shard: &ShardId,
        live: &BTreeSet<NodeId>,
        now: Instant,
        window: Duration,
    ) -> Result<Vec<NodeId>>;
}

#[derive(Debug)]
struct LeaseEntry {
    lease: PeerRecoveryRetentionLease,
    unreachable_since: Option<Instant>,
}

/// Lease store kept in memory
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<ShardId, HashMap<NodeId, LeaseEntry>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ShardId, HashMap<NodeId, LeaseEntry>>>> {
        self.leases
            .lock()
            .map_err(|_| Error::Internal("lease store lock poisoned".into()))
    }
}

impl RetentionLeaseStore for InMemoryLeaseStore {
    fn get(&self, shard: &ShardId, node: &NodeId) -> Result<Option<PeerRecoveryRetentionLease>> {
        Ok(self
            .lock()?
            .get(shard)
            .and_then(|leases| leases.get(node))
            .map(|entry| entry.lease.clone()))
    }

    fn renew(
        &self,
        shard: &ShardId,
        node: &NodeId,
        retaining_seq_no: u64,
    ) -> Result<PeerRecoveryRetentionLease> {
        let mut leases = self.lock()?;
        let entry = leases
            .entry(shard.clone())
            .or_default()
            .entry(node.clone())
            .or_insert_with(|| LeaseEntry {
                lease: PeerRecoveryRetentionLease::new(node.clone(), retaining_seq_no),
                unreachable_since: None,
            });
        if retaining_seq_no > entry.lease.retaining_seq_no {
            entry.lease.retaining_seq_no = retaining_seq_no;
        } else if retaining_seq_no < entry.lease.retaining_seq_no {
            tracing::debug!(
                shard = %shard,
                node = %node,
                current = entry.lease.retaining_seq_no,
                requested = retaining_seq_no,
                "ignoring retention lease regression"
            );
        }
        entry.unreachable_since = None;
        Ok(entry.lease.clone())
    }

    fn remove(&self, shard: &ShardId, node: &NodeId) -> Result<bool> {
        Ok(self
            .lock()?
            .get_mut(shard)
            .and_then(|leases| leases.remove(node))
            .is_some())
    }

    fn expire_unreachable(
        &self,
        shard: &ShardId,
        live: &BTreeSet<NodeId>,
        now: Instant,
        window: Duration,
    ) -> Result<Vec<NodeId>> {
        let mut guard = self.lock()?;
        let Some(leases) = guard.get_mut(shard) else {
            return Ok(Vec::new());
        };

        let mut expired = Vec::new();
        for (node, entry) in leases.iter_mut() {
            if live.contains(node) {
                entry.unreachable_since = None;
                continue;
            }
            let since = *entry.unreachable_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= window {
                expired.push(node.clone());
            }
        }
        for node in &expired {
            leases.remove(node);
            tracing::info!(shard = %shard, node = %node, "expired peer recovery retention lease");
        }
        expired.sort();
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::voting::node_ids;

    fn shard() -> ShardId {
        ShardId::new("idx", 0)
    }

    #[test]
    fn test_renew_only_advances() {
        let store = InMemoryLeaseStore::new();
        let node = NodeId::from("a");
        assert!(store.get(&shard(), &node).unwrap().is_none());

        assert_eq!(store.renew(&shard(), &node, 10).unwrap().retaining_seq_no, 10);
        assert_eq!(store.renew(&shard(), &node, 7).unwrap().retaining_seq_no, 10);
        assert_eq!(store.renew(&shard(), &node, 15).unwrap().retaining_seq_no, 15);

        let lease = store.get(&shard(), &node).unwrap().unwrap();
        assert_eq!(lease.id, "peer_recovery/a");
        assert!(store.remove(&shard(), &node).unwrap());
        assert!(!store.remove(&shard(), &node).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_window() {
        let store = InMemoryLeaseStore::new();
        for node in ["a", "b"] {
            store.renew(&shard(), &node.into(), 1).unwrap();
        }
        let live = node_ids(["a"]);
        let window = Duration::from_secs(60);

        let t0 = Instant::now();
        assert!(store.expire_unreachable(&shard(), &live, t0, window).unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store
            .expire_unreachable(&shard(), &live, Instant::now(), window)
            .unwrap()
            .is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let expired = store
            .expire_unreachable(&shard(), &live, Instant::now(), window)
            .unwrap();
        assert_eq!(expired, vec![NodeId::from("b")]);
        assert!(store.get(&shard(), &"b".into()).unwrap().is_none());
        assert!(store.get(&shard(), &"a".into()).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reappearing_copy_resets_window() {
        let store = InMemoryLeaseStore::new();
        let node = NodeId::from("b");
        store.renew(&shard(), &node, 5).unwrap();
        let window = Duration::from_secs(10);

        store
            .expire_unreachable(&shard(), &BTreeSet::new(), Instant::now(), window)
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store
            .expire_unreachable(&shard(), &node_ids(["b"]), Instant::now(), window)
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        let expired = store
            .expire_unreachable(&shard(), &BTreeSet::new(), Instant::now(), window)
            .unwrap();
        assert!(expired.is_empty());
    }
}
