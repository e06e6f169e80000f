//! Copy metadata fetcher
//!
//! Asks every node that may hold a copy of a shard for its store facts, in
//! parallel, each request under its own timeout. A node that fails or does
//! not answer in time is recorded as unknown: it may well hold the best copy,
//! so it is never treated as holding nothing.

use crate::allocation::leases::RetentionLeaseStore;
use crate::allocation::shard::{
    CopyResponse, NodeStoreFacts, PrimaryStoreInfo, ShardCopyInfo, ShardId,
};
use crate::common::{Error, Result};
use crate::coordinator::voting::NodeId;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport used to list a node's copy of a shard
#[async_trait]
pub trait ShardStoreClient: Send + Sync {
    /// `Ok(None)` when the node holds no copy
    async fn list_shard_store(&self, node: &NodeId, shard: &ShardId)
        -> Result<Option<NodeStoreFacts>>;
}

/// Identifier of a fetch round; later rounds compare greater
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchRoundId(pub u64);

impl fmt::Display for FetchRoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round-{}", self.0)
    }
}

/// Responses gathered by one round for one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRound {
    pub id: FetchRoundId,
    pub shard: ShardId,
    pub primary: NodeId,
    responses: BTreeMap<NodeId, CopyResponse>,
}

impl FetchRound {
    pub fn new(id: FetchRoundId, shard: ShardId, primary: NodeId) -> Self {
        Self {
            id,
            shard,
            primary,
            responses: BTreeMap::new(),
        }
    }

    /// Record a node's answer. The first answer for a node wins; returns
    /// `false` if one was already recorded.
    pub fn record(&mut self, node: NodeId, response: CopyResponse) -> bool {
        match self.responses.entry(node) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(response);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn response(&self, node: &NodeId) -> Option<&CopyResponse> {
        self.responses.get(node)
    }

    pub fn responses(&self) -> impl Iterator<Item = (&NodeId, &CopyResponse)> {
        self.responses.iter()
    }

    /// Responses of the replica candidates, the primary excluded
    pub fn copies(&self) -> impl Iterator<Item = (&NodeId, &CopyResponse)> {
        self.responses
            .iter()
            .filter(move |(node, _)| **node != self.primary)
    }

    pub fn unknown_nodes(&self) -> Vec<&NodeId> {
        self.responses
            .iter()
            .filter(|(_, r)| r.is_unknown())
            .map(|(node, _)| node)
            .collect()
    }

    /// The primary's facts, when it answered with a copy
    pub fn primary_info(&self) -> Option<PrimaryStoreInfo> {
        self.responses
            .get(&self.primary)
            .and_then(CopyResponse::copy)
            .map(PrimaryStoreInfo::from_copy)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Fans a shard store listing out to the nodes of a shard
pub struct CopyMetadataFetcher {
    client: Arc<dyn ShardStoreClient>,
    leases: Arc<dyn RetentionLeaseStore>,
    timeout: Duration,
    next_round: AtomicU64,
}

impl CopyMetadataFetcher {
    pub fn new(
        client: Arc<dyn ShardStoreClient>,
        leases: Arc<dyn RetentionLeaseStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            leases,
            timeout,
            next_round: AtomicU64::new(1),
        }
    }

    /// Allocate the id of a new round; ids strictly increase
    pub fn begin_round(&self) -> FetchRoundId {
        FetchRoundId(self.next_round.fetch_add(1, Ordering::SeqCst))
    }

    /// Query the primary and every candidate node for `shard`
    pub async fn fetch(
        &self,
        round: FetchRoundId,
        shard: ShardId,
        primary: NodeId,
        candidates: &BTreeSet<NodeId>,
    ) -> FetchRound {
        let mut nodes: BTreeSet<NodeId> = candidates.clone();
        nodes.insert(primary.clone());

        let mut pending: FuturesUnordered<_> = nodes
            .into_iter()
            .map(|node| {
                let shard = &shard;
                async move {
                    let response = self.fetch_one(&node, shard).await;
                    (node, response)
                }
            })
            .collect();

        let mut result = FetchRound::new(round, shard.clone(), primary);
        while let Some((node, response)) = pending.next().await {
            result.record(node, response);
        }

        tracing::debug!(
            shard = %result.shard,
            round = %result.id,
            responses = result.len(),
            unknown = result.unknown_nodes().len(),
            "fetch round finished"
        );
        result
    }

    async fn fetch_one(&self, node: &NodeId, shard: &ShardId) -> CopyResponse {
        let listed = tokio::time::timeout(self.timeout, self.client.list_shard_store(node, shard))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "no shard store listing within {:?}",
                    self.timeout
                )))
            });
        let facts = match listed {
            Ok(Some(facts)) => facts,
            Ok(None) => return CopyResponse::NoCopy,
            Err(e) => {
                tracing::debug!(
                    shard = %shard,
                    node = %node,
                    error = %e,
                    retryable = e.is_retryable(),
                    "shard store listing failed"
                );
                return CopyResponse::Unknown {
                    reason: e.to_string(),
                };
            }
        };

        match self.leases.get(shard, node) {
            Ok(lease) => CopyResponse::Found(ShardCopyInfo::from_facts(node.clone(), facts, lease)),
            Err(e) => CopyResponse::Unknown {
                reason: format!("retention lease lookup failed: {}", e),
            },
        }
    }
}
