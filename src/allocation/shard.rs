//! Shard identities and the per-copy facts used to choose a recovery source

use crate::coordinator::voting::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A shard of an index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// One replica of a shard being allocated
///
/// A shard with several replicas unassigned at once gets one allocation per
/// replica; `copy` tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    pub shard: ShardId,
    pub copy: u32,
}

impl ReplicaId {
    pub fn new(shard: ShardId, copy: u32) -> Self {
        Self { shard, copy }
    }
}

impl From<ShardId> for ReplicaId {
    fn from(shard: ShardId) -> Self {
        Self::new(shard, 0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.shard, self.copy)
    }
}

/// Prefix of every peer recovery retention lease id
pub const PEER_RECOVERY_LEASE_PREFIX: &str = "peer_recovery/";

pub fn peer_recovery_lease_id(node: &NodeId) -> String {
    format!("{}{}", PEER_RECOVERY_LEASE_PREFIX, node)
}

/// Operation history the primary keeps for a copy on `node`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecoveryRetentionLease {
    pub id: String,
    pub node: NodeId,
    /// First sequence number the primary still retains for this copy
    pub retaining_seq_no: u64,
}

impl PeerRecoveryRetentionLease {
    pub fn new(node: NodeId, retaining_seq_no: u64) -> Self {
        Self {
            id: peer_recovery_lease_id(&node),
            node,
            retaining_seq_no,
        }
    }
}

/// Store facts a node reports about its copy of a shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStoreFacts {
    /// Marker written by a synced flush; equal markers mean identical files
    pub sync_id: Option<String>,
    /// Operations this copy has in common with the primary
    pub matched_ops: u64,
    /// `None` when the copy never synced a global checkpoint
    pub last_synced_global_checkpoint: Option<u64>,
}

/// Recovery-relevant facts about one copy, as seen by one fetch round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCopyInfo {
    pub node: NodeId,
    pub sync_id: Option<String>,
    pub matched_ops: u64,
    pub last_synced_global_checkpoint: Option<u64>,
    pub lease: Option<PeerRecoveryRetentionLease>,
}

impl ShardCopyInfo {
    pub fn from_facts(
        node: NodeId,
        facts: NodeStoreFacts,
        lease: Option<PeerRecoveryRetentionLease>,
    ) -> Self {
        Self {
            node,
            sync_id: facts.sync_id,
            matched_ops: facts.matched_ops,
            last_synced_global_checkpoint: facts.last_synced_global_checkpoint,
            lease,
        }
    }

    /// Sequence number a lease must retain for this copy to replay only
    /// missing operations
    pub fn required_retaining_seq_no(&self) -> u64 {
        self.last_synced_global_checkpoint
            .map_or(0, |gcp| gcp.saturating_add(1))
    }

    /// The lease retains exactly the operations this copy is missing
    pub fn has_valid_lease(&self) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.retaining_seq_no == self.required_retaining_seq_no())
    }
}

/// What the primary's own store says, used to judge every other copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryStoreInfo {
    pub node: NodeId,
    pub sync_id: Option<String>,
    /// Retaining sequence number of the primary's own lease, if any
    pub retaining_seq_no: Option<u64>,
}

impl PrimaryStoreInfo {
    pub fn from_copy(copy: &ShardCopyInfo) -> Self {
        Self {
            node: copy.node.clone(),
            sync_id: copy.sync_id.clone(),
            retaining_seq_no: copy.lease.as_ref().map(|l| l.retaining_seq_no),
        }
    }
}

/// Answer of one node in a fetch round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CopyResponse {
    Found(ShardCopyInfo),
    /// The node answered and holds no copy
    NoCopy,
    /// The node did not answer in time or failed; its copy state is unknown
    Unknown { reason: String },
}

impl CopyResponse {
    pub fn is_unknown(&self) -> bool {
        matches!(self, CopyResponse::Unknown { .. })
    }

    pub fn copy(&self) -> Option<&ShardCopyInfo> {
        match self {
            CopyResponse::Found(info) => Some(info),
            _ => None,
        }
    }
}
