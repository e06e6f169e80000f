//! Copy selection
//!
//! Ranks the copies reported by a fetch round. A copy that can be recovered
//! without transferring files (a no-op recovery) always beats one that needs
//! files; within the same class more matched operations win, then the copy
//! the shard is already recovering towards, then the lowest node id.

use crate::allocation::fetch::FetchRound;
use crate::allocation::shard::{CopyResponse, PrimaryStoreInfo, ShardCopyInfo};
use crate::coordinator::voting::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A candidate copy and how it ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedCopy {
    pub node: NodeId,
    pub noop: bool,
    pub matched_ops: u64,
    /// The shard is currently recovering towards this copy
    pub current: bool,
}

impl RankedCopy {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .noop
            .cmp(&self.noop)
            .then_with(|| other.matched_ops.cmp(&self.matched_ops))
            .then_with(|| other.current.cmp(&self.current))
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Whether `copy` can be brought in sync by replaying operations only
///
/// Either both stores carry the same synced flush marker, or the primary
/// still retains exactly the operations the copy is missing and retains at
/// least as much history for it as for itself.
pub fn is_noop_eligible(copy: &ShardCopyInfo, primary: &PrimaryStoreInfo) -> bool {
    if let (Some(ours), Some(theirs)) = (&primary.sync_id, &copy.sync_id) {
        if ours == theirs {
            return true;
        }
    }
    let Some(lease) = &copy.lease else {
        return false;
    };
    copy.has_valid_lease()
        && primary
            .retaining_seq_no
            .map_or(true, |primary_seq| lease.retaining_seq_no >= primary_seq)
}

/// Rank every known copy of `round`, best first
///
/// Unknown and absent copies never rank; nor do nodes for which `excluded`
/// holds (for instance nodes cooling down after a failed recovery).
pub fn rank_copies<F>(
    round: &FetchRound,
    primary: &PrimaryStoreInfo,
    current: Option<&NodeId>,
    excluded: F,
) -> Vec<RankedCopy>
where
    F: Fn(&NodeId) -> bool,
{
    let mut ranked: Vec<RankedCopy> = round
        .copies()
        .filter(|(node, _)| !excluded(node))
        .filter_map(|(node, response)| match response {
            CopyResponse::Found(copy) => Some(RankedCopy {
                node: node.clone(),
                noop: is_noop_eligible(copy, primary),
                matched_ops: copy.matched_ops,
                current: current == Some(node),
            }),
            CopyResponse::NoCopy | CopyResponse::Unknown { .. } => None,
        })
        .collect();
    ranked.sort_by(RankedCopy::rank_cmp);
    ranked
}

/// The best copy of `round`, if any is eligible
pub fn select_copy<F>(
    round: &FetchRound,
    primary: &PrimaryStoreInfo,
    current: Option<&NodeId>,
    excluded: F,
) -> Option<RankedCopy>
where
    F: Fn(&NodeId) -> bool,
{
    rank_copies(round, primary, current, excluded).into_iter().next()
}

/// Whether recovering towards `best` justifies cancelling the recovery
/// towards `current`
///
/// Only a no-op copy preempts, and only when `current` is known to need a
/// file transfer. A `current` copy that did not answer this round is left
/// alone.
pub fn should_preempt(
    round: &FetchRound,
    primary: &PrimaryStoreInfo,
    current: &NodeId,
    best: &RankedCopy,
) -> bool {
    if !best.noop || &best.node == current {
        return false;
    }
    match round.response(current) {
        Some(CopyResponse::Found(copy)) => !is_noop_eligible(copy, primary),
        Some(CopyResponse::NoCopy) => true,
        Some(CopyResponse::Unknown { .. }) | None => false,
    }
}
