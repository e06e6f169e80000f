//! Voting configuration reconfiguration
//!
//! Computes the next voting configuration from the live master-eligible
//! nodes, the administratively retired nodes, the elected master and the
//! current configuration. The computation is pure: nothing is read from
//! shared state and the current configuration is never mutated.
//!
//! Candidates are ranked master first, then live members of the current
//! configuration, then live newcomers, then unreachable members, ties broken
//! by node id. The top `target_size` candidates form the proposal, where
//!
//! ```text
//! target_size = max(round_down_to_odd(|live \ retired|), minimum)
//! minimum     = auto-shrink: 1 if |config \ retired| < 3, else 3
//!               otherwise:   |config \ retired|
//! ```
//!
//! The proposal is only adopted when the live nodes form a quorum of it.
//! Any outcome equal to the current configuration hands back the caller's
//! own `Arc`, so `Arc::ptr_eq` tells whether a commit round is needed.

use crate::common::{Error, Result};
use crate::coordinator::voting::{NodeId, VotingConfiguration};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Settings threaded into every reconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconfigurationSettings {
    pub auto_shrink: bool,
}

impl Default for ReconfigurationSettings {
    fn default() -> Self {
        Self { auto_shrink: true }
    }
}

impl ReconfigurationSettings {
    pub fn auto_shrink(enabled: bool) -> Self {
        Self {
            auto_shrink: enabled,
        }
    }
}

/// A node competing for a seat in the next configuration
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate<'a> {
    id: &'a NodeId,
    is_master: bool,
    live: bool,
    in_current_config: bool,
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // preferred candidates sort first
        other
            .is_master
            .cmp(&self.is_master)
            .then_with(|| other.live.cmp(&self.live))
            .then_with(|| other.in_current_config.cmp(&self.in_current_config))
            .then_with(|| self.id.cmp(other.id))
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn round_down_to_odd(size: usize) -> usize {
    if size % 2 == 0 {
        size.saturating_sub(1)
    } else {
        size
    }
}

/// Compute the next voting configuration
///
/// `live_nodes` are the reachable master-eligible nodes and must contain
/// `master`. Returns `Error::InvalidState` otherwise.
pub fn reconfigure(
    live_nodes: &BTreeSet<NodeId>,
    retired: &BTreeSet<NodeId>,
    master: &NodeId,
    current: &Arc<VotingConfiguration>,
    settings: ReconfigurationSettings,
) -> Result<Arc<VotingConfiguration>> {
    if !live_nodes.contains(master) {
        return Err(Error::InvalidState(format!(
            "master {} is not among the live nodes {:?}",
            master, live_nodes
        )));
    }

    let mut candidates: Vec<Candidate<'_>> = live_nodes
        .iter()
        .chain(current.node_ids().iter().filter(|id| !live_nodes.contains(*id)))
        .filter(|id| !retired.contains(*id))
        .map(|id| Candidate {
            id,
            is_master: id == master,
            live: live_nodes.contains(id),
            in_current_config: current.contains(id),
        })
        .collect();
    candidates.sort();

    let non_retired_config = current
        .node_ids()
        .iter()
        .filter(|id| !retired.contains(*id))
        .count();
    let non_retired_live = live_nodes.iter().filter(|id| !retired.contains(*id)).count();

    let minimum = if settings.auto_shrink {
        if non_retired_config < 3 {
            1
        } else {
            3
        }
    } else {
        non_retired_config
    };
    let target_size = round_down_to_odd(non_retired_live).max(minimum);

    let proposed: BTreeSet<NodeId> = candidates
        .iter()
        .take(target_size)
        .map(|c| c.id.clone())
        .collect();

    if &proposed == current.node_ids() {
        tracing::trace!(config = %current, "voting configuration unchanged");
        return Ok(Arc::clone(current));
    }

    let proposed = VotingConfiguration::new(proposed);
    if !proposed.has_quorum(live_nodes) {
        tracing::debug!(
            current = %current,
            proposed = %proposed,
            live = live_nodes.len(),
            "live nodes lack a quorum in the proposed configuration, keeping current"
        );
        return Ok(Arc::clone(current));
    }

    tracing::debug!(
        current = %current,
        proposed = %proposed,
        target_size,
        auto_shrink = settings.auto_shrink,
        "reconfiguring voting configuration"
    );
    Ok(Arc::new(proposed))
}
