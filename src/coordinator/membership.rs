//! Cluster membership snapshots
//!
//! Membership discovery hands us validated facts (a node joined, a node left,
//! a master was elected). Each fact produces a new [`ClusterSnapshot`] with a
//! bumped version; snapshots are never mutated in place, so a decision made
//! against version N can always be told apart from one made against N+1.

use crate::coordinator::voting::{NodeId, VotingConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// A cluster member as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub ip: IpAddr,
    pub master_eligible: bool,
}

impl DiscoveryNode {
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>, ip: IpAddr) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            host: host.into(),
            ip,
            master_eligible: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Data-only node: holds shard copies, never votes
    pub fn data_only(mut self) -> Self {
        self.master_eligible = false;
        self
    }
}

/// A validated membership fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEvent {
    Joined(DiscoveryNode),
    Left(NodeId),
    MasterElected(NodeId),
    Retired(NodeId),
    Unretired(NodeId),
    /// A voting configuration was committed to cluster metadata
    Committed(Arc<VotingConfiguration>),
}

/// Immutable, versioned view of the cluster
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    version: u64,
    nodes: BTreeMap<NodeId, DiscoveryNode>,
    master: Option<NodeId>,
    retired: BTreeSet<NodeId>,
    voting_config: Arc<VotingConfiguration>,
}

impl Default for ClusterSnapshot {
    fn default() -> Self {
        Self::new(Arc::new(VotingConfiguration::empty()))
    }
}

impl ClusterSnapshot {
    pub fn new(voting_config: Arc<VotingConfiguration>) -> Self {
        Self {
            version: 0,
            nodes: BTreeMap::new(),
            master: None,
            retired: BTreeSet::new(),
            voting_config,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn master(&self) -> Option<&NodeId> {
        self.master.as_ref()
    }

    pub fn retired(&self) -> &BTreeSet<NodeId> {
        &self.retired
    }

    pub fn voting_config(&self) -> &Arc<VotingConfiguration> {
        &self.voting_config
    }

    pub fn node(&self, id: &NodeId) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn is_live(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Live nodes allowed to vote
    pub fn live_master_eligible(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.master_eligible)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Every live node, data-only ones included
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Apply a membership fact, returning the next snapshot
    ///
    /// Facts that change nothing (a duplicate join, a master election for a
    /// node already elected) return a snapshot with the same version.
    pub fn apply(&self, event: MembershipEvent) -> ClusterSnapshot {
        let mut next = self.clone();
        let changed = match event {
            MembershipEvent::Joined(node) => {
                let previous = next.nodes.insert(node.id.clone(), node.clone());
                previous.as_ref() != Some(&node)
            }
            MembershipEvent::Left(id) => {
                let removed = next.nodes.remove(&id).is_some();
                if next.master.as_ref() == Some(&id) {
                    next.master = None;
                }
                removed
            }
            MembershipEvent::MasterElected(id) => {
                let changed = next.master.as_ref() != Some(&id);
                next.master = Some(id);
                changed
            }
            MembershipEvent::Retired(id) => next.retired.insert(id),
            MembershipEvent::Unretired(id) => next.retired.remove(&id),
            MembershipEvent::Committed(config) => {
                let changed = *config != *next.voting_config;
                next.voting_config = config;
                changed
            }
        };
        if changed {
            next.version += 1;
        }
        next
    }

    /// One row describing the elected master, `-` for every column when no
    /// live master is known
    pub fn master_summary(&self) -> MasterSummary {
        match self.master.as_ref().and_then(|id| self.nodes.get(id)) {
            Some(node) => MasterSummary {
                id: node.id.to_string(),
                host: node.host.clone(),
                ip: node.ip.to_string(),
                name: node.name.clone(),
            },
            None => MasterSummary::unknown(),
        }
    }
}

/// Elected master as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSummary {
    pub id: String,
    pub host: String,
    pub ip: String,
    pub name: String,
}

impl MasterSummary {
    fn unknown() -> Self {
        Self {
            id: "-".into(),
            host: "-".into(),
            ip: "-".into(),
            name: "-".into(),
        }
    }
}

impl fmt::Display for MasterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.id, self.host, self.ip, self.name)
    }
}
