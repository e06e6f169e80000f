//! Voting configurations and quorum arithmetic
//!
//! A [`VotingConfiguration`] is an immutable set of node ids. A set of votes
//! is a quorum when it covers strictly more than half of the configuration.
//! Configurations are shared as `Arc<VotingConfiguration>`: code that only
//! needs to know whether anything changed compares pointers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Opaque, unique identifier of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Build a set of node ids from anything string-like
pub fn node_ids<I, S>(ids: I) -> BTreeSet<NodeId>
where
    I: IntoIterator<Item = S>,
    S: Into<NodeId>,
{
    ids.into_iter().map(Into::into).collect()
}

/// The set of master-eligible nodes whose majority must accept a cluster
/// metadata change before it is committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingConfiguration {
    node_ids: BTreeSet<NodeId>,
}

impl VotingConfiguration {
    pub fn new(node_ids: BTreeSet<NodeId>) -> Self {
        Self { node_ids }
    }

    /// The bootstrap sentinel: no node has been elected yet, nothing can
    /// form a quorum
    pub fn empty() -> Self {
        Self {
            node_ids: BTreeSet::new(),
        }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self::new(node_ids(ids))
    }

    pub fn node_ids(&self) -> &BTreeSet<NodeId> {
        &self.node_ids
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// `true` when the distinct members of `votes` that belong to this
    /// configuration are strictly more than half of it
    pub fn has_quorum<'a, I>(&self, votes: I) -> bool
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let granted: BTreeSet<&NodeId> = votes
            .into_iter()
            .filter(|id| self.node_ids.contains(*id))
            .collect();
        granted.len() * 2 > self.node_ids.len()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl fmt::Display for VotingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.node_ids.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}}")
    }
}

/// Votes gathered during an election
///
/// A candidate wins only with a quorum in both the last committed and the
/// last accepted configuration, so an election held while a reconfiguration
/// is in flight satisfies the old and the new majority alike.
#[derive(Debug, Clone, Default)]
pub struct VoteCollection {
    votes: BTreeSet<NodeId>,
}

impl VoteCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a granted vote; returns `false` if the voter was already counted
    pub fn add_vote(&mut self, voter: NodeId) -> bool {
        self.votes.insert(voter)
    }

    pub fn contains(&self, voter: &NodeId) -> bool {
        self.votes.contains(voter)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn is_quorum(&self, config: &VotingConfiguration) -> bool {
        config.has_quorum(&self.votes)
    }

    pub fn is_election_quorum(
        &self,
        last_committed: &VotingConfiguration,
        last_accepted: &VotingConfiguration,
    ) -> bool {
        self.is_quorum(last_committed) && self.is_quorum(last_accepted)
    }
}
