//! Cluster coordination
//!
//! The coordination layer is responsible for:
//! - Quorum arithmetic over voting configurations
//! - Computing the next safe voting configuration as nodes come and go
//! - Versioned membership snapshots
//! - Committing configuration changes to the metadata store

pub mod membership;
pub mod metadata;
pub mod reconfigurator;
pub mod service;
pub mod voting;

pub use membership::{ClusterSnapshot, DiscoveryNode, MasterSummary, MembershipEvent};
pub use metadata::{CoordinationMetadata, InMemoryMetadataStore, MetadataStore};
pub use reconfigurator::{reconfigure, ReconfigurationSettings};
pub use service::{CommitOutcome, ReconfigurationService};
pub use voting::{node_ids, NodeId, VoteCollection, VotingConfiguration};
