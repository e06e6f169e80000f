//! # shardcoord
//!
//! Coordination layer of a replicated document store:
//! - Voting configurations that only change when a live majority backs them
//! - Auto-shrinking quorums with administrative node retirement
//! - Replica allocation that prefers copies recoverable without file copies
//! - Preemption of running recoveries, with cooldowns and cancellation
//!
//! ## Architecture
//!
//! ```text
//! membership events ──► ReconfigurationService ──► MetadataStore (CAS)
//!                             │
//!                        reconfigure()
//!
//! unassigned shard ──► AllocationService ──► CopyMetadataFetcher ──► nodes
//!                             │                     (timeouts)
//!                      AllocationEngine
//!                             │ start / cancel
//!                             ▼
//!                    RecoveryOrchestrator ── events ──► AllocationService
//! ```
//!
//! ## Usage
//!
//! ### Evaluate a voting configuration change
//! ```bash
//! shardcoord reconfigure --live a,b,c --master a --config a,b
//! ```
//!
//! ### Rank the copies of a fetch round
//! ```bash
//! shardcoord select --round ./round.json
//! ```

#![allow(clippy::result_large_err)]

pub mod allocation;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use allocation::{AllocationEngine, AllocationService, ShardId};
pub use common::{Config, Error, Result};
pub use coordinator::{reconfigure, NodeId, ReconfigurationService, VotingConfiguration};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
