//! Replica allocation
//!
//! Chooses which existing copy of a shard an unassigned replica should be
//! recovered onto:
//! - Copy metadata fetching (parallel, per-node timeouts)
//! - Copy ranking (no-op recoveries first)
//! - Recovery lifecycle with preemption, cooldowns and cancellation
//! - Peer recovery retention leases

pub mod arena;
pub mod engine;
pub mod fetch;
pub mod leases;
pub mod orchestrator;
pub mod selector;
pub mod service;
pub mod shard;

pub use engine::{
    AllocationEngine, AllocationState, AttemptHandle, AttemptPhase, EngineOutcome,
    EngineSettings, RecoveryAttempt,
};
pub use fetch::{CopyMetadataFetcher, FetchRound, FetchRoundId, ShardStoreClient};
pub use leases::{InMemoryLeaseStore, RetentionLeaseStore};
pub use orchestrator::{
    recovery_channel, ChannelOrchestrator, OrchestratorCommand, RecoveryEvent, RecoveryEventKind,
    RecoveryOrchestrator, RecoveryReporter, RecoveryStage,
};
pub use selector::{is_noop_eligible, rank_copies, select_copy, RankedCopy};
pub use service::{AllocationHandle, AllocationService};
pub use shard::{
    CopyResponse, NodeStoreFacts, PeerRecoveryRetentionLease, PrimaryStoreInfo, ReplicaId,
    ShardCopyInfo, ShardId,
};
