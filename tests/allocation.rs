//! Replica allocation driven end to end through the allocation service

use async_trait::async_trait;
use shardcoord::allocation::{
    recovery_channel, AllocationHandle, AllocationService, AllocationState, AttemptHandle,
    ChannelOrchestrator, CopyMetadataFetcher, InMemoryLeaseStore, NodeStoreFacts,
    OrchestratorCommand, RecoveryReporter, RecoveryStage, ReplicaId, RetentionLeaseStore,
    ShardId, ShardStoreClient,
};
use shardcoord::common::AllocationConfig;
use shardcoord::coordinator::{node_ids, NodeId};
use shardcoord::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
enum Store {
    Copy(NodeStoreFacts),
    Broken,
    Hang,
}

#[derive(Default)]
struct FakeCluster {
    stores: Mutex<HashMap<NodeId, Store>>,
}

impl FakeCluster {
    fn set(&self, node: &str, store: Store) {
        self.stores.lock().unwrap().insert(node.into(), store);
    }
}

#[async_trait]
impl ShardStoreClient for FakeCluster {
    async fn list_shard_store(
        &self,
        node: &NodeId,
        _shard: &ShardId,
    ) -> Result<Option<NodeStoreFacts>> {
        let store = self.stores.lock().unwrap().get(node).cloned();
        match store {
            Some(Store::Copy(facts)) => Ok(Some(facts)),
            None => Ok(None),
            Some(Store::Broken) => Err(Error::FetchFailed {
                node: node.to_string(),
                reason: "connection refused".into(),
            }),
            Some(Store::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }
    }
}

fn facts(matched_ops: u64, global_checkpoint: Option<u64>) -> Store {
    Store::Copy(NodeStoreFacts {
        sync_id: None,
        matched_ops,
        last_synced_global_checkpoint: global_checkpoint,
    })
}

struct Harness {
    cluster: Arc<FakeCluster>,
    leases: Arc<InMemoryLeaseStore>,
    handle: AllocationHandle,
    commands: mpsc::UnboundedReceiver<OrchestratorCommand>,
    reporter: RecoveryReporter,
}

impl Harness {
    fn start(config: AllocationConfig) -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let fetcher = Arc::new(CopyMetadataFetcher::new(
            cluster.clone(),
            leases.clone(),
            config.fetch_timeout,
        ));
        let (orchestrator, commands) = ChannelOrchestrator::new();
        let (reporter, events) = recovery_channel();
        let (service, handle) =
            AllocationService::new(&config, fetcher, Arc::new(orchestrator), events);
        service.spawn();
        Self {
            cluster,
            leases,
            handle,
            commands,
            reporter,
        }
    }

    fn lease(&self, shard: &ShardId, node: &str, retaining_seq_no: u64) {
        self.leases
            .renew(shard, &node.into(), retaining_seq_no)
            .unwrap();
    }

    async fn expect_start(&mut self) -> (AttemptHandle, NodeId) {
        match self.commands.recv().await {
            Some(OrchestratorCommand::Start { handle, target, .. }) => (handle, target),
            other => panic!("expected a start command, got {:?}", other),
        }
    }

    async fn expect_cancel(&mut self) -> AttemptHandle {
        match self.commands.recv().await {
            Some(OrchestratorCommand::Cancel { handle, .. }) => handle,
            other => panic!("expected a cancel command, got {:?}", other),
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn config() -> AllocationConfig {
    AllocationConfig {
        fetch_timeout: Duration::from_secs(5),
        max_fetch_retries: 1,
        fetch_retry_backoff: Duration::from_millis(10),
        failure_cooldown: Duration::from_secs(60),
        max_failed_allocations: 3,
    }
}

fn shard() -> ShardId {
    ShardId::new("logs", 0)
}

#[tokio::test(start_paused = true)]
async fn test_copy_with_valid_lease_beats_larger_copy() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(0, None));
    h.cluster.set("y", facts(10, Some(99)));
    h.cluster.set("z", facts(1000, Some(50)));
    h.lease(&shard, "p", 100);
    h.lease(&shard, "y", 100);

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x", "y", "z"]))
        .unwrap();

    let (_, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("y"));
    assert_eq!(
        h.handle.state(shard).await.unwrap(),
        Some(AllocationState::Recovering)
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_noop_copy_preempts_running_recovery() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(0, None));
    h.cluster.set("y", Store::Broken);
    h.cluster.set("z", facts(1000, Some(50)));
    h.lease(&shard, "p", 100);
    h.lease(&shard, "y", 100);

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x", "y", "z"]))
        .unwrap();

    // y stays silent through every retry, so the best known copy wins
    let (on_z, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("z"));
    h.reporter.phase_changed(on_z, RecoveryStage::Index).unwrap();

    h.cluster.set("y", facts(10, Some(99)));
    h.handle.node_joined("y".into()).unwrap();

    assert_eq!(h.expect_cancel().await, on_z);
    h.settle().await;
    assert!(h.commands.try_recv().is_err(), "started before the cancel was acknowledged");
    assert_eq!(
        h.handle.state(shard.clone()).await.unwrap(),
        Some(AllocationState::Decided)
    );

    h.reporter.cancel_acknowledged(on_z).unwrap();
    let (on_y, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("y"));
    assert_ne!(on_y, on_z);

    h.reporter.failed(on_y, "disk full").unwrap();
    let (_, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("z"));
    assert_eq!(
        h.handle.state(shard).await.unwrap(),
        Some(AllocationState::Recovering)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_node_does_not_block_allocation() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(40, Some(90)));
    h.cluster.set("slow", Store::Hang);

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x", "slow"]))
        .unwrap();

    let (_, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("x"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_leave_shard_stuck() {
    let mut h = Harness::start(AllocationConfig {
        max_failed_allocations: 2,
        ..config()
    });
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(10, Some(90)));
    h.cluster.set("z", facts(50, Some(90)));

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x", "z"]))
        .unwrap();

    let (first, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("z"));
    h.reporter.failed(first, "checksum mismatch").unwrap();

    let (second, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("x"));
    h.reporter.failed(second, "checksum mismatch").unwrap();

    h.settle().await;
    assert_eq!(
        h.handle.state(shard.clone()).await.unwrap(),
        Some(AllocationState::Stuck)
    );
    assert_eq!(
        h.handle.stuck_shards().await.unwrap(),
        vec![ReplicaId::from(shard.clone())]
    );
    assert!(h.commands.try_recv().is_err());

    // a stuck shard ignores further requests
    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x", "z"]))
        .unwrap();
    h.settle().await;
    assert!(h.commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_allocation_cancels_running_recovery() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(10, Some(90)));

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x"]))
        .unwrap();
    let (running, _) = h.expect_start().await;

    h.handle
        .cancel_allocation(shard.clone(), "index deleted")
        .await
        .unwrap();
    assert_eq!(h.expect_cancel().await, running);
    assert_eq!(
        h.handle.state(shard.clone()).await.unwrap(),
        Some(AllocationState::Cancelled)
    );

    h.reporter.cancel_acknowledged(running).unwrap();
    h.settle().await;
    assert!(h.commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_shard_is_an_error() {
    let h = Harness::start(config());
    let result = h.handle.cancel_allocation(shard(), "nothing to do").await;
    assert!(matches!(result, Err(Error::ShardNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_completed_recovery_is_terminal() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(10, Some(90)));

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x"]))
        .unwrap();
    let (running, _) = h.expect_start().await;
    h.reporter.phase_changed(running, RecoveryStage::Translog).unwrap();
    h.reporter.phase_changed(running, RecoveryStage::Done).unwrap();
    h.settle().await;

    assert_eq!(
        h.handle.state(shard).await.unwrap(),
        Some(AllocationState::Completed)
    );

    h.handle.node_joined("w".into()).unwrap();
    h.settle().await;
    assert!(h.commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_copy_is_retried_once_cooldown_ends() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(10, Some(90)));

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x"]))
        .unwrap();
    let (first, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("x"));
    h.reporter.failed(first, "node restarted").unwrap();

    // x is the only copy and cools down for a minute
    h.settle().await;
    assert!(h.commands.try_recv().is_err());
    assert_eq!(
        h.handle.state(shard.clone()).await.unwrap(),
        Some(AllocationState::Idle)
    );

    let (second, target) = h.expect_start().await;
    assert_eq!(target, NodeId::from("x"));
    assert_ne!(second, first);
    assert_eq!(
        h.handle.state(shard).await.unwrap(),
        Some(AllocationState::Recovering)
    );
}

#[tokio::test(start_paused = true)]
async fn test_replicas_of_one_shard_land_on_different_nodes() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(0, None));
    h.cluster.set("y", facts(10, Some(99)));
    h.cluster.set("z", facts(1000, Some(50)));
    h.lease(&shard, "p", 100);
    h.lease(&shard, "y", 100);

    let replicas = [ReplicaId::new(shard.clone(), 0), ReplicaId::new(shard.clone(), 1)];
    for replica in &replicas {
        h.handle
            .unassigned_shard(replica.clone(), "p".into(), node_ids(["x", "y", "z"]))
            .unwrap();
    }

    let mut targets = BTreeSet::new();
    for _ in 0..2 {
        let (_, target) = h.expect_start().await;
        targets.insert(target);
    }
    assert_eq!(targets, node_ids(["y", "z"]));
    for replica in replicas {
        assert_eq!(
            h.handle.state(replica).await.unwrap(),
            Some(AllocationState::Recovering)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_finished_replica_is_forgotten_on_request() {
    let mut h = Harness::start(config());
    let shard = shard();
    h.cluster.set("p", facts(100, Some(99)));
    h.cluster.set("x", facts(10, Some(90)));

    h.handle
        .unassigned_shard(shard.clone(), "p".into(), node_ids(["x"]))
        .unwrap();
    let (running, _) = h.expect_start().await;
    assert!(!h.handle.forget(shard.clone()).await.unwrap());

    h.reporter.phase_changed(running, RecoveryStage::Done).unwrap();
    h.settle().await;
    assert!(h.handle.forget(shard.clone()).await.unwrap());
    assert_eq!(h.handle.state(shard).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_handle() {
    let h = Harness::start(config());
    h.handle.shutdown().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        h.handle.state(shard()).await,
        Err(Error::ChannelClosed(_))
    ));
}
