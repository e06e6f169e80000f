//! Allocation service
//!
//! A single task owns the [`AllocationEngine`]. Everything reaches it
//! through its inbox: requests from the cluster, finished fetch rounds,
//! delayed refetches and the orchestrator's recovery events. Fetch rounds
//! run as separate tasks so replicas are fetched concurrently while every
//! decision is taken on the one task.

use crate::allocation::engine::{
    AllocationEngine, AllocationState, EngineOutcome, EngineSettings, FetchRequest,
};
use crate::allocation::fetch::{CopyMetadataFetcher, FetchRound};
use crate::allocation::orchestrator::{RecoveryEvent, RecoveryOrchestrator};
use crate::allocation::shard::ReplicaId;
use crate::common::utils::jittered_backoff;
use crate::common::{AllocationConfig, Error, Result};
use crate::coordinator::voting::NodeId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Message {
    Unassigned {
        replica: ReplicaId,
        primary: NodeId,
        candidates: BTreeSet<NodeId>,
    },
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    Cancel {
        replica: ReplicaId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Forget {
        replica: ReplicaId,
        reply: oneshot::Sender<bool>,
    },
    State {
        replica: ReplicaId,
        reply: oneshot::Sender<Option<AllocationState>>,
    },
    StuckShards {
        reply: oneshot::Sender<Vec<ReplicaId>>,
    },
    FetchCompleted {
        replica: ReplicaId,
        round: FetchRound,
    },
    Refetch(ReplicaId),
    Shutdown,
}

/// Cheap, cloneable access to a running allocation service
#[derive(Clone)]
pub struct AllocationHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl AllocationHandle {
    fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::ChannelClosed("allocation service".into()))
    }

    /// `replica` is unassigned; `candidates` may hold copies. A bare
    /// [`ShardId`](crate::allocation::ShardId) names its first replica.
    pub fn unassigned_shard(
        &self,
        replica: impl Into<ReplicaId>,
        primary: NodeId,
        candidates: BTreeSet<NodeId>,
    ) -> Result<()> {
        self.send(Message::Unassigned {
            replica: replica.into(),
            primary,
            candidates,
        })
    }

    pub fn node_joined(&self, node: NodeId) -> Result<()> {
        self.send(Message::NodeJoined(node))
    }

    pub fn node_left(&self, node: NodeId) -> Result<()> {
        self.send(Message::NodeLeft(node))
    }

    pub async fn cancel_allocation(
        &self,
        replica: impl Into<ReplicaId>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Cancel {
            replica: replica.into(),
            reason: reason.into(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("allocation service reply".into()))?
    }

    /// Release a replica that is completed, cancelled or stuck; `false` if
    /// it is still being allocated
    pub async fn forget(&self, replica: impl Into<ReplicaId>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Forget {
            replica: replica.into(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("allocation service reply".into()))
    }

    pub async fn state(&self, replica: impl Into<ReplicaId>) -> Result<Option<AllocationState>> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::State {
            replica: replica.into(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("allocation service reply".into()))
    }

    pub async fn stuck_shards(&self) -> Result<Vec<ReplicaId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::StuckShards { reply })?;
        rx.await
            .map_err(|_| Error::ChannelClosed("allocation service reply".into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown)
    }
}

pub struct AllocationService {
    engine: AllocationEngine,
    fetcher: Arc<CopyMetadataFetcher>,
    orchestrator: Arc<dyn RecoveryOrchestrator>,
    retry_backoff: Duration,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedReceiver<RecoveryEvent>,
}

impl AllocationService {
    /// `events` is the inbox paired with the reporter handed to
    /// `orchestrator`
    pub fn new(
        config: &AllocationConfig,
        fetcher: Arc<CopyMetadataFetcher>,
        orchestrator: Arc<dyn RecoveryOrchestrator>,
        events: mpsc::UnboundedReceiver<RecoveryEvent>,
    ) -> (Self, AllocationHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            engine: AllocationEngine::new(EngineSettings::from(config)),
            fetcher,
            orchestrator,
            retry_backoff: config.fetch_retry_backoff,
            tx: tx.clone(),
            rx,
            events,
        };
        (service, AllocationHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::info!("allocation service started");
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(Message::Shutdown) | None => break,
                    Some(message) => self.handle_message(message),
                },
                Some(event) = self.events.recv() => self.handle_recovery_event(event),
            }
        }
        tracing::info!("allocation service stopped");
    }

    fn handle_message(&mut self, message: Message) {
        let now = Instant::now();
        match message {
            Message::Unassigned {
                replica,
                primary,
                candidates,
            } => {
                let outcome = self
                    .engine
                    .on_unassigned_shard(replica.clone(), primary, candidates, now);
                self.apply(&replica, outcome);
            }
            Message::NodeJoined(node) => {
                for replica in self.engine.on_node_joined(&node) {
                    self.start_round(&replica);
                }
            }
            Message::NodeLeft(node) => {
                for replica in self.engine.on_node_left(&node) {
                    self.start_round(&replica);
                }
            }
            Message::Cancel {
                replica,
                reason,
                reply,
            } => {
                let result = self
                    .engine
                    .cancel_allocation(&replica, &reason)
                    .map(|outcome| self.apply(&replica, outcome));
                let _ = reply.send(result);
            }
            Message::Forget { replica, reply } => {
                let _ = reply.send(self.engine.forget(&replica));
            }
            Message::State { replica, reply } => {
                let _ = reply.send(self.engine.state(&replica));
            }
            Message::StuckShards { reply } => {
                let _ = reply.send(self.engine.stuck_shards());
            }
            Message::FetchCompleted { replica, round } => {
                let outcome = self.engine.on_fetch_completed(&replica, round, now);
                self.apply(&replica, outcome);
            }
            Message::Refetch(replica) => self.start_round(&replica),
            Message::Shutdown => {}
        }
    }

    fn handle_recovery_event(&mut self, event: RecoveryEvent) {
        let replica = self
            .engine
            .attempt(event.handle)
            .map(|attempt| attempt.replica.clone());
        let outcome = self.engine.on_recovery_event(event, Instant::now());
        if let Some(replica) = replica {
            self.apply(&replica, outcome);
        }
    }

    fn apply(&mut self, replica: &ReplicaId, outcome: EngineOutcome) {
        match outcome {
            EngineOutcome::Stale | EngineOutcome::Unchanged => {}
            EngineOutcome::Refetch => self.schedule_refetch(replica),
            EngineOutcome::RefetchAfter(delay) => {
                tracing::debug!(replica = %replica, delay = ?delay, "refetching after cooldown");
                self.refetch_later(replica, delay);
            }
            EngineOutcome::Commands(commands) => {
                for command in &commands {
                    self.orchestrator.dispatch(command);
                }
            }
        }
    }

    /// First rounds start right away, repeated ones back off
    fn schedule_refetch(&mut self, replica: &ReplicaId) {
        let retry = self.engine.insufficient_rounds(replica);
        if retry == 0 {
            self.start_round(replica);
            return;
        }
        let delay = jittered_backoff(self.retry_backoff, retry - 1);
        tracing::debug!(replica = %replica, retry, delay = ?delay, "scheduling refetch");
        self.refetch_later(replica, delay);
    }

    fn refetch_later(&self, replica: &ReplicaId, delay: Duration) {
        let tx = self.tx.clone();
        let replica = replica.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Refetch(replica));
        });
    }

    fn start_round(&mut self, replica: &ReplicaId) {
        let Some(request) = self.engine.fetch_request(replica) else {
            return;
        };
        let round = self.fetcher.begin_round();
        if let Err(e) = self.engine.on_fetch_started(replica, round) {
            tracing::warn!(replica = %replica, error = %e, "could not start fetch round");
            return;
        }
        tracing::debug!(
            replica = %replica,
            round = %round,
            nodes = request.candidates.len() + 1,
            "starting fetch round"
        );

        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let FetchRequest {
                replica,
                primary,
                candidates,
            } = request;
            let round = fetcher
                .fetch(round, replica.shard.clone(), primary, &candidates)
                .await;
            let _ = tx.send(Message::FetchCompleted { replica, round });
        });
    }
}
