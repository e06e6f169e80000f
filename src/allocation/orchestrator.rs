//! Recovery orchestrator boundary
//!
//! The orchestrator moves the data. The engine only tells it to start or to
//! cancel a recovery attempt, without waiting, and learns about progress
//! through [`RecoveryEvent`]s sent back against the attempt's handle.

use crate::allocation::engine::AttemptHandle;
use crate::allocation::shard::ShardId;
use crate::common::{Error, Result};
use crate::coordinator::voting::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Stage a running recovery reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Init,
    Index,
    VerifyIndex,
    Translog,
    Finalize,
    Done,
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStage::Init => write!(f, "init"),
            RecoveryStage::Index => write!(f, "index"),
            RecoveryStage::VerifyIndex => write!(f, "verify_index"),
            RecoveryStage::Translog => write!(f, "translog"),
            RecoveryStage::Finalize => write!(f, "finalize"),
            RecoveryStage::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEventKind {
    PhaseChanged(RecoveryStage),
    Failed(String),
    /// The attempt was cancelled and released its resources
    CancelAcknowledged,
}

/// A report from the orchestrator about one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEvent {
    pub handle: AttemptHandle,
    pub kind: RecoveryEventKind,
}

/// Instruction for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    Start {
        handle: AttemptHandle,
        shard: ShardId,
        source: NodeId,
        target: NodeId,
    },
    Cancel {
        handle: AttemptHandle,
        reason: String,
    },
}

/// Executes recoveries. Calls must not block: the work happens elsewhere and
/// is reported through a [`RecoveryReporter`].
pub trait RecoveryOrchestrator: Send + Sync {
    fn start(&self, handle: AttemptHandle, shard: &ShardId, source: &NodeId, target: &NodeId);

    fn cancel(&self, handle: AttemptHandle, reason: &str);

    fn dispatch(&self, command: &OrchestratorCommand) {
        match command {
            OrchestratorCommand::Start {
                handle,
                shard,
                source,
                target,
            } => self.start(*handle, shard, source, target),
            OrchestratorCommand::Cancel { handle, reason } => self.cancel(*handle, reason),
        }
    }
}

/// Forwards every command into a channel, for orchestrators living in
/// another task
#[derive(Debug, Clone)]
pub struct ChannelOrchestrator {
    tx: mpsc::UnboundedSender<OrchestratorCommand>,
}

impl ChannelOrchestrator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestratorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: OrchestratorCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("orchestrator channel closed, dropping command");
        }
    }
}

impl RecoveryOrchestrator for ChannelOrchestrator {
    fn start(&self, handle: AttemptHandle, shard: &ShardId, source: &NodeId, target: &NodeId) {
        self.send(OrchestratorCommand::Start {
            handle,
            shard: shard.clone(),
            source: source.clone(),
            target: target.clone(),
        });
    }

    fn cancel(&self, handle: AttemptHandle, reason: &str) {
        self.send(OrchestratorCommand::Cancel {
            handle,
            reason: reason.to_string(),
        });
    }
}

/// Reporter for an orchestrator and the inbox the allocation service drains
pub fn recovery_channel() -> (RecoveryReporter, mpsc::UnboundedReceiver<RecoveryEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RecoveryReporter::new(tx), rx)
}

/// Orchestrator side of the event inbox
#[derive(Debug, Clone)]
pub struct RecoveryReporter {
    tx: mpsc::UnboundedSender<RecoveryEvent>,
}

impl RecoveryReporter {
    pub fn new(tx: mpsc::UnboundedSender<RecoveryEvent>) -> Self {
        Self { tx }
    }

    pub fn phase_changed(&self, handle: AttemptHandle, stage: RecoveryStage) -> Result<()> {
        self.report(handle, RecoveryEventKind::PhaseChanged(stage))
    }

    pub fn failed(&self, handle: AttemptHandle, error: impl Into<String>) -> Result<()> {
        self.report(handle, RecoveryEventKind::Failed(error.into()))
    }

    pub fn cancel_acknowledged(&self, handle: AttemptHandle) -> Result<()> {
        self.report(handle, RecoveryEventKind::CancelAcknowledged)
    }

    fn report(&self, handle: AttemptHandle, kind: RecoveryEventKind) -> Result<()> {
        self.tx
            .send(RecoveryEvent { handle, kind })
            .map_err(|_| Error::ChannelClosed("recovery event inbox".into()))
    }
}
