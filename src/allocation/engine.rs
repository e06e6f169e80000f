//! Allocation decision engine
//!
//! One slot per replica being allocated:
//!
//! ```text
//! Idle -> Fetching -> Decided -> Recovering -> Completed
//!                        ^            |
//!                        +------------+  (preempted by a better copy)
//!
//! any non-terminal state -> Cancelled      (explicit cancellation)
//! Recovering -> Stuck                      (too many failed recoveries)
//! ```
//!
//! The engine is synchronous and owns every [`RecoveryAttempt`]. It never
//! talks to the network: callers feed it fetch rounds and recovery events
//! and carry out the [`EngineOutcome`] it returns. `Decided` means a copy is
//! chosen but the recovery cannot start yet because a cancelled attempt for
//! the same replica has not been acknowledged.
//!
//! Replicas of the same shard never share a target: a node already holding
//! or receiving one replica is not considered for its siblings. Terminal
//! slots keep only their outcome until [`AllocationEngine::forget`] drops
//! them.

pub use crate::allocation::arena::AttemptHandle;

use crate::allocation::arena::Arena;
use crate::allocation::fetch::{FetchRound, FetchRoundId};
use crate::allocation::orchestrator::{
    OrchestratorCommand, RecoveryEvent, RecoveryEventKind, RecoveryStage,
};
use crate::allocation::selector::{select_copy, should_preempt};
use crate::allocation::shard::ReplicaId;
use crate::common::{AllocationConfig, Error, Result};
use crate::coordinator::voting::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Allocation state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Idle,
    Fetching,
    Decided,
    Recovering,
    Completed,
    Cancelled,
    Stuck,
}

impl AllocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationState::Completed | AllocationState::Cancelled | AllocationState::Stuck
        )
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationState::Idle => "idle",
            AllocationState::Fetching => "fetching",
            AllocationState::Decided => "decided",
            AllocationState::Recovering => "recovering",
            AllocationState::Completed => "completed",
            AllocationState::Cancelled => "cancelled",
            AllocationState::Stuck => "stuck",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Fetching,
    Selected,
    InProgress,
    Cancelled,
    Completed,
}

/// One try at recovering `replica` from `source` onto `target`
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub replica: ReplicaId,
    pub source: NodeId,
    pub target: Option<NodeId>,
    pub phase: AttemptPhase,
    pub started_at: Instant,
}

/// What the caller has to do after feeding the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The input belonged to a superseded round or attempt and was ignored
    Stale,
    Unchanged,
    /// Run a new fetch round for the replica
    Refetch,
    /// Every copy is cooling down; run a new round once the first cooldown
    /// has passed
    RefetchAfter(Duration),
    /// Send these commands to the orchestrator, in order
    Commands(Vec<OrchestratorCommand>),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub failure_cooldown: Duration,
    pub max_failed_allocations: u32,
    pub max_fetch_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&AllocationConfig::default())
    }
}

impl From<&AllocationConfig> for EngineSettings {
    fn from(config: &AllocationConfig) -> Self {
        Self {
            failure_cooldown: config.failure_cooldown,
            max_failed_allocations: config.max_failed_allocations,
            max_fetch_retries: config.max_fetch_retries,
        }
    }
}

/// Nodes to query for a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub replica: ReplicaId,
    pub primary: NodeId,
    pub candidates: BTreeSet<NodeId>,
}

#[derive(Debug)]
struct ShardSlot {
    primary: NodeId,
    candidates: BTreeSet<NodeId>,
    state: AllocationState,
    active: Option<AttemptHandle>,
    /// Cancelled attempt still waiting for its acknowledgement
    cancelling: Option<AttemptHandle>,
    /// Node the replica was recovered onto
    assigned: Option<NodeId>,
    /// Newest round started for this replica
    pending_round: Option<FetchRoundId>,
    /// Newest round applied
    latest_round: Option<FetchRound>,
    cooldowns: HashMap<NodeId, Instant>,
    failures: u32,
    insufficient_rounds: u32,
}

impl ShardSlot {
    fn new(primary: NodeId, candidates: BTreeSet<NodeId>) -> Self {
        Self {
            primary,
            candidates,
            state: AllocationState::Idle,
            active: None,
            cancelling: None,
            assigned: None,
            pending_round: None,
            latest_round: None,
            cooldowns: HashMap::new(),
            failures: 0,
            insufficient_rounds: 0,
        }
    }

    fn is_cooling(&self, node: &NodeId, now: Instant) -> bool {
        self.cooldowns.get(node).is_some_and(|until| *until > now)
    }
}

/// Terminal slots drop their rounds and cooldowns; nothing reads them again
fn transition(replica: &ReplicaId, slot: &mut ShardSlot, to: AllocationState) {
    if slot.state == to {
        return;
    }
    tracing::debug!(replica = %replica, from = %slot.state, to = %to, "allocation state changed");
    slot.state = to;
    if to.is_terminal() {
        slot.pending_round = None;
        slot.latest_round = None;
        slot.cooldowns.clear();
        slot.insufficient_rounds = 0;
    }
}

pub struct AllocationEngine {
    settings: EngineSettings,
    slots: HashMap<ReplicaId, ShardSlot>,
    attempts: Arena<RecoveryAttempt>,
}

impl AllocationEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            slots: HashMap::new(),
            attempts: Arena::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn state(&self, replica: &ReplicaId) -> Option<AllocationState> {
        self.slots.get(replica).map(|slot| slot.state)
    }

    pub fn stuck_shards(&self) -> Vec<ReplicaId> {
        let mut stuck: Vec<ReplicaId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == AllocationState::Stuck)
            .map(|(replica, _)| replica.clone())
            .collect();
        stuck.sort();
        stuck
    }

    /// Replicas the engine still keeps a slot for
    pub fn tracked_replicas(&self) -> usize {
        self.slots.len()
    }

    pub fn attempt(&self, handle: AttemptHandle) -> Option<&RecoveryAttempt> {
        self.attempts.get(handle)
    }

    /// The attempt currently representing the replica's allocation
    pub fn active_attempt(&self, replica: &ReplicaId) -> Option<AttemptHandle> {
        self.slots.get(replica).and_then(|slot| slot.active)
    }

    /// Node a completed replica was recovered onto
    pub fn assigned_node(&self, replica: &ReplicaId) -> Option<&NodeId> {
        self.slots.get(replica).and_then(|slot| slot.assigned.as_ref())
    }

    pub fn failures(&self, replica: &ReplicaId) -> u32 {
        self.slots.get(replica).map_or(0, |slot| slot.failures)
    }

    /// Consecutive rounds that were not conclusive
    pub fn insufficient_rounds(&self, replica: &ReplicaId) -> u32 {
        self.slots.get(replica).map_or(0, |slot| slot.insufficient_rounds)
    }

    /// Nodes holding or receiving another replica of the same shard
    fn taken_by_siblings(&self, replica: &ReplicaId) -> BTreeSet<NodeId> {
        let mut taken = BTreeSet::new();
        for (other, slot) in &self.slots {
            if other == replica || other.shard != replica.shard {
                continue;
            }
            taken.extend(slot.assigned.iter().cloned());
            for handle in slot.active.iter().chain(slot.cancelling.iter()) {
                if let Some(target) = self.attempts.get(*handle).and_then(|a| a.target.clone()) {
                    taken.insert(target);
                }
            }
        }
        taken
    }

    /// `replica` needs a home; `candidates` may hold copies
    pub fn on_unassigned_shard(
        &mut self,
        replica: ReplicaId,
        primary: NodeId,
        candidates: BTreeSet<NodeId>,
        now: Instant,
    ) -> EngineOutcome {
        if let Some(slot) = self.slots.get_mut(&replica) {
            match slot.state {
                AllocationState::Stuck => {
                    tracing::debug!(replica = %replica, "ignoring stuck replica");
                    return EngineOutcome::Unchanged;
                }
                AllocationState::Completed | AllocationState::Cancelled => {
                    let mut fresh = ShardSlot::new(primary, candidates);
                    fresh.cancelling = slot.cancelling.take();
                    *slot = fresh;
                }
                _ => {
                    slot.primary = primary;
                    slot.candidates.extend(candidates);
                    return EngineOutcome::Refetch;
                }
            }
        } else {
            self.slots
                .insert(replica.clone(), ShardSlot::new(primary, candidates));
        }

        let Some(slot) = self.slots.get_mut(&replica) else {
            return EngineOutcome::Unchanged;
        };
        let handle = self.attempts.insert(RecoveryAttempt {
            replica: replica.clone(),
            source: slot.primary.clone(),
            target: None,
            phase: AttemptPhase::Fetching,
            started_at: now,
        });
        slot.active = Some(handle);
        tracing::debug!(replica = %replica, attempt = %handle, "picked up unassigned replica");
        EngineOutcome::Refetch
    }

    /// Nodes a new round for `replica` should query, `None` once the replica
    /// needs no more rounds
    pub fn fetch_request(&self, replica: &ReplicaId) -> Option<FetchRequest> {
        let slot = self.slots.get(replica)?;
        if slot.state.is_terminal() {
            return None;
        }
        Some(FetchRequest {
            replica: replica.clone(),
            primary: slot.primary.clone(),
            candidates: slot.candidates.clone(),
        })
    }

    /// Record that `round` was started; responses of older rounds become
    /// stale
    pub fn on_fetch_started(&mut self, replica: &ReplicaId, round: FetchRoundId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(replica)
            .ok_or_else(|| Error::ShardNotFound(replica.to_string()))?;
        if slot.pending_round.map_or(true, |pending| round > pending) {
            slot.pending_round = Some(round);
        }
        if slot.state == AllocationState::Idle {
            transition(replica, slot, AllocationState::Fetching);
        }
        Ok(())
    }

    /// Apply a finished fetch round started for `replica`
    pub fn on_fetch_completed(
        &mut self,
        replica: &ReplicaId,
        round: FetchRound,
        now: Instant,
    ) -> EngineOutcome {
        if round.shard != replica.shard {
            tracing::warn!(replica = %replica, shard = %round.shard, "fetch round belongs to another shard");
            return EngineOutcome::Stale;
        }
        let taken = self.taken_by_siblings(replica);
        let Some(slot) = self.slots.get_mut(replica) else {
            return EngineOutcome::Stale;
        };
        let superseded = slot.pending_round.is_some_and(|pending| round.id < pending)
            || slot
                .latest_round
                .as_ref()
                .is_some_and(|latest| round.id <= latest.id);
        if slot.state.is_terminal() || superseded {
            tracing::debug!(replica = %replica, round = %round.id, state = %slot.state, "discarding stale fetch round");
            return EngineOutcome::Stale;
        }

        let conclusive = is_conclusive(&round, slot, &taken, now);
        let round_id = round.id;
        slot.latest_round = Some(round);

        if !conclusive {
            if slot.insufficient_rounds < self.settings.max_fetch_retries {
                slot.insufficient_rounds += 1;
                tracing::debug!(
                    replica = %replica,
                    round = %round_id,
                    retry = slot.insufficient_rounds,
                    "fetch round inconclusive, refetching"
                );
                return EngineOutcome::Refetch;
            }
            tracing::info!(replica = %replica, round = %round_id, "fetch retries exhausted, deciding with partial data");
        }
        slot.insufficient_rounds = 0;
        decide(replica, slot, &mut self.attempts, &taken, now)
    }

    /// Apply a report from the orchestrator
    pub fn on_recovery_event(&mut self, event: RecoveryEvent, now: Instant) -> EngineOutcome {
        let handle = event.handle;
        let Some(attempt) = self.attempts.get(handle) else {
            tracing::debug!(attempt = %handle, "event for unknown attempt");
            return EngineOutcome::Stale;
        };
        let replica = attempt.replica.clone();
        let target = attempt.target.clone();
        let taken = self.taken_by_siblings(&replica);
        let Some(slot) = self.slots.get_mut(&replica) else {
            self.attempts.remove(handle);
            return EngineOutcome::Stale;
        };

        if slot.cancelling == Some(handle) {
            return match event.kind {
                RecoveryEventKind::CancelAcknowledged | RecoveryEventKind::Failed(_) => {
                    self.attempts.remove(handle);
                    slot.cancelling = None;
                    tracing::debug!(replica = %replica, attempt = %handle, "cancellation acknowledged");
                    if slot.state == AllocationState::Decided {
                        start_if_clear(&replica, slot, &mut self.attempts)
                    } else {
                        EngineOutcome::Unchanged
                    }
                }
                RecoveryEventKind::PhaseChanged(RecoveryStage::Done) => {
                    // the cancelled recovery won the race; the replica is there
                    self.attempts.remove(handle);
                    slot.cancelling = None;
                    if let Some(pending) = slot.active.take() {
                        self.attempts.remove(pending);
                    }
                    tracing::info!(replica = %replica, attempt = %handle, "cancelled recovery completed first, dropping replacement");
                    if slot.state != AllocationState::Cancelled {
                        slot.assigned = target;
                        transition(&replica, slot, AllocationState::Completed);
                    }
                    EngineOutcome::Unchanged
                }
                RecoveryEventKind::PhaseChanged(_) => EngineOutcome::Unchanged,
            };
        }

        if slot.active != Some(handle) {
            return EngineOutcome::Stale;
        }

        match event.kind {
            RecoveryEventKind::PhaseChanged(RecoveryStage::Done) => {
                self.attempts.remove(handle);
                slot.active = None;
                tracing::info!(replica = %replica, target = ?target, "recovery completed");
                slot.assigned = target;
                transition(&replica, slot, AllocationState::Completed);
                EngineOutcome::Unchanged
            }
            RecoveryEventKind::PhaseChanged(stage) => {
                tracing::debug!(replica = %replica, attempt = %handle, stage = %stage, "recovery progressed");
                EngineOutcome::Unchanged
            }
            RecoveryEventKind::CancelAcknowledged => {
                tracing::warn!(replica = %replica, attempt = %handle, "cancel acknowledged for an attempt that was not cancelled");
                EngineOutcome::Unchanged
            }
            RecoveryEventKind::Failed(reason) => {
                self.attempts.remove(handle);
                slot.active = None;
                slot.failures += 1;
                if let Some(target) = &target {
                    slot.cooldowns
                        .insert(target.clone(), now + self.settings.failure_cooldown);
                }

                if slot.failures >= self.settings.max_failed_allocations {
                    tracing::warn!(
                        replica = %replica,
                        target = ?target,
                        failures = slot.failures,
                        reason = %reason,
                        "recovery failed too often, replica is stuck"
                    );
                    transition(&replica, slot, AllocationState::Stuck);
                    return EngineOutcome::Unchanged;
                }

                tracing::warn!(
                    replica = %replica,
                    target = ?target,
                    failures = slot.failures,
                    reason = %reason,
                    "recovery failed, choosing another copy"
                );
                let retry = self.attempts.insert(RecoveryAttempt {
                    replica: replica.clone(),
                    source: slot.primary.clone(),
                    target: None,
                    phase: AttemptPhase::Fetching,
                    started_at: now,
                });
                slot.active = Some(retry);
                transition(&replica, slot, AllocationState::Fetching);
                // the last round may predate the failure; without a copy to
                // start right away, ask the cluster again
                match decide(&replica, slot, &mut self.attempts, &taken, now) {
                    EngineOutcome::Commands(commands) => EngineOutcome::Commands(commands),
                    _ => EngineOutcome::Refetch,
                }
            }
        }
    }

    /// Stop allocating `replica`, cancelling any running recovery
    pub fn cancel_allocation(
        &mut self,
        replica: &ReplicaId,
        reason: &str,
    ) -> Result<EngineOutcome> {
        let slot = self
            .slots
            .get_mut(replica)
            .ok_or_else(|| Error::ShardNotFound(replica.to_string()))?;
        if matches!(
            slot.state,
            AllocationState::Completed | AllocationState::Cancelled
        ) {
            return Ok(EngineOutcome::Unchanged);
        }

        let mut commands = Vec::new();
        if let Some(handle) = slot.active.take() {
            let started = self
                .attempts
                .get(handle)
                .is_some_and(|a| a.phase == AttemptPhase::InProgress);
            if started {
                if let Some(attempt) = self.attempts.get_mut(handle) {
                    attempt.phase = AttemptPhase::Cancelled;
                }
                slot.cancelling = Some(handle);
                commands.push(OrchestratorCommand::Cancel {
                    handle,
                    reason: reason.to_string(),
                });
            } else {
                self.attempts.remove(handle);
            }
        }
        tracing::info!(replica = %replica, reason = %reason, "allocation cancelled");
        transition(replica, slot, AllocationState::Cancelled);

        if commands.is_empty() {
            Ok(EngineOutcome::Unchanged)
        } else {
            Ok(EngineOutcome::Commands(commands))
        }
    }

    /// Drop the slot of a replica in a terminal state
    ///
    /// Returns `false`, keeping the slot, while the replica is still being
    /// allocated or a cancelled recovery has not been acknowledged.
    pub fn forget(&mut self, replica: &ReplicaId) -> bool {
        let evictable = self
            .slots
            .get(replica)
            .is_some_and(|slot| slot.state.is_terminal() && slot.cancelling.is_none());
        if evictable {
            self.slots.remove(replica);
            tracing::debug!(replica = %replica, "forgot replica");
        }
        evictable
    }

    /// Replicas that should be refetched because `node` left
    pub fn on_node_left(&mut self, node: &NodeId) -> Vec<ReplicaId> {
        let mut affected: Vec<ReplicaId> = Vec::new();
        for (replica, slot) in &self.slots {
            if slot.state.is_terminal() {
                continue;
            }
            let is_target = slot
                .active
                .and_then(|h| self.attempts.get(h))
                .is_some_and(|a| a.target.as_ref() == Some(node));
            if is_target || slot.candidates.contains(node) {
                affected.push(replica.clone());
            }
        }
        affected.sort();
        if !affected.is_empty() {
            tracing::debug!(node = %node, replicas = affected.len(), "node left, refetching replicas");
        }
        affected
    }

    /// Replicas that should be refetched because `node` joined and may hold
    /// a copy
    pub fn on_node_joined(&mut self, node: &NodeId) -> Vec<ReplicaId> {
        let mut affected: Vec<ReplicaId> = Vec::new();
        for (replica, slot) in self.slots.iter_mut() {
            if slot.state.is_terminal() || &slot.primary == node {
                continue;
            }
            slot.candidates.insert(node.clone());
            affected.push(replica.clone());
        }
        affected.sort();
        affected
    }
}

/// A round settles the decision when the primary answered and no silent
/// node could still beat the best known copy
fn is_conclusive(
    round: &FetchRound,
    slot: &ShardSlot,
    taken: &BTreeSet<NodeId>,
    now: Instant,
) -> bool {
    let Some(primary) = round.primary_info() else {
        return false;
    };
    let silent = round.copies().any(|(_, response)| response.is_unknown());
    if !silent {
        return true;
    }
    select_copy(round, &primary, None, |node| {
        slot.is_cooling(node, now) || taken.contains(node)
    })
    .is_some_and(|best| best.noop)
}

/// When the first cooling copy of `round` becomes eligible again
fn first_cooldown_expiry(
    round: &FetchRound,
    cooldowns: &HashMap<NodeId, Instant>,
    taken: &BTreeSet<NodeId>,
    now: Instant,
) -> Option<Instant> {
    round
        .copies()
        .filter(|(node, response)| response.copy().is_some() && !taken.contains(*node))
        .filter_map(|(node, _)| cooldowns.get(node).copied())
        .filter(|until| *until > now)
        .min()
}

fn decide(
    replica: &ReplicaId,
    slot: &mut ShardSlot,
    attempts: &mut Arena<RecoveryAttempt>,
    taken: &BTreeSet<NodeId>,
    now: Instant,
) -> EngineOutcome {
    let Some(round) = slot.latest_round.as_ref() else {
        return EngineOutcome::Unchanged;
    };
    let Some(primary) = round.primary_info() else {
        tracing::warn!(replica = %replica, primary = %slot.primary, "primary store facts unavailable, waiting for cluster changes");
        transition(replica, slot, AllocationState::Idle);
        return EngineOutcome::Unchanged;
    };
    let Some(active) = slot.active else {
        return EngineOutcome::Unchanged;
    };
    let current = attempts.get(active).and_then(|a| a.target.clone());
    let cooldowns = &slot.cooldowns;
    let best = select_copy(round, &primary, current.as_ref(), |node| {
        cooldowns.get(node).is_some_and(|until| *until > now) || taken.contains(node)
    });

    match slot.state {
        AllocationState::Idle | AllocationState::Fetching => {
            let Some(best) = best else {
                let ready_at = first_cooldown_expiry(round, cooldowns, taken, now);
                let round_id = round.id;
                transition(replica, slot, AllocationState::Idle);
                return match ready_at {
                    Some(until) => {
                        let delay = until - now;
                        tracing::debug!(replica = %replica, round = %round_id, delay = ?delay, "every copy is cooling down");
                        EngineOutcome::RefetchAfter(delay)
                    }
                    None => {
                        tracing::debug!(replica = %replica, round = %round_id, "no eligible copy");
                        EngineOutcome::Unchanged
                    }
                };
            };
            if let Some(attempt) = attempts.get_mut(active) {
                attempt.target = Some(best.node.clone());
                attempt.phase = AttemptPhase::Selected;
            }
            tracing::info!(
                replica = %replica,
                target = %best.node,
                noop = best.noop,
                matched_ops = best.matched_ops,
                "selected recovery target"
            );
            transition(replica, slot, AllocationState::Decided);
            start_if_clear(replica, slot, attempts)
        }
        AllocationState::Decided => {
            if let Some(best) = best {
                if current.as_ref() != Some(&best.node) {
                    tracing::info!(replica = %replica, from = ?current, to = %best.node, "retargeting pending recovery");
                    if let Some(attempt) = attempts.get_mut(active) {
                        attempt.target = Some(best.node);
                    }
                }
            }
            EngineOutcome::Unchanged
        }
        AllocationState::Recovering => {
            let (Some(best), Some(current)) = (best, current) else {
                return EngineOutcome::Unchanged;
            };
            if !should_preempt(round, &primary, &current, &best) {
                return EngineOutcome::Unchanged;
            }
            if let Some(attempt) = attempts.get_mut(active) {
                attempt.phase = AttemptPhase::Cancelled;
            }
            let next = attempts.insert(RecoveryAttempt {
                replica: replica.clone(),
                source: slot.primary.clone(),
                target: Some(best.node.clone()),
                phase: AttemptPhase::Selected,
                started_at: now,
            });
            slot.cancelling = Some(active);
            slot.active = Some(next);
            tracing::info!(
                replica = %replica,
                from = %current,
                to = %best.node,
                "cancelling recovery for a copy that needs no file transfer"
            );
            transition(replica, slot, AllocationState::Decided);
            EngineOutcome::Commands(vec![OrchestratorCommand::Cancel {
                handle: active,
                reason: format!("found a no-op recovery copy on {}", best.node),
            }])
        }
        AllocationState::Completed | AllocationState::Cancelled | AllocationState::Stuck => {
            EngineOutcome::Unchanged
        }
    }
}

/// Issue the start of the active attempt unless a cancellation is pending
fn start_if_clear(
    replica: &ReplicaId,
    slot: &mut ShardSlot,
    attempts: &mut Arena<RecoveryAttempt>,
) -> EngineOutcome {
    if let Some(cancelling) = slot.cancelling {
        tracing::debug!(replica = %replica, waiting_on = %cancelling, "start deferred until cancellation is acknowledged");
        return EngineOutcome::Unchanged;
    }
    let Some(handle) = slot.active else {
        return EngineOutcome::Unchanged;
    };
    let Some(attempt) = attempts.get_mut(handle) else {
        return EngineOutcome::Unchanged;
    };
    let Some(target) = attempt.target.clone() else {
        return EngineOutcome::Unchanged;
    };
    attempt.phase = AttemptPhase::InProgress;
    let source = attempt.source.clone();
    tracing::info!(replica = %replica, attempt = %handle, source = %source, target = %target, "starting recovery");
    transition(replica, slot, AllocationState::Recovering);
    EngineOutcome::Commands(vec![OrchestratorCommand::Start {
        handle,
        shard: replica.shard.clone(),
        source,
        target,
    }])
}
