//! Reconfiguration service
//!
//! Folds membership events into the cluster snapshot, asks the
//! reconfigurator for the next voting configuration and commits it when it
//! actually changed.

use crate::common::{CoordinationConfig, Error, Result};
use crate::coordinator::membership::{ClusterSnapshot, MembershipEvent};
use crate::coordinator::metadata::{CoordinationMetadata, MetadataStore};
use crate::coordinator::reconfigurator::{reconfigure, ReconfigurationSettings};
use crate::coordinator::voting::VotingConfiguration;
use std::sync::Arc;

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No elected master yet, or the configuration is already right
    Unchanged,
    Committed {
        version: u64,
        config: Arc<VotingConfiguration>,
    },
    /// The voting configuration stayed, the retired set was committed
    Persisted { version: u64 },
}

pub struct ReconfigurationService {
    store: Arc<dyn MetadataStore>,
    settings: ReconfigurationSettings,
    max_publication_bytes: u64,
    snapshot: ClusterSnapshot,
    committed_version: u64,
    term: u64,
}

impl ReconfigurationService {
    /// Start from whatever the store last committed
    pub fn new(store: Arc<dyn MetadataStore>, config: &CoordinationConfig) -> Result<Self> {
        let mut service = Self {
            store,
            settings: ReconfigurationSettings::auto_shrink(config.auto_shrink_voting_configuration),
            max_publication_bytes: config.max_publication_bytes,
            snapshot: ClusterSnapshot::default(),
            committed_version: 0,
            term: 0,
        };
        service.reload()?;
        Ok(service)
    }

    pub fn snapshot(&self) -> &ClusterSnapshot {
        &self.snapshot
    }

    pub fn settings(&self) -> ReconfigurationSettings {
        self.settings
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Toggle auto-shrink; takes effect on the next reconciliation
    pub fn set_auto_shrink(&mut self, enabled: bool) {
        self.settings = ReconfigurationSettings::auto_shrink(enabled);
    }

    /// Apply a membership event and reconcile the voting configuration
    ///
    /// A retirement change that leaves the voting configuration as it is
    /// still gets committed, so a reload never forgets it.
    pub fn on_membership_event(&mut self, event: MembershipEvent) -> Result<CommitOutcome> {
        if let MembershipEvent::MasterElected(id) = &event {
            if self.snapshot.master() != Some(id) {
                self.term += 1;
            }
        }
        let retired_before = matches!(
            event,
            MembershipEvent::Retired(_) | MembershipEvent::Unretired(_)
        )
        .then(|| self.snapshot.retired().clone());
        self.snapshot = self.snapshot.apply(event);

        let outcome = self.reconcile()?;
        let Some(retired_before) = retired_before else {
            return Ok(outcome);
        };
        if outcome != CommitOutcome::Unchanged || &retired_before == self.snapshot.retired() {
            return Ok(outcome);
        }

        let config = Arc::clone(self.snapshot.voting_config());
        let version = self.publish(&config)?;
        tracing::info!(
            version,
            retired = ?self.snapshot.retired(),
            "committed retirement change"
        );
        Ok(CommitOutcome::Persisted { version })
    }

    /// Recompute the voting configuration for the current snapshot
    pub fn reconcile(&mut self) -> Result<CommitOutcome> {
        let Some(master) = self.snapshot.master() else {
            return Ok(CommitOutcome::Unchanged);
        };

        let current = Arc::clone(self.snapshot.voting_config());
        let next = reconfigure(
            &self.snapshot.live_master_eligible(),
            self.snapshot.retired(),
            master,
            &current,
            self.settings,
        )?;
        if Arc::ptr_eq(&next, &current) {
            return Ok(CommitOutcome::Unchanged);
        }

        let version = self.publish(&next)?;
        tracing::info!(
            from = %current,
            to = %next,
            version,
            term = self.term,
            "committed voting configuration"
        );
        self.snapshot = self
            .snapshot
            .apply(MembershipEvent::Committed(Arc::clone(&next)));
        Ok(CommitOutcome::Committed {
            version,
            config: next,
        })
    }

    /// Encode `config` with the current term and retirements and commit it
    /// on top of the last version this service saw
    fn publish(&mut self, config: &Arc<VotingConfiguration>) -> Result<u64> {
        let metadata = CoordinationMetadata {
            term: self.term,
            last_committed_config: (**config).clone(),
            last_accepted_config: (**config).clone(),
            retired: self.snapshot.retired().clone(),
        };
        let publication = match metadata.encode(self.max_publication_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(config = %config, error = %e, "failed to serialize coordination metadata");
                return Err(e);
            }
        };

        match self.store.commit(self.committed_version, &publication) {
            Ok(version) => {
                self.committed_version = version;
                Ok(version)
            }
            Err(e) => {
                tracing::warn!(
                    config = %config,
                    expected_version = self.committed_version,
                    error = %e,
                    "failed to commit coordination metadata"
                );
                if matches!(e, Error::CommitConflict { .. }) {
                    self.reload()?;
                }
                Err(e)
            }
        }
    }

    /// Adopt the store's committed configuration, retirements and term
    pub fn reload(&mut self) -> Result<()> {
        let Some((version, metadata)) = self.store.load()? else {
            self.committed_version = self.store.version()?;
            return Ok(());
        };
        self.committed_version = version;
        self.term = self.term.max(metadata.term);

        let mut snapshot = self
            .snapshot
            .apply(MembershipEvent::Committed(Arc::new(metadata.last_committed_config)));
        for id in self.snapshot.retired().difference(&metadata.retired) {
            snapshot = snapshot.apply(MembershipEvent::Unretired(id.clone()));
        }
        for id in metadata.retired {
            snapshot = snapshot.apply(MembershipEvent::Retired(id));
        }
        self.snapshot = snapshot;
        tracing::debug!(
            version,
            config = %self.snapshot.voting_config(),
            "loaded committed coordination metadata"
        );
        Ok(())
    }
}
