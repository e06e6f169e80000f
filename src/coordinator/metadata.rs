//! Coordination metadata and the store it is committed to
//!
//! Stores:
//! - Last committed and last accepted voting configurations
//! - Retired node ids
//! - Metadata version (compare-and-set token)

use crate::common::{Error, Result};
use crate::coordinator::voting::{NodeId, VotingConfiguration};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// Coordination section of the cluster metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationMetadata {
    pub term: u64,
    pub last_committed_config: VotingConfiguration,
    pub last_accepted_config: VotingConfiguration,
    pub retired: BTreeSet<NodeId>,
}

impl Default for CoordinationMetadata {
    fn default() -> Self {
        Self {
            term: 0,
            last_committed_config: VotingConfiguration::empty(),
            last_accepted_config: VotingConfiguration::empty(),
            retired: BTreeSet::new(),
        }
    }
}

fn codec(limit: u64) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit)
}

impl CoordinationMetadata {
    /// Encode for publication, refusing payloads above `limit` bytes
    pub fn encode(&self, limit: u64) -> Result<Vec<u8>> {
        codec(limit)
            .serialize(self)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Durable home of the coordination metadata
///
/// `commit` is a compare-and-set on the metadata version: it succeeds only
/// when nothing was committed since `expected_version` was read.
pub trait MetadataStore: Send + Sync {
    /// Current version, 0 before the first commit
    fn version(&self) -> Result<u64>;

    /// Last committed metadata with its version
    fn load(&self) -> Result<Option<(u64, CoordinationMetadata)>>;

    /// Commit an encoded publication, returning the new version
    fn commit(&self, expected_version: u64, publication: &[u8]) -> Result<u64>;
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    publication: Option<Vec<u8>>,
}

/// Metadata store kept in memory
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    inner: Mutex<Committed>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Committed>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("metadata store lock poisoned".into()))
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn version(&self) -> Result<u64> {
        Ok(self.lock()?.version)
    }

    fn load(&self) -> Result<Option<(u64, CoordinationMetadata)>> {
        let committed = self.lock()?;
        match &committed.publication {
            Some(bytes) => Ok(Some((
                committed.version,
                CoordinationMetadata::decode(bytes)?,
            ))),
            None => Ok(None),
        }
    }

    fn commit(&self, expected_version: u64, publication: &[u8]) -> Result<u64> {
        let mut committed = self.lock()?;
        if committed.version != expected_version {
            return Err(Error::CommitConflict {
                expected: expected_version,
                actual: committed.version,
            });
        }
        // reject garbage before it becomes the committed state
        CoordinationMetadata::decode(publication)?;
        committed.publication = Some(publication.to_vec());
        committed.version += 1;
        Ok(committed.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(ids: &[&str]) -> CoordinationMetadata {
        let config = VotingConfiguration::from_ids(ids.iter().copied());
        CoordinationMetadata {
            term: 3,
            last_committed_config: config.clone(),
            last_accepted_config: config,
            retired: BTreeSet::new(),
        }
    }

    #[test]
    fn test_commit_and_load() {
        let store = InMemoryMetadataStore::new();
        assert_eq!(store.version().unwrap(), 0);
        assert!(store.load().unwrap().is_none());

        let meta = metadata(&["a", "b", "c"]);
        let bytes = meta.encode(1024).unwrap();
        assert_eq!(store.commit(0, &bytes).unwrap(), 1);

        let (version, loaded) = store.load().unwrap().unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_commit_conflict() {
        let store = InMemoryMetadataStore::new();
        let bytes = metadata(&["a"]).encode(1024).unwrap();
        store.commit(0, &bytes).unwrap();

        let err = store.commit(0, &bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::CommitConflict {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(store.version().unwrap(), 1);
    }

    #[test]
    fn test_encode_respects_limit() {
        let meta = metadata(&["node-with-a-long-identifier-0", "node-with-a-long-identifier-1"]);
        assert!(matches!(meta.encode(8), Err(Error::Serialization(_))));
        assert!(meta.encode(4096).is_ok());
    }

    #[test]
    fn test_corrupt_publication_rejected() {
        let store = InMemoryMetadataStore::new();
        assert!(store.commit(0, &[0xff, 0xff, 0xff]).is_err());
        assert_eq!(store.version().unwrap(), 0);
    }
}
