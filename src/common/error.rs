//! Error types for shardcoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Coordination Errors ===
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to serialize cluster metadata: {0}")]
    Serialization(String),

    #[error("Commit conflict: expected metadata version {expected}, found {actual}")]
    CommitConflict { expected: u64, actual: u64 },

    // === Allocation Errors ===
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Fetch from {node} failed: {reason}")]
    FetchFailed { node: String, reason: String },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::FetchFailed { .. } | Error::CommitConflict { .. }
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("fetch".into()).is_retryable());
        assert!(Error::CommitConflict {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!Error::InvalidState("master not live".into()).is_retryable());
        assert!(!Error::Serialization("too large".into()).is_retryable());
        assert!(!Error::ShardNotFound("[idx][0]".into()).is_retryable());
    }
}
