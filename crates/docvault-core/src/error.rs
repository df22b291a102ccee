//! Error types for docvault-core

use thiserror::Error;

/// Result type alias using docvault-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in docvault-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network failure or timeout talking to the remote backend (retryable)
    #[error("Network error: {0}")]
    Network(String),

    /// No valid session; all queue processing pauses until re-authentication
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// Record or object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or inconsistent data; fatal for the job, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// The remote store rejected a sync id as already taken
    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    /// Remote storage quota exhausted; surfaced, not retried
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// libSQL error
    #[error("Database error: {0}")]
    Database(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blob/object storage error (retryable)
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the offline queue should retry the failed job with backoff.
    ///
    /// Network and storage failures are transient. Everything else either
    /// needs user action (`AuthRequired`, `Validation`, `QuotaExceeded`),
    /// has a dedicated remediation path (`DuplicateIdentifier`), or points
    /// at a local bug.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_storage_errors_are_retryable() {
        assert!(Error::Network("connection reset".to_string()).is_retryable());
        assert!(Error::Storage("put failed".to_string()).is_retryable());
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!Error::AuthRequired("no session".to_string()).is_retryable());
        assert!(!Error::Validation("empty title".to_string()).is_retryable());
        assert!(!Error::QuotaExceeded("5 GB".to_string()).is_retryable());
        assert!(!Error::DuplicateIdentifier("abc".to_string()).is_retryable());
        assert!(!Error::NotFound("abc".to_string()).is_retryable());
    }
}
