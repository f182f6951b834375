//! Error types for the `PeerSync` engine.

use peersync_core::ObjectKey;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// All possible errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A load or remove targeted a key that does not exist.
    #[error("no data found for {0}")]
    NotFound(ObjectKey),

    /// On-disk payload failed its checksum or could not be decoded.
    #[error("corrupted data for {key}: {reason}")]
    Corrupted {
        /// The record whose payload is damaged.
        key: ObjectKey,
        /// What exactly failed.
        reason: String,
    },

    /// A user value could not be (de)serialized at the facade boundary.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The database or filesystem reported an error.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// The operation requires the relay but no connection is available.
    #[error("remote side is not available")]
    Offline,

    /// The relay sent a malformed or unexpected frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The relay rejected identify, login, or registration.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// No engine is registered under the requested setup name.
    #[error("no setup named {0:?}")]
    SetupNotFound(String),

    /// A storage invariant was violated; the engine is no longer usable.
    #[error("fatal engine state: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::StorageFailure(format!("sqlite: {err}"))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::StorageFailure(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::NotFound(ObjectKey::new("Note", "a"));
        assert_eq!(err.to_string(), "no data found for Note(a)");

        let err = StoreError::Corrupted {
            key: ObjectKey::new("Note", "a"),
            reason: "checksum mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "corrupted data for Note(a): checksum mismatch"
        );

        let err = StoreError::Offline;
        assert_eq!(err.to_string(), "remote side is not available");

        let err = StoreError::SetupNotFound("other".to_string());
        assert_eq!(err.to_string(), "no setup named \"other\"");
    }

    #[test]
    fn sqlite_errors_map_to_storage_failure() {
        let err: StoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StoreError::StorageFailure(_)));
    }

    #[test]
    fn io_errors_map_to_storage_failure() {
        let err: StoreError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, StoreError::StorageFailure(_)));
    }
}
