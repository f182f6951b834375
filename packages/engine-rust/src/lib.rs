//! `PeerSync` Engine -- the on-device record exchange engine.
//!
//! Keeps a full local replica of structured records (typed key/value pairs
//! carrying a JSON object) and exchanges changes with a relay over a
//! persistent websocket. The pieces:
//!
//! - **Store** ([`store`]): hybrid file+index storage with content-addressed
//!   integrity, a byte-budgeted payload cache, and the transactional change
//!   log of pending uploads
//! - **Sync** ([`sync`]): the relay connector state machine (backoff,
//!   keepalive, handshake) and the change controller ordering uploads and
//!   downloads against local mutations
//! - **Facade** ([`facade`]): the task-based [`AsyncDataStore`] API consumed
//!   by applications
//! - **Setup** ([`setup`]): named engine instances in a process-wide registry
//!
//! Offline operation is the normal case: mutations land in the store and its
//! change log first, and the relay catches up whenever a connection exists.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod setup;
pub mod store;
pub mod sync;

// Configuration
pub use config::{EngineConfig, RemoteConfig, StorageConfig, DEFAULT_CACHE_SIZE};

// Engine
pub use engine::{ExchangeEngine, SyncState};

// Errors
pub use error::{Result, StoreError};

// Facade
pub use facade::{AsyncDataStore, StoreObject, Task};

// Setup
pub use setup::{FatalErrorHandler, Setup, DEFAULT_SETUP};

// Store
pub use store::{DataEvent, LocalStore};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify the key types are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let _ = crate::Setup::new();
        let _ = crate::RemoteConfig::default();
        let _ = crate::SyncState::Disconnected;
        let _ = crate::DEFAULT_CACHE_SIZE;
        let _ = crate::DEFAULT_SETUP;
    }
}
