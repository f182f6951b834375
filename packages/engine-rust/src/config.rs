//! Engine configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Default payload cache budget in bytes.
pub const DEFAULT_CACHE_SIZE: u64 = 4 * 1024 * 1024;

/// Default keepalive probe interval.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage-side configuration.
///
/// No `Default` impl because the storage root has no sensible default.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding `store.db`, the payload tree, and the key store.
    /// Must not be shared with any other process.
    pub local_dir: PathBuf,
    /// Payload cache budget in bytes.
    pub cache_size: u64,
}

impl StorageConfig {
    /// Creates a storage configuration rooted at `local_dir` with defaults.
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Relay-side configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Gates the whole remote side; when false the engine is storage-only.
    pub enabled: bool,
    /// Relay endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Bearer credential sent as an `Authorization` handshake header.
    pub access_key: Option<String>,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    /// Interval between keepalive probes; a probe without a response by the
    /// next interval tears the connection down.
    pub keepalive_timeout: Duration,
    /// Human-readable label for this device, shown on other devices.
    pub device_name: String,
    /// Shared deployment secret required for first-contact registration.
    pub server_secret: String,
    /// Identity of the owning user account.
    pub user_identity: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            access_key: None,
            headers: Vec::new(),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            device_name: "peersync-device".to_string(),
            server_secret: String::new(),
            user_identity: String::new(),
        }
    }
}

/// Complete configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage-side settings.
    pub storage: StorageConfig,
    /// Relay-side settings.
    pub remote: RemoteConfig,
}
