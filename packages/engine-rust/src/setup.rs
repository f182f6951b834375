//! Setup builder and the process-wide engine registry.
//!
//! A *setup* is one named engine instance with its own storage root and
//! configuration. Creation is idempotent per name: asking for an existing
//! name returns the running engine. Removal tears the engine down within the
//! process-wide cleanup timeout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::error;

use crate::config::{EngineConfig, RemoteConfig, StorageConfig, DEFAULT_CACHE_SIZE};
use crate::engine::ExchangeEngine;
use crate::error::{Result, StoreError};

/// Name of the default setup.
pub const DEFAULT_SETUP: &str = "default";

/// Handler invoked when an engine enters its fatal state. Receives the setup
/// name and the error description; it may abort, restart, or isolate.
pub type FatalErrorHandler = Box<dyn Fn(&str, &str) + Send + Sync>;

fn registry() -> &'static DashMap<String, Arc<ExchangeEngine>> {
    static REGISTRY: OnceLock<DashMap<String, Arc<ExchangeEngine>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

static CLEANUP_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5_000);

pub(crate) fn default_fatal_handler() -> FatalErrorHandler {
    Box::new(|setup, message| {
        error!(setup, "unhandled fatal exchange error: {message}");
    })
}

/// Builder for a named engine instance.
pub struct Setup {
    local_dir: Option<PathBuf>,
    cache_size: u64,
    remote: RemoteConfig,
    fatal_handler: Option<FatalErrorHandler>,
}

impl Default for Setup {
    fn default() -> Self {
        Self::new()
    }
}

impl Setup {
    /// Starts an empty setup; `local_dir` must be set before `create`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            local_dir: None,
            cache_size: DEFAULT_CACHE_SIZE,
            remote: RemoteConfig::default(),
            fatal_handler: None,
        }
    }

    /// Sets the storage root directory.
    #[must_use]
    pub fn local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = Some(dir.into());
        self
    }

    /// Sets the payload cache budget in bytes.
    #[must_use]
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Enables or disables the remote exchange side.
    #[must_use]
    pub fn remote_enabled(mut self, enabled: bool) -> Self {
        self.remote.enabled = enabled;
        self
    }

    /// Sets the relay endpoint (`ws://` or `wss://`).
    #[must_use]
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote.url = url.into();
        self
    }

    /// Sets the bearer credential sent during the websocket handshake.
    #[must_use]
    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.remote.access_key = Some(key.into());
        self
    }

    /// Adds an extra handshake header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.remote.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the keepalive probe interval.
    #[must_use]
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.remote.keepalive_timeout = timeout;
        self
    }

    /// Sets the human-readable device label.
    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.remote.device_name = name.into();
        self
    }

    /// Sets the deployment secret used for first-contact registration.
    #[must_use]
    pub fn server_secret(mut self, secret: impl Into<String>) -> Self {
        self.remote.server_secret = secret.into();
        self
    }

    /// Sets the owning user identity.
    #[must_use]
    pub fn user_identity(mut self, identity: impl Into<String>) -> Self {
        self.remote.user_identity = identity.into();
        self
    }

    /// Installs the fatal error handler for this setup.
    #[must_use]
    pub fn fatal_error_handler(mut self, handler: FatalErrorHandler) -> Self {
        self.fatal_handler = Some(handler);
        self
    }

    /// Creates the engine under `name`, or returns the running one if the
    /// name is already registered.
    ///
    /// # Errors
    ///
    /// [`StoreError::StorageFailure`] when no local directory was configured
    /// or the storage root cannot be initialized.
    pub fn create(self, name: &str) -> Result<Arc<ExchangeEngine>> {
        match registry().entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let local_dir = self.local_dir.ok_or_else(|| {
                    StoreError::StorageFailure("no local directory configured".to_string())
                })?;
                let config = EngineConfig {
                    storage: StorageConfig {
                        local_dir,
                        cache_size: self.cache_size,
                    },
                    remote: self.remote,
                };
                let handler = self.fatal_handler.unwrap_or_else(default_fatal_handler);
                let engine = ExchangeEngine::create(name, config, handler)?;
                slot.insert(Arc::clone(&engine));
                Ok(engine)
            }
        }
    }

    /// Looks up a running engine by setup name.
    #[must_use]
    pub fn engine(name: &str) -> Option<Arc<ExchangeEngine>> {
        registry().get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Sets the maximum time `remove_setup` waits for an engine to stop.
    pub fn set_cleanup_timeout(timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        CLEANUP_TIMEOUT_MS.store(millis, Ordering::SeqCst);
    }

    /// Stops and unregisters a setup. With `wait_for_finished` the call
    /// blocks until teardown completes (bounded by the cleanup timeout);
    /// otherwise teardown continues on a background thread.
    pub fn remove_setup(name: &str, wait_for_finished: bool) {
        let Some((_, engine)) = registry().remove(name) else {
            return;
        };
        let timeout = Duration::from_millis(CLEANUP_TIMEOUT_MS.load(Ordering::SeqCst));
        if wait_for_finished {
            engine.finalize(timeout);
        } else {
            thread::spawn(move || engine.finalize(timeout));
        }
    }
}
