//! The exchange engine: composition root of one setup.
//!
//! An engine owns its execution context outright: a dedicated worker thread
//! serializes all store operations, and a private tokio runtime hosts the
//! connector, the change controller, and the cross-instance listener. The
//! components never reference each other; everything flows through channels,
//! so teardown is a matter of closing them in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::auth::KeyStore;
use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::facade::{as_unit, run_store_worker, RawReply, StoreRequest, Task};
use crate::setup::FatalErrorHandler;
use crate::store::emitter::{self, BroadcastEvent};
use crate::store::{DataEvent, LocalStore};
use crate::sync::change_controller::{ChangeController, ControllerCommand};
use crate::sync::connector::{ConnectorCommand, RemoteConnector};

/// Externally visible synchronization state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No relay connection (or the remote side is disabled).
    Disconnected,
    /// Connection and handshake in progress.
    Loading,
    /// Connected; uploads or announced downloads outstanding.
    Syncing,
    /// Connected with nothing left to exchange.
    Synced,
    /// A storage invariant or fatal relay error ended exchange permanently.
    Fatal,
}

/// State shared between the engine handle and its worker tasks.
pub(crate) struct EngineShared {
    name: String,
    state: watch::Sender<SyncState>,
    last_error: Mutex<Option<String>>,
    fatal_handler: FatalErrorHandler,
    fatal: AtomicBool,
}

impl EngineShared {
    pub(crate) fn new(
        name: &str,
        fatal_handler: FatalErrorHandler,
    ) -> (Arc<Self>, watch::Receiver<SyncState>) {
        let (state, state_rx) = watch::channel(SyncState::Disconnected);
        (
            Arc::new(Self {
                name: name.to_string(),
                state,
                last_error: Mutex::new(None),
                fatal_handler,
                fatal: AtomicBool::new(false),
            }),
            state_rx,
        )
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        if self.is_fatal() {
            return;
        }
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub(crate) fn set_error(&self, message: String) {
        warn!(setup = %self.name, "{message}");
        *self.last_error.lock() = Some(message);
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub(crate) fn fatal_message(&self) -> String {
        self.last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "engine is in a fatal state".to_string())
    }

    /// Latches the fatal state and invokes the setup's fatal handler. Only
    /// the first call has any effect.
    pub(crate) fn enter_fatal(&self, message: &str) {
        if self.fatal.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(setup = %self.name, "fatal exchange failure: {message}");
        *self.last_error.lock() = Some(message.to_string());
        self.state.send_replace(SyncState::Fatal);
        (self.fatal_handler)(&self.name, message);
    }
}

/// One running exchange engine, registered under a setup name.
pub struct ExchangeEngine {
    name: String,
    store: Arc<LocalStore>,
    shared: Arc<EngineShared>,
    requests: mpsc::UnboundedSender<StoreRequest>,
    state_rx: watch::Receiver<SyncState>,
    runtime: Mutex<Option<Runtime>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    connector: Mutex<Option<mpsc::UnboundedSender<ConnectorCommand>>>,
    controller: Mutex<Option<mpsc::UnboundedSender<ControllerCommand>>>,
}

impl ExchangeEngine {
    /// Builds and starts an engine: opens the store, spawns the worker
    /// thread and runtime, and wires the remote side when enabled.
    pub(crate) fn create(
        name: &str,
        config: EngineConfig,
        fatal_handler: FatalErrorHandler,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(LocalStore::open(&config.storage)?);
        let (shared, state_rx) = EngineShared::new(name, fatal_handler);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let worker = {
            let store = Arc::clone(&store);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("peersync-store-{name}"))
                .spawn(move || run_store_worker(&store, &shared, request_rx))?
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name(format!("peersync-sync-{name}"))
            .build()?;

        {
            let store = Arc::clone(&store);
            let events = emitter::subscribe();
            runtime.spawn(run_emitter_listener(store, events));
        }

        let mut connector_tx = None;
        let mut controller_tx = None;
        if config.remote.enabled {
            let keystore = KeyStore::load_or_create(&config.storage.local_dir)?;
            let (conn_tx, conn_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (local_tx, local_rx) = mpsc::unbounded_channel();
            let (control_tx, control_rx) = mpsc::unbounded_channel();

            store.set_sync_notifier(Some(local_tx));
            runtime.spawn(
                RemoteConnector::new(config.remote.clone(), keystore, conn_rx, event_tx).run(),
            );
            runtime.spawn(
                ChangeController::new(
                    Arc::clone(&store),
                    Arc::clone(&shared),
                    conn_tx.clone(),
                    event_rx,
                    local_rx,
                    control_rx,
                )
                .run(),
            );
            connector_tx = Some(conn_tx);
            controller_tx = Some(control_tx);
            info!(setup = name, url = %config.remote.url, "remote exchange enabled");
        } else {
            info!(setup = name, "storage-only engine created");
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            store,
            shared,
            requests: request_tx,
            state_rx,
            runtime: Mutex::new(Some(runtime)),
            worker: Mutex::new(Some(worker)),
            connector: Mutex::new(connector_tx),
            controller: Mutex::new(controller_tx),
        }))
    }

    /// The setup name this engine is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct access to the backing store.
    #[must_use]
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Current synchronization state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Watches synchronization state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// Subscribes to data change notifications.
    #[must_use]
    pub fn subscribe_data(&self) -> broadcast::Receiver<DataEvent> {
        self.store.subscribe()
    }

    /// The most recent recoverable error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    pub(crate) fn request_sender(&self) -> mpsc::UnboundedSender<StoreRequest> {
        self.requests.clone()
    }

    pub(crate) fn data_sender(&self) -> broadcast::Sender<DataEvent> {
        self.store.listener_sender()
    }

    /// Pushes any pending local changes to the relay.
    pub fn trigger_sync(&self) -> Task<()> {
        self.trigger(|reply| ControllerCommand::TriggerSync { reply })
    }

    /// Requests a relay-side full refresh and reconciles against it.
    pub fn trigger_resync(&self) -> Task<()> {
        self.trigger(|reply| ControllerCommand::TriggerResync { reply })
    }

    /// Drops all local data without touching the change log or the relay.
    pub fn reset_store(&self) -> Task<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(StoreRequest::Reset { reply: tx })
            .is_err()
        {
            return Task::ready(
                Err(StoreError::Fatal(
                    "engine stopped before completing the request".to_string(),
                )),
                as_unit,
            );
        }
        Task::new(rx, as_unit)
    }

    fn trigger(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<RawReply>>) -> ControllerCommand,
    ) -> Task<()> {
        let controller = self.controller.lock();
        let Some(controller) = controller.as_ref() else {
            return Task::ready(Err(StoreError::Offline), as_unit);
        };
        let (tx, rx) = oneshot::channel();
        if controller.send(build(tx)).is_err() {
            return Task::ready(Err(StoreError::Offline), as_unit);
        }
        Task::new(rx, as_unit)
    }

    /// Stops the engine: closes the relay connection gracefully, drains the
    /// runtime within `timeout`, and joins the store worker.
    ///
    /// Must be called from a synchronous context.
    pub fn finalize(&self, timeout: Duration) {
        info!(setup = %self.name, "finalizing engine");
        self.store.set_sync_notifier(None);
        if let Some(connector) = self.connector.lock().take() {
            let _ = connector.send(ConnectorCommand::Finalize);
        }
        self.controller.lock().take();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(timeout);
        }
        let _ = self.requests.send(StoreRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        self.shared.set_state(SyncState::Disconnected);
    }
}

impl Drop for ExchangeEngine {
    fn drop(&mut self) {
        // Finalize may already have run; this only covers handles dropped
        // without one. Background shutdown is safe from any context.
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        let _ = self.requests.send(StoreRequest::Shutdown);
    }
}

async fn run_emitter_listener(
    store: Arc<LocalStore>,
    mut events: broadcast::Receiver<BroadcastEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => store.apply_broadcast(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cross-instance change stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::default_fatal_handler;

    #[test]
    fn shared_state_transitions_and_latching() {
        let (shared, state_rx) = EngineShared::new("test", default_fatal_handler());
        assert_eq!(*state_rx.borrow(), SyncState::Disconnected);

        shared.set_state(SyncState::Loading);
        assert_eq!(*state_rx.borrow(), SyncState::Loading);

        shared.enter_fatal("boom");
        assert_eq!(*state_rx.borrow(), SyncState::Fatal);
        assert!(shared.is_fatal());
        assert_eq!(shared.fatal_message(), "boom");

        // Latched: later transitions are ignored.
        shared.set_state(SyncState::Synced);
        assert_eq!(*state_rx.borrow(), SyncState::Fatal);
    }

    #[test]
    fn fatal_handler_fires_exactly_once() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let handler: FatalErrorHandler = {
            let calls = Arc::clone(&calls);
            Box::new(move |_setup, _message| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (shared, _state_rx) = EngineShared::new("test", handler);

        shared.enter_fatal("first");
        shared.enter_fatal("second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.fatal_message(), "first");
    }

    #[test]
    fn errors_are_recorded_and_cleared() {
        let (shared, _state_rx) = EngineShared::new("test", default_fatal_handler());
        assert!(shared.last_error().is_none());

        shared.set_error("authentication failed: nope".to_string());
        assert_eq!(
            shared.last_error().as_deref(),
            Some("authentication failed: nope")
        );

        shared.clear_error();
        assert!(shared.last_error().is_none());
    }
}
