//! Orders uploads and downloads against local mutations.
//!
//! The controller is the only component that touches both the store and the
//! connector. It scans the change log at connect time, dispatches one upload
//! per pending entry under a small in-flight ceiling, reconciles relay
//! acknowledgements against the current record version, applies
//! relay-delivered changes (strictly-newer wins), and owns the engine-level
//! sync state derived from how much work is outstanding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use peersync_core::messages::{codec, RemoteChange};
use peersync_core::{ChangeState, ChangedInfo, ObjectKey};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::engine::{EngineShared, SyncState};
use crate::error::{Result, StoreError};
use crate::facade::RawReply;
use crate::store::LocalStore;
use crate::sync::connector::{ConnectorCommand, ConnectorEvent, RemoteState};

/// How many uploads may await acknowledgement at once.
const MAX_INFLIGHT_UPLOADS: usize = 8;

/// Requests accepted by the controller from the engine facade.
pub(crate) enum ControllerCommand {
    /// Re-scan the change log and push anything pending.
    TriggerSync {
        /// Completion reply.
        reply: oneshot::Sender<Result<RawReply>>,
    },
    /// Request a relay-side full refresh and reconcile against it.
    TriggerResync {
        /// Completion reply.
        reply: oneshot::Sender<Result<RawReply>>,
    },
}

pub(crate) struct ChangeController {
    store: Arc<LocalStore>,
    shared: Arc<EngineShared>,
    connector: mpsc::UnboundedSender<ConnectorCommand>,
    events: mpsc::UnboundedReceiver<ConnectorEvent>,
    local_changes: mpsc::UnboundedReceiver<ChangedInfo>,
    control: mpsc::UnboundedReceiver<ControllerCommand>,
    connected: bool,
    can_update: bool,
    resync_reconcile: bool,
    queue: VecDeque<ChangedInfo>,
    inflight: HashMap<ObjectKey, u64>,
    pending_remote: HashSet<ObjectKey>,
}

impl ChangeController {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        shared: Arc<EngineShared>,
        connector: mpsc::UnboundedSender<ConnectorCommand>,
        events: mpsc::UnboundedReceiver<ConnectorEvent>,
        local_changes: mpsc::UnboundedReceiver<ChangedInfo>,
        control: mpsc::UnboundedReceiver<ControllerCommand>,
    ) -> Self {
        Self {
            store,
            shared,
            connector,
            events,
            local_changes,
            control,
            connected: false,
            can_update: false,
            resync_reconcile: false,
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            pending_remote: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.on_connector_event(event).await;
                }
                change = self.local_changes.recv() => {
                    let Some(change) = change else { break };
                    self.on_local_change(change).await;
                }
                command = self.control.recv() => {
                    let Some(command) = command else { break };
                    self.on_control(command).await;
                }
            }
        }
        debug!("change controller stopped");
    }

    async fn on_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::StateChanged(state) => match state {
                RemoteState::Connected | RemoteState::Registering | RemoteState::LoggingIn => {
                    self.shared.set_state(SyncState::Loading);
                }
                RemoteState::Reconnecting | RemoteState::Disconnected => {
                    // In-flight ack waits are cancelled; the entries stay in
                    // the change log and are re-driven on reconnect.
                    self.connected = false;
                    self.inflight.clear();
                    self.queue.clear();
                    self.pending_remote.clear();
                    self.shared.set_state(SyncState::Disconnected);
                }
                // The welcome event carries the interesting part.
                RemoteState::Idle | RemoteState::Fatal => {}
            },
            ConnectorEvent::RemoteStateLoaded {
                remote_changes,
                can_update,
            } => {
                self.on_remote_state(remote_changes, can_update).await;
            }
            ConnectorEvent::UploadAcked { key, version } => {
                if self.inflight.get(&key) == Some(&version) {
                    self.inflight.remove(&key);
                }
                let acked_key = key.clone();
                let result =
                    with_store(&self.store, move |store| store.acknowledge(&acked_key, version))
                        .await;
                if let Err(err) = result {
                    self.handle_store_error(err);
                }
                self.dispatch_queue().await;
                self.maybe_synced();
            }
            ConnectorEvent::RemoteData {
                key,
                version,
                payload,
            } => {
                self.apply_remote_data(key, version, &payload).await;
            }
            ConnectorEvent::RemoteDelete { key, version } => {
                let applied_key = key.clone();
                let result =
                    with_store(&self.store, move |store| {
                        store.remove_remote(&applied_key, version)
                    })
                    .await;
                match result {
                    Ok(true) => {
                        let _ = self
                            .connector
                            .send(ConnectorCommand::MarkUnchanged { key: key.clone(), version });
                    }
                    Ok(false) => debug!(%key, version, "stale remote delete ignored"),
                    Err(err) => self.handle_store_error(err),
                }
                self.pending_remote.remove(&key);
                self.maybe_synced();
            }
            ConnectorEvent::RequestLocalResync => {
                // The relay has no state for this device; everything local
                // becomes pending again.
                let result = with_store(&self.store, |store| {
                    for type_name in store.type_names()? {
                        store.mark_all_changed(&type_name, ChangeState::Changed)?;
                    }
                    Ok(())
                })
                .await;
                if let Err(err) = result {
                    self.handle_store_error(err);
                }
            }
            ConnectorEvent::ResetRequested => {
                debug!("relay requested a device reset");
                let result = with_store(&self.store, |store| store.reset()).await;
                if let Err(err) = result {
                    self.handle_store_error(err);
                    return;
                }
                self.resync_reconcile = true;
                self.pending_remote.clear();
                self.shared.set_state(SyncState::Loading);
                let _ = self.connector.send(ConnectorCommand::Resync { types: None });
            }
            ConnectorEvent::AuthenticationFailed { reason } => {
                self.connected = false;
                self.shared.set_error(format!("authentication failed: {reason}"));
                self.shared.set_state(SyncState::Disconnected);
            }
            ConnectorEvent::FatalError { message } => {
                self.shared.enter_fatal(&message);
            }
        }
    }

    async fn on_remote_state(&mut self, remote_changes: Vec<RemoteChange>, can_update: bool) {
        self.connected = true;
        self.can_update = can_update;
        self.shared.clear_error();
        self.shared.set_state(SyncState::Syncing);
        self.pending_remote = remote_changes
            .into_iter()
            .map(|change| change.key)
            .collect();

        if self.resync_reconcile {
            self.resync_reconcile = false;
            // Anything we hold that the relay does not know about must be
            // re-uploaded; relay-side news arrives as Data/Delete frames.
            let remote_keys = self.pending_remote.clone();
            let result = with_store(&self.store, move |store| {
                for type_name in store.type_names()? {
                    for id in store.keys(&type_name)? {
                        let key = ObjectKey::new(type_name.clone(), id);
                        if !remote_keys.contains(&key) {
                            store.mark_changed(&key, ChangeState::Changed)?;
                        }
                    }
                }
                Ok(())
            })
            .await;
            if let Err(err) = result {
                self.handle_store_error(err);
            }
        }

        if self.can_update {
            match with_store(&self.store, LocalStore::list_local_changes).await {
                Ok(changes) => {
                    debug!(pending = changes.len(), "scanned change log after welcome");
                    self.queue = changes.into();
                }
                Err(err) => self.handle_store_error(err),
            }
            self.dispatch_queue().await;
        }
        self.maybe_synced();
    }

    async fn on_local_change(&mut self, change: ChangedInfo) {
        if !self.connected || !self.can_update {
            return;
        }
        self.shared.set_state(SyncState::Syncing);
        // A key already awaiting its ack is re-dispatched immediately: the
        // newer version preempts the pending slot.
        if self.inflight.len() < MAX_INFLIGHT_UPLOADS || self.inflight.contains_key(&change.key) {
            self.dispatch_entry(change).await;
        } else {
            self.queue.push_back(change);
        }
    }

    async fn on_control(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::TriggerSync { reply } => {
                if !self.connected {
                    let _ = reply.send(Err(StoreError::Offline));
                    return;
                }
                match with_store(&self.store, LocalStore::list_local_changes).await {
                    Ok(changes) => {
                        self.queue = changes.into();
                        self.dispatch_queue().await;
                        self.maybe_synced();
                        let _ = reply.send(Ok(RawReply::Unit));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            ControllerCommand::TriggerResync { reply } => {
                if !self.connected {
                    let _ = reply.send(Err(StoreError::Offline));
                    return;
                }
                self.resync_reconcile = true;
                self.pending_remote.clear();
                self.shared.set_state(SyncState::Loading);
                let _ = self.connector.send(ConnectorCommand::Resync { types: None });
                let _ = reply.send(Ok(RawReply::Unit));
            }
        }
    }

    async fn apply_remote_data(&mut self, key: ObjectKey, version: u64, payload: &[u8]) {
        match codec::decode_payload(payload) {
            Ok(object) => {
                let applied_key = key.clone();
                let result = with_store(&self.store, move |store| {
                    store.apply_remote(&applied_key, version, &object)
                })
                .await;
                match result {
                    Ok(true) => {
                        // Ack only after the local commit is durable.
                        let _ = self
                            .connector
                            .send(ConnectorCommand::MarkUnchanged { key: key.clone(), version });
                    }
                    Ok(false) => debug!(%key, version, "stale remote data ignored"),
                    Err(err) => self.handle_store_error(err),
                }
            }
            Err(err) => {
                // The payload is unusable as delivered; ask the relay to
                // stream the type again rather than acking garbage.
                warn!(%key, error = %err, "undecodable remote payload, requesting refresh");
                let _ = self.connector.send(ConnectorCommand::Resync {
                    types: Some(vec![key.type_name.clone()]),
                });
            }
        }
        self.pending_remote.remove(&key);
        self.maybe_synced();
    }

    async fn dispatch_entry(&mut self, entry: ChangedInfo) {
        match entry.state {
            ChangeState::Changed => {
                let key = entry.key.clone();
                let result = with_store(&self.store, move |store| store.load_raw(&key)).await;
                match result {
                    Ok((version, payload)) => {
                        self.inflight.insert(entry.key.clone(), version);
                        let _ = self.connector.send(ConnectorCommand::Upload {
                            key: entry.key,
                            version,
                            payload,
                        });
                    }
                    // Deleted between enrollment and dispatch; the tombstone
                    // entry follows separately.
                    Err(StoreError::NotFound(_)) => {
                        debug!(key = %entry.key, "changed entry vanished before upload");
                    }
                    Err(err) => self.handle_store_error(err),
                }
            }
            ChangeState::Deleted => {
                self.inflight.insert(entry.key.clone(), entry.version);
                let _ = self.connector.send(ConnectorCommand::Remove {
                    key: entry.key,
                    version: entry.version,
                });
            }
            ChangeState::Unchanged => {}
        }
    }

    async fn dispatch_queue(&mut self) {
        while self.inflight.len() < MAX_INFLIGHT_UPLOADS {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.dispatch_entry(next).await;
        }
    }

    fn maybe_synced(&self) {
        if self.connected
            && self.queue.is_empty()
            && self.inflight.is_empty()
            && self.pending_remote.is_empty()
        {
            self.shared.set_state(SyncState::Synced);
        }
    }

    fn handle_store_error(&self, err: StoreError) {
        match err {
            StoreError::Fatal(message) => self.shared.enter_fatal(&message),
            other => warn!(error = %other, "store operation failed during exchange"),
        }
    }
}

/// Runs a blocking store operation off the async worker.
async fn with_store<T, F>(store: &Arc<LocalStore>, operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&LocalStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(&store))
        .await
        .map_err(|err| StoreError::StorageFailure(format!("store task failed: {err}")))?
}
