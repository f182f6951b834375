//! The relay protocol state machine over a single websocket.
//!
//! One task owns the socket exclusively. It drives the handshake
//! (identify, then account or login against the relay's challenge, then
//! welcome), keeps the connection alive with protocol-level pings, and maps
//! between wire frames and [`ConnectorEvent`]s. Everything stateful about
//! what to upload lives in the change controller; the connector only tracks
//! which acknowledgements are still expected so a superseded upload's ack can
//! be dropped.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peersync_core::messages::{
    capabilities, codec, AccountMessage, DataMessage, DeleteMessage, ErrorCode, IdentifyMessage,
    LoginMessage, MarkUnchangedMessage, Message, RemoteChange, ResyncMessage, PROTOCOL_VERSION,
};
use peersync_core::ObjectKey;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::auth::KeyStore;
use crate::config::RemoteConfig;
use crate::sync::backoff::ReconnectBackoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-level state of the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// No connection and no attempt scheduled.
    Disconnected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// Socket established, identify sent.
    Connected,
    /// First-contact registration in flight.
    Registering,
    /// Challenge login in flight.
    LoggingIn,
    /// Handshake complete; frames flow freely.
    Idle,
    /// A fatal relay error ended the session permanently.
    Fatal,
}

/// Requests accepted by the connector task.
#[derive(Debug)]
pub enum ConnectorCommand {
    /// Send a record to the relay and expect an acknowledgement.
    Upload {
        /// Record to upload.
        key: ObjectKey,
        /// Version of the carried payload.
        version: u64,
        /// Binary payload bytes.
        payload: Vec<u8>,
    },
    /// Send a deletion to the relay and expect an acknowledgement.
    Remove {
        /// Record to delete.
        key: ObjectKey,
        /// Tombstone version.
        version: u64,
    },
    /// Acknowledge a relay-delivered change as durably applied.
    MarkUnchanged {
        /// Acknowledged record.
        key: ObjectKey,
        /// Applied version.
        version: u64,
    },
    /// Request a full-state refresh for the given types (all when `None`).
    Resync {
        /// Type names to refresh.
        types: Option<Vec<String>>,
    },
    /// Drop the current connection (if any) and reconnect immediately.
    Reconnect,
    /// Close gracefully and end the task.
    Finalize,
}

/// Notifications emitted by the connector task.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// The connection state changed.
    StateChanged(RemoteState),
    /// A welcome arrived: the relay's pending-change listing.
    RemoteStateLoaded {
        /// Records the relay will stream next.
        remote_changes: Vec<RemoteChange>,
        /// Whether uploads are accepted.
        can_update: bool,
    },
    /// The relay acknowledged an upload or removal at this version.
    UploadAcked {
        /// Acknowledged record.
        key: ObjectKey,
        /// Acknowledged version.
        version: u64,
    },
    /// The relay delivered a record.
    RemoteData {
        /// Delivered record.
        key: ObjectKey,
        /// Delivered version.
        version: u64,
        /// Binary payload bytes.
        payload: Vec<u8>,
    },
    /// The relay delivered a deletion.
    RemoteDelete {
        /// Deleted record.
        key: ObjectKey,
        /// Tombstone version.
        version: u64,
    },
    /// The relay requested a device-side wipe and refresh.
    ResetRequested,
    /// The device was freshly registered; the relay holds nothing from it,
    /// so every local record must be marked for upload.
    RequestLocalResync,
    /// Identify, login, or registration was rejected; no automatic retry.
    AuthenticationFailed {
        /// Relay-provided reason.
        reason: String,
    },
    /// A fatal relay error; the engine must stop exchanging.
    FatalError {
        /// Description of the error.
        message: String,
    },
}

/// Acknowledgements still expected from the relay, one slot per key.
///
/// A newer upload for the same key overwrites the slot, so the older
/// upload's ack no longer matches and is ignored.
#[derive(Debug, Default)]
struct PendingAcks {
    slots: HashMap<ObjectKey, u64>,
}

impl PendingAcks {
    fn insert(&mut self, key: ObjectKey, version: u64) {
        self.slots.insert(key, version);
    }

    /// True when the ack matches the currently expected version.
    fn acknowledge(&mut self, key: &ObjectKey, version: u64) -> bool {
        if self.slots.get(key) == Some(&version) {
            self.slots.remove(key);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Why a connection session ended.
enum SessionEnd {
    /// Transient failure; retry after backoff.
    Reconnect,
    /// Explicit reconnect request; retry immediately with a fresh backoff.
    ReconnectNow,
    /// Unrecoverable without user intervention; wait for a command.
    AwaitCommand,
    /// Graceful shutdown.
    Finalize,
    /// Fatal relay error.
    Fatal(String),
}

/// Outcome of handling one inbound frame.
enum FrameOutcome {
    Continue,
    End(SessionEnd),
}

/// The connector task. Constructed by the engine and consumed by
/// [`RemoteConnector::run`] on the engine's runtime.
pub struct RemoteConnector {
    config: RemoteConfig,
    keystore: KeyStore,
    commands: mpsc::UnboundedReceiver<ConnectorCommand>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    state: RemoteState,
    backoff: ReconnectBackoff,
    pending: PendingAcks,
}

impl RemoteConnector {
    /// Creates a connector bound to its command and event channels.
    pub fn new(
        config: RemoteConfig,
        keystore: KeyStore,
        commands: mpsc::UnboundedReceiver<ConnectorCommand>,
        events: mpsc::UnboundedSender<ConnectorEvent>,
    ) -> Self {
        Self {
            config,
            keystore,
            commands,
            events,
            state: RemoteState::Disconnected,
            backoff: ReconnectBackoff::new(),
            pending: PendingAcks::default(),
        }
    }

    /// Runs the connection loop until finalized or fatally failed.
    pub async fn run(mut self) {
        let mut delay = Duration::ZERO;
        loop {
            if !self.wait_before_connect(delay).await {
                self.set_state(RemoteState::Disconnected);
                return;
            }

            let end = self.session().await;
            self.pending.clear();
            match end {
                SessionEnd::Reconnect => {
                    self.set_state(RemoteState::Reconnecting);
                    delay = self.backoff.next_delay();
                }
                SessionEnd::ReconnectNow => {
                    self.set_state(RemoteState::Reconnecting);
                    self.backoff.reset();
                    delay = Duration::ZERO;
                }
                SessionEnd::AwaitCommand => {
                    self.set_state(RemoteState::Disconnected);
                    if !self.wait_for_reconnect().await {
                        return;
                    }
                    delay = Duration::ZERO;
                }
                SessionEnd::Finalize => {
                    self.set_state(RemoteState::Disconnected);
                    return;
                }
                SessionEnd::Fatal(message) => {
                    self.set_state(RemoteState::Fatal);
                    let _ = self.events.send(ConnectorEvent::FatalError { message });
                    return;
                }
            }
        }
    }

    /// Waits out the backoff delay. Returns false when finalized.
    async fn wait_before_connect(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        debug!(?delay, "waiting before reconnect");
        let sleeper = sleep(delay);
        tokio::pin!(sleeper);
        loop {
            tokio::select! {
                () = &mut sleeper => return true,
                command = self.commands.recv() => match command {
                    Some(ConnectorCommand::Reconnect) => return true,
                    Some(ConnectorCommand::Finalize) | None => return false,
                    // Upload traffic is re-driven by the controller once the
                    // connection is back; nothing to do with it here.
                    Some(_) => {}
                },
            }
        }
    }

    /// Blocks until an explicit reconnect. Returns false when finalized.
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ConnectorCommand::Reconnect) => return true,
                Some(ConnectorCommand::Finalize) | None => return false,
                Some(_) => {}
            }
        }
    }

    /// One connection attempt: handshake plus steady-state exchange.
    async fn session(&mut self) -> SessionEnd {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(message) => {
                warn!("{message}");
                return SessionEnd::AwaitCommand;
            }
        };

        let (mut ws, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(url = %self.config.url, error = %err, "relay connection failed");
                return SessionEnd::Reconnect;
            }
        };
        self.set_state(RemoteState::Connected);

        let identify = Message::Identify(IdentifyMessage {
            protocol_version: PROTOCOL_VERSION,
            device_id: self.keystore.device_id(),
            capabilities: capabilities::RESYNC | capabilities::RESET,
            challenge: None,
        });
        if send_frame(&mut ws, &identify).await.is_err() {
            return SessionEnd::Reconnect;
        }

        let keepalive = self.config.keepalive_timeout;
        let mut ping = interval_at(Instant::now() + keepalive, keepalive);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                frame = ws.next() => {
                    let Some(frame) = frame else {
                        warn!("relay closed the connection");
                        return SessionEnd::Reconnect;
                    };
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "websocket receive failed");
                            return SessionEnd::Reconnect;
                        }
                    };
                    match frame {
                        WsMessage::Binary(bytes) => {
                            let message = match codec::decode_message(&bytes) {
                                Ok(message) => message,
                                Err(err) => {
                                    warn!(error = %err, "undecodable relay frame");
                                    return SessionEnd::Reconnect;
                                }
                            };
                            match self.handle_frame(&mut ws, message, &mut awaiting_pong).await {
                                FrameOutcome::Continue => {}
                                FrameOutcome::End(end) => return end,
                            }
                        }
                        WsMessage::Close(_) => return SessionEnd::Reconnect,
                        // Transport-level control frames are handled by the
                        // websocket library.
                        _ => {}
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = ws.close(None).await;
                        return SessionEnd::Finalize;
                    };
                    match command {
                        ConnectorCommand::Upload { key, version, payload } => {
                            self.pending.insert(key.clone(), version);
                            let frame = Message::Data(DataMessage { key, version, payload });
                            if send_frame(&mut ws, &frame).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        ConnectorCommand::Remove { key, version } => {
                            self.pending.insert(key.clone(), version);
                            let frame = Message::Delete(DeleteMessage { key, version });
                            if send_frame(&mut ws, &frame).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        ConnectorCommand::MarkUnchanged { key, version } => {
                            let frame = Message::MarkUnchanged(MarkUnchangedMessage { key, version });
                            if send_frame(&mut ws, &frame).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        ConnectorCommand::Resync { types } => {
                            let frame = Message::Resync(ResyncMessage { types });
                            if send_frame(&mut ws, &frame).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        ConnectorCommand::Reconnect => {
                            let _ = ws.close(None).await;
                            return SessionEnd::ReconnectNow;
                        }
                        ConnectorCommand::Finalize => {
                            let _ = ws.close(None).await;
                            return SessionEnd::Finalize;
                        }
                    }
                }
                _ = ping.tick() => {
                    if awaiting_pong {
                        warn!("keepalive timed out, dropping connection");
                        return SessionEnd::Reconnect;
                    }
                    awaiting_pong = true;
                    if send_frame(&mut ws, &Message::Ping).await.is_err() {
                        return SessionEnd::Reconnect;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        ws: &mut WsStream,
        message: Message,
        awaiting_pong: &mut bool,
    ) -> FrameOutcome {
        match message {
            Message::Identify(identify) => {
                let Some(challenge) = identify.challenge else {
                    warn!("identify reply carried no challenge");
                    return FrameOutcome::End(SessionEnd::Reconnect);
                };
                let reply = match self.keystore.device_id() {
                    Some(device_id) => {
                        self.set_state(RemoteState::LoggingIn);
                        Message::Login(LoginMessage {
                            device_id,
                            signature: self.keystore.sign(&challenge),
                        })
                    }
                    None => {
                        self.set_state(RemoteState::Registering);
                        Message::Account(AccountMessage {
                            server_secret: self.config.server_secret.clone(),
                            user_identity: self.config.user_identity.clone(),
                            device_name: self.config.device_name.clone(),
                        })
                    }
                };
                if send_frame(ws, &reply).await.is_err() {
                    return FrameOutcome::End(SessionEnd::Reconnect);
                }
                FrameOutcome::Continue
            }
            Message::Welcome(welcome) => {
                if let Some(device_id) = welcome.device_id {
                    if let Err(err) = self.keystore.set_device_id(device_id) {
                        warn!(error = %err, "failed to persist assigned device id");
                    }
                    // Sent ahead of the welcome event so the change-log scan
                    // sees the re-marked records.
                    let _ = self.events.send(ConnectorEvent::RequestLocalResync);
                }
                self.backoff.reset();
                self.set_state(RemoteState::Idle);
                let _ = self.events.send(ConnectorEvent::RemoteStateLoaded {
                    remote_changes: welcome.remote_changes,
                    can_update: welcome.can_update,
                });
                FrameOutcome::Continue
            }
            Message::Data(data) => {
                let _ = self.events.send(ConnectorEvent::RemoteData {
                    key: data.key,
                    version: data.version,
                    payload: data.payload,
                });
                FrameOutcome::Continue
            }
            Message::Delete(delete) => {
                let _ = self.events.send(ConnectorEvent::RemoteDelete {
                    key: delete.key,
                    version: delete.version,
                });
                FrameOutcome::Continue
            }
            Message::MarkUnchanged(ack) => {
                if self.pending.acknowledge(&ack.key, ack.version) {
                    let _ = self.events.send(ConnectorEvent::UploadAcked {
                        key: ack.key,
                        version: ack.version,
                    });
                } else {
                    debug!(key = %ack.key, version = ack.version, "superseded acknowledgement dropped");
                }
                FrameOutcome::Continue
            }
            Message::Reset => {
                let _ = self.events.send(ConnectorEvent::ResetRequested);
                FrameOutcome::Continue
            }
            Message::Ping => {
                if send_frame(ws, &Message::Pong).await.is_err() {
                    return FrameOutcome::End(SessionEnd::Reconnect);
                }
                FrameOutcome::Continue
            }
            Message::Pong => {
                *awaiting_pong = false;
                FrameOutcome::Continue
            }
            Message::Error(error) => {
                if error.fatal {
                    return FrameOutcome::End(SessionEnd::Fatal(format!(
                        "relay error: {}",
                        error.message
                    )));
                }
                if error.code == ErrorCode::Authentication {
                    let _ = self.events.send(ConnectorEvent::AuthenticationFailed {
                        reason: error.message,
                    });
                    return FrameOutcome::End(SessionEnd::AwaitCommand);
                }
                warn!(code = ?error.code, message = %error.message, "relay reported an error");
                FrameOutcome::End(SessionEnd::Reconnect)
            }
            Message::Account(_) | Message::Login(_) | Message::Resync(_) => {
                warn!("relay sent a client-only frame");
                FrameOutcome::End(SessionEnd::Reconnect)
            }
        }
    }

    fn build_request(&self) -> Result<Request, String> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| format!("invalid relay url {:?}: {err}", self.config.url))?;
        let headers = request.headers_mut();
        if let Some(access_key) = &self.config.access_key {
            let value = HeaderValue::from_str(&format!("Bearer {access_key}"))
                .map_err(|err| format!("invalid access key: {err}"))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| format!("invalid header name {name:?}: {err}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| format!("invalid header value for {name:?}: {err}"))?;
            headers.insert(name, value);
        }
        Ok(request)
    }

    fn set_state(&mut self, state: RemoteState) {
        if self.state != state {
            debug!(?state, "connector state changed");
            self.state = state;
            let _ = self.events.send(ConnectorEvent::StateChanged(state));
        }
    }
}

async fn send_frame(ws: &mut WsStream, message: &Message) -> Result<(), ()> {
    let bytes = match codec::encode_message(message) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "frame encode failed");
            return Err(());
        }
    };
    ws.send(WsMessage::Binary(bytes.into())).await.map_err(|err| {
        warn!(error = %err, "websocket send failed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_ack_matches_current_version_only() {
        let mut pending = PendingAcks::default();
        let key = ObjectKey::new("Note", "a");

        pending.insert(key.clone(), 1);
        assert!(!pending.acknowledge(&key, 2));
        assert!(pending.acknowledge(&key, 1));
        // Slot is consumed.
        assert!(!pending.acknowledge(&key, 1));
    }

    #[test]
    fn newer_upload_preempts_pending_slot() {
        let mut pending = PendingAcks::default();
        let key = ObjectKey::new("Note", "a");

        pending.insert(key.clone(), 1);
        pending.insert(key.clone(), 2);

        // The ack for the superseded upload no longer matches.
        assert!(!pending.acknowledge(&key, 1));
        assert!(pending.acknowledge(&key, 2));
    }

    #[test]
    fn clear_cancels_all_slots() {
        let mut pending = PendingAcks::default();
        pending.insert(ObjectKey::new("Note", "a"), 1);
        pending.insert(ObjectKey::new("Note", "b"), 2);
        pending.clear();
        assert!(!pending.acknowledge(&ObjectKey::new("Note", "a"), 1));
        assert!(!pending.acknowledge(&ObjectKey::new("Note", "b"), 2));
    }

    #[test]
    fn request_builder_sets_credential_headers() {
        let connector_config = RemoteConfig {
            enabled: true,
            url: "ws://127.0.0.1:4242/exchange".to_string(),
            access_key: Some("secret-key".to_string()),
            headers: vec![("X-Device-Group".to_string(), "test".to_string())],
            ..RemoteConfig::default()
        };
        let dir = tempfile::TempDir::new().unwrap();
        let connector = RemoteConnector::new(
            connector_config,
            KeyStore::load_or_create(dir.path()).unwrap(),
            mpsc::unbounded_channel().1,
            mpsc::unbounded_channel().0,
        );

        let request = connector.build_request().unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer secret-key"
        );
        assert_eq!(request.headers().get("X-Device-Group").unwrap(), "test");
    }

    #[test]
    fn request_builder_rejects_bad_urls() {
        let connector = RemoteConnector::new(
            RemoteConfig {
                url: "not a url".to_string(),
                ..RemoteConfig::default()
            },
            KeyStore::load_or_create(tempfile::TempDir::new().unwrap().path()).unwrap(),
            mpsc::unbounded_channel().1,
            mpsc::unbounded_channel().0,
        );
        assert!(connector.build_request().is_err());
    }
}
