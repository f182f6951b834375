//! Connection establishment messages: identify, registration, login, welcome.
//!
//! The handshake is a fixed four-step exchange. The client opens with
//! [`IdentifyMessage`]; the relay answers with the same tag carrying a
//! `challenge`; the client replies with [`AccountMessage`] (first contact) or
//! [`LoginMessage`] (known device); the relay closes the handshake with
//! [`WelcomeMessage`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChangeState, ObjectKey};

/// Protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability bits advertised in [`IdentifyMessage`].
pub mod capabilities {
    /// The device can service full-state resync requests.
    pub const RESYNC: u32 = 1 << 0;
    /// The device honors relay-initiated resets.
    pub const RESET: u32 = 1 << 1;
}

/// Opening frame of the handshake, sent by both sides.
///
/// The client's copy carries its device id (if registered) and capability
/// bits; the relay's reply echoes the protocol version and adds a `challenge`
/// that the client must sign in its [`LoginMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyMessage {
    /// Protocol revision of the sender.
    pub protocol_version: u32,
    /// Device id assigned at registration; `None` before first contact.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<Uuid>,
    /// Capability bitset, see [`capabilities`].
    pub capabilities: u32,
    /// Login challenge; present only in the relay's reply.
    #[serde(with = "serde_bytes", skip_serializing_if = "Option::is_none", default)]
    pub challenge: Option<Vec<u8>>,
}

/// First-contact registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMessage {
    /// Shared deployment secret proving the client may register.
    pub server_secret: String,
    /// Identity of the owning user account.
    pub user_identity: String,
    /// Human-readable label for the device.
    pub device_name: String,
}

/// Login request from an already-registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginMessage {
    /// Device id assigned at registration.
    pub device_id: Uuid,
    /// Opaque credential emitted by the device key store for the challenge.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// One entry of the relay's pending-change listing in [`WelcomeMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// The record the relay is about to stream (or has a tombstone for).
    pub key: ObjectKey,
    /// Whether the record changed or was deleted remotely.
    pub state: ChangeState,
}

/// Final handshake frame; the connection is idle once it arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMessage {
    /// Newly assigned device id; present only after a registration.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<Uuid>,
    /// Records the relay will stream as `Data`/`Delete` frames.
    pub remote_changes: Vec<RemoteChange>,
    /// Whether the relay accepts uploads from this device.
    pub can_update: bool,
}

/// Machine-readable classification of an [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// The peer sent a malformed or unexpected frame.
    Protocol,
    /// Identify, login, or registration was rejected.
    Authentication,
    /// The relay failed to persist or read data.
    Storage,
    /// The account exceeded a relay-side quota.
    Quota,
    /// Anything else.
    Unknown,
}

/// Error frame; `fatal` errors terminate the session permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// If true the client must not reconnect without user intervention.
    pub fatal: bool,
    /// Error classification.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    fn roundtrip(msg: &Message) -> Message {
        let bytes = rmp_serde::to_vec_named(msg).expect("serialize");
        rmp_serde::from_slice(&bytes).expect("deserialize")
    }

    #[test]
    fn identify_without_device_roundtrip() {
        let msg = Message::Identify(IdentifyMessage {
            protocol_version: PROTOCOL_VERSION,
            device_id: None,
            capabilities: capabilities::RESYNC | capabilities::RESET,
            challenge: None,
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn identify_challenge_reply_roundtrip() {
        let msg = Message::Identify(IdentifyMessage {
            protocol_version: PROTOCOL_VERSION,
            device_id: Some(Uuid::new_v4()),
            capabilities: 0,
            challenge: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn account_roundtrip() {
        let msg = Message::Account(AccountMessage {
            server_secret: "baum42".to_string(),
            user_identity: "user@example.org".to_string(),
            device_name: "laptop".to_string(),
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn login_roundtrip() {
        let msg = Message::Login(LoginMessage {
            device_id: Uuid::new_v4(),
            signature: vec![1, 2, 3, 4, 5],
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn welcome_roundtrip() {
        let msg = Message::Welcome(WelcomeMessage {
            device_id: Some(Uuid::new_v4()),
            remote_changes: vec![
                RemoteChange {
                    key: ObjectKey::new("Note", "a"),
                    state: ChangeState::Changed,
                },
                RemoteChange {
                    key: ObjectKey::new("Note", "b"),
                    state: ChangeState::Deleted,
                },
            ],
            can_update: true,
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn error_roundtrip() {
        let msg = Message::Error(ErrorMessage {
            fatal: true,
            code: ErrorCode::Authentication,
            message: "unknown device".to_string(),
        });
        assert_eq!(roundtrip(&msg), msg);
    }
}
