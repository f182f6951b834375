//! Steady-state exchange messages: record transfer, acknowledgement, resync.
//!
//! These frames flow in both directions once a connection is idle. A `Data`
//! or `Delete` frame is acknowledged by the receiving side with
//! `MarkUnchanged` after the change is durably applied; versions implement
//! last-writer-wins, so a receiver silently drops frames that are not
//! strictly newer than its local copy.

use serde::{Deserialize, Serialize};

use crate::types::ObjectKey;

/// Full record transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    /// The record being transferred.
    pub key: ObjectKey,
    /// Version of the carried payload.
    pub version: u64,
    /// Opaque payload bytes (binary-encoded JSON object, possibly wrapped by
    /// the sender's crypto layer).
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Record deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    /// The record being deleted.
    pub key: ObjectKey,
    /// Version of the deletion (one past the last stored version).
    pub version: u64,
}

/// Durable-application acknowledgement for a `Data` or `Delete` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkUnchangedMessage {
    /// The acknowledged record.
    pub key: ObjectKey,
    /// The version that was applied.
    pub version: u64,
}

/// Client-initiated full refresh request.
///
/// The relay answers with a fresh `Welcome` listing its complete state for
/// the requested types (all types when `types` is `None`), followed by the
/// corresponding `Data` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncMessage {
    /// Restrict the refresh to these type names; `None` means everything.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub types: Option<Vec<String>>,
}
