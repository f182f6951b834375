//! Core data types shared by the engine and the wire schemas.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A JSON object payload as held by the store and carried over the wire.
///
/// Payloads are always objects; scalar or array roots are rejected at the
/// codec boundary.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Uniquely identifies a stored record: a user type name plus a record id.
///
/// Equality and hashing are structural over both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    /// Stable identifier of the user type, e.g. `"Note"`.
    pub type_name: String,
    /// Record id within the type, UTF-8.
    pub id: String,
}

impl ObjectKey {
    /// Creates a key from a type name and an id.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Returns the database table name for this key's type.
    ///
    /// See [`table_name_for_type`].
    #[must_use]
    pub fn table_name(&self) -> String {
        table_name_for_type(&self.type_name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.id)
    }
}

/// Derives the per-type table name used by the store's relational index.
///
/// Every non-alphanumeric byte of the UTF-8 type name is percent-encoded as
/// `_XX` (uppercase hex), and the result is prefixed with `data_`. The
/// encoding is injective, so distinct type names never collide on a table.
#[must_use]
pub fn table_name_for_type(type_name: &str) -> String {
    let mut encoded = String::with_capacity(type_name.len() + 5);
    encoded.push_str("data_");
    for byte in type_name.bytes() {
        if byte.is_ascii_alphanumeric() {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{byte:02X}"));
        }
    }
    encoded
}

/// Inverse of [`table_name_for_type`]: recovers a type name from its table.
///
/// Returns `None` for tables outside the `data_` namespace or with malformed
/// escapes.
#[must_use]
pub fn type_name_for_table(table: &str) -> Option<String> {
    let encoded = table.strip_prefix("data_")?.as_bytes();
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        if encoded[i] == b'_' {
            let hex = encoded.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(encoded[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}

/// Per-record upload status tracked by the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeState {
    /// The relay has the current version of this record.
    Unchanged,
    /// The record has a local modification pending upload.
    Changed,
    /// The record was deleted locally; the deletion is pending upload.
    Deleted,
}

impl ChangeState {
    /// Stable numeric encoding used by persistent storage.
    #[must_use]
    pub fn as_raw(self) -> u8 {
        match self {
            ChangeState::Unchanged => 0,
            ChangeState::Changed => 1,
            ChangeState::Deleted => 2,
        }
    }

    /// Inverse of [`ChangeState::as_raw`]. Returns `None` for unknown values.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ChangeState::Unchanged),
            1 => Some(ChangeState::Changed),
            2 => Some(ChangeState::Deleted),
            _ => None,
        }
    }
}

/// One pending entry of the change log, as enumerated at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedInfo {
    /// The record the entry refers to.
    pub key: ObjectKey,
    /// Pending state; never [`ChangeState::Unchanged`] (those rows are removed).
    pub state: ChangeState,
    /// Record version at enrollment time. For deletions this is the version
    /// the tombstone carries, since the data row itself is already gone.
    pub version: u64,
}
