//! `PeerSync` Core -- object keys, change states, and relay wire messages.
//!
//! This crate is the foundation layer shared by the on-device engine and any
//! relay implementation:
//!
//! - **Types** ([`types`]): [`ObjectKey`], [`ChangeState`], [`ChangedInfo`],
//!   the [`JsonObject`] payload alias, and the per-type table-name encoding
//! - **Messages** ([`messages`]): the [`Message`](messages::Message) frame
//!   enum with its handshake and sync submodules, plus the MessagePack codec

pub mod messages;
pub mod types;

// Types
pub use types::{
    table_name_for_type, type_name_for_table, ChangeState, ChangedInfo, JsonObject, ObjectKey,
};

// Messages
pub use messages::{
    decode_message, decode_payload, encode_message, encode_payload, CodecError, Message,
    PROTOCOL_VERSION,
};
