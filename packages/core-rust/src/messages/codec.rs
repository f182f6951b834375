//! Binary encoding of [`Message`] frames and record payloads.
//!
//! Frames are MessagePack maps with named fields; one encoded message travels
//! per websocket binary frame, the transport supplying the length-prefixed
//! byte framing. Record payloads use the same MessagePack encoding applied to
//! a bare JSON object; the relay never inspects payload bytes, so the on-disk
//! and on-wire payload representations are identical.

use thiserror::Error;

use crate::messages::Message;
use crate::types::JsonObject;

/// Errors produced while encoding or decoding frames and payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("payload root is not a JSON object")]
    PayloadNotAnObject,
}

/// Encodes a message into one wire frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes one wire frame into a message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on malformed or unknown frames.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encodes a record payload into its binary representation.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_payload(payload: &JsonObject) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(payload)?)
}

/// Decodes a binary record payload back into a JSON object.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on malformed bytes and
/// [`CodecError::PayloadNotAnObject`] when the root is not an object.
pub fn decode_payload(bytes: &[u8]) -> Result<JsonObject, CodecError> {
    let value: serde_json::Value = rmp_serde::from_slice(bytes)?;
    match value {
        serde_json::Value::Object(object) => Ok(object),
        _ => Err(CodecError::PayloadNotAnObject),
    }
}
