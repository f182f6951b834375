//! Wire message schemas for the relay protocol.
//!
//! Every frame on the wire is one [`Message`], MessagePack-encoded with named
//! fields (see [`codec`]). The enum tag doubles as the frame tag, so adding a
//! variant extends the protocol without touching the codec.

pub mod codec;
pub mod handshake;
pub mod sync;

use serde::{Deserialize, Serialize};

pub use codec::{decode_message, decode_payload, encode_message, encode_payload, CodecError};
pub use handshake::{
    capabilities, AccountMessage, ErrorCode, ErrorMessage, IdentifyMessage, LoginMessage,
    RemoteChange, WelcomeMessage, PROTOCOL_VERSION,
};
pub use sync::{DataMessage, DeleteMessage, MarkUnchangedMessage, ResyncMessage};

/// A single protocol frame.
///
/// Direction notes: `Identify` is exchanged both ways during the handshake;
/// `Account`/`Login`/`Resync` are client-to-relay; `Welcome`/`Reset` are
/// relay-to-client; everything else flows in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake opener (client) or challenge reply (relay).
    Identify(IdentifyMessage),
    /// First-contact device registration.
    Account(AccountMessage),
    /// Login of a registered device.
    Login(LoginMessage),
    /// Handshake completion with the relay's pending-change listing.
    Welcome(WelcomeMessage),
    /// Record upload/download.
    Data(DataMessage),
    /// Record deletion.
    Delete(DeleteMessage),
    /// Durable-application acknowledgement.
    MarkUnchanged(MarkUnchangedMessage),
    /// Full-state refresh request.
    Resync(ResyncMessage),
    /// Relay-initiated account reset: wipe local state and resync.
    Reset,
    /// Keepalive probe.
    Ping,
    /// Keepalive response.
    Pong,
    /// Error report; may be fatal.
    Error(ErrorMessage),
}
