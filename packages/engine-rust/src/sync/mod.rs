//! Relay exchange: backoff schedule, connector state machine, and the
//! change controller that orders uploads and downloads.

pub mod backoff;
pub(crate) mod change_controller;
pub mod connector;

pub use backoff::ReconnectBackoff;
pub use connector::{ConnectorCommand, ConnectorEvent, RemoteState};
