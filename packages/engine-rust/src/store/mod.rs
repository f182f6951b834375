//! Persistent record storage: the local store, its payload cache, the
//! change log, and the process-wide change emitter.

pub mod cache;
pub(crate) mod change_log;
pub mod emitter;
pub mod local_store;

pub use cache::{CachedPayload, PayloadCache};
pub use emitter::{BroadcastEvent, DataEvent, StoreChange};
pub use local_store::LocalStore;
