//! Process-wide change fan-out between store instances.
//!
//! Two engines opened on the same storage root share one database, so a write
//! through one must invalidate the other's cache and surface on its listener
//! stream. The emitter is a lazily-initialized global broadcast channel;
//! every store registers an origin id and ignores its own events when they
//! come back around.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use peersync_core::ObjectKey;
use tokio::sync::broadcast;

use super::cache::CachedPayload;

/// Capacity of the global broadcast ring. A lagging listener only loses
/// cache-invalidation hints, never durable data.
const BROADCAST_CAPACITY: usize = 256;

/// A change published to every store instance in the process.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Origin id of the store that performed the write.
    pub origin: u64,
    /// Storage root of the writing store; instances on other roots hold
    /// unrelated data and must not act on the event.
    pub root: PathBuf,
    /// What changed.
    pub change: StoreChange,
}

/// The change carried by a [`BroadcastEvent`].
#[derive(Debug, Clone)]
pub enum StoreChange {
    /// A record was saved (`payload` present) or removed (`payload` absent).
    Changed {
        /// The affected record.
        key: ObjectKey,
        /// New payload, shared so sibling caches can adopt it without a read.
        payload: Option<Arc<CachedPayload>>,
    },
    /// A type was cleared (`Some`) or the whole store was reset (`None`).
    Resetted {
        /// The cleared type, if any.
        type_name: Option<String>,
    },
}

/// Change notification delivered to facade listeners of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    /// A record was saved or removed.
    Changed {
        /// Type name of the record.
        type_name: String,
        /// Record id.
        key: String,
        /// True when the change was a removal.
        was_deleted: bool,
    },
    /// A type was cleared (`Some`) or the whole store was reset (`None`).
    Resetted {
        /// The cleared type, if any.
        type_name: Option<String>,
    },
}

struct StoreEmitter {
    tx: broadcast::Sender<BroadcastEvent>,
    next_origin: AtomicU64,
}

fn emitter() -> &'static StoreEmitter {
    static EMITTER: OnceLock<StoreEmitter> = OnceLock::new();
    EMITTER.get_or_init(|| StoreEmitter {
        tx: broadcast::channel(BROADCAST_CAPACITY).0,
        next_origin: AtomicU64::new(1),
    })
}

/// Allocates a process-unique origin id for a new store instance.
pub fn next_origin() -> u64 {
    emitter().next_origin.fetch_add(1, Ordering::Relaxed)
}

/// Subscribes to the process-wide change stream.
pub fn subscribe() -> broadcast::Receiver<BroadcastEvent> {
    emitter().tx.subscribe()
}

/// Publishes a change to every registered store instance.
pub fn publish(event: BroadcastEvent) {
    // No subscribers is fine; single-instance processes never listen.
    let _ = emitter().tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_unique() {
        let a = next_origin();
        let b = next_origin();
        assert_ne!(a, b);
    }

    #[test]
    fn published_events_reach_subscribers() {
        let marker = next_origin();
        let mut rx = subscribe();
        publish(BroadcastEvent {
            origin: marker,
            root: PathBuf::from("/tmp/emitter-test"),
            change: StoreChange::Resetted { type_name: None },
        });

        // The channel is process-global, so skip events from parallel tests.
        loop {
            let event = rx.try_recv().expect("marker event delivered");
            if event.origin == marker {
                assert!(matches!(
                    event.change,
                    StoreChange::Resetted { type_name: None }
                ));
                break;
            }
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        publish(BroadcastEvent {
            origin: 1,
            root: PathBuf::from("/tmp/emitter-test"),
            change: StoreChange::Changed {
                key: ObjectKey::new("Note", "a"),
                payload: None,
            },
        });
    }
}
