//! Byte-budgeted payload cache.
//!
//! Holds recently read payloads keyed by [`ObjectKey`], weighted by their
//! on-disk byte size and bounded by a configurable budget. Entries are shared
//! as `Arc`s so a payload fanned out to sibling stores is stored once.

use std::sync::Arc;

use parking_lot::RwLock;
use peersync_core::{JsonObject, ObjectKey};
use quick_cache::{sync::Cache, Weighter};

/// A cached payload together with its storage cost.
#[derive(Debug)]
pub struct CachedPayload {
    /// The decoded JSON object.
    pub object: JsonObject,
    /// Byte size of the payload as written to disk.
    pub cost: u64,
}

/// Weights cache entries by their on-disk byte size.
#[derive(Debug, Clone)]
struct PayloadWeighter;

impl Weighter<ObjectKey, Arc<CachedPayload>> for PayloadWeighter {
    fn weight(&self, _key: &ObjectKey, value: &Arc<CachedPayload>) -> u64 {
        // Zero-weight entries would never count against the budget.
        value.cost.max(1)
    }
}

type Inner = Cache<ObjectKey, Arc<CachedPayload>, PayloadWeighter>;

/// Thread-safe payload cache with a runtime-adjustable byte budget.
///
/// Changing the budget rebuilds the cache (dropping all entries), mirroring
/// a full eviction; the underlying store remains authoritative.
pub struct PayloadCache {
    default_budget: u64,
    inner: RwLock<BudgetedInner>,
}

struct BudgetedInner {
    budget: u64,
    cache: Inner,
}

impl PayloadCache {
    /// Creates a cache with the given byte budget.
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            default_budget: budget,
            inner: RwLock::new(BudgetedInner {
                budget,
                cache: Self::build(budget),
            }),
        }
    }

    fn build(budget: u64) -> Inner {
        // Assume payloads around 4 KiB when sizing the item capacity hint.
        let estimated_items = usize::try_from(budget / 4096).unwrap_or(usize::MAX).max(16);
        Cache::with_weighter(estimated_items, budget.max(1), PayloadWeighter)
    }

    /// Looks up a payload, refreshing its recency.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<CachedPayload>> {
        self.inner.read().cache.get(key)
    }

    /// Returns whether the key is currently cached.
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces a payload.
    pub fn insert(&self, key: ObjectKey, payload: Arc<CachedPayload>) {
        self.inner.read().cache.insert(key, payload);
    }

    /// Removes a single payload.
    pub fn remove(&self, key: &ObjectKey) {
        self.inner.read().cache.remove(key);
    }

    /// Drops every cached payload.
    pub fn clear(&self) {
        self.inner.read().cache.clear();
    }

    /// Current byte budget.
    pub fn capacity(&self) -> u64 {
        self.inner.read().budget
    }

    /// Replaces the byte budget, dropping all entries.
    pub fn set_capacity(&self, budget: u64) {
        let mut inner = self.inner.write();
        inner.budget = budget;
        inner.cache = Self::build(budget);
    }

    /// Restores the configured default budget, dropping all entries.
    pub fn reset_capacity(&self) {
        self.set_capacity(self.default_budget);
    }
}
