//! TTL caches used on the request path
//!
//! Entries expire lazily: an expired entry is reported as absent on read and
//! only physically removed when the cache is full and room is needed.

pub mod block_status;
pub mod geo;

pub use block_status::BlockStatusCache;
pub use geo::GeoLookupCache;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: i64,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    fn order_key(&self) -> (i64, u64) {
        (self.expires_at, self.seq)
    }
}

/// Entries plus an index ordered by expiry
///
/// With a fixed TTL the earliest-expiring entry is also the oldest, so the
/// front of `order` serves both expiry purging and capacity eviction.
struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: BTreeMap<(i64, u64), K>,
    next_seq: u64,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.order_key());
                true
            }
            None => false,
        }
    }

    /// Drop expired entries from the front of the index
    fn purge_expired(&mut self, now: i64) {
        while let Some(entry) = self.order.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.entries.remove(&key);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
        }
    }
}

/// Thread-safe key/value cache with a fixed TTL and a size bound
pub struct TtlCache<K, V> {
    state: RwLock<CacheState<K, V>>,
    ttl_seconds: i64,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl_seconds: u64, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        TtlCache {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            ttl_seconds: i64::try_from(ttl_seconds).unwrap_or(i64::MAX),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    /// Get a value if present and not expired
    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.state.read().ok()?;
        let entry = state.entries.get(key)?;

        if entry.is_expired(self.clock.now()) {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    /// Store a value, replacing any previous entry for the key
    ///
    /// At capacity, expired entries are purged first and then the oldest
    /// entry is evicted. Both walk the expiry index from the front.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();

        if let Ok(mut state) = self.state.write() {
            state.remove(&key);

            if state.entries.len() >= self.max_entries {
                state.purge_expired(now);
                if state.entries.len() >= self.max_entries {
                    state.evict_oldest();
                }
            }

            let entry = CacheEntry {
                value,
                expires_at: now.saturating_add(self.ttl_seconds),
                seq: state.next_seq,
            };
            state.next_seq = state.next_seq.wrapping_add(1);
            state.order.insert(entry.order_key(), key.clone());
            state.entries.insert(key, entry);
        }
    }

    /// Drop the entry for a key. Returns true if one was present.
    pub fn remove(&self, key: &K) -> bool {
        self.state
            .write()
            .map(|mut state| state.remove(key))
            .unwrap_or(false)
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
