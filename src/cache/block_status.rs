//! Block-status cache in front of the block store

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::TtlCache;
use crate::clock::Clock;
use crate::persistence::BlockStore;

/// Pause between block store read attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Caches `address -> blocked` with a short TTL
///
/// A newly blocked address becomes visible within one TTL, or immediately
/// once [`BlockStatusCache::invalidate`] is called for it.
pub struct BlockStatusCache {
    cache: TtlCache<IpAddr, bool>,
    store: Arc<dyn BlockStore>,
    attempts: u32,
    store_failures: AtomicU64,
}

impl BlockStatusCache {
    pub fn new(
        store: Arc<dyn BlockStore>,
        ttl_seconds: u64,
        max_entries: usize,
        attempts: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        BlockStatusCache {
            cache: TtlCache::new(ttl_seconds, max_entries, clock),
            store,
            attempts: attempts.max(1),
            store_failures: AtomicU64::new(0),
        }
    }

    /// Whether an address is blocked
    ///
    /// If the block store stays unreachable after all attempts the address is
    /// treated as not blocked and nothing is cached. The pause between
    /// attempts yields to the runtime instead of blocking the worker.
    pub async fn is_blocked(&self, ip: &IpAddr) -> bool {
        if let Some(blocked) = self.cache.get(ip) {
            return blocked;
        }

        for attempt in 1..=self.attempts {
            match self.store.is_blocked(ip) {
                Ok(blocked) => {
                    self.cache.insert(*ip, blocked);
                    return blocked;
                }
                Err(e) => {
                    log::warn!(
                        "Block store lookup for {} failed (attempt {}/{}): {}",
                        ip,
                        attempt,
                        self.attempts,
                        e
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        self.store_failures.fetch_add(1, Ordering::Relaxed);
        log::error!("Block store unavailable, allowing {} unchecked", ip);
        false
    }

    /// Drop any cached status for an address
    pub fn invalidate(&self, ip: &IpAddr) {
        if self.cache.remove(ip) {
            log::debug!("Invalidated cached block status for {}", ip);
        }
    }

    /// Number of lookups that failed open because the store was unavailable
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::BlockedEntry;
    use crate::persistence::{PersistenceError, SqliteStore};
    use std::sync::atomic::AtomicUsize;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup() -> (BlockStatusCache, Arc<SqliteStore>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let cache = BlockStatusCache::new(store.clone(), 300, 1000, 3, clock.clone());
        (cache, store, clock)
    }

    /// Block store that fails a fixed number of reads before answering
    struct FlakyBlockStore {
        failures_left: AtomicUsize,
        reads: AtomicUsize,
        blocked: bool,
    }

    impl FlakyBlockStore {
        fn new(failures: usize, blocked: bool) -> Self {
            FlakyBlockStore {
                failures_left: AtomicUsize::new(failures),
                reads: AtomicUsize::new(0),
                blocked,
            }
        }
    }

    impl BlockStore for FlakyBlockStore {
        fn is_blocked(&self, _address: &IpAddr) -> Result<bool, PersistenceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PersistenceError::LockPoisoned);
            }
            Ok(self.blocked)
        }

        fn add_block(&self, _: &IpAddr, _: Option<&str>, _: i64) -> Result<bool, PersistenceError> {
            Ok(true)
        }

        fn get_block(&self, _: &IpAddr) -> Result<Option<BlockedEntry>, PersistenceError> {
            Ok(None)
        }

        fn list_blocks(&self) -> Result<Vec<BlockedEntry>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_unblocked_address() {
        let (cache, _, _) = setup();
        assert!(!cache.is_blocked(&ip("8.8.8.8")).await);
    }

    #[tokio::test]
    async fn test_never_creates_block_entries() {
        let (cache, store, _) = setup();
        cache.is_blocked(&ip("8.8.8.8")).await;
        assert!(store.list_blocks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_negative_until_ttl_expires() {
        let (cache, store, clock) = setup();
        let addr = ip("203.0.113.9");

        assert!(!cache.is_blocked(&addr).await);
        store.add_block(&addr, Some("manual block"), clock.now()).unwrap();

        // Cached "not blocked" is still served inside the TTL
        clock.advance(299);
        assert!(!cache.is_blocked(&addr).await);

        clock.advance(1);
        assert!(cache.is_blocked(&addr).await);
    }

    #[tokio::test]
    async fn test_invalidate_takes_effect_immediately() {
        let (cache, store, clock) = setup();
        let addr = ip("203.0.113.9");

        assert!(!cache.is_blocked(&addr).await);
        store.add_block(&addr, None, clock.now()).unwrap();
        cache.invalidate(&addr);

        assert!(cache.is_blocked(&addr).await);
    }

    #[tokio::test]
    async fn test_result_is_cached() {
        let store = Arc::new(FlakyBlockStore::new(0, true));
        let clock = Arc::new(ManualClock::new(0));
        let cache = BlockStatusCache::new(store.clone(), 300, 100, 3, clock);

        assert!(cache.is_blocked(&ip("1.1.1.1")).await);
        assert!(cache.is_blocked(&ip("1.1.1.1")).await);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let store = Arc::new(FlakyBlockStore::new(2, true));
        let clock = Arc::new(ManualClock::new(0));
        let cache = BlockStatusCache::new(store.clone(), 300, 100, 3, clock);

        assert!(cache.is_blocked(&ip("1.1.1.1")).await);
        assert_eq!(store.reads.load(Ordering::SeqCst), 3);
        assert_eq!(cache.store_failures(), 0);
    }

    #[tokio::test]
    async fn test_fails_open_after_retries_without_caching() {
        let store = Arc::new(FlakyBlockStore::new(3, true));
        let clock = Arc::new(ManualClock::new(0));
        let cache = BlockStatusCache::new(store.clone(), 300, 100, 3, clock);

        assert!(!cache.is_blocked(&ip("1.1.1.1")).await);
        assert_eq!(cache.store_failures(), 1);

        // Store has recovered; the failure was not cached
        assert!(cache.is_blocked(&ip("1.1.1.1")).await);
        assert_eq!(store.reads.load(Ordering::SeqCst), 4);
    }
}
