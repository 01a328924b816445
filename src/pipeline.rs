//! Per-request decision pipeline
//!
//! resolve address -> check block status -> enrich and log (allowed only).
//! Only `Allow`/`Deny` is visible to the caller; every internal failure is
//! absorbed here and reported through logging and [`PipelineStats`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{BlockStatusCache, GeoLookupCache};
use crate::clock::Clock;
use crate::models::{Decision, RequestMeta, RequestRecord};
use crate::persistence::RequestLogStore;
use crate::resolver::AddressResolver;

/// Running counters of pipeline outcomes
#[derive(Debug, Default)]
pub struct PipelineStats {
    allowed: AtomicU64,
    denied: AtomicU64,
    untracked: AtomicU64,
    log_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    /// Allowed without tracking because no address could be resolved
    pub untracked: u64,
    pub log_failures: u64,
    /// Block checks that failed open because the block store was unavailable
    pub block_check_failures: u64,
}

/// Orchestrates the per-request checks
pub struct RequestPipeline {
    resolver: AddressResolver,
    block_cache: Arc<BlockStatusCache>,
    geo_cache: Arc<GeoLookupCache>,
    log_store: Arc<dyn RequestLogStore>,
    clock: Arc<dyn Clock>,
    stats: PipelineStats,
}

impl RequestPipeline {
    pub fn new(
        resolver: AddressResolver,
        block_cache: Arc<BlockStatusCache>,
        geo_cache: Arc<GeoLookupCache>,
        log_store: Arc<dyn RequestLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RequestPipeline {
            resolver,
            block_cache,
            geo_cache,
            log_store,
            clock,
            stats: PipelineStats::default(),
        }
    }

    /// Decide whether a request may proceed, logging it if allowed
    pub async fn handle(&self, request: &RequestMeta) -> Decision {
        let resolved = match self.resolver.resolve(request) {
            Some(resolved) => resolved,
            None => {
                log::debug!("No client address for request to {}, skipping tracking", request.path);
                self.stats.untracked.fetch_add(1, Ordering::Relaxed);
                self.stats.allowed.fetch_add(1, Ordering::Relaxed);
                return Decision::Allow;
            }
        };
        let address = resolved.address;

        if self.block_cache.is_blocked(&address).await {
            log::warn!("Blocked IP attempted access: {}", address);
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            return Decision::Deny;
        }

        let timestamp = self.clock.now();
        let location = self.geo_cache.lookup(&address).await;
        let record = RequestRecord::new(address, timestamp, &request.path, location);

        if let Err(e) = self.log_store.append_request(&record) {
            log::error!("Error logging request from {}: {}", address, e);
            self.stats.log_failures.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        Decision::Allow
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            untracked: self.stats.untracked.load(Ordering::Relaxed),
            log_failures: self.stats.log_failures.load(Ordering::Relaxed),
            block_check_failures: self.block_cache.store_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::BlockManager;
    use crate::clock::ManualClock;
    use crate::config::ResolverConfig;
    use crate::geolocation::{GeoError, GeoSource, Location};
    use crate::persistence::{AddressCount, BlockStore, PersistenceError, SqliteStore};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;

    struct Harness {
        pipeline: RequestPipeline,
        store: Arc<SqliteStore>,
        block_cache: Arc<BlockStatusCache>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        harness_with_log_store(store.clone(), store)
    }

    fn harness_with_log_store(
        store: Arc<SqliteStore>,
        log_store: Arc<dyn RequestLogStore>,
    ) -> Harness {
        build_harness(store, log_store, Vec::new(), ResolverConfig::default())
    }

    fn harness_with_sources(sources: Vec<Box<dyn GeoSource>>) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        build_harness(store.clone(), store, sources, ResolverConfig::default())
    }

    fn build_harness(
        store: Arc<SqliteStore>,
        log_store: Arc<dyn RequestLogStore>,
        sources: Vec<Box<dyn GeoSource>>,
        resolver_config: ResolverConfig,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let block_cache = Arc::new(BlockStatusCache::new(
            store.clone(),
            300,
            1000,
            3,
            clock.clone(),
        ));
        let geo_cache = Arc::new(GeoLookupCache::new(
            sources,
            86_400,
            1000,
            Duration::from_millis(50),
            clock.clone(),
        ));
        let pipeline = RequestPipeline::new(
            AddressResolver::new(&resolver_config),
            block_cache.clone(),
            geo_cache,
            log_store,
            clock.clone(),
        );

        Harness {
            pipeline,
            store,
            block_cache,
            clock,
        }
    }

    fn request_from(addr: &str, path: &str) -> RequestMeta {
        RequestMeta::new(path).with_remote_addr(addr)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    enum SourceBehaviour {
        Found,
        Fail,
        Hang,
    }

    struct StubSource(SourceBehaviour);

    #[async_trait]
    impl GeoSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        async fn locate(&self, _ip: &IpAddr) -> Result<Option<Location>, GeoError> {
            match self.0 {
                SourceBehaviour::Found => Ok(Some(Location {
                    country: Some("Germany".to_string()),
                    city: Some("Berlin".to_string()),
                })),
                SourceBehaviour::Fail => Err(GeoError::InvalidResponse("unavailable".to_string())),
                SourceBehaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(None)
                }
            }
        }
    }

    /// Request log that is always unavailable
    struct DownLogStore;

    impl RequestLogStore for DownLogStore {
        fn append_request(&self, _: &RequestRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::LockPoisoned)
        }

        fn recent_requests(&self, _: &IpAddr, _: usize) -> Result<Vec<RequestRecord>, PersistenceError> {
            Err(PersistenceError::LockPoisoned)
        }

        fn request_counts_since(&self, _: i64, _: usize) -> Result<Vec<AddressCount>, PersistenceError> {
            Err(PersistenceError::LockPoisoned)
        }

        fn path_match_counts_since(
            &self,
            _: i64,
            _: &str,
            _: usize,
        ) -> Result<Vec<AddressCount>, PersistenceError> {
            Err(PersistenceError::LockPoisoned)
        }

        fn prune_requests_before(&self, _: i64) -> Result<usize, PersistenceError> {
            Err(PersistenceError::LockPoisoned)
        }
    }

    #[tokio::test]
    async fn test_first_request_is_allowed_and_logged() {
        let h = harness();

        let decision = h.pipeline.handle(&request_from("203.0.113.9", "/home")).await;

        assert_eq!(decision, Decision::Allow);
        let records = h.store.recent_requests(&ip("203.0.113.9"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, ip("203.0.113.9"));
        assert_eq!(records[0].timestamp, NOW);
        assert_eq!(records[0].path, "/home");
        assert!(records[0].country.is_none());
    }

    #[tokio::test]
    async fn test_blocked_after_invalidation_is_denied_without_record() {
        let h = harness();
        let manager = BlockManager::new(h.store.clone(), h.block_cache.clone(), h.clock.clone());

        // Warm the cache with "not blocked"
        h.pipeline.handle(&request_from("203.0.113.9", "/")).await;

        assert!(manager.add("203.0.113.9", Some("manual block")).unwrap());
        let decision = h.pipeline.handle(&request_from("203.0.113.9", "/again")).await;

        assert_eq!(decision, Decision::Deny);
        let records = h.store.recent_requests(&ip("203.0.113.9"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/");
    }

    #[tokio::test]
    async fn test_denied_request_writes_nothing() {
        let h = harness();
        h.store.add_block(&ip("198.51.100.7"), None, NOW).unwrap();

        for _ in 0..3 {
            assert_eq!(
                h.pipeline.handle(&request_from("198.51.100.7", "/")).await,
                Decision::Deny
            );
        }

        assert!(h.store.recent_requests(&ip("198.51.100.7"), 10).unwrap().is_empty());
        assert_eq!(h.pipeline.stats().denied, 3);
    }

    #[tokio::test]
    async fn test_block_without_invalidation_within_ttl() {
        let h = harness();
        let addr = "198.51.100.8";

        h.pipeline.handle(&request_from(addr, "/")).await;
        h.store.add_block(&ip(addr), None, NOW).unwrap();

        h.clock.advance(10);
        assert_eq!(h.pipeline.handle(&request_from(addr, "/")).await, Decision::Allow);

        h.clock.advance(290);
        assert_eq!(h.pipeline.handle(&request_from(addr, "/")).await, Decision::Deny);
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_allowed_untracked() {
        let h = harness();

        let decision = h.pipeline.handle(&RequestMeta::new("/admin")).await;

        assert_eq!(decision, Decision::Allow);
        let stats = h.pipeline.stats();
        assert_eq!(stats.untracked, 1);
        assert_eq!(stats.allowed, 1);
        assert!(h.store.request_counts_since(0, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_failure_is_swallowed() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let h = harness_with_log_store(store, Arc::new(DownLogStore));

        let decision = h.pipeline.handle(&request_from("8.8.8.8", "/")).await;

        assert_eq!(decision, Decision::Allow);
        let stats = h.pipeline.stats();
        assert_eq!(stats.log_failures, 1);
        assert_eq!(stats.allowed, 1);
    }

    #[tokio::test]
    async fn test_each_allowed_request_writes_one_record() {
        let h = harness();

        for i in 0..5 {
            h.clock.advance(1);
            h.pipeline
                .handle(&request_from("8.8.4.4", &format!("/page/{}", i)))
                .await;
        }

        let records = h.store.recent_requests(&ip("8.8.4.4"), 10).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].path, "/page/4");
        assert_eq!(records[0].timestamp, NOW + 5);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let h = harness();
        h.store.add_block(&ip("198.51.100.7"), None, NOW).unwrap();

        tokio_test::block_on(async {
            h.pipeline.handle(&request_from("8.8.8.8", "/")).await;
            h.pipeline.handle(&request_from("198.51.100.7", "/")).await;
        });

        let json = serde_json::to_value(h.pipeline.stats()).unwrap();
        assert_eq!(json["allowed"], 1);
        assert_eq!(json["denied"], 1);
        assert_eq!(json["block_check_failures"], 0);
    }

    #[tokio::test]
    async fn test_location_reaches_request_record() {
        let h = harness_with_sources(vec![Box::new(StubSource(SourceBehaviour::Found))]);

        let decision = h.pipeline.handle(&request_from("8.8.8.8", "/home")).await;

        assert_eq!(decision, Decision::Allow);
        let records = h.store.recent_requests(&ip("8.8.8.8"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].country.as_deref(), Some("Germany"));
        assert_eq!(records[0].city.as_deref(), Some("Berlin"));
    }

    #[tokio::test]
    async fn test_failing_source_still_allows_and_logs() {
        let h = harness_with_sources(vec![Box::new(StubSource(SourceBehaviour::Fail))]);

        let decision = h.pipeline.handle(&request_from("8.8.8.8", "/")).await;

        assert_eq!(decision, Decision::Allow);
        let records = h.store.recent_requests(&ip("8.8.8.8"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].country.is_none());
        assert!(records[0].city.is_none());
    }

    #[tokio::test]
    async fn test_hanging_source_times_out_and_logs_unknown() {
        let h = harness_with_sources(vec![
            Box::new(StubSource(SourceBehaviour::Hang)),
            Box::new(StubSource(SourceBehaviour::Fail)),
        ]);

        let started = std::time::Instant::now();
        let decision = h.pipeline.handle(&request_from("8.8.8.8", "/")).await;

        assert_eq!(decision, Decision::Allow);
        assert!(started.elapsed() < Duration::from_secs(5));
        let records = h.store.recent_requests(&ip("8.8.8.8"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].country.is_none());
    }

    #[tokio::test]
    async fn test_block_on_mapped_address_denies_mapped_peer() {
        let h = harness();
        let manager = BlockManager::new(h.store.clone(), h.block_cache.clone(), h.clock.clone());
        manager.add("::ffff:203.0.113.9", None).unwrap();

        let decision = h
            .pipeline
            .handle(&request_from("::ffff:203.0.113.9", "/"))
            .await;

        assert_eq!(decision, Decision::Deny);
        assert!(h.store.recent_requests(&ip("203.0.113.9"), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mapped_forwarded_address_hits_ipv4_block() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let resolver_config = ResolverConfig {
            trusted_proxies: vec!["10.0.0.0/8".to_string()],
            ..ResolverConfig::default()
        };
        let h = build_harness(store.clone(), store, Vec::new(), resolver_config);
        h.store.add_block(&ip("203.0.113.9"), None, NOW).unwrap();

        let request = request_from("10.0.0.1", "/")
            .with_header("X-Forwarded-For", "::ffff:203.0.113.9");

        assert_eq!(h.pipeline.handle(&request).await, Decision::Deny);
        assert!(h
            .store
            .recent_requests(&ip("::ffff:203.0.113.9"), 10)
            .unwrap()
            .is_empty());
    }
}
