//! Geolocation cache with an ordered fallback chain of sources

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::TtlCache;
use crate::clock::Clock;
use crate::config::GeolocationConfig;
use crate::geolocation::{GeoSource, IpInfoSource, Location, MaxMindSource};

/// Caches `address -> (country, city)` with a long TTL
///
/// Unknown results are cached as well, so unresolvable addresses cost at most
/// one pass over the sources per TTL.
pub struct GeoLookupCache {
    cache: TtlCache<IpAddr, Location>,
    sources: Vec<Box<dyn GeoSource>>,
    source_timeout: Duration,
}

impl GeoLookupCache {
    pub fn new(
        sources: Vec<Box<dyn GeoSource>>,
        ttl_seconds: u64,
        max_entries: usize,
        source_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        GeoLookupCache {
            cache: TtlCache::new(ttl_seconds, max_entries, clock),
            sources,
            source_timeout,
        }
    }

    /// Build the source chain from configuration: MaxMind first, then ipinfo
    pub fn from_config(
        config: &GeolocationConfig,
        ttl_seconds: u64,
        max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut sources: Vec<Box<dyn GeoSource>> = Vec::new();

        if let Some(ref path) = config.maxmind_db {
            match MaxMindSource::new(path) {
                Ok(source) => {
                    log::info!("MaxMind geolocation source enabled: {}", path.display());
                    sources.push(Box::new(source));
                }
                Err(e) => log::warn!("MaxMind database unavailable: {}", e),
            }
        }

        if config.ipinfo.enabled {
            match IpInfoSource::new(
                &config.ipinfo.base_url,
                config.ipinfo.token.clone(),
                config.source_timeout(),
            ) {
                Ok(source) => {
                    log::info!("ipinfo geolocation source enabled");
                    sources.push(Box::new(source));
                }
                Err(e) => log::warn!("Failed to create ipinfo client: {}", e),
            }
        }

        if sources.is_empty() {
            log::warn!("No geolocation sources configured, all locations will be unknown");
        }

        Self::new(sources, ttl_seconds, max_entries, config.source_timeout(), clock)
    }

    /// Locate an address, consulting sources only on a cache miss
    ///
    /// Never fails: source errors and timeouts degrade to an unknown location.
    pub async fn lookup(&self, ip: &IpAddr) -> Location {
        if let Some(location) = self.cache.get(ip) {
            return location;
        }

        let location = self.query_sources(ip).await;
        self.cache.insert(*ip, location.clone());
        location
    }

    async fn query_sources(&self, ip: &IpAddr) -> Location {
        for source in &self.sources {
            match tokio::time::timeout(self.source_timeout, source.locate(ip)).await {
                Ok(Ok(Some(location))) => {
                    log::debug!(
                        "Located {} via {}: {}",
                        ip,
                        source.name(),
                        location.display_location()
                    );
                    return location;
                }
                Ok(Ok(None)) => log::debug!("{} has no location for {}", source.name(), ip),
                Ok(Err(e)) => log::debug!("Geolocation lookup via {} failed: {}", source.name(), e),
                Err(_) => log::debug!(
                    "Geolocation lookup via {} timed out after {:?}",
                    source.name(),
                    self.source_timeout
                ),
            }
        }

        Location::unknown()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geolocation::GeoError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Found(&'static str, &'static str),
        Empty,
        Fail,
        Hang,
    }

    struct FakeSource {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn boxed(name: &'static str, behaviour: Behaviour) -> (Box<dyn GeoSource>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = FakeSource {
                name,
                behaviour,
                calls: calls.clone(),
            };
            (Box::new(source), calls)
        }
    }

    #[async_trait]
    impl GeoSource for FakeSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn locate(&self, _ip: &IpAddr) -> Result<Option<Location>, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Found(country, city) => Ok(Some(Location {
                    country: Some(country.to_string()),
                    city: Some(city.to_string()),
                })),
                Behaviour::Empty => Ok(None),
                Behaviour::Fail => Err(GeoError::InvalidResponse("boom".to_string())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(None)
                }
            }
        }
    }

    fn cache_with(sources: Vec<Box<dyn GeoSource>>, clock: Arc<ManualClock>) -> GeoLookupCache {
        GeoLookupCache::new(sources, 86_400, 1000, Duration::from_millis(50), clock)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let (source, calls) = FakeSource::boxed("fake", Behaviour::Found("DE", "Berlin"));
        let cache = cache_with(vec![source], Arc::new(ManualClock::new(0)));

        let first = cache.lookup(&ip("8.8.8.8")).await;
        let second = cache.lookup(&ip("8.8.8.8")).await;

        assert_eq!(first, second);
        assert_eq!(first.city.as_deref(), Some("Berlin"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_source_with_result_wins() {
        let (empty, empty_calls) = FakeSource::boxed("empty", Behaviour::Empty);
        let (failing, failing_calls) = FakeSource::boxed("failing", Behaviour::Fail);
        let (found, _) = FakeSource::boxed("found", Behaviour::Found("FR", "Paris"));
        let (unused, unused_calls) = FakeSource::boxed("unused", Behaviour::Found("US", "Austin"));
        let cache = cache_with(vec![empty, failing, found, unused], Arc::new(ManualClock::new(0)));

        let location = cache.lookup(&ip("8.8.8.8")).await;

        assert_eq!(location.country.as_deref(), Some("FR"));
        assert_eq!(empty_calls.load(Ordering::SeqCst), 1);
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(unused_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_sources_failing_caches_unknown() {
        let (failing, calls) = FakeSource::boxed("failing", Behaviour::Fail);
        let cache = cache_with(vec![failing], Arc::new(ManualClock::new(0)));

        assert!(cache.lookup(&ip("8.8.8.8")).await.is_unknown());
        assert!(cache.lookup(&ip("8.8.8.8")).await.is_unknown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_moves_to_next_source() {
        let (hanging, _) = FakeSource::boxed("hanging", Behaviour::Hang);
        let (found, _) = FakeSource::boxed("found", Behaviour::Found("JP", "Tokyo"));
        let cache = cache_with(vec![hanging, found], Arc::new(ManualClock::new(0)));

        let started = std::time::Instant::now();
        let location = cache.lookup(&ip("8.8.8.8")).await;

        assert_eq!(location.city.as_deref(), Some("Tokyo"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let (source, calls) = FakeSource::boxed("fake", Behaviour::Empty);
        let cache = cache_with(vec![source], clock.clone());

        cache.lookup(&ip("8.8.8.8")).await;
        clock.advance(86_399);
        cache.lookup(&ip("8.8.8.8")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(1);
        cache.lookup(&ip("8.8.8.8")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_sources_means_unknown() {
        let cache = cache_with(Vec::new(), Arc::new(ManualClock::new(0)));
        assert_eq!(cache.source_count(), 0);
        assert!(cache.lookup(&ip("8.8.8.8")).await.is_unknown());
    }

    #[test]
    fn test_from_config_skips_missing_database() {
        let config = GeolocationConfig {
            maxmind_db: Some("definitely-missing.mmdb".into()),
            ..GeolocationConfig::default()
        };
        let cache = GeoLookupCache::from_config(&config, 60, 10, Arc::new(ManualClock::new(0)));

        // Only the ipinfo fallback remains
        assert_eq!(cache.source_count(), 1);
    }
}
