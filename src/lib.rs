pub mod blocking;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detection;
pub mod geolocation;
pub mod models;
pub mod output;
pub mod persistence;
pub mod pipeline;
pub mod resolver;

// Re-export commonly used types
pub use blocking::{BlockError, BlockManager};
pub use cache::{BlockStatusCache, GeoLookupCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use detection::{AnomalyDetector, DetectionScheduler, DetectionSummary};
pub use geolocation::{GeoSource, Location};
pub use models::{BlockedEntry, Decision, RequestMeta, RequestRecord, SuspiciousEntry};
pub use persistence::{BlockStore, LockStore, RequestLogStore, SqliteStore, SuspiciousStore};
pub use pipeline::RequestPipeline;
pub use resolver::AddressResolver;
