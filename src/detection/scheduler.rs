//! Run lock and cadence for the anomaly detector
//!
//! Runs are serialised twice: an in-process mutex, then a lock row in the
//! shared store so a CLI run and the daemon never scan the same window at
//! the same time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use super::{AnomalyDetector, DetectionSummary};
use crate::clock::Clock;
use crate::persistence::LockStore;

const NEVER: i64 = i64::MIN;

/// Name of the store lock guarding detection runs
pub const DETECTION_LOCK: &str = "anomaly_detection";

/// A store lock older than this is assumed to belong to a dead process
const STALE_LOCK_SECONDS: i64 = 3600;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(0);

/// Serialises detector runs and decides when the next one is due
pub struct DetectionScheduler {
    detector: AnomalyDetector,
    locks: Arc<dyn LockStore>,
    holder: String,
    interval_seconds: i64,
    clock: Arc<dyn Clock>,
    run_lock: Mutex<()>,
    last_started: AtomicI64,
}

impl DetectionScheduler {
    pub fn new(
        detector: AnomalyDetector,
        locks: Arc<dyn LockStore>,
        interval_seconds: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let holder = format!(
            "{}-{}",
            std::process::id(),
            NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)
        );

        DetectionScheduler {
            detector,
            locks,
            holder,
            interval_seconds: i64::try_from(interval_seconds).unwrap_or(i64::MAX),
            clock,
            run_lock: Mutex::new(()),
            last_started: AtomicI64::new(NEVER),
        }
    }

    /// Whether the interval has elapsed since the last started run
    pub fn is_due(&self) -> bool {
        let last = self.last_started.load(Ordering::SeqCst);
        last == NEVER || self.clock.now().saturating_sub(last) >= self.interval_seconds
    }

    /// Run now unless a run is already active here or in another process
    pub fn try_run(&self) -> Option<DetectionSummary> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::warn!("Anomaly detection already running, skipping this trigger");
                return None;
            }
            // A panicked run leaves no state behind worth protecting
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let now = self.clock.now();
        match self.locks.try_acquire_lock(
            DETECTION_LOCK,
            &self.holder,
            now,
            now.saturating_sub(STALE_LOCK_SECONDS),
        ) {
            Ok(true) => {}
            Ok(false) => {
                log::info!("Anomaly detection running in another process, skipping");
                // That run covers this window
                self.last_started.store(now, Ordering::SeqCst);
                return None;
            }
            Err(e) => {
                log::error!("Could not take the detection lock: {}", e);
                return None;
            }
        }

        self.last_started.store(now, Ordering::SeqCst);
        let summary = self.detector.run();

        if let Err(e) = self.locks.release_lock(DETECTION_LOCK, &self.holder) {
            log::error!("Failed to release the detection lock: {}", e);
        }

        Some(summary)
    }

    /// Run if due and not already running
    pub fn poll(&self) -> Option<DetectionSummary> {
        if self.is_due() {
            self.try_run()
        } else {
            None
        }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }
}
