//! Windowed anomaly detection over the request log
//!
//! Two signals are evaluated per run: overall request volume per address, and
//! per-pattern hits on sensitive paths. Every sensitive pattern is its own
//! batch. An address with an unresolved flag inside the window is never
//! flagged again, whatever signal fired.

use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DetectionConfig;
use crate::models::SuspiciousEntry;
use crate::persistence::{AddressCount, PersistenceError, RequestLogStore, SuspiciousStore};

/// The aggregate a flag was raised for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum Signal {
    Volume,
    SensitivePath(String),
}

impl Signal {
    fn reason(&self, count: usize, window: &str) -> String {
        match self {
            Signal::Volume => format!(
                "Excessive requests: {} requests in the last {}",
                count, window
            ),
            Signal::SensitivePath(pattern) => format!(
                "Suspicious access to {}: {} attempts in the last {}",
                pattern, count, window
            ),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Volume => write!(f, "volume"),
            Signal::SensitivePath(pattern) => write!(f, "sensitive path {}", pattern),
        }
    }
}

/// Outcome of one signal batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalReport {
    pub signal: Signal,
    /// Addresses above the threshold
    pub candidates: usize,
    /// New suspicious entries created
    pub flagged: usize,
    /// Candidates skipped because of an active unresolved flag
    pub already_flagged: usize,
    /// False if a store failure cut the batch short or dropped a write
    pub completed: bool,
}

impl SignalReport {
    fn new(signal: Signal) -> Self {
        SignalReport {
            signal,
            candidates: 0,
            flagged: 0,
            already_flagged: 0,
            completed: true,
        }
    }
}

/// Result of a detection run
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSummary {
    pub run_at: i64,
    pub window_seconds: u64,
    pub volume: SignalReport,
    pub sensitive_paths: Vec<SignalReport>,
    /// Entries created by this run
    pub flagged: Vec<SuspiciousEntry>,
}

impl DetectionSummary {
    pub fn is_complete(&self) -> bool {
        self.volume.completed && self.sensitive_paths.iter().all(|r| r.completed)
    }

    pub fn total_flagged(&self) -> usize {
        self.flagged.len()
    }

    pub fn sensitive_flagged(&self) -> usize {
        self.sensitive_paths.iter().map(|r| r.flagged).sum()
    }

    pub fn run_at_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp(self.run_at, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

/// Batch detector reading the request log and writing suspicious entries
///
/// Runs must not overlap: the dedup check and the insert are not atomic.
/// [`crate::detection::DetectionScheduler`] serialises runs.
pub struct AnomalyDetector {
    requests: Arc<dyn RequestLogStore>,
    suspicious: Arc<dyn SuspiciousStore>,
    clock: Arc<dyn Clock>,
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(
        requests: Arc<dyn RequestLogStore>,
        suspicious: Arc<dyn SuspiciousStore>,
        clock: Arc<dyn Clock>,
        config: DetectionConfig,
    ) -> Self {
        AnomalyDetector {
            requests,
            suspicious,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Run both signals over the window ending now
    pub fn run(&self) -> DetectionSummary {
        let now = self.clock.now();
        let window = i64::try_from(self.config.window_seconds).unwrap_or(i64::MAX);
        let since = now.saturating_sub(window);
        let window_text = describe_window(self.config.window_seconds);

        log::info!("Anomaly detection started for the last {}", window_text);

        let mut flagged = Vec::new();
        let volume = self.run_batch(Signal::Volume, since, now, &window_text, &mut flagged);
        let sensitive_paths = self
            .config
            .sensitive_paths
            .iter()
            .map(|pattern| {
                self.run_batch(
                    Signal::SensitivePath(pattern.clone()),
                    since,
                    now,
                    &window_text,
                    &mut flagged,
                )
            })
            .collect();

        let summary = DetectionSummary {
            run_at: now,
            window_seconds: self.config.window_seconds,
            volume,
            sensitive_paths,
            flagged,
        };

        if summary.is_complete() {
            log::info!(
                "Anomaly detection completed: {} high-frequency, {} sensitive-path flags",
                summary.volume.flagged,
                summary.sensitive_flagged()
            );
        } else {
            log::error!(
                "Anomaly detection partially completed: {} new flags",
                summary.total_flagged()
            );
        }

        summary
    }

    fn candidates(&self, signal: &Signal, since: i64) -> Result<Vec<AddressCount>, PersistenceError> {
        match signal {
            Signal::Volume => self
                .requests
                .request_counts_since(since, self.config.volume_threshold),
            Signal::SensitivePath(pattern) => self.requests.path_match_counts_since(
                since,
                pattern,
                self.config.sensitive_threshold,
            ),
        }
    }

    fn run_batch(
        &self,
        signal: Signal,
        since: i64,
        now: i64,
        window_text: &str,
        flagged: &mut Vec<SuspiciousEntry>,
    ) -> SignalReport {
        let mut report = SignalReport::new(signal);

        let candidates = match self.candidates(&report.signal, since) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::error!("Aborting {} batch, request log unavailable: {}", report.signal, e);
                report.completed = false;
                return report;
            }
        };
        report.candidates = candidates.len();

        for candidate in candidates {
            match self.suspicious.has_unresolved_since(&candidate.address, since) {
                Ok(true) => {
                    log::debug!("{} already flagged in this window", candidate.address);
                    report.already_flagged += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!(
                        "Aborting {} batch, suspicious store unavailable: {}",
                        report.signal,
                        e
                    );
                    report.completed = false;
                    return report;
                }
            }

            let reason = report.signal.reason(candidate.count, window_text);
            match self
                .suspicious
                .flag_suspicious(&candidate.address, &reason, now)
            {
                Ok(entry) => {
                    log::warn!("Flagged IP {} for {}: {}", entry.address, report.signal, candidate.count);
                    report.flagged += 1;
                    flagged.push(entry);
                }
                Err(e) => {
                    log::error!("Failed to flag {}: {}", candidate.address, e);
                    report.completed = false;
                }
            }
        }

        report
    }
}

/// Render a window length for reason texts, e.g. "hour" or "30 minutes"
pub fn describe_window(seconds: u64) -> String {
    match seconds {
        3600 => "hour".to_string(),
        s if s % 3600 == 0 => format!("{} hours", s / 3600),
        60 => "minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{} seconds", s),
    }
}
