pub mod anomaly;
pub mod scheduler;

pub use anomaly::{AnomalyDetector, DetectionSummary, Signal, SignalReport};
pub use scheduler::{DetectionScheduler, DETECTION_LOCK};
