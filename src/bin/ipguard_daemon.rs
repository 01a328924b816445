use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipguard::clock::{Clock, SystemClock};
use ipguard::config::Config;
use ipguard::detection::{AnomalyDetector, DetectionScheduler, DetectionSummary};
use ipguard::output::{OutputFormat, OutputHandler};
use ipguard::persistence::{RequestLogStore, SqliteStore};

/// Background anomaly detection daemon
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting IPGuard daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };

    // Setup graceful shutdown signal handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut output_handler = OutputHandler::new(
        OutputFormat::parse(&config.output.format),
        config.output.file_path.clone(),
    )?;

    let store = Arc::new(SqliteStore::new(&config.persistence.database_path)?);
    log::info!("Using database {:?}", config.persistence.database_path);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let detector = AnomalyDetector::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        config.detection.clone(),
    );
    let scheduler = DetectionScheduler::new(
        detector,
        store.clone(),
        config.detection.interval_seconds,
        clock.clone(),
    );

    log::info!(
        "Detection every {}s over a {}s window. Press Ctrl+C to stop.",
        config.detection.interval_seconds,
        config.detection.window_seconds
    );

    while running.load(Ordering::SeqCst) {
        if let Some(summary) = scheduler.poll() {
            report(&summary, &mut output_handler);

            if let Some(hours) = config.persistence.retention_hours {
                prune(store.as_ref(), clock.as_ref(), hours);
            }
        }

        std::thread::sleep(Duration::from_millis(200));
    }

    output_handler.flush()?;
    log::info!("IPGuard daemon stopped");
    Ok(())
}

fn report(summary: &DetectionSummary, output_handler: &mut OutputHandler) {
    if let Err(e) = output_handler.write_entries(&summary.flagged) {
        log::error!(
            "Failed to write {} suspicious entries: {}",
            summary.flagged.len(),
            e
        );
    }
}

fn prune(store: &dyn RequestLogStore, clock: &dyn Clock, retention_hours: u64) {
    let retention = i64::try_from(retention_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
    let cutoff = clock.now().saturating_sub(retention);

    match store.prune_requests_before(cutoff) {
        Ok(0) => {}
        Ok(removed) => log::info!("Pruned {} request records older than {}h", removed, retention_hours),
        Err(e) => log::error!("Failed to prune request records: {}", e),
    }
}
