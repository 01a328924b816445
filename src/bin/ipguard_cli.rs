use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structopt::StructOpt;

use ipguard::blocking::BlockManager;
use ipguard::cache::BlockStatusCache;
use ipguard::clock::{Clock, SystemClock};
use ipguard::config::Config;
use ipguard::detection::{AnomalyDetector, DetectionScheduler, SignalReport};
use ipguard::persistence::{RequestLogStore, SqliteStore, SuspiciousStore};
use ipguard::resolver::canonical_address;

/// IPGuard command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "ipguard", about = "Request IP tracking and blocking CLI")]
struct Cli {
    /// Path to configuration file
    #[structopt(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Add an address to the block list
    Block {
        /// IP address to block
        ip: String,
        /// Why the address is blocked
        #[structopt(short, long)]
        reason: Option<String>,
    },
    /// Run anomaly detection once and print a summary
    Detect,
    /// List suspicious entries, newest first
    Suspicious {
        #[structopt(short, long, default_value = "20")]
        limit: usize,
        /// Include resolved entries
        #[structopt(short, long)]
        all: bool,
    },
    /// Mark a suspicious entry as resolved
    Resolve {
        /// Suspicious entry id
        id: i64,
    },
    /// Show recent requests from an address
    Requests {
        ip: String,
        #[structopt(short, long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    if let Command::Config { output } = &cli.command {
        Config::default().to_file(output)?;
        println!("Default configuration written to: {:?}", output);
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let store = Arc::new(SqliteStore::new(&config.persistence.database_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Config { .. } => {}
        Command::Block { ip, reason } => {
            let cache = Arc::new(BlockStatusCache::new(
                store.clone(),
                config.cache.block_ttl_seconds,
                config.cache.max_entries,
                config.cache.block_check_attempts,
                clock.clone(),
            ));
            let manager = BlockManager::new(store, cache, clock);
            if manager.add(&ip, reason.as_deref())? {
                println!("Successfully blocked IP: {}", ip);
            } else {
                println!("IP {} is already blocked", ip);
            }
        }
        Command::Detect => {
            let interval = config.detection.interval_seconds;
            let detector =
                AnomalyDetector::new(store.clone(), store.clone(), clock.clone(), config.detection);
            let scheduler = DetectionScheduler::new(detector, store, interval, clock);
            let summary = match scheduler.try_run() {
                Some(summary) => summary,
                None => {
                    eprintln!("A detection run is already in progress; try again later");
                    std::process::exit(1);
                }
            };

            println!("Detection run at {}", summary.run_at_rfc3339());
            print_report(&summary.volume);
            for report in &summary.sensitive_paths {
                print_report(report);
            }
            for entry in &summary.flagged {
                println!("  flagged #{} {}: {}", entry.id, entry.address, entry.reason);
            }
            if !summary.is_complete() {
                eprintln!("Detection did not complete; see log output");
                std::process::exit(1);
            }
        }
        Command::Suspicious { limit, all } => {
            let entries = store.recent_suspicious(limit, all)?;
            println!("{} suspicious entr{}:", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            for entry in entries {
                println!(
                    "  #{} {} at {}{}: {}",
                    entry.id,
                    entry.address,
                    format_timestamp(entry.flagged_at),
                    if entry.resolved { " (resolved)" } else { "" },
                    entry.reason
                );
            }
        }
        Command::Resolve { id } => {
            if store.resolve_suspicious(id)? {
                println!("Resolved suspicious entry #{}", id);
            } else {
                eprintln!("No suspicious entry with id {}", id);
                std::process::exit(1);
            }
        }
        Command::Requests { ip, limit } => {
            let address: IpAddr = ip
                .trim()
                .parse::<IpAddr>()
                .map(|addr| canonical_address(&addr))
                .map_err(|_| format!("Invalid IP address: {}", ip))?;
            let records = store.recent_requests(&address, limit)?;
            println!("{} request(s) from {}:", records.len(), address);
            for record in records {
                println!(
                    "  {} {} ({}, {})",
                    format_timestamp(record.timestamp),
                    record.path,
                    record.city.as_deref().unwrap_or("-"),
                    record.country.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        log::warn!("Config file {:?} not found, using defaults", path);
        Ok(Config::default())
    }
}

fn print_report(report: &SignalReport) {
    println!(
        "  {}: {} candidate(s), {} flagged, {} already flagged{}",
        report.signal,
        report.candidates,
        report.flagged,
        report.already_flagged,
        if report.completed { "" } else { " [incomplete]" }
    );
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
