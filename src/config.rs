use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::resolver::parse_network;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the IP tracking core and its daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client address resolution
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Block-status and geolocation cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Geolocation enrichment sources
    #[serde(default)]
    pub geolocation: GeolocationConfig,
    /// Anomaly detection thresholds and schedule
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Database location and retention
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Where flagged addresses are reported
    #[serde(default)]
    pub output: OutputConfig,
}

/// Client address resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Peers (IPs or CIDR networks) whose forwarding headers are trusted
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Forwarding headers to consult, in order of preference
    #[serde(default = "default_forwarded_headers")]
    pub forwarded_headers: Vec<String>,
    /// Take the first (client-most) address of a comma-separated header
    #[serde(default = "default_true")]
    pub use_first_forwarded: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            trusted_proxies: Vec::new(),
            forwarded_headers: default_forwarded_headers(),
            use_first_forwarded: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of cached block status in seconds
    #[serde(default = "default_block_ttl")]
    pub block_ttl_seconds: u64,
    /// TTL of cached geolocation results in seconds
    #[serde(default = "default_geo_ttl")]
    pub geo_ttl_seconds: u64,
    /// Upper bound on entries per cache
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Block store read attempts before failing open
    #[serde(default = "default_block_check_attempts")]
    pub block_check_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            block_ttl_seconds: default_block_ttl(),
            geo_ttl_seconds: default_geo_ttl(),
            max_entries: default_max_entries(),
            block_check_attempts: default_block_check_attempts(),
        }
    }
}

/// Geolocation source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeolocationConfig {
    /// Per-source lookup timeout in milliseconds
    #[serde(default = "default_source_timeout")]
    pub source_timeout_ms: u64,
    /// Path to a GeoLite2-City database, consulted first when set
    #[serde(default)]
    pub maxmind_db: Option<PathBuf>,
    /// ipinfo.io fallback
    #[serde(default)]
    pub ipinfo: IpInfoConfig,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        GeolocationConfig {
            source_timeout_ms: default_source_timeout(),
            maxmind_db: None,
            ipinfo: IpInfoConfig::default(),
        }
    }
}

impl GeolocationConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

/// ipinfo.io configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpInfoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ipinfo_url")]
    pub base_url: String,
    /// API token (supports ${ENV_VAR} syntax)
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for IpInfoConfig {
    fn default() -> Self {
        IpInfoConfig {
            enabled: true,
            base_url: default_ipinfo_url(),
            token: None,
        }
    }
}

/// Anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Lookback window in seconds
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    /// Seconds between scheduled runs
    #[serde(default = "default_window")]
    pub interval_seconds: u64,
    /// Flag addresses with more than this many requests in the window
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: usize,
    /// Flag addresses with more than this many hits on one sensitive path
    #[serde(default = "default_sensitive_threshold")]
    pub sensitive_threshold: usize,
    /// Path substrings considered sensitive (case-insensitive)
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            window_seconds: default_window(),
            interval_seconds: default_window(),
            volume_threshold: default_volume_threshold(),
            sensitive_threshold: default_sensitive_threshold(),
            sensitive_paths: default_sensitive_paths(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Prune request records older than this many hours after each run
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            database_path: default_database_path(),
            retention_hours: None,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    #[serde(default = "default_output_format")]
    pub format: String,
    /// Output file path (if format is not "console")
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: default_output_format(),
            file_path: Some(PathBuf::from("suspicious.jsonl")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_forwarded_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}

fn default_block_ttl() -> u64 {
    300
}

fn default_geo_ttl() -> u64 {
    86_400
}

fn default_max_entries() -> usize {
    100_000
}

fn default_block_check_attempts() -> u32 {
    3
}

fn default_source_timeout() -> u64 {
    2000
}

fn default_ipinfo_url() -> String {
    "https://ipinfo.io".to_string()
}

fn default_window() -> u64 {
    3600
}

fn default_volume_threshold() -> usize {
    100
}

fn default_sensitive_threshold() -> usize {
    5
}

fn default_sensitive_paths() -> Vec<String> {
    ["/admin", "/login", "/api/admin", "/accounts/login"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ipguard.db")
}

fn default_output_format() -> String {
    "jsonl".to_string()
}

impl Config {
    /// Load configuration from a file, expanding `${VAR}` references
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&expand_env_vars(&contents)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values that would make the caches or the detector meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.block_ttl_seconds == 0 || self.cache.geo_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("cache TTLs must be positive".to_string()));
        }
        if self.cache.block_check_attempts == 0 {
            return Err(ConfigError::Invalid(
                "block_check_attempts must be at least 1".to_string(),
            ));
        }
        if self.geolocation.source_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "source_timeout_ms must be positive".to_string(),
            ));
        }
        if self.detection.window_seconds == 0 || self.detection.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "detection window and interval must be positive".to_string(),
            ));
        }
        if self.detection.sensitive_paths.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "sensitive path patterns must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .resolver
            .trusted_proxies
            .iter()
            .find(|entry| parse_network(entry).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "invalid trusted proxy entry: {}",
                bad
            )));
        }
        Ok(())
    }
}

/// Expand environment variables in the format ${VAR_NAME}
fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}
