//! IP geolocation sources
//!
//! Each source maps an address to an optional country/city pair. Sources are
//! consulted in priority order by [`crate::cache::GeoLookupCache`]; a source
//! failure only means the next source gets a chance.

pub mod ipinfo;
pub mod maxmind;

pub use ipinfo::IpInfoSource;
pub use maxmind::MaxMindSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur during geolocation lookups
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Failed to open database: {0}")]
    Database(#[from] maxminddb::MaxMindDBError),

    #[error("Database file not found: {0}")]
    FileNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Country and city of an address; both absent means "unknown"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

impl Location {
    pub fn unknown() -> Self {
        Location::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.country.is_none() && self.city.is_none()
    }

    /// Human-readable location string
    pub fn display_location(&self) -> String {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => format!("{}, {}", city, country),
            (None, Some(country)) => country.clone(),
            (Some(city), None) => city.clone(),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// A geolocation enrichment source
#[async_trait]
pub trait GeoSource: Send + Sync {
    /// Source name for logging
    fn name(&self) -> &str;

    /// Locate an address. `Ok(None)` means the source has no data for it.
    async fn locate(&self, ip: &IpAddr) -> Result<Option<Location>, GeoError>;
}

/// Treat empty strings from a source as absent values
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
