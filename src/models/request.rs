use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{truncate_chars, MAX_LOCATION_LEN, MAX_PATH_LEN};
use crate::geolocation::Location;

/// Connection metadata of an inbound request, as handed over by the host server.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Direct peer address, either a bare IP or `ip:port`
    pub remote_addr: Option<String>,
    /// Request headers keyed by lower-cased name
    headers: HashMap<String, String>,
    /// Full request path including the query string
    pub path: String,
}

impl RequestMeta {
    pub fn new(path: impl Into<String>) -> Self {
        RequestMeta {
            remote_addr: None,
            headers: HashMap::new(),
            path: path.into(),
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    /// Look up a header value by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Outcome of the per-request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// One logged (allowed) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub address: IpAddr,
    pub timestamp: i64,
    pub path: String,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl RequestRecord {
    /// Build a record, clamping path and location fields to their stored widths.
    pub fn new(address: IpAddr, timestamp: i64, path: &str, location: Location) -> Self {
        RequestRecord {
            address,
            timestamp,
            path: truncate_chars(path, MAX_PATH_LEN),
            country: location.country.map(|c| truncate_chars(&c, MAX_LOCATION_LEN)),
            city: location.city.map(|c| truncate_chars(&c, MAX_LOCATION_LEN)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let meta = RequestMeta::new("/")
            .with_header("X-Forwarded-For", "1.2.3.4");

        assert_eq!(meta.header("x-forwarded-for"), Some("1.2.3.4"));
        assert_eq!(meta.header("X-FORWARDED-FOR"), Some("1.2.3.4"));
        assert_eq!(meta.header("x-real-ip"), None);
    }

    #[test]
    fn test_record_truncates_long_fields() {
        let long_path = format!("/{}", "a".repeat(800));
        let location = Location {
            country: Some("c".repeat(150)),
            city: None,
        };
        let record = RequestRecord::new("8.8.8.8".parse().unwrap(), 1000, &long_path, location);

        assert_eq!(record.path.chars().count(), MAX_PATH_LEN);
        assert_eq!(record.country.as_ref().map(|c| c.len()), Some(MAX_LOCATION_LEN));
        assert!(record.city.is_none());
    }

    #[test]
    fn test_decision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Decision::Deny).unwrap(), "\"deny\"");
        assert!(Decision::Allow.is_allowed());
        assert!(!Decision::Deny.is_allowed());
    }
}
