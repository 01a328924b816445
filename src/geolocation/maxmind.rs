//! Local lookups against a MaxMind GeoLite2-City database
//!
//! The database file must be downloaded separately from MaxMind (free with
//! registration).

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use super::{GeoError, GeoSource, Location};

/// GeoIP source backed by a memory-resident GeoLite2-City reader
///
/// # Example
///
/// ```ignore
/// use ipguard::geolocation::MaxMindSource;
///
/// let source = MaxMindSource::new("GeoLite2-City.mmdb")?;
/// let location = source.lookup(&"8.8.8.8".parse().unwrap())?;
/// println!("{}", location.unwrap_or_default().display_location());
/// ```
pub struct MaxMindSource {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindSource {
    /// Open a GeoLite2-City database file
    ///
    /// # Errors
    ///
    /// Returns an error if the database file cannot be opened or is invalid.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, GeoError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(GeoError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        Ok(MaxMindSource {
            reader: Arc::new(reader),
        })
    }

    /// Look up country and city names for an address
    ///
    /// Returns `Ok(None)` if the address is not in the database or carries
    /// neither a country nor a city.
    pub fn lookup(&self, ip: &IpAddr) -> Result<Option<Location>, GeoError> {
        let record: geoip2::City = match self.reader.lookup(*ip) {
            Ok(record) => record,
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => return Ok(None),
            Err(other) => return Err(GeoError::Database(other)),
        };

        let country = record.country.as_ref().and_then(|c| {
            c.names
                .as_ref()
                .and_then(|n| n.get("en").copied())
                .or(c.iso_code)
                .map(String::from)
        });
        let city = record
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en").copied())
            .map(String::from);

        let location = Location { country, city };
        if location.is_unknown() {
            Ok(None)
        } else {
            Ok(Some(location))
        }
    }
}

impl Clone for MaxMindSource {
    fn clone(&self) -> Self {
        MaxMindSource {
            reader: Arc::clone(&self.reader),
        }
    }
}

#[async_trait]
impl GeoSource for MaxMindSource {
    fn name(&self) -> &str {
        "maxmind"
    }

    async fn locate(&self, ip: &IpAddr) -> Result<Option<Location>, GeoError> {
        self.lookup(ip)
    }
}
