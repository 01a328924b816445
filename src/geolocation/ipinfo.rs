//! Remote lookups against the ipinfo.io JSON API

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use super::{non_empty, GeoError, GeoSource, Location};

/// Subset of the ipinfo.io response we care about
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    /// Set for private and reserved ranges
    #[serde(default)]
    bogon: bool,
}

impl IpInfoResponse {
    fn into_location(self) -> Option<Location> {
        if self.bogon {
            return None;
        }

        let location = Location {
            country: non_empty(self.country),
            city: non_empty(self.city),
        };
        (!location.is_unknown()).then_some(location)
    }
}

/// HTTP geolocation source
pub struct IpInfoSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl IpInfoSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(IpInfoSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn url_for(&self, ip: &IpAddr) -> String {
        format!("{}/{}/json", self.base_url, ip)
    }
}

#[async_trait]
impl GeoSource for IpInfoSource {
    fn name(&self) -> &str {
        "ipinfo"
    }

    async fn locate(&self, ip: &IpAddr) -> Result<Option<Location>, GeoError> {
        let mut request = self.client.get(self.url_for(ip));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GeoError::InvalidResponse(format!(
                "ipinfo returned status {}",
                response.status()
            )));
        }

        let body: IpInfoResponse = response.json().await?;
        Ok(body.into_location())
    }
}
