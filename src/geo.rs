use crate::http;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::debug;

pub const DEFAULT_LOCATION: &str = "Somewhere, Earth";
pub const DEFAULT_LOOKUP_URL: &str = "http://ip-api.com/json";

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("address {0} is not publicly routable")]
    NotPublic(IpAddr),
    #[error("geolocation request failed: {0}")]
    Request(String),
    #[error("geolocation lookup was unsuccessful")]
    Unresolved,
}

/// Never fails: any problem resolves to a fixed default.
pub trait Geolocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> String;
}

/// Always answers with the same place. Used when lookups are disabled.
#[derive(Debug, Clone)]
pub struct FixedLocator(pub String);

impl Default for FixedLocator {
    fn default() -> Self {
        Self(DEFAULT_LOCATION.to_string())
    }
}

impl Geolocator for FixedLocator {
    fn locate(&self, _ip: IpAddr) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Deserialize)]
struct LookupReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Clone)]
pub struct IpApiLocator {
    base_url: String,
}

impl Default for IpApiLocator {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_URL)
    }
}

impl IpApiLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Result<String, GeoError> {
        if !is_public(ip) {
            return Err(GeoError::NotPublic(ip));
        }
        let url = format!("{}/{ip}", self.base_url);
        let reply: LookupReply = http::agent()
            .get(&url)
            .query("fields", "status,city,country")
            .call()
            .map_err(|err| GeoError::Request(err.to_string()))?
            .into_json()
            .map_err(|err| GeoError::Request(err.to_string()))?;
        format_place(&reply).ok_or(GeoError::Unresolved)
    }
}

impl Geolocator for IpApiLocator {
    fn locate(&self, ip: IpAddr) -> String {
        match self.lookup(ip) {
            Ok(place) => place,
            Err(err) => {
                debug!(error = %err, "falling back to default location");
                DEFAULT_LOCATION.to_string()
            }
        }
    }
}

fn format_place(reply: &LookupReply) -> Option<String> {
    let city = reply.city.trim();
    let country = reply.country.trim();
    if reply.status != "success" || city.is_empty() || country.is_empty() {
        return None;
    }
    Some(format!("{city}, {country}"))
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}
