//! `geo_location(ip)` (spec.md §4.E). A single lookup service; any
//! failure degrades to `{location: "Unknown"}`, matching the original's
//! blanket `except` around `get_geo_location`.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location: String,
}

impl GeoLocation {
    fn unknown() -> Self {
        GeoLocation { country: None, region: None, city: None, isp: None, latitude: None, longitude: None, location: "Unknown".into() }
    }
}

#[derive(Deserialize)]
struct IpApiResponse {
    country: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

pub struct GeoProbe {
    client: reqwest::Client,
}

impl Default for GeoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoProbe {
    pub fn new() -> Self {
        GeoProbe { client: reqwest::Client::builder().timeout(TIMEOUT).build().unwrap_or_default() }
    }

    pub async fn geo_location(&self, ip: Ipv4Addr) -> GeoLocation {
        let url = format!("http://ip-api.com/json/{ip}");
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.json::<IpApiResponse>().await {
                Ok(data) => {
                    let location = format!("{}, {}", data.city.as_deref().unwrap_or(""), data.country.as_deref().unwrap_or(""));
                    GeoLocation { country: data.country, region: data.region_name, city: data.city, isp: data.isp, latitude: data.lat, longitude: data.lon, location }
                }
                Err(err) => {
                    tracing::debug!(%err, %ip, "geo lookup body decode failed");
                    GeoLocation::unknown()
                }
            },
            Err(err) => {
                tracing::debug!(%err, %ip, "geo lookup request failed");
                GeoLocation::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_location_has_sentinel_string() {
        let unknown = GeoLocation::unknown();
        assert_eq!(unknown.location, "Unknown");
        assert!(unknown.country.is_none());
    }
}
