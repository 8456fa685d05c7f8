//! `public_ip()` (spec.md §4.E). Tries a small ordered list of HTTPS
//! echo services, same list and fallback order as the original's
//! `get_public_ip`, caching the most recent success for five minutes.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SERVICES: &[&str] = &["https://api.ipify.org", "https://icanhazip.com", "https://checkip.amazonaws.com", "https://ifconfig.me/ip"];
const TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_DURATION: Duration = Duration::from_secs(300);

struct Cache {
    ip: Ipv4Addr,
    at: Instant,
    service: &'static str,
}

pub struct PublicIpProbe {
    client: reqwest::Client,
    cache: Mutex<Option<Cache>>,
}

impl Default for PublicIpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicIpProbe {
    pub fn new() -> Self {
        PublicIpProbe { client: reqwest::Client::builder().timeout(TIMEOUT).build().unwrap_or_default(), cache: Mutex::new(None) }
    }

    /// §4.E: validation is "address parses and is globally routable".
    fn is_valid(ip: &Ipv4Addr) -> bool {
        !ip.is_private() && !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified() && !ip.is_broadcast() && !ip.is_documentation()
    }

    pub async fn public_ip(&self, force: bool) -> Option<Ipv4Addr> {
        self.public_ip_with_source(force).await.map(|(ip, _service)| ip)
    }

    /// Same lookup as [`Self::public_ip`], but also names which service in
    /// `SERVICES` answered (spec.md §11 Open Question resolution: leak
    /// confirmation requires two consecutive mismatches drawn from
    /// *different* services, so the caller needs to know which one
    /// answered on a given tick).
    pub async fn public_ip_with_source(&self, force: bool) -> Option<(Ipv4Addr, &'static str)> {
        if !force {
            if let Some(cache) = self.cache.lock().expect("cache mutex poisoned").as_ref() {
                if cache.at.elapsed() < CACHE_DURATION {
                    return Some((cache.ip, cache.service));
                }
            }
        }

        for service in SERVICES {
            match self.client.get(*service).send().await {
                Ok(resp) => match resp.text().await {
                    Ok(body) => {
                        let trimmed = body.trim();
                        if let Ok(ip) = trimmed.parse::<Ipv4Addr>() {
                            if Self::is_valid(&ip) {
                                *self.cache.lock().expect("cache mutex poisoned") = Some(Cache { ip, at: Instant::now(), service });
                                return Some((ip, service));
                            }
                        }
                    }
                    Err(err) => tracing::debug!(%err, %service, "public ip probe body read failed"),
                },
                Err(err) => tracing::debug!(%err, %service, "public ip probe request failed"),
            }
        }

        tracing::warn!("all public IP echo services failed");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_and_loopback_addresses() {
        assert!(!PublicIpProbe::is_valid(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!PublicIpProbe::is_valid(&Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!PublicIpProbe::is_valid(&Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn accepts_globally_routable_address() {
        assert!(PublicIpProbe::is_valid(&Ipv4Addr::new(8, 8, 8, 8)));
    }
}
