//! Server Selector (spec.md §4.F). A pure in-memory filter over a
//! `Vec<VPNServer>` — no subprocess, no I/O, so it is the simplest
//! component to test exhaustively.

use crate::server::{Protocol, VPNServer};
use rand::seq::IndexedRandom;

#[derive(Clone, Debug, Default)]
pub struct Filter<'a> {
    pub country: Option<&'a str>,
    pub protocol: Option<Protocol>,
    pub location_substring: Option<&'a str>,
    pub port: Option<u16>,
    pub hostname_substring: Option<&'a str>,
}

#[derive(Clone, Debug, Default)]
pub struct ServerSelector {
    servers: Vec<VPNServer>,
}

impl ServerSelector {
    pub fn new(servers: Vec<VPNServer>) -> Self {
        ServerSelector { servers }
    }

    pub fn all(&self) -> &[VPNServer] {
        &self.servers
    }

    pub fn by_country(&self, country: &str) -> Vec<&VPNServer> {
        self.servers.iter().filter(|s| s.country.as_deref() == Some(country)).collect()
    }

    pub fn find(&self, filter: &Filter) -> Vec<&VPNServer> {
        self.servers
            .iter()
            .filter(|s| filter.country.is_none_or(|c| s.country.as_deref() == Some(c)))
            .filter(|s| filter.protocol.is_none_or(|p| s.protocol == p))
            .filter(|s| filter.port.is_none_or(|p| s.port == p))
            .filter(|s| {
                filter.location_substring.is_none_or(|needle| {
                    let haystack = format!("{} {}", s.city.as_deref().unwrap_or(""), s.country.as_deref().unwrap_or(""));
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                })
            })
            .filter(|s| filter.hostname_substring.is_none_or(|needle| s.hostname.to_lowercase().contains(&needle.to_lowercase())))
            .collect()
    }

    pub fn random(&self) -> Option<&VPNServer> {
        self.servers.choose(&mut rand::rng())
    }

    /// §4.F: "best" = min over `(-score, latency ?? +inf)` — higher
    /// score wins; ties broken by lower latency; unknown latency loses
    /// to any known latency.
    pub fn best(&self, exclude_id: Option<&str>) -> Option<&VPNServer> {
        self.servers
            .iter()
            .filter(|s| exclude_id.is_none_or(|id| s.id != id))
            .max_by(|a, b| {
                a.quality
                    .score
                    .partial_cmp(&b.quality.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        let latency_rank = |s: &VPNServer| s.quality.latency_ms.unwrap_or(f64::INFINITY);
                        latency_rank(b).partial_cmp(&latency_rank(a)).unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server(id: &str, country: &str, score: f64, latency: Option<f64>) -> VPNServer {
        VPNServer::new(id, format!("{id}.example.net"), Ipv4Addr::new(198, 51, 100, 10), Protocol::Udp, 1194)
            .with_location(country, "City")
            .with_quality(crate::server::Quality { score, latency_ms: latency, load: None })
    }

    #[test]
    fn by_country_filters_exactly() {
        let sel = ServerSelector::new(vec![server("a", "NL", 1.0, None), server("b", "US", 1.0, None)]);
        assert_eq!(sel.by_country("NL").len(), 1);
    }

    #[test]
    fn best_prefers_higher_score() {
        let sel = ServerSelector::new(vec![server("a", "NL", 1.0, None), server("b", "NL", 5.0, None)]);
        assert_eq!(sel.best(None).unwrap().id, "b");
    }

    #[test]
    fn best_breaks_ties_with_lower_latency() {
        let sel = ServerSelector::new(vec![server("a", "NL", 3.0, Some(50.0)), server("b", "NL", 3.0, Some(10.0))]);
        assert_eq!(sel.best(None).unwrap().id, "b");
    }

    #[test]
    fn best_unknown_latency_loses_to_known_latency_at_equal_score() {
        let sel = ServerSelector::new(vec![server("a", "NL", 3.0, None), server("b", "NL", 3.0, Some(999.0))]);
        assert_eq!(sel.best(None).unwrap().id, "b");
    }

    #[test]
    fn best_excludes_current_server() {
        let sel = ServerSelector::new(vec![server("a", "NL", 5.0, None), server("b", "NL", 1.0, None)]);
        assert_eq!(sel.best(Some("a")).unwrap().id, "b");
    }

    #[test]
    fn find_combines_filters() {
        let sel = ServerSelector::new(vec![server("a", "NL", 1.0, None), server("b", "US", 1.0, None)]);
        let filter = Filter { country: Some("US"), ..Default::default() };
        let found = sel.find(&filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");
    }
}
