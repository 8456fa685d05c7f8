//! `dns_leak_probe(expected_dns)` (spec.md §4.E). Resolves a small set
//! of "echo" domains that return the resolver's own address, reverse
//! looks up each answer, and reports resolvers not matching any
//! expected entry by substring — same test-domain list and substring
//! match as the original's `check_dns_leak`.

use hickory_resolver::TokioAsyncResolver;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

const TEST_DOMAINS: &[&str] = &["whoami.akamai.net", "myip.opendns.com"];
const TIMEOUT: Duration = Duration::from_secs(5);

/// §4.E: "if no expected entry matches by substring, it's a leak."
fn matches_expected(candidate: &str, expected: &[String]) -> bool {
    expected.iter().any(|e| candidate.contains(e.as_str()) || e.contains(candidate))
}

/// Pure decision function, split out from [`probe`] so the substring
/// matching logic is unit testable without a resolver.
pub fn unexpected_resolvers(found: &BTreeSet<String>, expected_dns: &[Ipv4Addr]) -> BTreeSet<String> {
    let expected: Vec<String> = expected_dns.iter().map(|ip| ip.to_string()).collect();
    found.iter().filter(|candidate| !matches_expected(candidate, &expected)).cloned().collect()
}

pub struct DnsLeakProbe {
    resolver: Option<TokioAsyncResolver>,
}

impl Default for DnsLeakProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsLeakProbe {
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => Some(r),
            Err(err) => {
                tracing::warn!(%err, "DNS leak detection limited - system resolver unavailable");
                None
            }
        };
        DnsLeakProbe { resolver }
    }

    pub async fn probe(&self, expected_dns: &[Ipv4Addr]) -> BTreeSet<String> {
        let Some(resolver) = &self.resolver else {
            return BTreeSet::new();
        };

        let mut found = BTreeSet::new();
        for domain in TEST_DOMAINS {
            let lookup = tokio::time::timeout(TIMEOUT, resolver.ipv4_lookup(*domain)).await;
            let Ok(Ok(answers)) = lookup else {
                continue;
            };
            for answer in answers.iter() {
                let ip = std::net::IpAddr::V4(answer.0);
                match tokio::time::timeout(TIMEOUT, resolver.reverse_lookup(ip)).await {
                    Ok(Ok(reverse)) => {
                        if let Some(name) = reverse.iter().next() {
                            found.insert(name.to_string());
                        } else {
                            found.insert(ip.to_string());
                        }
                    }
                    _ => {
                        found.insert(ip.to_string());
                    }
                }
            }
        }

        unexpected_resolvers(&found, expected_dns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_resolver_is_not_a_leak() {
        let mut found = BTreeSet::new();
        found.insert("1.1.1.1".to_string());
        let result = unexpected_resolvers(&found, &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(result.is_empty());
    }

    #[test]
    fn unlisted_resolver_is_a_leak() {
        let mut found = BTreeSet::new();
        found.insert("203.0.113.4".to_string());
        let result = unexpected_resolvers(&found, &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn substring_match_on_hostname_counts_as_expected() {
        let mut found = BTreeSet::new();
        found.insert("dns1.1.1.1.cloudflare-dns.com".to_string());
        let result = unexpected_resolvers(&found, &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(result.is_empty());
    }
}
