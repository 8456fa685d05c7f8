//! `KillSwitchPolicy` (spec.md §3) and the ordered rule list it expands
//! into (§4.C step 5). Kept as plain data so the Driver's `apply()` and
//! `verify()` can both walk the same representation instead of
//! re-deriving rule text twice.

use crate::server::Protocol;
use std::net::Ipv4Addr;

/// One `iptables -A ...` invocation, spelled out as argv rather than a
/// shell string so no quoting ambiguity can creep in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub args: Vec<String>,
}

impl Rule {
    fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Rule { args: args.into_iter().map(Into::into).collect() }
    }
}

macro_rules! rule {
    ($($arg:expr),+ $(,)?) => {
        Rule::new([$($arg.to_string()),+])
    };
}

#[derive(Clone, Debug)]
pub struct VpnEndpoint {
    pub ip: Ipv4Addr,
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct KillSwitchPolicy {
    pub allowed_dns: Vec<Ipv4Addr>,
    pub allowed_vpn_servers: Vec<VpnEndpoint>,
    pub primary_interface: String,
    pub backup_interface: String,
    pub local_networks: Vec<String>,
    pub allow_lan: bool,
    pub strict_mode: bool,
}

/// §10 item 1: the original's kill switch ships with a default DNS
/// allow-list rather than starting empty, so a kill switch enabled
/// before any DNS server is explicitly added still permits resolution.
fn default_allowed_dns() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(9, 9, 9, 9)]
}

impl Default for KillSwitchPolicy {
    fn default() -> Self {
        KillSwitchPolicy {
            allowed_dns: default_allowed_dns(),
            allowed_vpn_servers: Vec::new(),
            primary_interface: "tun+".into(),
            backup_interface: "wg+".into(),
            local_networks: Vec::new(),
            allow_lan: true,
            strict_mode: false,
        }
    }
}

impl KillSwitchPolicy {
    pub fn add_vpn_server(&mut self, ip: Ipv4Addr, protocol: Protocol, port: u16) {
        let endpoint_protocol = match protocol {
            Protocol::WireGuard => Protocol::Udp,
            other => other,
        };
        let exists = self.allowed_vpn_servers.iter().any(|e| e.ip == ip && e.protocol == endpoint_protocol && e.port == port);
        if !exists {
            self.allowed_vpn_servers.push(VpnEndpoint { ip, protocol: endpoint_protocol, port });
        }
    }

    pub fn add_dns(&mut self, dns: Ipv4Addr) {
        if !self.allowed_dns.contains(&dns) {
            self.allowed_dns.push(dns);
        }
    }

    /// Expands the policy into the ordered rule list of §4.C step 5.
    /// Order matters: a DROP default policy set before the ACCEPT rules
    /// would discard the connection used to run `iptables` itself on a
    /// remote box, so it always comes last.
    pub fn ipv4_rules(&self) -> Vec<Rule> {
        let mut rules = Vec::new();

        rules.push(rule!("-A", "INPUT", "-i", "lo", "-j", "ACCEPT"));
        rules.push(rule!("-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"));

        rules.push(rule!("-A", "INPUT", "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"));
        rules.push(rule!("-A", "OUTPUT", "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"));

        for iface in [&self.primary_interface, &self.backup_interface] {
            rules.push(rule!("-A", "INPUT", "-i", iface, "-j", "ACCEPT"));
            rules.push(rule!("-A", "OUTPUT", "-o", iface, "-j", "ACCEPT"));
        }

        if self.allow_lan {
            for network in &self.local_networks {
                rules.push(rule!("-A", "INPUT", "-s", network, "-j", "ACCEPT"));
                rules.push(rule!("-A", "OUTPUT", "-d", network, "-j", "ACCEPT"));
            }
        }

        for dns in &self.allowed_dns {
            for proto in ["udp", "tcp"] {
                rules.push(rule!("-A", "OUTPUT", "-d", dns, "-p", proto, "--dport", "53", "-j", "ACCEPT"));
            }
        }

        for endpoint in &self.allowed_vpn_servers {
            rules.push(rule!(
                "-A",
                "OUTPUT",
                "-d",
                endpoint.ip,
                "-p",
                endpoint.protocol,
                "--dport",
                endpoint.port,
                "-j",
                "ACCEPT"
            ));
        }

        rules.push(rule!("-A", "OUTPUT", "-p", "udp", "--dport", "67:68", "-j", "ACCEPT"));
        rules.push(rule!("-A", "INPUT", "-p", "udp", "--sport", "67:68", "-j", "ACCEPT"));

        if !self.strict_mode {
            rules.push(rule!(
                "-A",
                "OUTPUT",
                "-p",
                "icmp",
                "--icmp-type",
                "echo-request",
                "-m",
                "limit",
                "--limit",
                "5/sec",
                "-j",
                "ACCEPT"
            ));
            rules.push(rule!("-A", "INPUT", "-p", "icmp", "--icmp-type", "echo-reply", "-j", "ACCEPT"));
        }

        rules.push(rule!("-A", "OUTPUT", "-m", "limit", "--limit", "2/min", "-j", "LOG", "--log-prefix", "KS-DROP-OUT: ", "--log-level", "4"));
        rules.push(rule!("-A", "INPUT", "-m", "limit", "--limit", "2/min", "-j", "LOG", "--log-prefix", "KS-DROP-IN: ", "--log-level", "4"));

        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_loopback_and_tunnel_rules() {
        let policy = KillSwitchPolicy::default();
        let rules = policy.ipv4_rules();
        assert!(rules.iter().any(|r| r.args.contains(&"lo".to_string())));
        assert!(rules.iter().any(|r| r.args.contains(&"tun+".to_string())));
        assert!(rules.iter().any(|r| r.args.contains(&"wg+".to_string())));
    }

    #[test]
    fn strict_mode_omits_icmp_rules() {
        let mut policy = KillSwitchPolicy::default();
        policy.strict_mode = true;
        let rules = policy.ipv4_rules();
        assert!(!rules.iter().any(|r| r.args.contains(&"icmp".to_string())));
    }

    #[test]
    fn vpn_server_produces_exactly_one_accept_rule() {
        let mut policy = KillSwitchPolicy::default();
        policy.add_vpn_server(Ipv4Addr::new(198, 51, 100, 10), Protocol::Udp, 1194);
        let rules = policy.ipv4_rules();
        let matches: Vec<_> = rules.iter().filter(|r| r.args.contains(&"198.51.100.10".to_string())).collect();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].args.contains(&"1194".to_string()));
    }

    #[test]
    fn dns_server_produces_udp_and_tcp_accept_rules() {
        let mut policy = KillSwitchPolicy::default();
        policy.add_dns(Ipv4Addr::new(1, 1, 1, 1));
        let rules = policy.ipv4_rules();
        let matches: Vec<_> = rules.iter().filter(|r| r.args.contains(&"1.1.1.1".to_string())).collect();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn add_vpn_server_is_idempotent() {
        let mut policy = KillSwitchPolicy::default();
        policy.add_vpn_server(Ipv4Addr::new(1, 2, 3, 4), Protocol::Tcp, 443);
        policy.add_vpn_server(Ipv4Addr::new(1, 2, 3, 4), Protocol::Tcp, 443);
        assert_eq!(policy.allowed_vpn_servers.len(), 1);
    }

    #[test]
    fn wireguard_endpoints_are_filtered_as_udp() {
        let mut policy = KillSwitchPolicy::default();
        policy.add_vpn_server(Ipv4Addr::new(10, 0, 0, 1), Protocol::WireGuard, 51820);
        assert_eq!(policy.allowed_vpn_servers[0].protocol, Protocol::Udp);
    }
}
