//! §8 S1 "happy path": a server selected by the Selector feeds a
//! KillSwitchPolicy whose expanded rule set has exactly one accept rule
//! for the VPN endpoint and exactly one UDP + one TCP accept rule per
//! configured DNS server. Exercised here as a chain across the two
//! modules rather than as policy.rs's own isolated unit tests.

use std::net::Ipv4Addr;
use vpnguard_lib::firewall::policy::KillSwitchPolicy;
use vpnguard_lib::selector::ServerSelector;
use vpnguard_lib::server::{Protocol, Quality, VPNServer};

fn candidate(id: &str, score: f64) -> VPNServer {
    VPNServer::new(id, format!("{id}.example.net"), Ipv4Addr::new(203, 0, 113, id.len() as u8), Protocol::WireGuard, 51820)
        .with_location("NL", "Amsterdam")
        .with_quality(Quality { score, latency_ms: Some(20.0), load: Some(10) })
}

#[test]
fn best_selected_server_yields_a_single_accept_rule_pair() {
    let selector = ServerSelector::new(vec![candidate("alpha", 1.0), candidate("beta", 9.0), candidate("gamma", 4.0)]);
    let chosen = selector.best(None).expect("non-empty pool always yields a winner");
    assert_eq!(chosen.id, "beta");

    let mut policy = KillSwitchPolicy::default();
    policy.add_vpn_server(chosen.ip, chosen.protocol, chosen.port);
    for dns in [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)] {
        policy.add_dns(dns);
    }

    let rules = policy.ipv4_rules();

    let vpn_matches = rules.iter().filter(|r| r.args.contains(&chosen.ip.to_string())).count();
    assert_eq!(vpn_matches, 1, "exactly one accept rule for the chosen VPN endpoint");

    for dns in &policy.allowed_dns {
        let dns_matches = rules.iter().filter(|r| r.args.contains(&dns.to_string())).count();
        assert_eq!(dns_matches, 2, "one udp + one tcp accept rule per allowed DNS server");
    }
}

#[test]
fn rotating_to_a_different_server_does_not_drop_the_previous_accept_rule() {
    // the policy is additive across rotations (spec.md §4.G rotate_ip):
    // the old endpoint's rule must stay until the firewall is torn down,
    // since the in-flight disconnect race could still need it.
    let selector = ServerSelector::new(vec![candidate("alpha", 5.0), candidate("beta", 1.0)]);
    let first = selector.best(None).unwrap().clone();
    let second = selector.best(Some(&first.id)).unwrap().clone();
    assert_ne!(first.id, second.id);

    let mut policy = KillSwitchPolicy::default();
    policy.add_vpn_server(first.ip, first.protocol, first.port);
    policy.add_vpn_server(second.ip, second.protocol, second.port);

    assert_eq!(policy.allowed_vpn_servers.len(), 2);
    let rules = policy.ipv4_rules();
    assert!(rules.iter().any(|r| r.args.contains(&first.ip.to_string())));
    assert!(rules.iter().any(|r| r.args.contains(&second.ip.to_string())));
}
