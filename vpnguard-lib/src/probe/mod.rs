//! Network Probes (spec.md §4.E): public-IP discovery, geo lookup,
//! DNS-leak probe, latency probe. Every probe here fails soft — a
//! sentinel return plus a logged degradation, never a propagated error
//! (§7 `ProbeUnavailable`).

pub mod dns_leak;
pub mod geo;
pub mod latency;
pub mod public_ip;

pub use dns_leak::DnsLeakProbe;
pub use geo::{GeoLocation, GeoProbe};
pub use latency::latency;
pub use public_ip::PublicIpProbe;
