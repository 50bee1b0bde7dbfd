//! Web blocking.
//!
//! Blocked domains are enforced three ways:
//!
//! - **Hosts file**: a marker-delimited block mapping each domain and its
//!   common subdomains to loopback ([`hosts`]).
//! - **Firewall**: an outbound block rule per domain on its resolved
//!   addresses, refreshed on a schedule ([`firewall`]).
//! - **DNS proxy**: optional loopback resolver answering NXDOMAIN for blocked
//!   names ([`dns_proxy`]), used instead of the hosts block when the policy's
//!   blocking method is `dns_proxy`.
//!
//! Browser DNS-over-HTTPS is switched off by policy so none of these can be
//! bypassed ([`doh`]).
//!
//! While running, the controller also keeps a log of established connections
//! and per-process I/O totals ([`monitor`]).

mod controller;
pub mod dns;
pub mod dns_proxy;
pub mod doh;
mod error;
pub mod firewall;
pub mod hosts;
pub mod monitor;

use std::collections::BTreeSet;

pub use controller::{NetworkOptions, NetworkPolicyController};
pub use dns_proxy::{DnsProxy, DnsProxyConfig};
pub use error::DnsError;
pub use firewall::FirewallBlockRecord;
pub use monitor::{ConnectionRecord, ProcessTraffic, CONNECTION_LOG_CAPACITY};

/// Subdomains blocked alongside every domain.
pub const COMMON_SUBDOMAINS: [&str; 6] = ["www", "m", "api", "mail", "static", "dev"];

/// Name prefix of every per-domain firewall rule.
pub const BLOCK_RULE_PREFIX: &str = "EndpointGuard_Block_";

/// `domain` followed by its common subdomains, unless it already is one.
pub fn expand_subdomains(domain: &str) -> Vec<String> {
    let mut names = vec![domain.to_string()];
    let is_common_sub = COMMON_SUBDOMAINS
        .iter()
        .any(|sub| domain.strip_prefix(sub).is_some_and(|rest| rest.starts_with('.')));

    if !is_common_sub {
        names.extend(COMMON_SUBDOMAINS.iter().map(|sub| format!("{}.{}", sub, domain)));
    }
    names
}

/// Whether `domain` or one of its parent domains is in `blocked`.
///
/// `a.b.c` is checked as `a.b.c`, `b.c`, then `c`. There is no wildcard
/// matching.
pub fn is_blocked(blocked: &BTreeSet<String>, domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let mut candidate = domain.as_str();
    loop {
        if blocked.contains(candidate) {
            return true;
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => return false,
        }
    }
}
