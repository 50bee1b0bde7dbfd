//! Firewall rules for blocked domains.
//!
//! The hosts file only covers name lookups that go through the system
//! resolver. Each blocked domain also gets an outbound block rule on the
//! addresses it currently resolves to, refreshed on a schedule.

use std::collections::BTreeSet;
use std::net::IpAddr;

use tracing::{debug, warn};

use super::{BLOCK_RULE_PREFIX, expand_subdomains};
use crate::os::{FirewallCommand, FirewallRule, OsAdapter, OsResult, RuleAction, RuleTarget};

/// The firewall rule the agent maintains for one blocked domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallBlockRecord {
    /// Blocked domain.
    pub domain: String,
    /// Name of the rule, `EndpointGuard_Block_<domain>`.
    pub rule_name: String,
    /// Addresses the rule blocks.
    pub resolved_ips: Vec<IpAddr>,
}

/// Rule name for a blocked domain.
pub fn rule_name(domain: &str) -> String {
    format!("{}{}", BLOCK_RULE_PREFIX, domain)
}

/// Resolve `domain` and its common subdomains. Names that fail to resolve
/// are skipped.
pub async fn resolve_all(os: &dyn OsAdapter, domain: &str) -> Vec<IpAddr> {
    let mut ips = BTreeSet::new();
    for name in expand_subdomains(domain) {
        match os.resolve_domain(&name).await {
            Ok(found) => ips.extend(found),
            Err(e) => debug!("No addresses for {}: {}", name, e),
        }
    }
    ips.into_iter().collect()
}

/// Replace the block rule for `domain` with one covering its current
/// addresses.
///
/// Returns `None` when nothing resolved; the old rule is deleted in that case
/// and the domain stays ruleless until the next refresh.
pub async fn replace_rule(
    os: &dyn OsAdapter,
    domain: &str,
) -> OsResult<Option<FirewallBlockRecord>> {
    let name = rule_name(domain);
    let ips = resolve_all(os, domain).await;

    os.run_firewall_command(&FirewallCommand::Delete { name: name.clone() })
        .await?;

    if ips.is_empty() {
        warn!("{} did not resolve; firewall rule removed", domain);
        return Ok(None);
    }

    os.run_firewall_command(&FirewallCommand::Add(FirewallRule {
        name: name.clone(),
        action: RuleAction::Block,
        target: RuleTarget::RemoteIps(ips.clone()),
    }))
    .await?;

    debug!("Firewall rule {} blocks {} address(es)", name, ips.len());
    Ok(Some(FirewallBlockRecord {
        domain: domain.to_string(),
        rule_name: name,
        resolved_ips: ips,
    }))
}

/// Delete the block rule for `domain`.
pub async fn delete_rule(os: &dyn OsAdapter, domain: &str) -> OsResult<()> {
    os.run_firewall_command(&FirewallCommand::Delete {
        name: rule_name(domain),
    })
    .await
}

/// Delete every block rule the agent has created.
pub async fn delete_all_rules(os: &dyn OsAdapter) -> OsResult<()> {
    os.run_firewall_command(&FirewallCommand::DeleteByPrefix {
        prefix: BLOCK_RULE_PREFIX.to_string(),
    })
    .await
}
