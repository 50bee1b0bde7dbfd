//! Network policy controller.
//!
//! Owns the block set and converges the hosts file, the per-domain firewall
//! rules and the optional DNS proxy onto it. The block set is also published
//! on a watch channel so the proxy sees changes without taking a lock.
//!
//! A separate monitor task samples open connections and process I/O
//! counters. It never changes machine state.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::dns_proxy::{DnsProxy, DnsProxyConfig};
use super::firewall::{self, FirewallBlockRecord};
use super::hosts::{detect_newline, render_block, splice};
use super::monitor::{ConnectionLog, ConnectionRecord, ProcessTraffic, TrafficTable};
use super::{doh, is_blocked};
use crate::config::{millis_or, secs_or, Config};
use crate::os::{OsAdapter, OsResult};
use crate::policy::{normalize_domain, BlockingMethod, PolicySnapshot, PolicyState};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::workers::{shutdown_signalled, Workers};

/// Tuning for the network controller.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Interval between firewall resolution cycles.
    pub firewall_refresh: Duration,
    /// DNS proxy listen address.
    pub dns_listen: SocketAddr,
    /// Upstream resolver for the DNS proxy.
    pub dns_upstream: SocketAddr,
    /// Upstream timeout for the DNS proxy.
    pub dns_upstream_timeout: Duration,
    /// Disable browser DNS-over-HTTPS while running.
    pub disable_doh: bool,
    /// Log established connections while running.
    pub log_connections: bool,
    /// Sample per-process I/O counters while running.
    pub track_bandwidth: bool,
    /// Interval between connection and counter samples.
    pub monitor_interval: Duration,
    /// How long `stop()` waits for each task.
    pub stop_timeout: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            firewall_refresh: Duration::from_secs(30 * 60),
            dns_listen: SocketAddr::from(([127, 0, 0, 1], 53)),
            dns_upstream: SocketAddr::from(([8, 8, 8, 8], 53)),
            dns_upstream_timeout: Duration::from_secs(5),
            disable_doh: true,
            log_connections: true,
            track_bandwidth: true,
            monitor_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl NetworkOptions {
    /// Build options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let network = &config.network;

        let addr = |raw: &str, fallback: SocketAddr, what: &str| {
            if raw.is_empty() {
                return fallback;
            }
            raw.parse().unwrap_or_else(|_| {
                warn!("Invalid {} '{}', using {}", what, raw, fallback);
                fallback
            })
        };

        Self {
            firewall_refresh: secs_or(network.firewall_refresh_secs, defaults.firewall_refresh),
            dns_listen: addr(&network.dns_listen, defaults.dns_listen, "dns_listen"),
            dns_upstream: addr(&network.dns_upstream, defaults.dns_upstream, "dns_upstream"),
            dns_upstream_timeout: millis_or(
                network.dns_upstream_timeout_ms,
                defaults.dns_upstream_timeout,
            ),
            disable_doh: network.disable_doh.unwrap_or(defaults.disable_doh),
            log_connections: network.log_connections.unwrap_or(defaults.log_connections),
            track_bandwidth: network.track_bandwidth.unwrap_or(defaults.track_bandwidth),
            monitor_interval: secs_or(network.monitor_interval_secs, defaults.monitor_interval),
            stop_timeout: config.agent.stop_timeout(),
        }
    }
}

struct NetworkState {
    blocked: BTreeSet<String>,
    method: BlockingMethod,
    firewall: BTreeMap<String, FirewallBlockRecord>,
}

/// Converges hosts file, firewall and DNS proxy onto the block set.
pub struct NetworkPolicyController {
    os: Arc<dyn OsAdapter>,
    audit: Arc<AuditLogger>,
    options: NetworkOptions,
    state: Mutex<NetworkState>,
    blocked_tx: watch::Sender<Arc<BTreeSet<String>>>,
    connections: Mutex<ConnectionLog>,
    traffic: Mutex<TrafficTable>,
    workers: Mutex<Option<Workers>>,
    proxy: Mutex<Option<Workers>>,
}

impl NetworkPolicyController {
    /// Create a stopped controller with an empty block set.
    pub fn new(os: Arc<dyn OsAdapter>, audit: Arc<AuditLogger>, options: NetworkOptions) -> Self {
        let (blocked_tx, _) = watch::channel(Arc::new(BTreeSet::new()));
        Self {
            os,
            audit,
            options,
            state: Mutex::new(NetworkState {
                blocked: BTreeSet::new(),
                method: BlockingMethod::Hosts,
                firewall: BTreeMap::new(),
            }),
            blocked_tx,
            connections: Mutex::new(ConnectionLog::default()),
            traffic: Mutex::new(TrafficTable::default()),
            workers: Mutex::new(None),
            proxy: Mutex::new(None),
        }
    }

    /// Replace the block set and rewrite the hosts block.
    ///
    /// Domains are normalized (lowercased, `*.` stripped); invalid entries
    /// are skipped. Firewall rules of domains that left the set are deleted;
    /// rules for new domains are created by [`refresh_domains`](Self::refresh_domains)
    /// or the next resolution cycle.
    pub async fn apply<I, S>(&self, domains: I) -> OsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = BTreeSet::new();
        for raw in domains {
            match normalize_domain(raw.as_ref()) {
                Some(domain) => {
                    normalized.insert(domain);
                }
                None => warn!("Skipping invalid domain {:?}", raw.as_ref()),
            }
        }

        let mut state = self.state.lock().await;
        let removed: Vec<String> = state.blocked.difference(&normalized).cloned().collect();
        for domain in normalized.difference(&state.blocked) {
            self.audit.log(AuditEvent::SiteBlocked {
                domain: domain.clone(),
            });
        }
        for domain in &removed {
            self.audit.log(AuditEvent::SiteUnblocked {
                domain: domain.clone(),
            });
        }

        state.blocked = normalized;
        self.publish(&state);
        info!("Applying {} blocked domain(s)", state.blocked.len());

        for domain in &removed {
            state.firewall.remove(domain);
            if let Err(e) = firewall::delete_rule(self.os.as_ref(), domain).await {
                warn!("Failed to delete firewall rule for {}: {}", domain, e);
            }
        }

        self.sync_hosts(&state).await
    }

    /// Add one domain. Returns `false` if it was invalid or already blocked.
    pub async fn add_blocked_site(&self, domain: &str) -> OsResult<bool> {
        let Some(domain) = normalize_domain(domain) else {
            warn!("Refusing to block invalid domain {:?}", domain);
            return Ok(false);
        };

        let mut state = self.state.lock().await;
        if !state.blocked.insert(domain.clone()) {
            return Ok(false);
        }
        self.publish(&state);
        self.audit.log(AuditEvent::SiteBlocked {
            domain: domain.clone(),
        });
        info!("Blocked {}", domain);

        let hosts_result = self.sync_hosts(&state).await;
        match firewall::replace_rule(self.os.as_ref(), &domain).await {
            Ok(Some(record)) => {
                state.firewall.insert(domain, record);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to add firewall rule for {}: {}", domain, e),
        }

        hosts_result.map(|_| true)
    }

    /// Remove one domain. Returns `false` if it was not blocked.
    pub async fn remove_blocked_site(&self, domain: &str) -> OsResult<bool> {
        let Some(domain) = normalize_domain(domain) else {
            return Ok(false);
        };

        let mut state = self.state.lock().await;
        if !state.blocked.remove(&domain) {
            return Ok(false);
        }
        self.publish(&state);
        self.audit.log(AuditEvent::SiteUnblocked {
            domain: domain.clone(),
        });
        info!("Unblocked {}", domain);

        state.firewall.remove(&domain);
        let hosts_result = self.sync_hosts(&state).await;
        firewall::delete_rule(self.os.as_ref(), &domain).await?;

        hosts_result.map(|_| true)
    }

    /// Whether `domain` or one of its parent domains is blocked.
    pub fn is_site_blocked(&self, domain: &str) -> bool {
        is_blocked(&self.blocked_tx.borrow(), domain)
    }

    /// The current block set, sorted.
    pub fn blocked_domains(&self) -> Vec<String> {
        self.blocked_tx.borrow().iter().cloned().collect()
    }

    /// Firewall rules currently in place, by domain.
    pub async fn firewall_records(&self) -> Vec<FirewallBlockRecord> {
        self.state.lock().await.firewall.values().cloned().collect()
    }

    /// Re-resolve and replace the firewall rules of `domains`.
    ///
    /// Domains that are no longer blocked by the time their resolution
    /// finishes have their rule deleted again.
    pub async fn refresh_domains(&self, domains: &[String]) {
        for domain in domains {
            let result = firewall::replace_rule(self.os.as_ref(), domain).await;

            let mut state = self.state.lock().await;
            match result {
                Ok(_) if !state.blocked.contains(domain) => {
                    state.firewall.remove(domain);
                    if let Err(e) = firewall::delete_rule(self.os.as_ref(), domain).await {
                        warn!("Failed to delete stale rule for {}: {}", domain, e);
                    }
                }
                Ok(Some(record)) => {
                    state.firewall.insert(domain.clone(), record);
                }
                Ok(None) => {
                    state.firewall.remove(domain);
                }
                Err(e) => {
                    warn!("Firewall refresh failed for {}: {}", domain, e);
                }
            }
        }
    }

    /// One resolution cycle: re-converge the hosts block, then replace every
    /// domain's firewall rule.
    pub async fn refresh(&self) {
        let domains: Vec<String> = {
            let state = self.state.lock().await;
            if let Err(e) = self.sync_hosts(&state).await {
                warn!("Hosts file not converged: {}", e);
            }
            state.blocked.iter().cloned().collect()
        };

        debug!("Refreshing firewall rules for {} domain(s)", domains.len());
        self.refresh_domains(&domains).await;
    }

    /// Take one connection and I/O counter sample.
    ///
    /// Sampling that is switched off in the options is skipped. Failures are
    /// logged and leave the previous sample in place.
    pub async fn sample_activity(&self) {
        if self.options.log_connections {
            match self.os.list_connections().await {
                Ok(sample) => {
                    let added = self.connections.lock().await.record(&sample, Utc::now());
                    for record in &added {
                        let c = &record.connection;
                        debug!(
                            "Connection: {} ({}) -> {}:{}",
                            c.process_name.as_deref().unwrap_or("unknown"),
                            c.pid,
                            c.remote_address,
                            c.remote_port
                        );
                    }
                }
                Err(e) => warn!("Failed to list connections: {}", e),
            }
        }

        if self.options.track_bandwidth {
            match self.os.process_io_counters().await {
                Ok(sample) => self.traffic.lock().await.update(sample, Utc::now()),
                Err(e) => warn!("Failed to read process I/O counters: {}", e),
            }
        }
    }

    /// Up to `limit` most recently seen connections, oldest first.
    pub async fn recent_connections(&self, limit: usize) -> Vec<ConnectionRecord> {
        self.connections.lock().await.recent(limit)
    }

    /// Latest I/O totals by process image name.
    pub async fn traffic_by_process(&self) -> BTreeMap<String, ProcessTraffic> {
        self.traffic.lock().await.by_process()
    }

    /// Switch between hosts-file and DNS-proxy blocking.
    ///
    /// The hosts block is only kept while the method is `hosts`; the proxy
    /// only runs while it is `dns_proxy`.
    pub async fn set_blocking_method(&self, method: BlockingMethod) {
        {
            let mut state = self.state.lock().await;
            if state.method != method {
                info!("Blocking method changed to {:?}", method);
                state.method = method;
                if let Err(e) = self.sync_hosts(&state).await {
                    warn!("Hosts file not converged: {}", e);
                }
            }
        }

        let mut proxy = self.proxy.lock().await;
        match (method, proxy.is_some()) {
            (BlockingMethod::DnsProxy, false) => {
                *proxy = self.start_proxy().await;
            }
            (BlockingMethod::Hosts, true) => {
                if let Some(workers) = proxy.take() {
                    workers.stop(self.options.stop_timeout).await;
                }
            }
            _ => {}
        }
    }

    /// Start enforcing `policy` and keep following it.
    ///
    /// Does nothing if already running. Failures are logged; the loops keep
    /// retrying.
    pub async fn start(self: &Arc<Self>, policy: &PolicyState) {
        let mut running = self.workers.lock().await;
        if running.is_some() {
            debug!("Network controller already running");
            return;
        }

        if self.options.disable_doh
            && let Err(e) = doh::disable(self.os.as_ref()).await
        {
            warn!("Failed to disable browser DNS-over-HTTPS: {}", e);
        }

        let snapshot = policy.current();
        self.set_blocking_method(snapshot.blocking_method).await;
        if let Err(e) = self.apply(snapshot.effective_blocked_domains()).await {
            warn!("Initial hosts update failed: {}", e);
        }

        let mut workers = Workers::new();

        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        workers.spawn("network-refresh", async move {
            this.run_refresh_loop(shutdown_rx).await;
        });

        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        let policy_rx = policy.subscribe();
        workers.spawn("network-policy", async move {
            this.run_policy_loop(policy_rx, shutdown_rx).await;
        });

        if self.options.log_connections || self.options.track_bandwidth {
            let this = self.clone();
            let shutdown_rx = workers.shutdown_rx();
            workers.spawn("network-monitor", async move {
                this.run_monitor_loop(shutdown_rx).await;
            });
        }

        *running = Some(workers);
        info!("Network controller started");
    }

    /// Stop the loops and the proxy, delete every block rule and remove the
    /// hosts block. Safe to call repeatedly, and before `start()`.
    pub async fn stop(&self) {
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop(self.options.stop_timeout).await;
        }
        if let Some(proxy) = self.proxy.lock().await.take() {
            proxy.stop(self.options.stop_timeout).await;
        }

        let mut state = self.state.lock().await;
        state.blocked.clear();
        state.firewall.clear();
        self.publish(&state);

        if let Err(e) = firewall::delete_all_rules(self.os.as_ref()).await {
            error!("Failed to delete firewall block rules: {}", e);
        }
        if let Err(e) = self.sync_hosts(&state).await {
            error!("Failed to remove hosts block: {}", e);
        }
        if self.options.disable_doh
            && let Err(e) = doh::restore(self.os.as_ref()).await
        {
            warn!("Failed to restore browser DNS-over-HTTPS policy: {}", e);
        }

        info!("Network controller stopped");
    }

    async fn run_refresh_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.firewall_refresh);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh().await,
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }

    async fn run_monitor_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.sample_activity().await,
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }

    async fn run_policy_loop(
        &self,
        mut policy_rx: watch::Receiver<Arc<PolicySnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = policy_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = policy_rx.borrow_and_update().clone();
                    self.follow_policy(&snapshot).await;
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }

    async fn follow_policy(&self, snapshot: &PolicySnapshot) {
        self.set_blocking_method(snapshot.blocking_method).await;

        let effective = snapshot.effective_blocked_domains();
        let current: BTreeSet<String> = (**self.blocked_tx.borrow()).clone();
        if effective == current {
            return;
        }

        let added: Vec<String> = effective.difference(&current).cloned().collect();
        if let Err(e) = self.apply(effective).await {
            warn!("Hosts file not converged after policy v{}: {}", snapshot.version, e);
        }
        self.refresh_domains(&added).await;
    }

    async fn start_proxy(&self) -> Option<Workers> {
        let mut workers = Workers::new();
        let config = DnsProxyConfig {
            listen: self.options.dns_listen,
            upstream: self.options.dns_upstream,
            upstream_timeout: self.options.dns_upstream_timeout,
            blocked: self.blocked_tx.subscribe(),
            audit: self.audit.clone(),
        };

        let proxy = match DnsProxy::bind(config, workers.shutdown_rx()).await {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("DNS proxy not started: {}", e);
                return None;
            }
        };

        workers.spawn("dns-proxy", async move {
            if let Err(e) = proxy.run().await {
                error!("DNS proxy failed: {}", e);
            }
        });
        Some(workers)
    }

    fn publish(&self, state: &NetworkState) {
        self.blocked_tx.send_replace(Arc::new(state.blocked.clone()));
    }

    /// Make the hosts block match the state. Skips the write (and the DNS
    /// flush) when the file would not change.
    async fn sync_hosts(&self, state: &NetworkState) -> OsResult<()> {
        let empty = BTreeSet::new();
        let domains = match state.method {
            BlockingMethod::Hosts => &state.blocked,
            BlockingMethod::DnsProxy => &empty,
        };

        let current = self.os.read_hosts_file().await?;
        let block = render_block(domains, detect_newline(&current));
        let updated = splice(&current, block.as_deref());
        if updated == current {
            debug!("Hosts file already up to date");
            return Ok(());
        }

        self.os.write_hosts_file(&updated).await?;
        if let Err(e) = self.os.flush_dns_cache().await {
            warn!("Failed to flush DNS cache: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::hosts::{current_block, END_MARKER, START_MARKER};
    use crate::os::{
        ConnectionInfo, FirewallCommand, FirewallRule, MemoryOs, OsOp, ProcessIo, Protocol,
        RuleAction, RuleTarget,
    };
    use std::net::{IpAddr, Ipv4Addr};

    const HOSTS: &str = "127.0.0.1 localhost\n";

    fn controller(os: &Arc<MemoryOs>) -> Arc<NetworkPolicyController> {
        Arc::new(NetworkPolicyController::new(
            os.clone(),
            Arc::new(AuditLogger::new_null()),
            NetworkOptions {
                dns_listen: "127.0.0.1:0".parse().unwrap(),
                stop_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ))
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn connection(pid: u32, remote: &str, state: &str) -> ConnectionInfo {
        ConnectionInfo {
            pid,
            process_name: Some("chrome.exe".to_string()),
            protocol: Protocol::Tcp,
            local_address: "10.0.0.5".to_string(),
            local_port: 51544,
            remote_address: remote.to_string(),
            remote_port: 443,
            state: state.to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_writes_sorted_block_and_flushes() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);

        network.apply(["Zeta.com", "*.alpha.com"]).await.unwrap();

        let hosts = os.hosts();
        assert!(hosts.starts_with(HOSTS));
        let alpha = hosts.find("127.0.0.1 alpha.com").unwrap();
        let zeta = hosts.find("127.0.0.1 zeta.com").unwrap();
        assert!(alpha < zeta);
        assert_eq!(os.dns_flushes(), 1);
        assert_eq!(network.blocked_domains(), vec!["alpha.com", "zeta.com"]);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);

        network.apply(["example.com"]).await.unwrap();
        let first = os.hosts();
        network.apply(["example.com"]).await.unwrap();

        assert_eq!(os.hosts(), first);
        assert_eq!(os.dns_flushes(), 1);
    }

    #[tokio::test]
    async fn test_apply_empty_removes_block() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);

        network.apply(["example.com"]).await.unwrap();
        network.apply(Vec::<String>::new()).await.unwrap();

        assert_eq!(os.hosts(), HOSTS);
        assert!(!os.hosts().contains(START_MARKER));
    }

    #[tokio::test]
    async fn test_add_then_remove_restores() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        os.set_resolution("reddit.com", vec![ip(7)]);
        let network = controller(&os);
        network.apply(["facebook.com"]).await.unwrap();
        let before_hosts = os.hosts();
        let before_set = network.blocked_domains();

        assert!(network.add_blocked_site("Reddit.com").await.unwrap());
        assert!(network.is_site_blocked("www.reddit.com"));
        assert!(os.firewall_rule("EndpointGuard_Block_reddit.com").is_some());
        assert!(!network.add_blocked_site("reddit.com").await.unwrap());

        assert!(network.remove_blocked_site("reddit.com").await.unwrap());
        assert_eq!(os.hosts(), before_hosts);
        assert_eq!(network.blocked_domains(), before_set);
        assert!(os.firewall_rule("EndpointGuard_Block_reddit.com").is_none());
        assert!(!network.remove_blocked_site("reddit.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_invalid_domain() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);
        assert!(!network.add_blocked_site("not a domain").await.unwrap());
        assert!(network.blocked_domains().is_empty());
    }

    #[tokio::test]
    async fn test_hosts_failure_keeps_set_and_converges_on_refresh() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);

        os.fail(OsOp::WriteHosts);
        assert!(network.apply(["example.com"]).await.is_err());
        assert!(network.is_site_blocked("example.com"));
        assert_eq!(os.hosts(), HOSTS);

        os.heal(OsOp::WriteHosts);
        network.refresh().await;
        assert!(current_block(&os.hosts()).is_some());
    }

    #[tokio::test]
    async fn test_refresh_deletes_rule_for_unresolvable_domain() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        os.set_resolution("example.com", vec![ip(1)]);
        let network = controller(&os);
        network.apply(["example.com"]).await.unwrap();

        network.refresh().await;
        assert_eq!(network.firewall_records().await.len(), 1);

        os.remove_resolution("example.com");
        network.refresh().await;
        assert!(os.firewall_rule("EndpointGuard_Block_example.com").is_none());
        assert!(network.firewall_records().await.is_empty());
        // Hosts block unaffected
        assert!(os.hosts().contains("127.0.0.1 example.com"));
    }

    #[tokio::test]
    async fn test_apply_deletes_rules_of_removed_domains() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        os.set_resolution("a.com", vec![ip(1)]);
        os.set_resolution("b.com", vec![ip(2)]);
        let network = controller(&os);
        network.apply(["a.com", "b.com"]).await.unwrap();
        network.refresh().await;

        network.apply(["a.com"]).await.unwrap();

        assert!(os.firewall_rule("EndpointGuard_Block_a.com").is_some());
        assert!(os.firewall_rule("EndpointGuard_Block_b.com").is_none());
    }

    #[tokio::test]
    async fn test_stop_without_start_reverses_state() {
        let stale = format!("{}{}\n127.0.0.1 stale.com\n{}\n", HOSTS, START_MARKER, END_MARKER);
        let os = Arc::new(MemoryOs::with_hosts(&stale));
        os.run_firewall_command(&FirewallCommand::Add(FirewallRule {
            name: "EndpointGuard_Block_stale.com".to_string(),
            action: RuleAction::Block,
            target: RuleTarget::RemoteIps(vec![ip(3)]),
        }))
        .await
        .unwrap();
        let network = controller(&os);

        network.stop().await;
        network.stop().await;

        assert_eq!(os.hosts(), HOSTS);
        assert!(os.firewall_rules().is_empty());
    }

    #[tokio::test]
    async fn test_start_follows_policy_and_stop_reverts() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        os.set_resolution("facebook.com", vec![ip(1)]);
        os.set_resolution("reddit.com", vec![ip(2)]);
        let network = controller(&os);

        let mut initial = PolicySnapshot::default();
        initial.blocked_domains.insert("facebook.com".to_string());
        let policy = PolicyState::new(initial);

        network.start(&policy).await;
        network.start(&policy).await;
        assert!(network.is_site_blocked("facebook.com"));

        policy.update(|current| {
            let mut next = current.clone();
            next.version += 1;
            next.blocked_domains.insert("reddit.com".to_string());
            next
        });
        for _ in 0..50 {
            if os.firewall_rule("EndpointGuard_Block_reddit.com").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(network.is_site_blocked("reddit.com"));
        assert!(os.hosts().contains("127.0.0.1 reddit.com"));
        assert!(os.firewall_rule("EndpointGuard_Block_reddit.com").is_some());

        network.stop().await;
        assert_eq!(os.hosts(), HOSTS);
        assert!(os.firewall_rules().is_empty());
        assert!(!network.is_site_blocked("facebook.com"));
    }

    #[tokio::test]
    async fn test_dns_proxy_method_drops_hosts_block() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = controller(&os);
        network.apply(["example.com"]).await.unwrap();
        assert!(current_block(&os.hosts()).is_some());

        network.set_blocking_method(BlockingMethod::DnsProxy).await;
        assert_eq!(os.hosts(), HOSTS);
        assert!(network.is_site_blocked("example.com"));

        network.set_blocking_method(BlockingMethod::Hosts).await;
        assert!(current_block(&os.hosts()).is_some());
        network.stop().await;
    }

    #[tokio::test]
    async fn test_sample_logs_each_connection_once() {
        let os = Arc::new(MemoryOs::new());
        os.set_connections(vec![
            connection(10, "142.250.74.46", "Established"),
            connection(10, "0.0.0.0", "Listen"),
        ]);
        os.set_process_io(ProcessIo {
            pid: 10,
            name: "chrome.exe".to_string(),
            bytes_read: 4096,
            bytes_written: 512,
        });
        let network = controller(&os);

        network.sample_activity().await;
        network.sample_activity().await;

        let recent = network.recent_connections(100).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].connection.remote_address, "142.250.74.46");
        let traffic = network.traffic_by_process().await;
        assert_eq!(traffic["chrome.exe"].bytes_received, 4096);
        assert_eq!(traffic["chrome.exe"].bytes_sent, 512);
    }

    #[tokio::test]
    async fn test_sample_failure_keeps_previous_results() {
        let os = Arc::new(MemoryOs::new());
        os.set_connections(vec![connection(10, "142.250.74.46", "Established")]);
        os.set_process_io(ProcessIo {
            pid: 10,
            name: "chrome.exe".to_string(),
            bytes_read: 1,
            bytes_written: 1,
        });
        let network = controller(&os);
        network.sample_activity().await;

        os.fail(OsOp::ListConnections);
        os.fail(OsOp::ProcessIo);
        os.set_connections(vec![connection(11, "140.82.112.3", "Established")]);
        network.sample_activity().await;

        assert_eq!(network.recent_connections(100).await.len(), 1);
        assert!(network.traffic_by_process().await.contains_key("chrome.exe"));

        os.heal(OsOp::ListConnections);
        network.sample_activity().await;
        assert_eq!(network.recent_connections(100).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sampling_switched_off() {
        let os = Arc::new(MemoryOs::new());
        os.set_connections(vec![connection(10, "142.250.74.46", "Established")]);
        os.fail(OsOp::ProcessIo);
        let network = NetworkPolicyController::new(
            os.clone(),
            Arc::new(AuditLogger::new_null()),
            NetworkOptions {
                log_connections: false,
                track_bandwidth: false,
                ..Default::default()
            },
        );

        network.sample_activity().await;
        assert!(network.recent_connections(100).await.is_empty());
        assert!(network.traffic_by_process().await.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_runs_while_started() {
        let os = Arc::new(MemoryOs::with_hosts(HOSTS));
        let network = Arc::new(NetworkPolicyController::new(
            os.clone(),
            Arc::new(AuditLogger::new_null()),
            NetworkOptions {
                dns_listen: "127.0.0.1:0".parse().unwrap(),
                disable_doh: false,
                monitor_interval: Duration::from_millis(10),
                stop_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ));
        network.start(&PolicyState::new(PolicySnapshot::default())).await;

        os.set_connections(vec![connection(10, "142.250.74.46", "Established")]);
        for _ in 0..50 {
            if !network.recent_connections(1).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(network.recent_connections(1).await.len(), 1);

        network.stop().await;
        os.set_connections(vec![connection(11, "140.82.112.3", "Established")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(network.recent_connections(100).await.len(), 1);
    }

    #[test]
    fn test_options_from_config() {
        let config = Config::embedded().unwrap();
        let options = NetworkOptions::from_config(&config);

        assert_eq!(options.firewall_refresh, Duration::from_secs(1800));
        assert_eq!(options.dns_upstream, "8.8.8.8:53".parse().unwrap());
        assert!(options.disable_doh);
        assert!(options.log_connections);
        assert!(options.track_bandwidth);
        assert_eq!(options.monitor_interval, Duration::from_secs(5));

        let mut config = Config::default();
        config.network.dns_listen = "bogus".to_string();
        let options = NetworkOptions::from_config(&config);
        assert_eq!(options.dns_listen, "127.0.0.1:53".parse().unwrap());
    }
}
