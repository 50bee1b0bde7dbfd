//! Configuration schema definitions.
//!
//! This module defines the structure of the endpoint-guard configuration files.
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `%ProgramData%\EndpointGuard\config.toml`
//! 3. Saved credentials: `<data_dir>\credentials.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. Environment overrides
//!
//! Local configuration only seeds the first policy snapshot; the management
//! server replaces it on every heartbeat.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::categories;
use crate::os::SystemOsOptions;
use crate::policy::{normalize_domain, BlockingMethod, PolicySnapshot, UsbMode, WhitelistRule};

/// Embedded default configuration.
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Agent identity and management-server settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Web blocking settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// USB control settings.
    #[serde(default)]
    pub usb: UsbConfig,

    /// Upload lockdown settings.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Audit logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Parse the embedded defaults.
    pub fn embedded() -> Result<Self, toml::de::Error> {
        toml::from_str(DEFAULT_CONFIG)
    }

    /// Merge another config into this one.
    ///
    /// Lists are merged (appended, duplicates skipped).
    /// Scalars are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.agent.merge(other.agent);
        self.network.merge(other.network);
        self.usb.merge(other.usb);
        self.uploads.merge(other.uploads);
        self.telemetry.merge(other.telemetry);
    }

    /// Build the first policy snapshot from local configuration.
    pub fn initial_policy(&self) -> PolicySnapshot {
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        for site in &self.network.blocked_sites {
            match normalize_domain(site) {
                Some(domain) => {
                    blocked.insert(domain);
                }
                None => warn!("Ignoring invalid blocked site in config: {:?}", site),
            }
        }
        for category in &self.network.blocked_categories {
            match categories::domains(category) {
                Some(domains) => blocked.extend(domains),
                None => warn!("Unknown blocked category '{}'", category),
            }
        }

        PolicySnapshot {
            version: 0,
            blocked_domains: blocked,
            allowed_domains: self
                .network
                .allowed_sites
                .iter()
                .filter_map(|s| normalize_domain(s))
                .collect(),
            blocking_method: self.network.blocking_method.unwrap_or_default(),
            usb_mode: self.usb.mode.unwrap_or_default(),
            usb_whitelist: self.usb.whitelist.clone(),
            upload_block_all: self.uploads.block_all.unwrap_or(false),
            upload_whitelist: self
                .uploads
                .whitelist
                .iter()
                .filter_map(|s| normalize_domain(s))
                .collect(),
            approved_file_hashes: BTreeSet::new(),
        }
    }

    /// Options for the production OS adapter.
    pub fn os_options(&self) -> SystemOsOptions {
        let defaults = SystemOsOptions::default();
        SystemOsOptions {
            hosts_path: if self.network.hosts_path.is_empty() {
                defaults.hosts_path
            } else {
                PathBuf::from(&self.network.hosts_path)
            },
            command_timeout: secs_or(self.agent.command_timeout_secs, defaults.command_timeout),
            policy_refresh_timeout: secs_or(
                self.agent.policy_refresh_timeout_secs,
                defaults.policy_refresh_timeout,
            ),
            resolve_timeout: millis_or(self.network.resolve_timeout_ms, defaults.resolve_timeout),
        }
    }
}

pub(crate) fn secs_or(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_secs(value)
    }
}

pub(crate) fn millis_or(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_millis(value)
    }
}

fn merge_list<T: PartialEq>(base: &mut Vec<T>, other: Vec<T>) {
    for item in other {
        if !base.contains(&item) {
            base.push(item);
        }
    }
}

fn merge_string(base: &mut String, other: String) {
    if !other.is_empty() {
        *base = other;
    }
}

fn merge_u64(base: &mut u64, other: u64) {
    if other != 0 {
        *base = other;
    }
}

fn merge_option<T>(base: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *base = other;
    }
}

/// Agent identity and management-server settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AgentConfig {
    /// Management server base URL.
    #[serde(default)]
    pub dashboard_url: String,

    /// API key issued at registration. Empty = not registered.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// Stable machine identifier. Generated on first start when empty.
    #[serde(default)]
    pub machine_id: String,

    /// Directory for agent state. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,

    /// Seconds between heartbeats.
    #[serde(default)]
    pub heartbeat_interval_secs: u64,

    /// Seconds between approved-upload syncs.
    #[serde(default)]
    pub approvals_interval_secs: u64,

    /// Timeout for management-server requests in seconds.
    #[serde(default)]
    pub http_timeout_secs: u64,

    /// Timeout for a single OS command in seconds.
    #[serde(default)]
    pub command_timeout_secs: u64,

    /// Timeout for a group-policy refresh in seconds.
    #[serde(default)]
    pub policy_refresh_timeout_secs: u64,

    /// Timeout for joining a controller's tasks on stop, in seconds.
    #[serde(default)]
    pub stop_timeout_secs: u64,
}

impl AgentConfig {
    fn merge(&mut self, other: AgentConfig) {
        // Scalars are overridden if non-default
        merge_string(&mut self.dashboard_url, other.dashboard_url);
        merge_string(&mut self.api_key, other.api_key);
        merge_string(&mut self.machine_id, other.machine_id);
        merge_string(&mut self.data_dir, other.data_dir);
        merge_u64(&mut self.heartbeat_interval_secs, other.heartbeat_interval_secs);
        merge_u64(&mut self.approvals_interval_secs, other.approvals_interval_secs);
        merge_u64(&mut self.http_timeout_secs, other.http_timeout_secs);
        merge_u64(&mut self.command_timeout_secs, other.command_timeout_secs);
        merge_u64(
            &mut self.policy_refresh_timeout_secs,
            other.policy_refresh_timeout_secs,
        );
        merge_u64(&mut self.stop_timeout_secs, other.stop_timeout_secs);
    }

    /// Timeout for joining controller tasks.
    pub fn stop_timeout(&self) -> Duration {
        secs_or(self.stop_timeout_secs, Duration::from_secs(5))
    }
}

/// Web blocking settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Domains blocked before the first sync.
    #[serde(default)]
    pub blocked_sites: Vec<String>,

    /// Domains never blocked.
    #[serde(default)]
    pub allowed_sites: Vec<String>,

    /// Built-in categories to block (`social_media`, `gambling`, `streaming`, `gaming`).
    #[serde(default)]
    pub blocked_categories: Vec<String>,

    /// `hosts` or `dns_proxy`.
    #[serde(default)]
    pub blocking_method: Option<BlockingMethod>,

    /// Hosts file location.
    #[serde(default)]
    pub hosts_path: String,

    /// Seconds between firewall resolution cycles.
    #[serde(default)]
    pub firewall_refresh_secs: u64,

    /// Timeout for resolving one name, in milliseconds.
    #[serde(default)]
    pub resolve_timeout_ms: u64,

    /// Address the DNS proxy listens on.
    #[serde(default)]
    pub dns_listen: String,

    /// Upstream resolver for forwarded queries.
    #[serde(default)]
    pub dns_upstream: String,

    /// Upstream timeout in milliseconds.
    #[serde(default)]
    pub dns_upstream_timeout_ms: u64,

    /// Disable browser DNS-over-HTTPS through policy.
    #[serde(default)]
    pub disable_doh: Option<bool>,

    /// Keep a log of established connections.
    #[serde(default)]
    pub log_connections: Option<bool>,

    /// Sample per-process I/O counters.
    #[serde(default)]
    pub track_bandwidth: Option<bool>,

    /// Seconds between connection and counter samples.
    #[serde(default)]
    pub monitor_interval_secs: u64,
}

impl NetworkConfig {
    fn merge(&mut self, other: NetworkConfig) {
        // Lists are merged (appended)
        merge_list(&mut self.blocked_sites, other.blocked_sites);
        merge_list(&mut self.allowed_sites, other.allowed_sites);
        merge_list(&mut self.blocked_categories, other.blocked_categories);

        // Scalars are overridden if non-default
        merge_option(&mut self.blocking_method, other.blocking_method);
        merge_string(&mut self.hosts_path, other.hosts_path);
        merge_u64(&mut self.firewall_refresh_secs, other.firewall_refresh_secs);
        merge_u64(&mut self.resolve_timeout_ms, other.resolve_timeout_ms);
        merge_string(&mut self.dns_listen, other.dns_listen);
        merge_string(&mut self.dns_upstream, other.dns_upstream);
        merge_u64(&mut self.dns_upstream_timeout_ms, other.dns_upstream_timeout_ms);
        merge_option(&mut self.disable_doh, other.disable_doh);
        merge_option(&mut self.log_connections, other.log_connections);
        merge_option(&mut self.track_bandwidth, other.track_bandwidth);
        merge_u64(&mut self.monitor_interval_secs, other.monitor_interval_secs);
    }
}

/// USB control settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UsbConfig {
    /// Mode before the first sync.
    #[serde(default)]
    pub mode: Option<UsbMode>,

    /// Devices allowed in whitelist mode.
    #[serde(default)]
    pub whitelist: Vec<WhitelistRule>,

    /// Block mass-storage devices in block mode.
    #[serde(default)]
    pub block_mass_storage: Option<bool>,

    /// Block MTP devices in block mode.
    #[serde(default)]
    pub block_mtp: Option<bool>,

    /// Block PTP (camera) devices in block mode.
    #[serde(default)]
    pub block_ptp: Option<bool>,

    /// How long one device-change wait lasts, in milliseconds.
    #[serde(default)]
    pub watch_timeout_ms: u64,
}

impl UsbConfig {
    fn merge(&mut self, other: UsbConfig) {
        merge_list(&mut self.whitelist, other.whitelist);
        merge_option(&mut self.mode, other.mode);
        merge_option(&mut self.block_mass_storage, other.block_mass_storage);
        merge_option(&mut self.block_mtp, other.block_mtp);
        merge_option(&mut self.block_ptp, other.block_ptp);
        merge_u64(&mut self.watch_timeout_ms, other.watch_timeout_ms);
    }
}

/// Upload lockdown settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UploadsConfig {
    /// Lockdown state before the first sync.
    #[serde(default)]
    pub block_all: Option<bool>,

    /// Domains uploads may still reach.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Browser executables that get an outbound block rule and are
    /// restarted when the lockdown changes.
    #[serde(default)]
    pub browsers: Vec<String>,

    /// Gateway directory. Empty = `%Public%\SecureUploadGateway`.
    #[serde(default)]
    pub gateway_dir: String,

    /// Default temporary unlock duration in seconds.
    #[serde(default)]
    pub unlock_duration_secs: u64,

    /// Window monitor interval in milliseconds.
    #[serde(default)]
    pub window_poll_ms: u64,

    /// Expiry check interval in milliseconds.
    #[serde(default)]
    pub expiry_check_ms: u64,
}

impl UploadsConfig {
    fn merge(&mut self, other: UploadsConfig) {
        merge_list(&mut self.whitelist, other.whitelist);
        merge_list(&mut self.browsers, other.browsers);
        merge_option(&mut self.block_all, other.block_all);
        merge_string(&mut self.gateway_dir, other.gateway_dir);
        merge_u64(&mut self.unlock_duration_secs, other.unlock_duration_secs);
        merge_u64(&mut self.window_poll_ms, other.window_poll_ms);
        merge_u64(&mut self.expiry_check_ms, other.expiry_check_ms);
    }
}

/// Audit logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TelemetryConfig {
    /// Send audit events to syslog.
    #[serde(default)]
    pub syslog: Option<bool>,

    /// Remote syslog server (`host:port`, UDP). Empty = local syslog.
    #[serde(default)]
    pub syslog_server: String,
}

impl TelemetryConfig {
    fn merge(&mut self, other: TelemetryConfig) {
        merge_option(&mut self.syslog, other.syslog);
        merge_string(&mut self.syslog_server, other.syslog_server);
    }
}
