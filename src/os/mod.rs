//! OS adapter layer.
//!
//! Every controller reaches the operating system through one [`OsAdapter`]
//! instance, constructed at start-up and shared by `Arc`. The adapter is thin
//! and stateless: it knows how to perform a single registry, firewall, device,
//! hosts-file, DNS, process or window operation, and nothing about policy.
//!
//! # Implementations
//!
//! - [`WindowsOs`]: the production adapter (`reg.exe`, `netsh`, PowerShell CIM
//!   queries, `gpupdate`, `ipconfig`, `tasklist`/`taskkill`, and Win32 calls
//!   for windows and volumes).
//! - [`MemoryOs`]: an in-memory machine with per-operation failure injection,
//!   used by tests and dry runs.
//!
//! # Timeouts
//!
//! Every call is bounded. Shell-outs go through [`CommandRunner`]; blocking
//! Win32 calls run on the blocking pool under `tokio::time::timeout`.

mod command;
mod error;
mod memory;
#[cfg_attr(not(windows), allow(dead_code))]
mod parse;
#[cfg(windows)]
mod windows;

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use command::{format_command, CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT};
pub use error::{OsError, OsResult};
pub use memory::{MemoryOs, OsOp};
#[cfg(windows)]
pub use windows::WindowsOs;

/// Default location of the hosts file.
pub const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";

/// Registry root a key lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hive {
    /// `HKEY_LOCAL_MACHINE`.
    LocalMachine,
    /// `HKEY_CURRENT_USER`.
    CurrentUser,
}

impl Hive {
    /// Short name accepted by `reg.exe`.
    pub fn abbrev(self) -> &'static str {
        match self {
            Hive::LocalMachine => "HKLM",
            Hive::CurrentUser => "HKCU",
        }
    }
}

impl fmt::Display for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

/// A registry value the agent reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryValue {
    /// `REG_DWORD`.
    Dword(u32),
    /// `REG_SZ`.
    String(String),
}

/// Outcome a firewall rule applies to matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Drop matching outbound traffic.
    Block,
    /// Permit matching outbound traffic.
    Allow,
}

impl RuleAction {
    fn as_str(self) -> &'static str {
        match self {
            RuleAction::Block => "block",
            RuleAction::Allow => "allow",
        }
    }
}

/// What an outbound firewall rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// Traffic to any of these remote addresses.
    RemoteIps(Vec<IpAddr>),
    /// All traffic from this executable.
    Program(PathBuf),
}

/// An outbound firewall rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Unique rule name; used to replace and delete it.
    pub name: String,
    /// Block or allow.
    pub action: RuleAction,
    /// What the rule matches.
    pub target: RuleTarget,
}

/// A single firewall mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCommand {
    /// Add an outbound rule.
    Add(FirewallRule),
    /// Delete every rule with this exact name.
    Delete {
        /// Rule name.
        name: String,
    },
    /// Delete every rule whose name starts with this prefix.
    DeleteByPrefix {
        /// Rule name prefix.
        prefix: String,
    },
}

impl FirewallCommand {
    /// The program and arguments that perform this command on Windows.
    pub fn invocation(&self) -> (&'static str, Vec<String>) {
        let netsh = |rest: Vec<String>| {
            let mut args: Vec<String> = ["advfirewall", "firewall"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            args.extend(rest);
            ("netsh", args)
        };

        match self {
            FirewallCommand::Add(rule) => {
                let target = match &rule.target {
                    RuleTarget::RemoteIps(ips) => format!(
                        "remoteip={}",
                        ips.iter()
                            .map(|ip| ip.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                    RuleTarget::Program(path) => format!("program={}", path.display()),
                };
                netsh(vec![
                    "add".to_string(),
                    "rule".to_string(),
                    format!("name={}", rule.name),
                    "dir=out".to_string(),
                    format!("action={}", rule.action.as_str()),
                    target,
                    "enable=yes".to_string(),
                ])
            }
            FirewallCommand::Delete { name } => netsh(vec![
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}", name),
            ]),
            FirewallCommand::DeleteByPrefix { prefix } => (
                "powershell",
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    format!(
                        "Get-NetFirewallRule -DisplayName '{}*' -ErrorAction SilentlyContinue | Remove-NetFirewallRule",
                        prefix.replace('\'', "''")
                    ),
                ],
            ),
        }
    }
}

/// A USB device as reported by the OS, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawDevice {
    /// Stable OS identifier, e.g. `USB\VID_0781&PID_5567\4C530001`.
    pub device_id: String,
    /// Driver service name (`USBSTOR`, `HidUsb`, ...).
    pub service: Option<String>,
    /// Compatible-ID tokens (`USB\Class_08&SubClass_06`, ...).
    pub compatible_ids: Vec<String>,
    /// Friendly name or description.
    pub description: String,
}

/// A USB-attached disk drive and the drive letter it mounted as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawDisk {
    /// PnP identifier of the disk.
    pub device_id: String,
    /// Hardware serial number, if reported.
    pub serial: Option<String>,
    /// Model or caption.
    pub description: String,
    /// First logical drive, e.g. `E:`.
    pub drive_letter: Option<String>,
}

/// Result of a USB enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UsbInventory {
    /// PnP entities with a vendor/product identifier.
    pub entities: Vec<RawDevice>,
    /// USB disk drives.
    pub disks: Vec<RawDisk>,
}

/// Device-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device was attached.
    Arrival,
    /// A device was removed.
    Removal,
}

/// A running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID.
    pub pid: u32,
    /// Executable image name, e.g. `chrome.exe`.
    pub name: String,
}

/// Transport of an open socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP connection or listener.
    #[default]
    Tcp,
    /// UDP endpoint.
    Udp,
}

/// An open socket and the process that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionInfo {
    /// Owning process ID; 0 when the OS does not report one.
    pub pid: u32,
    /// Owning process image name, when it could be queried.
    pub process_name: Option<String>,
    /// Transport.
    pub protocol: Protocol,
    /// Local address.
    pub local_address: String,
    /// Local port.
    pub local_port: u16,
    /// Remote address; empty for listeners and UDP endpoints.
    pub remote_address: String,
    /// Remote port; 0 for listeners and UDP endpoints.
    pub remote_port: u16,
    /// Connection state as the OS names it (`Established`, `Listen`, ...).
    pub state: String,
}

impl ConnectionInfo {
    /// Whether this is an established connection to a remote peer.
    pub fn is_established(&self) -> bool {
        self.state.eq_ignore_ascii_case("established")
    }
}

/// Cumulative I/O byte counters of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessIo {
    /// Process ID.
    pub pid: u32,
    /// Executable image name.
    pub name: String,
    /// Bytes read since the process started.
    pub bytes_read: u64,
    /// Bytes written since the process started.
    pub bytes_written: u64,
}

/// A USB storage device the OS has recorded, attached or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UsbHistoryEntry {
    /// Device class key, e.g. `Disk&Ven_SanDisk&Prod_Cruzer_Blade&Rev_1.00`.
    pub device_class: String,
    /// Instance key, usually the serial followed by `&0`.
    pub instance_id: String,
    /// Friendly name recorded at install time.
    pub friendly_name: Option<String>,
}

/// Opaque handle of a top-level window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub isize);

/// A visible top-level window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    /// Window handle.
    pub handle: WindowHandle,
    /// Window class name.
    pub class_name: String,
    /// Window title.
    pub title: String,
    /// Owning process ID.
    pub pid: u32,
    /// Owning process image name, when it could be queried.
    pub process_name: Option<String>,
}

/// Primitive operations every enforcement mechanism is built from.
///
/// Each call may fail and each call is bounded in time. Failures are never
/// fatal to the caller.
#[async_trait]
pub trait OsAdapter: Send + Sync {
    /// Read a registry value; `Ok(None)` when the key or value is absent.
    async fn read_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
    ) -> OsResult<Option<RegistryValue>>;

    /// Write a registry value, creating the key if needed.
    async fn write_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
        value: &RegistryValue,
    ) -> OsResult<()>;

    /// Delete a registry value. Deleting an absent value succeeds.
    async fn delete_value(&self, hive: Hive, path: &str, name: &str) -> OsResult<()>;

    /// Create a registry key (and its parents).
    async fn create_key(&self, hive: Hive, path: &str) -> OsResult<()>;

    /// Apply one firewall mutation.
    async fn run_firewall_command(&self, command: &FirewallCommand) -> OsResult<()>;

    /// Enumerate USB entities and USB disk drives.
    async fn enumerate_usb_devices(&self) -> OsResult<UsbInventory>;

    /// Wait up to `timeout` for a device-change event.
    async fn watch_device_change(&self, timeout: Duration) -> OsResult<Option<DeviceEvent>>;

    /// Lock, dismount and eject the volume mounted at `drive_letter`.
    async fn eject_volume(&self, drive_letter: &str) -> OsResult<()>;

    /// Force a group-policy refresh.
    async fn refresh_group_policy(&self) -> OsResult<()>;

    /// Read the full hosts file.
    async fn read_hosts_file(&self) -> OsResult<String>;

    /// Replace the full hosts file.
    async fn write_hosts_file(&self, contents: &str) -> OsResult<()>;

    /// Flush the resolver cache.
    async fn flush_dns_cache(&self) -> OsResult<()>;

    /// Resolve a host name to its addresses.
    async fn resolve_domain(&self, name: &str) -> OsResult<Vec<IpAddr>>;

    /// List running processes.
    async fn list_processes(&self) -> OsResult<Vec<ProcessInfo>>;

    /// Terminate a process.
    async fn kill_process(&self, pid: u32) -> OsResult<()>;

    /// List visible top-level windows.
    async fn enumerate_windows(&self) -> OsResult<Vec<WindowInfo>>;

    /// Ask a window to close.
    async fn close_window(&self, handle: WindowHandle) -> OsResult<()>;

    /// List open TCP connections and UDP endpoints.
    async fn list_connections(&self) -> OsResult<Vec<ConnectionInfo>>;

    /// Cumulative I/O counters of every process that can be queried.
    async fn process_io_counters(&self) -> OsResult<Vec<ProcessIo>>;

    /// USB storage devices recorded in the device registry.
    async fn usb_device_history(&self) -> OsResult<Vec<UsbHistoryEntry>>;
}

/// Options for the production adapter.
#[derive(Debug, Clone)]
pub struct SystemOsOptions {
    /// Hosts file location.
    pub hosts_path: PathBuf,
    /// Timeout for ordinary commands and calls.
    pub command_timeout: Duration,
    /// Timeout for `gpupdate /force`.
    pub policy_refresh_timeout: Duration,
    /// Timeout for a single name resolution.
    pub resolve_timeout: Duration,
}

impl Default for SystemOsOptions {
    fn default() -> Self {
        Self {
            hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            policy_refresh_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

/// Construct the adapter for the host platform.
#[cfg(windows)]
pub fn system(options: SystemOsOptions) -> OsResult<Arc<dyn OsAdapter>> {
    Ok(Arc::new(WindowsOs::new(options)))
}

/// Construct the adapter for the host platform.
#[cfg(not(windows))]
pub fn system(_options: SystemOsOptions) -> OsResult<Arc<dyn OsAdapter>> {
    Err(OsError::Unsupported {
        operation: "policy enforcement",
    })
}

/// Resolve `name` with the system resolver, bounded by `timeout`.
///
/// Returns the distinct addresses in sorted order.
pub async fn lookup_host(name: &str, timeout: Duration) -> OsResult<Vec<IpAddr>> {
    let lookup = tokio::net::lookup_host((name, 0));
    let addrs = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(e)) => {
            return Err(OsError::Resolve {
                name: name.to_string(),
                message: e.to_string(),
            });
        }
        Err(_) => {
            return Err(OsError::Timeout {
                cmd: format!("resolve {}", name),
                timeout,
            });
        }
    };

    let ips: BTreeSet<IpAddr> = addrs.map(|addr| addr.ip()).collect();
    Ok(ips.into_iter().collect())
}
