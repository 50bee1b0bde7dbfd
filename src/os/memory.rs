//! In-memory OS adapter.
//!
//! [`MemoryOs`] models the slice of machine state the agent touches: a
//! registry, a firewall rule table, a hosts file, a resolver table, USB
//! devices, sockets, processes and windows. Any operation can be made to fail with
//! [`MemoryOs::fail`], which is how tests exercise the "log and retry"
//! behaviour of the controllers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{OsError, OsResult};
use super::{
    ConnectionInfo, DeviceEvent, FirewallCommand, FirewallRule, Hive, OsAdapter, ProcessInfo,
    ProcessIo, RawDevice, RawDisk, RegistryValue, UsbHistoryEntry, UsbInventory, WindowHandle,
    WindowInfo,
};

/// Operation classes that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsOp {
    /// Registry reads, writes, deletes and key creation.
    Registry,
    /// Firewall commands.
    Firewall,
    /// USB enumeration.
    EnumerateUsb,
    /// Device-change watch.
    WatchDevice,
    /// Volume ejection.
    EjectVolume,
    /// Group-policy refresh.
    RefreshPolicy,
    /// Hosts file read.
    ReadHosts,
    /// Hosts file write.
    WriteHosts,
    /// DNS cache flush.
    FlushDns,
    /// Name resolution.
    Resolve,
    /// Process listing.
    ListProcesses,
    /// Process termination.
    KillProcess,
    /// Window enumeration.
    EnumerateWindows,
    /// Window close.
    CloseWindow,
    /// Socket listing.
    ListConnections,
    /// Process I/O counters.
    ProcessIo,
    /// USB device history.
    UsbHistory,
}

impl OsOp {
    fn name(self) -> &'static str {
        match self {
            OsOp::Registry => "registry",
            OsOp::Firewall => "firewall",
            OsOp::EnumerateUsb => "enumerate_usb_devices",
            OsOp::WatchDevice => "watch_device_change",
            OsOp::EjectVolume => "eject_volume",
            OsOp::RefreshPolicy => "refresh_group_policy",
            OsOp::ReadHosts => "read_hosts_file",
            OsOp::WriteHosts => "write_hosts_file",
            OsOp::FlushDns => "flush_dns_cache",
            OsOp::Resolve => "resolve_domain",
            OsOp::ListProcesses => "list_processes",
            OsOp::KillProcess => "kill_process",
            OsOp::EnumerateWindows => "enumerate_windows",
            OsOp::CloseWindow => "close_window",
            OsOp::ListConnections => "list_connections",
            OsOp::ProcessIo => "process_io_counters",
            OsOp::UsbHistory => "usb_device_history",
        }
    }
}

type RegistryKey = (Hive, String);

#[derive(Debug, Default)]
struct MachineState {
    registry: BTreeMap<RegistryKey, BTreeMap<String, RegistryValue>>,
    firewall: BTreeMap<String, FirewallRule>,
    firewall_commands: usize,
    inventory: UsbInventory,
    ejected: Vec<String>,
    policy_refreshes: usize,
    hosts: String,
    dns_flushes: usize,
    resolutions: HashMap<String, Vec<IpAddr>>,
    processes: BTreeMap<u32, String>,
    killed: Vec<u32>,
    windows: BTreeMap<WindowHandle, WindowInfo>,
    closed_windows: Vec<WindowHandle>,
    connections: Vec<ConnectionInfo>,
    process_io: BTreeMap<u32, ProcessIo>,
    usb_history: Vec<UsbHistoryEntry>,
    failing: HashSet<OsOp>,
}

/// An in-memory machine implementing [`OsAdapter`].
pub struct MemoryOs {
    state: Mutex<MachineState>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DeviceEvent>>,
}

impl Default for MemoryOs {
    fn default() -> Self {
        Self::new()
    }
}

fn registry_key(hive: Hive, path: &str) -> RegistryKey {
    (hive, path.to_lowercase())
}

impl MemoryOs {
    /// Create an empty machine with an empty hosts file.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MachineState::default()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Create a machine whose hosts file starts with `contents`.
    pub fn with_hosts(contents: &str) -> Self {
        let os = Self::new();
        os.set_hosts(contents);
        os
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, op: OsOp) -> OsResult<()> {
        if self.lock().failing.contains(&op) {
            return Err(OsError::Injected(op.name()));
        }
        Ok(())
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail(&self, op: OsOp) {
        self.lock().failing.insert(op);
    }

    /// Stop failing `op`.
    pub fn heal(&self, op: OsOp) {
        self.lock().failing.remove(&op);
    }

    /// Current hosts file contents.
    pub fn hosts(&self) -> String {
        self.lock().hosts.clone()
    }

    /// Replace the hosts file, as another program would.
    pub fn set_hosts(&self, contents: &str) {
        self.lock().hosts = contents.to_string();
    }

    /// Number of DNS cache flushes so far.
    pub fn dns_flushes(&self) -> usize {
        self.lock().dns_flushes
    }

    /// Read a registry value directly.
    pub fn registry_value(&self, hive: Hive, path: &str, name: &str) -> Option<RegistryValue> {
        self.lock()
            .registry
            .get(&registry_key(hive, path))
            .and_then(|values| values.get(&name.to_lowercase()))
            .cloned()
    }

    /// Check whether a registry key exists.
    pub fn registry_key_exists(&self, hive: Hive, path: &str) -> bool {
        self.lock().registry.contains_key(&registry_key(hive, path))
    }

    /// Write a registry value directly, bypassing failure injection.
    pub fn set_registry_value(&self, hive: Hive, path: &str, name: &str, value: RegistryValue) {
        self.lock()
            .registry
            .entry(registry_key(hive, path))
            .or_default()
            .insert(name.to_lowercase(), value);
    }

    /// All firewall rules, ordered by name.
    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.lock().firewall.values().cloned().collect()
    }

    /// Look up a firewall rule by name.
    pub fn firewall_rule(&self, name: &str) -> Option<FirewallRule> {
        self.lock().firewall.get(name).cloned()
    }

    /// Number of firewall commands executed.
    pub fn firewall_commands(&self) -> usize {
        self.lock().firewall_commands
    }

    /// Make `name` resolve to `ips`.
    pub fn set_resolution(&self, name: &str, ips: Vec<IpAddr>) {
        self.lock().resolutions.insert(name.to_lowercase(), ips);
    }

    /// Make `name` fail to resolve.
    pub fn remove_resolution(&self, name: &str) {
        self.lock().resolutions.remove(&name.to_lowercase());
    }

    /// Attach a device and deliver an arrival event.
    pub fn attach_device(&self, device: RawDevice) {
        self.lock().inventory.entities.push(device);
        let _ = self.events_tx.send(DeviceEvent::Arrival);
    }

    /// Attach a device without delivering an event.
    pub fn attach_device_silently(&self, device: RawDevice) {
        self.lock().inventory.entities.push(device);
    }

    /// Add a USB disk drive.
    pub fn attach_disk(&self, disk: RawDisk) {
        self.lock().inventory.disks.push(disk);
    }

    /// Remove a device (and any disk with the same id) and deliver a removal event.
    pub fn detach_device(&self, device_id: &str) {
        {
            let mut state = self.lock();
            state.inventory.entities.retain(|d| d.device_id != device_id);
            state.inventory.disks.retain(|d| d.device_id != device_id);
        }
        let _ = self.events_tx.send(DeviceEvent::Removal);
    }

    /// Drive letters ejected so far, in order.
    pub fn ejected(&self) -> Vec<String> {
        self.lock().ejected.clone()
    }

    /// Number of group-policy refreshes so far.
    pub fn policy_refreshes(&self) -> usize {
        self.lock().policy_refreshes
    }

    /// Start a process.
    pub fn add_process(&self, pid: u32, name: &str) {
        self.lock().processes.insert(pid, name.to_string());
    }

    /// Process IDs terminated so far.
    pub fn killed(&self) -> Vec<u32> {
        self.lock().killed.clone()
    }

    /// Open a window.
    pub fn add_window(&self, window: WindowInfo) {
        self.lock().windows.insert(window.handle, window);
    }

    /// Windows still open.
    pub fn open_windows(&self) -> Vec<WindowInfo> {
        self.lock().windows.values().cloned().collect()
    }

    /// Windows closed so far, in order.
    pub fn closed_windows(&self) -> Vec<WindowHandle> {
        self.lock().closed_windows.clone()
    }

    /// Replace the open socket table.
    pub fn set_connections(&self, connections: Vec<ConnectionInfo>) {
        self.lock().connections = connections;
    }

    /// Set the I/O counters of a process.
    pub fn set_process_io(&self, io: ProcessIo) {
        self.lock().process_io.insert(io.pid, io);
    }

    /// Record a USB storage device in the device history.
    pub fn record_usb_history(&self, entry: UsbHistoryEntry) {
        self.lock().usb_history.push(entry);
    }
}

#[async_trait]
impl OsAdapter for MemoryOs {
    async fn read_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
    ) -> OsResult<Option<RegistryValue>> {
        self.check(OsOp::Registry)?;
        Ok(self.registry_value(hive, path, name))
    }

    async fn write_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
        value: &RegistryValue,
    ) -> OsResult<()> {
        self.check(OsOp::Registry)?;
        self.set_registry_value(hive, path, name, value.clone());
        Ok(())
    }

    async fn delete_value(&self, hive: Hive, path: &str, name: &str) -> OsResult<()> {
        self.check(OsOp::Registry)?;
        if let Some(values) = self.lock().registry.get_mut(&registry_key(hive, path)) {
            values.remove(&name.to_lowercase());
        }
        Ok(())
    }

    async fn create_key(&self, hive: Hive, path: &str) -> OsResult<()> {
        self.check(OsOp::Registry)?;
        self.lock()
            .registry
            .entry(registry_key(hive, path))
            .or_default();
        Ok(())
    }

    async fn run_firewall_command(&self, command: &FirewallCommand) -> OsResult<()> {
        self.check(OsOp::Firewall)?;
        let mut state = self.lock();
        state.firewall_commands += 1;
        match command {
            FirewallCommand::Add(rule) => {
                state.firewall.insert(rule.name.clone(), rule.clone());
            }
            FirewallCommand::Delete { name } => {
                state.firewall.remove(name);
            }
            FirewallCommand::DeleteByPrefix { prefix } => {
                state.firewall.retain(|name, _| !name.starts_with(prefix.as_str()));
            }
        }
        Ok(())
    }

    async fn enumerate_usb_devices(&self) -> OsResult<UsbInventory> {
        self.check(OsOp::EnumerateUsb)?;
        Ok(self.lock().inventory.clone())
    }

    async fn watch_device_change(&self, timeout: Duration) -> OsResult<Option<DeviceEvent>> {
        self.check(OsOp::WatchDevice)?;
        let mut rx = self.events_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(event) => Ok(event),
            Err(_) => Ok(None),
        }
    }

    async fn eject_volume(&self, drive_letter: &str) -> OsResult<()> {
        self.check(OsOp::EjectVolume)?;
        let mut state = self.lock();
        state.ejected.push(drive_letter.to_string());
        for disk in &mut state.inventory.disks {
            if disk.drive_letter.as_deref() == Some(drive_letter) {
                disk.drive_letter = None;
            }
        }
        Ok(())
    }

    async fn refresh_group_policy(&self) -> OsResult<()> {
        self.check(OsOp::RefreshPolicy)?;
        self.lock().policy_refreshes += 1;
        Ok(())
    }

    async fn read_hosts_file(&self) -> OsResult<String> {
        self.check(OsOp::ReadHosts)?;
        Ok(self.hosts())
    }

    async fn write_hosts_file(&self, contents: &str) -> OsResult<()> {
        self.check(OsOp::WriteHosts)?;
        self.set_hosts(contents);
        Ok(())
    }

    async fn flush_dns_cache(&self) -> OsResult<()> {
        self.check(OsOp::FlushDns)?;
        self.lock().dns_flushes += 1;
        Ok(())
    }

    async fn resolve_domain(&self, name: &str) -> OsResult<Vec<IpAddr>> {
        self.check(OsOp::Resolve)?;
        self.lock()
            .resolutions
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| OsError::Resolve {
                name: name.to_string(),
                message: "no such host".to_string(),
            })
    }

    async fn list_processes(&self) -> OsResult<Vec<ProcessInfo>> {
        self.check(OsOp::ListProcesses)?;
        Ok(self
            .lock()
            .processes
            .iter()
            .map(|(pid, name)| ProcessInfo {
                pid: *pid,
                name: name.clone(),
            })
            .collect())
    }

    async fn kill_process(&self, pid: u32) -> OsResult<()> {
        self.check(OsOp::KillProcess)?;
        let mut state = self.lock();
        if state.processes.remove(&pid).is_none() {
            return Err(OsError::CommandError {
                cmd: format!("taskkill /PID {} /F", pid),
                stderr: format!("ERROR: The process \"{}\" not found.", pid),
            });
        }
        state.killed.push(pid);
        Ok(())
    }

    async fn enumerate_windows(&self) -> OsResult<Vec<WindowInfo>> {
        self.check(OsOp::EnumerateWindows)?;
        Ok(self.open_windows())
    }

    async fn close_window(&self, handle: WindowHandle) -> OsResult<()> {
        self.check(OsOp::CloseWindow)?;
        let mut state = self.lock();
        state.windows.remove(&handle);
        state.closed_windows.push(handle);
        Ok(())
    }

    async fn list_connections(&self) -> OsResult<Vec<ConnectionInfo>> {
        self.check(OsOp::ListConnections)?;
        Ok(self.lock().connections.clone())
    }

    async fn process_io_counters(&self) -> OsResult<Vec<ProcessIo>> {
        self.check(OsOp::ProcessIo)?;
        Ok(self.lock().process_io.values().cloned().collect())
    }

    async fn usb_device_history(&self) -> OsResult<Vec<UsbHistoryEntry>> {
        self.check(OsOp::UsbHistory)?;
        Ok(self.lock().usb_history.clone())
    }
}
