//! USB policy controller.
//!
//! Tracks connected devices, decides per device, and ejects disallowed
//! storage. In block mode the mass-storage driver is also disabled
//! machine-wide. The detection loop waits on device-change notifications and
//! runs a catch-up rescan whenever a wait times out, so a device that arrived
//! unnoticed is still handled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::decision::{should_block, BlockPolicy};
use super::device::{build_inventory, DeviceType, UsbDevice};
use super::enforce::{apply_storage_block, storage_block_in_place};
use crate::config::{millis_or, Config};
use crate::os::{DeviceEvent, OsAdapter, OsResult, UsbHistoryEntry};
use crate::policy::{PolicySnapshot, PolicyState, UsbMode, WhitelistRule};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::workers::{shutdown_signalled, Workers};

/// Tuning for the USB controller.
#[derive(Debug, Clone)]
pub struct UsbOptions {
    /// Block mass storage in block mode.
    pub block_mass_storage: bool,
    /// Block MTP devices in block mode.
    pub block_mtp: bool,
    /// Block PTP devices in block mode.
    pub block_ptp: bool,
    /// Length of one device-change wait.
    pub watch_timeout: Duration,
    /// Pause after an arrival before re-enumerating, so the new device has
    /// registered its volumes.
    pub settle_delay: Duration,
    /// How long `stop()` waits for the loop.
    pub stop_timeout: Duration,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            block_mass_storage: true,
            block_mtp: true,
            block_ptp: false,
            watch_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl UsbOptions {
    /// Build options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let usb = &config.usb;
        Self {
            block_mass_storage: usb.block_mass_storage.unwrap_or(defaults.block_mass_storage),
            block_mtp: usb.block_mtp.unwrap_or(defaults.block_mtp),
            block_ptp: usb.block_ptp.unwrap_or(defaults.block_ptp),
            watch_timeout: millis_or(usb.watch_timeout_ms, defaults.watch_timeout),
            settle_delay: defaults.settle_delay,
            stop_timeout: config.agent.stop_timeout(),
        }
    }
}

struct UsbState {
    policy: BlockPolicy,
    devices: BTreeMap<String, UsbDevice>,
    /// The machine-wide storage block was last written successfully.
    storage_blocked: bool,
}

/// Enforces the USB part of the policy.
pub struct UsbPolicyController {
    os: Arc<dyn OsAdapter>,
    audit: Arc<AuditLogger>,
    options: UsbOptions,
    state: Mutex<UsbState>,
    workers: Mutex<Option<Workers>>,
}

impl UsbPolicyController {
    /// Create a stopped controller in monitor mode.
    pub fn new(os: Arc<dyn OsAdapter>, audit: Arc<AuditLogger>, options: UsbOptions) -> Self {
        let policy = BlockPolicy {
            mode: UsbMode::Monitor,
            whitelist: Vec::new(),
            block_mass_storage: options.block_mass_storage,
            block_mtp: options.block_mtp,
            block_ptp: options.block_ptp,
        };
        Self {
            os,
            audit,
            options,
            state: Mutex::new(UsbState {
                policy,
                devices: BTreeMap::new(),
                storage_blocked: false,
            }),
            workers: Mutex::new(None),
        }
    }

    /// Current enforcement mode.
    pub async fn mode(&self) -> UsbMode {
        self.state.lock().await.policy.mode
    }

    /// Current whitelist.
    pub async fn whitelist(&self) -> Vec<WhitelistRule> {
        self.state.lock().await.policy.whitelist.clone()
    }

    /// Switch enforcement mode.
    ///
    /// Entering block mode disables the storage driver, sets the deny
    /// policy, refreshes group policy and ejects every connected storage
    /// device that is neither protected nor whitelisted. Leaving block mode
    /// lifts the machine-wide block again.
    pub async fn set_mode(&self, mode: UsbMode) {
        let mut state = self.state.lock().await;
        let old = state.policy.mode;
        state.policy.mode = mode;

        if old != mode {
            info!("USB mode changing: {} -> {}", old, mode);
            self.audit.log(AuditEvent::UsbModeChanged {
                from: old.to_string(),
                to: mode.to_string(),
            });
        }

        if mode == UsbMode::Block && state.policy.block_mass_storage {
            if old != mode {
                state.storage_blocked = false;
            }
            self.converge_storage_block(&mut state).await;
            self.eject_disallowed_storage(&mut state, "USB blocking enabled - device ejected")
                .await;
        } else if old == UsbMode::Block && mode != UsbMode::Block {
            state.storage_blocked = false;
            if let Err(e) = apply_storage_block(self.os.as_ref(), false).await {
                warn!("USB storage unblock not converged: {}", e);
            }
        }
    }

    /// Replace the whitelist.
    pub async fn set_whitelist(&self, whitelist: Vec<WhitelistRule>) {
        let mut state = self.state.lock().await;
        if state.policy.whitelist != whitelist {
            info!("USB whitelist updated ({} rule(s))", whitelist.len());
            state.policy.whitelist = whitelist;
        }
    }

    /// Add a whitelist rule. Returns `false` if an equal rule exists.
    pub async fn add_to_whitelist(&self, rule: WhitelistRule) -> bool {
        let mut state = self.state.lock().await;
        if state.policy.whitelist.contains(&rule) {
            return false;
        }
        state.policy.whitelist.push(rule);
        true
    }

    /// Remove every rule for `vid`/`pid`. Returns whether any was removed.
    pub async fn remove_from_whitelist(&self, vid: &str, pid: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.policy.whitelist.len();
        state.policy.whitelist.retain(|rule| {
            !(rule.vid.eq_ignore_ascii_case(vid) && rule.pid.eq_ignore_ascii_case(pid))
        });
        state.policy.whitelist.len() != before
    }

    /// Connected devices; scans first if none are known yet.
    pub async fn connected_devices(&self) -> OsResult<Vec<UsbDevice>> {
        {
            let state = self.state.lock().await;
            if !state.devices.is_empty() {
                return Ok(state.devices.values().cloned().collect());
            }
        }
        self.rescan().await
    }

    /// Re-enumerate and replace the device map. Devices already known keep
    /// their first-seen time.
    pub async fn rescan(&self) -> OsResult<Vec<UsbDevice>> {
        let inventory = self.os.enumerate_usb_devices().await?;
        let mut current = build_inventory(&inventory, Utc::now());

        let mut state = self.state.lock().await;
        for (id, device) in current.iter_mut() {
            if let Some(known) = state.devices.get(id) {
                device.connected_time = known.connected_time;
            }
        }
        state.devices = current;
        Ok(state.devices.values().cloned().collect())
    }

    /// USB storage devices the OS has ever installed, attached or not,
    /// ordered by device class then instance.
    pub async fn device_history(&self) -> OsResult<Vec<UsbHistoryEntry>> {
        let mut history = self.os.usb_device_history().await?;
        history.sort_by(|a, b| {
            (a.device_class.as_str(), a.instance_id.as_str())
                .cmp(&(b.device_class.as_str(), b.instance_id.as_str()))
        });
        history.dedup();
        debug!("{} USB storage device(s) in history", history.len());
        Ok(history)
    }

    /// Whether the current policy allows `device`.
    pub async fn is_device_allowed(&self, device: &UsbDevice) -> bool {
        !should_block(device, &self.state.lock().await.policy).0
    }

    /// Handle a device arrival: diff against the known map, decide on new
    /// devices and forget removed ones.
    pub async fn handle_arrival(&self) -> OsResult<()> {
        let inventory = self.os.enumerate_usb_devices().await?;
        let current = build_inventory(&inventory, Utc::now());

        let mut state = self.state.lock().await;
        state.devices.retain(|id, _| current.contains_key(id));

        for (id, device) in current {
            if let Some(known) = state.devices.get_mut(&id) {
                known.drive_letter = device.drive_letter;
                known.device_type = device.device_type;
                continue;
            }

            info!("New USB device: {} ({})", device.description, device.device_type);
            self.audit.log(AuditEvent::UsbConnected {
                device_id: device.device_id.clone(),
                vendor_id: device.vendor_id.clone(),
                product_id: device.product_id.clone(),
                device_type: device.device_type.to_string(),
                description: device.description.clone(),
            });

            let (block, reason) = should_block(&device, &state.policy);
            if block {
                let reason = reason.unwrap_or_else(|| "blocked by policy".to_string());
                self.block_device(&device, &reason).await;
            }
            state.devices.insert(id, device);
        }

        Ok(())
    }

    /// Catch-up pass: re-assert the storage block in block mode, then
    /// block any present, disallowed mass-storage device that still has a
    /// drive letter.
    pub async fn catch_up(&self) -> OsResult<()> {
        let mut state = self.state.lock().await;
        match state.policy.mode {
            UsbMode::Monitor => return Ok(()),
            UsbMode::Block if state.policy.block_mass_storage => {
                self.converge_storage_block(&mut state).await;
            }
            _ => {}
        }

        let inventory = self.os.enumerate_usb_devices().await?;
        let current = build_inventory(&inventory, Utc::now());

        for (id, device) in current {
            let candidate = device.device_type == DeviceType::MassStorage
                && device.drive_letter.is_some();
            if candidate {
                let (block, reason) = should_block(&device, &state.policy);
                if block {
                    info!("Catching missed storage device: {}", device.description);
                    let reason = reason.unwrap_or_else(|| "blocked by policy".to_string());
                    self.block_device(&device, &reason).await;
                }
            }
            state.devices.entry(id).or_insert(device);
        }
        Ok(())
    }

    /// Apply the snapshot's USB section.
    pub async fn apply_policy(&self, snapshot: &PolicySnapshot) {
        self.set_whitelist(snapshot.usb_whitelist.clone()).await;
        if self.mode().await != snapshot.usb_mode {
            self.set_mode(snapshot.usb_mode).await;
        }
    }

    /// Start enforcing `policy` and keep following it.
    pub async fn start(self: &Arc<Self>, policy: &PolicyState) {
        let mut running = self.workers.lock().await;
        if running.is_some() {
            debug!("USB controller already running");
            return;
        }

        if let Err(e) = self.rescan().await {
            warn!("Initial USB scan failed: {}", e);
        }
        let snapshot = policy.current();
        self.apply_policy(&snapshot).await;

        let mut workers = Workers::new();
        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        let policy_rx = policy.subscribe();
        workers.spawn("usb-detect", async move {
            this.run_detection_loop(policy_rx, shutdown_rx).await;
        });

        *running = Some(workers);
        info!("USB controller started in {} mode", snapshot.usb_mode);
    }

    /// Stop the loop, re-enable the storage driver and clear the deny
    /// policy. Safe to call repeatedly, and before `start()`.
    pub async fn stop(&self) {
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop(self.options.stop_timeout).await;
        }

        self.state.lock().await.storage_blocked = false;
        if let Err(e) = apply_storage_block(self.os.as_ref(), false).await {
            error!("Failed to lift USB storage block: {}", e);
        }
        info!("USB controller stopped");
    }

    async fn run_detection_loop(
        &self,
        mut policy_rx: watch::Receiver<Arc<PolicySnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = self.os.watch_device_change(self.options.watch_timeout) => {
                    match event {
                        Ok(Some(DeviceEvent::Arrival)) => {
                            tokio::time::sleep(self.options.settle_delay).await;
                            if let Err(e) = self.handle_arrival().await {
                                warn!("USB arrival handling failed: {}", e);
                            }
                        }
                        Ok(Some(DeviceEvent::Removal)) => {
                            if let Err(e) = self.rescan().await {
                                warn!("USB rescan failed: {}", e);
                            }
                        }
                        Ok(None) => {
                            if let Err(e) = self.catch_up().await {
                                warn!("USB catch-up scan failed: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("USB device watch failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                changed = policy_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = policy_rx.borrow_and_update().clone();
                    self.apply_policy(&snapshot).await;
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }

    async fn eject_disallowed_storage(&self, state: &mut UsbState, reason: &str) {
        let targets: Vec<UsbDevice> = state
            .devices
            .values()
            .filter(|d| {
                !d.is_protected()
                    && d.device_type == DeviceType::MassStorage
                    && d.drive_letter.is_some()
                    && !d.matches_whitelist(&state.policy.whitelist)
            })
            .cloned()
            .collect();

        for device in targets {
            if self.eject(&device, reason).await
                && let Some(known) = state.devices.get_mut(&device.device_id)
            {
                known.drive_letter = None;
            }
        }
    }

    /// Write the storage block unless it is known to be in place and still
    /// reads back intact. Group policy is refreshed only when it is written.
    async fn converge_storage_block(&self, state: &mut UsbState) {
        if state.storage_blocked {
            match storage_block_in_place(self.os.as_ref()).await {
                Ok(true) => return,
                Ok(false) => warn!("USB storage block drifted, re-applying"),
                Err(e) => warn!("Could not verify USB storage block: {}", e),
            }
        }

        match apply_storage_block(self.os.as_ref(), true).await {
            Ok(()) => state.storage_blocked = true,
            Err(e) => {
                state.storage_blocked = false;
                warn!("USB storage block not converged: {}", e);
            }
        }
    }

    async fn block_device(&self, device: &UsbDevice, reason: &str) {
        warn!("Blocking USB device {}: {}", device.description, reason);

        if device.drive_letter.is_some() {
            self.eject(device, reason).await;
        } else {
            self.audit.log(AuditEvent::UsbBlocked {
                device_id: device.device_id.clone(),
                reason: reason.to_string(),
                drive_letter: None,
            });
        }
    }

    /// Eject the device's volume. Returns whether it succeeded.
    async fn eject(&self, device: &UsbDevice, reason: &str) -> bool {
        let Some(letter) = device.drive_letter.as_deref() else {
            return false;
        };

        info!("Ejecting {} ({})", device.description, letter);
        match self.os.eject_volume(letter).await {
            Ok(()) => {
                self.audit.log(AuditEvent::UsbBlocked {
                    device_id: device.device_id.clone(),
                    reason: reason.to_string(),
                    drive_letter: Some(letter.to_string()),
                });
                true
            }
            Err(e) => {
                warn!("Failed to eject {}: {}", letter, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{Hive, MemoryOs, OsOp, RawDevice, RawDisk, RegistryValue};
    use crate::usb::enforce::{REMOVABLE_DISKS_POLICY, START_DISABLED, START_ENABLED, USBSTOR_KEY};

    const STICK_ID: &str = r"USB\VID_0781&PID_5567\4C530001";

    fn options() -> UsbOptions {
        UsbOptions {
            watch_timeout: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn controller(os: &Arc<MemoryOs>) -> Arc<UsbPolicyController> {
        Arc::new(UsbPolicyController::new(
            os.clone(),
            Arc::new(AuditLogger::new_null()),
            options(),
        ))
    }

    fn attach_stick(os: &MemoryOs, id: &str, letter: &str, silently: bool) {
        let device = RawDevice {
            device_id: id.to_string(),
            service: Some("USBSTOR".to_string()),
            compatible_ids: vec![],
            description: "SanDisk Cruzer Blade".to_string(),
        };
        let disk = RawDisk {
            device_id: id.to_string(),
            serial: None,
            description: "SanDisk Cruzer Blade USB Device".to_string(),
            drive_letter: Some(letter.to_string()),
        };
        os.attach_disk(disk);
        if silently {
            os.attach_device_silently(device);
        } else {
            os.attach_device(device);
        }
    }

    fn attach_keyboard(os: &MemoryOs) {
        os.attach_device_silently(RawDevice {
            device_id: r"USB\VID_046D&PID_C31C\6&1".to_string(),
            service: Some("HidUsb".to_string()),
            compatible_ids: vec![r"USB\Class_03".to_string()],
            description: "USB Input Device".to_string(),
        });
    }

    fn usbstor_start(os: &MemoryOs) -> Option<RegistryValue> {
        os.registry_value(Hive::LocalMachine, USBSTOR_KEY, "Start")
    }

    #[tokio::test]
    async fn test_entering_block_ejects_storage_only() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        attach_keyboard(&os);
        let usb = controller(&os);
        usb.rescan().await.unwrap();

        usb.set_mode(UsbMode::Block).await;

        assert_eq!(os.ejected(), vec!["E:"]);
        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_DISABLED)));
        assert_eq!(
            os.registry_value(Hive::LocalMachine, REMOVABLE_DISKS_POLICY, "Deny_Read"),
            Some(RegistryValue::Dword(1))
        );
        assert!(os.policy_refreshes() >= 1);
    }

    #[tokio::test]
    async fn test_block_mode_skips_whitelisted() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);
        usb.rescan().await.unwrap();

        assert!(usb.add_to_whitelist(WhitelistRule::new("0781", "5567")).await);
        assert!(!usb.add_to_whitelist(WhitelistRule::new("0781", "5567")).await);
        usb.set_mode(UsbMode::Block).await;

        assert!(os.ejected().is_empty());
    }

    #[tokio::test]
    async fn test_leaving_block_reenables() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);

        usb.set_mode(UsbMode::Block).await;
        usb.set_mode(UsbMode::Monitor).await;

        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_ENABLED)));
        assert!(
            os.registry_value(Hive::LocalMachine, REMOVABLE_DISKS_POLICY, "Deny_Read")
                .is_none()
        );
        assert_eq!(os.policy_refreshes(), 2);
    }

    #[tokio::test]
    async fn test_whitelist_mode_does_not_touch_driver() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);

        usb.set_mode(UsbMode::Whitelist).await;

        assert_eq!(usbstor_start(&os), None);
        assert_eq!(os.policy_refreshes(), 0);
    }

    #[tokio::test]
    async fn test_arrival_in_whitelist_mode() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        usb.set_whitelist(vec![WhitelistRule::new("0781", "5567")]).await;
        usb.set_mode(UsbMode::Whitelist).await;

        attach_stick(&os, STICK_ID, "E:", true);
        attach_stick(&os, r"USB\VID_0951&PID_1666\AAA", "F:", true);
        attach_keyboard(&os);
        usb.handle_arrival().await.unwrap();

        assert_eq!(os.ejected(), vec!["F:"]);
        assert_eq!(usb.connected_devices().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_removed_device_forgotten() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);
        usb.handle_arrival().await.unwrap();
        assert_eq!(usb.connected_devices().await.unwrap().len(), 1);

        os.detach_device(STICK_ID);
        usb.handle_arrival().await.unwrap();
        assert!(usb.rescan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_blocks_missed_device() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        usb.set_mode(UsbMode::Block).await;

        attach_stick(&os, STICK_ID, "E:", true);
        usb.catch_up().await.unwrap();

        assert_eq!(os.ejected(), vec!["E:"]);
    }

    #[tokio::test]
    async fn test_catch_up_idle_in_monitor_mode() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);

        usb.catch_up().await.unwrap();
        assert!(os.ejected().is_empty());
    }

    #[tokio::test]
    async fn test_eject_failure_is_not_fatal() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);
        usb.rescan().await.unwrap();
        os.fail(OsOp::EjectVolume);

        usb.set_mode(UsbMode::Block).await;
        assert_eq!(usb.mode().await, UsbMode::Block);
        assert!(os.ejected().is_empty());

        // Retried on the next catch-up
        os.heal(OsOp::EjectVolume);
        usb.catch_up().await.unwrap();
        assert_eq!(os.ejected(), vec!["E:"]);
    }

    #[tokio::test]
    async fn test_failed_storage_block_retried_on_catch_up() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        os.fail(OsOp::Registry);

        usb.set_mode(UsbMode::Block).await;
        assert_eq!(usbstor_start(&os), None);

        os.heal(OsOp::Registry);
        usb.catch_up().await.unwrap();
        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_DISABLED)));
        assert_eq!(
            os.registry_value(Hive::LocalMachine, REMOVABLE_DISKS_POLICY, "Deny_Write"),
            Some(RegistryValue::Dword(1))
        );
    }

    #[tokio::test]
    async fn test_catch_up_corrects_driver_drift() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        usb.set_mode(UsbMode::Block).await;

        os.set_registry_value(
            Hive::LocalMachine,
            USBSTOR_KEY,
            "Start",
            RegistryValue::Dword(START_ENABLED),
        );
        usb.catch_up().await.unwrap();

        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_DISABLED)));
        assert_eq!(os.policy_refreshes(), 2);
    }

    #[tokio::test]
    async fn test_catch_up_does_not_refresh_per_device() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);
        usb.rescan().await.unwrap();
        os.fail(OsOp::EjectVolume);

        usb.set_mode(UsbMode::Block).await;
        assert_eq!(os.policy_refreshes(), 1);

        for _ in 0..5 {
            usb.catch_up().await.unwrap();
        }
        assert_eq!(os.policy_refreshes(), 1);
        assert!(os.ejected().is_empty());
    }

    #[tokio::test]
    async fn test_detection_loop_converges_after_registry_heals() {
        let os = Arc::new(MemoryOs::new());
        os.fail(OsOp::Registry);
        let usb = controller(&os);
        let mut snapshot = PolicySnapshot::default();
        snapshot.usb_mode = UsbMode::Block;
        let policy = PolicyState::new(snapshot);

        usb.start(&policy).await;
        assert_eq!(usbstor_start(&os), None);
        os.heal(OsOp::Registry);

        for _ in 0..50 {
            if usbstor_start(&os) == Some(RegistryValue::Dword(START_DISABLED)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_DISABLED)));
        usb.stop().await;
    }

    #[tokio::test]
    async fn test_device_history_includes_detached_devices() {
        let os = Arc::new(MemoryOs::new());
        let entry = |class: &str, instance: &str| UsbHistoryEntry {
            device_class: class.to_string(),
            instance_id: instance.to_string(),
            friendly_name: Some("USB Device".to_string()),
        };
        os.record_usb_history(entry("Disk&Ven_Kingston&Prod_DataTraveler&Rev_1.00", "001A&0"));
        os.record_usb_history(entry("Disk&Ven_SanDisk&Prod_Cruzer_Blade&Rev_1.00", "4C53&0"));
        os.record_usb_history(entry("Disk&Ven_Kingston&Prod_DataTraveler&Rev_1.00", "001A&0"));
        let usb = controller(&os);

        let history = usb.device_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].device_class.contains("Kingston"));
        assert!(usb.connected_devices().await.unwrap().is_empty());

        os.fail(OsOp::UsbHistory);
        assert!(usb.device_history().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_from_whitelist() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        usb.set_whitelist(vec![
            WhitelistRule::new("0781", "5567"),
            WhitelistRule::new("0951", "1666"),
        ])
        .await;

        assert!(usb.remove_from_whitelist("0781", "5567").await);
        assert!(!usb.remove_from_whitelist("0781", "5567").await);
        assert_eq!(usb.whitelist().await, vec![WhitelistRule::new("0951", "1666")]);
    }

    #[tokio::test]
    async fn test_is_device_allowed() {
        let os = Arc::new(MemoryOs::new());
        attach_stick(&os, STICK_ID, "E:", true);
        let usb = controller(&os);
        let device = usb.rescan().await.unwrap().remove(0);

        assert!(usb.is_device_allowed(&device).await);
        usb.set_mode(UsbMode::Block).await;
        assert!(!usb.is_device_allowed(&device).await);
    }

    #[tokio::test]
    async fn test_detection_loop_blocks_arrival_and_stop_reenables() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        let mut snapshot = PolicySnapshot::default();
        snapshot.usb_mode = UsbMode::Block;
        let policy = PolicyState::new(snapshot);

        usb.start(&policy).await;
        attach_stick(&os, STICK_ID, "E:", false);

        for _ in 0..50 {
            if !os.ejected().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(os.ejected(), vec!["E:"]);

        usb.stop().await;
        usb.stop().await;
        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_ENABLED)));
    }

    #[tokio::test]
    async fn test_loop_follows_policy_mode() {
        let os = Arc::new(MemoryOs::new());
        let usb = controller(&os);
        let policy = PolicyState::new(PolicySnapshot::default());
        usb.start(&policy).await;

        policy.update(|current| {
            let mut next = current.clone();
            next.version += 1;
            next.usb_mode = UsbMode::Block;
            next
        });

        for _ in 0..50 {
            if usb.mode().await == UsbMode::Block {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(usb.mode().await, UsbMode::Block);
        usb.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_clears_block() {
        let os = Arc::new(MemoryOs::new());
        os.set_registry_value(
            Hive::LocalMachine,
            USBSTOR_KEY,
            "Start",
            RegistryValue::Dword(START_DISABLED),
        );
        let usb = controller(&os);

        usb.stop().await;
        assert_eq!(usbstor_start(&os), Some(RegistryValue::Dword(START_ENABLED)));
    }

    #[test]
    fn test_options_from_config() {
        let options = UsbOptions::from_config(&Config::embedded().unwrap());
        assert!(options.block_mass_storage);
        assert!(!options.block_ptp);
        assert_eq!(options.watch_timeout, Duration::from_millis(2000));
    }
}
