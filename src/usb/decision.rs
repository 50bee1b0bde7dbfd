//! Per-device block decision.

use crate::policy::{UsbMode, WhitelistRule};

use super::device::{DeviceType, UsbDevice};

/// Inputs to [`should_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPolicy {
    /// Enforcement mode.
    pub mode: UsbMode,
    /// Devices allowed in whitelist mode.
    pub whitelist: Vec<WhitelistRule>,
    /// Block mass storage in block mode.
    pub block_mass_storage: bool,
    /// Block MTP devices in block mode.
    pub block_mtp: bool,
    /// Block PTP devices in block mode.
    pub block_ptp: bool,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            mode: UsbMode::Monitor,
            whitelist: Vec::new(),
            block_mass_storage: true,
            block_mtp: true,
            block_ptp: false,
        }
    }
}

/// Decide whether `device` must be blocked under `policy`, and why.
///
/// Protected devices are never blocked, whatever the mode.
pub fn should_block(device: &UsbDevice, policy: &BlockPolicy) -> (bool, Option<String>) {
    if device.is_protected() {
        return (false, None);
    }

    match policy.mode {
        UsbMode::Monitor => (false, None),
        UsbMode::Whitelist => {
            if device.matches_whitelist(&policy.whitelist) || !device.device_type.is_storage() {
                (false, None)
            } else {
                (true, Some("not in whitelist".to_string()))
            }
        }
        UsbMode::Block => {
            let blocked = match device.device_type {
                DeviceType::MassStorage => policy.block_mass_storage,
                DeviceType::Mtp => policy.block_mtp,
                DeviceType::Ptp => policy.block_ptp,
                _ => false,
            };
            if blocked {
                let reason = format!("{} devices are blocked", device.device_type);
                (true, Some(reason))
            } else {
                (false, None)
            }
        }
    }
}
