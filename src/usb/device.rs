//! USB device model and classification.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::os::{RawDevice, RawDisk, UsbInventory};
use crate::policy::WhitelistRule;

/// Description keywords that mark a device as protected.
pub const PROTECTED_KEYWORDS: &[&str] = &[
    "keyboard",
    "mouse",
    "hid",
    "input device",
    "bluetooth",
    "wireless",
    "lan",
    "ethernet",
    "network",
    "audio",
    "sound",
    "speaker",
    "microphone",
    "webcam",
    "camera",
    "video",
    "hub",
    "printer",
    "scanner",
];

/// Broad class of a USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// USB mass storage (flash drives, external disks).
    MassStorage,
    /// Media Transfer Protocol (phones, media players).
    Mtp,
    /// Picture Transfer Protocol (cameras).
    Ptp,
    /// Human interface device.
    Hid,
    /// USB hub.
    Hub,
    /// Anything else.
    Unknown,
}

impl DeviceType {
    /// Lowercase name used in audit events.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::MassStorage => "mass_storage",
            DeviceType::Mtp => "mtp",
            DeviceType::Ptp => "ptp",
            DeviceType::Hid => "hid",
            DeviceType::Hub => "hub",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Whether files can be copied to a device of this type.
    pub fn is_storage(self) -> bool {
        matches!(self, DeviceType::MassStorage | DeviceType::Mtp | DeviceType::Ptp)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified USB device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    /// OS device identifier; primary key.
    pub device_id: String,
    /// Four hex digit vendor ID, uppercase. Empty if the ID carries none.
    pub vendor_id: String,
    /// Four hex digit product ID, uppercase. Empty if the ID carries none.
    pub product_id: String,
    /// Serial number, if the device reports a real one.
    pub serial: Option<String>,
    /// Friendly name.
    pub description: String,
    /// Mounted drive letter (`E:`), for storage devices.
    pub drive_letter: Option<String>,
    /// Classified type.
    pub device_type: DeviceType,
    /// When the agent first saw the device.
    pub connected_time: DateTime<Utc>,
}

impl UsbDevice {
    /// Whether the device must never be blocked.
    pub fn is_protected(&self) -> bool {
        if matches!(self.device_type, DeviceType::Hid | DeviceType::Hub) {
            return true;
        }
        let description = self.description.to_lowercase();
        PROTECTED_KEYWORDS.iter().any(|k| description.contains(k))
    }

    /// Whether any rule in `whitelist` matches this device.
    pub fn matches_whitelist(&self, whitelist: &[WhitelistRule]) -> bool {
        whitelist
            .iter()
            .any(|rule| rule.matches(&self.vendor_id, &self.product_id, self.serial.as_deref()))
    }
}

/// Identifiers extracted from a device instance ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceId {
    /// Vendor ID.
    pub vid: String,
    /// Product ID.
    pub pid: String,
    /// Serial number, when the instance ID carries one.
    pub serial: Option<String>,
}

/// Parse `USB\VID_XXXX&PID_YYYY\SERIAL`.
///
/// Windows generates an instance suffix containing `&` for devices without
/// a serial number; that suffix is not reported as a serial.
pub fn parse_device_id(device_id: &str) -> DeviceId {
    let upper = device_id.to_uppercase();
    let parts: Vec<&str> = upper.split('\\').collect();
    let mut parsed = DeviceId::default();

    if let Some(ids) = parts.get(1) {
        for segment in ids.split('&') {
            if let Some(vid) = segment.strip_prefix("VID_") {
                parsed.vid = vid.chars().take(4).collect();
            } else if let Some(pid) = segment.strip_prefix("PID_") {
                parsed.pid = pid.chars().take(4).collect();
            }
        }
    }

    if let Some(serial) = parts.get(2)
        && !serial.is_empty()
        && !serial.contains('&')
    {
        parsed.serial = Some(serial.to_string());
    }

    parsed
}

/// Classify a device from its service, instance ID, description and
/// compatible IDs.
pub fn classify(raw: &RawDevice) -> DeviceType {
    let service = raw.service.as_deref().unwrap_or_default().to_lowercase();
    let device_id = raw.device_id.to_lowercase();
    let description = raw.description.to_lowercase();

    if service == "usbstor" || device_id.contains("usbstor") {
        return DeviceType::MassStorage;
    }
    if service == "hidusb" || description.contains("keyboard") || description.contains("mouse") {
        return DeviceType::Hid;
    }
    if service.contains("usbhub") {
        return DeviceType::Hub;
    }

    for compat in &raw.compatible_ids {
        let compat = compat.to_lowercase();
        if compat.contains("class_08") {
            return DeviceType::MassStorage;
        }
        if compat.contains("class_06") {
            return DeviceType::Ptp;
        }
        if compat.contains("class_03") {
            return DeviceType::Hid;
        }
        if compat.contains("mtp") || compat.contains("wpdbusenum") {
            return DeviceType::Mtp;
        }
    }

    DeviceType::Unknown
}

fn from_raw(raw: &RawDevice, now: DateTime<Utc>) -> UsbDevice {
    let id = parse_device_id(&raw.device_id);
    UsbDevice {
        device_id: raw.device_id.clone(),
        vendor_id: id.vid,
        product_id: id.pid,
        serial: id.serial,
        description: if raw.description.is_empty() {
            "USB Device".to_string()
        } else {
            raw.description.clone()
        },
        drive_letter: None,
        device_type: classify(raw),
        connected_time: now,
    }
}

fn from_disk(disk: &RawDisk, now: DateTime<Utc>) -> UsbDevice {
    let id = parse_device_id(&disk.device_id);
    UsbDevice {
        device_id: disk.device_id.clone(),
        vendor_id: id.vid,
        product_id: id.pid,
        serial: disk.serial.clone().or(id.serial),
        description: if disk.description.is_empty() {
            "USB Storage Device".to_string()
        } else {
            disk.description.clone()
        },
        drive_letter: disk.drive_letter.clone(),
        device_type: DeviceType::MassStorage,
        connected_time: now,
    }
}

/// Build the device map from an OS inventory.
///
/// Entities without a VID/PID are not USB functions and are skipped. Each
/// USB disk drive marks the device with the same ID, or else the same
/// serial, as mass storage and binds its drive letter; a disk that matches
/// nothing becomes a device of its own.
pub fn build_inventory(
    inventory: &UsbInventory,
    now: DateTime<Utc>,
) -> BTreeMap<String, UsbDevice> {
    let mut devices: BTreeMap<String, UsbDevice> = BTreeMap::new();

    for raw in &inventory.entities {
        let upper = raw.device_id.to_uppercase();
        if !upper.contains("VID_") || !upper.contains("PID_") {
            continue;
        }
        devices
            .entry(raw.device_id.clone())
            .or_insert_with(|| from_raw(raw, now));
    }

    for disk in &inventory.disks {
        let serial = disk
            .serial
            .clone()
            .or_else(|| parse_device_id(&disk.device_id).serial);

        let matched = devices
            .contains_key(&disk.device_id)
            .then(|| disk.device_id.clone())
            .or_else(|| {
                let serial = serial.as_deref()?;
                devices
                    .values()
                    .find(|d| {
                        d.serial
                            .as_deref()
                            .is_some_and(|s| s.eq_ignore_ascii_case(serial))
                    })
                    .map(|d| d.device_id.clone())
            });

        match matched.and_then(|id| devices.get_mut(&id)) {
            Some(device) => {
                device.device_type = DeviceType::MassStorage;
                device.drive_letter = disk.drive_letter.clone();
            }
            None => {
                devices.insert(disk.device_id.clone(), from_disk(disk, now));
            }
        }
    }

    devices
}

#[cfg(test)]
pub(crate) fn test_device(device_type: DeviceType, description: &str) -> UsbDevice {
    UsbDevice {
        device_id: r"USB\VID_0781&PID_5567\4C530001".to_string(),
        vendor_id: "0781".to_string(),
        product_id: "5567".to_string(),
        serial: Some("4C530001".to_string()),
        description: description.to_string(),
        drive_letter: Some("E:".to_string()),
        device_type,
        connected_time: Utc::now(),
    }
}
