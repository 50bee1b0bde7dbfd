//! USB device control.
//!
//! Devices are enumerated through the OS adapter, classified
//! ([`device`]), and decided on one at a time ([`decision`]). Disallowed
//! storage is ejected. In block mode the mass-storage driver and the
//! removable-disk group policy are switched off as well ([`enforce`]).
//!
//! Human interface devices, hubs, and anything whose description names an
//! input, network, audio or imaging function are never blocked.

mod controller;
pub mod decision;
pub mod device;
pub mod enforce;

pub use controller::{UsbOptions, UsbPolicyController};
pub use decision::{should_block, BlockPolicy};
pub use device::{build_inventory, classify, parse_device_id, DeviceId, DeviceType, UsbDevice};
