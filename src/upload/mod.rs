//! Upload lockdown (DLP).
//!
//! Uploads are stopped at the file picker: browser and shell policies
//! disable file-selection dialogs ([`dialog`]), browsers are fenced by
//! firewall rules with allow exceptions for whitelisted domains, and a window
//! monitor closes any dialog that still appears.
//!
//! An approved file can be uploaded during a short unlock window. It is
//! copied alone into the gateway folder ([`gateway`]) and dialogs are
//! re-enabled until the grant lapses.
//!
//! `stop()` always leaves dialogs enabled.

mod controller;
pub mod dialog;
mod error;
pub mod gateway;

pub use controller::{UploadLockState, UploadOptions, UploadPolicyController};
pub use error::UnlockError;
pub use gateway::{Gateway, UnlockGrant};

/// Name prefix of every upload firewall rule.
pub const UPLOAD_RULE_PREFIX: &str = "EndpointGuard_Upload_";
