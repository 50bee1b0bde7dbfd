//! Typed policy document pushed by the management server.
//!
//! The heartbeat response carries a `config` object with up to three
//! sections. Each section is parsed on its own: a malformed section is
//! rejected and logged while the others still apply, and unknown fields are
//! ignored.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::snapshot::{BlockingMethod, UsbMode, WhitelistRule};

/// The `network` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkSection {
    /// Domains to block.
    #[serde(default)]
    pub blocked_sites: Option<Vec<String>>,
    /// Domains exempt from blocking.
    #[serde(default)]
    pub allowed_sites: Option<Vec<String>>,
    /// Hosts file or DNS proxy.
    #[serde(default)]
    pub blocking_method: Option<BlockingMethod>,
}

/// The `usb` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UsbSection {
    /// Enforcement mode.
    #[serde(default)]
    pub mode: Option<UsbMode>,
    /// Whitelisted devices.
    #[serde(default)]
    pub whitelist: Option<Vec<WhitelistRule>>,
}

/// The `uploads` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UploadsSection {
    /// Lock down all uploads.
    #[serde(default)]
    pub block_all: Option<bool>,
    /// Domains uploads may still reach.
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
}

/// A parsed policy document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDocument {
    /// Network section, if present and valid.
    pub network: Option<NetworkSection>,
    /// USB section, if present and valid.
    pub usb: Option<UsbSection>,
    /// Uploads section, if present and valid.
    pub uploads: Option<UploadsSection>,
    /// Names of sections that were present but rejected.
    pub rejected: Vec<&'static str>,
}

impl PolicyDocument {
    /// Parse a policy document from JSON, section by section.
    pub fn from_value(value: &Value) -> Self {
        let mut document = PolicyDocument::default();

        let Some(object) = value.as_object() else {
            warn!("Policy document is not a JSON object; ignoring");
            document.rejected.push("document");
            return document;
        };

        document.network = parse_section(object.get("network"), "network", &mut document.rejected);
        document.usb = parse_section(object.get("usb"), "usb", &mut document.rejected);
        document.uploads = parse_section(
            object.get("uploads").or_else(|| object.get("uploads_rules")),
            "uploads",
            &mut document.rejected,
        );

        document
    }

    /// Check whether no section will change the policy.
    pub fn is_empty(&self) -> bool {
        self.network.is_none() && self.usb.is_none() && self.uploads.is_none()
    }
}

fn parse_section<T>(
    value: Option<&Value>,
    name: &'static str,
    rejected: &mut Vec<&'static str>,
) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value = value?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(section) => Some(section),
        Err(e) => {
            warn!("Rejecting '{}' policy section: {}", name, e);
            rejected.push(name);
            None
        }
    }
}
