//! The declarative policy every controller converges towards.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::document::PolicyDocument;

/// How blocked domains are withheld from name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMethod {
    /// Entries in the hosts file.
    #[default]
    Hosts,
    /// A local DNS proxy answering NXDOMAIN.
    DnsProxy,
}

/// USB enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbMode {
    /// Observe and log only.
    #[default]
    Monitor,
    /// Block storage-class devices by category.
    Block,
    /// Only allow whitelisted storage-class devices.
    Whitelist,
}

impl fmt::Display for UsbMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UsbMode::Monitor => "monitor",
            UsbMode::Block => "block",
            UsbMode::Whitelist => "whitelist",
        };
        f.write_str(name)
    }
}

fn wildcard() -> String {
    "*".to_string()
}

/// A USB whitelist entry. `vid`/`pid` may be `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRule {
    /// Vendor ID, hex, or `*`.
    #[serde(default = "wildcard")]
    pub vid: String,
    /// Product ID, hex, or `*`.
    #[serde(default = "wildcard")]
    pub pid: String,
    /// Serial number; only compared when present.
    #[serde(default)]
    pub serial: Option<String>,
}

impl WhitelistRule {
    /// Create a rule without a serial constraint.
    pub fn new(vid: impl Into<String>, pid: impl Into<String>) -> Self {
        Self {
            vid: vid.into(),
            pid: pid.into(),
            serial: None,
        }
    }

    /// Restrict this rule to one serial number.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Check whether a device with these identifiers matches this rule.
    pub fn matches(&self, vid: &str, pid: &str, serial: Option<&str>) -> bool {
        let field = |rule: &str, value: &str| rule == "*" || rule.eq_ignore_ascii_case(value);

        if !field(&self.vid, vid) || !field(&self.pid, pid) {
            return false;
        }
        match self.serial.as_deref() {
            None | Some("") => true,
            Some(expected) => serial.is_some_and(|s| s.eq_ignore_ascii_case(expected)),
        }
    }
}

/// An immutable, versioned policy record.
///
/// Controllers only ever read snapshots; a sync produces a whole new one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    /// Monotonic version, incremented by every update.
    pub version: u64,
    /// Domains to block.
    pub blocked_domains: BTreeSet<String>,
    /// Domains exempt from blocking.
    pub allowed_domains: BTreeSet<String>,
    /// Resolution-level blocking mechanism.
    pub blocking_method: BlockingMethod,
    /// USB enforcement mode.
    pub usb_mode: UsbMode,
    /// USB whitelist.
    pub usb_whitelist: Vec<WhitelistRule>,
    /// Whether uploads are locked down.
    pub upload_block_all: bool,
    /// Domains uploads may still reach while locked down.
    pub upload_whitelist: BTreeSet<String>,
    /// Lowercase hex SHA-256 of files approved for upload.
    pub approved_file_hashes: BTreeSet<String>,
}

impl PolicySnapshot {
    /// Blocked domains minus allowed domains.
    pub fn effective_blocked_domains(&self) -> BTreeSet<String> {
        self.blocked_domains
            .difference(&self.allowed_domains)
            .cloned()
            .collect()
    }

    /// Check whether a file hash has been approved for upload.
    #[cfg(test)]
    pub fn is_hash_approved(&self, hash: &str) -> bool {
        self.approved_file_hashes.contains(&hash.to_ascii_lowercase())
    }

    /// Produce the next snapshot with the sections present in `document`.
    ///
    /// Sections and fields the document omits keep their current values.
    pub fn with_document(&self, document: &PolicyDocument) -> PolicySnapshot {
        let mut next = self.clone();
        next.version = self.version + 1;

        if let Some(network) = &document.network {
            if let Some(sites) = &network.blocked_sites {
                next.blocked_domains = normalize_domains(sites);
            }
            if let Some(sites) = &network.allowed_sites {
                next.allowed_domains = normalize_domains(sites);
            }
            if let Some(method) = network.blocking_method {
                next.blocking_method = method;
            }
        }

        if let Some(usb) = &document.usb {
            if let Some(mode) = usb.mode {
                next.usb_mode = mode;
            }
            if let Some(whitelist) = &usb.whitelist {
                next.usb_whitelist = whitelist.clone();
            }
        }

        if let Some(uploads) = &document.uploads {
            if let Some(block_all) = uploads.block_all {
                next.upload_block_all = block_all;
            }
            if let Some(whitelist) = &uploads.whitelist {
                next.upload_whitelist = normalize_domains(whitelist);
            }
        }

        next
    }

    /// Produce the next snapshot with a new approved-hash set.
    pub fn with_approved_hashes<I, S>(&self, hashes: I) -> PolicySnapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.approved_file_hashes = hashes
            .into_iter()
            .filter_map(|h| normalize_hash(h.as_ref()))
            .collect();
        next
    }
}

/// Normalize a domain as typed by an administrator.
///
/// Lowercases, strips a URL scheme, path, trailing dot and leading `*.`.
/// Returns `None` for anything that is not a plausible host name.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut domain = raw.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest.to_string();
        }
    }
    if let Some(pos) = domain.find('/') {
        domain.truncate(pos);
    }
    while let Some(rest) = domain.strip_prefix("*.") {
        domain = rest.to_string();
    }
    let domain = domain.trim_end_matches('.');

    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');

    valid.then(|| domain.to_string())
}

fn normalize_domains(raw: &[String]) -> BTreeSet<String> {
    raw.iter()
        .filter_map(|d| {
            let normalized = normalize_domain(d);
            if normalized.is_none() {
                tracing::warn!("Ignoring invalid domain in policy: {:?}", d);
            }
            normalized
        })
        .collect()
}

/// Normalize a SHA-256 hex digest; `None` if it is not 64 hex characters.
pub fn normalize_hash(raw: &str) -> Option<String> {
    let hash = raw.trim().to_ascii_lowercase();
    (hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())).then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("Example.COM"), Some("example.com".to_string()));
        assert_eq!(normalize_domain("*.example.com"), Some("example.com".to_string()));
        assert_eq!(
            normalize_domain("https://www.example.com/login"),
            Some("www.example.com".to_string())
        );
        assert_eq!(normalize_domain("example.com."), Some("example.com".to_string()));
        assert_eq!(normalize_domain("   "), None);
        assert_eq!(normalize_domain("bad domain.com"), None);
        assert_eq!(normalize_domain("a..b"), None);
    }

    #[test]
    fn test_normalize_hash() {
        let hash = "A".repeat(64);
        assert_eq!(normalize_hash(&hash), Some("a".repeat(64)));
        assert_eq!(normalize_hash("abc"), None);
        assert_eq!(normalize_hash(&"g".repeat(64)), None);
    }

    #[test]
    fn test_effective_blocked_domains() {
        let snapshot = PolicySnapshot {
            blocked_domains: ["facebook.com", "reddit.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_domains: ["reddit.com".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let effective = snapshot.effective_blocked_domains();
        assert_eq!(effective.len(), 1);
        assert!(effective.contains("facebook.com"));
    }

    #[test]
    fn test_whitelist_rule_matching() {
        let rule = WhitelistRule::new("1234", "5678");
        assert!(rule.matches("1234", "5678", None));
        assert!(rule.matches("1234", "5678", Some("ABC")));
        assert!(!rule.matches("1234", "9999", None));

        let wildcard = WhitelistRule::new("0781", "*");
        assert!(wildcard.matches("0781", "5567", None));
        assert!(!wildcard.matches("0782", "5567", None));

        let lower = WhitelistRule::new("abcd", "ef01");
        assert!(lower.matches("ABCD", "EF01", None));
    }

    #[test]
    fn test_whitelist_rule_serial() {
        let rule = WhitelistRule::new("1234", "5678").with_serial("SN001");
        assert!(rule.matches("1234", "5678", Some("sn001")));
        assert!(!rule.matches("1234", "5678", Some("SN002")));
        assert!(!rule.matches("1234", "5678", None));
    }

    #[test]
    fn test_whitelist_rule_defaults() {
        let rule: WhitelistRule = serde_json::from_str(r#"{"vid": "1234"}"#).unwrap();
        assert_eq!(rule.pid, "*");
        assert_eq!(rule.serial, None);
    }

    #[test]
    fn test_with_approved_hashes_bumps_version() {
        let snapshot = PolicySnapshot::default();
        let valid = "b".repeat(64);
        let next = snapshot.with_approved_hashes([valid.as_str(), "not-a-hash"]);

        assert_eq!(next.version, 1);
        assert_eq!(next.approved_file_hashes.len(), 1);
        assert!(next.is_hash_approved(&"B".repeat(64)));
    }

    #[test]
    fn test_usb_mode_display() {
        assert_eq!(UsbMode::Whitelist.to_string(), "whitelist");
    }
}
