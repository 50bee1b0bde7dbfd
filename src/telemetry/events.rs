//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `ENDPOINT_GUARD` tag
//! for SIEM integration and security audit trails.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
///
/// Each variant represents a significant security-relevant event that
/// is logged to syslog for audit purposes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Agent started.
    AgentStart {
        /// Machine identifier.
        machine_id: String,
        /// Agent version.
        version: String,
        /// Process ID of the agent.
        pid: u32,
    },

    /// Agent stopped and restored the machine.
    AgentStop {
        /// Machine identifier.
        machine_id: String,
        /// Seconds the agent was running.
        uptime_sec: u64,
    },

    /// A new policy snapshot was published.
    PolicyApplied {
        /// Snapshot version.
        version: u64,
        /// Sections of the pushed document that were rejected.
        rejected: Vec<String>,
    },

    /// Domain added to the block set.
    SiteBlocked {
        /// Domain that is now blocked.
        domain: String,
    },

    /// Domain removed from the block set.
    SiteUnblocked {
        /// Domain that is no longer blocked.
        domain: String,
    },

    /// A DNS query passed through the local proxy.
    DnsQuery {
        /// Queried name.
        domain: String,
        /// Numeric query type.
        qtype: u16,
        /// Whether the query was answered NXDOMAIN or forwarded.
        decision: Decision,
    },

    /// USB device seen for the first time.
    UsbConnected {
        /// OS device identifier.
        device_id: String,
        /// Vendor ID.
        vendor_id: String,
        /// Product ID.
        product_id: String,
        /// Classified device type.
        device_type: String,
        /// Friendly name.
        description: String,
    },

    /// USB device blocked.
    UsbBlocked {
        /// OS device identifier.
        device_id: String,
        /// Why the device was blocked.
        reason: String,
        /// Drive letter that was ejected, if any.
        drive_letter: Option<String>,
    },

    /// USB enforcement mode changed.
    UsbModeChanged {
        /// Previous mode.
        from: String,
        /// New mode.
        to: String,
    },

    /// Upload lockdown switched on or off.
    UploadLockChanged {
        /// Whether uploads are now locked down.
        locked: bool,
        /// Number of whitelisted domains.
        whitelist_size: usize,
    },

    /// A file dialog was closed while uploads are locked.
    DialogBlocked {
        /// Window title.
        title: String,
        /// Window class.
        class_name: String,
        /// Owning process image, if known.
        process: Option<String>,
    },

    /// Temporary unlock granted for an approved file.
    UnlockGranted {
        /// SHA-256 of the file.
        file_hash: String,
        /// When the grant lapses.
        expires_at: DateTime<Utc>,
    },

    /// Temporary unlock refused.
    UnlockRejected {
        /// SHA-256 the request named.
        file_hash: String,
        /// Why it was refused.
        reason: String,
    },

    /// Temporary unlock lapsed and lockdown was restored.
    UnlockExpired {
        /// SHA-256 of the file.
        file_hash: String,
    },
}

/// Outcome of a DNS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Forwarded upstream.
    Allow,
    /// Answered NXDOMAIN.
    Block,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
