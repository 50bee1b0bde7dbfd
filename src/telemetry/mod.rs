//! Telemetry and audit logging for endpoint-guard.
//!
//! This module provides structured logging to syslog with the `ENDPOINT_GUARD` tag.
//! All enforcement decisions are logged for SIEM integration and audit trails.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): Security events go to syslog, local or remote
//! - **Debug logging** (tracing): Operational logs go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```ignore
//! use endpoint_guard::telemetry::{AuditEvent, AuditLogger};
//!
//! let audit = Arc::new(AuditLogger::from_config(&config.telemetry)?);
//! audit.log(AuditEvent::SiteBlocked {
//!     domain: "example.com".to_string(),
//! });
//! ```
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"usb_blocked","device_id":"USB\\VID_0781&PID_5567\\4C53","reason":"not in whitelist","drive_letter":"E:"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, Decision, TimestampedEvent};
pub use syslog::{AuditLogger, SYSLOG_TAG};
