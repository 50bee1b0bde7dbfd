//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur during telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// No local syslog daemon exists on this platform.
    #[error("No local syslog on this platform - set telemetry.syslog_server")]
    NoLocalSyslog,
}
