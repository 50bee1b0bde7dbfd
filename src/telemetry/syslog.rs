//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `ENDPOINT_GUARD` tag
//! for SIEM integration and security audit trails.

use std::sync::Mutex;

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;
use crate::config::TelemetryConfig;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "ENDPOINT_GUARD";

/// Audit logger that writes structured JSON events to syslog.
///
/// Shared between controllers by `Arc`; the writer sits behind a mutex so
/// events can be logged from shared references.
pub struct AuditLogger {
    /// Syslog writer protected by a mutex for interior mutability.
    /// None indicates a null logger (for testing).
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

fn formatter() -> Formatter3164 {
    Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: SYSLOG_TAG.to_string(),
        pid: std::process::id(),
    }
}

impl AuditLogger {
    /// Create a new audit logger connected to the local syslog daemon.
    #[cfg(unix)]
    pub fn new() -> Result<Self, TelemetryError> {
        let writer = syslog::unix(formatter()).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to connect to syslog: {}", e))
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a new audit logger connected to the local syslog daemon.
    ///
    /// There is no local daemon on this platform; configure
    /// `telemetry.syslog_server` instead.
    #[cfg(not(unix))]
    pub fn new() -> Result<Self, TelemetryError> {
        Err(TelemetryError::NoLocalSyslog)
    }

    /// Create an audit logger that sends to a remote syslog server over UDP.
    pub fn remote(server: &str) -> Result<Self, TelemetryError> {
        let writer = syslog::udp(formatter(), "0.0.0.0:0", server).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to reach {}: {}", server, e))
        })?;

        debug!("Sending audit events to {} with tag '{}'", server, SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create the logger described by the telemetry configuration.
    pub fn from_config(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        if config.syslog == Some(false) {
            return Ok(Self::new_null());
        }
        if !config.syslog_server.is_empty() {
            return Self::remote(&config.syslog_server);
        }
        Self::new()
    }

    /// Create a null audit logger that discards all events.
    ///
    /// Useful for testing when syslog is not available.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event to syslog.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            // Null logger - discard silently
            return;
        };

        let timestamped = event.with_timestamp();

        match serde_json::to_string(&timestamped) {
            Ok(json) => {
                match writer.lock() {
                    Ok(mut writer) => {
                        if let Err(e) = writer.info(&json) {
                            error!("Failed to write to syslog: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to acquire syslog writer lock: {}", e);
                    }
                }
                debug!("Logged audit event: {}", json);
            }
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
            }
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "ENDPOINT_GUARD");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());

        // Should not panic
        logger.log(AuditEvent::SiteBlocked {
            domain: "example.com".to_string(),
        });
    }

    #[test]
    fn test_disabled_config_gives_null_logger() {
        let config = TelemetryConfig {
            syslog: Some(false),
            syslog_server: "10.0.0.5:514".to_string(),
        };
        assert!(AuditLogger::from_config(&config).unwrap().is_null());
    }

    #[test]
    fn test_remote_logger_sends_udp() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let server = receiver.local_addr().unwrap().to_string();

        let logger = AuditLogger::remote(&server).unwrap();
        logger.log(AuditEvent::SiteUnblocked {
            domain: "example.com".to_string(),
        });

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let message = String::from_utf8_lossy(&buf[..len]);
        assert!(message.contains(SYSLOG_TAG));
        assert!(message.contains("\"event\":\"site_unblocked\""));
    }

    // Integration test - requires syslog daemon
    #[cfg(unix)]
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }
}
