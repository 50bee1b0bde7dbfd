//! OS adapter error types.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used by every [`OsAdapter`](super::OsAdapter) call.
pub type OsResult<T> = Result<T, OsError>;

/// Errors that can occur while talking to the operating system.
///
/// None of these are fatal to a controller: callers log them and treat the
/// affected enforcement as "not yet converged".
#[derive(Debug, Error)]
pub enum OsError {
    /// Failed to spawn an external command.
    #[error("Failed to run command '{cmd}': {source}")]
    CommandFailed {
        /// The command that was run.
        cmd: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// External command exited with a non-zero status.
    #[error("Command '{cmd}' failed: {stderr}")]
    CommandError {
        /// The command that was run.
        cmd: String,
        /// Standard error output (or stdout when stderr was empty).
        stderr: String,
    },

    /// External command or blocking call did not finish in time.
    #[error("'{cmd}' timed out after {timeout:?}")]
    Timeout {
        /// The command or call that was abandoned.
        cmd: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The agent lacks the privilege for this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Failed to read or write a file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file that was accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Command output could not be interpreted.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// Name resolution failed.
    #[error("Failed to resolve '{name}': {message}")]
    Resolve {
        /// The name that was looked up.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// A Win32 API call failed.
    #[error("{call} failed with error code {code}")]
    Win32 {
        /// The API that failed.
        call: &'static str,
        /// Value of `GetLastError()`.
        code: u32,
    },

    /// The operation has no implementation on this platform.
    #[error("{operation} is not supported on this platform")]
    Unsupported {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Failure injected by the in-memory adapter.
    #[error("Injected failure in {0}")]
    Injected(&'static str),
}

impl OsError {
    /// Build an IO error for `path`, mapping permission failures to
    /// [`OsError::PermissionDenied`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return OsError::PermissionDenied(path.display().to_string());
        }
        OsError::Io { path, source }
    }

    /// Check if this error stems from missing privileges.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            OsError::PermissionDenied(_) => true,
            OsError::CommandError { stderr, .. } => {
                let lower = stderr.to_lowercase();
                lower.contains("access is denied") || lower.contains("requires elevation")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_permission_denied_maps() {
        let err = OsError::io(
            "C:\\Windows\\System32\\drivers\\etc\\hosts",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, OsError::PermissionDenied(_)));
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_command_error_access_denied() {
        let err = OsError::CommandError {
            cmd: "netsh advfirewall firewall add rule".to_string(),
            stderr: "The requested operation requires elevation (Run as administrator).".to_string(),
        };
        assert!(err.is_permission_denied());

        let err = OsError::CommandError {
            cmd: "reg query".to_string(),
            stderr: "ERROR: The system was unable to find the specified registry key".to_string(),
        };
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn test_timeout_display() {
        let err = OsError::Timeout {
            cmd: "gpupdate /force".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "'gpupdate /force' timed out after 30s");
    }
}
