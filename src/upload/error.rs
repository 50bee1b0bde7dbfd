//! Error types for the upload unlock workflow.

use std::path::PathBuf;
use thiserror::Error;

/// Reasons a temporary unlock request is refused.
#[derive(Debug, Error)]
pub enum UnlockError {
    /// The hash is not in the approved set.
    #[error("File hash {0} is not approved")]
    NotApproved(String),

    /// The requested hash is not a sha256 hex digest.
    #[error("Invalid file hash {0:?}")]
    InvalidHash(String),

    /// The file's content does not hash to the approved value.
    #[error("File content hash {actual} does not match approved hash {expected}")]
    HashMismatch {
        /// Hash named in the request.
        expected: String,
        /// Hash of the file on disk.
        actual: String,
    },

    /// The path has no file name component.
    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    /// Reading the source file failed.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Preparing the gateway directory failed.
    #[error("Failed to prepare upload gateway {path}: {source}")]
    Gateway {
        /// Path that couldn't be created or written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl UnlockError {
    /// Short reason recorded in audit events.
    pub fn reason(&self) -> &'static str {
        match self {
            UnlockError::NotApproved(_) => "hash not approved",
            UnlockError::InvalidHash(_) => "invalid hash",
            UnlockError::HashMismatch { .. } => "content hash mismatch",
            UnlockError::NotAFile(_) => "not a file",
            UnlockError::Read { .. } => "source unreadable",
            UnlockError::Gateway { .. } => "gateway setup failed",
        }
    }
}
