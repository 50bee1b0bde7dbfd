//! Error types for management-server sync.

use thiserror::Error;

/// Errors talking to the management server.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure, timeout or undecodable body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        /// Path that was called.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// No API key yet; the agent must register first.
    #[error("Agent is not registered")]
    NotRegistered,

    /// The response parsed but lacks a required field.
    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse {
        /// Path that was called.
        endpoint: &'static str,
        /// What was wrong.
        message: String,
    },
}
