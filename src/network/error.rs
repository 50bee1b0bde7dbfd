//! Error types for the DNS proxy.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while parsing or answering DNS queries.
#[derive(Debug, Error)]
pub enum DnsError {
    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the listening socket.
    #[error("Failed to bind DNS proxy on {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Datagram ended before the structure it was supposed to contain.
    #[error("Truncated DNS message: {0}")]
    Truncated(&'static str),

    /// Datagram has the QR bit set.
    #[error("DNS message is a response, not a query")]
    NotAQuery,

    /// QDCOUNT is zero.
    #[error("DNS query has no question")]
    NoQuestion,

    /// A compression pointer appeared in the question name.
    #[error("Compressed name in DNS query")]
    CompressedName,

    /// Question name exceeds 255 bytes.
    #[error("DNS name too long")]
    NameTooLong,

    /// Upstream resolver did not answer in time.
    #[error("Upstream resolver timed out after {0:?}")]
    UpstreamTimeout(Duration),
}
