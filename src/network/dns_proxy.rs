//! Local DNS proxy.
//!
//! Listens on the loopback resolver address and answers queries for
//! blocked names with NXDOMAIN. Everything else is forwarded verbatim to the
//! upstream resolver and the reply relayed unmodified.
//!
//! Each datagram is handled in its own Tokio task, so a slow upstream never
//! holds up other queries.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::dns::{self, qtype_name};
use super::error::DnsError;
use super::is_blocked;
use crate::telemetry::{AuditEvent, AuditLogger, Decision};

/// Largest datagram we accept or relay.
const MAX_DATAGRAM: usize = 4096;

/// Configuration for the DNS proxy.
#[derive(Clone)]
pub struct DnsProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Upstream resolver.
    pub upstream: SocketAddr,
    /// How long to wait for the upstream reply.
    pub upstream_timeout: Duration,
    /// Current block set; updated by the network controller.
    pub blocked: watch::Receiver<Arc<BTreeSet<String>>>,
    /// Reference to the audit logger.
    pub audit: Arc<AuditLogger>,
}

/// A bound DNS proxy.
pub struct DnsProxy {
    config: DnsProxyConfig,
    socket: Arc<UdpSocket>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DnsProxy {
    /// Bind the listening socket.
    pub async fn bind(
        config: DnsProxyConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, DnsError> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .map_err(|source| DnsError::Bind {
                addr: config.listen,
                source,
            })?;

        Ok(Self {
            config,
            socket: Arc::new(socket),
            shutdown_rx,
        })
    }

    /// Address the proxy is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until the shutdown signal is received.
    pub async fn run(self) -> Result<(), DnsError> {
        info!(
            "DNS proxy listening on {} (upstream {})",
            self.local_addr()?,
            self.config.upstream
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                recv_result = self.socket.recv_from(&mut buf) => {
                    match recv_result {
                        Ok((len, client)) => {
                            self.spawn_query_handler(buf[..len].to_vec(), client);
                        }
                        Err(e) => {
                            // Windows reports ICMP port-unreachable from a
                            // previous send_to as a recv error.
                            debug!("DNS proxy receive error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("DNS proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_query_handler(&self, packet: Vec<u8>, client: SocketAddr) {
        let socket = self.socket.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_query(&socket, &config, &packet, client).await {
                warn!("Dropping DNS query from {}: {}", client, e);
            }
        });
    }
}

async fn handle_query(
    socket: &UdpSocket,
    config: &DnsProxyConfig,
    packet: &[u8],
    client: SocketAddr,
) -> Result<(), DnsError> {
    let question = dns::parse_query(packet)?;
    let blocked = is_blocked(&config.blocked.borrow(), &question.name);

    debug!(
        "DNS {} {} from {} -> {}",
        qtype_name(question.qtype),
        question.name,
        client,
        if blocked { "NXDOMAIN" } else { "forward" }
    );

    config.audit.log(AuditEvent::DnsQuery {
        domain: question.name.clone(),
        qtype: question.qtype,
        decision: if blocked { Decision::Block } else { Decision::Allow },
    });

    let response = if blocked {
        dns::nxdomain(packet, &question)
    } else {
        forward(config.upstream, config.upstream_timeout, packet).await?
    };

    socket.send_to(&response, client).await?;
    Ok(())
}

/// Send `packet` to `upstream` and wait for the reply.
pub async fn forward(
    upstream: SocketAddr,
    timeout: Duration,
    packet: &[u8],
) -> Result<Vec<u8>, DnsError> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| DnsError::UpstreamTimeout(timeout))??;
    buf.truncate(len);
    Ok(buf)
}
