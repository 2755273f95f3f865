//! Transport abstraction layer
//!
//! A transport provides TLS-authenticated, stream-multiplexed links between
//! two agents. Three interchangeable implementations exist (QUIC, HTTP/2,
//! WebSocket); within one mesh different peers may use different transports.
//!
//! Guarantees to higher layers: in-order reliable bytes per stream,
//! independent flow control per stream, and cancellation of all in-flight
//! streams when the link closes. HTTP/2 servers cannot initiate streams, so
//! `open_stream` is only called by the side that dialled the link; the
//! peer/stream layers uphold that convention for every transport.

use crate::config::{ListenerConfig, PeerConfig, TransportKind};
use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional reliable byte pipe carried by a link. Shutting down the
/// write side half-closes the stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// Boxed transport stream handed to the peer and stream layers.
pub type BoxStream = Box<dyn StreamIo>;

/// One established connection to a remote agent.
#[async_trait]
pub trait Link: Send + Sync {
    /// Open a new stream. Only valid on the dialling side of the link.
    async fn open_stream(&self) -> Result<BoxStream>;

    /// Accept the next stream opened by the remote side.
    async fn accept_stream(&self) -> Result<BoxStream>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Close the link, cancelling all in-flight streams.
    async fn close(&self);
}

pub type BoxLink = Box<dyn Link>;

/// Listening side of a transport.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound link.
    async fn accept(&mut self) -> Result<BoxLink>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

pub type BoxAcceptor = Box<dyn Acceptor>;

/// Dial a configured peer over its configured transport. The address is the
/// configured string so the hostname is re-resolved on every attempt.
pub async fn dial(peer: &PeerConfig) -> Result<BoxLink> {
    match peer.transport {
        TransportKind::Quic => crate::transports::quic::dial(peer).await,
        TransportKind::H2 => crate::transports::h2::dial(peer).await,
        TransportKind::Ws => crate::transports::ws::dial(peer).await,
    }
}

/// Bind a configured listener.
pub async fn listen(listener: &ListenerConfig) -> Result<BoxAcceptor> {
    match listener.transport {
        TransportKind::Quic => crate::transports::quic::listen(listener).await,
        TransportKind::H2 => crate::transports::h2::listen(listener).await,
        TransportKind::Ws => crate::transports::ws::listen(listener).await,
    }
}

/// Split a configured `host:port` address into its parts.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    // IPv6 literals are written `[addr]:port`.
    if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| anyhow::anyhow!("invalid address '{}'", address))?;
        return Ok((host.to_string(), port.parse()?));
    }
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("address '{}' missing port", address))?;
    Ok((host.to_string(), port.parse()?))
}

/// Resolve the configured address to a socket address, preferring the first
/// result. DNS runs fresh on every call.
pub async fn resolve(address: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(address).await?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for '{}'", address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com".into(), 443));
        assert_eq!(split_host_port("10.0.0.1:80").unwrap(), ("10.0.0.1".into(), 80));
        assert_eq!(split_host_port("[::1]:7443").unwrap(), ("::1".into(), 7443));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("bad:port:").is_err());
    }
}
