//! QUIC transport
//!
//! One QUIC connection per peer; mesh streams map directly onto QUIC
//! bidirectional streams, so flow control and half-close come natively from
//! the protocol. TLS 1.3 is part of the QUIC handshake itself.

use super::tls;
use crate::config::{ListenerConfig, PeerConfig};
use crate::transport::{resolve, split_host_port, Acceptor, BoxAcceptor, BoxLink, BoxStream, Link};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const ALPN: &[u8] = b"overmesh";

/// Idle timeout well above the mesh keepalive interval; the mesh-level
/// keepalive is what actually detects dead peers.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(IDLE_TIMEOUT.try_into().expect("static idle timeout")));
    Arc::new(transport)
}

/// Dial a peer over QUIC. The configured address is resolved fresh on every
/// call.
pub async fn dial(peer: &PeerConfig) -> Result<BoxLink> {
    let (host, _) = split_host_port(&peer.address)?;
    let remote = resolve(&peer.address).await?;

    let mut crypto = tls::client_config(&peer.tls)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).context("building QUIC client crypto")?,
    ));
    client_config.transport_config(transport_config());

    let bind: SocketAddr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }
        .parse()
        .expect("static bind addr");
    let endpoint = quinn::Endpoint::client(bind)?;

    let server_name = peer.tls.server_name.clone().unwrap_or(host);
    let connection = endpoint
        .connect_with(client_config, remote, &server_name)?
        .await
        .with_context(|| format!("QUIC connect to {}", remote))?;

    log::debug!("[quic] connected to {}", remote);
    Ok(Box::new(QuicLink { connection, endpoint: Some(endpoint) }))
}

/// Bind a QUIC listener.
pub async fn listen(listener: &ListenerConfig) -> Result<BoxAcceptor> {
    let mut crypto = tls::server_config(listener)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(crypto).context("building QUIC server crypto")?,
    ));
    server_config.transport_config(transport_config());

    let endpoint = quinn::Endpoint::server(server_config, listener.bind)
        .with_context(|| format!("binding QUIC listener on {}", listener.bind))?;
    log::info!("[quic] listening on {}", listener.bind);
    Ok(Box::new(QuicAcceptor { endpoint }))
}

struct QuicLink {
    connection: quinn::Connection,
    /// Kept alive on the dialling side; the acceptor owns it on the server.
    endpoint: Option<quinn::Endpoint>,
}

#[async_trait]
impl Link for QuicLink {
    async fn open_stream(&self) -> Result<BoxStream> {
        let (send, recv) = self.connection.open_bi().await?;
        Ok(Box::new(tokio::io::join(recv, send)))
    }

    async fn accept_stream(&self) -> Result<BoxStream> {
        let (send, recv) = self.connection.accept_bi().await?;
        Ok(Box::new(tokio::io::join(recv, send)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    async fn close(&self) {
        self.connection.close(0u32.into(), b"link closed");
    }
}

struct QuicAcceptor {
    endpoint: quinn::Endpoint,
}

#[async_trait]
impl Acceptor for QuicAcceptor {
    async fn accept(&mut self) -> Result<BoxLink> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC endpoint closed"))?;
        let connection = incoming.await.context("QUIC handshake")?;
        log::debug!("[quic] accepted connection from {}", connection.remote_address());
        Ok(Box::new(QuicLink { connection, endpoint: None }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }
}
