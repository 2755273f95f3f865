//! Overmesh: userspace multi-hop mesh overlay agent
//!
//! A deployment is a set of peer agents cooperating to carry TCP-like byte
//! streams (and UDP datagrams) from an ingress point (a SOCKS5 proxy) to an
//! exit point (a real outbound connection), possibly via transit hops. Each
//! agent has a stable 16-byte id and may act as ingress, transit, and exit
//! at the same time.
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 client ──▶ ingress ──▶ transit ... ──▶ exit ──▶ destination
//!                     │            │              │
//!                     └── QUIC / HTTP/2 / WebSocket links ──┘
//! ```
//!
//! Four layers, leaves first:
//!
//! - **Transport** ([`transport`], [`transports`]): TLS 1.3 links between
//!   agents over QUIC, HTTP/2, or WebSocket, stream-multiplexed.
//! - **Peer connection** ([`peer`]): handshake, control stream, keepalive,
//!   and reconnection with backoff ([`reconnect`]).
//! - **Flood routing** ([`routing`]): deduplicated advertisement flooding
//!   building per-agent tables with longest-prefix CIDR routes, domain
//!   routes, and hop-counted metrics.
//! - **Stream engine** ([`stream`]): virtual streams multiplexed over peer
//!   links, source-routed opens, per-stream backpressure, and end-to-end
//!   ChaCha20-Poly1305 encryption between ingress and exit.
//!
//! The [`agent`] module ties the layers together; [`socks5`] and [`exit`]
//! are the edges where client traffic enters and leaves the mesh.
//!
//! ## Quick start
//!
//! ```bash
//! # Generate an identity and a starter config
//! overmesh genkey --identity agent.id
//! overmesh genconf --output overmesh.toml
//!
//! # Run the agent
//! overmesh run --config overmesh.toml
//! ```

pub mod agent;
pub mod config;
pub mod exit;
pub mod identity;
pub mod peer;
pub mod reconnect;
pub mod routing;
pub mod socks5;
pub mod stream;
pub mod transport;
pub mod transports;
pub mod wire;

// Re-export core types
pub use agent::Agent;
pub use config::Config;
pub use identity::AgentId;
pub use peer::{PeerConnection, PeerEvent, PeerRegistry};
pub use reconnect::{Backoff, Reconnector};
pub use routing::{Flooder, RouteKey, RoutingTable};
pub use stream::{ConduitReader, ConduitWriter, StreamEngine};
pub use wire::{Destination, Frame, StreamProto};

/// Top-level agent errors, mapped onto process exit codes by the binary.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration: {0}")]
    Config(String),

    /// The identity file is missing, unreadable, or corrupt.
    #[error("identity: {0}")]
    Identity(#[from] std::io::Error),

    /// A listener could not be bound at startup.
    #[error("listener: {0}")]
    Listener(String),

    /// Anything else that should stop the agent.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            MeshError::Config(_) => 1,
            MeshError::Identity(_) => 2,
            MeshError::Listener(_) => 3,
            MeshError::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_stable() {
        assert_eq!(MeshError::Config("x".into()).exit_code(), 1);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(MeshError::Identity(io).exit_code(), 2);
        assert_eq!(MeshError::Listener("bind".into()).exit_code(), 3);
    }
}
