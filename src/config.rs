//! Agent configuration
//!
//! Loaded once at startup from a TOML file. Everything the core needs is in
//! here: identity location, transport listeners, configured peers, routing
//! and limit knobs, the exit allow-list, and the SOCKS5 ingress settings.
//! Durations accept humantime strings ("30s", "2m").

use crate::identity::AgentId;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_identity_file() -> PathBuf {
    PathBuf::from("agent.id")
}

fn default_true() -> bool {
    true
}

fn default_mesh_path() -> String {
    "/mesh".to_string()
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the persistent 16-byte identity file.
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,

    /// Human-readable name carried in hellos and node-info floods.
    #[serde(default)]
    pub display_name: String,

    /// Transport listeners for inbound peers.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Outbound peers this agent dials.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub exit: ExitConfig,

    #[serde(default)]
    pub socks5: Socks5Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_file: default_identity_file(),
            display_name: String::new(),
            listeners: Vec::new(),
            peers: Vec::new(),
            routing: RoutingConfig::default(),
            limits: LimitsConfig::default(),
            connection: ConnectionConfig::default(),
            reconnect: ReconnectConfig::default(),
            exit: ExitConfig::default(),
            socks5: Socks5Config::default(),
        }
    }
}

/// Which transport a listener or peer uses. Transports are independent per
/// peer; one mesh may mix all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    H2,
    Ws,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Quic => write!(f, "quic"),
            TransportKind::H2 => write!(f, "h2"),
            TransportKind::Ws => write!(f, "ws"),
        }
    }
}

/// One inbound listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub transport: TransportKind,

    /// Bind address.
    pub bind: SocketAddr,

    /// Server certificate chain (PEM).
    pub tls_cert: Option<PathBuf>,

    /// Server private key (PEM).
    pub tls_key: Option<PathBuf>,

    /// When set, clients must present a certificate signed by this CA
    /// (mutual TLS).
    pub tls_client_ca: Option<PathBuf>,

    /// URL path used as the upgrade point for h2 and ws listeners.
    #[serde(default = "default_mesh_path")]
    pub path: String,

    /// Skip TLS entirely. Only honoured for WebSocket listeners sitting
    /// behind a TLS-terminating reverse proxy on localhost.
    #[serde(default)]
    pub plaintext: bool,
}

/// One configured outbound peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Expected remote agent id; the handshake fails on mismatch when set.
    pub id: Option<AgentId>,

    pub transport: TransportKind,

    /// Dial address as written in the config. Kept as a string so DNS is
    /// re-resolved on every reconnect attempt.
    pub address: String,

    /// Persistent peers are re-dialled with backoff after any disconnect.
    #[serde(default = "default_true")]
    pub persistent: bool,

    #[serde(default)]
    pub tls: PeerTlsConfig,
}

/// TLS options for dialling one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerTlsConfig {
    /// CA bundle used to verify the peer; webpki roots when unset.
    pub ca: Option<PathBuf>,

    /// Client certificate/key presented when the peer requires mutual TLS.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,

    /// Server name for SNI/verification; defaults to the host part of
    /// `address`.
    pub server_name: Option<String>,

    /// Accept any server certificate. Lab use only.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// How often local routes are re-flooded.
    #[serde(with = "humantime_serde", default = "RoutingConfig::default_advertise_interval")]
    pub advertise_interval: Duration,

    /// Routes not refreshed within this window are reaped.
    #[serde(with = "humantime_serde", default = "RoutingConfig::default_route_ttl")]
    pub route_ttl: Duration,

    /// Advertisements whose metric would exceed this are dropped.
    #[serde(default = "RoutingConfig::default_max_hops")]
    pub max_hops: u16,
}

impl RoutingConfig {
    fn default_advertise_interval() -> Duration {
        Duration::from_secs(120)
    }

    fn default_route_ttl() -> Duration {
        Duration::from_secs(300)
    }

    fn default_max_hops() -> u16 {
        16
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            advertise_interval: Self::default_advertise_interval(),
            route_ttl: Self::default_route_ttl(),
            max_hops: Self::default_max_hops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-stream, per-direction receive buffer in bytes.
    #[serde(default = "LimitsConfig::default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "LimitsConfig::default_max_streams_per_peer")]
    pub max_streams_per_peer: usize,

    #[serde(default = "LimitsConfig::default_max_streams_total")]
    pub max_streams_total: usize,

    #[serde(default = "LimitsConfig::default_max_pending_opens")]
    pub max_pending_opens: usize,

    #[serde(with = "humantime_serde", default = "LimitsConfig::default_stream_open_timeout")]
    pub stream_open_timeout: Duration,
}

impl LimitsConfig {
    fn default_buffer_size() -> usize {
        256 * 1024
    }

    fn default_max_streams_per_peer() -> usize {
        1000
    }

    fn default_max_streams_total() -> usize {
        10_000
    }

    fn default_max_pending_opens() -> usize {
        100
    }

    fn default_stream_open_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            max_streams_per_peer: Self::default_max_streams_per_peer(),
            max_streams_total: Self::default_max_streams_total(),
            max_pending_opens: Self::default_max_pending_opens(),
            stream_open_timeout: Self::default_stream_open_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(with = "humantime_serde", default = "ConnectionConfig::default_keepalive_interval")]
    pub keepalive_interval: Duration,

    #[serde(with = "humantime_serde", default = "ConnectionConfig::default_keepalive_timeout")]
    pub keepalive_timeout: Duration,

    /// Fraction of the interval randomised per tick so peers do not
    /// synchronise (0.0 - 1.0).
    #[serde(default = "ConnectionConfig::default_keepalive_jitter")]
    pub keepalive_jitter: f64,

    #[serde(with = "humantime_serde", default = "ConnectionConfig::default_handshake_timeout")]
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    fn default_keepalive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_keepalive_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_keepalive_jitter() -> f64 {
        0.3
    }

    fn default_handshake_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Self::default_keepalive_interval(),
            keepalive_timeout: Self::default_keepalive_timeout(),
            keepalive_jitter: Self::default_keepalive_jitter(),
            handshake_timeout: Self::default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde", default = "ReconnectConfig::default_initial_delay")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde", default = "ReconnectConfig::default_max_delay")]
    pub max_delay: Duration,

    #[serde(default = "ReconnectConfig::default_multiplier")]
    pub multiplier: f64,

    /// Jitter fraction applied to each delay (0.2 = ±20 %).
    #[serde(default = "ReconnectConfig::default_jitter")]
    pub jitter: f64,

    /// 0 means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    fn default_initial_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_max_delay() -> Duration {
        Duration::from_secs(60)
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_jitter() -> f64 {
        0.2
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Self::default_initial_delay(),
            max_delay: Self::default_max_delay(),
            multiplier: Self::default_multiplier(),
            jitter: Self::default_jitter(),
            max_attempts: 0,
        }
    }
}

/// A forward route: a symbolic key advertised into the mesh that this exit
/// maps to a fixed target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRoute {
    pub key: String,
    /// `host:port` the key resolves to at this exit.
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Upstream resolvers; system configuration is used when empty.
    #[serde(default)]
    pub servers: Vec<SocketAddr>,

    #[serde(with = "humantime_serde", default = "DnsConfig::default_timeout")]
    pub timeout: Duration,
}

impl DnsConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { servers: Vec::new(), timeout: Self::default_timeout() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// CIDR ranges this exit serves; advertised and enforced on open.
    #[serde(default)]
    pub routes: Vec<IpNet>,

    /// Domain patterns this exit serves; `*.example.com` matches exactly one
    /// extra label.
    #[serde(default)]
    pub domain_routes: Vec<String>,

    /// Forward keys this exit serves.
    #[serde(default)]
    pub forward_routes: Vec<ForwardRoute>,

    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5User {
    pub username: String,
    /// bcrypt hash of the password.
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5Config {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "Socks5Config::default_listen")]
    pub listen: SocketAddr,

    /// When non-empty, USERNAME/PASSWORD auth is required.
    #[serde(default)]
    pub users: Vec<Socks5User>,
}

impl Socks5Config {
    fn default_listen() -> SocketAddr {
        "127.0.0.1:1080".parse().expect("static socket addr")
    }
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self { enabled: false, listen: Self::default_listen(), users: Vec::new() }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate().map_err(|e| anyhow::anyhow!("invalid config: {}", e))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        for listener in &self.listeners {
            if listener.plaintext && listener.transport != TransportKind::Ws {
                return Err(format!(
                    "listener {}: plaintext is only supported for ws",
                    listener.bind
                ));
            }
            if !listener.plaintext && (listener.tls_cert.is_none() || listener.tls_key.is_none()) {
                return Err(format!(
                    "listener {}: tls_cert and tls_key are required",
                    listener.bind
                ));
            }
            if !listener.path.starts_with('/') {
                return Err(format!("listener {}: path must start with '/'", listener.bind));
            }
        }

        for peer in &self.peers {
            if peer.address.is_empty() {
                return Err("peer address must not be empty".to_string());
            }
            if !peer.address.contains(':') {
                return Err(format!("peer address '{}' must be host:port", peer.address));
            }
        }

        if self.routing.max_hops == 0 {
            return Err("routing.max_hops must be at least 1".to_string());
        }

        if self.reconnect.multiplier < 1.0 {
            return Err("reconnect.multiplier must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err("reconnect.jitter must be between 0.0 and 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.connection.keepalive_jitter) {
            return Err("connection.keepalive_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.exit.enabled
            && self.exit.routes.is_empty()
            && self.exit.domain_routes.is_empty()
            && self.exit.forward_routes.is_empty()
        {
            return Err("exit.enabled requires at least one route".to_string());
        }

        for pattern in &self.exit.domain_routes {
            if pattern.is_empty() || pattern == "*" || pattern.ends_with('.') {
                return Err(format!("invalid domain route pattern '{}'", pattern));
            }
        }

        for user in &self.socks5.users {
            if !user.password_hash.starts_with("$2") {
                return Err(format!(
                    "socks5 user '{}': password_hash must be a bcrypt hash",
                    user.username
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            display_name = "edge-1"

            [[peers]]
            transport = "quic"
            address = "hub.example.com:7443"

            [socks5]
            enabled = true
            listen = "127.0.0.1:1080"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.peers.len(), 1);
        assert!(config.peers[0].persistent);
        assert_eq!(config.routing.max_hops, 16);
        assert_eq!(config.limits.buffer_size, 256 * 1024);
        assert_eq!(config.connection.keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_humantime_durations() {
        let toml = r#"
            [routing]
            advertise_interval = "90s"
            route_ttl = "10m"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.routing.advertise_interval, Duration::from_secs(90));
        assert_eq!(config.routing.route_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_exit_requires_routes() {
        let toml = r#"
            [exit]
            enabled = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exit_with_cidr_routes() {
        let toml = r#"
            [exit]
            enabled = true
            routes = ["10.0.0.0/8", "2001:db8::/32"]
            domain_routes = ["*.internal.corp"]

            [exit.dns]
            servers = ["1.1.1.1:53"]
            timeout = "3s"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.exit.routes.len(), 2);
        assert_eq!(config.exit.dns.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_plaintext_rejected_for_quic() {
        let toml = r#"
            [[listeners]]
            transport = "quic"
            bind = "0.0.0.0:7443"
            plaintext = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listener_requires_cert_and_key() {
        let toml = r#"
            [[listeners]]
            transport = "ws"
            bind = "0.0.0.0:8443"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socks5_user_hash_must_be_bcrypt() {
        let toml = r#"
            [socks5]
            enabled = true

            [[socks5.users]]
            username = "ops"
            password_hash = "plaintext-oops"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expected_peer_id_parses() {
        let toml = r#"
            [[peers]]
            id = "000102030405060708090a0b0c0d0e0f"
            transport = "ws"
            address = "relay.example.com:443"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let id = config.peers[0].id.unwrap();
        assert_eq!(id.as_bytes()[0], 0);
        assert_eq!(id.as_bytes()[15], 0x0f);
    }
}
