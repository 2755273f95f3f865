//! Exit adapter
//!
//! The last hop of a stream: validates the destination against the
//! configured allow-list, resolves domains through the configured resolvers
//! (or the system configuration), dials the real TCP or UDP socket, and
//! bridges it to the mesh conduit. Everything this agent is willing to exit
//! for is also what it advertises into the mesh.

use crate::config::ExitConfig;
use crate::socks5::{encode_udp_record, parse_udp_record};
use crate::stream::engine::{ExitConnector, ExitSocket};
use crate::stream::{ConduitReader, ConduitWriter};
use crate::wire::{Destination, OpenErrorCode, ResetCode, StreamOpenErr, StreamProto};
use async_trait::async_trait;
use bytes::BytesMut;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Outbound dial budget; opens that exceed it come back as
/// `ConnectionTimeout`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ExitAdapter {
    config: ExitConfig,
    resolver: TokioAsyncResolver,
}

impl ExitAdapter {
    pub fn new(config: ExitConfig) -> anyhow::Result<Arc<Self>> {
        let resolver = if config.dns.servers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| anyhow::anyhow!("loading system resolver: {}", e))?
        } else {
            let mut resolver_config = ResolverConfig::new();
            for server in &config.dns.servers {
                resolver_config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            }
            let mut opts = ResolverOpts::default();
            opts.timeout = config.dns.timeout;
            TokioAsyncResolver::tokio(resolver_config, opts)
        };
        Ok(Arc::new(Self { config, resolver }))
    }

    fn allows_ip(&self, ip: IpAddr) -> bool {
        self.config.routes.iter().any(|net| net.contains(&ip))
    }

    /// Exact pattern match, or a `*.suffix` pattern eating exactly one
    /// label.
    fn allows_domain(&self, name: &str) -> bool {
        let host = name.trim_end_matches('.').to_ascii_lowercase();
        self.config.domain_routes.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => host
                    .split_once('.')
                    .map(|(label, rest)| !label.is_empty() && rest == suffix)
                    .unwrap_or(false),
                None => host == pattern,
            }
        })
    }

    async fn resolve(&self, name: &str) -> Result<IpAddr, StreamOpenErr> {
        let lookup = self.resolver.lookup_ip(name).await.map_err(|e| StreamOpenErr {
            code: OpenErrorCode::DnsFailure,
            message: format!("resolving {}: {}", name, e),
        })?;
        lookup.iter().next().ok_or_else(|| StreamOpenErr {
            code: OpenErrorCode::DnsFailure,
            message: format!("{} resolved to no addresses", name),
        })
    }

    /// Validate and resolve a destination into a concrete socket address.
    async fn admit(&self, destination: &Destination) -> Result<SocketAddr, StreamOpenErr> {
        match destination {
            Destination::Ip(addr) => {
                if !self.allows_ip(addr.ip()) {
                    return Err(denied(format!("{} not in exit routes", addr.ip())));
                }
                Ok(*addr)
            }
            Destination::Domain { name, port } => {
                if self.allows_domain(name) {
                    let ip = self.resolve(name).await?;
                    return Ok(SocketAddr::new(ip, *port));
                }
                // Not a served domain: still admissible if it resolves into
                // a served range.
                let ip = self.resolve(name).await?;
                if !self.allows_ip(ip) {
                    return Err(denied(format!("{} ({}) not in exit routes", name, ip)));
                }
                Ok(SocketAddr::new(ip, *port))
            }
            Destination::Forward { key } => {
                let target = self
                    .config
                    .forward_routes
                    .iter()
                    .find(|route| route.key == *key)
                    .ok_or_else(|| denied(format!("unknown forward key '{}'", key)))?;
                let (host, port) = crate::transport::split_host_port(&target.target)
                    .map_err(|e| StreamOpenErr {
                        code: OpenErrorCode::InternalError,
                        message: format!("bad forward target: {}", e),
                    })?;
                let ip = match host.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(_) => self.resolve(&host).await?,
                };
                Ok(SocketAddr::new(ip, port))
            }
        }
    }

    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream, StreamOpenErr> {
        let connect = TcpStream::connect(addr);
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => {
                let code = match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => OpenErrorCode::ConnectionRefused,
                    std::io::ErrorKind::TimedOut => OpenErrorCode::ConnectionTimeout,
                    _ => OpenErrorCode::InternalError,
                };
                Err(StreamOpenErr { code, message: format!("connect {}: {}", addr, e) })
            }
            Err(_) => Err(StreamOpenErr {
                code: OpenErrorCode::ConnectionTimeout,
                message: format!("connect {} timed out", addr),
            }),
        }
    }
}

fn denied(message: String) -> StreamOpenErr {
    StreamOpenErr { code: OpenErrorCode::AccessDenied, message }
}

#[async_trait]
impl ExitConnector for ExitAdapter {
    async fn connect(
        &self,
        destination: &Destination,
        proto: StreamProto,
    ) -> Result<ExitSocket, StreamOpenErr> {
        match proto {
            StreamProto::Tcp => {
                let addr = self.admit(destination).await?;
                log::info!("[exit] dialing {} for {}", addr, destination);
                Ok(ExitSocket::Tcp(self.dial_tcp(addr).await?))
            }
            StreamProto::Udp => {
                // Datagram streams carry per-record targets; validation
                // happens per datagram in the bridge. The socket stays
                // unconnected.
                let bind: SocketAddr = "0.0.0.0:0".parse().expect("static socket addr");
                let socket = UdpSocket::bind(bind).await.map_err(|e| StreamOpenErr {
                    code: OpenErrorCode::InternalError,
                    message: format!("binding UDP socket: {}", e),
                })?;
                log::info!("[exit] UDP relay socket for {}", destination);
                Ok(ExitSocket::Udp(socket))
            }
        }
    }

    fn bridge(&self, socket: ExitSocket, reader: ConduitReader, writer: ConduitWriter) {
        match socket {
            ExitSocket::Tcp(stream) => {
                tokio::spawn(bridge_tcp(stream, reader, writer));
            }
            ExitSocket::Udp(socket) => {
                let allow_ip = self.config.routes.clone();
                let allow_domains = self.config.domain_routes.clone();
                tokio::spawn(bridge_udp(socket, reader, writer, allow_ip, allow_domains));
            }
        }
    }
}

/// Splice the dialled TCP socket against the mesh conduit; EOFs become
/// half-closes on the other side.
async fn bridge_tcp(stream: TcpStream, mut reader: ConduitReader, mut writer: ConduitWriter) {
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    let from_mesh = tokio::spawn(async move {
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if tcp_write.write_all(&chunk).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    // FIN from the ingress: shutdown the write side, reads
                    // may continue.
                    tcp_write.shutdown().await.ok();
                    return;
                }
                Err(_) => return,
            }
        }
    });

    let mut writer = {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => {
                    writer.shutdown().await.ok();
                    break writer;
                }
                Ok(n) => {
                    if writer.write(&buf[..n]).await.is_err() {
                        break writer;
                    }
                }
                Err(_) => {
                    writer.reset(ResetCode::Cancelled).await;
                    break writer;
                }
            }
        }
    };

    from_mesh.await.ok();
    writer.close().await;
}

/// Relay length-prefixed datagram records between the mesh and an
/// unconnected UDP socket, validating every target against the allow-list.
async fn bridge_udp(
    socket: UdpSocket,
    mut reader: ConduitReader,
    mut writer: ConduitWriter,
    allow_ip: Vec<ipnet::IpNet>,
    allow_domains: Vec<String>,
) {
    let mut inbound = BytesMut::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            chunk = reader.read() => {
                let Ok(Some(bytes)) = chunk else { break };
                inbound.extend_from_slice(&bytes);
                while let Some((target, payload)) = parse_udp_record(&mut inbound) {
                    let addr = match &target {
                        Destination::Ip(addr) => {
                            if !allow_ip.iter().any(|net| net.contains(&addr.ip())) {
                                log::debug!("[exit] dropping datagram to disallowed {}", addr);
                                continue;
                            }
                            *addr
                        }
                        Destination::Domain { name, port } => {
                            if !domain_allowed(&allow_domains, name) {
                                log::debug!("[exit] dropping datagram to disallowed {}", name);
                                continue;
                            }
                            match tokio::net::lookup_host((name.as_str(), *port)).await {
                                Ok(mut addrs) => match addrs.next() {
                                    Some(addr) => addr,
                                    None => continue,
                                },
                                Err(_) => continue,
                            }
                        }
                        Destination::Forward { .. } => continue,
                    };
                    socket.send_to(&payload, addr).await.ok();
                }
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = received else { break };
                let record = encode_udp_record(&Destination::Ip(from), &buf[..len]);
                if writer.write(&record).await.is_err() {
                    break;
                }
            }
        }
    }
    writer.close().await;
}

fn domain_allowed(patterns: &[String], name: &str) -> bool {
    let host = name.trim_end_matches('.').to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => host
                .split_once('.')
                .map(|(label, rest)| !label.is_empty() && rest == suffix)
                .unwrap_or(false),
            None => host == pattern,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsConfig, ForwardRoute};

    fn adapter(routes: &[&str], domains: &[&str]) -> Arc<ExitAdapter> {
        let config = ExitConfig {
            enabled: true,
            routes: routes.iter().map(|net| net.parse().unwrap()).collect(),
            domain_routes: domains.iter().map(|s| s.to_string()).collect(),
            forward_routes: vec![ForwardRoute { key: "jump".into(), target: "10.0.0.9:22".into() }],
            dns: DnsConfig { servers: vec!["127.0.0.1:53".parse().unwrap()], ..Default::default() },
        };
        ExitAdapter::new(config).unwrap()
    }

    #[test]
    fn test_ip_allow_list() {
        let exit = adapter(&["10.0.0.0/8", "2001:db8::/32"], &[]);
        assert!(exit.allows_ip("10.1.2.3".parse().unwrap()));
        assert!(exit.allows_ip("2001:db8::1".parse().unwrap()));
        assert!(!exit.allows_ip("192.168.0.1".parse().unwrap()));
        assert!(!exit.allows_ip("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_domain_allow_list_wildcards() {
        let exit = adapter(&[], &["*.internal.corp", "intranet.example.com"]);
        assert!(exit.allows_domain("api.internal.corp"));
        assert!(exit.allows_domain("API.INTERNAL.CORP"));
        assert!(!exit.allows_domain("a.b.internal.corp"));
        assert!(!exit.allows_domain("internal.corp"));
        assert!(exit.allows_domain("intranet.example.com"));
        assert!(!exit.allows_domain("other.example.com"));
    }

    #[tokio::test]
    async fn test_disallowed_ip_is_denied() {
        let exit = adapter(&["10.0.0.0/8"], &[]);
        let err = exit
            .admit(&Destination::Ip("192.168.1.1:80".parse().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.code, OpenErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn test_allowed_ip_admitted_without_dns() {
        let exit = adapter(&["10.0.0.0/8"], &[]);
        let addr = exit
            .admit(&Destination::Ip("10.0.0.5:22".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(addr, "10.0.0.5:22".parse().unwrap());
    }

    #[tokio::test]
    async fn test_forward_key_with_ip_target_admitted() {
        let exit = adapter(&["10.0.0.0/8"], &[]);
        let addr = exit.admit(&Destination::Forward { key: "jump".into() }).await.unwrap();
        assert_eq!(addr, "10.0.0.9:22".parse().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_forward_key_denied() {
        let exit = adapter(&["10.0.0.0/8"], &[]);
        let err = exit.admit(&Destination::Forward { key: "nope".into() }).await.unwrap_err();
        assert_eq!(err.code, OpenErrorCode::AccessDenied);
    }

    #[tokio::test]
    async fn test_tcp_dial_refused_maps_to_connection_refused() {
        let exit = adapter(&["127.0.0.0/8"], &[]);
        // Bind a listener to learn a free port, then close it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = exit.dial_tcp(addr).await.unwrap_err();
        assert_eq!(err.code, OpenErrorCode::ConnectionRefused);
    }
}
