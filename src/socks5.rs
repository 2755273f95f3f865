//! SOCKS5 ingress (RFC 1928)
//!
//! Accepts client connections, negotiates authentication (none, or
//! username/password verified against bcrypt hashes), and turns CONNECT and
//! UDP ASSOCIATE requests into mesh streams. Stream-open failures map back
//! onto SOCKS5 reply codes; once a stream is up, bytes are spliced in both
//! directions with half-close propagation.

use crate::config::Socks5Config;
use crate::stream::engine::{OpenFailure, StreamEngine};
use crate::stream::{ConduitReader, ConduitWriter};
use crate::wire::{Destination, OpenErrorCode, ResetCode, StreamProto};
use bytes::{Buf, BytesMut};
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;

/// SOCKS5 protocol constants
const SOCKS5_VERSION: u8 = 0x05;
const AUTH_SUBNEG_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Translate a mesh stream-open failure into the reply the client sees.
    fn from_open_failure(failure: &OpenFailure) -> Self {
        match failure.code {
            OpenErrorCode::RouteNotFound => ReplyCode::HostUnreachable,
            OpenErrorCode::ConnectionRefused => ReplyCode::ConnectionRefused,
            OpenErrorCode::ConnectionTimeout => ReplyCode::HostUnreachable,
            OpenErrorCode::AccessDenied => ReplyCode::NotAllowed,
            OpenErrorCode::DnsFailure => ReplyCode::HostUnreachable,
            OpenErrorCode::InternalError => ReplyCode::GeneralFailure,
        }
    }
}

/// The SOCKS5 listener: one task per client connection.
pub struct Socks5Server {
    config: Socks5Config,
    engine: Arc<StreamEngine>,
}

impl Socks5Server {
    pub fn new(config: Socks5Config, engine: Arc<StreamEngine>) -> Arc<Self> {
        Arc::new(Self { config, engine })
    }

    /// Bind the configured listen address. Failures here are fatal to
    /// agent startup.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(|e| anyhow::anyhow!("binding SOCKS5 listener on {}: {}", self.config.listen, e))?;
        log::info!("[socks5] listening on {}", self.config.listen);
        Ok(listener)
    }

    /// Serve a bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("[socks5] listener shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("[socks5] accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, client_addr).await {
                            log::debug!("[socks5] client {} ended: {}", client_addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, client_addr: SocketAddr) -> Result<(), Error> {
        stream.set_nodelay(true).ok();
        self.negotiate_auth(&mut stream).await?;
        let (command, destination) = read_request(&mut stream).await?;

        match command {
            Command::Connect => self.handle_connect(stream, destination).await,
            Command::UdpAssociate => self.handle_udp_associate(stream, client_addr).await,
        }
    }

    /// Method selection plus the username/password subnegotiation when
    /// users are configured.
    async fn negotiate_auth(&self, stream: &mut TcpStream) -> Result<(), Error> {
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported SOCKS version: {}", buf[0]),
            ));
        }
        let mut methods = vec![0u8; buf[1] as usize];
        stream.read_exact(&mut methods).await?;

        let want = if self.config.users.is_empty() {
            AuthMethod::NoAuth
        } else {
            AuthMethod::UsernamePassword
        };
        if !methods.contains(&(want as u8)) {
            stream.write_all(&[SOCKS5_VERSION, AuthMethod::NoAcceptable as u8]).await?;
            return Err(Error::new(ErrorKind::PermissionDenied, "no acceptable auth method"));
        }
        stream.write_all(&[SOCKS5_VERSION, want as u8]).await?;

        if matches!(want, AuthMethod::UsernamePassword) {
            self.verify_credentials(stream).await?;
        }
        Ok(())
    }

    /// RFC 1929 subnegotiation, verified against the configured bcrypt
    /// hashes.
    async fn verify_credentials(&self, stream: &mut TcpStream) -> Result<(), Error> {
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != AUTH_SUBNEG_VERSION {
            return Err(Error::new(ErrorKind::InvalidData, "bad auth subnegotiation version"));
        }
        let mut username = vec![0u8; head[1] as usize];
        stream.read_exact(&mut username).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username);
        let ok = self
            .config
            .users
            .iter()
            .find(|user| user.username == username)
            .map(|user| {
                bcrypt::verify(String::from_utf8_lossy(&password).as_ref(), &user.password_hash)
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        stream.write_all(&[AUTH_SUBNEG_VERSION, if ok { 0x00 } else { 0x01 }]).await?;
        if !ok {
            log::warn!("[socks5] failed login for user '{}'", username);
            return Err(Error::new(ErrorKind::PermissionDenied, "authentication failed"));
        }
        log::debug!("[socks5] authenticated user '{}'", username);
        Ok(())
    }

    async fn handle_connect(&self, mut stream: TcpStream, destination: Destination) -> Result<(), Error> {
        log::info!("[socks5] CONNECT {}", destination);
        let opened = self.engine.open(destination, StreamProto::Tcp).await;
        let (reader, writer) = match opened {
            Ok(pair) => pair,
            Err(failure) => {
                log::debug!("[socks5] open failed: {}", failure);
                send_reply(&mut stream, ReplyCode::from_open_failure(&failure), unspecified_addr())
                    .await?;
                return Ok(());
            }
        };

        let bind_addr = stream.local_addr().unwrap_or_else(|_| unspecified_addr());
        send_reply(&mut stream, ReplyCode::Succeeded, bind_addr).await?;
        splice(stream, reader, writer).await;
        Ok(())
    }

    /// UDP ASSOCIATE: hand the client a relay socket and carry datagrams as
    /// length-prefixed records over one mesh stream. The mesh stream opens
    /// lazily on the first datagram, which is what fixes the route.
    async fn handle_udp_associate(&self, mut stream: TcpStream, client_addr: SocketAddr) -> Result<(), Error> {
        let bind_ip = stream.local_addr().map(|a| a.ip()).unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let udp = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        let relay_addr = udp.local_addr()?;
        log::info!("[socks5] UDP ASSOCIATE for {} via {}", client_addr, relay_addr);
        send_reply(&mut stream, ReplyCode::Succeeded, relay_addr).await?;

        let engine = Arc::clone(&self.engine);
        let relay = tokio::spawn(udp_relay(engine, udp, client_addr.ip()));

        // The association lives as long as the client's TCP connection.
        let mut sink = [0u8; 64];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        relay.abort();
        log::debug!("[socks5] UDP association for {} closed", client_addr);
        Ok(())
    }
}

/// Read the client's request line and parse the destination.
async fn read_request(stream: &mut TcpStream) -> Result<(Command, Destination), Error> {
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::new(ErrorKind::InvalidData, "invalid SOCKS version"));
    }
    let command = match head[1] {
        0x01 => Command::Connect,
        0x03 => Command::UdpAssociate,
        other => {
            send_reply(stream, ReplyCode::CommandNotSupported, unspecified_addr()).await?;
            return Err(Error::new(ErrorKind::Unsupported, format!("unsupported command {}", other)));
        }
    };

    let destination = match head[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Destination::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid domain name"))?;
            let port = read_port(stream).await?;
            Destination::Domain { name, port }
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Destination::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        _ => {
            send_reply(stream, ReplyCode::AddressTypeNotSupported, unspecified_addr()).await?;
            return Err(Error::new(ErrorKind::Unsupported, "unsupported address type"));
        }
    };
    log::debug!("[socks5] request: {:?} {}", command, destination);
    Ok((command, destination))
}

async fn read_port(stream: &mut TcpStream) -> Result<u16, Error> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

fn unspecified_addr() -> SocketAddr {
    "0.0.0.0:0".parse().expect("static socket addr")
}

/// Send a SOCKS5 reply.
pub async fn send_reply<S>(stream: &mut S, reply: ReplyCode, bind_addr: SocketAddr) -> Result<(), Error>
where
    S: AsyncWriteExt + Unpin,
{
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut response = vec![SOCKS5_VERSION, reply as u8, 0x00];
    match bind_addr.ip() {
        IpAddr::V4(ip) => {
            response.push(0x01);
            response.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            response.push(0x04);
            response.extend_from_slice(&ip.octets());
        }
    }
    response.extend_from_slice(&bind_addr.port().to_be_bytes());
    stream.write_all(&response).await?;
    Ok(())
}

/// Bidirectional copy between the client socket and the mesh conduit, with
/// half-close propagated in both directions.
async fn splice(stream: TcpStream, mut reader: ConduitReader, mut writer: ConduitWriter) {
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    let upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => {
                    writer.shutdown().await.ok();
                    return writer;
                }
                Ok(n) => {
                    if writer.write(&buf[..n]).await.is_err() {
                        return writer;
                    }
                }
                Err(_) => {
                    writer.reset(ResetCode::Cancelled).await;
                    return writer;
                }
            }
        }
    });

    let downstream = tokio::spawn(async move {
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if tcp_write.write_all(&chunk).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    tcp_write.shutdown().await.ok();
                    return;
                }
                Err(_) => return,
            }
        }
    });

    let writer = upstream.await.ok();
    downstream.await.ok();
    if let Some(mut writer) = writer {
        writer.close().await;
    }
}

/// Datagram records on a UDP mesh stream: `{ u16 length, atyp-addr-port,
/// payload }`, the address part in SOCKS5 wire form.
pub fn encode_udp_record(target: &Destination, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 32);
    match target {
        Destination::Ip(SocketAddr::V4(addr)) => {
            body.push(0x01);
            body.extend_from_slice(&addr.ip().octets());
            body.extend_from_slice(&addr.port().to_be_bytes());
        }
        Destination::Ip(SocketAddr::V6(addr)) => {
            body.push(0x04);
            body.extend_from_slice(&addr.ip().octets());
            body.extend_from_slice(&addr.port().to_be_bytes());
        }
        Destination::Domain { name, port } => {
            body.push(0x03);
            body.push(name.len() as u8);
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(&port.to_be_bytes());
        }
        Destination::Forward { .. } => {
            // Forward keys never appear in datagram records.
            body.push(0x01);
            body.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    body.extend_from_slice(payload);

    let mut record = Vec::with_capacity(body.len() + 2);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}

/// Parse one complete record out of the accumulation buffer, if present.
pub fn parse_udp_record(buf: &mut BytesMut) -> Option<(Destination, BytesMut)> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2);
    let mut body = buf.split_to(len);

    if body.is_empty() {
        return None;
    }
    let atyp = body[0];
    body.advance(1);
    let target = match atyp {
        0x01 if body.len() >= 6 => {
            let addr: [u8; 4] = body[..4].try_into().expect("checked length");
            body.advance(4);
            let port = u16::from_be_bytes([body[0], body[1]]);
            body.advance(2);
            Destination::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        0x04 if body.len() >= 18 => {
            let addr: [u8; 16] = body[..16].try_into().expect("checked length");
            body.advance(16);
            let port = u16::from_be_bytes([body[0], body[1]]);
            body.advance(2);
            Destination::Ip(SocketAddr::new(IpAddr::from(addr), port))
        }
        0x03 if !body.is_empty() => {
            let name_len = body[0] as usize;
            body.advance(1);
            if body.len() < name_len + 2 {
                return None;
            }
            let name = String::from_utf8_lossy(&body[..name_len]).to_string();
            body.advance(name_len);
            let port = u16::from_be_bytes([body[0], body[1]]);
            body.advance(2);
            Destination::Domain { name, port }
        }
        _ => return None,
    };
    Some((target, body))
}

/// Move datagrams between the client-facing UDP socket and a mesh stream.
async fn udp_relay(engine: Arc<StreamEngine>, udp: UdpSocket, expected_client: IpAddr) {
    let mut client: Option<SocketAddr> = None;
    let mut conduit: Option<(ConduitReader, ConduitWriter)> = None;
    let mut buf = vec![0u8; 64 * 1024];
    let mut inbound = BytesMut::new();

    loop {
        // Until the mesh stream exists only the socket can make progress.
        let (len, from) = match &mut conduit {
            None => match udp.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => return,
            },
            Some((reader, _)) => {
                tokio::select! {
                    received = udp.recv_from(&mut buf) => match received {
                        Ok(pair) => pair,
                        Err(_) => return,
                    },
                    chunk = reader.read() => {
                        match chunk {
                            Ok(Some(bytes)) => {
                                inbound.extend_from_slice(&bytes);
                                while let Some((source, payload)) = parse_udp_record(&mut inbound) {
                                    if let Some(client_addr) = client {
                                        let packet = build_client_packet(&source, &payload);
                                        udp.send_to(&packet, client_addr).await.ok();
                                    }
                                }
                                continue;
                            }
                            Ok(None) | Err(_) => return,
                        }
                    }
                }
            }
        };

        if from.ip() != expected_client {
            continue;
        }
        client = Some(from);

        // +----+------+------+----------+----------+----------+
        // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
        // +----+------+------+----------+----------+----------+
        if len < 4 || buf[2] != 0x00 {
            // Fragmented datagrams are dropped, as RFC 1928 permits.
            continue;
        }
        let addr_and_data = &buf[3..len];
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&(addr_and_data.len() as u16).to_be_bytes());
        framed.extend_from_slice(addr_and_data);
        let Some((target, payload)) = parse_udp_record(&mut framed) else { continue };

        if conduit.is_none() {
            // First datagram routes the association.
            match engine.open(target.clone(), StreamProto::Udp).await {
                Ok(pair) => conduit = Some(pair),
                Err(e) => {
                    log::debug!("[socks5] UDP mesh open failed: {}", e);
                    return;
                }
            }
        }
        if let Some((_, writer)) = &mut conduit {
            let record = encode_udp_record(&target, &payload);
            if writer.write(&record).await.is_err() {
                return;
            }
        }
    }
}

/// Wrap a mesh-side record back into a SOCKS5 UDP packet for the client.
fn build_client_packet(source: &Destination, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x00, 0x00, 0x00];
    let record = encode_udp_record(source, payload);
    // Strip the length prefix; the UDP datagram is self-delimiting.
    packet.extend_from_slice(&record[2..]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_record_roundtrip_ipv4() {
        let target = Destination::Ip("10.0.0.5:53".parse().unwrap());
        let record = encode_udp_record(&target, b"query");
        let mut buf = BytesMut::from(&record[..]);
        let (parsed, payload) = parse_udp_record(&mut buf).unwrap();
        assert_eq!(parsed, target);
        assert_eq!(&payload[..], b"query");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_udp_record_roundtrip_domain() {
        let target = Destination::Domain { name: "dns.internal.corp".into(), port: 53 };
        let record = encode_udp_record(&target, b"payload");
        let mut buf = BytesMut::from(&record[..]);
        let (parsed, payload) = parse_udp_record(&mut buf).unwrap();
        assert_eq!(parsed, target);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn test_udp_record_partial_buffer() {
        let target = Destination::Ip("10.0.0.5:53".parse().unwrap());
        let record = encode_udp_record(&target, b"query");
        let mut buf = BytesMut::from(&record[..record.len() - 1]);
        assert!(parse_udp_record(&mut buf).is_none());
    }

    #[test]
    fn test_udp_records_concatenate() {
        let a = Destination::Ip("10.0.0.5:53".parse().unwrap());
        let b = Destination::Ip("10.0.0.6:123".parse().unwrap());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_udp_record(&a, b"one"));
        buf.extend_from_slice(&encode_udp_record(&b, b"two"));

        let (first, payload) = parse_udp_record(&mut buf).unwrap();
        assert_eq!(first, a);
        assert_eq!(&payload[..], b"one");
        let (second, payload) = parse_udp_record(&mut buf).unwrap();
        assert_eq!(second, b);
        assert_eq!(&payload[..], b"two");
    }

    #[test]
    fn test_reply_code_mapping() {
        let failure = OpenFailure { code: OpenErrorCode::RouteNotFound, message: String::new() };
        assert!(matches!(ReplyCode::from_open_failure(&failure), ReplyCode::HostUnreachable));
        let failure = OpenFailure { code: OpenErrorCode::AccessDenied, message: String::new() };
        assert!(matches!(ReplyCode::from_open_failure(&failure), ReplyCode::NotAllowed));
        let failure = OpenFailure { code: OpenErrorCode::ConnectionRefused, message: String::new() };
        assert!(matches!(ReplyCode::from_open_failure(&failure), ReplyCode::ConnectionRefused));
    }

    #[test]
    fn test_client_packet_has_plain_udp_header() {
        let source = Destination::Ip("10.0.0.5:53".parse().unwrap());
        let packet = build_client_packet(&source, b"answer");
        assert_eq!(&packet[..3], &[0x00, 0x00, 0x00]);
        assert_eq!(packet[3], 0x01);
        assert_eq!(&packet[packet.len() - 6..], b"answer");
    }
}
