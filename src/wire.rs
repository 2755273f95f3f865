//! Mesh wire protocol
//!
//! Every frame exchanged between peers shares a fixed 14-byte header
//! `{ u8 type, u8 flags, u64 stream-id, u32 payload-length }` followed by the
//! payload. Variable-length payload fields are length-prefixed (u16 or u32 as
//! noted per field). Encoding and decoding live here, in one place, as a
//! tagged `Frame` enum; nothing else in the crate touches raw frame bytes.
//!
//! Control frames (hello, keepalive, routing) travel with stream-id 0 on the
//! per-peer control stream. Stream frames carry the virtual stream id they
//! belong to.

use crate::identity::{AgentId, AGENT_ID_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in PEER_HELLO; exact match is required.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed frame header length: type (1) + flags (1) + stream id (8) + len (4).
pub const HEADER_LEN: usize = 14;

/// Largest STREAM_DATA payload a peer will emit or accept.
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

/// Hard cap on any frame payload; larger lengths are a protocol error.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// STREAM_DATA flag: the sender will write no more bytes.
pub const FLAG_FIN_WRITE: u8 = 0x01;
/// STREAM_DATA flag: the sender expects no more bytes.
pub const FLAG_FIN_READ: u8 = 0x02;

/// Frame decode failure. Protocol errors are unrecoverable on the connection
/// that produced them; the peer layer closes the link.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown route family {0}")]
    UnknownFamily(u8),
    #[error("unknown destination kind {0}")]
    UnknownDestinationKind(u8),
    #[error("unknown stream-open error code {0}")]
    UnknownErrorCode(u8),
    #[error("unknown stream-reset code {0}")]
    UnknownResetCode(u8),
    #[error("frame payload truncated")]
    Truncated,
    #[error("frame payload length {0} exceeds maximum")]
    Oversized(u32),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("path length {0} is not a whole number of agent ids")]
    BadPathLength(usize),
    #[error("stream data payload of {0} bytes exceeds the 16 KiB limit")]
    DataTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    PeerHello = 1,
    PeerHelloAck = 2,
    Keepalive = 3,
    KeepaliveAck = 4,
    RouteAdvertise = 5,
    RouteWithdraw = 6,
    NodeInfoAdvertise = 7,
    StreamOpen = 8,
    StreamOpenAck = 9,
    StreamOpenErr = 10,
    StreamData = 11,
    StreamClose = 12,
    StreamReset = 13,
}

impl TryFrom<u8> for FrameType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::PeerHello,
            2 => Self::PeerHelloAck,
            3 => Self::Keepalive,
            4 => Self::KeepaliveAck,
            5 => Self::RouteAdvertise,
            6 => Self::RouteWithdraw,
            7 => Self::NodeInfoAdvertise,
            8 => Self::StreamOpen,
            9 => Self::StreamOpenAck,
            10 => Self::StreamOpenErr,
            11 => Self::StreamData,
            12 => Self::StreamClose,
            13 => Self::StreamReset,
            other => return Err(DecodeError::UnknownFrameType(other)),
        })
    }
}

/// Route address family on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RouteFamily {
    Ipv4 = 1,
    Ipv6 = 2,
    Domain = 3,
    Forward = 4,
    Agent = 5,
}

impl TryFrom<u8> for RouteFamily {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::Ipv4,
            2 => Self::Ipv6,
            3 => Self::Domain,
            4 => Self::Forward,
            5 => Self::Agent,
            other => return Err(DecodeError::UnknownFamily(other)),
        })
    }
}

/// One advertised route: `{ u8 family, u8 prefix-length, lp-u16 prefix-bytes,
/// u16 metric }`. Prefix bytes are the address for CIDR families, the UTF-8
/// pattern for domains, the key for forward routes, and the agent id for
/// presence routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: RouteFamily,
    pub prefix_len: u8,
    pub prefix: Vec<u8>,
    pub metric: u16,
}

/// Route advertisement path. Paths travel in a one-byte envelope that marks
/// whether the bytes are sealed to a management key. This implementation
/// always emits plaintext paths; sealed paths it cannot read are carried
/// through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathData {
    Plain(Vec<AgentId>),
    Sealed(Vec<u8>),
}

impl PathData {
    pub fn as_plain(&self) -> Option<&[AgentId]> {
        match self {
            PathData::Plain(ids) => Some(ids),
            PathData::Sealed(_) => None,
        }
    }
}

/// PEER_HELLO / PEER_HELLO_ACK payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub version: u8,
    pub agent_id: AgentId,
    /// Sender's clock in nanoseconds; the ACK echoes the HELLO's value so the
    /// dialler can measure RTT.
    pub timestamp_nanos: u64,
    pub capabilities: Vec<String>,
    pub display_name: String,
}

/// ROUTE_ADVERTISE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAdvertise {
    pub origin: AgentId,
    pub display_name: String,
    pub sequence: u64,
    pub routes: Vec<Route>,
    pub path: PathData,
    pub seen_by: Vec<AgentId>,
}

/// ROUTE_WITHDRAW payload. Same shape as an advertisement minus the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteWithdraw {
    pub origin: AgentId,
    pub sequence: u64,
    pub routes: Vec<Route>,
    pub seen_by: Vec<AgentId>,
}

/// NODE_INFO_ADVERTISE payload: cosmetic node directory data, flooded with
/// the same dedup discipline as routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub origin: AgentId,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub sequence: u64,
    pub seen_by: Vec<AgentId>,
}

/// Transport protocol a stream carries at the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamProto {
    Tcp = 1,
    Udp = 2,
}

/// Where a stream should terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(SocketAddr),
    Domain { name: String, port: u16 },
    Forward { key: String },
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Ip(addr) => write!(f, "{}", addr),
            Destination::Domain { name, port } => write!(f, "{}:{}", name, port),
            Destination::Forward { key } => write!(f, "forward:{}", key),
        }
    }
}

/// STREAM_OPEN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    pub destination: Destination,
    pub proto: StreamProto,
    /// Remaining hops after the receiving peer, ingress first.
    pub path: Vec<AgentId>,
    /// Ingress ephemeral X25519 public key.
    pub public_key: Vec<u8>,
}

/// STREAM_OPEN_ACK payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenAck {
    /// Exit ephemeral X25519 public key.
    pub public_key: Vec<u8>,
}

/// STREAM_OPEN_ERR codes, surfaced to the ingress as SOCKS5 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenErrorCode {
    RouteNotFound = 1,
    ConnectionRefused = 2,
    ConnectionTimeout = 3,
    AccessDenied = 4,
    DnsFailure = 5,
    InternalError = 6,
}

impl TryFrom<u8> for OpenErrorCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::RouteNotFound,
            2 => Self::ConnectionRefused,
            3 => Self::ConnectionTimeout,
            4 => Self::AccessDenied,
            5 => Self::DnsFailure,
            6 => Self::InternalError,
            other => return Err(DecodeError::UnknownErrorCode(other)),
        })
    }
}

/// STREAM_OPEN_ERR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenErr {
    pub code: OpenErrorCode,
    pub message: String,
}

/// STREAM_RESET codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetCode {
    InternalError = 1,
    ProtocolError = 2,
    Timeout = 3,
    Cancelled = 4,
}

impl TryFrom<u8> for ResetCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::InternalError,
            2 => Self::ProtocolError,
            3 => Self::Timeout,
            4 => Self::Cancelled,
            other => return Err(DecodeError::UnknownResetCode(other)),
        })
    }
}

/// A decoded mesh frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    PeerHello(PeerHello),
    PeerHelloAck(PeerHello),
    Keepalive { timestamp_nanos: u64 },
    KeepaliveAck { timestamp_nanos: u64 },
    RouteAdvertise(RouteAdvertise),
    RouteWithdraw(RouteWithdraw),
    NodeInfoAdvertise(NodeInfo),
    StreamOpen { stream_id: u64, open: StreamOpen },
    StreamOpenAck { stream_id: u64, ack: StreamOpenAck },
    StreamOpenErr { stream_id: u64, err: StreamOpenErr },
    StreamData { stream_id: u64, fin_write: bool, fin_read: bool, payload: Bytes },
    StreamClose { stream_id: u64 },
    StreamReset { stream_id: u64, code: ResetCode },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::PeerHello(_) => FrameType::PeerHello,
            Frame::PeerHelloAck(_) => FrameType::PeerHelloAck,
            Frame::Keepalive { .. } => FrameType::Keepalive,
            Frame::KeepaliveAck { .. } => FrameType::KeepaliveAck,
            Frame::RouteAdvertise(_) => FrameType::RouteAdvertise,
            Frame::RouteWithdraw(_) => FrameType::RouteWithdraw,
            Frame::NodeInfoAdvertise(_) => FrameType::NodeInfoAdvertise,
            Frame::StreamOpen { .. } => FrameType::StreamOpen,
            Frame::StreamOpenAck { .. } => FrameType::StreamOpenAck,
            Frame::StreamOpenErr { .. } => FrameType::StreamOpenErr,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamClose { .. } => FrameType::StreamClose,
            Frame::StreamReset { .. } => FrameType::StreamReset,
        }
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            Frame::StreamOpen { stream_id, .. }
            | Frame::StreamOpenAck { stream_id, .. }
            | Frame::StreamOpenErr { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamClose { stream_id }
            | Frame::StreamReset { stream_id, .. } => *stream_id,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding

fn put_lp16_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_lp32_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u32::MAX as usize);
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_string_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u16(items.len() as u16);
    for item in items {
        put_lp16_bytes(buf, item.as_bytes());
    }
}

fn put_agent_list(buf: &mut BytesMut, ids: &[AgentId]) {
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_slice(id.as_bytes());
    }
}

fn put_hello(buf: &mut BytesMut, hello: &PeerHello) {
    buf.put_u8(hello.version);
    buf.put_slice(hello.agent_id.as_bytes());
    buf.put_u64(hello.timestamp_nanos);
    put_string_list(buf, &hello.capabilities);
    put_lp16_bytes(buf, hello.display_name.as_bytes());
}

fn put_routes(buf: &mut BytesMut, routes: &[Route]) {
    buf.put_u32(routes.len() as u32);
    for route in routes {
        buf.put_u8(route.family as u8);
        buf.put_u8(route.prefix_len);
        put_lp16_bytes(buf, &route.prefix);
        buf.put_u16(route.metric);
    }
}

fn put_path(buf: &mut BytesMut, path: &PathData) {
    match path {
        PathData::Plain(ids) => {
            buf.put_u8(0);
            buf.put_u32((ids.len() * AGENT_ID_LEN) as u32);
            for id in ids {
                buf.put_slice(id.as_bytes());
            }
        }
        PathData::Sealed(bytes) => {
            buf.put_u8(1);
            put_lp32_bytes(buf, bytes);
        }
    }
}

fn put_destination(buf: &mut BytesMut, dest: &Destination, proto: StreamProto) {
    match dest {
        Destination::Ip(SocketAddr::V4(addr)) => {
            buf.put_u8(1);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Destination::Ip(SocketAddr::V6(addr)) => {
            buf.put_u8(2);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Destination::Domain { name, port } => {
            buf.put_u8(3);
            put_lp16_bytes(buf, name.as_bytes());
            buf.put_u16(*port);
        }
        Destination::Forward { key } => {
            buf.put_u8(4);
            put_lp16_bytes(buf, key.as_bytes());
        }
    }
    buf.put_u8(proto as u8);
}

/// Encode a frame, header included, into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> BytesMut {
    let mut payload = BytesMut::new();
    let mut flags = 0u8;

    match frame {
        Frame::PeerHello(h) | Frame::PeerHelloAck(h) => put_hello(&mut payload, h),
        Frame::Keepalive { timestamp_nanos } | Frame::KeepaliveAck { timestamp_nanos } => {
            payload.put_u64(*timestamp_nanos);
        }
        Frame::RouteAdvertise(adv) => {
            payload.put_slice(adv.origin.as_bytes());
            put_lp16_bytes(&mut payload, adv.display_name.as_bytes());
            payload.put_u64(adv.sequence);
            put_routes(&mut payload, &adv.routes);
            put_path(&mut payload, &adv.path);
            put_agent_list(&mut payload, &adv.seen_by);
        }
        Frame::RouteWithdraw(wd) => {
            payload.put_slice(wd.origin.as_bytes());
            payload.put_u64(wd.sequence);
            put_routes(&mut payload, &wd.routes);
            put_agent_list(&mut payload, &wd.seen_by);
        }
        Frame::NodeInfoAdvertise(info) => {
            payload.put_slice(info.origin.as_bytes());
            put_lp16_bytes(&mut payload, info.display_name.as_bytes());
            put_string_list(&mut payload, &info.capabilities);
            payload.put_u64(info.sequence);
            put_agent_list(&mut payload, &info.seen_by);
        }
        Frame::StreamOpen { open, .. } => {
            put_destination(&mut payload, &open.destination, open.proto);
            payload.put_u16(open.path.len() as u16);
            for id in &open.path {
                payload.put_slice(id.as_bytes());
            }
            put_lp16_bytes(&mut payload, &open.public_key);
        }
        Frame::StreamOpenAck { ack, .. } => {
            put_lp16_bytes(&mut payload, &ack.public_key);
        }
        Frame::StreamOpenErr { err, .. } => {
            payload.put_u8(err.code as u8);
            put_lp16_bytes(&mut payload, err.message.as_bytes());
        }
        Frame::StreamData { fin_write, fin_read, payload: data, .. } => {
            if *fin_write {
                flags |= FLAG_FIN_WRITE;
            }
            if *fin_read {
                flags |= FLAG_FIN_READ;
            }
            payload.put_slice(data);
        }
        Frame::StreamClose { .. } => {}
        Frame::StreamReset { code, .. } => {
            payload.put_u8(*code as u8);
        }
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(frame.frame_type() as u8);
    buf.put_u8(flags);
    buf.put_u64(frame.stream_id());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf
}

// ---------------------------------------------------------------------------
// Decoding

fn need(buf: &impl Buf, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated);
    }
    Ok(())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, DecodeError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, DecodeError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, DecodeError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, DecodeError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut impl Buf, n: usize) -> Result<Vec<u8>, DecodeError> {
    need(buf, n)?;
    let mut out = vec![0u8; n];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_lp16_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, DecodeError> {
    let len = get_u16(buf)? as usize;
    get_bytes(buf, len)
}

fn get_lp32_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, DecodeError> {
    let len = get_u32(buf)? as usize;
    get_bytes(buf, len)
}

fn get_string(buf: &mut impl Buf) -> Result<String, DecodeError> {
    let bytes = get_lp16_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
}

fn get_string_list(buf: &mut impl Buf) -> Result<Vec<String>, DecodeError> {
    let count = get_u16(buf)? as usize;
    let mut out = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        out.push(get_string(buf)?);
    }
    Ok(out)
}

fn get_agent_id(buf: &mut impl Buf) -> Result<AgentId, DecodeError> {
    need(buf, AGENT_ID_LEN)?;
    let mut bytes = [0u8; AGENT_ID_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(AgentId::from_bytes(bytes))
}

fn get_agent_list(buf: &mut impl Buf) -> Result<Vec<AgentId>, DecodeError> {
    let count = get_u32(buf)? as usize;
    need(buf, count.saturating_mul(AGENT_ID_LEN))?;
    let mut out = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        out.push(get_agent_id(buf)?);
    }
    Ok(out)
}

fn get_hello(buf: &mut impl Buf) -> Result<PeerHello, DecodeError> {
    Ok(PeerHello {
        version: get_u8(buf)?,
        agent_id: get_agent_id(buf)?,
        timestamp_nanos: get_u64(buf)?,
        capabilities: get_string_list(buf)?,
        display_name: get_string(buf)?,
    })
}

fn get_routes(buf: &mut impl Buf) -> Result<Vec<Route>, DecodeError> {
    let count = get_u32(buf)? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let family = RouteFamily::try_from(get_u8(buf)?)?;
        let prefix_len = get_u8(buf)?;
        let prefix = get_lp16_bytes(buf)?;
        let metric = get_u16(buf)?;
        out.push(Route { family, prefix_len, prefix, metric });
    }
    Ok(out)
}

fn get_path(buf: &mut impl Buf) -> Result<PathData, DecodeError> {
    let is_encrypted = get_u8(buf)?;
    let bytes = get_lp32_bytes(buf)?;
    if is_encrypted != 0 {
        return Ok(PathData::Sealed(bytes));
    }
    if bytes.len() % AGENT_ID_LEN != 0 {
        return Err(DecodeError::BadPathLength(bytes.len()));
    }
    let ids = bytes
        .chunks_exact(AGENT_ID_LEN)
        .map(|chunk| {
            let mut arr = [0u8; AGENT_ID_LEN];
            arr.copy_from_slice(chunk);
            AgentId::from_bytes(arr)
        })
        .collect();
    Ok(PathData::Plain(ids))
}

fn get_destination(buf: &mut impl Buf) -> Result<(Destination, StreamProto), DecodeError> {
    let kind = get_u8(buf)?;
    let dest = match kind {
        1 => {
            let octets: [u8; 4] = get_bytes(buf, 4)?.try_into().unwrap();
            let port = get_u16(buf)?;
            Destination::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        2 => {
            let octets: [u8; 16] = get_bytes(buf, 16)?.try_into().unwrap();
            let port = get_u16(buf)?;
            Destination::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        3 => {
            let name = get_string(buf)?;
            let port = get_u16(buf)?;
            Destination::Domain { name, port }
        }
        4 => Destination::Forward { key: get_string(buf)? },
        other => return Err(DecodeError::UnknownDestinationKind(other)),
    };
    let proto = match get_u8(buf)? {
        1 => StreamProto::Tcp,
        2 => StreamProto::Udp,
        other => return Err(DecodeError::UnknownDestinationKind(other)),
    };
    Ok((dest, proto))
}

/// Decode one frame's payload given its parsed header.
fn decode_payload(
    frame_type: FrameType,
    flags: u8,
    stream_id: u64,
    mut payload: Bytes,
) -> Result<Frame, DecodeError> {
    let buf = &mut payload;
    let frame = match frame_type {
        FrameType::PeerHello => Frame::PeerHello(get_hello(buf)?),
        FrameType::PeerHelloAck => Frame::PeerHelloAck(get_hello(buf)?),
        FrameType::Keepalive => Frame::Keepalive { timestamp_nanos: get_u64(buf)? },
        FrameType::KeepaliveAck => Frame::KeepaliveAck { timestamp_nanos: get_u64(buf)? },
        FrameType::RouteAdvertise => Frame::RouteAdvertise(RouteAdvertise {
            origin: get_agent_id(buf)?,
            display_name: get_string(buf)?,
            sequence: get_u64(buf)?,
            routes: get_routes(buf)?,
            path: get_path(buf)?,
            seen_by: get_agent_list(buf)?,
        }),
        FrameType::RouteWithdraw => Frame::RouteWithdraw(RouteWithdraw {
            origin: get_agent_id(buf)?,
            sequence: get_u64(buf)?,
            routes: get_routes(buf)?,
            seen_by: get_agent_list(buf)?,
        }),
        FrameType::NodeInfoAdvertise => Frame::NodeInfoAdvertise(NodeInfo {
            origin: get_agent_id(buf)?,
            display_name: get_string(buf)?,
            capabilities: get_string_list(buf)?,
            sequence: get_u64(buf)?,
            seen_by: get_agent_list(buf)?,
        }),
        FrameType::StreamOpen => {
            let (destination, proto) = get_destination(buf)?;
            let hop_count = get_u16(buf)? as usize;
            let mut path = Vec::with_capacity(hop_count.min(64));
            for _ in 0..hop_count {
                path.push(get_agent_id(buf)?);
            }
            let public_key = get_lp16_bytes(buf)?;
            Frame::StreamOpen {
                stream_id,
                open: StreamOpen { destination, proto, path, public_key },
            }
        }
        FrameType::StreamOpenAck => Frame::StreamOpenAck {
            stream_id,
            ack: StreamOpenAck { public_key: get_lp16_bytes(buf)? },
        },
        FrameType::StreamOpenErr => Frame::StreamOpenErr {
            stream_id,
            err: StreamOpenErr {
                code: OpenErrorCode::try_from(get_u8(buf)?)?,
                message: get_string(buf)?,
            },
        },
        FrameType::StreamData => {
            if buf.remaining() > MAX_DATA_PAYLOAD {
                return Err(DecodeError::DataTooLarge(buf.remaining()));
            }
            Frame::StreamData {
                stream_id,
                fin_write: flags & FLAG_FIN_WRITE != 0,
                fin_read: flags & FLAG_FIN_READ != 0,
                payload: buf.copy_to_bytes(buf.remaining()),
            }
        }
        FrameType::StreamClose => Frame::StreamClose { stream_id },
        FrameType::StreamReset => Frame::StreamReset {
            stream_id,
            code: ResetCode::try_from(get_u8(buf)?)?,
        },
    };
    Ok(frame)
}

/// Incrementally decode a frame from an accumulation buffer. Returns
/// `Ok(None)` until a whole frame is buffered; consumed bytes are split off.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
    if payload_len as usize > MAX_FRAME_PAYLOAD {
        return Err(DecodeError::Oversized(payload_len));
    }
    if buf.len() < HEADER_LEN + payload_len as usize {
        return Ok(None);
    }

    let mut header = buf.split_to(HEADER_LEN);
    let frame_type = FrameType::try_from(header.get_u8())?;
    let flags = header.get_u8();
    let stream_id = header.get_u64();
    let _len = header.get_u32();
    let payload = buf.split_to(payload_len as usize).freeze();
    decode_payload(frame_type, flags, stream_id, payload).map(Some)
}

/// Read exactly one frame from an async byte stream, returning the frame
/// and its size on the wire.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<(Frame, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let frame_type = FrameType::try_from(header[0]).map_err(to_io)?;
    let flags = header[1];
    let stream_id = u64::from_be_bytes(header[2..10].try_into().unwrap());
    let payload_len = u32::from_be_bytes(header[10..14].try_into().unwrap());
    if payload_len as usize > MAX_FRAME_PAYLOAD {
        return Err(to_io(DecodeError::Oversized(payload_len)));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;
    let frame = decode_payload(frame_type, flags, stream_id, Bytes::from(payload)).map_err(to_io)?;
    Ok((frame, HEADER_LEN + payload_len as usize))
}

/// Write one frame to an async byte stream, returning its size on the wire.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len())
}

fn to_io(e: DecodeError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> AgentId {
        AgentId::from_bytes([byte; 16])
    }

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = encode_frame(&frame);
        let decoded = decode_frame(&mut buf).unwrap().expect("whole frame buffered");
        assert!(buf.is_empty(), "decoder must consume the frame exactly");
        assert_eq!(frame, decoded);
        decoded
    }

    #[test]
    fn test_hello_roundtrip() {
        roundtrip(Frame::PeerHello(PeerHello {
            version: PROTOCOL_VERSION,
            agent_id: id(1),
            timestamp_nanos: 123_456_789,
            capabilities: vec!["exit".into(), "socks5".into()],
            display_name: "edge-1".into(),
        }));
        roundtrip(Frame::PeerHelloAck(PeerHello {
            version: PROTOCOL_VERSION,
            agent_id: id(2),
            timestamp_nanos: 42,
            capabilities: vec![],
            display_name: String::new(),
        }));
    }

    #[test]
    fn test_keepalive_roundtrip() {
        roundtrip(Frame::Keepalive { timestamp_nanos: u64::MAX });
        roundtrip(Frame::KeepaliveAck { timestamp_nanos: 0 });
    }

    #[test]
    fn test_route_advertise_roundtrip_including_path_and_seen_by() {
        roundtrip(Frame::RouteAdvertise(RouteAdvertise {
            origin: id(9),
            display_name: "exit-fra".into(),
            sequence: 77,
            routes: vec![
                Route {
                    family: RouteFamily::Ipv4,
                    prefix_len: 8,
                    prefix: vec![10, 0, 0, 0],
                    metric: 0,
                },
                Route {
                    family: RouteFamily::Domain,
                    prefix_len: 0,
                    prefix: b"*.internal.corp".to_vec(),
                    metric: 3,
                },
                Route {
                    family: RouteFamily::Agent,
                    prefix_len: 0,
                    prefix: id(9).as_bytes().to_vec(),
                    metric: 0,
                },
            ],
            path: PathData::Plain(vec![id(3), id(9)]),
            seen_by: vec![id(3), id(9), id(4)],
        }));
    }

    #[test]
    fn test_sealed_path_carried_opaquely() {
        let frame = roundtrip(Frame::RouteAdvertise(RouteAdvertise {
            origin: id(1),
            display_name: String::new(),
            sequence: 1,
            routes: vec![],
            path: PathData::Sealed(vec![0xde, 0xad, 0xbe, 0xef]),
            seen_by: vec![],
        }));
        match frame {
            Frame::RouteAdvertise(adv) => assert!(adv.path.as_plain().is_none()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_route_withdraw_roundtrip() {
        roundtrip(Frame::RouteWithdraw(RouteWithdraw {
            origin: id(5),
            sequence: 12,
            routes: vec![Route {
                family: RouteFamily::Ipv6,
                prefix_len: 64,
                prefix: vec![0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                metric: 2,
            }],
            seen_by: vec![id(5)],
        }));
    }

    #[test]
    fn test_node_info_roundtrip() {
        roundtrip(Frame::NodeInfoAdvertise(NodeInfo {
            origin: id(7),
            display_name: "transit-ams".into(),
            capabilities: vec!["transit".into()],
            sequence: 5,
            seen_by: vec![id(7), id(2)],
        }));
    }

    #[test]
    fn test_stream_open_roundtrip_all_destination_kinds() {
        roundtrip(Frame::StreamOpen {
            stream_id: 7,
            open: StreamOpen {
                destination: Destination::Ip("10.0.0.5:22".parse().unwrap()),
                proto: StreamProto::Tcp,
                path: vec![id(2), id(3)],
                public_key: vec![0xaa; 32],
            },
        });
        roundtrip(Frame::StreamOpen {
            stream_id: 9,
            open: StreamOpen {
                destination: Destination::Ip("[2001:db8::1]:443".parse().unwrap()),
                proto: StreamProto::Udp,
                path: vec![],
                public_key: vec![0x01; 32],
            },
        });
        roundtrip(Frame::StreamOpen {
            stream_id: 11,
            open: StreamOpen {
                destination: Destination::Domain { name: "api.internal.corp".into(), port: 443 },
                proto: StreamProto::Tcp,
                path: vec![id(4)],
                public_key: vec![0x02; 32],
            },
        });
        roundtrip(Frame::StreamOpen {
            stream_id: 13,
            open: StreamOpen {
                destination: Destination::Forward { key: "jump-host".into() },
                proto: StreamProto::Tcp,
                path: vec![],
                public_key: vec![0x03; 32],
            },
        });
    }

    #[test]
    fn test_stream_ack_err_close_reset_roundtrip() {
        roundtrip(Frame::StreamOpenAck { stream_id: 7, ack: StreamOpenAck { public_key: vec![0xbb; 32] } });
        roundtrip(Frame::StreamOpenErr {
            stream_id: 7,
            err: StreamOpenErr { code: OpenErrorCode::ConnectionRefused, message: "refused".into() },
        });
        roundtrip(Frame::StreamClose { stream_id: 3 });
        roundtrip(Frame::StreamReset { stream_id: 3, code: ResetCode::Timeout });
    }

    #[test]
    fn test_stream_data_fin_flags_in_header() {
        let frame = Frame::StreamData {
            stream_id: 5,
            fin_write: true,
            fin_read: false,
            payload: Bytes::from_static(b"hello"),
        };
        let buf = encode_frame(&frame);
        assert_eq!(buf[1], FLAG_FIN_WRITE);
        roundtrip(frame);
        roundtrip(Frame::StreamData {
            stream_id: 5,
            fin_write: true,
            fin_read: true,
            payload: Bytes::new(),
        });
    }

    #[test]
    fn test_partial_buffer_returns_none() {
        let frame = Frame::Keepalive { timestamp_nanos: 1 };
        let full = encode_frame(&frame);
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode_frame(&mut partial).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode_frame(&Frame::StreamClose { stream_id: 1 });
        buf.extend_from_slice(&encode_frame(&Frame::StreamClose { stream_id: 2 }));
        let first = decode_frame(&mut buf).unwrap().unwrap();
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.stream_id(), 1);
        assert_eq!(second.stream_id(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut buf = encode_frame(&Frame::StreamClose { stream_id: 1 });
        buf[0] = 0xff;
        assert!(matches!(decode_frame(&mut buf), Err(DecodeError::UnknownFrameType(0xff))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::StreamData as u8);
        buf.put_u8(0);
        buf.put_u64(1);
        buf.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);
        assert!(matches!(decode_frame(&mut buf), Err(DecodeError::Oversized(_))));
    }

    #[test]
    fn test_oversized_stream_data_rejected() {
        let frame = Frame::StreamData {
            stream_id: 1,
            fin_write: false,
            fin_read: false,
            payload: Bytes::from(vec![0u8; MAX_DATA_PAYLOAD + 1]),
        };
        let mut buf = encode_frame(&frame);
        assert!(matches!(decode_frame(&mut buf), Err(DecodeError::DataTooLarge(_))));
    }

    #[test]
    fn test_bad_path_length_rejected() {
        let mut buf = encode_frame(&Frame::RouteAdvertise(RouteAdvertise {
            origin: id(1),
            display_name: String::new(),
            sequence: 1,
            routes: vec![],
            path: PathData::Sealed(vec![1, 2, 3]),
            seen_by: vec![],
        }));
        // Flip the sealed marker to plaintext: 3 bytes is not a whole id.
        let marker_at = HEADER_LEN + 16 + 2 + 8 + 4;
        buf[marker_at] = 0;
        assert!(matches!(decode_frame(&mut buf), Err(DecodeError::BadPathLength(3))));
    }

    #[tokio::test]
    async fn test_async_read_write_frame() {
        let frame = Frame::StreamData {
            stream_id: 99,
            fin_write: false,
            fin_read: true,
            payload: Bytes::from_static(b"payload bytes"),
        };
        let mut wire = Vec::new();
        let written = write_frame(&mut wire, &frame).await.unwrap();
        assert_eq!(written, wire.len());
        let mut reader = std::io::Cursor::new(wire);
        let (decoded, read) = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, decoded);
        assert_eq!(read, written);
    }
}
