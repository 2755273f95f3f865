//! Stream engine
//!
//! Owns every virtual stream crossing this agent, in any of three roles:
//!
//! - **ingress**: `open()` looks the destination up, source-routes a
//!   STREAM_OPEN along the stored path, derives the session keys from the
//!   exit's ACK, and hands the caller a conduit pair.
//! - **transit**: STREAM_OPENs are relayed hop by hop, keeping a mapping
//!   between the (prev-peer, id) and (next-peer, id) sides; data frames are
//!   forwarded opaquely between the two substreams.
//! - **exit**: the destination is validated and dialled through the
//!   `ExitConnector`, the ACK carries our ephemeral key back, and a bridge
//!   task splices the socket.
//!
//! Open/ACK/ERR travel on the peer control stream. Once a stream is open,
//! its frames travel on a dedicated transport substream per hop, opened by
//! whichever side dialled that link (HTTP/2 servers cannot open streams, so
//! the dialler-opens rule is the one convention every transport supports).
//! The first frame on a substream carries the stream id that binds it.
//! Per-stream backpressure needs no window updates: a stalled consumer
//! fills the bounded frame channel, the relay task stops reading its
//! substream, and the transport's flow control pushes back across the hop.

use crate::config::LimitsConfig;
use crate::identity::AgentId;
use crate::peer::{PeerConnection, PeerRegistry};
use crate::routing::RoutingTable;
use crate::stream::conduit::{ConduitEvent, ConduitReader, ConduitWriter};
use crate::stream::crypto::Ephemeral;
use crate::transport::BoxStream;
use crate::wire::{
    self, Destination, Frame, OpenErrorCode, ResetCode, StreamOpen, StreamOpenAck, StreamOpenErr,
    StreamProto, MAX_DATA_PAYLOAD,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};

/// A hop-local stream endpoint: (peer, stream id on that connection).
type HopKey = (AgentId, u64);

/// Outbound TCP or UDP socket opened by the exit.
pub enum ExitSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// What the engine needs from the exit adapter: dial a validated
/// destination, and bridge an accepted socket to a conduit pair.
#[async_trait]
pub trait ExitConnector: Send + Sync {
    async fn connect(
        &self,
        destination: &Destination,
        proto: StreamProto,
    ) -> Result<ExitSocket, StreamOpenErr>;

    fn bridge(&self, socket: ExitSocket, reader: ConduitReader, writer: ConduitWriter);
}

/// Why an `open()` failed; maps onto a SOCKS5 reply at the ingress.
#[derive(Debug, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct OpenFailure {
    pub code: OpenErrorCode,
    pub message: String,
}

impl OpenFailure {
    fn new(code: OpenErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

enum Counterpart {
    /// Transit: the other hop of the same stream.
    Peer(HopKey),
    /// Endpoint: events for the local conduit reader.
    Local(mpsc::Sender<ConduitEvent>),
}

struct Hop {
    counterpart: Counterpart,
    /// Frames queued for this hop's substream; bounded, which is the
    /// per-stream receive buffer.
    out_tx: mpsc::Sender<Frame>,
    /// Taken when the substream attaches.
    out_rx: Option<mpsc::Receiver<Frame>>,
    /// Transfer counters, guarded by the engine lock. Bytes count data
    /// payload; frames count everything crossing the hop.
    frames_in: u64,
    bytes_in: u64,
    frames_out: u64,
    bytes_out: u64,
}

impl Hop {
    fn new(counterpart: Counterpart, out_tx: mpsc::Sender<Frame>, out_rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            counterpart,
            out_tx,
            out_rx: Some(out_rx),
            frames_in: 0,
            bytes_in: 0,
            frames_out: 0,
            bytes_out: 0,
        }
    }
}

/// Point-in-time transfer counters for one live stream hop.
#[derive(Debug, Clone)]
pub struct StreamStat {
    pub peer: AgentId,
    pub stream_id: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
}

struct PendingLocal {
    responder: oneshot::Sender<Result<StreamOpenAck, StreamOpenErr>>,
    created_at: Instant,
}

struct PendingTransit {
    upstream: HopKey,
    created_at: Instant,
}

/// A substream whose binding frame arrived before the hop record existed
/// (ACK handling and substream accept race on independent tasks).
struct ParkedSubstream {
    stream: BoxStream,
    first: Frame,
    parked_at: Instant,
}

#[derive(Default)]
struct Inner {
    hops: HashMap<HopKey, Hop>,
    per_peer: HashMap<AgentId, usize>,
    /// Ingress opens awaiting an ACK, keyed by (next peer, our stream id).
    pending_local: HashMap<HopKey, PendingLocal>,
    /// Transit opens awaiting a downstream ACK, keyed by the downstream
    /// hop, mapping back to the upstream hop; plus the reverse direction.
    pending_transit: HashMap<HopKey, PendingTransit>,
    pending_transit_rev: HashMap<HopKey, HopKey>,
    parked: HashMap<HopKey, ParkedSubstream>,
}

impl Inner {
    fn pending_count(&self) -> usize {
        self.pending_local.len() + self.pending_transit.len()
    }

    fn add_hop(&mut self, key: HopKey, hop: Hop) {
        *self.per_peer.entry(key.0).or_insert(0) += 1;
        self.hops.insert(key, hop);
    }

    fn drop_hop(&mut self, key: &HopKey) -> Option<Hop> {
        let hop = self.hops.remove(key)?;
        if let Some(count) = self.per_peer.get_mut(&key.0) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_peer.remove(&key.0);
            }
        }
        Some(hop)
    }
}

pub struct StreamEngine {
    local: AgentId,
    limits: LimitsConfig,
    peers: Arc<PeerRegistry>,
    table: Arc<RoutingTable>,
    exit: Option<Arc<dyn ExitConnector>>,
    inner: Mutex<Inner>,
    total_streams: AtomicUsize,
}

impl StreamEngine {
    pub fn new(
        local: AgentId,
        limits: LimitsConfig,
        peers: Arc<PeerRegistry>,
        table: Arc<RoutingTable>,
        exit: Option<Arc<dyn ExitConnector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            limits,
            peers,
            table,
            exit,
            inner: Mutex::new(Inner::default()),
            total_streams: AtomicUsize::new(0),
        })
    }

    fn frame_queue_depth(&self) -> usize {
        (self.limits.buffer_size / MAX_DATA_PAYLOAD).max(2)
    }

    pub fn stream_count(&self) -> usize {
        self.total_streams.load(Ordering::SeqCst)
    }

    /// Per-hop transfer counters for every live stream, for status dumps.
    pub fn stream_stats(&self) -> Vec<StreamStat> {
        let inner = self.inner.lock().expect("engine lock");
        inner
            .hops
            .iter()
            .map(|((peer, stream_id), hop)| StreamStat {
                peer: *peer,
                stream_id: *stream_id,
                frames_in: hop.frames_in,
                bytes_in: hop.bytes_in,
                frames_out: hop.frames_out,
                bytes_out: hop.bytes_out,
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Ingress

    /// Open a stream to `destination` through the mesh and return the local
    /// endpoint pair. Domain destinations prefer a domain route; otherwise
    /// they are resolved locally and routed by IP.
    pub async fn open(
        self: &Arc<Self>,
        destination: Destination,
        proto: StreamProto,
    ) -> Result<(ConduitReader, ConduitWriter), OpenFailure> {
        let (destination, entry) = self.resolve_route(destination).await?;

        if entry.origin == self.local {
            return self.open_local(destination, proto).await;
        }

        let next_hop = entry.next_hop;
        let conn = self.peers.get(&next_hop).ok_or_else(|| {
            OpenFailure::new(OpenErrorCode::RouteNotFound, "next hop not connected")
        })?;

        // Remaining hops after the next peer; the stored path starts at the
        // next hop.
        let remaining: Vec<AgentId> = if entry.path.first() == Some(&next_hop) {
            entry.path[1..].to_vec()
        } else {
            entry.path.clone()
        };

        let stream_id = conn.next_stream_id();
        let key = (next_hop, stream_id);
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().expect("engine lock");
            self.check_limits(&inner, next_hop)?;
            inner.pending_local.insert(
                key,
                PendingLocal { responder: ack_tx, created_at: Instant::now() },
            );
        }

        let ephemeral = Ephemeral::generate();
        let open = StreamOpen {
            destination: destination.clone(),
            proto,
            path: remaining,
            public_key: ephemeral.public_key_bytes(),
        };
        log::debug!(
            "[stream] opening {} via {} (id {})",
            destination,
            next_hop.short(),
            stream_id
        );
        if conn.send_frame(&Frame::StreamOpen { stream_id, open }).await.is_err() {
            self.inner.lock().expect("engine lock").pending_local.remove(&key);
            return Err(OpenFailure::new(OpenErrorCode::InternalError, "send to next hop failed"));
        }

        let ack = match tokio::time::timeout(self.limits.stream_open_timeout, ack_rx).await {
            Ok(Ok(Ok(ack))) => ack,
            Ok(Ok(Err(err))) => return Err(OpenFailure::new(err.code, err.message)),
            Ok(Err(_)) => {
                return Err(OpenFailure::new(OpenErrorCode::InternalError, "open abandoned"))
            }
            Err(_) => {
                self.inner.lock().expect("engine lock").pending_local.remove(&key);
                self.peers
                    .send_to_peer(
                        &next_hop,
                        &Frame::StreamReset { stream_id, code: ResetCode::Timeout },
                    )
                    .await
                    .ok();
                return Err(OpenFailure::new(OpenErrorCode::ConnectionTimeout, "open timed out"));
            }
        };

        let (seal, open_cipher) = ephemeral.into_ingress_session(&ack.public_key).map_err(|e| {
            OpenFailure::new(OpenErrorCode::InternalError, format!("bad exit key: {}", e))
        })?;

        let depth = self.frame_queue_depth();
        let (out_tx, out_rx) = mpsc::channel(depth);
        let (event_tx, event_rx) = mpsc::channel(depth);
        {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.add_hop(key, Hop::new(Counterpart::Local(event_tx), out_tx.clone(), out_rx));
        }
        self.total_streams.fetch_add(1, Ordering::SeqCst);

        if conn.dialled() {
            self.open_hop_substream(&conn, key).await;
        } else {
            self.adopt_parked(key).await;
        }

        Ok((
            ConduitReader::new(event_rx, Some(open_cipher)),
            ConduitWriter::new(stream_id, out_tx, Some(seal)),
        ))
    }

    /// Route lookup, with local DNS fallback for domains that have no
    /// domain route.
    async fn resolve_route(
        &self,
        destination: Destination,
    ) -> Result<(Destination, crate::routing::RouteEntry), OpenFailure> {
        match &destination {
            Destination::Ip(addr) => {
                let entry = self.table.lookup(addr.ip()).ok_or_else(|| {
                    OpenFailure::new(OpenErrorCode::RouteNotFound, format!("no route to {}", addr))
                })?;
                Ok((destination, entry))
            }
            Destination::Domain { name, port } => {
                if let Some(entry) = self.table.lookup_domain(name) {
                    return Ok((destination, entry));
                }
                // No domain route: resolve here and route by IP.
                let ip = local_resolve(name, *port).await.map_err(|e| {
                    OpenFailure::new(OpenErrorCode::DnsFailure, format!("resolving {}: {}", name, e))
                })?;
                let entry = self.table.lookup(ip.ip()).ok_or_else(|| {
                    OpenFailure::new(
                        OpenErrorCode::RouteNotFound,
                        format!("no route to {} ({})", name, ip),
                    )
                })?;
                Ok((Destination::Ip(ip), entry))
            }
            Destination::Forward { key } => {
                let entry = self.table.lookup_forward(key).ok_or_else(|| {
                    OpenFailure::new(
                        OpenErrorCode::RouteNotFound,
                        format!("no forward route '{}'", key),
                    )
                })?;
                Ok((destination, entry))
            }
        }
    }

    /// This agent is both ingress and exit: skip the mesh entirely and
    /// bridge in process.
    async fn open_local(
        &self,
        destination: Destination,
        proto: StreamProto,
    ) -> Result<(ConduitReader, ConduitWriter), OpenFailure> {
        let exit = self
            .exit
            .clone()
            .ok_or_else(|| OpenFailure::new(OpenErrorCode::AccessDenied, "exit disabled"))?;
        let socket = exit
            .connect(&destination, proto)
            .await
            .map_err(|err| OpenFailure::new(err.code, err.message))?;

        let depth = self.frame_queue_depth();
        let (client_event_tx, client_event_rx) = mpsc::channel(depth);
        let (exit_event_tx, exit_event_rx) = mpsc::channel(depth);
        let (client_frame_tx, client_frame_rx) = mpsc::channel(depth);
        let (exit_frame_tx, exit_frame_rx) = mpsc::channel(depth);

        tokio::spawn(pump_frames_to_events(client_frame_rx, exit_event_tx));
        tokio::spawn(pump_frames_to_events(exit_frame_rx, client_event_tx));

        exit.bridge(
            socket,
            ConduitReader::new(exit_event_rx, None),
            ConduitWriter::new(0, exit_frame_tx, None),
        );
        log::debug!("[stream] local exit for {}", destination);
        Ok((
            ConduitReader::new(client_event_rx, None),
            ConduitWriter::new(0, client_frame_tx, None),
        ))
    }

    fn check_limits(&self, inner: &Inner, peer: AgentId) -> Result<(), OpenFailure> {
        if self.total_streams.load(Ordering::SeqCst) >= self.limits.max_streams_total {
            return Err(OpenFailure::new(OpenErrorCode::InternalError, "stream limit reached"));
        }
        if inner.per_peer.get(&peer).copied().unwrap_or(0) >= self.limits.max_streams_per_peer {
            return Err(OpenFailure::new(
                OpenErrorCode::InternalError,
                "per-peer stream limit reached",
            ));
        }
        if inner.pending_count() >= self.limits.max_pending_opens {
            return Err(OpenFailure::new(OpenErrorCode::InternalError, "too many pending opens"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Control-frame handling (transit and exit roles)

    /// Entry point for stream-related frames arriving on a peer control
    /// stream.
    pub async fn handle_control_frame(self: &Arc<Self>, from: AgentId, frame: Frame) {
        match frame {
            Frame::StreamOpen { stream_id, open } => self.handle_open(from, stream_id, open).await,
            Frame::StreamOpenAck { stream_id, ack } => self.handle_ack(from, stream_id, ack).await,
            Frame::StreamOpenErr { stream_id, err } => self.handle_err(from, stream_id, err).await,
            Frame::StreamReset { stream_id, code } => {
                self.handle_reset(from, stream_id, code).await
            }
            Frame::StreamClose { stream_id } => {
                self.teardown_hop((from, stream_id), None).await;
            }
            other => {
                log::debug!(
                    "[stream] unexpected {:?} on control stream from {}",
                    other.frame_type(),
                    from.short()
                );
            }
        }
    }

    async fn reply_err(&self, to: AgentId, stream_id: u64, code: OpenErrorCode, message: &str) {
        let err = StreamOpenErr { code, message: message.to_string() };
        self.peers
            .send_to_peer(&to, &Frame::StreamOpenErr { stream_id, err })
            .await
            .ok();
    }

    async fn handle_open(self: &Arc<Self>, prev: AgentId, in_id: u64, open: StreamOpen) {
        let mut path = open.path.clone();
        // Tolerate senders that include the receiving agent at the head.
        if path.first() == Some(&self.local) {
            path.remove(0);
        }

        if path.is_empty() {
            self.handle_open_as_exit(prev, in_id, open).await;
            return;
        }

        // Transit: relay toward the next hop on the path.
        let next = path[0];
        let Some(conn_next) = self.peers.get(&next) else {
            log::debug!(
                "[stream] open from {} needs unreachable hop {}",
                prev.short(),
                next.short()
            );
            self.reply_err(prev, in_id, OpenErrorCode::RouteNotFound, "next hop unreachable")
                .await;
            return;
        };

        let out_id = conn_next.next_stream_id();
        let limit_failure = {
            let inner = self.inner.lock().expect("engine lock");
            self.check_limits(&inner, next).err()
        };
        if let Some(failure) = limit_failure {
            self.reply_err(prev, in_id, failure.code, &failure.message).await;
            return;
        }
        {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.pending_transit.insert(
                (next, out_id),
                PendingTransit { upstream: (prev, in_id), created_at: Instant::now() },
            );
            inner.pending_transit_rev.insert((prev, in_id), (next, out_id));
        }

        let forwarded = StreamOpen {
            destination: open.destination,
            proto: open.proto,
            path: path[1..].to_vec(),
            public_key: open.public_key,
        };
        log::debug!(
            "[stream] relaying open {}:{} -> {}:{}",
            prev.short(),
            in_id,
            next.short(),
            out_id
        );
        if conn_next
            .send_frame(&Frame::StreamOpen { stream_id: out_id, open: forwarded })
            .await
            .is_err()
        {
            {
                let mut inner = self.inner.lock().expect("engine lock");
                inner.pending_transit.remove(&(next, out_id));
                inner.pending_transit_rev.remove(&(prev, in_id));
            }
            self.reply_err(prev, in_id, OpenErrorCode::RouteNotFound, "next hop send failed")
                .await;
        }
    }

    async fn handle_open_as_exit(self: &Arc<Self>, prev: AgentId, in_id: u64, open: StreamOpen) {
        let Some(exit) = self.exit.clone() else {
            self.reply_err(prev, in_id, OpenErrorCode::AccessDenied, "not an exit").await;
            return;
        };
        let limit_failure = {
            let inner = self.inner.lock().expect("engine lock");
            self.check_limits(&inner, prev).err()
        };
        if let Some(failure) = limit_failure {
            self.reply_err(prev, in_id, failure.code, &failure.message).await;
            return;
        }

        // Dialling the destination can block on DNS and connect timeouts;
        // run it off the control-frame path.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let socket = match exit.connect(&open.destination, open.proto).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::debug!(
                        "[stream] exit dial to {} failed: {:?} {}",
                        open.destination,
                        err.code,
                        err.message
                    );
                    engine.reply_err(prev, in_id, err.code, &err.message).await;
                    return;
                }
            };

            let ephemeral = Ephemeral::generate();
            let public_key = ephemeral.public_key_bytes();
            let (seal, open_cipher) = match ephemeral.into_exit_session(&open.public_key) {
                Ok(pair) => pair,
                Err(e) => {
                    engine
                        .reply_err(prev, in_id, OpenErrorCode::InternalError, &e.to_string())
                        .await;
                    return;
                }
            };

            let depth = engine.frame_queue_depth();
            let (out_tx, out_rx) = mpsc::channel(depth);
            let (event_tx, event_rx) = mpsc::channel(depth);
            let key = (prev, in_id);
            {
                let mut inner = engine.inner.lock().expect("engine lock");
                inner.add_hop(key, Hop::new(Counterpart::Local(event_tx), out_tx.clone(), out_rx));
            }
            engine.total_streams.fetch_add(1, Ordering::SeqCst);

            let ack = StreamOpenAck { public_key };
            if engine
                .peers
                .send_to_peer(&prev, &Frame::StreamOpenAck { stream_id: in_id, ack })
                .await
                .is_err()
            {
                engine.teardown_hop(key, None).await;
                return;
            }
            if let Some(conn) = engine.peers.get(&prev) {
                if conn.dialled() {
                    engine.open_hop_substream(&conn, key).await;
                } else {
                    engine.adopt_parked(key).await;
                }
            }

            log::debug!("[stream] exit accepted {} from {}", open.destination, prev.short());
            exit.bridge(
                socket,
                ConduitReader::new(event_rx, Some(open_cipher)),
                ConduitWriter::new(in_id, out_tx, Some(seal)),
            );
        });
    }

    async fn handle_ack(self: &Arc<Self>, from: AgentId, stream_id: u64, ack: StreamOpenAck) {
        // Ingress side of a pending open?
        let pending = {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.pending_local.remove(&(from, stream_id))
        };
        if let Some(pending) = pending {
            pending.responder.send(Ok(ack)).ok();
            return;
        }

        // Transit side: wire the two hops together and pass the ACK on.
        let upstream = {
            let mut inner = self.inner.lock().expect("engine lock");
            let Some(pending) = inner.pending_transit.remove(&(from, stream_id)) else {
                drop(inner);
                log::debug!(
                    "[stream] stray ACK for {}:{} from {}",
                    from.short(),
                    stream_id,
                    from.short()
                );
                return;
            };
            inner.pending_transit_rev.remove(&pending.upstream);

            let depth = self.frame_queue_depth();
            let down_key = (from, stream_id);
            let up_key = pending.upstream;
            let (down_tx, down_rx) = mpsc::channel(depth);
            let (up_tx, up_rx) = mpsc::channel(depth);
            inner.add_hop(down_key, Hop::new(Counterpart::Peer(up_key), down_tx, down_rx));
            inner.add_hop(up_key, Hop::new(Counterpart::Peer(down_key), up_tx, up_rx));
            up_key
        };
        self.total_streams.fetch_add(1, Ordering::SeqCst);

        let (up_peer, up_id) = upstream;
        if self
            .peers
            .send_to_peer(&up_peer, &Frame::StreamOpenAck { stream_id: up_id, ack })
            .await
            .is_err()
        {
            self.teardown_hop(upstream, Some(ResetCode::Timeout)).await;
            return;
        }

        // The dialler of each link opens the data substream for this stream.
        for key in [(from, stream_id), upstream] {
            if let Some(conn) = self.peers.get(&key.0) {
                if conn.dialled() {
                    self.open_hop_substream(&conn, key).await;
                } else {
                    self.adopt_parked(key).await;
                }
            }
        }
    }

    async fn handle_err(self: &Arc<Self>, from: AgentId, stream_id: u64, err: StreamOpenErr) {
        let pending = {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.pending_local.remove(&(from, stream_id))
        };
        if let Some(pending) = pending {
            pending.responder.send(Err(err)).ok();
            return;
        }

        let upstream = {
            let mut inner = self.inner.lock().expect("engine lock");
            let pending = inner.pending_transit.remove(&(from, stream_id));
            if let Some(pending) = &pending {
                inner.pending_transit_rev.remove(&pending.upstream);
            }
            pending.map(|p| p.upstream)
        };
        if let Some((up_peer, up_id)) = upstream {
            self.peers
                .send_to_peer(&up_peer, &Frame::StreamOpenErr { stream_id: up_id, err })
                .await
                .ok();
        }
    }

    async fn handle_reset(self: &Arc<Self>, from: AgentId, stream_id: u64, code: ResetCode) {
        // A pending ingress open the far side abandoned.
        let pending = {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.pending_local.remove(&(from, stream_id))
        };
        if let Some(pending) = pending {
            let code = match code {
                ResetCode::Timeout => OpenErrorCode::ConnectionTimeout,
                _ => OpenErrorCode::InternalError,
            };
            pending
                .responder
                .send(Err(StreamOpenErr { code, message: "reset during open".to_string() }))
                .ok();
            return;
        }

        // A pending transit open, reset from either side.
        let (downstream, upstream) = {
            let mut inner = self.inner.lock().expect("engine lock");
            if let Some(pending) = inner.pending_transit.remove(&(from, stream_id)) {
                inner.pending_transit_rev.remove(&pending.upstream);
                (None, Some(pending.upstream))
            } else if let Some(down) = inner.pending_transit_rev.remove(&(from, stream_id)) {
                inner.pending_transit.remove(&down);
                (Some(down), None)
            } else {
                (None, None)
            }
        };
        if let Some((up_peer, up_id)) = upstream {
            self.reply_err(up_peer, up_id, OpenErrorCode::ConnectionTimeout, "reset by downstream")
                .await;
            return;
        }
        if let Some((down_peer, down_id)) = downstream {
            self.peers
                .send_to_peer(&down_peer, &Frame::StreamReset { stream_id: down_id, code })
                .await
                .ok();
            return;
        }

        // An established hop.
        self.teardown_hop((from, stream_id), Some(code)).await;
    }

    // -----------------------------------------------------------------
    // Substream plumbing

    /// Open the data substream for `key` on a link this agent dialled, send
    /// the binding frame, and start the pump tasks.
    async fn open_hop_substream(self: &Arc<Self>, conn: &Arc<PeerConnection>, key: HopKey) {
        let mut substream = match conn.open_substream().await {
            Ok(substream) => substream,
            Err(e) => {
                log::debug!("[stream] substream open to {} failed: {}", key.0.short(), e);
                self.teardown_hop(key, Some(ResetCode::Timeout)).await;
                return;
            }
        };
        // The first frame on the wire binds the substream to the stream id.
        let binding = Frame::StreamData {
            stream_id: key.1,
            fin_write: false,
            fin_read: false,
            payload: bytes::Bytes::new(),
        };
        if wire::write_frame(&mut substream, &binding).await.is_err() {
            self.teardown_hop(key, Some(ResetCode::Timeout)).await;
            return;
        }
        self.start_hop_tasks(key, substream, None).await;
    }

    /// Attach a substream the remote opened; `first` is its binding frame.
    /// A substream for a not-yet-recorded stream is parked: its ACK may
    /// still be in flight on another task.
    pub async fn attach_substream(self: &Arc<Self>, peer: AgentId, stream: BoxStream, first: Frame) {
        let key = (peer, first.stream_id());
        let ready = {
            let mut inner = self.inner.lock().expect("engine lock");
            if inner.hops.contains_key(&key) {
                Some((stream, first))
            } else {
                log::debug!(
                    "[stream] parking early substream from {} for stream {}",
                    peer.short(),
                    key.1
                );
                inner
                    .parked
                    .insert(key, ParkedSubstream { stream, first, parked_at: Instant::now() });
                None
            }
        };
        if let Some((stream, first)) = ready {
            self.start_hop_tasks(key, stream, Some(first)).await;
        }
    }

    /// Start the pump tasks for a parked substream once its hop record
    /// exists.
    async fn adopt_parked(self: &Arc<Self>, key: HopKey) {
        let parked = self.inner.lock().expect("engine lock").parked.remove(&key);
        if let Some(parked) = parked {
            self.start_hop_tasks(key, parked.stream, Some(parked.first)).await;
        }
    }

    async fn start_hop_tasks(self: &Arc<Self>, key: HopKey, stream: BoxStream, first: Option<Frame>) {
        let out_rx = {
            let mut inner = self.inner.lock().expect("engine lock");
            match inner.hops.get_mut(&key) {
                Some(hop) => hop.out_rx.take(),
                None => None,
            }
        };
        let Some(mut out_rx) = out_rx else {
            log::debug!("[stream] duplicate substream for {}:{}", key.0.short(), key.1);
            return;
        };

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // Writer: drain queued frames onto the substream.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let last = matches!(frame, Frame::StreamClose { .. } | Frame::StreamReset { .. });
                if wire::write_frame(&mut write_half, &frame).await.is_err() {
                    engine.teardown_hop(key, Some(ResetCode::Timeout)).await;
                    return;
                }
                {
                    let mut inner = engine.inner.lock().expect("engine lock");
                    if let Some(hop) = inner.hops.get_mut(&key) {
                        hop.frames_out += 1;
                        if let Frame::StreamData { payload, .. } = &frame {
                            hop.bytes_out += payload.len() as u64;
                        }
                    }
                }
                if last {
                    // Covers locally-originated closes; forwarded ones were
                    // already removed in dispatch and this is a no-op.
                    engine.remove_stream(key).await;
                    return;
                }
            }
        });

        // Reader: dispatch inbound frames to the counterpart. Not reading
        // is what propagates backpressure to the remote writer.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(first) = first {
                if !engine.dispatch(key, first).await {
                    return;
                }
            }
            loop {
                match wire::read_frame(&mut read_half).await {
                    Ok((frame, _)) => {
                        if !engine.dispatch(key, frame).await {
                            return;
                        }
                    }
                    Err(_) => {
                        // Substream gone; if the hop still exists this is
                        // an abnormal break.
                        let live =
                            engine.inner.lock().expect("engine lock").hops.contains_key(&key);
                        if live {
                            engine.teardown_hop(key, Some(ResetCode::Timeout)).await;
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Route one inbound frame from hop `key` to its counterpart. Returns
    /// false when the reader should stop.
    async fn dispatch(self: &Arc<Self>, key: HopKey, frame: Frame) -> bool {
        enum Target {
            Peer { out_tx: mpsc::Sender<Frame>, id: u64 },
            Local(mpsc::Sender<ConduitEvent>),
        }
        let target = {
            let mut inner = self.inner.lock().expect("engine lock");
            let Some(hop) = inner.hops.get_mut(&key) else { return false };
            hop.frames_in += 1;
            if let Frame::StreamData { payload, .. } = &frame {
                hop.bytes_in += payload.len() as u64;
            }
            let counterpart = match &hop.counterpart {
                Counterpart::Peer(other) => Ok(*other),
                Counterpart::Local(tx) => Err(tx.clone()),
            };
            match counterpart {
                Ok(other) => inner.hops.get(&other).map(|other_hop| Target::Peer {
                    out_tx: other_hop.out_tx.clone(),
                    id: other.1,
                }),
                Err(tx) => Some(Target::Local(tx)),
            }
        };
        let Some(target) = target else {
            // Counterpart already gone.
            self.teardown_hop(key, Some(ResetCode::InternalError)).await;
            return false;
        };

        match frame {
            Frame::StreamData { payload, fin_write, fin_read, .. } => match target {
                Target::Peer { out_tx, id } => {
                    let forwarded =
                        Frame::StreamData { stream_id: id, fin_write, fin_read, payload };
                    if out_tx.send(forwarded).await.is_err() {
                        self.teardown_hop(key, Some(ResetCode::InternalError)).await;
                        return false;
                    }
                    true
                }
                Target::Local(tx) => {
                    if payload.is_empty() && !fin_write && !fin_read {
                        // Binding frame.
                        return true;
                    }
                    if tx.send(ConduitEvent::Data { payload, fin_write, fin_read }).await.is_err() {
                        self.teardown_hop(key, Some(ResetCode::Cancelled)).await;
                        return false;
                    }
                    true
                }
            },
            Frame::StreamClose { .. } => {
                match target {
                    Target::Peer { out_tx, id } => {
                        out_tx.send(Frame::StreamClose { stream_id: id }).await.ok();
                    }
                    Target::Local(tx) => {
                        tx.send(ConduitEvent::Closed).await.ok();
                    }
                }
                self.remove_stream(key).await;
                false
            }
            Frame::StreamReset { code, .. } => {
                match target {
                    Target::Peer { out_tx, id } => {
                        out_tx.send(Frame::StreamReset { stream_id: id, code }).await.ok();
                    }
                    Target::Local(tx) => {
                        tx.send(ConduitEvent::Reset(code)).await.ok();
                    }
                }
                self.remove_stream(key).await;
                false
            }
            other => {
                log::debug!(
                    "[stream] protocol error: {:?} on data substream {}:{}",
                    other.frame_type(),
                    key.0.short(),
                    key.1
                );
                self.teardown_hop(key, Some(ResetCode::ProtocolError)).await;
                false
            }
        }
    }

    /// Remove both records of a stream without notifying anyone (the close
    /// or reset already travelled through).
    async fn remove_stream(&self, key: HopKey) {
        let mut inner = self.inner.lock().expect("engine lock");
        let other = match inner.hops.get(&key) {
            Some(hop) => match &hop.counterpart {
                Counterpart::Peer(other) => Some(*other),
                Counterpart::Local(_) => None,
            },
            None => return,
        };
        inner.drop_hop(&key);
        if let Some(other) = other {
            inner.drop_hop(&other);
        }
        drop(inner);
        self.total_streams.fetch_sub(1, Ordering::SeqCst);
    }

    /// Tear down a hop, notifying its counterpart with a reset when a code
    /// is given.
    async fn teardown_hop(&self, key: HopKey, code: Option<ResetCode>) {
        enum Notify {
            Peer(mpsc::Sender<Frame>, u64),
            Local(mpsc::Sender<ConduitEvent>),
            Nobody,
        }
        let notify = {
            let mut inner = self.inner.lock().expect("engine lock");
            let Some(hop) = inner.drop_hop(&key) else { return };
            match hop.counterpart {
                Counterpart::Peer(other) => {
                    let tx = inner.hops.get(&other).map(|other_hop| other_hop.out_tx.clone());
                    inner.drop_hop(&other);
                    match tx {
                        Some(tx) => Notify::Peer(tx, other.1),
                        None => Notify::Nobody,
                    }
                }
                Counterpart::Local(tx) => Notify::Local(tx),
            }
        };
        self.total_streams.fetch_sub(1, Ordering::SeqCst);

        let Some(code) = code else { return };
        match notify {
            Notify::Peer(out_tx, other_id) => {
                out_tx.send(Frame::StreamReset { stream_id: other_id, code }).await.ok();
            }
            Notify::Local(event_tx) => {
                event_tx.send(ConduitEvent::Reset(code)).await.ok();
            }
            Notify::Nobody => {}
        }
    }

    // -----------------------------------------------------------------
    // Failure sweeps

    /// A peer connection died: reset every stream and pending open through
    /// it.
    pub async fn handle_peer_disconnected(self: &Arc<Self>, peer: AgentId) {
        let (hop_keys, local_pendings, transit_up, transit_down) = {
            let mut inner = self.inner.lock().expect("engine lock");
            let hop_keys: Vec<HopKey> =
                inner.hops.keys().filter(|(p, _)| *p == peer).copied().collect();

            let local_keys: Vec<HopKey> =
                inner.pending_local.keys().filter(|(p, _)| *p == peer).copied().collect();
            let local_pendings: Vec<PendingLocal> = local_keys
                .iter()
                .filter_map(|key| inner.pending_local.remove(key))
                .collect();

            let mut transit_up = Vec::new();
            let mut transit_down = Vec::new();
            let down_keys: Vec<HopKey> =
                inner.pending_transit.keys().filter(|(p, _)| *p == peer).copied().collect();
            for down in down_keys {
                if let Some(pending) = inner.pending_transit.remove(&down) {
                    inner.pending_transit_rev.remove(&pending.upstream);
                    transit_up.push(pending.upstream);
                }
            }
            let up_keys: Vec<HopKey> =
                inner.pending_transit_rev.keys().filter(|(p, _)| *p == peer).copied().collect();
            for up in up_keys {
                if let Some(down) = inner.pending_transit_rev.remove(&up) {
                    inner.pending_transit.remove(&down);
                    transit_down.push(down);
                }
            }
            (hop_keys, local_pendings, transit_up, transit_down)
        };

        if !hop_keys.is_empty() {
            log::info!(
                "[stream] peer {} lost, resetting {} streams",
                peer.short(),
                hop_keys.len()
            );
        }
        for key in hop_keys {
            self.teardown_hop(key, Some(ResetCode::Timeout)).await;
        }
        for pending in local_pendings {
            pending
                .responder
                .send(Err(StreamOpenErr {
                    code: OpenErrorCode::ConnectionTimeout,
                    message: "next hop disconnected".to_string(),
                }))
                .ok();
        }
        for (up_peer, up_id) in transit_up {
            self.reply_err(up_peer, up_id, OpenErrorCode::ConnectionTimeout, "path peer lost")
                .await;
        }
        for (down_peer, down_id) in transit_down {
            self.peers
                .send_to_peer(
                    &down_peer,
                    &Frame::StreamReset { stream_id: down_id, code: ResetCode::Timeout },
                )
                .await
                .ok();
        }
    }

    /// Expire transit opens and parked substreams that never completed;
    /// run periodically.
    pub async fn sweep_pending(self: &Arc<Self>) {
        let timeout = self.limits.stream_open_timeout;
        let expired: Vec<(HopKey, HopKey)> = {
            let mut inner = self.inner.lock().expect("engine lock");
            inner.parked.retain(|_, parked| parked.parked_at.elapsed() <= timeout);
            let keys: Vec<HopKey> = inner
                .pending_transit
                .iter()
                .filter(|(_, pending)| pending.created_at.elapsed() > timeout)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|down| {
                    inner.pending_transit.remove(&down).map(|pending| {
                        inner.pending_transit_rev.remove(&pending.upstream);
                        (down, pending.upstream)
                    })
                })
                .collect()
        };
        for (down, up) in expired {
            log::debug!(
                "[stream] pending open {}:{} expired",
                down.0.short(),
                down.1
            );
            self.reply_err(up.0, up.1, OpenErrorCode::ConnectionTimeout, "open timed out").await;
            self.peers
                .send_to_peer(
                    &down.0,
                    &Frame::StreamReset { stream_id: down.1, code: ResetCode::Timeout },
                )
                .await
                .ok();
        }
    }
}

/// Frame-to-event pump for in-process (ingress == exit) streams.
async fn pump_frames_to_events(mut frames: mpsc::Receiver<Frame>, events: mpsc::Sender<ConduitEvent>) {
    while let Some(frame) = frames.recv().await {
        let event = match frame {
            Frame::StreamData { payload, fin_write, fin_read, .. } => {
                ConduitEvent::Data { payload, fin_write, fin_read }
            }
            Frame::StreamClose { .. } => ConduitEvent::Closed,
            Frame::StreamReset { code, .. } => ConduitEvent::Reset(code),
            _ => continue,
        };
        let last = !matches!(event, ConduitEvent::Data { .. });
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn local_resolve(name: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((name, port)).await?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
    })
}
