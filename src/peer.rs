//! Peer connections
//!
//! One `PeerConnection` wraps one transport link: it performs the two-message
//! handshake on the control stream, then runs a read loop (sole consumer of
//! inbound control frames), a keepalive loop, and an accept loop for data
//! substreams. Frame writes are serialised by a per-connection lock; a write
//! error closes the link rather than trying to salvage a possibly torn
//! stream.
//!
//! The connection knows nothing about routing or streams. It emits
//! `PeerEvent`s onto a channel the agent core consumes, which keeps this
//! layer independent of the higher ones and easy to drive from tests.

use crate::config::ConnectionConfig;
use crate::identity::AgentId;
use crate::transport::{BoxLink, BoxStream, Link};
use crate::wire::{self, Frame, PeerHello, PROTOCOL_VERSION};
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

/// Connection lifecycle for a configured peer, tracked by the dial loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
}

/// What this agent announces about itself during handshakes.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: AgentId,
    pub display_name: String,
    pub capabilities: Vec<String>,
}

impl LocalIdentity {
    fn hello(&self) -> PeerHello {
        PeerHello {
            version: PROTOCOL_VERSION,
            agent_id: self.id,
            timestamp_nanos: now_nanos(),
            capabilities: self.capabilities.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Events a peer connection reports to the agent core.
pub enum PeerEvent {
    /// A control frame arrived (keepalives are consumed internally).
    Frame { peer: AgentId, frame: Frame },
    /// The remote opened a data substream; `first` is its binding frame.
    Substream { peer: AgentId, stream: BoxStream, first: Frame },
    /// The link died or was closed.
    Disconnected { peer: AgentId },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Frame { peer, frame } => f
                .debug_struct("Frame")
                .field("peer", &peer.short())
                .field("frame", &frame.frame_type())
                .finish(),
            PeerEvent::Substream { peer, first, .. } => f
                .debug_struct("Substream")
                .field("peer", &peer.short())
                .field("stream_id", &first.stream_id())
                .finish(),
            PeerEvent::Disconnected { peer } => {
                f.debug_struct("Disconnected").field("peer", &peer.short()).finish()
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: AgentId, actual: AgentId },
    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),
    #[error("handshake timed out")]
    Timeout,
    #[error("transport: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("peer not connected")]
    NotConnected,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Cumulative frame and byte totals for one connection's control stream
/// (wire sizes, both directions).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// An established, post-handshake connection to one peer.
pub struct PeerConnection {
    remote: AgentId,
    remote_hello: PeerHello,
    dialled: bool,
    link: Arc<dyn Link>,
    writer: Arc<AsyncMutex<WriteHalf<BoxStream>>>,
    last_activity: Arc<Mutex<Instant>>,
    rtt: Mutex<Option<Duration>>,
    /// Virtual-stream id allocator: odd ids on the dialling side, even on
    /// the accepting side, 0 reserved for the control stream.
    next_stream_id: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<Notify>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerConnection {
    /// Handshake over a fresh link and start the connection's tasks. On any
    /// handshake failure the link is closed and never retried; persistent
    /// peers go back through the reconnector instead.
    pub async fn establish(
        link: BoxLink,
        dialled: bool,
        expected: Option<AgentId>,
        local: &LocalIdentity,
        config: &ConnectionConfig,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<Self>, HandshakeError> {
        let link: Arc<dyn Link> = Arc::from(link);

        let result = tokio::time::timeout(config.handshake_timeout, async {
            if dialled {
                let mut control = link.open_stream().await?;
                let (remote_hello, rtt) = handshake_dial(&mut control, local, expected).await?;
                Ok::<_, HandshakeError>((control, remote_hello, Some(rtt)))
            } else {
                let mut control = link.accept_stream().await?;
                let remote_hello = handshake_accept(&mut control, local).await?;
                Ok((control, remote_hello, None))
            }
        })
        .await;

        let (control, remote_hello, rtt) = match result {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                link.close().await;
                return Err(e);
            }
            Err(_) => {
                link.close().await;
                return Err(HandshakeError::Timeout);
            }
        };

        let remote = remote_hello.agent_id;
        log::info!(
            "[peer] handshake complete with {} ({}){}",
            remote.short(),
            if remote_hello.display_name.is_empty() { "unnamed" } else { &remote_hello.display_name },
            rtt.map(|d| format!(", rtt {:?}", d)).unwrap_or_default(),
        );

        let (read_half, write_half) = tokio::io::split(control);
        let conn = Arc::new(Self {
            remote,
            remote_hello,
            dialled,
            link,
            writer: Arc::new(AsyncMutex::new(write_half)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            rtt: Mutex::new(rtt),
            next_stream_id: AtomicU64::new(if dialled { 1 } else { 2 }),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            closed_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            events,
        });

        conn.spawn_read_loop(read_half);
        conn.spawn_keepalive(config.clone());
        conn.spawn_substream_accept();
        Ok(conn)
    }

    pub fn id(&self) -> AgentId {
        self.remote
    }

    pub fn dialled(&self) -> bool {
        self.dialled
    }

    pub fn display_name(&self) -> &str {
        &self.remote_hello.display_name
    }

    pub fn capabilities(&self) -> &[String] {
        &self.remote_hello.capabilities
    }

    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock().expect("rtt lock")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Allocate the next virtual-stream id for this connection. Collisions
    /// with the remote side are impossible by parity.
    pub fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(2, Ordering::SeqCst)
    }

    /// Frame/byte totals exchanged on this connection so far.
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Write one frame on the control stream. Serialised by the writer lock;
    /// an error tears the connection down.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        match wire::write_frame(&mut *writer, frame).await {
            Ok(wire_len) => {
                drop(writer);
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(wire_len as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                drop(writer);
                log::debug!("[peer] write to {} failed: {}", self.remote.short(), e);
                self.close().await;
                Err(SendError::Io(e))
            }
        }
    }

    /// Open a data substream toward this peer. Only called on the side that
    /// dialled the link (the substream-opening convention every transport
    /// supports).
    pub async fn open_substream(&self) -> anyhow::Result<BoxStream> {
        if self.is_closed() {
            anyhow::bail!("peer not connected");
        }
        self.link.open_stream().await
    }

    /// Resolve once the connection is closed, however that happens.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Close the link, cancel the connection's tasks, and emit a single
    /// `Disconnected` event.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_notify.notify_waiters();
        log::info!("[peer] connection to {} closed", self.remote.short());
        self.events
            .send(PeerEvent::Disconnected { peer: self.remote })
            .await
            .ok();
        // The link close may need a lock one of our own tasks is holding
        // (the h2 accept loop), so it runs detached after the aborts.
        let link = Arc::clone(&self.link);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        tokio::spawn(async move {
            for task in tasks {
                task.abort();
            }
            link.close().await;
        });
    }

    fn touch(last_activity: &Mutex<Instant>) {
        *last_activity.lock().expect("activity lock") = Instant::now();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.remote.short())
            .field("display_name", &self.remote_hello.display_name)
            .field("dialled", &self.dialled)
            .field("rtt", &self.rtt())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PeerConnection {

    fn spawn_read_loop(self: &Arc<Self>, mut read_half: ReadHalf<BoxStream>) {
        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let (frame, wire_len) = match wire::read_frame(&mut read_half).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        if !conn.is_closed() {
                            log::debug!("[peer] read from {} failed: {}", conn.remote.short(), e);
                        }
                        conn.close().await;
                        return;
                    }
                };
                Self::touch(&conn.last_activity);
                conn.frames_received.fetch_add(1, Ordering::Relaxed);
                conn.bytes_received.fetch_add(wire_len as u64, Ordering::Relaxed);

                match frame {
                    Frame::Keepalive { timestamp_nanos } => {
                        let ack = Frame::KeepaliveAck { timestamp_nanos };
                        if conn.send_frame(&ack).await.is_err() {
                            return;
                        }
                    }
                    Frame::KeepaliveAck { timestamp_nanos } => {
                        let rtt_nanos = now_nanos().saturating_sub(timestamp_nanos);
                        *conn.rtt.lock().expect("rtt lock") =
                            Some(Duration::from_nanos(rtt_nanos));
                    }
                    other => {
                        let event = PeerEvent::Frame { peer: conn.remote, frame: other };
                        if conn.events.send(event).await.is_err() {
                            conn.close().await;
                            return;
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(handle);
    }

    fn spawn_keepalive(self: &Arc<Self>, config: ConnectionConfig) {
        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                // Jitter each tick so peers do not synchronise their probes.
                let jitter = if config.keepalive_jitter > 0.0 {
                    rand::thread_rng().gen_range(0.0..config.keepalive_jitter)
                } else {
                    0.0
                };
                tokio::time::sleep(config.keepalive_interval.mul_f64(1.0 + jitter)).await;
                if conn.is_closed() {
                    return;
                }
                let frame = Frame::Keepalive { timestamp_nanos: now_nanos() };
                if conn.send_frame(&frame).await.is_err() {
                    return;
                }
                tokio::time::sleep(config.keepalive_timeout).await;
                let idle = conn.last_activity.lock().expect("activity lock").elapsed();
                if idle > config.keepalive_interval + config.keepalive_timeout {
                    log::warn!(
                        "[peer] {} unresponsive for {:?}, declaring link dead",
                        conn.remote.short(),
                        idle
                    );
                    conn.close().await;
                    return;
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(handle);
    }

    fn spawn_substream_accept(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let substream = match conn.link.accept_stream().await {
                    Ok(substream) => substream,
                    Err(e) => {
                        if !conn.is_closed() {
                            log::debug!(
                                "[peer] substream accept from {} failed: {}",
                                conn.remote.short(),
                                e
                            );
                            conn.close().await;
                        }
                        return;
                    }
                };
                // The first frame binds the substream to a virtual stream;
                // read it off the accept loop so a slow opener cannot stall
                // other substreams.
                let peer = conn.remote;
                let events = conn.events.clone();
                tokio::spawn(async move {
                    let mut substream = substream;
                    let first = tokio::time::timeout(
                        Duration::from_secs(10),
                        wire::read_frame(&mut substream),
                    )
                    .await;
                    match first {
                        Ok(Ok((first, _))) => {
                            events
                                .send(PeerEvent::Substream { peer, stream: substream, first })
                                .await
                                .ok();
                        }
                        Ok(Err(e)) => {
                            log::debug!("[peer] substream from {} died unbound: {}", peer.short(), e);
                        }
                        Err(_) => {
                            log::debug!("[peer] substream from {} never bound", peer.short());
                        }
                    }
                });
            }
        });
        self.tasks.lock().expect("tasks lock").push(handle);
    }
}

async fn handshake_dial(
    control: &mut BoxStream,
    local: &LocalIdentity,
    expected: Option<AgentId>,
) -> Result<(PeerHello, Duration), HandshakeError> {
    wire::write_frame(control, &Frame::PeerHello(local.hello())).await?;

    let (frame, _) = wire::read_frame(control).await?;
    let ack = match frame {
        Frame::PeerHelloAck(ack) => ack,
        other => {
            return Err(HandshakeError::UnexpectedFrame(frame_name(&other)));
        }
    };
    if ack.version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch { ours: PROTOCOL_VERSION, theirs: ack.version });
    }
    if let Some(expected) = expected {
        if ack.agent_id != expected {
            return Err(HandshakeError::PeerIdMismatch { expected, actual: ack.agent_id });
        }
    }
    // The ACK echoes our timestamp, which is the RTT measurement.
    let rtt = Duration::from_nanos(now_nanos().saturating_sub(ack.timestamp_nanos));
    Ok((ack, rtt))
}

async fn handshake_accept(
    control: &mut BoxStream,
    local: &LocalIdentity,
) -> Result<PeerHello, HandshakeError> {
    let (frame, _) = wire::read_frame(control).await?;
    let hello = match frame {
        Frame::PeerHello(hello) => hello,
        other => return Err(HandshakeError::UnexpectedFrame(frame_name(&other))),
    };
    if hello.version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: hello.version,
        });
    }

    let mut ack = local.hello();
    // Echo the dialler's timestamp so it can compute RTT.
    ack.timestamp_nanos = hello.timestamp_nanos;
    wire::write_frame(control, &Frame::PeerHelloAck(ack)).await?;
    Ok(hello)
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame.frame_type() {
        crate::wire::FrameType::PeerHello => "PEER_HELLO",
        crate::wire::FrameType::PeerHelloAck => "PEER_HELLO_ACK",
        crate::wire::FrameType::Keepalive => "KEEPALIVE",
        crate::wire::FrameType::KeepaliveAck => "KEEPALIVE_ACK",
        crate::wire::FrameType::RouteAdvertise => "ROUTE_ADVERTISE",
        crate::wire::FrameType::RouteWithdraw => "ROUTE_WITHDRAW",
        crate::wire::FrameType::NodeInfoAdvertise => "NODE_INFO_ADVERTISE",
        crate::wire::FrameType::StreamOpen => "STREAM_OPEN",
        crate::wire::FrameType::StreamOpenAck => "STREAM_OPEN_ACK",
        crate::wire::FrameType::StreamOpenErr => "STREAM_OPEN_ERR",
        crate::wire::FrameType::StreamData => "STREAM_DATA",
        crate::wire::FrameType::StreamClose => "STREAM_CLOSE",
        crate::wire::FrameType::StreamReset => "STREAM_RESET",
    }
}

/// All currently connected peers, keyed by remote agent id. The flooder and
/// stream engine reach peers exclusively through this registry, so nothing
/// holds a connection alive past its close.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<AgentId, Arc<PeerConnection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh connection, returning any previous connection for the
    /// same peer (the caller closes it).
    pub fn insert(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        self.peers.write().expect("peers lock").insert(conn.id(), conn)
    }

    pub fn remove(&self, id: &AgentId) -> Option<Arc<PeerConnection>> {
        self.peers.write().expect("peers lock").remove(id)
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<PeerConnection>> {
        self.peers.read().expect("peers lock").get(id).cloned()
    }

    pub fn connected_peer_ids(&self) -> Vec<AgentId> {
        self.peers.read().expect("peers lock").keys().copied().collect()
    }

    /// Snapshot of every live connection, for status dumps.
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().expect("peers lock").values().cloned().collect()
    }

    /// Frame/byte totals summed over every connected peer.
    pub fn transfer_totals(&self) -> TransferStats {
        let mut totals = TransferStats::default();
        for conn in self.snapshot() {
            let stats = conn.stats();
            totals.frames_sent += stats.frames_sent;
            totals.frames_received += stats.frames_received;
            totals.bytes_sent += stats.bytes_sent;
            totals.bytes_received += stats.bytes_received;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peers lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send one frame to one peer; `NotConnected` when absent.
    pub async fn send_to_peer(&self, id: &AgentId, frame: &Frame) -> Result<(), SendError> {
        let conn = self.get(id).ok_or(SendError::NotConnected)?;
        conn.send_frame(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn identity(byte: u8, name: &str) -> LocalIdentity {
        LocalIdentity {
            id: AgentId::from_bytes([byte; 16]),
            display_name: name.to_string(),
            capabilities: vec!["transit".to_string()],
        }
    }

    fn pipe() -> (BoxStream, BoxStream) {
        let (a, b): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let (mut dial_side, mut accept_side) = pipe();
        let dialler = identity(1, "dialler");
        let acceptor = identity(2, "acceptor");

        let accept_task = tokio::spawn(async move {
            handshake_accept(&mut accept_side, &identity(2, "acceptor")).await
        });
        let (remote, _rtt) = handshake_dial(&mut dial_side, &dialler, None).await.unwrap();
        let seen_by_acceptor = accept_task.await.unwrap().unwrap();

        assert_eq!(remote.agent_id, acceptor.id);
        assert_eq!(remote.display_name, "acceptor");
        assert_eq!(seen_by_acceptor.agent_id, dialler.id);
        assert_eq!(seen_by_acceptor.capabilities, vec!["transit".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_peer_id() {
        let (mut dial_side, mut accept_side) = pipe();
        let expected = AgentId::from_bytes([9; 16]);

        tokio::spawn(async move {
            handshake_accept(&mut accept_side, &identity(2, "acceptor")).await.ok();
        });
        let err = handshake_dial(&mut dial_side, &identity(1, "dialler"), Some(expected))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::PeerIdMismatch { .. }));
    }

    #[tokio::test]
    async fn test_handshake_rejects_version_mismatch() {
        let (mut dial_side, mut accept_side) = pipe();

        tokio::spawn(async move {
            // A hand-built hello with a bad version.
            let mut hello = identity(3, "old").hello();
            hello.version = PROTOCOL_VERSION + 1;
            wire::write_frame(&mut accept_side, &Frame::PeerHello(hello)).await.unwrap();
        });
        let err = handshake_accept(&mut dial_side, &identity(2, "acceptor")).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_handshake_rejects_unexpected_frame() {
        let (mut dial_side, mut accept_side) = pipe();

        tokio::spawn(async move {
            wire::write_frame(&mut accept_side, &Frame::Keepalive { timestamp_nanos: 1 })
                .await
                .unwrap();
        });
        let err = handshake_accept(&mut dial_side, &identity(2, "acceptor")).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedFrame("KEEPALIVE")));
    }

    #[tokio::test]
    async fn test_acceptor_echoes_dialler_timestamp() {
        let (mut dial_side, mut accept_side) = pipe();

        let accept_task = tokio::spawn(async move {
            handshake_accept(&mut accept_side, &identity(2, "acceptor")).await
        });

        let hello = identity(1, "dialler").hello();
        let sent = hello.timestamp_nanos;
        wire::write_frame(&mut dial_side, &Frame::PeerHello(hello)).await.unwrap();
        let (frame, _) = wire::read_frame(&mut dial_side).await.unwrap();
        let ack = match frame {
            Frame::PeerHelloAck(ack) => ack,
            other => panic!("expected ACK, got {:?}", other),
        };
        assert_eq!(ack.timestamp_nanos, sent);
        accept_task.await.unwrap().unwrap();
    }

    #[test]
    fn test_registry_send_to_missing_peer() {
        let registry = PeerRegistry::new();
        assert!(registry.connected_peer_ids().is_empty());
        let err = tokio_test::block_on(
            registry.send_to_peer(&AgentId::from_bytes([1; 16]), &Frame::StreamClose { stream_id: 1 }),
        )
        .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }
}
