//! Agent core
//!
//! Owns the registries and wires the layers together: transport listeners
//! and dial loops feed peer connections, the peer event channel feeds the
//! flooder and the stream engine, and the background tasks (periodic
//! announce, route reaper, seen-cache sweep, keepalive-adjacent sweeps) all
//! hang off one shutdown signal the agent awaits on the way out.

use crate::config::{Config, PeerConfig};
use crate::exit::ExitAdapter;
use crate::identity::AgentId;
use crate::peer::{LocalIdentity, PeerConnection, PeerEvent, PeerRegistry, PeerState};
use crate::reconnect::{Backoff, Reconnector};
use crate::routing::{Flooder, RouteKey, RoutingTable};
use crate::socks5::Socks5Server;
use crate::stream::engine::ExitConnector;
use crate::stream::StreamEngine;
use crate::transport::{self, BoxLink};
use crate::wire::Frame;
use crate::MeshError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How often the maintenance sweeps run (seen caches, route reaper, pending
/// opens).
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One running mesh agent.
pub struct Agent {
    config: Config,
    identity: LocalIdentity,
    peers: Arc<PeerRegistry>,
    table: Arc<RoutingTable>,
    flooder: Arc<Flooder>,
    engine: Arc<StreamEngine>,
    reconnector: Arc<Reconnector>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Agent {
    /// Load the identity and assemble the layers. Nothing is bound or
    /// dialled yet; that happens in [`Agent::start`].
    pub async fn new(config: Config) -> Result<Arc<Self>, MeshError> {
        config.validate().map_err(MeshError::Config)?;
        let id = AgentId::load_or_generate(&config.identity_file).await?;

        let mut capabilities = vec!["transit".to_string()];
        if config.exit.enabled {
            capabilities.push("exit".to_string());
        }
        if config.socks5.enabled {
            capabilities.push("socks5".to_string());
        }
        let identity = LocalIdentity {
            id,
            display_name: config.display_name.clone(),
            capabilities: capabilities.clone(),
        };

        let table = Arc::new(RoutingTable::new(id, config.routing.route_ttl));
        // Every agent is reachable as itself; exits also advertise what
        // they serve.
        table.add_local_route(RouteKey::Agent(id));
        if config.exit.enabled {
            for net in &config.exit.routes {
                table.add_local_route(RouteKey::Cidr(*net));
            }
            for pattern in &config.exit.domain_routes {
                let key = match pattern.strip_prefix("*.") {
                    Some(suffix) => RouteKey::DomainWildcard(suffix.to_ascii_lowercase()),
                    None => RouteKey::DomainExact(pattern.to_ascii_lowercase()),
                };
                table.add_local_route(key);
            }
            for forward in &config.exit.forward_routes {
                table.add_local_route(RouteKey::Forward(forward.key.clone()));
            }
        }

        let exit: Option<Arc<dyn ExitConnector>> = if config.exit.enabled {
            Some(ExitAdapter::new(config.exit.clone()).map_err(MeshError::Other)?)
        } else {
            None
        };

        let peers = Arc::new(PeerRegistry::new());
        let engine = StreamEngine::new(
            id,
            config.limits.clone(),
            Arc::clone(&peers),
            Arc::clone(&table),
            exit,
        );
        let flooder = Arc::new(Flooder::new(
            id,
            config.display_name.clone(),
            capabilities,
            config.routing.max_hops,
            Arc::clone(&table),
            Arc::clone(&peers) as Arc<dyn crate::routing::flooder::PeerSender>,
        ));

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        log::info!(
            "[agent] {} ({}) initialised, {} local routes",
            id,
            if config.display_name.is_empty() { "unnamed" } else { &config.display_name },
            table.len()
        );
        Ok(Arc::new(Self {
            config,
            identity,
            peers,
            table,
            flooder,
            engine,
            reconnector: Arc::new(Reconnector::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> AgentId {
        self.identity.id
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn engine(&self) -> &Arc<StreamEngine> {
        &self.engine
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn flooder(&self) -> &Arc<Flooder> {
        &self.flooder
    }

    fn spawn(&self, task: tokio::task::JoinHandle<()>) {
        self.tasks.lock().expect("tasks lock").push(task);
    }

    /// Bind every listener, start the dial loops, the event loop, and the
    /// background sweeps. Listener bind failures are fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        // Bind everything before spawning anything, so startup failures
        // surface before the agent half-runs.
        let mut acceptors = Vec::new();
        for listener in &self.config.listeners {
            let acceptor = transport::listen(listener)
                .await
                .map_err(|e| MeshError::Listener(format!("{}: {}", listener.bind, e)))?;
            acceptors.push(acceptor);
        }
        let socks5 = if self.config.socks5.enabled {
            let server = Socks5Server::new(self.config.socks5.clone(), Arc::clone(&self.engine));
            let listener = server
                .bind()
                .await
                .map_err(|e| MeshError::Listener(e.to_string()))?;
            Some((server, listener))
        } else {
            None
        };

        self.spawn_event_loop();

        for acceptor in acceptors {
            self.spawn_accept_loop(acceptor);
        }
        for peer in self.config.peers.clone() {
            self.spawn_dial_loop(peer);
        }
        if let Some((server, listener)) = socks5 {
            let shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(server.serve(listener, shutdown)));
        }

        self.spawn_background_tasks();
        log::info!("[agent] {} started", self.identity.id.short());
        Ok(())
    }

    /// Graceful shutdown: withdraw local routes, close peers, stop tasks.
    pub async fn shutdown(&self) {
        log::info!("[agent] shutting down");
        self.flooder.withdraw_local_routes().await;
        for peer in &self.config.peers {
            self.reconnector.cancel(&peer.address);
        }
        self.shutdown_tx.send(true).ok();
        for id in self.peers.connected_peer_ids() {
            if let Some(conn) = self.peers.remove(&id) {
                conn.close().await;
            }
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        for task in tasks {
            task.abort();
        }
    }

    /// Handshake over an established link and register the connection.
    /// Shared by dial loops, accept loops, and tests.
    pub(crate) async fn connect_link(
        self: &Arc<Self>,
        link: BoxLink,
        dialled: bool,
        expected: Option<AgentId>,
    ) -> Result<Arc<PeerConnection>, crate::peer::HandshakeError> {
        let conn = PeerConnection::establish(
            link,
            dialled,
            expected,
            &self.identity,
            &self.config.connection,
            self.events_tx.clone(),
        )
        .await?;
        self.on_peer_connected(Arc::clone(&conn)).await;
        Ok(conn)
    }

    async fn on_peer_connected(self: &Arc<Self>, conn: Arc<PeerConnection>) {
        if let Some(previous) = self.peers.insert(Arc::clone(&conn)) {
            log::info!("[agent] replacing existing connection to {}", conn.id().short());
            previous.close().await;
        }
        // An inbound connection from a peer we are configured to dial makes
        // its dial loop redundant until the peer drops again.
        if !conn.dialled() {
            if let Some(address) = self.dial_address_for(conn.id()) {
                self.reconnector.pause(&address);
            }
        }
        // Catch the newcomer up without waiting for the next periodic
        // announce.
        self.flooder.send_full_table(conn.id()).await;
        self.flooder.announce_node_info().await;
    }

    /// Configured dial address for a peer pinned by expected id, if any.
    fn dial_address_for(&self, id: AgentId) -> Option<String> {
        self.config
            .peers
            .iter()
            .find(|peer| peer.id == Some(id))
            .map(|peer| peer.address.clone())
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let mut events_rx = self
            .events_rx
            .lock()
            .expect("events lock")
            .take()
            .expect("event loop started twice");
        let agent = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.spawn(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => return,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                agent.handle_event(event).await;
            }
        }));
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Frame { peer, frame } => match frame {
                Frame::RouteAdvertise(adv) => {
                    self.flooder.handle_route_advertise(peer, &adv).await;
                }
                Frame::RouteWithdraw(withdraw) => {
                    self.flooder.handle_route_withdraw(peer, &withdraw).await;
                }
                Frame::NodeInfoAdvertise(info) => {
                    self.flooder.handle_node_info(peer, &info).await;
                }
                frame @ (Frame::StreamOpen { .. }
                | Frame::StreamOpenAck { .. }
                | Frame::StreamOpenErr { .. }
                | Frame::StreamData { .. }
                | Frame::StreamClose { .. }
                | Frame::StreamReset { .. }) => {
                    self.engine.handle_control_frame(peer, frame).await;
                }
                Frame::PeerHello(_) | Frame::PeerHelloAck(_) => {
                    // Hellos after the handshake are a protocol error.
                    log::warn!("[agent] unexpected hello from {}, closing", peer.short());
                    if let Some(conn) = self.peers.get(&peer) {
                        conn.close().await;
                    }
                }
                Frame::Keepalive { .. } | Frame::KeepaliveAck { .. } => {
                    // Handled inside the peer connection.
                }
            },
            PeerEvent::Substream { peer, stream, first } => {
                self.engine.attach_substream(peer, stream, first).await;
            }
            PeerEvent::Disconnected { peer } => {
                // A replaced connection emits Disconnected too; only a close
                // of the registered connection means the peer is gone.
                let gone =
                    self.peers.get(&peer).map(|conn| conn.is_closed()).unwrap_or(false);
                if gone {
                    self.peers.remove(&peer);
                    self.engine.handle_peer_disconnected(peer).await;
                    if let Some(address) = self.dial_address_for(peer) {
                        self.reconnector.resume(&address);
                    }
                    log::info!("[agent] peer {} disconnected", peer.short());
                }
            }
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>, mut acceptor: crate::transport::BoxAcceptor) {
        let agent = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.spawn(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.changed() => return,
                    accepted = acceptor.accept() => accepted,
                };
                match accepted {
                    Ok(link) => {
                        let agent = Arc::clone(&agent);
                        tokio::spawn(async move {
                            if let Err(e) = agent.connect_link(link, false, None).await {
                                log::warn!("[agent] inbound handshake failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("[agent] accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }));
    }

    /// Dial loop for one configured peer: connect, hold, and on loss (for
    /// persistent peers) back off and re-dial the configured address so DNS
    /// re-resolves.
    fn spawn_dial_loop(self: &Arc<Self>, peer: PeerConfig) {
        let agent = Arc::clone(self);
        self.spawn(tokio::spawn(async move {
            let mut backoff = Backoff::new(agent.config.reconnect.clone());
            let mut state;
            loop {
                if !agent.reconnector.wait_ready(&peer.address).await {
                    return;
                }
                state = PeerState::Connecting;
                log::debug!("[agent] {} {:?} over {}", peer.address, state, peer.transport);
                match transport::dial(&peer).await {
                    Ok(link) => {
                        state = PeerState::Handshaking;
                        log::debug!("[agent] {} {:?}", peer.address, state);
                        match agent.connect_link(link, true, peer.id).await {
                            Ok(conn) => {
                                state = PeerState::Connected;
                                log::debug!("[agent] {} {:?}", peer.address, state);
                                backoff.reset();
                                conn.wait_closed().await;
                                if !peer.persistent
                                    || agent.reconnector.is_cancelled(&peer.address)
                                {
                                    return;
                                }
                                state = PeerState::Reconnecting;
                                log::info!("[agent] {} lost, reconnecting", peer.address);
                            }
                            Err(e) => {
                                log::warn!("[agent] handshake with {} failed: {}", peer.address, e);
                                if !peer.persistent {
                                    return;
                                }
                                state = PeerState::Reconnecting;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[agent] dial {} failed: {}", peer.address, e);
                        if !peer.persistent {
                            return;
                        }
                        state = PeerState::Reconnecting;
                    }
                }
                let Some(delay) = backoff.next_delay() else {
                    log::warn!("[agent] giving up on {}", peer.address);
                    return;
                };
                log::debug!(
                    "[agent] {} {:?}, retrying in {:.1}s (attempt {})",
                    peer.address,
                    state,
                    delay.as_secs_f64(),
                    backoff.attempt()
                );
                tokio::time::sleep(delay).await;
            }
        }));
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        // Periodic announce.
        {
            let flooder = Arc::clone(&self.flooder);
            let interval = self.config.routing.advertise_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    flooder.announce_local_routes().await;
                    flooder.announce_node_info().await;
                }
            }));
        }

        // Route reaper, seen-cache sweep, and pending-open sweep.
        {
            let table = Arc::clone(&self.table);
            let flooder = Arc::clone(&self.flooder);
            let engine = Arc::clone(&self.engine);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    }
                    let reaped = table.reap_expired();
                    if reaped > 0 {
                        log::debug!("[agent] reaped {} expired routes", reaped);
                    }
                    flooder.sweep_seen_caches();
                    engine.sweep_pending().await;
                }
            }));
        }

        // Status heartbeat with transfer counters; full dumps at trace.
        {
            let agent = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    }
                    let routes = agent.table.dump();
                    let peer_totals = agent.peers.transfer_totals();
                    let streams = agent.engine.stream_stats();
                    let (stream_in, stream_out) = streams
                        .iter()
                        .fold((0u64, 0u64), |(i, o), s| (i + s.bytes_in, o + s.bytes_out));
                    log::debug!(
                        "[agent] status: {} peers ({} frames / {} bytes exchanged), {} routes, {} streams ({} bytes in / {} bytes out)",
                        agent.peers.len(),
                        peer_totals.frames_sent + peer_totals.frames_received,
                        peer_totals.bytes_sent + peer_totals.bytes_received,
                        routes.len(),
                        streams.len(),
                        stream_in,
                        stream_out,
                    );
                    if log::log_enabled!(log::Level::Trace) {
                        for conn in agent.peers.snapshot() {
                            log::trace!("[agent] {:?}", conn);
                        }
                        for stat in &streams {
                            log::trace!("[agent] {:?}", stat);
                        }
                        for entry in &routes {
                            log::trace!(
                                "[agent] route {} via {} (origin {}, metric {})",
                                entry.key,
                                entry.next_hop.short(),
                                entry.origin.short(),
                                entry.metric
                            );
                        }
                    }
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsConfig, ExitConfig};
    use crate::transports::memory;
    use crate::wire::{Destination, StreamProto};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    static AGENT_SEQ: AtomicU32 = AtomicU32::new(0);

    async fn test_agent(name: &str, exit_routes: &[&str]) -> Arc<Agent> {
        let seq = AGENT_SEQ.fetch_add(1, Ordering::SeqCst);
        let identity_file = std::env::temp_dir().join(format!(
            "overmesh-test-{}-{}-{}.id",
            std::process::id(),
            name,
            seq
        ));
        let mut config = Config {
            identity_file,
            display_name: name.to_string(),
            ..Default::default()
        };
        if !exit_routes.is_empty() {
            config.exit = ExitConfig {
                enabled: true,
                routes: exit_routes.iter().map(|net| net.parse().unwrap()).collect(),
                domain_routes: Vec::new(),
                forward_routes: Vec::new(),
                // Pin the resolver so the test never consults system DNS.
                dns: DnsConfig { servers: vec!["127.0.0.1:1".parse().unwrap()], ..Default::default() },
            };
        }
        let agent = Agent::new(config).await.unwrap();
        agent.start().await.unwrap();
        agent
    }

    async fn connect(dialler: &Arc<Agent>, acceptor: &Arc<Agent>) {
        let (dial_link, accept_link) = memory::link_pair();
        let d = Arc::clone(dialler);
        let a = Arc::clone(acceptor);
        let dial_task = tokio::spawn(async move { d.connect_link(dial_link, true, None).await });
        let accept_task = tokio::spawn(async move { a.connect_link(accept_link, false, None).await });
        dial_task.await.unwrap().unwrap();
        accept_task.await.unwrap().unwrap();
    }

    async fn wait_for_route(agent: &Arc<Agent>, ip: &str) {
        let ip: std::net::IpAddr = ip.parse().unwrap();
        for _ in 0..200 {
            if agent.table().lookup(ip).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("route to {} never appeared", ip);
    }

    /// Echo server that reads to EOF, writes everything back, then closes.
    async fn echo_server() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    if socket.read_to_end(&mut buf).await.is_ok() {
                        socket.write_all(&buf).await.ok();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_direct_connection_end_to_end() {
        let echo = echo_server().await;
        let ingress = test_agent("ingress", &[]).await;
        let exit = test_agent("exit", &["127.0.0.0/8"]).await;

        connect(&ingress, &exit).await;
        wait_for_route(&ingress, "127.0.0.1").await;

        let (mut reader, mut writer) = ingress
            .engine()
            .open(Destination::Ip(echo), StreamProto::Tcp)
            .await
            .unwrap();
        writer.write(b"ping through the mesh").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        while let Some(chunk) = reader.read().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"ping through the mesh");

        // The transfer counters saw the traffic at both layers.
        let peer_stats = ingress.peers().get(&exit.id()).unwrap().stats();
        assert!(peer_stats.frames_sent >= 1);
        assert!(peer_stats.bytes_received > 0);
        let stream_stats = ingress.engine().stream_stats();
        assert!(stream_stats.iter().any(|stat| stat.bytes_in > 0));

        writer.close().await;

        ingress.shutdown().await;
        exit.shutdown().await;
    }

    #[tokio::test]
    async fn test_three_hop_path_with_metric_and_path() {
        let echo = echo_server().await;
        let a = test_agent("a", &[]).await;
        let b = test_agent("b", &[]).await;
        let c = test_agent("c", &["127.0.0.0/8"]).await;

        // B learns C's routes first, then A learns them via B's full-table
        // catch-up.
        connect(&b, &c).await;
        wait_for_route(&b, "127.0.0.1").await;
        connect(&a, &b).await;
        wait_for_route(&a, "127.0.0.1").await;

        let entry = a.table().lookup("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.metric, 2);
        assert_eq!(entry.next_hop, b.id());
        assert_eq!(entry.path, vec![b.id(), c.id()]);

        let (mut reader, mut writer) = a
            .engine()
            .open(Destination::Ip(echo), StreamProto::Tcp)
            .await
            .unwrap();
        writer.write(b"two hops out").await.unwrap();
        writer.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        while let Some(chunk) = reader.read().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"two hops out");
        writer.close().await;

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_triangle_flood_converges_without_looping() {
        let a = test_agent("a", &[]).await;
        let b = test_agent("b", &[]).await;
        let c = test_agent("c", &[]).await;

        connect(&a, &b).await;
        connect(&b, &c).await;
        connect(&c, &a).await;

        // Everyone announces; the cycle must converge rather than loop.
        a.flooder().announce_local_routes().await;
        b.flooder().announce_local_routes().await;
        c.flooder().announce_local_routes().await;

        for _ in 0..200 {
            let done = a.table().lookup_agent(b.id()).is_some()
                && a.table().lookup_agent(c.id()).is_some()
                && b.table().lookup_agent(a.id()).is_some()
                && b.table().lookup_agent(c.id()).is_some()
                && c.table().lookup_agent(a.id()).is_some()
                && c.table().lookup_agent(b.id()).is_some();
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.table().lookup_agent(c.id()).is_some());
        assert!(c.table().lookup_agent(a.id()).is_some());

        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_loss_resets_streams() {
        let echo = echo_server().await;
        let ingress = test_agent("ingress", &[]).await;
        let exit = test_agent("exit", &["127.0.0.0/8"]).await;

        connect(&ingress, &exit).await;
        wait_for_route(&ingress, "127.0.0.1").await;

        let (mut reader, mut writer) = ingress
            .engine()
            .open(Destination::Ip(echo), StreamProto::Tcp)
            .await
            .unwrap();
        writer.write(b"held open").await.unwrap();

        // Kill the link while the stream is alive.
        let conn = ingress.peers().get(&exit.id()).unwrap();
        conn.close().await;

        // The conduit must observe the teardown, not hang.
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match reader.read().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            })
            .await
            .expect("conduit must resolve after peer loss");
        assert!(outcome.is_err(), "expected a reset, got clean EOF");

        for _ in 0..100 {
            if ingress.engine().stream_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ingress.engine().stream_count(), 0);

        ingress.shutdown().await;
        exit.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_without_route_fails_fast() {
        let lonely = test_agent("lonely", &[]).await;
        let err = lonely
            .engine()
            .open(Destination::Ip("203.0.113.9:80".parse().unwrap()), StreamProto::Tcp)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::wire::OpenErrorCode::RouteNotFound);
        lonely.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_withdraws_peer_from_registry() {
        let a = test_agent("a", &[]).await;
        let b = test_agent("b", &[]).await;
        connect(&a, &b).await;
        assert_eq!(a.peers().len(), 1);

        let conn = a.peers().get(&b.id()).unwrap();
        conn.close().await;
        for _ in 0..100 {
            if a.peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.peers().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }
}
