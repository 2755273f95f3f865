//! Advertisement flooding
//!
//! Routes propagate by forward-once flooding: every advertisement is keyed
//! by (origin, sequence), remembered in a bounded seen-cache, and re-emitted
//! to every connected peer that has not already seen it. Two mechanisms stop
//! loops: the seen-cache drops repeats arriving over other paths, and the
//! `seen-by` list carried in the frame prevents sending an advertisement
//! back toward any agent it already visited. A hop-count cap backstops both.
//!
//! The flooder talks to peers only through the `PeerSender` seam
//! (send-to-peer and list-peer-ids), which keeps it independent of the
//! connection layer and easy to drive from tests.

use crate::identity::AgentId;
use crate::peer::{PeerRegistry, SendError};
use crate::routing::table::{RouteKey, RoutingTable};
use crate::wire::{Frame, NodeInfo, PathData, Route, RouteAdvertise, RouteWithdraw};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Seen-cache TTL; entries idle longer than this are swept.
const SEEN_CACHE_TTL: Duration = Duration::from_secs(300);

/// Hard cap on seen-cache entries; the oldest are evicted past this.
const MAX_SEEN_CACHE_SIZE: usize = 10_000;

/// The two peer-registry operations the flooder is allowed to use.
#[async_trait]
pub trait PeerSender: Send + Sync {
    fn connected_peer_ids(&self) -> Vec<AgentId>;
    async fn send_to_peer(&self, id: &AgentId, frame: &Frame) -> Result<(), SendError>;
}

#[async_trait]
impl PeerSender for PeerRegistry {
    fn connected_peer_ids(&self) -> Vec<AgentId> {
        PeerRegistry::connected_peer_ids(self)
    }

    async fn send_to_peer(&self, id: &AgentId, frame: &Frame) -> Result<(), SendError> {
        PeerRegistry::send_to_peer(self, id, frame).await
    }
}

struct SeenEntry {
    first_from: AgentId,
    last_seen: Instant,
}

/// Bounded (origin, sequence) dedup cache.
struct SeenCache {
    entries: Mutex<HashMap<(AgentId, u64), SeenEntry>>,
}

impl SeenCache {
    fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Record (origin, sequence); returns false if it was already present
    /// (refreshing its last-seen time).
    fn insert_if_new(&self, origin: AgentId, sequence: u64, from: AgentId) -> bool {
        let mut entries = self.entries.lock().expect("seen lock");
        if let Some(existing) = entries.get_mut(&(origin, sequence)) {
            existing.last_seen = Instant::now();
            return false;
        }
        if entries.len() >= MAX_SEEN_CACHE_SIZE {
            // Over cap: evict the stalest entry regardless of age.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| *key)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert((origin, sequence), SeenEntry { first_from: from, last_seen: Instant::now() });
        true
    }

    fn first_seen_from(&self, origin: AgentId, sequence: u64) -> Option<AgentId> {
        self.entries
            .lock()
            .expect("seen lock")
            .get(&(origin, sequence))
            .map(|entry| entry.first_from)
    }

    fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("seen lock");
        let before = entries.len();
        entries.retain(|_, entry| entry.last_seen.elapsed() <= SEEN_CACHE_TTL);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("seen lock").len()
    }
}

/// Cosmetic directory of known agents, fed by node-info floods.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub sequence: u64,
}

pub struct Flooder {
    local: AgentId,
    display_name: String,
    capabilities: Vec<String>,
    max_hops: u16,
    table: Arc<RoutingTable>,
    peers: Arc<dyn PeerSender>,
    route_seen: SeenCache,
    node_seen: SeenCache,
    route_seq: AtomicU64,
    node_seq: AtomicU64,
    directory: Mutex<HashMap<AgentId, NodeRecord>>,
}

impl Flooder {
    pub fn new(
        local: AgentId,
        display_name: String,
        capabilities: Vec<String>,
        max_hops: u16,
        table: Arc<RoutingTable>,
        peers: Arc<dyn PeerSender>,
    ) -> Self {
        Self {
            local,
            display_name,
            capabilities,
            max_hops,
            table,
            peers,
            route_seen: SeenCache::new(),
            node_seen: SeenCache::new(),
            route_seq: AtomicU64::new(0),
            node_seq: AtomicU64::new(0),
            directory: Mutex::new(HashMap::new()),
        }
    }

    fn next_route_seq(&self) -> u64 {
        self.route_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_node_seq(&self) -> u64 {
        self.node_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Display name another agent flooded for itself, if known.
    pub fn display_name_of(&self, id: AgentId) -> Option<String> {
        self.directory
            .lock()
            .expect("directory lock")
            .get(&id)
            .map(|record| record.display_name.clone())
    }

    fn remember_name(&self, origin: AgentId, name: &str) {
        if name.is_empty() {
            return;
        }
        let mut directory = self.directory.lock().expect("directory lock");
        directory
            .entry(origin)
            .or_insert_with(|| NodeRecord {
                display_name: String::new(),
                capabilities: Vec::new(),
                sequence: 0,
            })
            .display_name = name.to_string();
    }

    /// Process one received ROUTE_ADVERTISE. Returns true when the
    /// advertisement was new and applied; duplicates and loops return false.
    pub async fn handle_route_advertise(&self, from_peer: AgentId, adv: &RouteAdvertise) -> bool {
        if !self.route_seen.insert_if_new(adv.origin, adv.sequence, from_peer) {
            log::trace!(
                "[flood] duplicate advertisement ({}, {}) from {}",
                adv.origin.short(),
                adv.sequence,
                from_peer.short()
            );
            return false;
        }
        if adv.seen_by.contains(&self.local) {
            // Already travelled through us on another path.
            return false;
        }

        let decoded_path = match &adv.path {
            PathData::Plain(ids) => ids.clone(),
            PathData::Sealed(_) => {
                // Sealed to a management key this agent does not hold; the
                // routes stay usable one hop out, source-routing beyond the
                // neighbour will fail softly.
                log::debug!(
                    "[flood] advertisement from {} carries a sealed path, storing without it",
                    adv.origin.short()
                );
                Vec::new()
            }
        };
        // The sender prepends itself before flooding; tolerate senders that
        // did not.
        let stored_path = if decoded_path.first() == Some(&from_peer) {
            decoded_path.clone()
        } else {
            let mut path = Vec::with_capacity(decoded_path.len() + 1);
            path.push(from_peer);
            path.extend_from_slice(&decoded_path);
            path
        };

        let mut forwarded = Vec::with_capacity(adv.routes.len());
        for route in &adv.routes {
            let Some((key, metric)) = RouteKey::from_wire(route) else {
                log::debug!("[flood] skipping malformed route from {}", adv.origin.short());
                continue;
            };
            let metric = metric.saturating_add(1);
            if metric > self.max_hops {
                log::debug!(
                    "[flood] dropping {} from {}: metric {} exceeds max hops",
                    key,
                    adv.origin.short(),
                    metric
                );
                continue;
            }
            self.table.process_route_advertise(
                from_peer,
                adv.origin,
                adv.sequence,
                key.clone(),
                metric,
                stored_path.clone(),
            );
            forwarded.push(key.to_wire(metric));
        }
        self.remember_name(adv.origin, &adv.display_name);

        if forwarded.is_empty() {
            return true;
        }

        let mut new_seen_by = adv.seen_by.clone();
        new_seen_by.push(self.local);
        let mut new_path = Vec::with_capacity(decoded_path.len() + 1);
        new_path.push(self.local);
        new_path.extend_from_slice(&decoded_path);

        let frame = Frame::RouteAdvertise(RouteAdvertise {
            origin: adv.origin,
            display_name: adv.display_name.clone(),
            sequence: adv.sequence,
            routes: forwarded,
            path: PathData::Plain(new_path),
            seen_by: new_seen_by.clone(),
        });
        self.flood(&frame, Some(from_peer), &new_seen_by).await;
        true
    }

    /// Process one received ROUTE_WITHDRAW; mirrors the advertise path
    /// without path bookkeeping.
    pub async fn handle_route_withdraw(&self, from_peer: AgentId, withdraw: &RouteWithdraw) -> bool {
        if !self.route_seen.insert_if_new(withdraw.origin, withdraw.sequence, from_peer) {
            return false;
        }
        if withdraw.seen_by.contains(&self.local) {
            return false;
        }

        let keys: Vec<RouteKey> = withdraw
            .routes
            .iter()
            .filter_map(|route| RouteKey::from_wire(route).map(|(key, _)| key))
            .collect();
        let removed = self.table.process_route_withdraw(withdraw.origin, &keys);
        log::debug!(
            "[flood] withdraw from {} removed {} routes",
            withdraw.origin.short(),
            removed
        );

        let mut new_seen_by = withdraw.seen_by.clone();
        new_seen_by.push(self.local);
        let frame = Frame::RouteWithdraw(RouteWithdraw {
            origin: withdraw.origin,
            sequence: withdraw.sequence,
            routes: withdraw.routes.clone(),
            seen_by: new_seen_by.clone(),
        });
        self.flood(&frame, Some(from_peer), &new_seen_by).await;
        true
    }

    /// Process one received NODE_INFO_ADVERTISE: same dedup discipline,
    /// feeding the display-name directory instead of the routing table.
    pub async fn handle_node_info(&self, from_peer: AgentId, info: &NodeInfo) -> bool {
        if !self.node_seen.insert_if_new(info.origin, info.sequence, from_peer) {
            return false;
        }
        if info.seen_by.contains(&self.local) {
            return false;
        }

        {
            let mut directory = self.directory.lock().expect("directory lock");
            let record = directory.entry(info.origin).or_insert_with(|| NodeRecord {
                display_name: String::new(),
                capabilities: Vec::new(),
                sequence: 0,
            });
            if info.sequence >= record.sequence {
                record.display_name = info.display_name.clone();
                record.capabilities = info.capabilities.clone();
                record.sequence = info.sequence;
            }
        }

        let mut new_seen_by = info.seen_by.clone();
        new_seen_by.push(self.local);
        let frame = Frame::NodeInfoAdvertise(NodeInfo {
            origin: info.origin,
            display_name: info.display_name.clone(),
            capabilities: info.capabilities.clone(),
            sequence: info.sequence,
            seen_by: new_seen_by.clone(),
        });
        self.flood(&frame, Some(from_peer), &new_seen_by).await;
        true
    }

    /// Flood this agent's own routes to every connected peer, under a fresh
    /// sequence. Runs periodically and on demand.
    pub async fn announce_local_routes(&self) {
        let routes: Vec<Route> =
            self.table.local_routes().iter().map(|key| key.to_wire(0)).collect();
        if routes.is_empty() {
            return;
        }
        let sequence = self.next_route_seq();
        let frame = Frame::RouteAdvertise(RouteAdvertise {
            origin: self.local,
            display_name: self.display_name.clone(),
            sequence,
            routes,
            path: PathData::Plain(vec![self.local]),
            seen_by: vec![self.local],
        });
        log::debug!("[flood] announcing local routes (sequence {})", sequence);
        self.flood(&frame, None, &[self.local]).await;
    }

    /// Flood this agent's node info (display name + capabilities).
    pub async fn announce_node_info(&self) {
        let sequence = self.next_node_seq();
        let frame = Frame::NodeInfoAdvertise(NodeInfo {
            origin: self.local,
            display_name: self.display_name.clone(),
            capabilities: self.capabilities.clone(),
            sequence,
            seen_by: vec![self.local],
        });
        self.flood(&frame, None, &[self.local]).await;
    }

    /// Withdraw all local routes, used on shutdown.
    pub async fn withdraw_local_routes(&self) {
        let routes: Vec<Route> =
            self.table.local_routes().iter().map(|key| key.to_wire(0)).collect();
        if routes.is_empty() {
            return;
        }
        let sequence = self.next_route_seq();
        let frame = Frame::RouteWithdraw(RouteWithdraw {
            origin: self.local,
            sequence,
            routes,
            seen_by: vec![self.local],
        });
        log::info!("[flood] withdrawing local routes (sequence {})", sequence);
        self.flood(&frame, None, &[self.local]).await;
    }

    /// Catch a newly connected peer up on the whole table without waiting
    /// for the next periodic announce: one synthesised advertisement per
    /// origin, sent only to that peer.
    pub async fn send_full_table(&self, to_peer: AgentId) {
        let grouped = self.table.routes_for_full_advertise(to_peer);
        for (origin, entries) in grouped {
            let representative = entries
                .iter()
                .min_by_key(|entry| entry.metric)
                .expect("grouped entries are non-empty");
            let mut path = Vec::with_capacity(representative.path.len() + 1);
            path.push(self.local);
            path.extend_from_slice(&representative.path);

            let display_name = if origin == self.local {
                self.display_name.clone()
            } else {
                self.display_name_of(origin).unwrap_or_default()
            };
            let routes: Vec<Route> =
                entries.iter().map(|entry| entry.key.to_wire(entry.metric)).collect();
            let frame = Frame::RouteAdvertise(RouteAdvertise {
                origin,
                display_name,
                sequence: self.next_route_seq(),
                routes,
                path: PathData::Plain(path),
                seen_by: vec![self.local],
            });
            if let Err(e) = self.peers.send_to_peer(&to_peer, &frame).await {
                log::debug!("[flood] full-table send to {} failed: {}", to_peer.short(), e);
                return;
            }
        }
        log::debug!("[flood] sent full table to {}", to_peer.short());
    }

    /// Evict stale seen-cache entries; run periodically.
    pub fn sweep_seen_caches(&self) {
        let routes = self.route_seen.sweep();
        let nodes = self.node_seen.sweep();
        if routes + nodes > 0 {
            log::trace!("[flood] swept {} route / {} node seen entries", routes, nodes);
        }
    }

    /// Send a frame to every connected peer except `exclude_peer` and
    /// anyone in `seen_by`. Per-peer failures are logged and ignored; the
    /// keepalive machinery deals with dead links.
    async fn flood(&self, frame: &Frame, exclude_peer: Option<AgentId>, seen_by: &[AgentId]) {
        for peer_id in self.peers.connected_peer_ids() {
            if Some(peer_id) == exclude_peer || seen_by.contains(&peer_id) {
                continue;
            }
            if let Err(e) = self.peers.send_to_peer(&peer_id, frame).await {
                log::debug!("[flood] send to {} failed: {}", peer_id.short(), e);
            }
        }
    }

    #[cfg(test)]
    fn seen_cache_len(&self) -> usize {
        self.route_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn id(byte: u8) -> AgentId {
        AgentId::from_bytes([byte; 16])
    }

    /// Records every send instead of touching the network.
    struct Recording {
        ids: Vec<AgentId>,
        sent: Mutex<Vec<(AgentId, Frame)>>,
    }

    impl Recording {
        fn new(ids: Vec<AgentId>) -> Arc<Self> {
            Arc::new(Self { ids, sent: Mutex::new(Vec::new()) })
        }

        fn sent(&self) -> Vec<(AgentId, Frame)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerSender for Recording {
        fn connected_peer_ids(&self) -> Vec<AgentId> {
            self.ids.clone()
        }

        async fn send_to_peer(&self, id: &AgentId, frame: &Frame) -> Result<(), SendError> {
            self.sent.lock().unwrap().push((*id, frame.clone()));
            Ok(())
        }
    }

    fn flooder(local: AgentId, peers: Arc<Recording>) -> (Flooder, Arc<RoutingTable>) {
        let table = Arc::new(RoutingTable::new(local, Duration::from_secs(300)));
        let flooder = Flooder::new(
            local,
            "local".to_string(),
            vec!["transit".to_string()],
            16,
            Arc::clone(&table),
            peers,
        );
        (flooder, table)
    }

    fn advertisement(origin: AgentId, sequence: u64, via: &[AgentId]) -> RouteAdvertise {
        RouteAdvertise {
            origin,
            display_name: "origin".to_string(),
            sequence,
            routes: vec![RouteKey::Cidr("10.0.0.0/8".parse().unwrap()).to_wire(via.len() as u16)],
            path: PathData::Plain(via.to_vec()),
            seen_by: via.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_advertise_applies_and_floods_with_increment() {
        let local = id(0xaa);
        let from = id(1);
        let other = id(2);
        let peers = Recording::new(vec![from, other]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        let origin = id(9);
        let adv = advertisement(origin, 7, &[from, origin]);
        assert!(flooder.handle_route_advertise(from, &adv).await);

        // Stored metric is received + 1 and the path leads through the
        // sender.
        let entry = table.lookup("10.1.2.3".parse::<IpAddr>().unwrap()).unwrap();
        assert_eq!(entry.metric, 3);
        assert_eq!(entry.next_hop, from);
        assert_eq!(entry.path, vec![from, origin]);

        // Forwarded once, to the peer that is neither the sender nor in
        // seen-by, with local prepended everywhere.
        let sent = peers.sent();
        assert_eq!(sent.len(), 1);
        let (to, frame) = &sent[0];
        assert_eq!(*to, other);
        let Frame::RouteAdvertise(forwarded) = frame else { panic!("route advertise expected") };
        assert_eq!(forwarded.routes[0].metric, 3);
        assert_eq!(forwarded.seen_by, vec![from, origin, local]);
        assert_eq!(forwarded.path.as_plain().unwrap(), &[local, from, origin]);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_not_reapplied() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from, id(2)]);
        let (flooder, _table) = flooder(local, Arc::clone(&peers));

        let adv = advertisement(id(9), 7, &[from, id(9)]);
        assert!(flooder.handle_route_advertise(from, &adv).await);
        let sends_after_first = peers.sent().len();

        // Same (origin, sequence) over another peer: dropped, not re-flooded.
        assert!(!flooder.handle_route_advertise(id(2), &adv).await);
        assert_eq!(peers.sent().len(), sends_after_first);
        assert_eq!(flooder.seen_cache_len(), 1);
        assert_eq!(flooder.route_seen.first_seen_from(id(9), 7), Some(from));
    }

    #[tokio::test]
    async fn test_seen_by_loop_suppression() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from, id(2)]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        // The advertisement already visited us on another path.
        let mut adv = advertisement(id(9), 7, &[from, id(9)]);
        adv.seen_by.push(local);
        assert!(!flooder.handle_route_advertise(from, &adv).await);
        assert!(table.is_empty());
        assert!(peers.sent().is_empty());
    }

    #[tokio::test]
    async fn test_max_hops_cap_drops_route() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from, id(2)]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        let mut adv = advertisement(id(9), 7, &[from, id(9)]);
        adv.routes[0].metric = 16;
        assert!(flooder.handle_route_advertise(from, &adv).await);
        assert!(table.is_empty());
        assert!(peers.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sealed_path_stored_one_hop() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        let mut adv = advertisement(id(9), 7, &[from, id(9)]);
        adv.path = PathData::Sealed(vec![1, 2, 3, 4]);
        assert!(flooder.handle_route_advertise(from, &adv).await);
        let entry = table.lookup("10.0.0.1".parse::<IpAddr>().unwrap()).unwrap();
        assert_eq!(entry.path, vec![from]);
    }

    #[tokio::test]
    async fn test_withdraw_after_advertise_clears_routes() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from, id(2)]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        let adv = advertisement(id(9), 7, &[from, id(9)]);
        flooder.handle_route_advertise(from, &adv).await;
        assert_eq!(table.len(), 1);

        let withdraw = RouteWithdraw {
            origin: id(9),
            sequence: 8,
            routes: adv.routes.clone(),
            seen_by: vec![from, id(9)],
        };
        assert!(flooder.handle_route_withdraw(from, &withdraw).await);
        assert!(table.is_empty());

        // The withdrawal floods onward with us appended to seen-by.
        let sent = peers.sent();
        let (to, frame) = sent.last().unwrap();
        assert_eq!(*to, id(2));
        let Frame::RouteWithdraw(forwarded) = frame else { panic!("route withdraw expected") };
        assert!(forwarded.seen_by.contains(&local));
    }

    #[tokio::test]
    async fn test_announce_local_routes_to_all_peers() {
        let local = id(0xaa);
        let peers = Recording::new(vec![id(1), id(2)]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));
        table.add_local_route(RouteKey::Cidr("192.168.0.0/16".parse().unwrap()));
        table.add_local_route(RouteKey::Agent(local));

        flooder.announce_local_routes().await;
        flooder.announce_local_routes().await;

        let sent = peers.sent();
        assert_eq!(sent.len(), 4);
        let Frame::RouteAdvertise(first) = &sent[0].1 else { panic!() };
        let Frame::RouteAdvertise(last) = &sent[3].1 else { panic!() };
        assert_eq!(first.origin, local);
        assert_eq!(first.routes.len(), 2);
        assert_eq!(first.seen_by, vec![local]);
        assert_eq!(first.path.as_plain().unwrap(), &[local]);
        // Sequences increase monotonically per announcement round.
        assert!(last.sequence > first.sequence);
        assert!(first.routes.iter().all(|route| route.metric == 0));
    }

    #[tokio::test]
    async fn test_send_full_table_targets_one_peer_with_split_horizon() {
        let local = id(0xaa);
        let newcomer = id(5);
        let via = id(1);
        let peers = Recording::new(vec![via, newcomer]);
        let (flooder, table) = flooder(local, Arc::clone(&peers));

        table.add_local_route(RouteKey::Cidr("192.168.0.0/16".parse().unwrap()));
        // Learned through the newcomer itself: suppressed by split horizon.
        table.process_route_advertise(
            newcomer,
            id(9),
            3,
            RouteKey::Cidr("10.0.0.0/8".parse().unwrap()),
            2,
            vec![newcomer, id(9)],
        );
        // Learned elsewhere: forwarded.
        table.process_route_advertise(
            via,
            id(8),
            3,
            RouteKey::Cidr("172.16.0.0/12".parse().unwrap()),
            2,
            vec![via, id(8)],
        );

        flooder.send_full_table(newcomer).await;

        let sent = peers.sent();
        assert!(!sent.is_empty());
        let mut origins_sent = Vec::new();
        for (to, frame) in &sent {
            assert_eq!(*to, newcomer);
            let Frame::RouteAdvertise(adv) = frame else { panic!("route advertise expected") };
            origins_sent.push(adv.origin);
            assert_eq!(adv.path.as_plain().unwrap()[0], local);
        }
        assert!(origins_sent.contains(&local));
        assert!(origins_sent.contains(&id(8)));
        assert!(!origins_sent.contains(&id(9)));
    }

    #[tokio::test]
    async fn test_node_info_dedup_and_directory() {
        let local = id(0xaa);
        let from = id(1);
        let peers = Recording::new(vec![from, id(2)]);
        let (flooder, _table) = flooder(local, Arc::clone(&peers));

        let info = NodeInfo {
            origin: id(9),
            display_name: "exit-fra".to_string(),
            capabilities: vec!["exit".to_string()],
            sequence: 4,
            seen_by: vec![from, id(9)],
        };
        assert!(flooder.handle_node_info(from, &info).await);
        assert!(!flooder.handle_node_info(from, &info).await);
        assert_eq!(flooder.display_name_of(id(9)).as_deref(), Some("exit-fra"));

        let sent = peers.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, id(2));
    }
}
