//! Routing table
//!
//! Entries are keyed by (origin, destination key); for any such pair at most
//! one entry is retained, the one with the highest sequence (ties broken by
//! lower metric). CIDR lookups are longest-prefix: an index of populated
//! prefix lengths lets a probe check one truncated network per length, from
//! most to least specific. Domain lookups try exact matches before
//! single-label wildcards.
//!
//! A single read/write lock guards the table: lookups share, updates are
//! brief and exclusive. Local routes never expire; everything else is reaped
//! once its last refresh is older than the configured TTL.

use crate::identity::{AgentId, AGENT_ID_LEN};
use crate::wire::{Route, RouteFamily};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Destination key of one route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Cidr(IpNet),
    DomainExact(String),
    /// Stored without the leading `*.`; matches exactly one extra label.
    DomainWildcard(String),
    Forward(String),
    Agent(AgentId),
}

impl RouteKey {
    /// Parse a wire route into a key and its carried metric.
    pub fn from_wire(route: &Route) -> Option<(RouteKey, u16)> {
        let key = match route.family {
            RouteFamily::Ipv4 => {
                let octets: [u8; 4] = route.prefix.as_slice().try_into().ok()?;
                let net = Ipv4Net::new(octets.into(), route.prefix_len).ok()?.trunc();
                RouteKey::Cidr(IpNet::V4(net))
            }
            RouteFamily::Ipv6 => {
                let octets: [u8; 16] = route.prefix.as_slice().try_into().ok()?;
                let net = Ipv6Net::new(octets.into(), route.prefix_len).ok()?.trunc();
                RouteKey::Cidr(IpNet::V6(net))
            }
            RouteFamily::Domain => {
                let pattern = std::str::from_utf8(&route.prefix).ok()?.to_ascii_lowercase();
                match pattern.strip_prefix("*.") {
                    Some(suffix) if !suffix.is_empty() => RouteKey::DomainWildcard(suffix.to_string()),
                    Some(_) => return None,
                    None => RouteKey::DomainExact(pattern),
                }
            }
            RouteFamily::Forward => {
                RouteKey::Forward(std::str::from_utf8(&route.prefix).ok()?.to_string())
            }
            RouteFamily::Agent => {
                let bytes: [u8; AGENT_ID_LEN] = route.prefix.as_slice().try_into().ok()?;
                RouteKey::Agent(AgentId::from_bytes(bytes))
            }
        };
        Some((key, route.metric))
    }

    /// Encode this key as a wire route with the given metric.
    pub fn to_wire(&self, metric: u16) -> Route {
        match self {
            RouteKey::Cidr(IpNet::V4(net)) => Route {
                family: RouteFamily::Ipv4,
                prefix_len: net.prefix_len(),
                prefix: net.addr().octets().to_vec(),
                metric,
            },
            RouteKey::Cidr(IpNet::V6(net)) => Route {
                family: RouteFamily::Ipv6,
                prefix_len: net.prefix_len(),
                prefix: net.addr().octets().to_vec(),
                metric,
            },
            RouteKey::DomainExact(name) => Route {
                family: RouteFamily::Domain,
                prefix_len: 0,
                prefix: name.as_bytes().to_vec(),
                metric,
            },
            RouteKey::DomainWildcard(suffix) => Route {
                family: RouteFamily::Domain,
                prefix_len: 0,
                prefix: format!("*.{}", suffix).into_bytes(),
                metric,
            },
            RouteKey::Forward(key) => Route {
                family: RouteFamily::Forward,
                prefix_len: 0,
                prefix: key.as_bytes().to_vec(),
                metric,
            },
            RouteKey::Agent(id) => Route {
                family: RouteFamily::Agent,
                prefix_len: 0,
                prefix: id.as_bytes().to_vec(),
                metric,
            },
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteKey::Cidr(net) => write!(f, "{}", net),
            RouteKey::DomainExact(name) => write!(f, "{}", name),
            RouteKey::DomainWildcard(suffix) => write!(f, "*.{}", suffix),
            RouteKey::Forward(key) => write!(f, "forward:{}", key),
            RouteKey::Agent(id) => write!(f, "agent:{}", id.short()),
        }
    }
}

/// One stored route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub key: RouteKey,
    pub origin: AgentId,
    /// Hop count from the origin; local routes are 0.
    pub metric: u16,
    /// Neighbour this route was learned from; local id for local routes.
    pub next_hop: AgentId,
    /// Hops toward the origin, next hop first, origin last. Empty for local
    /// routes and for routes whose advertised path could not be read.
    pub path: Vec<AgentId>,
    pub sequence: u64,
    pub last_refresh: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<(AgentId, RouteKey), RouteEntry>,
    /// Origins advertising each key, for candidate collection.
    origins_by_key: HashMap<RouteKey, HashSet<AgentId>>,
    /// Populated CIDR prefix lengths per family, for longest-prefix probes.
    v4_lens: BTreeMap<u8, HashSet<Ipv4Net>>,
    v6_lens: BTreeMap<u8, HashSet<Ipv6Net>>,
}

impl Inner {
    fn index_insert(&mut self, origin: AgentId, key: &RouteKey) {
        self.origins_by_key.entry(key.clone()).or_default().insert(origin);
        match key {
            RouteKey::Cidr(IpNet::V4(net)) => {
                self.v4_lens.entry(net.prefix_len()).or_default().insert(*net);
            }
            RouteKey::Cidr(IpNet::V6(net)) => {
                self.v6_lens.entry(net.prefix_len()).or_default().insert(*net);
            }
            _ => {}
        }
    }

    fn index_remove(&mut self, origin: &AgentId, key: &RouteKey) {
        let empty = match self.origins_by_key.get_mut(key) {
            Some(origins) => {
                origins.remove(origin);
                origins.is_empty()
            }
            None => return,
        };
        if !empty {
            return;
        }
        self.origins_by_key.remove(key);
        match key {
            RouteKey::Cidr(IpNet::V4(net)) => {
                if let Some(set) = self.v4_lens.get_mut(&net.prefix_len()) {
                    set.remove(net);
                    if set.is_empty() {
                        self.v4_lens.remove(&net.prefix_len());
                    }
                }
            }
            RouteKey::Cidr(IpNet::V6(net)) => {
                if let Some(set) = self.v6_lens.get_mut(&net.prefix_len()) {
                    set.remove(net);
                    if set.is_empty() {
                        self.v6_lens.remove(&net.prefix_len());
                    }
                }
            }
            _ => {}
        }
    }

    fn remove_entry(&mut self, origin: &AgentId, key: &RouteKey) -> Option<RouteEntry> {
        let entry = self.entries.remove(&(*origin, key.clone()))?;
        self.index_remove(origin, key);
        Some(entry)
    }

    /// Best entry among the origins advertising `key`: lowest metric, ties
    /// broken by lowest next-hop id for determinism.
    fn best_for_key(&self, key: &RouteKey) -> Option<&RouteEntry> {
        let origins = self.origins_by_key.get(key)?;
        origins
            .iter()
            .filter_map(|origin| self.entries.get(&(*origin, key.clone())))
            .min_by_key(|entry| (entry.metric, entry.next_hop))
    }
}

/// The per-agent route store.
pub struct RoutingTable {
    local: AgentId,
    route_ttl: Duration,
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new(local: AgentId, route_ttl: Duration) -> Self {
        Self { local, route_ttl, inner: RwLock::new(Inner::default()) }
    }

    pub fn local_id(&self) -> AgentId {
        self.local
    }

    /// Insert a route originated by this agent: metric 0, next hop self,
    /// exempt from the reaper.
    pub fn add_local_route(&self, key: RouteKey) {
        let mut inner = self.inner.write().expect("table lock");
        let entry = RouteEntry {
            key: key.clone(),
            origin: self.local,
            metric: 0,
            next_hop: self.local,
            path: Vec::new(),
            sequence: 0,
            last_refresh: Instant::now(),
        };
        if inner.entries.insert((self.local, key.clone()), entry).is_none() {
            inner.index_insert(self.local, &key);
        }
        log::debug!("[routes] local route {}", key);
    }

    /// Destination keys of all locally-originated routes.
    pub fn local_routes(&self) -> Vec<RouteKey> {
        let inner = self.inner.read().expect("table lock");
        inner
            .entries
            .values()
            .filter(|entry| entry.origin == self.local)
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Apply one advertised route. The metric passed here is already
    /// incremented for the hop it travelled. Returns true if the table
    /// changed or was refreshed.
    pub fn process_route_advertise(
        &self,
        from_peer: AgentId,
        origin: AgentId,
        sequence: u64,
        key: RouteKey,
        metric: u16,
        path: Vec<AgentId>,
    ) -> bool {
        if origin == self.local {
            // Own routes echoed back; local entries are authoritative.
            return false;
        }
        let mut inner = self.inner.write().expect("table lock");
        if let Some(existing) = inner.entries.get_mut(&(origin, key.clone())) {
            if existing.sequence > sequence {
                return false;
            }
            if existing.sequence == sequence && existing.metric <= metric {
                // Same generation, no better: refresh only.
                existing.last_refresh = Instant::now();
                return true;
            }
            existing.metric = metric;
            existing.next_hop = from_peer;
            existing.path = path;
            existing.sequence = sequence;
            existing.last_refresh = Instant::now();
            return true;
        }

        let entry = RouteEntry {
            key: key.clone(),
            origin,
            metric,
            next_hop: from_peer,
            path,
            sequence,
            last_refresh: Instant::now(),
        };
        inner.entries.insert((origin, key.clone()), entry);
        inner.index_insert(origin, &key);
        log::debug!(
            "[routes] learned {} from {} (origin {}, metric {})",
            key,
            from_peer.short(),
            origin.short(),
            metric
        );
        true
    }

    /// Remove an origin's entries for the given keys.
    pub fn process_route_withdraw(&self, origin: AgentId, keys: &[RouteKey]) -> usize {
        let mut inner = self.inner.write().expect("table lock");
        let mut removed = 0;
        for key in keys {
            if inner.remove_entry(&origin, key).is_some() {
                removed += 1;
                log::debug!("[routes] withdrew {} (origin {})", key, origin.short());
            }
        }
        removed
    }

    /// Longest-prefix match. Ties at one prefix length go to the lowest
    /// metric, then the lowest next-hop id.
    pub fn lookup(&self, ip: IpAddr) -> Option<RouteEntry> {
        let inner = self.inner.read().expect("table lock");
        match ip {
            IpAddr::V4(addr) => {
                for (&len, nets) in inner.v4_lens.iter().rev() {
                    let probe = Ipv4Net::new(addr, len).ok()?.trunc();
                    if nets.contains(&probe) {
                        if let Some(entry) = inner.best_for_key(&RouteKey::Cidr(IpNet::V4(probe))) {
                            return Some(entry.clone());
                        }
                    }
                }
            }
            IpAddr::V6(addr) => {
                for (&len, nets) in inner.v6_lens.iter().rev() {
                    let probe = Ipv6Net::new(addr, len).ok()?.trunc();
                    if nets.contains(&probe) {
                        if let Some(entry) = inner.best_for_key(&RouteKey::Cidr(IpNet::V6(probe))) {
                            return Some(entry.clone());
                        }
                    }
                }
            }
        }
        None
    }

    /// Exact-match domain routes first; wildcards match exactly one extra
    /// label (`foo.example.com` matches `*.example.com`, `a.b.example.com`
    /// and `example.com` do not).
    pub fn lookup_domain(&self, hostname: &str) -> Option<RouteEntry> {
        let host = hostname.trim_end_matches('.').to_ascii_lowercase();
        let inner = self.inner.read().expect("table lock");
        if let Some(entry) = inner.best_for_key(&RouteKey::DomainExact(host.clone())) {
            return Some(entry.clone());
        }
        let (first_label, rest) = host.split_once('.')?;
        if first_label.is_empty() {
            return None;
        }
        inner
            .best_for_key(&RouteKey::DomainWildcard(rest.to_string()))
            .cloned()
    }

    pub fn lookup_forward(&self, key: &str) -> Option<RouteEntry> {
        let inner = self.inner.read().expect("table lock");
        inner.best_for_key(&RouteKey::Forward(key.to_string())).cloned()
    }

    /// Route to a specific agent (management operations).
    pub fn lookup_agent(&self, id: AgentId) -> Option<RouteEntry> {
        let inner = self.inner.read().expect("table lock");
        inner.best_for_key(&RouteKey::Agent(id)).cloned()
    }

    /// Current table grouped by origin, for catch-up flooding to a newly
    /// connected peer. Split horizon: routes whose path already includes
    /// that peer are suppressed.
    pub fn routes_for_full_advertise(&self, to_peer: AgentId) -> HashMap<AgentId, Vec<RouteEntry>> {
        let inner = self.inner.read().expect("table lock");
        let mut grouped: HashMap<AgentId, Vec<RouteEntry>> = HashMap::new();
        for entry in inner.entries.values() {
            if entry.origin == to_peer || entry.path.contains(&to_peer) {
                continue;
            }
            grouped.entry(entry.origin).or_default().push(entry.clone());
        }
        grouped
    }

    /// Drop non-local entries whose last refresh is older than the TTL.
    pub fn reap_expired(&self) -> usize {
        let mut inner = self.inner.write().expect("table lock");
        let now = Instant::now();
        let expired: Vec<(AgentId, RouteKey)> = inner
            .entries
            .values()
            .filter(|entry| {
                entry.origin != self.local
                    && now.duration_since(entry.last_refresh) > self.route_ttl
            })
            .map(|entry| (entry.origin, entry.key.clone()))
            .collect();
        for (origin, key) in &expired {
            inner.remove_entry(origin, key);
            log::debug!("[routes] reaped {} (origin {})", key, origin.short());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("table lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, for status output and tests.
    pub fn dump(&self) -> Vec<RouteEntry> {
        self.inner.read().expect("table lock").entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> AgentId {
        AgentId::from_bytes([byte; 16])
    }

    fn cidr(s: &str) -> RouteKey {
        RouteKey::Cidr(s.parse().unwrap())
    }

    fn table() -> RoutingTable {
        RoutingTable::new(id(0xaa), Duration::from_secs(300))
    }

    #[test]
    fn test_local_route_has_metric_zero_and_self_next_hop() {
        let table = table();
        table.add_local_route(cidr("10.0.0.0/8"));
        let entry = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(entry.metric, 0);
        assert_eq!(entry.next_hop, table.local_id());
        assert_eq!(entry.origin, table.local_id());
        assert!(entry.path.is_empty());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table();
        let x = id(1);
        let y = id(2);
        table.process_route_advertise(x, x, 1, cidr("10.0.0.0/8"), 5, vec![x]);
        table.process_route_advertise(y, y, 1, cidr("10.1.0.0/16"), 5, vec![y]);

        let entry = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(entry.key, cidr("10.1.0.0/16"));
        assert_eq!(entry.next_hop, y);

        let entry = table.lookup("10.2.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.key, cidr("10.0.0.0/8"));
        assert_eq!(entry.next_hop, x);

        assert!(table.lookup("11.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_equal_prefix_lowest_metric_wins() {
        let table = table();
        let near = id(1);
        let far = id(2);
        table.process_route_advertise(far, id(9), 1, cidr("10.0.0.0/8"), 4, vec![far, id(9)]);
        table.process_route_advertise(near, id(8), 1, cidr("10.0.0.0/8"), 2, vec![near, id(8)]);

        let entry = table.lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.next_hop, near);
        assert_eq!(entry.metric, 2);
    }

    #[test]
    fn test_equal_metric_lowest_next_hop_wins() {
        let table = table();
        table.process_route_advertise(id(5), id(9), 1, cidr("10.0.0.0/8"), 3, vec![id(5)]);
        table.process_route_advertise(id(3), id(8), 1, cidr("10.0.0.0/8"), 3, vec![id(3)]);
        let entry = table.lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.next_hop, id(3));
    }

    #[test]
    fn test_ipv6_longest_prefix() {
        let table = table();
        table.process_route_advertise(id(1), id(1), 1, cidr("2001:db8::/32"), 1, vec![id(1)]);
        table.process_route_advertise(id(2), id(2), 1, cidr("2001:db8:1::/48"), 1, vec![id(2)]);

        let entry = table.lookup("2001:db8:1::5".parse().unwrap()).unwrap();
        assert_eq!(entry.key, cidr("2001:db8:1::/48"));
        let entry = table.lookup("2001:db8:2::5".parse().unwrap()).unwrap();
        assert_eq!(entry.key, cidr("2001:db8::/32"));
    }

    #[test]
    fn test_higher_sequence_supersedes() {
        let table = table();
        let origin = id(9);
        table.process_route_advertise(id(1), origin, 5, cidr("10.0.0.0/8"), 3, vec![id(1)]);
        // Stale generation ignored.
        assert!(!table.process_route_advertise(id(2), origin, 4, cidr("10.0.0.0/8"), 1, vec![id(2)]));
        assert_eq!(table.lookup("10.0.0.1".parse().unwrap()).unwrap().next_hop, id(1));
        // Newer generation wins even with worse metric.
        table.process_route_advertise(id(2), origin, 6, cidr("10.0.0.0/8"), 7, vec![id(2)]);
        let entry = table.lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.next_hop, id(2));
        assert_eq!(entry.metric, 7);
    }

    #[test]
    fn test_equal_sequence_keeps_lower_metric() {
        let table = table();
        let origin = id(9);
        table.process_route_advertise(id(1), origin, 5, cidr("10.0.0.0/8"), 2, vec![id(1)]);
        table.process_route_advertise(id(2), origin, 5, cidr("10.0.0.0/8"), 4, vec![id(2)]);
        assert_eq!(table.lookup("10.0.0.1".parse().unwrap()).unwrap().next_hop, id(1));
        table.process_route_advertise(id(3), origin, 5, cidr("10.0.0.0/8"), 1, vec![id(3)]);
        assert_eq!(table.lookup("10.0.0.1".parse().unwrap()).unwrap().next_hop, id(3));
    }

    #[test]
    fn test_route_uniqueness_per_origin_and_key() {
        let table = table();
        let origin = id(9);
        for sequence in 1..=5 {
            table.process_route_advertise(id(1), origin, sequence, cidr("10.0.0.0/8"), 1, vec![id(1)]);
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_advertise_is_idempotent() {
        let table = table();
        table.process_route_advertise(id(1), id(9), 5, cidr("10.0.0.0/8"), 2, vec![id(1)]);
        let before = table.dump();
        table.process_route_advertise(id(1), id(9), 5, cidr("10.0.0.0/8"), 2, vec![id(1)]);
        let after = table.dump();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].next_hop, after[0].next_hop);
        assert_eq!(before[0].metric, after[0].metric);
    }

    #[test]
    fn test_wildcard_domain_single_label() {
        let table = table();
        table.process_route_advertise(
            id(1),
            id(9),
            1,
            RouteKey::DomainWildcard("internal.corp".into()),
            1,
            vec![id(1)],
        );

        assert!(table.lookup_domain("api.internal.corp").is_some());
        assert!(table.lookup_domain("API.Internal.Corp").is_some());
        assert!(table.lookup_domain("a.b.internal.corp").is_none());
        assert!(table.lookup_domain("internal.corp").is_none());
        assert!(table.lookup_domain("other.corp").is_none());
    }

    #[test]
    fn test_exact_domain_preferred_over_wildcard() {
        let table = table();
        table.process_route_advertise(
            id(1),
            id(8),
            1,
            RouteKey::DomainWildcard("internal.corp".into()),
            1,
            vec![id(1)],
        );
        table.process_route_advertise(
            id(2),
            id(9),
            1,
            RouteKey::DomainExact("api.internal.corp".into()),
            5,
            vec![id(2)],
        );
        let entry = table.lookup_domain("api.internal.corp").unwrap();
        assert_eq!(entry.next_hop, id(2));
    }

    #[test]
    fn test_forward_and_agent_lookup() {
        let table = table();
        table.process_route_advertise(id(1), id(9), 1, RouteKey::Forward("jump".into()), 2, vec![id(1)]);
        table.process_route_advertise(id(1), id(9), 1, RouteKey::Agent(id(9)), 2, vec![id(1)]);

        assert_eq!(table.lookup_forward("jump").unwrap().next_hop, id(1));
        assert!(table.lookup_forward("other").is_none());
        assert_eq!(table.lookup_agent(id(9)).unwrap().next_hop, id(1));
        assert!(table.lookup_agent(id(7)).is_none());
    }

    #[test]
    fn test_withdraw_removes_all_listed_keys() {
        let table = table();
        let origin = id(9);
        table.process_route_advertise(id(1), origin, 1, cidr("10.0.0.0/8"), 1, vec![id(1)]);
        table.process_route_advertise(id(1), origin, 1, cidr("192.168.0.0/16"), 1, vec![id(1)]);
        assert_eq!(table.len(), 2);

        let removed =
            table.process_route_withdraw(origin, &[cidr("10.0.0.0/8"), cidr("192.168.0.0/16")]);
        assert_eq!(removed, 2);
        assert!(table.is_empty());
        assert!(table.lookup("10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_withdraw_only_touches_named_origin() {
        let table = table();
        table.process_route_advertise(id(1), id(8), 1, cidr("10.0.0.0/8"), 1, vec![id(1)]);
        table.process_route_advertise(id(2), id(9), 1, cidr("10.0.0.0/8"), 2, vec![id(2)]);
        table.process_route_withdraw(id(8), &[cidr("10.0.0.0/8")]);
        let entry = table.lookup("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(entry.origin, id(9));
    }

    #[test]
    fn test_reaper_spares_local_routes() {
        let table = RoutingTable::new(id(0xaa), Duration::from_millis(0));
        table.add_local_route(cidr("10.0.0.0/8"));
        table.process_route_advertise(id(1), id(9), 1, cidr("192.168.0.0/16"), 1, vec![id(1)]);

        std::thread::sleep(Duration::from_millis(5));
        let reaped = table.reap_expired();
        assert_eq!(reaped, 1);
        assert!(table.lookup("10.0.0.1".parse().unwrap()).is_some());
        assert!(table.lookup("192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_split_horizon_for_full_advertise() {
        let table = table();
        let via_b = id(2);
        let via_c = id(3);
        table.process_route_advertise(via_b, id(9), 1, cidr("10.0.0.0/8"), 2, vec![via_b, id(9)]);
        table.process_route_advertise(via_c, id(8), 1, cidr("172.16.0.0/12"), 2, vec![via_c, id(8)]);
        table.add_local_route(cidr("192.168.0.0/16"));

        let grouped = table.routes_for_full_advertise(via_b);
        // Routes that travelled through via_b are suppressed toward it.
        assert!(!grouped.contains_key(&id(9)));
        assert!(grouped.contains_key(&id(8)));
        assert!(grouped.contains_key(&table.local_id()));
    }

    #[test]
    fn test_wire_roundtrip_of_keys() {
        let keys = vec![
            cidr("10.0.0.0/8"),
            cidr("2001:db8::/32"),
            RouteKey::DomainExact("example.com".into()),
            RouteKey::DomainWildcard("internal.corp".into()),
            RouteKey::Forward("jump".into()),
            RouteKey::Agent(id(7)),
        ];
        for key in keys {
            let wire = key.to_wire(3);
            let (parsed, metric) = RouteKey::from_wire(&wire).unwrap();
            assert_eq!(parsed, key);
            assert_eq!(metric, 3);
        }
    }
}
