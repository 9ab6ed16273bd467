//! The per-network registry.
//!
//! One process-wide table keyed by network id. Each network owns its answer
//! cache, nameserver list, search domains, resolver parameters, per-server
//! sample rings and subsampling map. A single mutex guards the whole table;
//! one condition variable, shared by all caches, wakes single-flight
//! waiters on admission, failure or flush.
//!
//! Nothing here performs I/O, and no lock is ever held across a blocking
//! operation other than the single-flight wait itself.

use crate::cache::Cache;
use crate::config::{
    ResolverParams, DNS_PORT, MAXDNSRCH, MAXDNSRCHPATH, MAXNS, MAX_CACHE_ENTRIES,
    PENDING_REQUEST_TIMEOUT,
};
use crate::stats::{Sample, ServerStats};
use crate::subsample::{SubsamplingMap, DEFAULT_SUBSAMPLING_MAP};
use crate::{unix_now, CacheError, CacheStatus, LookupFlags};
use parking_lot::{Condvar, Mutex};
use rill_proto::{query, ttl};
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of a network's server configuration, taken by the send engine
/// before it starts a query loop.
#[derive(Debug, Clone)]
pub struct NameserverConfig {
    /// Configured servers, in order.
    pub servers: SmallVec<[SocketAddr; MAXNS]>,

    /// Search domains, duplicates removed.
    pub search_domains: Vec<String>,

    /// Resolver parameters with defaults applied.
    pub params: ResolverParams,

    /// Fence for stats writes; bumped when the server set or the sample
    /// window changes.
    pub revision_id: u32,
}

/// Snapshot of a network's reachability statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Revision the stats belong to.
    pub revision_id: u32,

    /// Configured servers, in order.
    pub servers: SmallVec<[SocketAddr; MAXNS]>,

    /// Sample rings, index-aligned with `servers`.
    pub stats: [ServerStats; MAXNS],

    /// Resolver parameters with defaults applied.
    pub params: ResolverParams,

    /// How many single-flight waits have expired on this network.
    pub pending_request_timeouts: u32,
}

struct NetworkState {
    cache: Cache,
    nameservers: Vec<String>,
    ns_addrs: SmallVec<[SocketAddr; MAXNS]>,
    search_domains: Vec<String>,
    params: ResolverParams,
    stats: [ServerStats; MAXNS],
    revision_id: u32,
    pending_timeout_count: u32,
    subsampling: SubsamplingMap,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            cache: Cache::new(MAX_CACHE_ENTRIES),
            nameservers: Vec::new(),
            ns_addrs: SmallVec::new(),
            search_domains: Vec::new(),
            params: ResolverParams::default(),
            stats: Default::default(),
            revision_id: 0,
            pending_timeout_count: 0,
            subsampling: SubsamplingMap::parse(DEFAULT_SUBSAMPLING_MAP),
        }
    }

    fn clear_stats(&mut self) {
        for stats in &mut self.stats {
            stats.clear();
        }
    }
}

/// Process-wide registry of per-network resolver state.
pub struct Registry {
    networks: Mutex<HashMap<u32, NetworkState>>,
    cond: Condvar,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Creates the cache for a network. Fails if one already exists.
    pub fn create_network(&self, netid: u32) -> Result<(), CacheError> {
        let mut networks = self.networks.lock();
        if networks.contains_key(&netid) {
            return Err(CacheError::NetworkExists { netid });
        }
        networks.insert(netid, NetworkState::new());
        info!(netid, "cache created");
        Ok(())
    }

    /// Tears down a network. Blocked single-flight waiters observe the
    /// missing cache on wake-up and give up.
    pub fn delete_network(&self, netid: u32) {
        let mut networks = self.networks.lock();
        if networks.remove(&netid).is_some() {
            info!(netid, "cache deleted");
            self.cond.notify_all();
        }
    }

    /// Empties a network's cache and releases its pending markers.
    pub fn flush_network(&self, netid: u32) -> Result<(), CacheError> {
        let mut networks = self.networks.lock();
        let net = networks
            .get_mut(&netid)
            .ok_or(CacheError::NoSuchNetwork { netid })?;
        net.cache.flush();
        self.cond.notify_all();
        Ok(())
    }

    /// Network ids with a live cache.
    pub fn list_networks(&self) -> Vec<u32> {
        self.networks.lock().keys().copied().collect()
    }

    /// Returns true if the network has a cache.
    pub fn contains(&self, netid: u32) -> bool {
        self.networks.lock().contains_key(&netid)
    }

    /// Returns true if the network has at least one nameserver configured.
    pub fn has_nameservers(&self, netid: u32) -> bool {
        self.networks
            .lock()
            .get(&netid)
            .map(|net| !net.ns_addrs.is_empty())
            .unwrap_or(false)
    }

    /// Installs the nameserver list, search domains and parameters for a
    /// network.
    ///
    /// Addresses are parsed before any state is touched; a parse failure
    /// leaves the network exactly as it was. A changed server set (compared
    /// as an unordered set) or a changed sample-window size clears the
    /// reachability stats and bumps the revision id so that in-flight
    /// sample writes land on the floor.
    pub fn set_nameservers(
        &self,
        netid: u32,
        servers: &[String],
        domains: &[String],
        params: ResolverParams,
    ) -> Result<(), CacheError> {
        let mut servers = servers.to_vec();
        if servers.len() > MAXNS {
            warn!(count = servers.len(), "too many servers, truncating");
            servers.truncate(MAXNS);
        }

        let mut addrs: SmallVec<[SocketAddr; MAXNS]> = SmallVec::new();
        for server in &servers {
            let addr = parse_server(server, DNS_PORT).ok_or_else(|| {
                debug!(server = server.as_str(), "failed to parse nameserver");
                CacheError::InvalidServer {
                    address: server.clone(),
                }
            })?;
            addrs.push(addr);
        }
        let domains = filter_domains(domains);
        let params = params.normalized();

        let mut networks = self.networks.lock();
        let net = networks
            .get_mut(&netid)
            .ok_or(CacheError::NoSuchNetwork { netid })?;

        let old_max_samples = net.params.max_samples;
        net.params = params;
        if !same_server_set(&net.nameservers, &servers) {
            info!(netid, count = servers.len(), "installing new nameservers");
            net.nameservers = servers;
            net.ns_addrs = addrs;
            // The sample-to-server mapping changed with the list, and the
            // revision fence keeps stale in-flight writes out.
            net.clear_stats();
            net.revision_id += 1;
        } else if net.params.max_samples != old_max_samples {
            // Re-shaping the ring in place is not worth the bookkeeping;
            // samples only feed aggregation, so they are simply dropped.
            net.clear_stats();
            net.revision_id += 1;
        }

        // Search paths always follow the caller. The cache stays intact:
        // entries are keyed on the full QNAME, domain included.
        net.search_domains = domains;
        Ok(())
    }

    /// Probes the cache for a query's answer.
    ///
    /// On a miss the caller either becomes the producer for this
    /// fingerprint (`NotFound`) or blocks until the current producer
    /// finishes or the guard timer expires.
    pub fn lookup(
        &self,
        netid: u32,
        key: &[u8],
        answer: &mut [u8],
        flags: LookupFlags,
    ) -> CacheStatus {
        if flags.contains(LookupFlags::NO_CACHE_LOOKUP) {
            return if flags.contains(LookupFlags::NO_CACHE_STORE) {
                CacheStatus::Skip
            } else {
                CacheStatus::NotFound
            };
        }
        if !query::validate_query(key) {
            debug!("unsupported query");
            return CacheStatus::Unsupported;
        }
        let hash = query::fingerprint(key);

        let mut networks = self.networks.lock();
        {
            let Some(net) = networks.get_mut(&netid) else {
                return CacheStatus::Unsupported;
            };
            if let Some(idx) = net.cache.probe(hash, key) {
                return copy_out(net, idx, answer);
            }
            debug!(netid, hash, "not in cache");
            if flags.contains(LookupFlags::NO_CACHE_STORE) {
                return CacheStatus::Skip;
            }
            if !net.cache.has_pending(hash) {
                net.cache.add_pending(hash);
                return CacheStatus::NotFound;
            }
        }

        // Another thread is resolving this query; wait for its verdict.
        debug!(netid, hash, "waiting for in-flight request");
        let deadline = Instant::now() + PENDING_REQUEST_TIMEOUT;
        let mut timed_out = false;
        loop {
            match networks.get(&netid) {
                // Torn down while we slept.
                None => return CacheStatus::NotFound,
                Some(net) if !net.cache.has_pending(hash) => break,
                Some(_) => {}
            }
            if self.cond.wait_until(&mut networks, deadline).timed_out() {
                timed_out = true;
                break;
            }
        }
        if timed_out {
            warn!(netid, hash, "gave up waiting for in-flight request");
            if let Some(net) = networks.get_mut(&netid) {
                net.pending_timeout_count += 1;
            }
        }

        let Some(net) = networks.get_mut(&netid) else {
            return CacheStatus::NotFound;
        };
        match net.cache.probe(hash, key) {
            Some(idx) => copy_out(net, idx, answer),
            None => CacheStatus::NotFound,
        }
    }

    /// Admits an answer for a previously missed query and wakes every
    /// thread waiting on its fingerprint.
    ///
    /// An answer whose TTL works out to zero is not stored, but the pending
    /// marker is still released.
    pub fn add(&self, netid: u32, key: &[u8], answer: &[u8]) -> Result<(), CacheError> {
        if !query::validate_query(key) {
            debug!("attempted to cache an invalid query");
            return Err(CacheError::UnsupportedQuery);
        }
        let hash = query::fingerprint(key);

        let mut networks = self.networks.lock();
        let net = networks
            .get_mut(&netid)
            .ok_or(CacheError::NoSuchNetwork { netid })?;

        if net.cache.probe(hash, key).is_some() {
            debug!(netid, hash, "already in cache, ignoring add");
            if net.cache.clear_pending(hash) {
                self.cond.notify_all();
            }
            return Err(CacheError::AlreadyCached);
        }

        let now = unix_now();
        if net.cache.is_full() {
            net.cache.remove_expired(now);
            if net.cache.is_full() {
                net.cache.remove_oldest();
            }
            // Eviction re-spliced the chains; probe again before linking.
            if net.cache.probe(hash, key).is_some() {
                if net.cache.clear_pending(hash) {
                    self.cond.notify_all();
                }
                return Err(CacheError::AlreadyCached);
            }
        }

        let ttl = ttl::answer_ttl(answer);
        debug!(netid, hash, ttl, "admitting answer");
        if ttl > 0 {
            net.cache.insert(hash, key, answer, now + u64::from(ttl));
        }
        if net.cache.clear_pending(hash) {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Reports that the query could not be resolved: the pending marker is
    /// released without an admission so waiters can take over.
    ///
    /// Suppressed when the flags opted out of caching; no marker was taken
    /// in that case.
    pub fn query_failed(&self, netid: u32, key: &[u8], flags: LookupFlags) {
        if flags.intersects(LookupFlags::NO_CACHE_STORE | LookupFlags::NO_CACHE_LOOKUP) {
            return;
        }
        if !query::validate_query(key) {
            return;
        }
        let hash = query::fingerprint(key);

        let mut networks = self.networks.lock();
        if let Some(net) = networks.get_mut(&netid) {
            if net.cache.clear_pending(hash) {
                debug!(netid, hash, "query failed, releasing waiters");
                self.cond.notify_all();
            }
        }
    }

    /// Server list and parameters for the send engine.
    pub fn nameserver_config(&self, netid: u32) -> Option<NameserverConfig> {
        let networks = self.networks.lock();
        let net = networks.get(&netid)?;
        Some(NameserverConfig {
            servers: net.ns_addrs.clone(),
            search_domains: net.search_domains.clone(),
            params: net.params,
            revision_id: net.revision_id,
        })
    }

    /// Reachability statistics snapshot for the send engine.
    pub fn stats_snapshot(&self, netid: u32) -> Result<StatsSnapshot, CacheError> {
        let networks = self.networks.lock();
        let net = networks
            .get(&netid)
            .ok_or(CacheError::NoSuchNetwork { netid })?;
        if net.ns_addrs.len() > MAXNS {
            return Err(CacheError::InconsistentServers { netid });
        }
        Ok(StatsSnapshot {
            revision_id: net.revision_id,
            servers: net.ns_addrs.clone(),
            stats: net.stats.clone(),
            params: net.params,
            pending_request_timeouts: net.pending_timeout_count,
        })
    }

    /// Records a reachability sample for one server, provided the caller's
    /// view of the configuration is still current.
    pub fn add_sample(
        &self,
        netid: u32,
        revision_id: u32,
        server_index: usize,
        sample: Sample,
        max_samples: usize,
    ) {
        if max_samples == 0 || server_index >= MAXNS {
            return;
        }
        let mut networks = self.networks.lock();
        if let Some(net) = networks.get_mut(&netid) {
            if net.revision_id == revision_id {
                net.stats[server_index].push(sample, max_samples);
            } else {
                debug!(netid, revision_id, "discarding stale stats sample");
            }
        }
    }

    /// Sampling denominator for an event with the given return code.
    /// 0 means the event should not be logged at all.
    pub fn subsampling_denom(&self, netid: u32, return_code: i32) -> u32 {
        self.networks
            .lock()
            .get(&netid)
            .map(|net| net.subsampling.denom(return_code))
            .unwrap_or(0)
    }

    /// Renders a network's subsampling map for diagnostics.
    pub fn dump_subsampling_map(&self, netid: u32) -> Vec<String> {
        self.networks
            .lock()
            .get(&netid)
            .map(|net| net.subsampling.dump())
            .unwrap_or_default()
    }

    /// Absolute expiry of a cached answer. Test and diagnostics helper.
    pub fn entry_expiration(&self, netid: u32, key: &[u8]) -> Result<u64, CacheError> {
        if !query::validate_query(key) {
            return Err(CacheError::UnsupportedQuery);
        }
        let hash = query::fingerprint(key);
        let networks = self.networks.lock();
        let net = networks
            .get(&netid)
            .ok_or(CacheError::NoSuchNetwork { netid })?;
        let idx = net.cache.probe(hash, key).ok_or(CacheError::NotCached)?;
        let expires = net.cache.expires(idx);
        if unix_now() >= expires {
            return Err(CacheError::NotCached);
        }
        Ok(expires)
    }
}

fn copy_out(net: &mut NetworkState, idx: u32, answer: &mut [u8]) -> CacheStatus {
    if unix_now() >= net.cache.expires(idx) {
        debug!("stale entry discarded");
        net.cache.remove(idx);
        return CacheStatus::NotFound;
    }
    let len = {
        let data = net.cache.answer(idx);
        if data.len() > answer.len() {
            debug!(
                answer_len = data.len(),
                buffer_len = answer.len(),
                "cached answer too long for caller buffer"
            );
            return CacheStatus::Unsupported;
        }
        answer[..data.len()].copy_from_slice(data);
        data.len()
    };
    net.cache.touch(idx);
    debug!("found in cache");
    CacheStatus::Found(len)
}

/// Parses a numeric server address, with an optional explicit port.
fn parse_server(server: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Some(addr);
    }
    server
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

/// Keeps valid domains without duplicates, limited to [`MAXDNSRCH`].
fn filter_domains(domains: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out: Vec<String> = domains
        .iter()
        .filter(|d| d.len() <= MAXDNSRCHPATH - 1 && seen.insert(d.as_str()))
        .cloned()
        .collect();
    if out.len() > MAXDNSRCH {
        warn!(count = out.len(), "too many search domains, truncating");
        out.truncate(MAXDNSRCH);
    }
    out
}

/// Order-insensitive comparison of two server lists.
fn same_server_set(old: &[String], new: &[String]) -> bool {
    let old: BTreeSet<&str> = old.iter().map(String::as_str).collect();
    let new: BTreeSet<&str> = new.iter().map(String::as_str).collect();
    old == new
}
