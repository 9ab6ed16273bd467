//! # Rill
//!
//! The core of a system-wide DNS stub resolver: a per-network answer cache
//! with single-flight coordination, a retry/timeout/transport send engine,
//! and a private DNS (DNS-over-TLS) policy controller.
//!
//! The host configures networks through [`Resolver`] and calls
//! [`Resolver::query`] with raw DNS query packets on behalf of
//! applications. Everything the resolver cannot do itself - TLS transport,
//! socket accounting, event reporting - is injected through traits at
//! construction time.
//!
//! ```no_run
//! use rill::{Resolver, ResolverParams, QueryContext, LookupFlags};
//!
//! let resolver = Resolver::builder().build();
//! resolver.create_cache_for_net(30)?;
//! resolver.set_resolvers(
//!     30,
//!     &["8.8.8.8".to_string()],
//!     &[],
//!     ResolverParams::default(),
//! )?;
//!
//! let query: &[u8] = todo!("a raw DNS query packet");
//! let mut answer = [0u8; 4096];
//! let result = resolver.query(
//!     &QueryContext::new(30),
//!     query,
//!     &mut answer,
//!     LookupFlags::empty(),
//! );
//! # Ok::<(), rill::CacheError>(())
//! ```

use std::sync::Arc;
use tracing::debug;

pub use rill_cache::{
    CacheError, CacheStatus, LookupFlags, NameserverConfig, ResolverParams, StatsSnapshot,
};
pub use rill_proto::{ResponseCode, HEADER_SIZE};
pub use rill_dot::{
    DotResponse, DotServer, DotTransport, Error as PrivateDnsError, PrivateDnsMode,
    PrivateDnsStatus, Validation, ValidationListener,
};
pub use rill_resolver::{
    EventSink, IpVersion, NetContextFlags, NetworkEvent, Protocol, QueryAnswer, QueryContext,
    QueryEvent, ResolveError, SocketTagger,
};

use rill_cache::Registry;
use rill_dot::{NullListener, PrivateDnsController, UnreachableTransport};
use rill_resolver::{NoopTagger, NullEventSink, QueryEngine};

/// The resolver core: registry, private DNS controller and send engine,
/// wired together.
pub struct Resolver {
    registry: Arc<Registry>,
    private_dns: Arc<PrivateDnsController>,
    engine: QueryEngine,
}

/// Assembles a [`Resolver`] with its external collaborators. Every
/// collaborator has a no-op default, so a cleartext-only resolver needs no
/// configuration at all.
pub struct Builder {
    transport: Arc<dyn DotTransport>,
    listener: Arc<dyn ValidationListener>,
    tagger: Arc<dyn SocketTagger>,
    events: Arc<dyn EventSink>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            transport: Arc::new(UnreachableTransport),
            listener: Arc::new(NullListener),
            tagger: Arc::new(NoopTagger),
            events: Arc::new(NullEventSink),
        }
    }
}

impl Builder {
    /// Sets the DNS-over-TLS transport.
    pub fn dot_transport(mut self, transport: Arc<dyn DotTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the receiver for private DNS validation events.
    pub fn validation_listener(mut self, listener: Arc<dyn ValidationListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Sets the socket accounting callback.
    pub fn socket_tagger(mut self, tagger: Arc<dyn SocketTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    /// Sets the query event receiver.
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds the resolver.
    pub fn build(self) -> Resolver {
        let registry = Arc::new(Registry::new());
        let private_dns = Arc::new(PrivateDnsController::new(self.transport, self.listener));
        let engine = QueryEngine::new(
            Arc::clone(&registry),
            Arc::clone(&private_dns),
            self.tagger,
            self.events,
        );
        Resolver {
            registry,
            private_dns,
            engine,
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Resolver {
    /// Starts building a resolver.
    pub fn builder() -> Builder {
        Builder::default()
    }

    // Network lifecycle

    /// Creates the cache for a network. Fails if one already exists.
    pub fn create_cache_for_net(&self, netid: u32) -> Result<(), CacheError> {
        self.registry.create_network(netid)
    }

    /// Tears down a network: cache, nameservers and private DNS state.
    pub fn delete_cache_for_net(&self, netid: u32) {
        self.registry.delete_network(netid);
        self.private_dns.clear(netid);
    }

    /// Empties a network's cache without touching its configuration.
    pub fn flush_cache_for_net(&self, netid: u32) -> Result<(), CacheError> {
        self.registry.flush_network(netid)
    }

    /// Network ids with a live cache.
    pub fn list_caches(&self) -> Vec<u32> {
        self.registry.list_networks()
    }

    /// Returns true if the network has a cache.
    pub fn has_cache(&self, netid: u32) -> bool {
        self.registry.contains(netid)
    }

    /// Returns true if the network has at least one nameserver.
    pub fn has_nameservers(&self, netid: u32) -> bool {
        self.registry.has_nameservers(netid)
    }

    // Configuration

    /// Installs the nameserver list, search domains and parameters for a
    /// network.
    pub fn set_resolvers(
        &self,
        netid: u32,
        servers: &[String],
        domains: &[String],
        params: ResolverParams,
    ) -> Result<(), CacheError> {
        self.registry.set_nameservers(netid, servers, domains, params)
    }

    /// Applies a network's private DNS configuration.
    pub fn set_private_dns(
        &self,
        netid: u32,
        mark: u32,
        servers: &[String],
        name: &str,
        ca_cert: &str,
        connect_timeout_ms: i32,
    ) -> Result<(), PrivateDnsError> {
        self.private_dns
            .set(netid, mark, servers, name, ca_cert, connect_timeout_ms)
    }

    /// Snapshot of a network's private DNS mode and server states.
    pub fn private_dns_status(&self, netid: u32) -> PrivateDnsStatus {
        self.private_dns.status(netid)
    }

    // Resolution

    /// Resolves a raw DNS query packet; the answer is written into
    /// `answer`.
    pub fn query(
        &self,
        ctx: &QueryContext,
        msg: &[u8],
        answer: &mut [u8],
        flags: LookupFlags,
    ) -> Result<QueryAnswer, ResolveError> {
        debug!(netid = ctx.netid, len = msg.len(), "resolving query");
        self.engine.send(ctx, msg, answer, flags)
    }

    // Cache operations for front-ends that drive their own exchanges

    /// Probes the cache for a query's answer; see
    /// [`CacheStatus`] for the single-flight contract.
    pub fn cache_lookup(
        &self,
        netid: u32,
        query: &[u8],
        answer: &mut [u8],
        flags: LookupFlags,
    ) -> CacheStatus {
        self.registry.lookup(netid, query, answer, flags)
    }

    /// Admits an answer for a query previously reported `NotFound`.
    pub fn cache_add(&self, netid: u32, query: &[u8], answer: &[u8]) -> Result<(), CacheError> {
        self.registry.add(netid, query, answer)
    }

    /// Reports that a query could not be resolved, releasing its waiters.
    pub fn cache_query_failed(&self, netid: u32, query: &[u8], flags: LookupFlags) {
        self.registry.query_failed(netid, query, flags)
    }

    // Diagnostics

    /// Reachability statistics snapshot for a network.
    pub fn resolver_stats(&self, netid: u32) -> Result<StatsSnapshot, CacheError> {
        self.registry.stats_snapshot(netid)
    }

    /// Absolute expiry of a cached answer.
    pub fn cache_entry_expiration(&self, netid: u32, query: &[u8]) -> Result<u64, CacheError> {
        self.registry.entry_expiration(netid, query)
    }

    /// Sampling denominator for an event with the given return code.
    pub fn event_subsampling_denom(&self, netid: u32, return_code: i32) -> u32 {
        self.registry.subsampling_denom(netid, return_code)
    }

    /// Renders a network's subsampling map for diagnostics.
    pub fn dump_event_subsampling_map(&self, netid: u32) -> Vec<String> {
        self.registry.dump_subsampling_map(netid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let resolver = Resolver::builder().build();
        resolver.create_cache_for_net(30).unwrap();
        assert!(resolver.has_cache(30));
        assert!(!resolver.has_nameservers(30));
        assert_eq!(resolver.list_caches(), vec![30]);

        assert_eq!(
            resolver.create_cache_for_net(30),
            Err(CacheError::NetworkExists { netid: 30 })
        );

        resolver.delete_cache_for_net(30);
        assert!(!resolver.has_cache(30));
    }

    #[test]
    fn test_delete_clears_private_dns() {
        let resolver = Resolver::builder().build();
        resolver.create_cache_for_net(30).unwrap();
        resolver
            .set_private_dns(30, 0, &["1.1.1.1".to_string()], "", "", 0)
            .unwrap();
        assert_eq!(
            resolver.private_dns_status(30).mode,
            PrivateDnsMode::Opportunistic
        );

        resolver.delete_cache_for_net(30);
        assert_eq!(resolver.private_dns_status(30).mode, PrivateDnsMode::Off);
    }
}
