//! The query loop.
//!
//! `send` is the whole life of one query: probe the cache, try private
//! DNS, then walk the usable cleartext servers for up to `retry_count`
//! passes, switching to the stream transport on truncation. Success admits
//! the answer to the cache; every failure path reports the failure so that
//! single-flight waiters are released.

use crate::event::{EventSink, IpVersion, NetworkEvent, Protocol, QueryEvent};
use crate::socket::SocketTagger;
use crate::tcp::{self, StreamOutcome};
use crate::udp::{self, DatagramOutcome, DatagramSockets};
use crate::{NetContextFlags, QueryContext, ResolveError, Result};
use rill_cache::stats::usable_servers;
use rill_cache::{CacheStatus, LookupFlags, Registry, Sample};
use rill_dot::{DotQueryResult, PrivateDnsController};
use rill_proto::rcode::{RCODE_INTERNAL_ERROR, RCODE_TIMEOUT};
use rill_proto::{header, query, HEADER_SIZE, MAX_UDP_PAYLOAD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A resolved answer: its length in the caller's buffer and its response
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryAnswer {
    pub len: usize,
    pub rcode: u8,
}

/// Outcome of one attempt inside the server loop.
enum Attempt {
    Answered(usize, u8),
    NextServer,
    SameServerTcp,
    Fatal(std::io::Error),
}

/// Resolves raw DNS queries against a network's configured servers.
pub struct QueryEngine {
    registry: Arc<Registry>,
    private_dns: Arc<PrivateDnsController>,
    tagger: Arc<dyn SocketTagger>,
    events: Arc<dyn EventSink>,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<Registry>,
        private_dns: Arc<PrivateDnsController>,
        tagger: Arc<dyn SocketTagger>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            private_dns,
            tagger,
            events,
        }
    }

    /// Drives `query` to an answer, which is written into `answer`.
    pub fn send(
        &self,
        ctx: &QueryContext,
        query: &[u8],
        answer: &mut [u8],
        flags: LookupFlags,
    ) -> Result<QueryAnswer> {
        if answer.len() < HEADER_SIZE {
            return Err(ResolveError::BufferTooSmall);
        }
        let query_type = query::query_type(query);
        let mut net_event = NetworkEvent::new(ctx.netid);

        let cache_started = Instant::now();
        let cache_status = self.registry.lookup(ctx.netid, query, answer, flags);
        if let CacheStatus::Found(len) = cache_status {
            let rcode = header::rcode(&answer[..len]).unwrap_or(0);
            net_event.queries.push(QueryEvent {
                cache_status,
                latency: cache_started.elapsed(),
                server_index: None,
                ip_version: None,
                protocol: None,
                retry_index: 0,
                rcode,
                query_type,
            });
            self.events.on_network_event(&net_event);
            return Ok(QueryAnswer { len, rcode });
        }

        let Some(config) = self.registry.nameserver_config(ctx.netid) else {
            self.registry.query_failed(ctx.netid, query, flags);
            return Err(ResolveError::NoServers);
        };
        if config.servers.is_empty() {
            // Fail fast and release any waiters; otherwise everyone asking
            // this question blocks for the full pending-request timeout.
            debug!(netid = ctx.netid, "no nameservers configured");
            self.registry.query_failed(ctx.netid, query, flags);
            return Err(ResolveError::NoServers);
        }

        // Private DNS comes first unless the caller pinned the network's
        // cleartext servers.
        if !ctx.flags.contains(NetContextFlags::USE_LOCAL_NAMESERVERS) {
            net_event.private_dns_mode = Some(self.private_dns.mode(ctx.netid));
            let dot_started = Instant::now();
            match self.private_dns.query(ctx.netid, query, answer) {
                DotQueryResult::Answer { len, rcode } if len > 0 => {
                    debug!(netid = ctx.netid, "got answer over TLS");
                    if cache_status == CacheStatus::NotFound {
                        let _ = self.registry.add(ctx.netid, query, &answer[..len]);
                    }
                    net_event.queries.push(QueryEvent {
                        cache_status,
                        latency: dot_started.elapsed(),
                        server_index: None,
                        ip_version: None,
                        protocol: Some(Protocol::Dot),
                        retry_index: 0,
                        rcode,
                        query_type,
                    });
                    self.events.on_network_event(&net_event);
                    return Ok(QueryAnswer { len, rcode });
                }
                DotQueryResult::Answer { .. } | DotQueryResult::NetworkError => {
                    self.registry.query_failed(ctx.netid, query, flags);
                    self.events.on_network_event(&net_event);
                    return Err(ResolveError::Timeout);
                }
                DotQueryResult::Fallback => {}
            }
        }

        let Ok(snapshot) = self.registry.stats_snapshot(ctx.netid) else {
            self.registry.query_failed(ctx.netid, query, flags);
            return Err(ResolveError::NoServers);
        };
        let servers: Vec<SocketAddr> = snapshot.servers.to_vec();
        if servers.is_empty() {
            self.registry.query_failed(ctx.netid, query, flags);
            return Err(ResolveError::NoServers);
        }
        let params = snapshot.params;
        let revision_id = snapshot.revision_id;

        let mut stats = snapshot.stats;
        let (mut usable, usable_count) =
            usable_servers(&params, &mut stats[..servers.len()], now_secs());

        let query_id = header::message_id(query).unwrap_or(0);
        if flags.contains(LookupFlags::NO_RETRY) && usable_count > 1 {
            // Pin one server, chosen by the query id so that identical
            // retries from the caller land on the same one.
            let selected = (query_id as usize % usable_count) + 1;
            restrict_to_usable(selected, &mut usable);
        }

        let retry_times = if flags.contains(LookupFlags::NO_RETRY) {
            1
        } else {
            params.retry_count
        };
        let mut use_tcp = query.len() > MAX_UDP_PAYLOAD;
        let mut got_somewhere = false;
        let mut dgram = DatagramSockets::new(servers.len());

        let mut attempt = 0;
        while attempt < retry_times {
            let mut ns = 0;
            while ns < servers.len() {
                if !usable[ns] {
                    ns += 1;
                    continue;
                }
                let server = servers[ns];
                debug!(server = %server, ns, attempt, use_tcp, "querying nameserver");

                let record_stats = attempt == 0;
                let retry_index = attempt;
                let started = Instant::now();
                let timeout = attempt_timeout(params.base_timeout_msec, ns, servers.len());

                let mut rcode = RCODE_INTERNAL_ERROR;
                let protocol;
                let result = if use_tcp {
                    protocol = Protocol::Tcp;
                    // At most one pass over the servers on the stream
                    // transport.
                    attempt = retry_times;
                    match tcp::exchange(ctx, server, query, answer, timeout, self.tagger.as_ref())
                    {
                        StreamOutcome::Answer { len, rcode: r } => {
                            rcode = r;
                            Attempt::Answered(len, r)
                        }
                        StreamOutcome::Abandon { rcode: r } => {
                            rcode = r.unwrap_or(RCODE_INTERNAL_ERROR);
                            Attempt::NextServer
                        }
                        StreamOutcome::Fatal(err) => Attempt::Fatal(err),
                    }
                } else {
                    protocol = Protocol::Udp;
                    match udp::exchange(
                        &mut dgram,
                        ctx,
                        &servers,
                        ns,
                        query,
                        answer,
                        timeout,
                        self.tagger.as_ref(),
                    ) {
                        DatagramOutcome::Answer { len, rcode: r } => {
                            rcode = r;
                            Attempt::Answered(len, r)
                        }
                        DatagramOutcome::Timeout => {
                            rcode = RCODE_TIMEOUT;
                            got_somewhere = true;
                            Attempt::NextServer
                        }
                        DatagramOutcome::RetryTcp => Attempt::SameServerTcp,
                        DatagramOutcome::Abandon { rcode: r, responded } => {
                            rcode = r.unwrap_or(RCODE_INTERNAL_ERROR);
                            got_somewhere |= responded;
                            Attempt::NextServer
                        }
                        DatagramOutcome::Fatal(err) => Attempt::Fatal(err),
                    }
                };

                let latency = started.elapsed();
                let event = QueryEvent {
                    cache_status,
                    latency,
                    server_index: Some(ns),
                    ip_version: Some(IpVersion::of(&server)),
                    protocol: Some(protocol),
                    retry_index,
                    rcode,
                    query_type,
                };
                net_event.queries.push(event.clone());

                // Only the first pass feeds the reachability stats, so a
                // query that deterministically fails does not poison every
                // server's record.
                if record_stats {
                    let sample = Sample {
                        at: now_secs(),
                        rcode,
                        rtt_ms: latency.as_millis() as u32,
                    };
                    self.registry.add_sample(
                        ctx.netid,
                        revision_id,
                        ns,
                        sample,
                        params.max_samples as usize,
                    );
                    self.events.on_query_event(ctx.netid, server, &event);
                }

                match result {
                    Attempt::Answered(len, rcode) => {
                        debug!(server = %server, len, rcode, "got answer");
                        if cache_status == CacheStatus::NotFound {
                            let _ = self.registry.add(ctx.netid, query, &answer[..len]);
                        }
                        self.events.on_network_event(&net_event);
                        return Ok(QueryAnswer { len, rcode });
                    }
                    Attempt::SameServerTcp => {
                        use_tcp = true;
                        // Same server again, over the stream transport.
                    }
                    Attempt::NextServer => {
                        ns += 1;
                    }
                    Attempt::Fatal(err) => {
                        self.registry.query_failed(ctx.netid, query, flags);
                        self.events.on_network_event(&net_event);
                        return Err(ResolveError::Transport(err));
                    }
                }
            }
            attempt += 1;
        }

        if dgram.edns0_error {
            debug!(netid = ctx.netid, "a server rejected this query's EDNS0 use");
        }
        self.registry.query_failed(ctx.netid, query, flags);
        self.events.on_network_event(&net_event);
        if use_tcp || got_somewhere {
            Err(ResolveError::Timeout)
        } else {
            Err(ResolveError::ConnectionRefused)
        }
    }
}

/// Timeout for the attempt against server `ns`, scaled by server index.
/// With 4 servers and the 5 s default this yields 5 s, 2.5 s, 5 s, 10 s.
fn attempt_timeout(base_timeout_msec: u32, ns: usize, server_count: usize) -> Duration {
    let mut msec = base_timeout_msec << ns;
    if ns > 0 {
        msec /= server_count as u32;
    }
    // Floor regardless of configuration.
    if msec < 1000 {
        msec = 1000;
    }
    debug!(msec, "using attempt timeout");
    Duration::from_millis(u64::from(msec))
}

/// Masks every usable server except the `selected`-th one (1-based).
fn restrict_to_usable(selected: usize, usable: &mut [bool]) {
    let mut usable_index = 0;
    for flag in usable.iter_mut() {
        if *flag {
            usable_index += 1;
        }
        if usable_index != selected {
            *flag = false;
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
