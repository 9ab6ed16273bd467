//! Query event records.
//!
//! Every attempt against a server produces a [`QueryEvent`]; a whole
//! `send` call produces one [`NetworkEvent`] aggregating them. The sink is
//! an external collaborator, typically bridging to the host's metrics
//! service; how often it actually forwards events is governed by the
//! registry's subsampling map.

use rill_cache::CacheStatus;
use rill_dot::PrivateDnsMode;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport an attempt went over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Dot,
}

/// Address family of the server an attempt targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }
}

/// One attempt to answer a query.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// What the cache said before any network work.
    pub cache_status: CacheStatus,

    /// Wall time the attempt took.
    pub latency: Duration,

    /// Index of the server in the configured list; `None` for cache hits.
    pub server_index: Option<usize>,

    /// Address family of the server; `None` for cache hits.
    pub ip_version: Option<IpVersion>,

    /// Transport used; `None` for cache hits.
    pub protocol: Option<Protocol>,

    /// Which pass over the server list this attempt belonged to.
    pub retry_index: u32,

    /// Response code of the attempt, or an out-of-band code for timeouts
    /// and internal failures.
    pub rcode: u8,

    /// TYPE of the first question.
    pub query_type: Option<u16>,
}

/// Everything that happened while answering one query on one network.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    /// Network the query ran on.
    pub netid: u32,

    /// Private DNS mode observed, if the controller was consulted.
    pub private_dns_mode: Option<PrivateDnsMode>,

    /// Per-attempt records, in order.
    pub queries: Vec<QueryEvent>,
}

impl NetworkEvent {
    pub(crate) fn new(netid: u32) -> Self {
        Self {
            netid,
            private_dns_mode: None,
            queries: Vec::new(),
        }
    }
}

/// Receiver for query events.
pub trait EventSink: Send + Sync + 'static {
    /// Called once per first-pass server attempt, alongside the
    /// reachability sample.
    fn on_query_event(&self, netid: u32, server: SocketAddr, event: &QueryEvent);

    /// Called once per `send` call, whatever its outcome.
    fn on_network_event(&self, event: &NetworkEvent);
}

/// Sink that drops all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_query_event(&self, _netid: u32, _server: SocketAddr, _event: &QueryEvent) {}
    fn on_network_event(&self, _event: &NetworkEvent) {}
}
