//! # Rill answer cache
//!
//! A small and deliberately simple DNS answer cache, plus the per-network
//! registry that owns it.
//!
//! The cache maps raw query packets to raw answer packets. Answers are kept
//! for the smallest TTL among their records and evicted least-recently-used
//! when the table fills. Queries that encode the same name differently are
//! distinct entries; nothing here parses answers beyond their TTLs.
//!
//! Concurrent identical queries are collapsed by a single-flight protocol:
//! the first thread to miss on a fingerprint becomes the producer and is
//! told `NotFound`; every other thread blocks on a shared condition
//! variable until the producer admits an answer, reports failure, or a
//! 20 second guard timer expires.
//!
//! The registry additionally tracks, per network: the nameserver list and
//! search domains, resolver parameters, per-server reachability samples
//! with a revision fence, and the event subsampling map.

pub mod cache;
pub mod config;
pub mod registry;
pub mod stats;
pub mod subsample;

use bitflags::bitflags;
use thiserror::Error;

pub use config::{ResolverParams, DNS_PORT, MAXDNSRCH, MAXDNSRCHPATH, MAXNS, MAX_CACHE_ENTRIES};
pub use registry::{NameserverConfig, Registry, StatsSnapshot};
pub use stats::{Sample, ServerStats, StatsAggregate};
pub use subsample::{SubsamplingMap, DEFAULT_SUBSAMPLING_MAP};

bitflags! {
    /// Per-query flags supplied by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        /// Query exactly one server, selected by the query id, with no
        /// retry loop.
        const NO_RETRY = 1 << 0;

        /// Do not store the eventual answer in the cache.
        const NO_CACHE_STORE = 1 << 1;

        /// Skip the cache probe entirely.
        const NO_CACHE_LOOKUP = 1 << 2;
    }
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The answer was found and copied into the caller's buffer.
    Found(usize),

    /// Not cached. The caller is now responsible for resolving the query
    /// and must either admit the answer or report the failure.
    NotFound,

    /// The cache cannot handle this query, the network is unknown, or the
    /// caller's buffer is too small for the cached answer. No admission
    /// should follow.
    Unsupported,

    /// Flags asked for the cache to be bypassed in both directions.
    Skip,
}

/// Errors surfaced by cache and registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The query failed shape validation and cannot be cached.
    #[error("query is malformed or unsupported")]
    UnsupportedQuery,

    /// No cache exists for the network.
    #[error("no cache for network {netid}")]
    NoSuchNetwork {
        /// The offending network id.
        netid: u32,
    },

    /// The network already has a cache.
    #[error("network {netid} already has a cache")]
    NetworkExists {
        /// The offending network id.
        netid: u32,
    },

    /// An equal query is already cached; the admission was dropped.
    #[error("answer already cached")]
    AlreadyCached,

    /// A nameserver string did not parse as a numeric address.
    #[error("invalid nameserver address: {address}")]
    InvalidServer {
        /// The string that failed to parse.
        address: String,
    },

    /// The query has no live cache entry.
    #[error("answer not cached")]
    NotCached,

    /// The stored server list violates its own bounds.
    #[error("network {netid} has inconsistent server state")]
    InconsistentServers {
        /// The offending network id.
        netid: u32,
    },
}

/// Seconds since the Unix epoch; entry expiries are absolute wall-clock
/// times so they survive suspend.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
