//! # Rill send engine
//!
//! Drives a raw DNS query to an answer: cache probe, private DNS attempt,
//! then the cleartext retry loop over the configured nameservers with
//! per-attempt timeouts, server-health filtering, truncation fallback from
//! datagram to stream transport, and reachability bookkeeping.
//!
//! All I/O is blocking and bounded by per-attempt deadlines; no lock is
//! ever held across it. Sockets live in per-call state and are closed on
//! every exit path.

pub mod event;
pub mod send;
pub mod socket;
mod tcp;
mod udp;

pub use event::{EventSink, IpVersion, NetworkEvent, NullEventSink, Protocol, QueryEvent};
pub use send::{QueryAnswer, QueryEngine};
pub use socket::{NoopTagger, SocketTagger};

use bitflags::bitflags;
use thiserror::Error;

/// Result type alias for send-engine operations.
pub type Result<T> = std::result::Result<T, ResolveError>;

bitflags! {
    /// Network-context flags the engine reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NetContextFlags: u32 {
        /// The caller insists on the network's cleartext servers; skip the
        /// private DNS attempt.
        const USE_LOCAL_NAMESERVERS = 1 << 0;

        /// The query carries an EDNS0 OPT record; a FORMERR then means the
        /// server cannot cope with EDNS0 at all.
        const USE_EDNS = 1 << 1;
    }
}

/// Identity and policy of the caller on whose behalf a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    /// Network to resolve on.
    pub netid: u32,

    /// Uid of the application that asked; query sockets are tagged with it.
    pub uid: u32,

    /// Socket mark for routing, 0 for none.
    pub mark: u32,

    /// Context flags.
    pub flags: NetContextFlags,
}

impl QueryContext {
    /// A plain context for the given network.
    pub fn new(netid: u32) -> Self {
        Self {
            netid,
            uid: 0,
            mark: 0,
            flags: NetContextFlags::empty(),
        }
    }
}

/// Why a query produced no answer.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The caller's answer buffer cannot hold even a header.
    #[error("answer buffer too small")]
    BufferTooSmall,

    /// The network has no nameservers configured, or no cache at all.
    #[error("no nameservers configured")]
    NoServers,

    /// At least one server was reached but none produced a usable answer.
    #[error("query timed out")]
    Timeout,

    /// No server could be reached at all.
    #[error("no nameserver could be reached")]
    ConnectionRefused,

    /// The transport failed in a way that retrying another server cannot
    /// fix.
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),
}
