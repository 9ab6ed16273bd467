//! External collaborator contracts.
//!
//! The TLS machinery lives outside this crate; the controller only needs a
//! way to validate a server and to run a query against the validated set.

use crate::server::DotServer;

/// Outcome of a TLS query dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotResponse {
    /// A response landed in the answer buffer.
    Success {
        /// Length of the response.
        len: usize,
    },

    /// The server could not be reached or stopped answering.
    NetworkError,

    /// The transport failed before reaching the network.
    InternalError,

    /// The transport refused the query due to internal limits.
    LimitError,
}

/// DNS-over-TLS transport implementation.
pub trait DotTransport: Send + Sync + 'static {
    /// Probes a server: connect, handshake, verify the pinned name and
    /// certificate, exchange a test query. Blocking; may take from
    /// milliseconds to minutes depending on SYN retries.
    fn validate(&self, server: &DotServer, netid: u32, mark: u32) -> bool;

    /// Sends `query` to one of the validated servers and writes the reply
    /// into `answer`.
    fn query(&self, servers: &[DotServer], query: &[u8], answer: &mut [u8]) -> DotResponse;
}

/// Receiver for validation state changes, typically bridged to the host's
/// event service.
pub trait ValidationListener: Send + Sync + 'static {
    /// A validation attempt for `server` finished with `success`.
    fn on_validation_event(&self, netid: u32, server: &str, name: &str, success: bool);
}

/// Listener that drops all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ValidationListener for NullListener {
    fn on_validation_event(&self, _netid: u32, _server: &str, _name: &str, _success: bool) {}
}

/// Transport that treats every server as unreachable. Stands in when the
/// host never enables private DNS.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableTransport;

impl DotTransport for UnreachableTransport {
    fn validate(&self, _server: &DotServer, _netid: u32, _mark: u32) -> bool {
        false
    }

    fn query(&self, _servers: &[DotServer], _query: &[u8], _answer: &mut [u8]) -> DotResponse {
        DotResponse::NetworkError
    }
}
