//! # Rill private DNS
//!
//! Policy and bookkeeping for DNS over TLS. This crate decides *whether*
//! and *to which* TLS-capable resolvers queries may be sent; the TLS
//! transport itself is an external collaborator behind the
//! [`DotTransport`] trait.
//!
//! Per network the controller keeps a mode and a server tracker:
//!
//! - **Off**: never use TLS.
//! - **Opportunistic**: use TLS once a server has validated; fall back to
//!   cleartext while none has, or when a validated server stops answering.
//! - **Strict**: a resolver name is pinned; queries wait briefly for
//!   validation and never fall back to cleartext.
//!
//! Validation runs on detached background threads, one per server, with
//! exponential backoff while a strict-mode server keeps failing.

pub mod backoff;
pub mod controller;
pub mod server;
pub mod transport;

pub use backoff::BackoffSequence;
pub use controller::{DotQueryResult, PrivateDnsController, PrivateDnsStatus};
pub use server::DotServer;
pub use transport::{
    DotResponse, DotTransport, NullListener, UnreachableTransport, ValidationListener,
};

use thiserror::Error;

/// Result type alias for private DNS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A server string did not parse as a numeric address.
    #[error("invalid private DNS server address: {address}")]
    InvalidServer {
        /// The string that failed to parse.
        address: String,
    },
}

/// Per-network private DNS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivateDnsMode {
    /// Plain cleartext DNS only.
    #[default]
    Off,

    /// Prefer TLS when a server has validated, fall back otherwise.
    Opportunistic,

    /// TLS with a pinned name; no cleartext fallback.
    Strict,
}

/// Validation state of one tracked server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// A validator thread is working on this server.
    InProcess,

    /// The server passed validation and may serve queries.
    Success,

    /// The server failed validation and will not be used until it is
    /// resubmitted by configuration.
    Fail,
}
