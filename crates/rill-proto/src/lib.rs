//! # Rill DNS wire primitives
//!
//! Minimal wire-format support for a stub resolver that treats query and
//! answer packets as opaque byte strings wherever possible:
//!
//! - A bounds-checked read cursor over raw packets
//! - A parsed view of the fixed 12-byte header
//! - Query-shape validation, fingerprinting, and equality for cache keying
//! - Answer TTL extraction (smallest answer TTL, or the SOA-derived
//!   negative TTL for empty answers)
//!
//! Nothing here builds packets; the resolver forwards what it was given.

pub mod error;
pub mod header;
pub mod query;
pub mod rcode;
pub mod ttl;
pub mod wire;

pub use error::{Error, Result};
pub use header::{Header, HeaderFlags};
pub use rcode::ResponseCode;
pub use wire::WireReader;

/// Size of the fixed DNS message header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest payload carried over the datagram transport. Queries above this
/// go straight to the stream transport.
pub const MAX_UDP_PAYLOAD: usize = 512;
