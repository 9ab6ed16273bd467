//! DNS response codes (RCODEs).
//!
//! Defined in RFC 1035 Section 4.1.1 with extensions from subsequent RFCs.
//! Only the codes the send engine actually inspects are modeled; everything
//! else travels through the resolver as its raw header nibble.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// DNS response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    /// No error condition - RFC 1035
    NoError = 0,

    /// Format error - RFC 1035
    ///
    /// The name server was unable to interpret the query.
    FormErr = 1,

    /// Server failure - RFC 1035
    ServFail = 2,

    /// Name error - RFC 1035
    ///
    /// The domain name referenced in the query does not exist.
    NXDomain = 3,

    /// Not implemented - RFC 1035
    NotImp = 4,

    /// Query refused - RFC 1035
    Refused = 5,

    /// Name exists when it should not - RFC 2136
    YXDomain = 6,

    /// RR set exists when it should not - RFC 2136
    YXRRSet = 7,

    /// RR set that should exist does not - RFC 2136
    NXRRSet = 8,

    /// Server not authoritative for zone - RFC 2136
    NotAuth = 9,

    /// Name not contained in zone - RFC 2136
    NotZone = 10,
}

/// Out-of-band code recorded in samples and events when no response arrived
/// before the per-attempt deadline.
pub const RCODE_TIMEOUT: u8 = 255;

/// Out-of-band code recorded in samples and events for attempts that failed
/// before any response could be classified.
pub const RCODE_INTERNAL_ERROR: u8 = 254;

impl ResponseCode {
    /// Returns true for the codes that make the engine abandon a server and
    /// move to the next one.
    #[inline]
    pub fn is_server_rejection(self) -> bool {
        matches!(self, Self::ServFail | Self::NotImp | Self::Refused)
    }
}
