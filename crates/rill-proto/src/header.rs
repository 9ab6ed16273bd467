//! DNS message header.
//!
//! The DNS header is a fixed 12-byte structure at the start of every DNS
//! message:
//!
//! ```text
//!                                 1  1  1  1  1  1
//!   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA| Z|AD|CD|   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    QDCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ANCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    NSCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ARCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```
//!
//! Since the resolver passes packets through without rebuilding them, this
//! module offers both a parsed [`Header`] view and a handful of raw
//! accessors that read or patch single fields in place.

use crate::error::{Error, Result};
use crate::HEADER_SIZE;
use bitflags::bitflags;

bitflags! {
    /// DNS header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u16 {
        /// Query/Response flag: 0 = query, 1 = response
        const QR = 0x8000;

        /// Authoritative Answer: server is authoritative for the domain
        const AA = 0x0400;

        /// Truncation: message was truncated
        const TC = 0x0200;

        /// Recursion Desired: client wants recursive resolution
        const RD = 0x0100;

        /// Recursion Available: server supports recursion
        const RA = 0x0080;

        /// Reserved for future use (must be zero)
        const Z = 0x0040;

        /// Authentic Data: response data is authenticated (DNSSEC)
        const AD = 0x0020;

        /// Checking Disabled: disable DNSSEC validation
        const CD = 0x0010;
    }
}

/// Parsed view of a DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message identifier for matching requests to responses.
    pub id: u16,

    /// Flag bits.
    pub flags: HeaderFlags,

    /// Operation code (4-bit).
    pub opcode: u8,

    /// Response code (4-bit header field).
    pub rcode: u8,

    /// Number of questions.
    pub qd_count: u16,

    /// Number of answer records.
    pub an_count: u16,

    /// Number of authority records.
    pub ns_count: u16,

    /// Number of additional records.
    pub ar_count: u16,
}

impl Header {
    /// Parses the header from the start of a message.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        if msg.len() < HEADER_SIZE {
            return Err(Error::buffer_too_short(HEADER_SIZE, msg.len()));
        }
        let word = |i: usize| u16::from_be_bytes([msg[i], msg[i + 1]]);
        let raw_flags = word(2);

        Ok(Self {
            id: word(0),
            flags: HeaderFlags::from_bits_truncate(raw_flags),
            opcode: ((raw_flags >> 11) & 0x0F) as u8,
            rcode: (raw_flags & 0x0F) as u8,
            qd_count: word(4),
            an_count: word(6),
            ns_count: word(8),
            ar_count: word(10),
        })
    }
}

/// Reads the message id without parsing the rest of the header.
#[inline]
pub fn message_id(msg: &[u8]) -> Result<u16> {
    if msg.len() < 2 {
        return Err(Error::buffer_too_short(2, msg.len()));
    }
    Ok(u16::from_be_bytes([msg[0], msg[1]]))
}

/// Reads the 4-bit response code from a message header.
#[inline]
pub fn rcode(msg: &[u8]) -> Result<u8> {
    if msg.len() < HEADER_SIZE {
        return Err(Error::buffer_too_short(HEADER_SIZE, msg.len()));
    }
    Ok(msg[3] & 0x0F)
}

/// Returns true if the truncation bit is set.
#[inline]
pub fn is_truncated(msg: &[u8]) -> Result<bool> {
    if msg.len() < HEADER_SIZE {
        return Err(Error::buffer_too_short(HEADER_SIZE, msg.len()));
    }
    Ok(msg[2] & 0x02 != 0)
}

/// Sets the truncation bit in place.
///
/// Used by the stream transport when a reply was larger than the caller's
/// answer buffer and the tail had to be discarded.
#[inline]
pub fn set_truncated(msg: &mut [u8]) {
    if msg.len() >= HEADER_SIZE {
        msg[2] |= 0x02;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: [u8; 12] = [0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    #[test]
    fn test_parse_query_header() {
        let h = Header::parse(&QUERY).unwrap();
        assert_eq!(h.id, 0xABCD);
        assert!(h.flags.contains(HeaderFlags::RD));
        assert!(!h.flags.contains(HeaderFlags::QR));
        assert_eq!(h.opcode, 0);
        assert_eq!(h.rcode, 0);
        assert_eq!(h.qd_count, 1);
        assert_eq!(h.an_count, 0);
    }

    #[test]
    fn test_parse_short_buffer() {
        assert!(Header::parse(&QUERY[..11]).is_err());
    }

    #[test]
    fn test_raw_accessors() {
        let mut msg = QUERY;
        assert_eq!(message_id(&msg).unwrap(), 0xABCD);
        assert_eq!(rcode(&msg).unwrap(), 0);
        assert!(!is_truncated(&msg).unwrap());

        set_truncated(&mut msg);
        assert!(is_truncated(&msg).unwrap());
        let h = Header::parse(&msg).unwrap();
        assert!(h.flags.contains(HeaderFlags::TC));
    }
}
