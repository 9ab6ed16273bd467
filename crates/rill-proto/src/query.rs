//! Query packet inspection.
//!
//! The cache keys on raw query packets, so three operations over the same
//! normalized projection of a packet live here:
//!
//! - [`validate_query`]: is this a query shape the cache can handle at all?
//! - [`fingerprint`]: a 32-bit FNV-1a hash of the projection
//! - [`queries_equal`]: byte-exact comparison of the projection
//!
//! The projection covers the RD bit, the third header byte (AD and CD),
//! QDCOUNT, ARCOUNT, every question's name labels, TYPE and CLASS, and the
//! optional additional record. The transaction id and the TC bit are
//! excluded: the id changes per attempt, and the resolver may toggle TC on
//! a buffer between a lookup and the matching admission.
//!
//! Two packets with equal projections hash equally; unequal projections
//! compare unequal. None of these functions allocate.

use crate::wire::WireReader;
use crate::HEADER_SIZE;
use tracing::debug;

const FNV_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Question TYPEs the cache accepts.
const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_AAAA: u16 = 28;
const TYPE_ALL: u16 = 255;

/// Question CLASS the cache accepts.
const CLASS_IN: u16 = 1;

#[inline]
fn fnv(hash: u32, byte: u8) -> u32 {
    (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
}

fn fnv_slice(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash = fnv(hash, b);
    }
    hash
}

#[inline]
fn count_at(msg: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([msg[offset], msg[offset + 1]])
}

/// Checks whether a packet is a query the cache supports.
///
/// Accepted shape: at least a full header; QR, Opcode, AA, RA, Z and RCODE
/// all zero (TC, RD, CD and AD are ignored); ANCOUNT and NSCOUNT zero;
/// ARCOUNT at most one; at least one question, and every question a plain
/// label sequence (no compression) with a supported TYPE and CLASS IN.
pub fn validate_query(msg: &[u8]) -> bool {
    if msg.len() < HEADER_SIZE {
        debug!("query packet too small");
        return false;
    }

    // QR, Opcode and AA must be 0 in byte 2; RA, Z and RCODE in byte 3.
    // TC and RD (byte 2) and AD and CD (byte 3) are deliberately not
    // inspected here; AD/CD still differentiate cached results via the
    // fingerprint.
    if msg[2] & 0xFC != 0 || msg[3] & 0xCF != 0 {
        debug!("query packet flags unsupported");
        return false;
    }

    let qd_count = count_at(msg, 4);
    let an_count = count_at(msg, 6);
    let ns_count = count_at(msg, 8);
    let ar_count = count_at(msg, 10);

    if an_count != 0 || ns_count != 0 || ar_count > 1 {
        debug!("query packet contains non-query records");
        return false;
    }
    if qd_count == 0 {
        debug!("query packet has no question");
        return false;
    }

    let mut r = WireReader::new(msg);
    if r.advance(HEADER_SIZE).is_err() {
        return false;
    }
    for _ in 0..qd_count {
        if !check_question(&mut r) {
            return false;
        }
    }
    true
}

fn check_question(r: &mut WireReader<'_>) -> bool {
    if !check_qname(r) {
        return false;
    }
    let Ok(qtype) = r.read_u16() else {
        return false;
    };
    if !matches!(qtype, TYPE_A | TYPE_PTR | TYPE_MX | TYPE_AAAA | TYPE_ALL) {
        debug!(qtype, "unsupported question TYPE");
        return false;
    }
    match r.read_u16() {
        Ok(CLASS_IN) => true,
        Ok(qclass) => {
            debug!(qclass, "unsupported question CLASS");
            false
        }
        Err(_) => false,
    }
}

/// A question name is a plain label sequence terminated by a zero byte.
/// Compression pointers (top bits set, so length >= 64) are rejected.
fn check_qname(r: &mut WireReader<'_>) -> bool {
    loop {
        let Ok(len) = r.read_u8() else {
            debug!("malformed QNAME");
            return false;
        };
        if len == 0 {
            return true;
        }
        if len >= 64 || r.advance(len as usize).is_err() {
            debug!("malformed QNAME");
            return false;
        }
    }
}

/// Computes the cache fingerprint of a query packet.
///
/// Tolerates malformed input by hashing whatever prefix parses; pair with
/// [`validate_query`] before trusting the result for keying.
pub fn fingerprint(msg: &[u8]) -> u32 {
    if msg.len() < HEADER_SIZE {
        return fnv_slice(FNV_BASIS, msg);
    }

    let mut hash = FNV_BASIS;
    hash = fnv(hash, msg[2] & 1);
    hash = fnv(hash, msg[3]);
    hash = fnv_slice(hash, &msg[4..6]);
    hash = fnv_slice(hash, &msg[10..12]);

    let qd_count = count_at(msg, 4);
    let ar_count = count_at(msg, 10);

    let mut r = WireReader::new(msg);
    if r.advance(HEADER_SIZE).is_err() {
        return hash;
    }
    for _ in 0..qd_count {
        match hash_question(&mut r, hash) {
            Some(h) => hash = h,
            None => return hash,
        }
    }
    for _ in 0..ar_count {
        match hash_record(&mut r, hash) {
            Some(h) => hash = h,
            None => return hash,
        }
    }
    hash
}

/// Hashes name labels plus the 4 bytes of TYPE and CLASS.
fn hash_question(r: &mut WireReader<'_>, mut hash: u32) -> Option<u32> {
    hash = hash_qname(r, hash)?;
    let fixed = r.read_bytes(4).ok()?;
    Some(fnv_slice(hash, fixed))
}

/// Hashes a resource record: name, TYPE, CLASS, TTL and RDATA. The RDLENGTH
/// field itself stays out of the hash; it is implied by the RDATA bytes.
fn hash_record(r: &mut WireReader<'_>, mut hash: u32) -> Option<u32> {
    hash = hash_question(r, hash)?;
    let ttl = r.read_bytes(4).ok()?;
    hash = fnv_slice(hash, ttl);
    let rdlength = r.read_u16().ok()?;
    let rdata = r.read_bytes(rdlength as usize).ok()?;
    Some(fnv_slice(hash, rdata))
}

/// Hashes the content bytes of each label. Length bytes and the terminator
/// are structural and already captured by the equality rules.
fn hash_qname(r: &mut WireReader<'_>, mut hash: u32) -> Option<u32> {
    loop {
        let len = r.read_u8().ok()?;
        if len == 0 {
            return Some(hash);
        }
        if len >= 64 {
            return None;
        }
        let label = r.read_bytes(len as usize).ok()?;
        hash = fnv_slice(hash, label);
    }
}

/// Compares two query packets over the fingerprint projection.
pub fn queries_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() < HEADER_SIZE || b.len() < HEADER_SIZE {
        return a == b;
    }

    if (a[2] & 1) != (b[2] & 1) {
        return false;
    }
    if a[3] != b[3] {
        return false;
    }

    let qd_a = count_at(a, 4);
    let ar_a = count_at(a, 10);
    if qd_a != count_at(b, 4) || ar_a != count_at(b, 10) {
        return false;
    }

    let mut ra = WireReader::new(a);
    let mut rb = WireReader::new(b);
    if ra.advance(HEADER_SIZE).is_err() || rb.advance(HEADER_SIZE).is_err() {
        return false;
    }

    for _ in 0..qd_a {
        if !question_equal(&mut ra, &mut rb) {
            return false;
        }
    }
    for _ in 0..ar_a {
        if !record_equal(&mut ra, &mut rb) {
            return false;
        }
    }
    true
}

fn question_equal(ra: &mut WireReader<'_>, rb: &mut WireReader<'_>) -> bool {
    if !qname_equal(ra, rb) {
        return false;
    }
    matches!((ra.read_bytes(4), rb.read_bytes(4)), (Ok(fa), Ok(fb)) if fa == fb)
}

fn record_equal(ra: &mut WireReader<'_>, rb: &mut WireReader<'_>) -> bool {
    if !question_equal(ra, rb) {
        return false;
    }
    // TTL
    match (ra.read_bytes(4), rb.read_bytes(4)) {
        (Ok(ta), Ok(tb)) if ta == tb => {}
        _ => return false,
    }
    let (Ok(la), Ok(lb)) = (ra.read_u16(), rb.read_u16()) else {
        return false;
    };
    if la != lb {
        return false;
    }
    matches!(
        (ra.read_bytes(la as usize), rb.read_bytes(lb as usize)),
        (Ok(da), Ok(db)) if da == db
    )
}

fn qname_equal(ra: &mut WireReader<'_>, rb: &mut WireReader<'_>) -> bool {
    loop {
        let (Ok(la), Ok(lb)) = (ra.read_u8(), rb.read_u8()) else {
            return false;
        };
        if la != lb {
            return false;
        }
        if la == 0 {
            return true;
        }
        if la >= 64 {
            return false;
        }
        match (ra.read_bytes(la as usize), rb.read_bytes(la as usize)) {
            (Ok(ba), Ok(bb)) if ba == bb => {}
            _ => return false,
        }
    }
}

/// Reads the TYPE of the first question, used to tag query events.
pub fn query_type(msg: &[u8]) -> Option<u16> {
    if msg.len() < HEADER_SIZE || count_at(msg, 4) == 0 {
        return None;
    }
    let mut r = WireReader::new(msg);
    r.advance(HEADER_SIZE).ok()?;
    r.skip_name().ok()?;
    r.read_u16().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `hello.example.com A IN`, transaction id 0, RD set.
    const HELLO_QUERY: &[u8] = &[
        0x00, 0x00, // id
        0x01, 0x00, // flags: rd
        0x00, 0x01, // QDCOUNT
        0x00, 0x00, // ANCOUNT
        0x00, 0x00, // NSCOUNT
        0x00, 0x00, // ARCOUNT
        0x05, b'h', b'e', b'l', b'l', b'o', 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03,
        b'c', b'o', b'm', 0x00, // hello.example.com
        0x00, 0x01, // TYPE A
        0x00, 0x01, // CLASS IN
    ];

    #[test]
    fn test_validate_fixture() {
        assert!(validate_query(HELLO_QUERY));
    }

    #[test]
    fn test_validate_rejects_short_packet() {
        assert!(!validate_query(&HELLO_QUERY[..11]));
    }

    #[test]
    fn test_validate_rejects_response_flags() {
        let mut msg = HELLO_QUERY.to_vec();
        msg[2] |= 0x80; // QR
        assert!(!validate_query(&msg));

        let mut msg = HELLO_QUERY.to_vec();
        msg[3] |= 0x80; // RA
        assert!(!validate_query(&msg));
    }

    #[test]
    fn test_validate_ignores_tc_rd_cd_ad() {
        let mut msg = HELLO_QUERY.to_vec();
        msg[2] |= 0x02; // TC
        msg[3] |= 0x30; // AD | CD
        assert!(validate_query(&msg));
    }

    #[test]
    fn test_validate_rejects_answer_records() {
        let mut msg = HELLO_QUERY.to_vec();
        msg[7] = 1; // ANCOUNT = 1
        assert!(!validate_query(&msg));
    }

    #[test]
    fn test_validate_rejects_unknown_type() {
        let mut msg = HELLO_QUERY.to_vec();
        let type_at = msg.len() - 4;
        msg[type_at + 1] = 16; // TXT
        assert!(!validate_query(&msg));
    }

    #[test]
    fn test_validate_rejects_compressed_qname() {
        let mut msg = HELLO_QUERY.to_vec();
        msg[12] = 0xC0; // pointer where a label length belongs
        assert!(!validate_query(&msg));
    }

    #[test]
    fn test_fingerprint_ignores_transaction_id() {
        let mut other = HELLO_QUERY.to_vec();
        other[0] = 0xDE;
        other[1] = 0xAD;
        assert_eq!(fingerprint(HELLO_QUERY), fingerprint(&other));
        assert!(queries_equal(HELLO_QUERY, &other));
    }

    #[test]
    fn test_fingerprint_ignores_tc_bit() {
        let mut other = HELLO_QUERY.to_vec();
        other[2] |= 0x02;
        assert_eq!(fingerprint(HELLO_QUERY), fingerprint(&other));
        assert!(queries_equal(HELLO_QUERY, &other));
    }

    #[test]
    fn test_fingerprint_depends_on_rd() {
        let mut other = HELLO_QUERY.to_vec();
        other[2] &= !0x01;
        assert_ne!(fingerprint(HELLO_QUERY), fingerprint(&other));
        assert!(!queries_equal(HELLO_QUERY, &other));
    }

    #[test]
    fn test_fingerprint_depends_on_name() {
        let mut other = HELLO_QUERY.to_vec();
        other[13] = b'j'; // jello.example.com
        assert_ne!(fingerprint(HELLO_QUERY), fingerprint(&other));
        assert!(!queries_equal(HELLO_QUERY, &other));
    }

    #[test]
    fn test_queries_equal_depends_on_cd_ad() {
        let mut other = HELLO_QUERY.to_vec();
        other[3] |= 0x10; // CD
        assert!(!queries_equal(HELLO_QUERY, &other));
    }

    #[test]
    fn test_query_type() {
        assert_eq!(query_type(HELLO_QUERY), Some(1));
    }
}
