//! Answer TTL extraction.
//!
//! The cache keeps an answer for the smallest TTL among its answer records.
//! A response with no answer records is a negative result and is kept for
//! the RFC 2308 negative TTL: the minimum over the authority section's SOA
//! records of min(record TTL, MINIMUM field). A packet that does not parse
//! yields TTL 0, which the cache treats as "do not store".

use crate::error::Result;
use crate::header::Header;
use crate::wire::WireReader;
use crate::HEADER_SIZE;
use tracing::debug;

const TYPE_SOA: u16 = 6;

/// Number of seconds to keep `answer` in the cache, or 0 if it should not
/// be cached at all.
pub fn answer_ttl(answer: &[u8]) -> u32 {
    match parse_ttl(answer) {
        Ok(ttl) => ttl,
        Err(err) => {
            debug!(%err, "failed to parse answer for TTL");
            0
        }
    }
}

fn parse_ttl(msg: &[u8]) -> Result<u32> {
    let header = Header::parse(msg)?;
    let mut r = WireReader::new(msg);
    r.advance(HEADER_SIZE)?;

    for _ in 0..header.qd_count {
        r.skip_name()?;
        r.advance(4)?;
    }

    if header.an_count == 0 {
        return negative_ttl(&mut r, header.ns_count);
    }

    let mut min_ttl: Option<u32> = None;
    for _ in 0..header.an_count {
        let record = read_record(&mut r)?;
        min_ttl = Some(min_ttl.map_or(record.ttl, |m| m.min(record.ttl)));
    }
    Ok(min_ttl.unwrap_or(0))
}

struct RawRecord<'a> {
    rtype: u16,
    ttl: u32,
    rdata: &'a [u8],
}

fn read_record<'a>(r: &mut WireReader<'a>) -> Result<RawRecord<'a>> {
    r.skip_name()?;
    let rtype = r.read_u16()?;
    let _class = r.read_u16()?;
    let ttl = r.read_u32()?;
    let rdlength = r.read_u16()?;
    let rdata = r.read_bytes(rdlength as usize)?;
    Ok(RawRecord { rtype, ttl, rdata })
}

fn negative_ttl(r: &mut WireReader<'_>, ns_count: u16) -> Result<u32> {
    let mut min_ttl: Option<u32> = None;
    for _ in 0..ns_count {
        let record = read_record(r)?;
        if record.rtype != TYPE_SOA {
            continue;
        }
        let Some(minimum) = soa_minimum(record.rdata) else {
            // An SOA whose RDATA does not have the expected shape is
            // skipped; other authority records may still carry one.
            continue;
        };
        let effective = record.ttl.min(minimum);
        min_ttl = Some(min_ttl.map_or(effective, |m| m.min(effective)));
    }
    Ok(min_ttl.unwrap_or(0))
}

/// Extracts the MINIMUM field of an SOA record's RDATA: two embedded names
/// followed by exactly five 32-bit values, of which MINIMUM is the last.
fn soa_minimum(rdata: &[u8]) -> Option<u32> {
    let mut r = WireReader::new(rdata);
    r.skip_name().ok()?; // MNAME
    r.skip_name().ok()?; // RNAME
    if r.remaining() != 5 * 4 {
        return None;
    }
    // serial, refresh, retry, expire
    r.advance(4 * 4).ok()?;
    r.read_u32().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QNAME: &[u8] = b"\x05hello\x07example\x03com\x00";

    fn response_header(an_count: u16, ns_count: u16) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00];
        msg[6..8].copy_from_slice(&an_count.to_be_bytes());
        msg[8..10].copy_from_slice(&ns_count.to_be_bytes());
        msg.extend_from_slice(QNAME);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        msg
    }

    fn push_a_record(msg: &mut Vec<u8>, ttl: u32, ip: [u8; 4]) {
        msg.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        msg.extend_from_slice(&ttl.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&ip);
    }

    fn push_soa_record(msg: &mut Vec<u8>, ttl: u32, minimum: u32) {
        msg.extend_from_slice(&[0xC0, 0x12]); // pointer to example.com
        msg.extend_from_slice(&[0x00, 0x06, 0x00, 0x01]); // SOA IN
        msg.extend_from_slice(&ttl.to_be_bytes());
        let rdata_len = 2 + 2 + 5 * 4; // two compressed names + five u32 fields
        msg.extend_from_slice(&(rdata_len as u16).to_be_bytes());
        msg.extend_from_slice(&[0xC0, 0x12]); // MNAME
        msg.extend_from_slice(&[0xC0, 0x12]); // RNAME
        msg.extend_from_slice(&1u32.to_be_bytes()); // serial
        msg.extend_from_slice(&7200u32.to_be_bytes()); // refresh
        msg.extend_from_slice(&900u32.to_be_bytes()); // retry
        msg.extend_from_slice(&86400u32.to_be_bytes()); // expire
        msg.extend_from_slice(&minimum.to_be_bytes());
    }

    #[test]
    fn test_positive_ttl_is_minimum_over_answers() {
        let mut msg = response_header(2, 0);
        push_a_record(&mut msg, 120, [1, 2, 3, 4]);
        push_a_record(&mut msg, 60, [1, 2, 3, 5]);
        assert_eq!(answer_ttl(&msg), 60);
    }

    #[test]
    fn test_negative_ttl_uses_soa_minimum() {
        let mut msg = response_header(0, 1);
        push_soa_record(&mut msg, 300, 60);
        assert_eq!(answer_ttl(&msg), 60);
    }

    #[test]
    fn test_negative_ttl_capped_by_record_ttl() {
        let mut msg = response_header(0, 1);
        push_soa_record(&mut msg, 300, 600);
        assert_eq!(answer_ttl(&msg), 300);
    }

    #[test]
    fn test_negative_ttl_minimum_across_soas() {
        let mut msg = response_header(0, 2);
        push_soa_record(&mut msg, 500, 500);
        push_soa_record(&mut msg, 300, 120);
        assert_eq!(answer_ttl(&msg), 120);
    }

    #[test]
    fn test_no_soa_means_no_caching() {
        let msg = response_header(0, 0);
        assert_eq!(answer_ttl(&msg), 0);
    }

    #[test]
    fn test_parse_error_means_no_caching() {
        let mut msg = response_header(2, 0);
        push_a_record(&mut msg, 120, [1, 2, 3, 4]);
        // second record is announced but missing
        assert_eq!(answer_ttl(&msg), 0);

        assert_eq!(answer_ttl(b"\x00\x01\x02"), 0);
    }
}
