//! Stream transport.
//!
//! Used when the query exceeds the datagram payload limit or a server
//! answered with the truncation bit. One fresh connection per attempt,
//! length-prefixed messages, one same-server retry after a connection
//! reset.

use crate::socket::{self, SocketTagger};
use crate::QueryContext;
use rill_proto::rcode::RCODE_TIMEOUT;
use rill_proto::{header, HEADER_SIZE};
use socket2::Type;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Result of one stream attempt against one server.
#[derive(Debug)]
pub(crate) enum StreamOutcome {
    /// A matching answer landed in the caller's buffer. An oversized reply
    /// is cut to the buffer with the truncation bit set.
    Answer { len: usize, rcode: u8 },

    /// This server is not going to answer usefully; move to the next one.
    Abandon { rcode: Option<u8> },

    /// Give up on the whole query.
    Fatal(io::Error),
}

pub(crate) fn exchange(
    ctx: &QueryContext,
    server: SocketAddr,
    query: &[u8],
    answer: &mut [u8],
    timeout: Duration,
    tagger: &dyn SocketTagger,
) -> StreamOutcome {
    let query_id = match header::message_id(query) {
        Ok(id) => id,
        Err(_) => return StreamOutcome::Abandon { rcode: None },
    };

    // A long-lived server restart resets our connection; requery the same
    // server once instead of advancing, so a single-server configuration
    // can still succeed.
    let mut had_reset = false;
    loop {
        let sock = match socket::new_socket(&server, Type::STREAM, ctx, tagger) {
            Ok(sock) => sock,
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                debug!(%err, "stream socket unavailable for this family");
                return StreamOutcome::Abandon { rcode: None };
            }
            Err(err) => return StreamOutcome::Fatal(err),
        };

        match run(sock, server, query, answer, timeout, query_id) {
            Ok((len, rcode)) => return StreamOutcome::Answer { len, rcode },
            Err(err) if err.kind() == ErrorKind::ConnectionReset && !had_reset => {
                debug!(server = %server, "connection reset, retrying same server");
                had_reset = true;
            }
            Err(err) => {
                debug!(%err, server = %server, "stream exchange failed");
                let rcode = matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
                    .then_some(RCODE_TIMEOUT);
                return StreamOutcome::Abandon { rcode };
            }
        }
    }
}

fn run(
    sock: socket2::Socket,
    server: SocketAddr,
    query: &[u8],
    answer: &mut [u8],
    timeout: Duration,
    query_id: u16,
) -> io::Result<(usize, u8)> {
    socket::random_bind(&sock, &server)?;
    sock.connect_timeout(&server.into(), timeout)?;
    sock.set_nonblocking(false)?;

    let mut stream: TcpStream = sock.into();
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(&(query.len() as u16).to_be_bytes())?;
    stream.write_all(query)?;

    loop {
        let mut len_prefix = [0u8; 2];
        stream.read_exact(&mut len_prefix)?;
        let resplen = u16::from_be_bytes(len_prefix) as usize;
        if resplen < HEADER_SIZE {
            debug!(resplen, "undersized answer");
            return Err(io::Error::new(ErrorKind::InvalidData, "undersized answer"));
        }

        let truncating = resplen > answer.len();
        let body_len = resplen.min(answer.len());
        stream.read_exact(&mut answer[..body_len])?;

        if truncating {
            debug!(resplen, kept = body_len, "response exceeds answer buffer");
            drain(&mut stream, resplen - body_len)?;
            header::set_truncated(answer);
        }

        if header::message_id(&answer[..body_len]) != Ok(query_id) {
            // A reply to an earlier query on a confused connection; read
            // the next length-prefixed message.
            debug!("old answer, reading next message");
            continue;
        }

        let rcode = header::rcode(&answer[..body_len]).unwrap_or(0);
        return Ok((body_len, rcode));
    }
}

/// Reads and discards `remaining` bytes so the connection stays in sync.
fn drain(stream: &mut TcpStream, mut remaining: usize) -> io::Result<()> {
    let mut junk = [0u8; 512];
    while remaining > 0 {
        let take = remaining.min(junk.len());
        let n = stream.read(&mut junk[..take])?;
        if n == 0 {
            break;
        }
        remaining -= n;
    }
    Ok(())
}
