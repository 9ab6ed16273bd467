//! Datagram transport.
//!
//! One connected datagram socket per server, created lazily and kept for
//! the duration of the send loop. Connecting the socket makes an ICMP
//! port-unreachable surface as ECONNREFUSED on the next receive, so a dead
//! server is detected without waiting out the timeout.

use crate::socket::{self, SocketTagger};
use crate::QueryContext;
use rill_proto::{header, ResponseCode, HEADER_SIZE};
use socket2::Type;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one datagram attempt against one server.
#[derive(Debug)]
pub(crate) enum DatagramOutcome {
    /// A matching, well-formed answer landed in the caller's buffer.
    Answer { len: usize, rcode: u8 },

    /// Nothing usable arrived before the deadline.
    Timeout,

    /// The answer was truncated; retry the same server over the stream
    /// transport.
    RetryTcp,

    /// This server is not going to answer usefully; move to the next one.
    /// `responded` records whether any datagram actually arrived from it.
    Abandon {
        rcode: Option<u8>,
        responded: bool,
    },

    /// Give up on the whole query.
    Fatal(std::io::Error),
}

/// Per-call socket state for the datagram transport.
pub(crate) struct DatagramSockets {
    sockets: Vec<Option<UdpSocket>>,

    /// Set when a server answered FORMERR to an EDNS0 query.
    pub(crate) edns0_error: bool,
}

impl DatagramSockets {
    pub(crate) fn new(server_count: usize) -> Self {
        let mut sockets = Vec::with_capacity(server_count);
        sockets.resize_with(server_count, || None);
        Self {
            sockets,
            edns0_error: false,
        }
    }

    fn close(&mut self, ns: usize) {
        self.sockets[ns] = None;
    }
}

/// Sends `query` to `servers[ns]` once and waits for a matching reply.
#[allow(clippy::too_many_arguments)]
pub(crate) fn exchange(
    state: &mut DatagramSockets,
    ctx: &QueryContext,
    servers: &[SocketAddr],
    ns: usize,
    query: &[u8],
    answer: &mut [u8],
    timeout: Duration,
    tagger: &dyn SocketTagger,
) -> DatagramOutcome {
    let server = servers[ns];
    let query_id = match header::message_id(query) {
        Ok(id) => id,
        Err(_) => {
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: false,
            }
        }
    };

    if state.sockets[ns].is_none() {
        let sock = match socket::new_socket(&server, Type::DGRAM, ctx, tagger) {
            Ok(sock) => sock,
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                debug!(%err, "datagram socket unavailable for this family");
                return DatagramOutcome::Abandon {
                    rcode: None,
                    responded: false,
                };
            }
            Err(err) => return DatagramOutcome::Fatal(err),
        };
        if let Err(err) = socket::random_bind(&sock, &server) {
            debug!(%err, server = %server, "bind failed");
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: false,
            };
        }
        if let Err(err) = sock.connect(&server.into()) {
            debug!(%err, server = %server, "connect failed");
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: false,
            };
        }
        debug!(server = %server, "new datagram socket");
        state.sockets[ns] = Some(sock.into());
    }
    let Some(sock) = state.sockets[ns].as_ref() else {
        return DatagramOutcome::Abandon {
            rcode: None,
            responded: false,
        };
    };

    match sock.send(query) {
        Ok(n) if n == query.len() => {}
        Ok(_) | Err(_) => {
            debug!(server = %server, "send failed");
            state.close(ns);
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: false,
            };
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(server = %server, "timed out");
            return DatagramOutcome::Timeout;
        }
        if sock.set_read_timeout(Some(deadline - now)).is_err() {
            state.close(ns);
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: false,
            };
        }

        let (len, from) = match sock.recv_from(answer) {
            Ok(received) => received,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                debug!(server = %server, "timed out");
                return DatagramOutcome::Timeout;
            }
            Err(err) => {
                // ECONNREFUSED from the ICMP error queue lands here.
                debug!(%err, server = %server, "receive failed");
                state.close(ns);
                return DatagramOutcome::Abandon {
                    rcode: None,
                    responded: false,
                };
            }
        };

        if len < HEADER_SIZE {
            debug!(len, "undersized answer");
            state.close(ns);
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: true,
            };
        }
        if header::message_id(&answer[..len]) != Ok(query_id) {
            // A response to an earlier attempt; keep waiting for ours.
            debug!("old answer, ignoring");
            continue;
        }
        if !servers.contains(&from) {
            debug!(from = %from, "answer from a server we never asked");
            continue;
        }

        let rcode = match header::rcode(&answer[..len]) {
            Ok(rcode) => rcode,
            Err(_) => {
                state.close(ns);
                return DatagramOutcome::Abandon {
                    rcode: None,
                    responded: true,
                };
            }
        };

        if rcode == u8::from(ResponseCode::FormErr)
            && ctx.flags.contains(crate::NetContextFlags::USE_EDNS)
        {
            // The server cannot cope with EDNS0 at all; a FORMERR packet
            // has no query section, so this cannot be told apart from a
            // mangled response any later than here.
            debug!(server = %server, "server rejected EDNS0 query");
            state.edns0_error = true;
            state.close(ns);
            return DatagramOutcome::Abandon {
                rcode: None,
                responded: true,
            };
        }

        if ResponseCode::try_from(rcode)
            .map(|r| r.is_server_rejection())
            .unwrap_or(false)
        {
            debug!(server = %server, rcode, "server rejected query");
            state.close(ns);
            return DatagramOutcome::Abandon {
                rcode: Some(rcode),
                responded: true,
            };
        }

        if header::is_truncated(&answer[..len]).unwrap_or(false) {
            debug!(server = %server, "truncated answer, retrying over stream");
            state.close(ns);
            return DatagramOutcome::RetryTcp;
        }

        return DatagramOutcome::Answer { len, rcode };
    }
}
