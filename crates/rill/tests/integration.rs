//! End-to-end tests driving the resolver against in-process nameservers.
//!
//! A small UDP (and optionally TCP) responder stands in for real servers:
//! it parrots back an A record for whatever question it receives, with
//! configurable TTL, delay and truncation behavior.

use rill::{
    CacheError, CacheStatus, DotResponse, DotServer, DotTransport, LookupFlags, PrivateDnsMode,
    QueryContext, Resolver, ResolverParams, ResolveError, Validation,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::{Duration, Instant};

const TEST_NETID: u32 = 30;

fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds a `name A IN` query with RD set.
fn build_query(name: &str, id: u16) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&[0, 1, 0, 1]);
    msg
}

/// Builds a one-answer response to `query`, padded with RDATA up to
/// `pad_to` bytes when that is larger than the natural size.
fn build_response(query: &[u8], ttl: u32, ip: [u8; 4], pad_to: usize) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2] |= 0x80; // QR
    msg[3] |= 0x80; // RA
    msg[7] = 1; // ANCOUNT

    let base = msg.len() + 2 + 4 + 4 + 2 + 4;
    let pad = pad_to.saturating_sub(base);

    msg.extend_from_slice(&[0xC0, 0x0C]); // name: pointer to the question
    msg.extend_from_slice(&[0, 1, 0, 1]); // A IN
    msg.extend_from_slice(&ttl.to_be_bytes());
    msg.extend_from_slice(&((4 + pad) as u16).to_be_bytes());
    msg.extend_from_slice(&ip);
    msg.resize(msg.len() + pad, 0);
    msg
}

#[derive(Clone, Copy)]
enum UdpBehavior {
    /// Answer with an A record.
    Answer {
        ttl: u32,
        ip: [u8; 4],
        delay: Duration,
    },
    /// Answer with TC=1 and no records.
    Truncate,
}

struct Responder {
    addr: SocketAddr,
    udp_queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
}

impl Responder {
    fn server_string(&self) -> String {
        self.addr.to_string()
    }
}

/// Starts a UDP responder, plus a TCP responder on the same port when
/// `tcp_answer_size` is given.
fn start_responder(behavior: UdpBehavior, tcp_answer_size: Option<usize>) -> Responder {
    let udp = UdpSocket::bind("127.0.0.1:0").expect("bind UDP responder");
    let addr = udp.local_addr().expect("responder addr");
    let udp_queries = Arc::new(AtomicUsize::new(0));
    let tcp_queries = Arc::new(AtomicUsize::new(0));

    {
        let udp_queries = Arc::clone(&udp_queries);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while let Ok((len, from)) = udp.recv_from(&mut buf) {
                udp_queries.fetch_add(1, Ordering::SeqCst);
                let query = &buf[..len];
                match behavior {
                    UdpBehavior::Answer { ttl, ip, delay } => {
                        if !delay.is_zero() {
                            thread::sleep(delay);
                        }
                        let _ = udp.send_to(&build_response(query, ttl, ip, 0), from);
                    }
                    UdpBehavior::Truncate => {
                        let mut resp = query.to_vec();
                        resp[2] |= 0x80 | 0x02; // QR + TC
                        let _ = udp.send_to(&resp, from);
                    }
                }
            }
        });
    }

    if let Some(size) = tcp_answer_size {
        let listener = TcpListener::bind(addr).expect("bind TCP responder");
        let tcp_queries = Arc::clone(&tcp_queries);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).is_err() {
                    continue;
                }
                let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                if stream.read_exact(&mut query).is_err() {
                    continue;
                }
                tcp_queries.fetch_add(1, Ordering::SeqCst);
                let resp = build_response(&query, 120, [5, 6, 7, 8], size);
                let _ = stream.write_all(&(resp.len() as u16).to_be_bytes());
                let _ = stream.write_all(&resp);
            }
        });
    }

    Responder {
        addr,
        udp_queries,
        tcp_queries,
    }
}

/// An address nothing is listening on.
fn dead_server() -> String {
    let sock = UdpSocket::bind("127.0.0.1:0").expect("probe socket");
    let addr = sock.local_addr().expect("probe addr");
    drop(sock);
    addr.to_string()
}

fn resolver_with_servers(servers: &[String]) -> Resolver {
    init_logging();
    let resolver = Resolver::builder().build();
    resolver.create_cache_for_net(TEST_NETID).expect("create net");
    resolver
        .set_resolvers(TEST_NETID, servers, &[], ResolverParams::default())
        .expect("set resolvers");
    resolver
}

#[test]
fn test_basic_cache_hit() {
    let responder = start_responder(
        UdpBehavior::Answer {
            ttl: 60,
            ip: [1, 2, 3, 4],
            delay: Duration::ZERO,
        },
        None,
    );
    let resolver = resolver_with_servers(&[responder.server_string()]);
    let query = build_query("hello.example.com", 0x1234);
    let ctx = QueryContext::new(TEST_NETID);

    let mut first = [0u8; 4096];
    let r1 = resolver
        .query(&ctx, &query, &mut first, LookupFlags::empty())
        .expect("first resolution");
    assert_eq!(r1.rcode, 0);
    assert!(resolver.cache_entry_expiration(TEST_NETID, &query).is_ok());

    let mut second = [0u8; 4096];
    let r2 = resolver
        .query(&ctx, &query, &mut second, LookupFlags::empty())
        .expect("cached resolution");

    assert_eq!(&first[..r1.len], &second[..r2.len]);
    assert_eq!(
        responder.udp_queries.load(Ordering::SeqCst),
        1,
        "the second query must be served from the cache"
    );

    // Flushing brings the next query back to the network.
    resolver.flush_cache_for_net(TEST_NETID).unwrap();
    let mut third = [0u8; 4096];
    resolver
        .query(&ctx, &query, &mut third, LookupFlags::empty())
        .expect("post-flush resolution");
    assert_eq!(responder.udp_queries.load(Ordering::SeqCst), 2);
}

#[test]
fn test_single_flight_collapses_concurrent_misses() {
    let responder = start_responder(
        UdpBehavior::Answer {
            ttl: 300,
            ip: [1, 2, 3, 4],
            delay: Duration::from_millis(500),
        },
        None,
    );
    let resolver = Arc::new(resolver_with_servers(&[responder.server_string()]));
    let query = build_query("flight.example.com", 0x0042);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let resolver = Arc::clone(&resolver);
            let query = query.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut answer = [0u8; 4096];
                let result = resolver
                    .query(
                        &QueryContext::new(TEST_NETID),
                        &query,
                        &mut answer,
                        LookupFlags::empty(),
                    )
                    .expect("concurrent resolution");
                answer[..result.len].to_vec()
            })
        })
        .collect();

    let answers: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(answers.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(
        responder.udp_queries.load(Ordering::SeqCst),
        1,
        "exactly one thread may hit the network"
    );
}

#[test]
fn test_pending_wait_times_out_when_producer_stalls() {
    init_logging();
    let resolver = Arc::new(Resolver::builder().build());
    resolver.create_cache_for_net(TEST_NETID).unwrap();
    let query = build_query("stalled.example.com", 0x0007);

    // Become the producer and never deliver.
    let mut buf = [0u8; 4096];
    assert_eq!(
        resolver.cache_lookup(TEST_NETID, &query, &mut buf, LookupFlags::empty()),
        CacheStatus::NotFound
    );

    let waiter = {
        let resolver = Arc::clone(&resolver);
        let query = query.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let started = Instant::now();
            let status =
                resolver.cache_lookup(TEST_NETID, &query, &mut buf, LookupFlags::empty());
            (status, started.elapsed())
        })
    };

    let (status, elapsed) = waiter.join().unwrap();
    assert_eq!(status, CacheStatus::NotFound);
    assert!(
        elapsed >= Duration::from_millis(19_500) && elapsed <= Duration::from_millis(21_000),
        "waiter should give up after ~20 s, took {elapsed:?}"
    );
    assert_eq!(
        resolver
            .resolver_stats(TEST_NETID)
            .unwrap()
            .pending_request_timeouts,
        1
    );
}

#[test]
fn test_truncated_udp_answer_retries_same_server_over_tcp() {
    let responder = start_responder(UdpBehavior::Truncate, Some(600));
    let resolver = resolver_with_servers(&[responder.server_string()]);
    let query = build_query("big.example.com", 0x0099);
    let ctx = QueryContext::new(TEST_NETID);

    let mut answer = [0u8; 4096];
    let result = resolver
        .query(&ctx, &query, &mut answer, LookupFlags::empty())
        .expect("truncation fallback");
    assert_eq!(result.len, 600);
    assert_eq!(responder.udp_queries.load(Ordering::SeqCst), 1);
    assert_eq!(responder.tcp_queries.load(Ordering::SeqCst), 1);

    // The full stream payload was admitted to the cache.
    let mut cached = [0u8; 4096];
    let hit = resolver
        .query(&ctx, &query, &mut cached, LookupFlags::empty())
        .expect("cached resolution");
    assert_eq!(hit.len, 600);
    assert_eq!(&cached[..600], &answer[..600]);
    assert_eq!(responder.tcp_queries.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unreachable_servers_yield_connection_refused() {
    let resolver = resolver_with_servers(&[dead_server(), dead_server()]);
    let query = build_query("nowhere.example.com", 0x0031);
    let ctx = QueryContext::new(TEST_NETID);

    let mut answer = [0u8; 4096];
    let err = resolver
        .query(&ctx, &query, &mut answer, LookupFlags::empty())
        .expect_err("no server is listening");
    assert!(matches!(err, ResolveError::ConnectionRefused), "{err:?}");

    assert_eq!(
        resolver.cache_entry_expiration(TEST_NETID, &query),
        Err(CacheError::NotCached)
    );

    // The failure released the pending marker: a fresh lookup claims it
    // immediately instead of blocking behind the failed attempt.
    let started = Instant::now();
    let mut buf = [0u8; 4096];
    assert_eq!(
        resolver.cache_lookup(TEST_NETID, &query, &mut buf, LookupFlags::empty()),
        CacheStatus::NotFound
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

struct TestDotTransport {
    validate_ok: AtomicBool,
    queries: AtomicUsize,
}

impl DotTransport for TestDotTransport {
    fn validate(&self, _server: &DotServer, _netid: u32, _mark: u32) -> bool {
        self.validate_ok.load(Ordering::SeqCst)
    }

    fn query(&self, _servers: &[DotServer], query: &[u8], answer: &mut [u8]) -> DotResponse {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let resp = build_response(query, 60, [9, 9, 9, 9], 0);
        answer[..resp.len()].copy_from_slice(&resp);
        DotResponse::Success { len: resp.len() }
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, pred: F) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("{what} did not happen within 2 s");
}

#[test]
fn test_opportunistic_private_dns_falls_back_then_recovers() {
    init_logging();
    let responder = start_responder(
        UdpBehavior::Answer {
            ttl: 60,
            ip: [1, 2, 3, 4],
            delay: Duration::ZERO,
        },
        None,
    );
    let transport = Arc::new(TestDotTransport {
        validate_ok: AtomicBool::new(false),
        queries: AtomicUsize::new(0),
    });

    let resolver = Resolver::builder()
        .dot_transport(transport.clone())
        .build();
    resolver.create_cache_for_net(TEST_NETID).unwrap();
    resolver
        .set_resolvers(
            TEST_NETID,
            &[responder.server_string()],
            &[],
            ResolverParams::default(),
        )
        .unwrap();
    resolver
        .set_private_dns(TEST_NETID, 0, &["127.0.0.88".to_string()], "", "", 0)
        .unwrap();

    let status = resolver.private_dns_status(TEST_NETID);
    assert_eq!(status.mode, PrivateDnsMode::Opportunistic);
    wait_for("validation failure", || {
        resolver
            .private_dns_status(TEST_NETID)
            .servers
            .iter()
            .any(|(_, v)| *v == Validation::Fail)
    });

    // Unvalidated: the query goes over cleartext.
    let ctx = QueryContext::new(TEST_NETID);
    let mut answer = [0u8; 4096];
    resolver
        .query(
            &ctx,
            &build_query("fallback.example.com", 1),
            &mut answer,
            LookupFlags::empty(),
        )
        .expect("cleartext fallback");
    assert_eq!(responder.udp_queries.load(Ordering::SeqCst), 1);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 0);

    // The server starts validating; resubmitting kicks off a new check.
    transport.validate_ok.store(true, Ordering::SeqCst);
    resolver
        .set_private_dns(TEST_NETID, 0, &["127.0.0.88".to_string()], "", "", 0)
        .unwrap();
    wait_for("validation success", || {
        !resolver
            .private_dns_status(TEST_NETID)
            .validated_servers()
            .is_empty()
    });

    // Validated: the next query goes over TLS and is cached.
    let secure_query = build_query("secure.example.com", 2);
    let mut answer = [0u8; 4096];
    let result = resolver
        .query(&ctx, &secure_query, &mut answer, LookupFlags::empty())
        .expect("TLS resolution");
    assert_eq!(result.rcode, 0);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 1);
    assert_eq!(responder.udp_queries.load(Ordering::SeqCst), 1);
    assert!(resolver
        .cache_entry_expiration(TEST_NETID, &secure_query)
        .is_ok());
}

#[test]
fn test_unsupported_query_is_forwarded_but_never_cached() {
    let responder = start_responder(
        UdpBehavior::Answer {
            ttl: 60,
            ip: [1, 2, 3, 4],
            delay: Duration::ZERO,
        },
        None,
    );
    let resolver = resolver_with_servers(&[responder.server_string()]);
    let ctx = QueryContext::new(TEST_NETID);

    // TXT is outside the cache's supported TYPE set.
    let mut query = build_query("txt.example.com", 0x0055);
    let type_at = query.len() - 4;
    query[type_at + 1] = 16;

    let mut answer = [0u8; 4096];
    resolver
        .query(&ctx, &query, &mut answer, LookupFlags::empty())
        .expect("uncached resolution");
    resolver
        .query(&ctx, &query, &mut answer, LookupFlags::empty())
        .expect("still uncached resolution");

    assert_eq!(responder.udp_queries.load(Ordering::SeqCst), 2);
    assert_eq!(
        resolver.cache_entry_expiration(TEST_NETID, &query),
        Err(CacheError::UnsupportedQuery)
    );
}
