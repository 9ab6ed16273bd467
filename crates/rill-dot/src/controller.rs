//! Private DNS state machine.
//!
//! Tracks, per network, the configured mode and the validation state of
//! every TLS server, and answers the send engine's question: "may this
//! query go over TLS, and to whom?"

use crate::backoff::BackoffSequence;
use crate::server::DotServer;
use crate::transport::{DotResponse, DotTransport, ValidationListener};
use crate::{PrivateDnsMode, Result, Validation};
use parking_lot::Mutex;
use rill_proto::header;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many times a strict-mode query polls for a validated server before
/// giving up, and how long each poll sleeps.
///
/// As soon as a network becomes the default network, applications start
/// querying on it; if no server has validated yet those queries would fail
/// instantly and visibly. Blocking them briefly bridges the gap.
const STRICT_WAIT_ROUNDS: u32 = 42;
const STRICT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot of a network's private DNS state.
#[derive(Debug, Clone, Default)]
pub struct PrivateDnsStatus {
    /// Configured mode.
    pub mode: PrivateDnsMode,

    /// Tracked servers with their validation state.
    pub servers: Vec<(DotServer, Validation)>,
}

impl PrivateDnsStatus {
    /// The servers queries may currently be dispatched to.
    pub fn validated_servers(&self) -> Vec<DotServer> {
        self.servers
            .iter()
            .filter(|(_, v)| *v == Validation::Success)
            .map(|(s, _)| s.clone())
            .collect()
    }
}

/// Outcome of a TLS dispatch attempt for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotQueryResult {
    /// A response landed in the caller's answer buffer.
    Answer {
        /// Length of the response.
        len: usize,
        /// Response code from the answer header.
        rcode: u8,
    },

    /// The query should proceed over cleartext.
    Fallback,

    /// The query failed and must not fall back to cleartext.
    NetworkError,
}

struct TrackedServer {
    server: DotServer,
    validation: Validation,
}

#[derive(Default)]
struct State {
    modes: HashMap<u32, PrivateDnsMode>,
    // Keyed by address: a server reappearing with a different name or
    // certificate replaces its predecessor.
    trackers: HashMap<u32, BTreeMap<SocketAddr, TrackedServer>>,
}

/// Per-network private DNS modes, server trackers and validation workers.
pub struct PrivateDnsController {
    state: Mutex<State>,
    transport: Arc<dyn DotTransport>,
    listener: Arc<dyn ValidationListener>,
}

impl PrivateDnsController {
    pub fn new(transport: Arc<dyn DotTransport>, listener: Arc<dyn ValidationListener>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            transport,
            listener,
        }
    }

    /// Applies a network's private DNS configuration.
    ///
    /// A non-empty `name` selects strict mode; otherwise a non-empty server
    /// list selects opportunistic mode; otherwise private DNS is off and
    /// all tracked state is dropped. Servers that are new, changed, or in
    /// the failed state are (re)submitted for background validation.
    pub fn set(
        self: &Arc<Self>,
        netid: u32,
        mark: u32,
        servers: &[String],
        name: &str,
        ca_cert: &str,
        connect_timeout_ms: i32,
    ) -> Result<()> {
        debug!(
            netid,
            server_count = servers.len(),
            name,
            connect_timeout_ms,
            "private DNS configuration"
        );

        let mut new_servers: BTreeMap<SocketAddr, DotServer> = BTreeMap::new();
        for server in servers {
            let parsed = DotServer::parse(server, name, ca_cert, connect_timeout_ms)?;
            new_servers.insert(parsed.addr, parsed);
        }

        let mut to_validate = Vec::new();
        {
            let mut state = self.state.lock();

            if !name.is_empty() {
                state.modes.insert(netid, PrivateDnsMode::Strict);
            } else if !new_servers.is_empty() {
                state.modes.insert(netid, PrivateDnsMode::Opportunistic);
            } else {
                state.modes.insert(netid, PrivateDnsMode::Off);
                state.trackers.remove(&netid);
                return Ok(());
            }

            let tracker = state.trackers.entry(netid).or_default();
            tracker.retain(|addr, _| new_servers.contains_key(addr));

            for (addr, server) in &new_servers {
                let needs_validation = match tracker.get(addr) {
                    None => true,
                    Some(t) if t.server != *server => true,
                    Some(t) => t.validation == Validation::Fail,
                };
                if needs_validation {
                    tracker.insert(
                        *addr,
                        TrackedServer {
                            server: server.clone(),
                            validation: Validation::InProcess,
                        },
                    );
                    debug!(netid, server = %addr, tracked = tracker.len(), "marked in_process");
                    to_validate.push(server.clone());
                }
            }
        }

        for server in to_validate {
            self.spawn_validator(server, netid, mark);
        }
        Ok(())
    }

    /// Cheap mode probe for event tagging.
    pub fn mode(&self, netid: u32) -> PrivateDnsMode {
        self.state
            .lock()
            .modes
            .get(&netid)
            .copied()
            .unwrap_or(PrivateDnsMode::Off)
    }

    /// Snapshot of the mode and server tracker for a network.
    pub fn status(&self, netid: u32) -> PrivateDnsStatus {
        let state = self.state.lock();
        let Some(mode) = state.modes.get(&netid) else {
            return PrivateDnsStatus::default();
        };
        let servers = state
            .trackers
            .get(&netid)
            .map(|tracker| {
                tracker
                    .values()
                    .map(|t| (t.server.clone(), t.validation))
                    .collect()
            })
            .unwrap_or_default();
        PrivateDnsStatus {
            mode: *mode,
            servers,
        }
    }

    /// Forgets everything about a network.
    pub fn clear(&self, netid: u32) {
        debug!(netid, "clearing private DNS state");
        let mut state = self.state.lock();
        state.modes.remove(&netid);
        state.trackers.remove(&netid);
    }

    /// Dispatches one query over TLS if policy allows.
    ///
    /// Strict mode with no validated server yet polls briefly for one
    /// before failing; opportunistic mode falls back to cleartext at the
    /// first sign of trouble.
    pub fn query(&self, netid: u32, query: &[u8], answer: &mut [u8]) -> DotQueryResult {
        let status = self.status(netid);
        if status.mode == PrivateDnsMode::Off {
            return DotQueryResult::Fallback;
        }

        let mut validated = status.validated_servers();
        if validated.is_empty() {
            if status.mode == PrivateDnsMode::Opportunistic {
                return DotQueryResult::Fallback;
            }
            for _ in 0..STRICT_WAIT_ROUNDS {
                thread::sleep(STRICT_WAIT_INTERVAL);
                validated = self.status(netid).validated_servers();
                if !validated.is_empty() {
                    break;
                }
            }
            if validated.is_empty() {
                return DotQueryResult::NetworkError;
            }
        }

        debug!(netid, "performing query over TLS");
        let response = self.transport.query(&validated, query, answer);
        debug!(netid, ?response, "TLS query result");

        match response {
            DotResponse::Success { len } => {
                let rcode = header::rcode(&answer[..len.min(answer.len())]).unwrap_or(0);
                DotQueryResult::Answer { len, rcode }
            }
            DotResponse::NetworkError | DotResponse::InternalError
                if status.mode == PrivateDnsMode::Opportunistic =>
            {
                DotQueryResult::Fallback
            }
            _ => DotQueryResult::NetworkError,
        }
    }

    fn spawn_validator(self: &Arc<Self>, server: DotServer, netid: u32, mark: u32) {
        let this = Arc::clone(self);
        let addr = server.addr;
        let spawned = thread::Builder::new()
            .name(format!("dot-validate-{netid}"))
            .spawn(move || {
                let mut backoff = BackoffSequence::builder().build();
                loop {
                    info!(netid, server = %server.addr, "validating private DNS server");
                    // Blocking network work; can take from milliseconds up
                    // to the SYN retry limit.
                    let success = this.transport.validate(&server, netid, mark);
                    if !this.record_validation(&server, netid, success) {
                        break;
                    }
                    thread::sleep(backoff.next_timeout());
                }
            });

        if let Err(err) = spawned {
            warn!(netid, %err, "failed to spawn validation thread");
            let mut state = self.state.lock();
            if let Some(t) = state
                .trackers
                .get_mut(&netid)
                .and_then(|tracker| tracker.get_mut(&addr))
            {
                t.validation = Validation::Fail;
            }
        }
    }

    /// Records a validation outcome. Returns true when the validator
    /// should sleep and try again (strict mode, still tracked, failed).
    fn record_validation(&self, server: &DotServer, netid: u32, success: bool) -> bool {
        let mut success = success;
        let needs_reevaluation;
        {
            let mut state = self.state.lock();

            let Some(mode) = state.modes.get(&netid).copied() else {
                warn!(netid, "no private DNS mode; dropping validation result");
                return false;
            };
            let Some(tracker) = state.trackers.get_mut(&netid) else {
                warn!(netid, "network removed during validation");
                return false;
            };

            let reevaluates = mode == PrivateDnsMode::Strict;
            let mut reevaluate = !success && reevaluates;

            match tracker.get_mut(&server.addr) {
                None => {
                    warn!(netid, server = %server.addr, "server removed during validation");
                    success = false;
                    reevaluate = false;
                }
                Some(t) if t.server != *server => {
                    // A newer configuration replaced this server while we
                    // were validating; its own validator owns the entry
                    // now. Record only the event.
                    warn!(netid, server = %server.addr, "server changed during validation");
                    success = false;
                    reevaluate = false;
                }
                Some(t) => {
                    t.validation = if success {
                        Validation::Success
                    } else if reevaluate {
                        Validation::InProcess
                    } else {
                        Validation::Fail
                    };
                }
            }
            needs_reevaluation = reevaluate;
        }

        info!(
            netid,
            server = %server.addr,
            success,
            "private DNS validation finished"
        );
        self.listener
            .on_validation_event(netid, &server.addr.to_string(), &server.name, success);

        needs_reevaluation
    }
}
