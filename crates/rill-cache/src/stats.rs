//! Per-server reachability statistics.
//!
//! The send engine records one sample per server for the first attempt of
//! each query. Samples live in a small ring; aggregation over the ring
//! decides whether a server is still worth querying.

use crate::config::ResolverParams;
use rill_proto::rcode::{RCODE_INTERNAL_ERROR, RCODE_TIMEOUT};
use rill_proto::ResponseCode;
use tracing::debug;

/// Hard upper bound on the sample ring, regardless of configuration.
pub const MAX_SAMPLES: usize = 64;

/// One recorded exchange with a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Wall-clock seconds when the sample was taken.
    pub at: u64,

    /// Response code of the attempt, or one of the out-of-band codes for
    /// timeouts and internal failures.
    pub rcode: u8,

    /// Round-trip time in milliseconds.
    pub rtt_ms: u32,
}

/// Ring of recent samples for one server.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    samples: Vec<Sample>,
    next: usize,
    count: usize,
}

impl ServerStats {
    /// Appends a sample, overwriting the oldest once the ring is full.
    pub fn push(&mut self, sample: Sample, max_samples: usize) {
        if max_samples == 0 {
            return;
        }
        let max = max_samples.min(MAX_SAMPLES);
        debug!(next = self.next, count = self.count, "adding sample");
        if self.next < self.samples.len() {
            self.samples[self.next] = sample;
        } else {
            self.samples.push(sample);
        }
        if self.count < max {
            self.count += 1;
        }
        self.next += 1;
        if self.next >= max {
            self.next = 0;
        }
    }

    /// Drops all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
        self.count = 0;
    }

    /// Number of live samples.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true when no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates over the live samples.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter().take(self.count)
    }

    /// Folds the ring into per-outcome counters.
    pub fn aggregate(&self) -> StatsAggregate {
        let mut agg = StatsAggregate::default();
        let mut rtt_sum: u64 = 0;
        for sample in self.samples() {
            match sample.rcode {
                r if r == u8::from(ResponseCode::NoError)
                    || r == u8::from(ResponseCode::NXDomain) =>
                {
                    agg.successes += 1;
                    rtt_sum += u64::from(sample.rtt_ms);
                }
                RCODE_TIMEOUT => agg.timeouts += 1,
                RCODE_INTERNAL_ERROR => agg.internal_errors += 1,
                _ => agg.errors += 1,
            }
            agg.last_sample_at = agg.last_sample_at.max(sample.at);
        }
        if agg.successes > 0 {
            agg.rtt_avg_ms = (rtt_sum / u64::from(agg.successes)) as u32;
        }
        agg
    }
}

/// Aggregated view of one server's recent samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsAggregate {
    /// Exchanges that produced a usable answer (NoError or NXDomain).
    pub successes: u32,

    /// Exchanges answered with any other response code.
    pub errors: u32,

    /// Attempts that hit the per-attempt deadline.
    pub timeouts: u32,

    /// Attempts that failed before reaching the network.
    pub internal_errors: u32,

    /// Mean round-trip time over the successful exchanges, milliseconds.
    pub rtt_avg_ms: u32,

    /// Wall-clock seconds of the newest sample.
    pub last_sample_at: u64,
}

/// Computes the per-server usability mask for one pass of the send loop.
///
/// A server is unusable when it has at least `min_samples` judged samples
/// and its success rate is below the configured threshold. Stats whose
/// newest sample fell out of the validity window are cleared (in this
/// snapshot only) rather than held against the server. When every server
/// would be unusable, all of them are tried anyway.
///
/// Returns the mask and the number of usable servers.
pub fn usable_servers(
    params: &ResolverParams,
    stats: &mut [ServerStats],
    now: u64,
) -> (Vec<bool>, usize) {
    let mut usable = vec![true; stats.len()];
    if params.sample_validity_seconds == 0 {
        return (usable, stats.len());
    }

    for (i, server_stats) in stats.iter_mut().enumerate() {
        let agg = server_stats.aggregate();
        // Internal errors say nothing about the server.
        let total = agg.successes + agg.errors + agg.timeouts;
        if total < u32::from(params.min_samples) {
            continue;
        }
        let success_rate = agg.successes * 100 / total;
        if success_rate >= u32::from(params.success_threshold_percent) {
            continue;
        }
        if now.saturating_sub(agg.last_sample_at) > u64::from(params.sample_validity_seconds) {
            // The failures are old news; start judging afresh.
            server_stats.clear();
        } else {
            debug!(server = i, success_rate, "server below success threshold");
            usable[i] = false;
        }
    }

    let count = usable.iter().filter(|u| **u).count();
    if count == 0 {
        usable.iter_mut().for_each(|u| *u = true);
        return (usable, stats.len());
    }
    (usable, count)
}
