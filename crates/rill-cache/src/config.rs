//! Resolver parameters and limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of nameservers kept per network.
pub const MAXNS: usize = 4;

/// Maximum number of search domains kept per network.
pub const MAXDNSRCH: usize = 6;

/// Maximum length of a single search domain, including the terminator.
pub const MAXDNSRCHPATH: usize = 256;

/// Cache capacity per network.
///
/// Sized for a system-wide cache: a base of 64 names per typical browsing
/// session, doubled because every lookup issues an A and a AAAA query, and
/// multiplied by five for the many processes sharing one cache.
pub const MAX_CACHE_ENTRIES: usize = 64 * 2 * 5;

/// Longest a thread waits for another thread's in-flight resolution of the
/// same query before giving up and resolving it itself.
pub const PENDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Cleartext DNS port.
pub const DNS_PORT: u16 = 53;

/// Default number of passes over the server list.
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Default base timeout per attempt, in milliseconds.
pub const DEFAULT_BASE_TIMEOUT_MSEC: u32 = 5000;

/// A server whose success rate over the sample window drops below this
/// percentage is skipped.
pub const DEFAULT_SUCCESS_THRESHOLD: u8 = 75;

/// How long collected samples stay relevant, in seconds.
pub const DEFAULT_SAMPLE_VALIDITY: u32 = 1800;

/// Per-network resolver tuning, supplied by the host alongside the
/// nameserver list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverParams {
    /// Seconds for which reachability samples count toward usability.
    /// 0 disables server skipping entirely.
    pub sample_validity_seconds: u32,

    /// Minimum success percentage for a server to stay usable.
    pub success_threshold_percent: u8,

    /// Number of samples required before a server can be judged.
    pub min_samples: u8,

    /// Size of the per-server sample ring.
    pub max_samples: u8,

    /// Base per-attempt timeout in milliseconds. 0 selects the default.
    pub base_timeout_msec: u32,

    /// Passes over the server list. 0 selects the default.
    pub retry_count: u32,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            sample_validity_seconds: DEFAULT_SAMPLE_VALIDITY,
            success_threshold_percent: DEFAULT_SUCCESS_THRESHOLD,
            min_samples: 8,
            max_samples: crate::stats::MAX_SAMPLES as u8,
            base_timeout_msec: DEFAULT_BASE_TIMEOUT_MSEC,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl ResolverParams {
    /// Replaces the zero placeholders the host may pass with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.base_timeout_msec == 0 {
            self.base_timeout_msec = DEFAULT_BASE_TIMEOUT_MSEC;
        }
        if self.retry_count == 0 {
            self.retry_count = DEFAULT_RETRY_COUNT;
        }
        self
    }
}
