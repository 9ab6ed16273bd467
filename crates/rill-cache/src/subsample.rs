//! Event subsampling configuration.
//!
//! Reporting every DNS exchange upstream would be overwhelming, so events
//! are sampled with a rate that varies by return code. The map is written
//! as space-separated `code:denominator` pairs; the distinguished key
//! `default` covers every code without an exact entry. A denominator of N
//! means "log 1 in N"; 0 means "never log".

use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::error;

/// Map applied when a network is created without an explicit override.
pub const DEFAULT_SUBSAMPLING_MAP: &str = "default:1 0:100 7:10";

/// Return-code keyed sampling denominators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsamplingMap {
    default_denom: Option<u32>,
    by_code: HashMap<i32, u32>,
}

impl SubsamplingMap {
    /// Parses the textual form, skipping malformed pairs.
    pub fn parse(text: &str) -> Self {
        let mut map = Self::default();
        for pair in text.split_whitespace() {
            let Some((code, denom)) = pair.split_once(':') else {
                error!(pair, "invalid subsampling pair");
                continue;
            };
            let Ok(denom) = denom.parse::<u32>() else {
                error!(pair, "invalid subsampling denominator");
                continue;
            };
            if code == "default" {
                map.default_denom = Some(denom);
            } else if let Ok(code) = code.parse::<i32>() {
                map.by_code.insert(code, denom);
            } else {
                error!(pair, "invalid subsampling return code");
            }
        }
        map
    }

    /// Denominator for a return code, falling back to the default entry.
    /// 0 means the event should never be logged.
    pub fn denom(&self, return_code: i32) -> u32 {
        self.by_code
            .get(&return_code)
            .copied()
            .or(self.default_denom)
            .unwrap_or(0)
    }

    /// Renders the map for diagnostics, one `code:denominator` per entry.
    pub fn dump(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(denom) = self.default_denom {
            out.push(format!("default:{denom}"));
        }
        let mut codes: Vec<_> = self.by_code.iter().collect();
        codes.sort();
        for (code, denom) in codes {
            let mut s = String::new();
            let _ = write!(s, "{code}:{denom}");
            out.push(s);
        }
        out
    }
}
