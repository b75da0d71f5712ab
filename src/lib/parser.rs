//! ## Worker Output Parser
//!
//! Extracts metrics from free-text worker output, one line at a time. Two independent
//! rules are applied to every line:
//!
//! - `Hashrate: <number> <unit>` with `<unit>` one of `H/s`, `KH/s`, `MH/s`, `GH/s`,
//!   `TH/s` (case-insensitive), normalized to MH/s;
//! - `Shares: <accepted>/<total>`.
//!
//! Lines matching neither rule produce no update. Worker output is not under our control,
//! so nothing here ever fails.

use once_cell::sync::Lazy;
use regex::Regex;

static HASHRATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)hashrate:\s*([0-9]+(?:\.[0-9]+)?)\s*([kmgt]?)h/s")
        .expect("hashrate pattern is valid")
});

static SHARES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)shares:\s*([0-9]+)\s*/\s*([0-9]+)").expect("shares pattern is valid")
});

/// Hash rate unit prefixes understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashRateUnit {
    Hs,
    KHs,
    MHs,
    GHs,
    THs,
}

impl HashRateUnit {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_uppercase().as_str() {
            "" => Some(HashRateUnit::Hs),
            "K" => Some(HashRateUnit::KHs),
            "M" => Some(HashRateUnit::MHs),
            "G" => Some(HashRateUnit::GHs),
            "T" => Some(HashRateUnit::THs),
            _ => None,
        }
    }

    /// Converts `value` expressed in this unit to MH/s.
    pub fn to_mhs(self, value: f64) -> f64 {
        match self {
            HashRateUnit::Hs => value / 1_000_000.0,
            HashRateUnit::KHs => value / 1000.0,
            HashRateUnit::MHs => value,
            HashRateUnit::GHs => value * 1000.0,
            HashRateUnit::THs => value * 1_000_000.0,
        }
    }
}

/// Cumulative share counters as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareReport {
    pub accepted: u64,
    pub total: u64,
}

impl ShareReport {
    pub fn rejected(&self) -> u64 {
        self.total - self.accepted
    }
}

/// Metrics extracted from one output line. Absent fields leave the job's stats untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricUpdate {
    /// Hash rate in MH/s.
    pub hash_rate: Option<f64>,
    pub shares: Option<ShareReport>,
    /// Position of the originating line in its pipe, assigned by the reader.
    pub sequence: u64,
}

impl MetricUpdate {
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hash_rate.is_none() && self.shares.is_none()
    }
}

/// Parses one line of worker output.
pub fn parse_line(line: &str) -> Option<MetricUpdate> {
    let update = MetricUpdate {
        hash_rate: parse_hash_rate(line),
        shares: parse_shares(line),
        sequence: 0,
    };
    (!update.is_empty()).then_some(update)
}

fn parse_hash_rate(line: &str) -> Option<f64> {
    let captures = HASHRATE.captures(line)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = HashRateUnit::from_prefix(captures.get(2)?.as_str())?;
    let mhs = unit.to_mhs(value);
    mhs.is_finite().then_some(mhs)
}

fn parse_shares(line: &str) -> Option<ShareReport> {
    let captures = SHARES.captures(line)?;
    let accepted: u64 = captures.get(1)?.as_str().parse().ok()?;
    let total: u64 = captures.get(2)?.as_str().parse().ok()?;
    (accepted <= total).then_some(ShareReport { accepted, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_kilohash_is_normalized() {
        let update = parse_line("Hashrate: 1500.0 KH/s").unwrap();
        assert!(approx_eq(update.hash_rate.unwrap(), 1.5));
        assert!(update.shares.is_none());
    }

    #[test]
    fn test_shares_line() {
        let update = parse_line("Shares: 950/1000").unwrap();
        let shares = update.shares.unwrap();
        assert_eq!(shares.accepted, 950);
        assert_eq!(shares.rejected(), 50);
        assert!(update.hash_rate.is_none());
    }

    #[test]
    fn test_units_are_consistent() {
        let kh = parse_line("Hashrate: 1000 KH/s").unwrap().hash_rate.unwrap();
        let mh = parse_line("Hashrate: 1 MH/s").unwrap().hash_rate.unwrap();
        let gh = parse_line("Hashrate: 0.001 GH/s").unwrap().hash_rate.unwrap();
        let th = parse_line("Hashrate: 0.000001 TH/s").unwrap().hash_rate.unwrap();
        let h = parse_line("Hashrate: 1000000 H/s").unwrap().hash_rate.unwrap();
        for value in [kh, gh, th, h] {
            assert!(approx_eq(value, mh), "{value} != {mh}");
        }
    }

    #[test]
    fn test_embedded_tokens_and_case() {
        let update = parse_line(
            "[2024-01-01 12:00:00] thread 3: hashrate: 12.5 kh/s, Shares: 10/12 (83%)",
        )
        .unwrap();
        assert!(approx_eq(update.hash_rate.unwrap(), 0.0125));
        assert_eq!(
            update.shares,
            Some(ShareReport {
                accepted: 10,
                total: 12
            })
        );
    }

    #[test]
    fn test_unrecognized_lines_yield_nothing() {
        for line in [
            "",
            "connecting to pool",
            "Hashrate: fast",
            "Hashrate: 12 PH/s",
            "Shares: 5/",
            "Shares: 11/10",
            "\u{fffd}\u{fffd} garbage",
        ] {
            assert_eq!(parse_line(line), None, "line: {line:?}");
        }
    }

    #[test]
    fn test_with_sequence() {
        let update = parse_line("Hashrate: 3 MH/s").unwrap().with_sequence(42);
        assert_eq!(update.sequence, 42);
    }
}
