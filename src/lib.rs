//! pktizr — scriptable, stateless, high-rate packet generator/analyzer.
//!
//! Crafts raw Ethernet/ARP/IPv4/ICMP/TCP/UDP packets from a per-scan
//! script, injects them at a rate-limited pace, captures every reply on
//! the interface and feeds it back to the script. Probes and replies are
//! correlated through keyed SYN cookies instead of per-flow state, so the
//! engine's memory use does not grow with the scan. Usable as a library
//! or via the CLI.

pub mod bucket;
pub mod cli;
pub mod engine;
pub mod netdev;
pub mod pkt;
pub mod queue;
pub mod ranges;
pub mod resolv;
pub mod routes;
pub mod script;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// Re-export the types a library user starts from.
pub use engine::{Engine, EngineError};
pub use netdev::{MockNetdev, Netdev, NetdevError};
pub use pkt::{CookieJar, Layer, Pkt, PktError};
pub use ranges::{parse_ports, parse_targets, RangeError, RangeSet};
pub use routes::{LinkInfo, ResolvError, RouteOverrides};
pub use script::{Script, ScriptEnv, ScriptError};

/// Resolved scan parameters, independent of how they were supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub targets: RangeSet,
    pub ports: RangeSet,
    /// Script name or path (selected by file stem).
    pub script: String,
    /// Probes per second; 0 disables throttling.
    pub rate: u64,
    /// Cookie key seed.
    pub seed: u64,
    /// Post-scan drain window in seconds.
    pub wait: u64,
    /// Duplicate probes per (target, port).
    pub count: u64,
    /// Suppress the status line.
    pub quiet: bool,
}

/// Engine counters. Single writer per counter, so relaxed ordering is
/// enough; values are monotonic.
#[derive(Debug, Default)]
pub struct ScanStats {
    /// Frames injected by the send worker.
    pub pkt_sent: AtomicU64,
    /// Injected frames that were probes.
    pub pkt_probe: AtomicU64,
    /// Captured packets the script accepted.
    pub pkt_recv: AtomicU64,
    /// Total probes the enumeration will produce.
    pub pkt_count: AtomicU64,
}

impl ScanStats {
    pub fn snapshot(&self) -> ScanSummary {
        ScanSummary {
            sent: self.pkt_sent.load(Ordering::Relaxed),
            probes: self.pkt_probe.load(Ordering::Relaxed),
            replies: self.pkt_recv.load(Ordering::Relaxed),
            elapsed_ms: 0,
        }
    }
}

/// Final counters of one scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub sent: u64,
    pub probes: u64,
    pub replies: u64,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ScanConfig {
        ScanConfig {
            targets: parse_targets("192.0.2.0/30").unwrap(),
            ports: parse_ports("22,80").unwrap(),
            script: "syn".to_string(),
            rate: 100,
            seed: 7,
            wait: 5,
            count: 1,
            quiet: false,
        }
    }

    #[test]
    fn test_scan_config_serde_roundtrip() {
        let cfg = sample_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ScanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.targets, cfg.targets);
        assert_eq!(back.ports, cfg.ports);
        assert_eq!(back.script, cfg.script);
        assert_eq!(back.rate, cfg.rate);
        assert_eq!(back.seed, cfg.seed);
        assert_eq!(back.wait, cfg.wait);
        assert_eq!(back.count, cfg.count);
        assert_eq!(back.quiet, cfg.quiet);
    }

    #[test]
    fn test_stats_snapshot_reads_counters() {
        let stats = ScanStats::default();
        stats.pkt_sent.store(10, Ordering::Relaxed);
        stats.pkt_probe.store(8, Ordering::Relaxed);
        stats.pkt_recv.store(3, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 10);
        assert_eq!(snap.probes, 8);
        assert_eq!(snap.replies, 3);
    }

    #[test]
    fn test_summary_serializes() {
        let summary = ScanSummary {
            sent: 4,
            probes: 4,
            replies: 2,
            elapsed_ms: 1234,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"replies\":2"));
    }
}
