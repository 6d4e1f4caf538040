//! Command line interface.
//!
//! `pktizr <targets> -S <script> [options]` — targets are a
//! comma-separated list of addresses, address ranges and CIDR blocks.
//! Parsing errors are fatal before any thread or socket exists.

pub mod status;

use std::net::Ipv4Addr;

use clap::Parser;

use crate::ranges::{self, RangeError};
use crate::routes::RouteOverrides;
use crate::ScanConfig;

/// pktizr — scriptable, stateless packet generator and analyzer.
#[derive(Parser, Debug)]
#[command(name = "pktizr", version, about)]
#[command(
    long_about = "pktizr crafts raw network packets from a script, injects them at a \
    rate-limited pace and hands every captured reply back to the script. SYN cookies \
    correlate replies to probes without per-flow state. Requires CAP_NET_RAW (sudo)."
)]
pub struct Cli {
    /// Targets: comma-separated A.B.C.D, A.B.C.D-E.F.G.H or A.B.C.D/prefix
    pub targets: String,

    /// Load and run the given script ("syn", "ping", or a path)
    #[arg(short = 'S', long)]
    pub script: String,

    /// Use the specified port ranges ("a", "a-b", comma-joined)
    #[arg(short, long, default_value = "1")]
    pub ports: String,

    /// Send packets no faster than this rate (probes/sec; 0 = unthrottled)
    #[arg(short, long, default_value_t = 100)]
    pub rate: u64,

    /// Use the given number as the cookie seed (default: OS entropy)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Wait this many seconds for late replies after the scan completes
    #[arg(short, long, default_value_t = 5)]
    pub wait: u64,

    /// Send this many duplicate probes per (target, port)
    #[arg(short, long, default_value_t = 1)]
    pub count: u64,

    /// Override the source IPv4 address (default: interface address)
    #[arg(short = 'l', long)]
    pub local_addr: Option<Ipv4Addr>,

    /// Override the gateway IPv4 address (default: default route)
    #[arg(short = 'g', long)]
    pub gateway_addr: Option<Ipv4Addr>,

    /// Don't show the status line
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Parse ranges and resolve the seed into an executable configuration.
    pub fn into_config(self) -> Result<(ScanConfig, RouteOverrides), RangeError> {
        let targets = ranges::parse_targets(&self.targets)?;
        let ports = ranges::parse_ports(&self.ports)?;
        let seed = self.seed.unwrap_or_else(rand::random);

        let overrides = RouteOverrides {
            local_addr: self.local_addr,
            gateway_addr: self.gateway_addr,
        };

        Ok((
            ScanConfig {
                targets,
                ports,
                script: self.script,
                rate: self.rate,
                seed,
                wait: self.wait,
                count: self.count,
                quiet: self.quiet,
            },
            overrides,
        ))
    }
}
