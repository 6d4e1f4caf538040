//! pktizr CLI entrypoint.
//!
//! Usage:
//!   pktizr <targets> -S <script> [-p PORTS] [-r RATE] [-s SEED]
//!          [-w WAIT] [-c COUNT] [-l ADDR] [-g ADDR] [-q]
//!
//! Startup errors (ranges, route, netdev, ARP, script) abort with a
//! message and a non-zero exit; per-packet errors never do.

use clap::Parser;
use pktizr::cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialise logging (RUST_LOG=debug etc.); status output owns the
    // terminal so logs go to stderr alongside it.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (cfg, overrides) = match cli.into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    run(cfg, overrides);
}

#[cfg(target_os = "linux")]
fn run(cfg: pktizr::ScanConfig, overrides: pktizr::RouteOverrides) {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use pktizr::netdev::{Netdev, RawSockNetdev};

    let mut link = match pktizr::routes::discover(&overrides) {
        Ok(link) => link,
        Err(e) => {
            eprintln!("Error resolving route: {e}");
            std::process::exit(1);
        }
    };

    let netdev: Arc<dyn Netdev> = match RawSockNetdev::open(&link.ifname) {
        Ok(dev) => Arc::new(dev),
        Err(e) => {
            eprintln!("Error opening netdev: {e}");
            std::process::exit(1);
        }
    };

    link.gateway_mac = match pktizr::resolv::resolve_gateway_mac(
        netdev.as_ref(),
        link.local_mac,
        link.local_ip,
        link.gateway_ip,
    ) {
        Ok(mac) => mac,
        Err(e) => {
            eprintln!("Error resolving gateway MAC: {e}");
            std::process::exit(1);
        }
    };

    // Signals land on the main thread only; workers observe the flag.
    let interrupt = Arc::new(AtomicBool::new(false));
    for sig in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGTERM,
    ] {
        if let Err(e) = signal_hook::flag::register(sig, interrupt.clone()) {
            eprintln!("Error installing signal handler: {e}");
            std::process::exit(1);
        }
    }

    let engine = pktizr::Engine::new(cfg, link, netdev, interrupt);
    match engine.run() {
        Ok(summary) => {
            eprintln!(
                "Sent {} packets ({} probes), got {} replies in {:.1}s",
                summary.sent,
                summary.probes,
                summary.replies,
                summary.elapsed_ms as f64 / 1000.0
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_cfg: pktizr::ScanConfig, _overrides: pktizr::RouteOverrides) {
    eprintln!("Error: pktizr needs Linux (AF_PACKET raw sockets)");
    std::process::exit(1);
}
