//! Gateway MAC resolution over ARP.
//!
//! Broadcasts an ARP request for the gateway, then polls the capture path
//! until a reply arrives whose protocol source is the gateway and protocol
//! destination is us. Everything else on the wire is ignored. Gives up
//! after five seconds.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::netdev::Netdev;
use crate::pkt::{codec, ArpHdr, EthHdr, Layer, Pkt, ARP_OP_REPLY, MAC_BROADCAST};
use crate::routes::ResolvError;

const ARP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve the gateway's MAC address. Fatal at startup on timeout.
pub fn resolve_gateway_mac(
    netdev: &dyn Netdev,
    local_mac: [u8; 6],
    local_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
) -> Result<[u8; 6], ResolvError> {
    resolve_with_timeout(netdev, local_mac, local_ip, gateway_ip, ARP_TIMEOUT)
}

fn resolve_with_timeout(
    netdev: &dyn Netdev,
    local_mac: [u8; 6],
    local_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    timeout: Duration,
) -> Result<[u8; 6], ResolvError> {
    let request = Pkt::from_layers(vec![
        Layer::Eth(EthHdr::new(local_mac, MAC_BROADCAST)),
        Layer::Arp(ArpHdr::request(local_mac, local_ip, gateway_ip)),
    ]);
    let mut buf = [0u8; 64];
    let len = codec::pack(&mut buf, &request)?;
    netdev.inject(&buf[..len])?;

    tracing::debug!(gateway = %gateway_ip, "ARP request sent, waiting for reply");

    let start = Instant::now();
    let mut capture = [0u8; 2048];
    while start.elapsed() < timeout {
        let Some(n) = netdev.capture(&mut capture)? else {
            continue;
        };
        let Ok(reply) = codec::unpack(&capture[..n]) else {
            continue;
        };
        let Some(arp) = reply.arp() else {
            continue;
        };
        if arp.op == ARP_OP_REPLY && arp.psrc == gateway_ip && arp.pdst == local_ip {
            tracing::info!(
                gateway = %gateway_ip,
                mac = %format_mac(&arp.hwsrc),
                "gateway resolved"
            );
            return Ok(arp.hwsrc);
        }
    }

    Err(ResolvError::ArpTimeout(timeout.as_secs()))
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
