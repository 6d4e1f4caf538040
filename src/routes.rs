//! Default route, interface and address bootstrap.
//!
//! Resolves the tuple the engine needs before the first packet goes out:
//! the egress interface, its MAC, the local IPv4 address and the gateway
//! IPv4 address. The route and gateway come from `/proc/net/route`, the
//! MAC from sysfs, and the local address from the connected-UDP-socket
//! trick (the kernel routing table answers, no packet is sent).
//! `--local-addr` and `--gateway-addr` override their respective fields
//! independently.

use std::net::Ipv4Addr;

use crate::netdev::NetdevError;

/// Everything the engine needs to address the link layer. `gateway_mac`
/// starts zeroed and is filled in by ARP resolution.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub ifname: String,
    pub local_mac: [u8; 6],
    pub local_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: [u8; 6],
}

/// CLI overrides applied on top of the discovered route.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOverrides {
    pub local_addr: Option<Ipv4Addr>,
    pub gateway_addr: Option<Ipv4Addr>,
}

/// Startup resolution errors; all fatal.
#[derive(Debug, thiserror::Error)]
pub enum ResolvError {
    #[error("no default route found")]
    RouteResolveFailed,

    #[error("interface resolution failed: {0}")]
    IfaceResolveFailed(String),

    #[error("ARP resolution timed out after {0} seconds")]
    ArpTimeout(u64),

    #[error(transparent)]
    Netdev(#[from] NetdevError),

    #[error(transparent)]
    Pkt(#[from] crate::pkt::PktError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Discover the default route and local addressing, applying overrides.
#[cfg(target_os = "linux")]
pub fn discover(overrides: &RouteOverrides) -> Result<LinkInfo, ResolvError> {
    let table = std::fs::read_to_string("/proc/net/route")?;
    let (ifname, route_gateway) =
        parse_route_table(&table).ok_or(ResolvError::RouteResolveFailed)?;

    let mac_text = std::fs::read_to_string(format!("/sys/class/net/{ifname}/address"))
        .map_err(|e| ResolvError::IfaceResolveFailed(format!("{ifname}: {e}")))?;
    let local_mac = parse_mac(&mac_text)
        .ok_or_else(|| ResolvError::IfaceResolveFailed(format!("bad MAC for {ifname}")))?;

    let gateway_ip = overrides.gateway_addr.unwrap_or(route_gateway);
    let local_ip = match overrides.local_addr {
        Some(ip) => ip,
        None => crate::netdev::raw_sock::detect_source_ip(gateway_ip)?,
    };

    tracing::info!(
        interface = %ifname,
        local = %local_ip,
        gateway = %gateway_ip,
        "default route resolved"
    );

    Ok(LinkInfo {
        ifname,
        local_mac,
        local_ip,
        gateway_ip,
        gateway_mac: [0; 6],
    })
}

/// Find the default gateway in `/proc/net/route` text: the first entry
/// with destination 0.0.0.0 and the gateway flag set. Fields are
/// little-endian hex of the network-order address.
pub fn parse_route_table(table: &str) -> Option<(String, Ipv4Addr)> {
    const RTF_UP: u32 = 0x1;
    const RTF_GATEWAY: u32 = 0x2;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (Ok(dest), Ok(gateway), Ok(flags)) = (
            u32::from_str_radix(fields[1], 16),
            u32::from_str_radix(fields[2], 16),
            u32::from_str_radix(fields[3], 16),
        ) else {
            continue;
        };
        if dest == 0 && flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0 {
            return Some((fields[0].to_string(), Ipv4Addr::from(gateway.to_le_bytes())));
        }
    }
    None
}

/// Parse a sysfs `aa:bb:cc:dd:ee:ff` MAC address.
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
