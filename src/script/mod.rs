//! Script host: the contract between the engine and packet logic.
//!
//! A script decides what each probe looks like (`pkt_loop`) and what each
//! captured frame means (`pkt_recv`). The engine loads one independent
//! instance per worker thread; instances share no state and correlate
//! probes with replies purely through SYN cookies carried on the wire.
//!
//! Scripts ship compiled in and are selected by name; a path argument
//! selects by file stem, so `-S scripts/syn.lua` and `-S syn` are the
//! same script.

mod ping;
mod syn;

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::netdev::{Netdev, NetdevError};
use crate::pkt::{codec, CookieJar, Pkt, PktError};
use crate::routes::LinkInfo;

pub use ping::Ping;
pub use syn::SynScan;

/// Fixed source port stamped on probes by the built-in scripts.
pub const PROBE_SPORT: u16 = 64434;

/// Per-call script failures; logged and the triggering packet dropped.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("unknown script '{0}'")]
    UnknownScript(String),

    #[error(transparent)]
    Pkt(#[from] PktError),

    #[error(transparent)]
    Netdev(#[from] NetdevError),
}

/// Capabilities the host exposes to a script: local addressing, the cookie
/// key, wall-clock time and synchronous injection.
pub struct ScriptEnv<'a> {
    pub local_ip: Ipv4Addr,
    pub local_mac: [u8; 6],
    pub gateway_mac: [u8; 6],
    cookies: CookieJar,
    netdev: &'a dyn Netdev,
}

impl<'a> ScriptEnv<'a> {
    pub fn new(link: &LinkInfo, cookies: CookieJar, netdev: &'a dyn Netdev) -> Self {
        Self {
            local_ip: link.local_ip,
            local_mac: link.local_mac,
            gateway_mac: link.gateway_mac,
            cookies,
            netdev,
        }
    }

    pub fn cookie32(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u32 {
        self.cookies.cookie32(saddr, daddr, sport, dport)
    }

    pub fn cookie16(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u16 {
        self.cookies.cookie16(saddr, daddr, sport, dport)
    }

    /// Microseconds since the Unix epoch.
    pub fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// Inject a chain immediately, bypassing the rate limiter and the
    /// outbound queue. Meant for handshake follow-ups (RST teardown)
    /// where queueing latency would lose the window.
    pub fn send(&self, mut pkt: Pkt) -> Result<(), ScriptError> {
        pkt.ensure_eth(self.local_mac, self.gateway_mac);
        let mut buf = [0u8; 2048];
        let n = codec::pack(&mut buf, &pkt)?;
        self.netdev.inject(&buf[..n])?;
        Ok(())
    }
}

/// Packet logic loaded per worker thread.
pub trait Script: Send {
    fn name(&self) -> &'static str;

    /// Build the outbound chain for one (target, port) step, or `None` to
    /// skip it. The engine marks returned chains as probes and enqueues
    /// them.
    fn pkt_loop(
        &mut self,
        env: &ScriptEnv<'_>,
        daddr: Ipv4Addr,
        dport: u16,
    ) -> Result<Option<Pkt>, ScriptError>;

    /// Inspect one decoded inbound chain. Returning `true` counts the
    /// packet as accepted. May call [`ScriptEnv::send`] to reply.
    fn pkt_recv(&mut self, env: &ScriptEnv<'_>, pkt: &Pkt) -> Result<bool, ScriptError>;
}

/// Load a fresh script instance by name or path. Each call returns an
/// independent context.
pub fn load(spec: &str) -> Result<Box<dyn Script>, ScriptError> {
    let name = Path::new(spec)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(spec);
    match name {
        "syn" => Ok(Box::new(SynScan::new())),
        "ping" => Ok(Box::new(Ping::new())),
        _ => Err(ScriptError::UnknownScript(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::MockNetdev;
    use crate::pkt::{Ip4Hdr, Layer, TcpHdr};

    fn link() -> LinkInfo {
        LinkInfo {
            ifname: "mock0".into(),
            local_mac: [0x02, 0, 0, 0, 0, 1],
            local_ip: Ipv4Addr::new(10, 0, 0, 9),
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            gateway_mac: [0x52, 0x54, 0, 0, 0, 2],
        }
    }

    #[test]
    fn test_load_by_name() {
        assert_eq!(load("syn").unwrap().name(), "syn");
        assert_eq!(load("ping").unwrap().name(), "ping");
    }

    #[test]
    fn test_load_by_path_uses_stem() {
        assert_eq!(load("scripts/syn.lua").unwrap().name(), "syn");
        assert_eq!(load("/usr/share/pktizr/ping.lua").unwrap().name(), "ping");
    }

    #[test]
    fn test_load_unknown_fails() {
        assert!(matches!(
            load("no-such-script"),
            Err(ScriptError::UnknownScript(_))
        ));
    }

    #[test]
    fn test_env_send_prepends_ethernet() {
        let dev = MockNetdev::new();
        let link = link();
        let env = ScriptEnv::new(&link, CookieJar::from_seed(1), &dev);

        let mut tcp = TcpHdr::new(PROBE_SPORT, 80);
        tcp.rst = true;
        let chain = Pkt::from_layers(vec![
            Layer::Ip4(Ip4Hdr::new(link.local_ip, Ipv4Addr::new(192, 0, 2, 5))),
            Layer::Tcp(tcp),
        ]);
        env.send(chain).unwrap();

        let frames = dev.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][0..6], &link.gateway_mac, "dst MAC is the gateway");
        assert_eq!(&frames[0][6..12], &link.local_mac);
    }

    #[test]
    fn test_env_cookies_match_jar() {
        let dev = MockNetdev::new();
        let link = link();
        let jar = CookieJar::from_seed(9);
        let env = ScriptEnv::new(&link, jar, &dev);
        let d = Ipv4Addr::new(192, 0, 2, 5);
        assert_eq!(
            env.cookie32(link.local_ip, d, PROBE_SPORT, 80),
            jar.cookie32(link.local_ip, d, PROBE_SPORT, 80)
        );
    }

    #[test]
    fn test_env_now_micros_monotonic_enough() {
        let dev = MockNetdev::new();
        let link = link();
        let env = ScriptEnv::new(&link, CookieJar::from_seed(1), &dev);
        let a = env.now_micros();
        let b = env.now_micros();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000, "epoch micros expected");
    }
}
