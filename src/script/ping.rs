//! ICMP echo sweep.
//!
//! Echo requests carry id 1 and a cookie16 sequence number, with the send
//! timestamp as an 8-byte payload. Replies are matched on the cookie and
//! the payload yields the round-trip time. The port argument is ignored;
//! ping runs over the default port set `{0}`.

use std::net::Ipv4Addr;

use crate::pkt::{IcmpHdr, Ip4Hdr, Layer, Pkt};

use super::{Script, ScriptEnv, ScriptError, PROBE_SPORT};

/// ICMP echo identifier stamped on every request.
const ECHO_ID: u16 = 1;

#[derive(Debug, Default)]
pub struct Ping;

impl Ping {
    pub fn new() -> Self {
        Self
    }
}

impl Script for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn pkt_loop(
        &mut self,
        env: &ScriptEnv<'_>,
        daddr: Ipv4Addr,
        _dport: u16,
    ) -> Result<Option<Pkt>, ScriptError> {
        let mut ip4 = Ip4Hdr::new(env.local_ip, daddr);
        ip4.id = rand::random();

        let seq = env.cookie16(env.local_ip, daddr, PROBE_SPORT, 0);
        let icmp = IcmpHdr::echo_request(ECHO_ID, seq);
        let stamp = env.now_micros().to_be_bytes().to_vec();

        Ok(Some(Pkt::from_layers(vec![
            Layer::Ip4(ip4),
            Layer::Icmp(icmp),
            Layer::Raw(stamp),
        ])))
    }

    fn pkt_recv(&mut self, env: &ScriptEnv<'_>, pkt: &Pkt) -> Result<bool, ScriptError> {
        let (Some(ip4), Some(icmp)) = (pkt.ip4(), pkt.icmp()) else {
            return Ok(false);
        };
        // Echo reply addressed to us, carrying our id.
        if icmp.icmp_type != 0 || icmp.id != ECHO_ID {
            return Ok(false);
        }
        if icmp.seq != env.cookie16(ip4.dst, ip4.src, PROBE_SPORT, 0) {
            return Ok(false);
        }

        match pkt.raw() {
            Some(payload) if payload.len() >= 8 => {
                let then = u64::from_be_bytes(payload[..8].try_into().unwrap());
                let rtt_us = env.now_micros().saturating_sub(then);
                println!("{} is alive ({:.3} ms)", ip4.src, rtt_us as f64 / 1000.0);
            }
            _ => {
                // Some stacks truncate or rewrite the payload; the cookie
                // match alone is proof of life.
                println!("{} is alive", ip4.src);
            }
        }
        Ok(true)
    }
}
