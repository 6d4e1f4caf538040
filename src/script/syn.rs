//! TCP SYN scan.
//!
//! Probes are bare SYNs whose initial sequence number is the 32-bit cookie
//! of the flow tuple. A SYN-ACK acknowledging cookie+1 proves the reply
//! belongs to one of our probes without any per-flow state; the half-open
//! connection is torn down with an immediate RST so the target's backlog
//! is not consumed. RST replies with the same acknowledgement mark the
//! port closed.

use std::net::Ipv4Addr;

use crate::pkt::{Ip4Hdr, Layer, Pkt, TcpHdr};

use super::{Script, ScriptEnv, ScriptError, PROBE_SPORT};

#[derive(Debug, Default)]
pub struct SynScan;

impl SynScan {
    pub fn new() -> Self {
        Self
    }
}

impl Script for SynScan {
    fn name(&self) -> &'static str {
        "syn"
    }

    fn pkt_loop(
        &mut self,
        env: &ScriptEnv<'_>,
        daddr: Ipv4Addr,
        dport: u16,
    ) -> Result<Option<Pkt>, ScriptError> {
        let mut ip4 = Ip4Hdr::new(env.local_ip, daddr);
        ip4.id = rand::random();
        ip4.df = true;

        let mut tcp = TcpHdr::new(PROBE_SPORT, dport);
        tcp.syn = true;
        tcp.seq = env.cookie32(env.local_ip, daddr, PROBE_SPORT, dport);

        Ok(Some(Pkt::from_layers(vec![
            Layer::Ip4(ip4),
            Layer::Tcp(tcp),
        ])))
    }

    fn pkt_recv(&mut self, env: &ScriptEnv<'_>, pkt: &Pkt) -> Result<bool, ScriptError> {
        let (Some(ip4), Some(tcp)) = (pkt.ip4(), pkt.tcp()) else {
            return Ok(false);
        };
        if tcp.dport != PROBE_SPORT || !tcp.ack {
            return Ok(false);
        }

        // The probe's ISN was cookie32(local → remote); the reply swaps
        // the tuple around, so recompute from its own addressing.
        let cookie = env.cookie32(ip4.dst, ip4.src, tcp.dport, tcp.sport);
        if tcp.ack_seq.wrapping_sub(1) != cookie {
            return Ok(false);
        }

        if tcp.syn {
            println!("{} port {} open", ip4.src, tcp.sport);

            // Tear down the half-open connection.
            let mut rst = TcpHdr::new(PROBE_SPORT, tcp.sport);
            rst.rst = true;
            rst.seq = tcp.ack_seq;
            rst.window = 0;
            let mut ip = Ip4Hdr::new(ip4.dst, ip4.src);
            ip.id = rand::random();
            ip.df = true;
            let mut teardown = Pkt::from_layers(vec![Layer::Ip4(ip), Layer::Tcp(rst)]);
            teardown.probe = false;
            env.send(teardown)?;
            return Ok(true);
        }

        if tcp.rst {
            tracing::debug!(host = %ip4.src, port = tcp.sport, "port closed");
            return Ok(true);
        }

        Ok(false)
    }
}
