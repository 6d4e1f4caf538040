//! Wire codec: chain → bytes (`pack`) and bytes → chain (`unpack`).
//!
//! `pack` walks the chain outer→inner, writing each header with placeholder
//! length/checksum fields, recursing for the payload, then back-patching.
//! TCP and UDP checksums fold in the pseudo-header of the immediately
//! preceding IPv4 layer; its absence is an encode error.
//!
//! `unpack` starts at Ethernet and dispatches on ethertype and IPv4
//! protocol. Unknown protocols and trailing payload bytes become a final
//! `Raw` record; declared lengths that overrun the frame are `Truncated`,
//! and an IPv4 header whose stored checksum does not verify is
//! `BadChecksum`. Either way the caller drops the frame and carries on.

use std::net::Ipv4Addr;

use super::checksum;
use super::cursor::{Cursor, Reader};
use super::{
    ArpHdr, EthHdr, IcmpHdr, Ip4Hdr, Layer, Pkt, PktError, TcpHdr, UdpHdr, ETHERTYPE_ARP,
    ETHERTYPE_IP4, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};

// ─────────────────────────────────────────────────────────────────────────────
// Encode
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize a chain into `buf`, returning the frame length.
pub fn pack(buf: &mut [u8], pkt: &Pkt) -> Result<usize, PktError> {
    if pkt.layers.is_empty() {
        return Err(PktError::BadChain("empty chain"));
    }
    for (i, layer) in pkt.layers.iter().enumerate() {
        if matches!(layer, Layer::Raw(_)) && i != pkt.layers.len() - 1 {
            return Err(PktError::BadChain("raw payload must be the final layer"));
        }
    }
    let mut cur = Cursor::new(buf);
    pack_layers(&mut cur, &pkt.layers, None)
}

/// Pseudo-header context handed down from the enclosing IPv4 layer.
#[derive(Clone, Copy)]
struct PseudoCtx {
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn pack_layers(cur: &mut Cursor, layers: &[Layer], ip: Option<PseudoCtx>) -> Result<usize, PktError> {
    let Some((layer, rest)) = layers.split_first() else {
        return Ok(0);
    };

    match layer {
        Layer::Eth(eth) => pack_eth(cur, eth, rest),
        Layer::Arp(arp) => pack_arp(cur, arp, rest),
        Layer::Ip4(ip4) => pack_ip4(cur, ip4, rest),
        Layer::Icmp(icmp) => pack_icmp(cur, icmp, rest, ip),
        Layer::Tcp(tcp) => pack_tcp(cur, tcp, rest, ip),
        Layer::Udp(udp) => pack_udp(cur, udp, rest, ip),
        Layer::Raw(bytes) => {
            cur.put_bytes(bytes)?;
            Ok(bytes.len())
        }
    }
}

fn pack_eth(cur: &mut Cursor, eth: &EthHdr, rest: &[Layer]) -> Result<usize, PktError> {
    let start = cur.pos();
    cur.put_bytes(&eth.dst)?;
    cur.put_bytes(&eth.src)?;
    let ethertype = match rest.first() {
        Some(Layer::Ip4(_)) => ETHERTYPE_IP4,
        Some(Layer::Arp(_)) => ETHERTYPE_ARP,
        None => eth.ethertype,
        Some(Layer::Raw(_)) => return Err(PktError::BadChain("raw directly after ethernet")),
        Some(_) => return Err(PktError::BadChain("ethernet payload must be IPv4 or ARP")),
    };
    cur.put_u16(ethertype)?;
    pack_layers(cur, rest, None)?;
    Ok(cur.pos() - start)
}

fn pack_arp(cur: &mut Cursor, arp: &ArpHdr, rest: &[Layer]) -> Result<usize, PktError> {
    if !rest.is_empty() {
        return Err(PktError::BadChain("ARP must be the final header"));
    }
    let start = cur.pos();
    cur.put_u16(arp.hwtype)?;
    cur.put_u16(arp.ptype)?;
    cur.put_u8(6)?; // hardware address length
    cur.put_u8(4)?; // protocol address length
    cur.put_u16(arp.op)?;
    cur.put_bytes(&arp.hwsrc)?;
    cur.put_bytes(&arp.psrc.octets())?;
    cur.put_bytes(&arp.hwdst)?;
    cur.put_bytes(&arp.pdst.octets())?;
    Ok(cur.pos() - start)
}

fn pack_ip4(cur: &mut Cursor, ip4: &Ip4Hdr, rest: &[Layer]) -> Result<usize, PktError> {
    if ip4.options.len() > 40 || ip4.options.len() % 4 != 0 {
        return Err(PktError::BadOptions("ip4", ip4.options.len()));
    }
    let proto = match rest.first() {
        Some(Layer::Icmp(_)) => IPPROTO_ICMP,
        Some(Layer::Tcp(_)) => IPPROTO_TCP,
        Some(Layer::Udp(_)) => IPPROTO_UDP,
        // Unknown payloads re-encode with the decoded protocol number.
        Some(Layer::Raw(_)) | None => ip4.proto,
        Some(_) => return Err(PktError::BadChain("invalid layer after IPv4")),
    };

    let start = cur.pos();
    let ihl = 5 + ip4.options.len() / 4;
    cur.put_u8(0x40 | ihl as u8)?; // version 4 in the high nibble
    cur.put_u8(0)?; // DSCP/ECN
    cur.put_u16(0)?; // total length, patched below
    cur.put_u16(ip4.id)?;
    let mut frag = ip4.frag_off & 0x1fff;
    if ip4.df {
        frag |= 0x4000;
    }
    if ip4.mf {
        frag |= 0x2000;
    }
    cur.put_u16(frag)?;
    cur.put_u8(ip4.ttl)?;
    cur.put_u8(proto)?;
    cur.put_u16(0)?; // header checksum, patched below
    cur.put_bytes(&ip4.src.octets())?;
    cur.put_bytes(&ip4.dst.octets())?;
    cur.put_bytes(&ip4.options)?;
    let hdr_len = cur.pos() - start;

    let payload = pack_layers(
        cur,
        rest,
        Some(PseudoCtx {
            src: ip4.src,
            dst: ip4.dst,
        }),
    )?;

    let total = hdr_len + payload;
    cur.patch_u16(start + 2, total as u16)?;
    // Length must be in place before the header sum; checksum covers the
    // header only, with its own field still zero.
    let sum = checksum::internet(cur.span(start, start + hdr_len));
    cur.patch_u16(start + 10, sum)?;
    Ok(total)
}

fn pack_icmp(
    cur: &mut Cursor,
    icmp: &IcmpHdr,
    rest: &[Layer],
    _ip: Option<PseudoCtx>,
) -> Result<usize, PktError> {
    let start = cur.pos();
    cur.put_u8(icmp.icmp_type)?;
    cur.put_u8(icmp.code)?;
    cur.put_u16(0)?; // checksum, patched below
    cur.put_u16(icmp.id)?;
    cur.put_u16(icmp.seq)?;
    let payload = pack_layers(cur, rest, None)?;
    let total = cur.pos() - start;
    debug_assert_eq!(total, 8 + payload);
    let sum = checksum::internet(cur.span(start, start + total));
    cur.patch_u16(start + 2, sum)?;
    Ok(total)
}

fn pack_tcp(
    cur: &mut Cursor,
    tcp: &TcpHdr,
    rest: &[Layer],
    ip: Option<PseudoCtx>,
) -> Result<usize, PktError> {
    let ip = ip.ok_or(PktError::MissingIp4)?;
    if tcp.options.len() > 40 || tcp.options.len() % 4 != 0 {
        return Err(PktError::BadOptions("tcp", tcp.options.len()));
    }
    let start = cur.pos();
    cur.put_u16(tcp.sport)?;
    cur.put_u16(tcp.dport)?;
    cur.put_u32(tcp.seq)?;
    cur.put_u32(tcp.ack_seq)?;
    let doff = 5 + tcp.options.len() / 4;
    cur.put_u8((doff as u8) << 4)?;
    cur.put_u8(tcp.flag_bits())?;
    cur.put_u16(tcp.window)?;
    cur.put_u16(0)?; // checksum, patched below
    cur.put_u16(tcp.urg_ptr)?;
    cur.put_bytes(&tcp.options)?;
    let payload = pack_layers(cur, rest, Some(ip))?;
    let seg_len = cur.pos() - start;
    debug_assert_eq!(seg_len, doff * 4 + payload);
    let sum = checksum::with_pseudo(ip.src, ip.dst, IPPROTO_TCP, cur.span(start, start + seg_len));
    cur.patch_u16(start + 16, sum)?;
    Ok(seg_len)
}

fn pack_udp(
    cur: &mut Cursor,
    udp: &UdpHdr,
    rest: &[Layer],
    ip: Option<PseudoCtx>,
) -> Result<usize, PktError> {
    let ip = ip.ok_or(PktError::MissingIp4)?;
    let start = cur.pos();
    cur.put_u16(udp.sport)?;
    cur.put_u16(udp.dport)?;
    cur.put_u16(0)?; // length, patched below
    cur.put_u16(0)?; // checksum, patched below
    let payload = pack_layers(cur, rest, Some(ip))?;
    let total = 8 + payload;
    cur.patch_u16(start + 4, total as u16)?;
    if !udp.no_csum {
        let sum = checksum::with_pseudo(ip.src, ip.dst, IPPROTO_UDP, cur.span(start, start + total));
        // RFC 768: a computed zero is transmitted as all-ones.
        cur.patch_u16(start + 6, if sum == 0 { 0xffff } else { sum })?;
    }
    Ok(total)
}

// ─────────────────────────────────────────────────────────────────────────────
// Decode
// ─────────────────────────────────────────────────────────────────────────────

/// Decode a link-layer frame into a chain.
pub fn unpack(frame: &[u8]) -> Result<Pkt, PktError> {
    let mut rd = Reader::new(frame);
    let mut layers = Vec::with_capacity(4);

    rd.parsing("eth");
    let dst: [u8; 6] = rd.get_array()?;
    let src: [u8; 6] = rd.get_array()?;
    let ethertype = rd.get_u16()?;
    layers.push(Layer::Eth(EthHdr {
        src,
        dst,
        ethertype,
    }));

    match ethertype {
        ETHERTYPE_ARP => unpack_arp(&mut rd, &mut layers)?,
        ETHERTYPE_IP4 => unpack_ip4(&mut rd, &mut layers)?,
        _ => {
            // Unknown ethertype: remainder is opaque payload.
            let rest = rd.rest();
            if !rest.is_empty() {
                layers.push(Layer::Raw(rest.to_vec()));
            }
        }
    }

    Ok(Pkt::from_layers(layers))
}

fn unpack_arp(rd: &mut Reader, layers: &mut Vec<Layer>) -> Result<(), PktError> {
    rd.parsing("arp");
    let hwtype = rd.get_u16()?;
    let ptype = rd.get_u16()?;
    let hwlen = rd.get_u8()?;
    let plen = rd.get_u8()?;
    if hwlen != 6 || plen != 4 {
        return Err(PktError::Truncated("arp"));
    }
    let op = rd.get_u16()?;
    let hwsrc: [u8; 6] = rd.get_array()?;
    let psrc = Ipv4Addr::from(rd.get_array::<4>()?);
    let hwdst: [u8; 6] = rd.get_array()?;
    let pdst = Ipv4Addr::from(rd.get_array::<4>()?);
    layers.push(Layer::Arp(ArpHdr {
        hwtype,
        ptype,
        op,
        hwsrc,
        psrc,
        hwdst,
        pdst,
    }));
    // Anything left is Ethernet trailer padding, not payload.
    Ok(())
}

fn unpack_ip4(rd: &mut Reader, layers: &mut Vec<Layer>) -> Result<(), PktError> {
    rd.parsing("ip4");
    let hdr_start = rd.pos();
    let ver_ihl = rd.get_u8()?;
    if ver_ihl >> 4 != 4 {
        return Err(PktError::Truncated("ip4 version"));
    }
    let ihl = usize::from(ver_ihl & 0x0f);
    if ihl < 5 {
        return Err(PktError::Truncated("ip4 header length"));
    }
    let _tos = rd.get_u8()?;
    let total_len = usize::from(rd.get_u16()?);
    let id = rd.get_u16()?;
    let frag = rd.get_u16()?;
    let ttl = rd.get_u8()?;
    let proto = rd.get_u8()?;
    let _csum = rd.get_u16()?;
    let src = Ipv4Addr::from(rd.get_array::<4>()?);
    let dst = Ipv4Addr::from(rd.get_array::<4>()?);
    let options = rd.get_bytes((ihl - 5) * 4)?.to_vec();

    if total_len < ihl * 4 {
        return Err(PktError::Truncated("ip4 total length"));
    }
    let payload_len = total_len - ihl * 4;
    // Frames shorter than the declared datagram are malformed; longer
    // frames carry Ethernet trailer padding which is dropped here.
    let payload = rd.get_bytes(payload_len)?;

    // Only the IPv4 header sum is checked; captured L4 checksums are
    // unreliable under receive offload and stay with the scripts.
    if !checksum::verify(rd.span(hdr_start, hdr_start + ihl * 4)) {
        return Err(PktError::BadChecksum);
    }

    let df = frag & 0x4000 != 0;
    let mf = frag & 0x2000 != 0;
    let frag_off = frag & 0x1fff;

    layers.push(Layer::Ip4(Ip4Hdr {
        id,
        ttl,
        proto,
        src,
        dst,
        df,
        mf,
        frag_off,
        options,
    }));

    // Fragments are recognised, not reassembled: the payload stays opaque
    // even when the first fragment starts with an L4 header.
    if mf || frag_off != 0 {
        push_raw(layers, payload);
        return Ok(());
    }

    let mut inner = Reader::new(payload);
    match proto {
        IPPROTO_ICMP => unpack_icmp(&mut inner, layers),
        IPPROTO_TCP => unpack_tcp(&mut inner, layers),
        IPPROTO_UDP => unpack_udp(&mut inner, layers),
        _ => {
            push_raw(layers, payload);
            Ok(())
        }
    }
}

fn unpack_icmp(rd: &mut Reader, layers: &mut Vec<Layer>) -> Result<(), PktError> {
    rd.parsing("icmp");
    let icmp_type = rd.get_u8()?;
    let code = rd.get_u8()?;
    let _csum = rd.get_u16()?;
    let id = rd.get_u16()?;
    let seq = rd.get_u16()?;
    layers.push(Layer::Icmp(IcmpHdr {
        icmp_type,
        code,
        id,
        seq,
    }));
    push_raw(layers, rd.rest());
    Ok(())
}

fn unpack_tcp(rd: &mut Reader, layers: &mut Vec<Layer>) -> Result<(), PktError> {
    rd.parsing("tcp");
    let sport = rd.get_u16()?;
    let dport = rd.get_u16()?;
    let seq = rd.get_u32()?;
    let ack_seq = rd.get_u32()?;
    let doff = usize::from(rd.get_u8()? >> 4);
    if doff < 5 {
        return Err(PktError::Truncated("tcp data offset"));
    }
    let flags = rd.get_u8()?;
    let window = rd.get_u16()?;
    let _csum = rd.get_u16()?;
    let urg_ptr = rd.get_u16()?;
    let options = rd.get_bytes((doff - 5) * 4)?.to_vec();

    let mut tcp = TcpHdr::new(sport, dport);
    tcp.seq = seq;
    tcp.ack_seq = ack_seq;
    tcp.set_flag_bits(flags);
    tcp.window = window;
    tcp.urg_ptr = urg_ptr;
    tcp.options = options;
    layers.push(Layer::Tcp(tcp));
    push_raw(layers, rd.rest());
    Ok(())
}

fn unpack_udp(rd: &mut Reader, layers: &mut Vec<Layer>) -> Result<(), PktError> {
    rd.parsing("udp");
    let sport = rd.get_u16()?;
    let dport = rd.get_u16()?;
    let len = usize::from(rd.get_u16()?);
    let csum = rd.get_u16()?;
    if len < 8 {
        return Err(PktError::Truncated("udp length"));
    }
    let payload = rd.get_bytes(len - 8)?;

    let mut udp = UdpHdr::new(sport, dport);
    udp.no_csum = csum == 0;
    layers.push(Layer::Udp(udp));
    push_raw(layers, payload);
    Ok(())
}

fn push_raw(layers: &mut Vec<Layer>, bytes: &[u8]) {
    if !bytes.is_empty() {
        layers.push(Layer::Raw(bytes.to_vec()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
