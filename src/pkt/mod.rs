//! Packet object model — typed layer headers and the packet chain.
//!
//! A packet is an ordered sequence of [`Layer`] records, outermost first:
//! `ETH → (ARP | IP4 → (ICMP | TCP | UDP) → RAW?)`. Scripts usually build
//! chains starting at IPv4 and the engine prepends the Ethernet layer.
//! Computed fields (lengths, checksums, ethertype, IP protocol) are filled
//! by the codec at encode time, never stored here.

pub mod checksum;
pub mod codec;
pub mod cursor;

use std::net::Ipv4Addr;

use crate::queue::QueueLink;

pub use checksum::CookieJar;
pub use codec::{pack, unpack};

/// Ethertype for IPv4.
pub const ETHERTYPE_IP4: u16 = 0x0800;
/// Ethertype for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// IPv4 protocol numbers the codec dispatches on.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// ARP operation codes.
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// The Ethernet broadcast address.
pub const MAC_BROADCAST: [u8; 6] = [0xff; 6];

/// Errors produced by the packet codec and byte primitives.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PktError {
    /// Write cursor ran past the end of the output buffer.
    #[error("buffer too short: need {need} more bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    /// Inbound frame ended before a declared header or length.
    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    /// A stored checksum did not verify.
    #[error("checksum mismatch")]
    BadChecksum,

    /// TCP/UDP encode requires an immediately preceding IPv4 layer.
    #[error("TCP/UDP layer without a preceding IPv4 layer")]
    MissingIp4,

    /// The chain violates the layer grammar.
    #[error("invalid layer chain: {0}")]
    BadChain(&'static str),

    /// Header options must be a multiple of 4 bytes, at most 40.
    #[error("invalid {0} options length {1}")]
    BadOptions(&'static str, usize),
}

// ─────────────────────────────────────────────────────────────────────────────
// Layer headers
// ─────────────────────────────────────────────────────────────────────────────

/// Ethernet II header.
///
/// `ethertype` is filled by the codec from the next layer's tag on encode;
/// the stored value is only used when the chain ends at Ethernet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthHdr {
    pub src: [u8; 6],
    pub dst: [u8; 6],
    pub ethertype: u16,
}

impl EthHdr {
    pub fn new(src: [u8; 6], dst: [u8; 6]) -> Self {
        Self {
            src,
            dst,
            ethertype: 0,
        }
    }
}

/// ARP header (RFC 826, Ethernet/IPv4 flavour: hwlen=6, plen=4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpHdr {
    pub hwtype: u16,
    pub ptype: u16,
    /// [`ARP_OP_REQUEST`] or [`ARP_OP_REPLY`]; other values round-trip opaquely.
    pub op: u16,
    pub hwsrc: [u8; 6],
    pub psrc: Ipv4Addr,
    pub hwdst: [u8; 6],
    pub pdst: Ipv4Addr,
}

impl ArpHdr {
    /// ARP request for `pdst`, sent from `(hwsrc, psrc)`.
    pub fn request(hwsrc: [u8; 6], psrc: Ipv4Addr, pdst: Ipv4Addr) -> Self {
        Self {
            hwtype: 1,
            ptype: ETHERTYPE_IP4,
            op: ARP_OP_REQUEST,
            hwsrc,
            psrc,
            hwdst: [0; 6],
            pdst,
        }
    }

    /// ARP reply carrying `(hwsrc, psrc)` addressed to `(hwdst, pdst)`.
    pub fn reply(hwsrc: [u8; 6], psrc: Ipv4Addr, hwdst: [u8; 6], pdst: Ipv4Addr) -> Self {
        Self {
            hwtype: 1,
            ptype: ETHERTYPE_IP4,
            op: ARP_OP_REPLY,
            hwsrc,
            psrc,
            hwdst,
            pdst,
        }
    }
}

/// IPv4 header. Total length and header checksum are computed at encode
/// time; `proto` is filled from the next layer's tag unless the payload is
/// raw (decoded unknown protocols re-encode unchanged).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip4Hdr {
    pub id: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub df: bool,
    pub mf: bool,
    pub frag_off: u16,
    /// Options preserved as opaque bytes (IHL > 5), length a multiple of 4.
    pub options: Vec<u8>,
}

impl Ip4Hdr {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self {
            id: 0,
            ttl: 64,
            proto: 0,
            src,
            dst,
            df: false,
            mf: false,
            frag_off: 0,
            options: Vec::new(),
        }
    }
}

/// ICMP header, echo flavour (type, code, id, seq). Checksum is computed at
/// encode time over header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpHdr {
    pub icmp_type: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

impl IcmpHdr {
    /// Echo request (type 8).
    pub fn echo_request(id: u16, seq: u16) -> Self {
        Self {
            icmp_type: 8,
            code: 0,
            id,
            seq,
        }
    }
}

/// TCP header. Data offset is derived from `options` at encode time; the
/// checksum uses the pseudo-header of the preceding IPv4 layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHdr {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub window: u16,
    pub urg_ptr: u16,
    /// Option bytes preserved opaquely, length a multiple of 4.
    pub options: Vec<u8>,
}

impl TcpHdr {
    pub fn new(sport: u16, dport: u16) -> Self {
        Self {
            sport,
            dport,
            seq: 0,
            ack_seq: 0,
            fin: false,
            syn: false,
            rst: false,
            psh: false,
            ack: false,
            urg: false,
            window: 64240,
            urg_ptr: 0,
            options: Vec::new(),
        }
    }

    pub(crate) fn flag_bits(&self) -> u8 {
        (self.fin as u8)
            | (self.syn as u8) << 1
            | (self.rst as u8) << 2
            | (self.psh as u8) << 3
            | (self.ack as u8) << 4
            | (self.urg as u8) << 5
    }

    pub(crate) fn set_flag_bits(&mut self, bits: u8) {
        self.fin = bits & 0x01 != 0;
        self.syn = bits & 0x02 != 0;
        self.rst = bits & 0x04 != 0;
        self.psh = bits & 0x08 != 0;
        self.ack = bits & 0x10 != 0;
        self.urg = bits & 0x20 != 0;
    }
}

/// UDP header. Length and checksum are computed at encode time. A zero
/// checksum seen on decode is kept zero on re-encode (`no_csum`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHdr {
    pub sport: u16,
    pub dport: u16,
    pub no_csum: bool,
}

impl UdpHdr {
    pub fn new(sport: u16, dport: u16) -> Self {
        Self {
            sport,
            dport,
            no_csum: false,
        }
    }
}

/// One layer record of a packet chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Eth(EthHdr),
    Arp(ArpHdr),
    Ip4(Ip4Hdr),
    Icmp(IcmpHdr),
    Tcp(TcpHdr),
    Udp(UdpHdr),
    /// Opaque payload; only valid as the final record.
    Raw(Vec<u8>),
}

impl Layer {
    /// Short tag name for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Layer::Eth(_) => "eth",
            Layer::Arp(_) => "arp",
            Layer::Ip4(_) => "ip4",
            Layer::Icmp(_) => "icmp",
            Layer::Tcp(_) => "tcp",
            Layer::Udp(_) => "udp",
            Layer::Raw(_) => "raw",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet chain
// ─────────────────────────────────────────────────────────────────────────────

/// A packet chain: ordered layers, outermost first, plus the probe flag
/// driving progress accounting.
///
/// The embedded [`QueueLink`] makes a boxed `Pkt` directly enqueueable on
/// the outbound queue without a separate node allocation.
#[derive(Debug)]
pub struct Pkt {
    pub layers: Vec<Layer>,
    /// True for probes produced by the loop path; follow-up packets
    /// (RST teardown, ACKs) are sent with `probe = false` so progress
    /// tracks logical probes.
    pub probe: bool,
    pub(crate) link: QueueLink,
}

impl Pkt {
    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            probe: false,
            link: QueueLink::new(),
        }
    }

    /// Empty placeholder chain used as the queue stub node.
    pub(crate) fn stub() -> Self {
        Self::from_layers(Vec::new())
    }

    /// Prepend an Ethernet layer unless the chain already starts with one.
    pub fn ensure_eth(&mut self, src: [u8; 6], dst: [u8; 6]) {
        if !matches!(self.layers.first(), Some(Layer::Eth(_))) {
            self.layers.insert(0, Layer::Eth(EthHdr::new(src, dst)));
        }
    }

    pub fn eth(&self) -> Option<&EthHdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Eth(h) => Some(h),
            _ => None,
        })
    }

    pub fn arp(&self) -> Option<&ArpHdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Arp(h) => Some(h),
            _ => None,
        })
    }

    pub fn ip4(&self) -> Option<&Ip4Hdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ip4(h) => Some(h),
            _ => None,
        })
    }

    pub fn icmp(&self) -> Option<&IcmpHdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Icmp(h) => Some(h),
            _ => None,
        })
    }

    pub fn tcp(&self) -> Option<&TcpHdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Tcp(h) => Some(h),
            _ => None,
        })
    }

    pub fn udp(&self) -> Option<&UdpHdr> {
        self.layers.iter().find_map(|l| match l {
            Layer::Udp(h) => Some(h),
            _ => None,
        })
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.layers.iter().find_map(|l| match l {
            Layer::Raw(b) => Some(b.as_slice()),
            _ => None,
        })
    }
}

impl Clone for Pkt {
    fn clone(&self) -> Self {
        Self {
            layers: self.layers.clone(),
            probe: self.probe,
            link: QueueLink::new(),
        }
    }
}

impl PartialEq for Pkt {
    fn eq(&self, other: &Self) -> bool {
        self.layers == other.layers && self.probe == other.probe
    }
}

impl Eq for Pkt {}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
