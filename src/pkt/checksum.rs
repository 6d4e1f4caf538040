//! Internet checksum and keyed SYN cookies.
//!
//! The checksum is the RFC 1071 16-bit ones'-complement sum used by IPv4,
//! ICMP, TCP and UDP. Cookies are a keyed hash over the flow 4-tuple
//! `(src, dst, sport, dport)`: scripts stamp outbound probes with a cookie
//! and recognise replies by recomputing it, which is what lets the engine
//! stay stateless across millions of probes. SipHash-2-4 keyed with 128
//! bits expanded from the `--seed` value; fast and unguessable without the
//! key, which is all a scan correlator needs.

use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ─────────────────────────────────────────────────────────────────────────────
// Internet checksum
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulate 16-bit big-endian words into a running sum. The odd trailing
/// byte is padded with zero. Safe to chain over even-length parts.
fn sum_words(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        acc += u32::from(u16::from_be_bytes([w[0], w[1]]));
    }
    if let [tail] = chunks.remainder() {
        acc += u32::from(*tail) << 8;
    }
    acc
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over one byte run. The checksum field inside `data`
/// must be zero when this is computed.
pub fn internet(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Internet checksum of a TCP/UDP segment including the 12-byte IPv4
/// pseudo-header `(src, dst, 0, proto, len)`.
pub fn with_pseudo(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let len = segment.len() as u16;
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&len.to_be_bytes());
    fold(sum_words(segment, sum_words(&pseudo, 0)))
}

/// Verify a byte run whose stored checksum is in place: the ones'-complement
/// sum of a valid header including its checksum folds to 0xFFFF.
pub fn verify(data: &[u8]) -> bool {
    fold(sum_words(data, 0)) == 0
}

// ─────────────────────────────────────────────────────────────────────────────
// SYN cookies
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide cookie key, derived once from the seed and shared by every
/// script context. Identical tuples yield identical cookies for the whole
/// process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CookieJar {
    k0: u64,
    k1: u64,
}

impl CookieJar {
    /// Expand a 64-bit seed into the 128-bit key.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            k0: rng.gen(),
            k1: rng.gen(),
        }
    }

    fn hash(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u64 {
        let mut msg = [0u8; 12];
        msg[0..4].copy_from_slice(&saddr.octets());
        msg[4..8].copy_from_slice(&daddr.octets());
        msg[8..10].copy_from_slice(&sport.to_be_bytes());
        msg[10..12].copy_from_slice(&dport.to_be_bytes());
        siphash24(self.k0, self.k1, &msg)
    }

    /// 32-bit cookie, used as TCP initial sequence numbers.
    pub fn cookie32(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u32 {
        self.hash(saddr, daddr, sport, dport) as u32
    }

    /// 16-bit cookie, used as ICMP sequence numbers.
    pub fn cookie16(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u16 {
        self.hash(saddr, daddr, sport, dport) as u16
    }
}

// SipHash-2-4 (Aumasson & Bernstein). Reference layout; message length is
// always 12 bytes here but the loop handles any length.

#[inline]
fn sipround(v: &mut [u64; 4]) {
    v[0] = v[0].wrapping_add(v[1]);
    v[1] = v[1].rotate_left(13);
    v[1] ^= v[0];
    v[0] = v[0].rotate_left(32);
    v[2] = v[2].wrapping_add(v[3]);
    v[3] = v[3].rotate_left(16);
    v[3] ^= v[2];
    v[0] = v[0].wrapping_add(v[3]);
    v[3] = v[3].rotate_left(21);
    v[3] ^= v[0];
    v[2] = v[2].wrapping_add(v[1]);
    v[1] = v[1].rotate_left(17);
    v[1] ^= v[2];
    v[2] = v[2].rotate_left(32);
}

fn siphash24(k0: u64, k1: u64, msg: &[u8]) -> u64 {
    let mut v = [
        k0 ^ 0x736f6d6570736575,
        k1 ^ 0x646f72616e646f6d,
        k0 ^ 0x6c7967656e657261,
        k1 ^ 0x7465646279746573,
    ];

    let mut chunks = msg.chunks_exact(8);
    for chunk in &mut chunks {
        let m = u64::from_le_bytes(chunk.try_into().unwrap());
        v[3] ^= m;
        sipround(&mut v);
        sipround(&mut v);
        v[0] ^= m;
    }

    let tail = chunks.remainder();
    let mut last = (msg.len() as u64) << 56;
    for (i, &b) in tail.iter().enumerate() {
        last |= u64::from(b) << (8 * i);
    }
    v[3] ^= last;
    sipround(&mut v);
    sipround(&mut v);
    v[0] ^= last;

    v[2] ^= 0xff;
    for _ in 0..4 {
        sipround(&mut v);
    }
    v[0] ^ v[1] ^ v[2] ^ v[3]
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_even_bytes() {
        // 0x0001 + 0x0002 = 0x0003 → ~0x0003 = 0xFFFC
        assert_eq!(internet(&[0x00, 0x01, 0x00, 0x02]), 0xfffc);
    }

    #[test]
    fn test_checksum_carry_folds() {
        // 0xFFFF + 0x0001 = 0x10000 → fold → 0x0001 → ~0x0001 = 0xFFFE
        assert_eq!(internet(&[0xff, 0xff, 0x00, 0x01]), 0xfffe);
    }

    #[test]
    fn test_checksum_odd_tail_padded() {
        // 0x0100 + 0xAB00 (padded) = 0xAC00 → ~ = 0x53FF
        assert_eq!(internet(&[0x01, 0x00, 0xab]), 0x53ff);
    }

    #[test]
    fn test_checksum_rfc1071_example() {
        // RFC 1071 §3 worked example: words 0x0001 0xf203 0xf4f5 0xf6f7
        // sum with carries = 0xddf2 → checksum = ~0xddf2 = 0x220d.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet(&data), 0x220d);
    }

    #[test]
    fn test_verify_accepts_valid_header() {
        let mut hdr = vec![0x45, 0x00, 0x00, 0x28, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06];
        hdr.extend_from_slice(&[0, 0]); // checksum placeholder
        hdr.extend_from_slice(&[0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7]);
        let sum = internet(&hdr);
        hdr[10..12].copy_from_slice(&sum.to_be_bytes());
        assert!(verify(&hdr), "header with stored checksum must verify");
        hdr[4] ^= 0xff;
        assert!(!verify(&hdr), "corrupted header must not verify");
    }

    #[test]
    fn test_pseudo_checksum_differs_by_proto() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let seg = [0u8; 20];
        assert_ne!(
            with_pseudo(src, dst, crate::pkt::IPPROTO_TCP, &seg),
            with_pseudo(src, dst, crate::pkt::IPPROTO_UDP, &seg),
            "pseudo-header protocol must affect the sum"
        );
    }

    #[test]
    fn test_siphash_avalanche() {
        // Flipping any single message bit must change roughly half the
        // output bits; anything under 16 would indicate a broken round.
        let msg = [0u8; 12];
        let base = siphash24(1, 2, &msg);
        for byte in 0..12 {
            for bit in 0..8 {
                let mut flipped = msg;
                flipped[byte] ^= 1 << bit;
                let dist = (base ^ siphash24(1, 2, &flipped)).count_ones();
                assert!(dist >= 10, "weak diffusion: {dist} bits for byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_siphash_length_is_hashed() {
        // The final word encodes the length, so a zero-extended message
        // must not collide with the original.
        assert_ne!(siphash24(1, 2, &[0u8; 8]), siphash24(1, 2, &[0u8; 12]));
    }

    #[test]
    fn test_cookie_deterministic_for_fixed_seed() {
        let a = CookieJar::from_seed(42);
        let b = CookieJar::from_seed(42);
        let (s, d) = (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 0, 2, 5));
        assert_eq!(a.cookie32(s, d, 64434, 80), b.cookie32(s, d, 64434, 80));
        assert_eq!(a.cookie16(s, d, 64434, 0), b.cookie16(s, d, 64434, 0));
    }

    #[test]
    fn test_cookie_differs_across_seeds() {
        let a = CookieJar::from_seed(1);
        let b = CookieJar::from_seed(2);
        let (s, d) = (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 0, 2, 5));
        assert_ne!(a.cookie32(s, d, 64434, 80), b.cookie32(s, d, 64434, 80));
    }

    #[test]
    fn test_cookie_sensitive_to_every_tuple_field() {
        let jar = CookieJar::from_seed(7);
        let (s, d) = (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 0, 2, 5));
        let base = jar.cookie32(s, d, 64434, 80);
        assert_ne!(base, jar.cookie32(d, s, 64434, 80), "src/dst swap");
        assert_ne!(base, jar.cookie32(s, d, 64435, 80), "sport");
        assert_ne!(base, jar.cookie32(s, d, 64434, 81), "dport");
    }

    #[test]
    fn test_cookie32_distribution_no_trivial_collisions() {
        // Statistical sanity: 4096 distinct tuples, no collision expected
        // (probability ~2^-12 for a 32-bit hash; a systematic bias would
        // show up here instead).
        let jar = CookieJar::from_seed(1234);
        let mut seen = std::collections::HashSet::new();
        for a in 0u8..16 {
            for b in 0u8..16 {
                for port in 0u16..16 {
                    let c = jar.cookie32(
                        Ipv4Addr::new(10, 0, a, b),
                        Ipv4Addr::new(192, 0, 2, 1),
                        64434,
                        port,
                    );
                    seen.insert(c);
                }
            }
        }
        assert_eq!(seen.len(), 4096, "unexpected cookie collisions");
    }
}
