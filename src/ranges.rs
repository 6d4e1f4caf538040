//! Target and port range sets.
//!
//! A [`RangeSet`] is a sorted list of disjoint closed intervals with a
//! running prefix-count table, so membership enumeration is O(1) to count
//! and O(log N) to index: `pick(k)` returns the k-th element in ascending
//! order. Targets parse from `A.B.C.D`, `A.B.C.D-E.F.G.H` and CIDR
//! `A.B.C.D/prefix` tokens; ports from `a` and `a-b`. Overlapping tokens
//! merge.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Malformed target/port specification. Fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range token '{0}'")]
    InvalidRange(String),

    #[error("reversed bounds in '{0}'")]
    ReversedBounds(String),

    #[error("CIDR prefix out of range in '{0}'")]
    BadPrefix(String),
}

/// Ordered disjoint interval set over a 32-bit (targets) or 16-bit (ports)
/// key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    /// Sorted, non-overlapping, non-adjacent closed intervals.
    ranges: Vec<(u64, u64)>,
    /// `prefix[i]` = number of elements in `ranges[..=i]`.
    prefix: Vec<u64>,
}

impl RangeSet {
    fn from_intervals(mut intervals: Vec<(u64, u64)>) -> Self {
        intervals.sort_unstable();
        let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for (lo, hi) in intervals {
            match ranges.last_mut() {
                // Merge overlapping and adjacent intervals.
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => ranges.push((lo, hi)),
            }
        }
        let mut prefix = Vec::with_capacity(ranges.len());
        let mut total = 0u64;
        for (lo, hi) in &ranges {
            total += hi - lo + 1;
            prefix.push(total);
        }
        Self { ranges, prefix }
    }

    /// Total number of elements across all intervals.
    pub fn count(&self) -> u64 {
        self.prefix.last().copied().unwrap_or(0)
    }

    /// The k-th element in ascending enumeration order, `0 <= k < count()`.
    ///
    /// # Panics
    /// Panics if `k` is out of range; callers index with `i % count()`.
    pub fn pick(&self, k: u64) -> u64 {
        assert!(k < self.count(), "pick({k}) out of range, count {}", self.count());
        let idx = self.prefix.partition_point(|&p| p <= k);
        let before = if idx == 0 { 0 } else { self.prefix[idx - 1] };
        self.ranges[idx].0 + (k - before)
    }

    pub fn contains(&self, v: u64) -> bool {
        self.ranges
            .binary_search_by(|&(lo, hi)| {
                if v < lo {
                    std::cmp::Ordering::Greater
                } else if v > hi {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a comma-separated target list into a range set of IPv4 addresses
/// (stored as host-order u32).
pub fn parse_targets(spec: &str) -> Result<RangeSet, RangeError> {
    let mut intervals = Vec::new();
    for token in split_tokens(spec) {
        intervals.push(parse_target_token(token)?);
    }
    if intervals.is_empty() {
        return Err(RangeError::InvalidRange(spec.to_string()));
    }
    Ok(RangeSet::from_intervals(intervals))
}

/// Parse a comma-separated port list into a range set of 16-bit ports.
pub fn parse_ports(spec: &str) -> Result<RangeSet, RangeError> {
    let mut intervals = Vec::new();
    for token in split_tokens(spec) {
        intervals.push(parse_port_token(token)?);
    }
    if intervals.is_empty() {
        return Err(RangeError::InvalidRange(spec.to_string()));
    }
    Ok(RangeSet::from_intervals(intervals))
}

fn split_tokens(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn parse_addr(token: &str, ctx: &str) -> Result<u64, RangeError> {
    token
        .parse::<Ipv4Addr>()
        .map(|a| u64::from(u32::from(a)))
        .map_err(|_| RangeError::InvalidRange(ctx.to_string()))
}

fn parse_target_token(token: &str) -> Result<(u64, u64), RangeError> {
    if let Some((addr, prefix)) = token.split_once('/') {
        let base = parse_addr(addr, token)? as u32;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| RangeError::InvalidRange(token.to_string()))?;
        if prefix > 32 {
            return Err(RangeError::BadPrefix(token.to_string()));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let lo = base & mask;
        let hi = lo | !mask;
        return Ok((u64::from(lo), u64::from(hi)));
    }
    if let Some((a, b)) = token.split_once('-') {
        let lo = parse_addr(a, token)?;
        let hi = parse_addr(b, token)?;
        if hi < lo {
            return Err(RangeError::ReversedBounds(token.to_string()));
        }
        return Ok((lo, hi));
    }
    let v = parse_addr(token, token)?;
    Ok((v, v))
}

fn parse_port_token(token: &str) -> Result<(u64, u64), RangeError> {
    let parse_one = |s: &str| -> Result<u64, RangeError> {
        s.trim()
            .parse::<u16>()
            .map(u64::from)
            .map_err(|_| RangeError::InvalidRange(token.to_string()))
    };
    if let Some((a, b)) = token.split_once('-') {
        let lo = parse_one(a)?;
        let hi = parse_one(b)?;
        if hi < lo {
            return Err(RangeError::ReversedBounds(token.to_string()));
        }
        return Ok((lo, hi));
    }
    let v = parse_one(token)?;
    Ok((v, v))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
