//! IPv4 CIDR range table implementation.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use super::DynamicRule;
use crate::error::CidrRuleError;

/// A closed `[start, end]` interval of IPv4 addresses derived from a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrRange {
    start: u32,
    end: u32,
}

impl CidrRange {
    /// Create a range from an address and prefix length.
    ///
    /// Host bits of `address` are ignored: `10.1.2.3/8` covers `10.0.0.0..=10.255.255.255`.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, CidrRuleError> {
        let net = Ipv4Net::new(address, prefix)
            .map_err(|_| CidrRuleError::InvalidCidr(format!("{}/{}", address, prefix)))?;
        Ok(Self::from(net))
    }

    /// First address of the block as an integer.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Last address of the block as an integer.
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Check if an address falls inside this range (inclusive).
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        self.start <= n && n <= self.end
    }
}

impl From<Ipv4Net> for CidrRange {
    fn from(net: Ipv4Net) -> Self {
        Self {
            start: u32::from(net.network()),
            end: u32::from(net.broadcast()),
        }
    }
}

impl FromStr for CidrRange {
    type Err = CidrRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        s.parse::<Ipv4Net>()
            .map(Self::from)
            .map_err(|_| CidrRuleError::InvalidCidr(s.to_string()))
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            Ipv4Addr::from(self.start),
            Ipv4Addr::from(self.end)
        )
    }
}

/// RangeTable answers "is this IPv4 address inside any configured block?".
///
/// Ranges are kept sorted and merged so that lookups are a binary search
/// over disjoint intervals. IPv6 addresses are never members.
///
/// # Examples
/// ```
/// use dns_fallback::rule::{DynamicRule, RangeTable};
///
/// let table = RangeTable::build(["10.0.0.0/8", "192.168.0.0/16"]);
/// assert!(table.contains("10.1.2.3".parse().unwrap()));
/// assert!(!table.contains("8.8.8.8".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    /// Disjoint ranges sorted by start address
    ranges: Vec<CidrRange>,
}

impl RangeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint ranges after merging.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the table has no ranges.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over the stored ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = &CidrRange> {
        self.ranges.iter()
    }

    /// Insert a range, merging it with any overlapping or adjacent neighbours.
    ///
    /// Only the neighbours that touch `range` are rewritten.
    pub fn insert(&mut self, range: CidrRange) {
        // Ranges are disjoint and sorted, so both starts and ends ascend.
        let lo = self
            .ranges
            .partition_point(|r| r.end.saturating_add(1) < range.start);
        let hi = self
            .ranges
            .partition_point(|r| r.start <= range.end.saturating_add(1));

        if lo == hi {
            self.ranges.insert(lo, range);
            return;
        }
        let merged = CidrRange {
            start: range.start.min(self.ranges[lo].start),
            end: range.end.max(self.ranges[hi - 1].end),
        };
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    /// Check if an IPv4 address falls within any stored range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        // Index of the first range starting after `n`; the candidate is the one before it.
        let idx = self.ranges.partition_point(|r| r.start <= n);
        idx > 0 && self.ranges[idx - 1].end >= n
    }

    /// Check an address of either family. IPv6 is never range-checked.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains(v4),
            IpAddr::V6(_) => false,
        }
    }
}

impl DynamicRule for RangeTable {
    type Error = CidrRuleError;
    const KIND: &'static str = "ipcidr";

    fn add_pattern(&mut self, pattern: &str) -> Result<(), Self::Error> {
        let range: CidrRange = pattern.parse()?;
        self.insert(range);
        Ok(())
    }
}
