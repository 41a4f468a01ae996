//! Address range arithmetic for prefix carving
//!
//! Prefixes are mapped onto `u128` address ranges (IPv4 addresses occupy the
//! low 32 bits). Ranges use an inclusive `last` so a full IPv6 `/0` fits.

use ipnet::{IpNet, Ipv4Net, Ipv4Subnets, Ipv6Net, Ipv6Subnets};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A contiguous range of addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PrefixRange {
    /// First address
    pub start: u128,
    /// Last address (inclusive)
    pub last: u128,
}

impl PrefixRange {
    pub fn new(start: u128, last: u128) -> Self {
        PrefixRange { start, last }
    }

    /// Range covered by a prefix
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(n) => PrefixRange {
                start: u32::from(n.network()) as u128,
                last: u32::from(n.broadcast()) as u128,
            },
            IpNet::V6(n) => PrefixRange {
                start: u128::from(n.network()),
                last: u128::from(n.broadcast()),
            },
        }
    }

    /// Number of addresses, saturating for a full IPv6 space
    pub fn size(&self) -> u128 {
        (self.last - self.start).saturating_add(1)
    }

    pub fn contains(&self, other: &PrefixRange) -> bool {
        other.start >= self.start && other.last <= self.last
    }

    pub fn overlaps(&self, other: &PrefixRange) -> bool {
        self.start <= other.last && other.start <= self.last
    }

    /// Check if this range ends right where the other begins, or vice versa
    pub fn is_adjacent(&self, other: &PrefixRange) -> bool {
        self.last.checked_add(1) == Some(other.start) || other.last.checked_add(1) == Some(self.start)
    }

    /// Merge two adjacent or overlapping ranges
    pub fn coalesce(&self, other: &PrefixRange) -> Option<PrefixRange> {
        if !self.is_adjacent(other) && !self.overlaps(other) {
            return None;
        }
        Some(PrefixRange {
            start: self.start.min(other.start),
            last: self.last.max(other.last),
        })
    }
}

/// Address width of the prefix family
pub fn address_bits(net: &IpNet) -> u8 {
    net.max_prefix_len()
}

/// Block size of a prefix of `length` in a family of `bits`, `None` for 2^128
fn block_size(bits: u8, length: u8) -> Option<u128> {
    1u128.checked_shl(u32::from(bits - length))
}

fn align_up(value: u128, step: u128) -> Option<u128> {
    let rem = value % step;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(step - rem)
    }
}

/// Rebuild a prefix from a range start within the parent's family
pub fn prefix_at(parent: &IpNet, start: u128, length: u8) -> Option<IpNet> {
    match parent {
        IpNet::V4(_) => {
            let addr = Ipv4Addr::from(u32::try_from(start).ok()?);
            Ipv4Net::new(addr, length).ok().map(IpNet::V4)
        }
        IpNet::V6(_) => Ipv6Net::new(Ipv6Addr::from(start), length).ok().map(IpNet::V6),
    }
}

/// Whether `child` is a well-formed prefix strictly inside `parent`
pub fn is_child_of(parent: &IpNet, child: &IpNet) -> bool {
    address_bits(parent) == address_bits(child)
        && child.prefix_len() >= parent.prefix_len()
        && child.trunc() == *child
        && parent.contains(child)
}

/// Find the first aligned child of `length` inside `parent` disjoint from
/// every acquired child
///
/// Candidates are tried in address order. When a candidate collides with an
/// acquired child, the search resumes at the next aligned boundary past that
/// child, so the scan is linear in the number of acquired children.
pub fn first_fit(parent: &IpNet, acquired: &[IpNet], length: u8) -> Option<IpNet> {
    let bits = address_bits(parent);
    if length < parent.prefix_len() || length > bits {
        return None;
    }
    let outer = PrefixRange::of(parent);
    let step = match block_size(bits, length) {
        Some(step) => step,
        // Only a full IPv6 /0 child of a /0 parent
        None => return acquired.is_empty().then_some(*parent),
    };

    let mut taken: Vec<PrefixRange> = acquired.iter().map(PrefixRange::of).collect();
    taken.sort_unstable();

    let mut candidate = outer.start;
    for child in &taken {
        let candidate_last = candidate.checked_add(step - 1)?;
        if child.last < candidate {
            continue;
        }
        if child.start > candidate_last {
            break;
        }
        candidate = align_up(child.last.checked_add(1)?, step)?;
    }

    let candidate_last = candidate.checked_add(step - 1)?;
    if candidate_last > outer.last {
        return None;
    }
    prefix_at(parent, candidate, length)
}

/// Coalesced acquired spans inside the parent, in address order
pub fn acquired_spans(acquired: &[IpNet]) -> Vec<PrefixRange> {
    let mut ranges: Vec<PrefixRange> = acquired.iter().map(PrefixRange::of).collect();
    ranges.sort_unstable();

    let mut spans: Vec<PrefixRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match spans.last_mut() {
            Some(prev) => match prev.coalesce(&range) {
                Some(merged) => *prev = merged,
                None => spans.push(range),
            },
            None => spans.push(range),
        }
    }
    spans
}

/// Free address ranges of the parent
pub fn free_ranges(parent: &IpNet, acquired: &[IpNet]) -> Vec<PrefixRange> {
    let outer = PrefixRange::of(parent);
    let mut free = Vec::new();
    let mut cursor = Some(outer.start);

    for span in acquired_spans(acquired) {
        let Some(start) = cursor else { break };
        if span.start > start {
            free.push(PrefixRange::new(start, span.start - 1));
        }
        cursor = span.last.checked_add(1);
    }
    if let Some(start) = cursor {
        if start <= outer.last {
            free.push(PrefixRange::new(start, outer.last));
        }
    }
    free
}

/// Decompose a free range into maximal aligned prefixes
pub fn decompose(parent: &IpNet, range: &PrefixRange) -> Vec<IpNet> {
    match parent {
        IpNet::V4(_) => {
            let (Ok(start), Ok(last)) = (u32::try_from(range.start), u32::try_from(range.last))
            else {
                return Vec::new();
            };
            Ipv4Subnets::new(Ipv4Addr::from(start), Ipv4Addr::from(last), 0)
                .map(IpNet::V4)
                .collect()
        }
        IpNet::V6(_) => Ipv6Subnets::new(Ipv6Addr::from(range.start), Ipv6Addr::from(range.last), 0)
            .map(IpNet::V6)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_range_of_prefix() {
        let range = PrefixRange::of(&net("10.0.0.0/24"));
        assert_eq!(range.size(), 256);
        assert!(range.contains(&PrefixRange::of(&net("10.0.0.128/25"))));
        assert!(!range.contains(&PrefixRange::of(&net("10.0.1.0/25"))));
    }

    #[test]
    fn test_range_adjacency() {
        let a = PrefixRange::new(0, 9);
        let b = PrefixRange::new(10, 19);
        let c = PrefixRange::new(25, 30);

        assert!(a.is_adjacent(&b));
        assert!(b.is_adjacent(&a));
        assert!(!a.is_adjacent(&c));
    }

    #[test]
    fn test_range_coalesce() {
        let a = PrefixRange::new(0, 9);
        let b = PrefixRange::new(10, 19);
        assert_eq!(a.coalesce(&b), Some(PrefixRange::new(0, 19)));
        assert_eq!(a.coalesce(&PrefixRange::new(30, 40)), None);
    }

    #[test]
    fn test_first_fit_empty_parent() {
        let parent = net("10.0.0.0/16");
        assert_eq!(first_fit(&parent, &[], 24), Some(net("10.0.0.0/24")));
    }

    #[test]
    fn test_first_fit_skips_acquired() {
        let parent = net("10.0.0.0/16");
        let acquired = vec![net("10.0.0.0/24")];
        assert_eq!(first_fit(&parent, &acquired, 24), Some(net("10.0.1.0/24")));
    }

    #[test]
    fn test_first_fit_realigns_after_small_child() {
        let parent = net("10.0.0.0/16");
        let acquired = vec![net("10.0.0.0/26")];
        // A /24 must start on a /24 boundary
        assert_eq!(first_fit(&parent, &acquired, 24), Some(net("10.0.1.0/24")));
        // A /26 fits right after the first /26
        assert_eq!(first_fit(&parent, &acquired, 26), Some(net("10.0.0.64/26")));
    }

    #[test]
    fn test_first_fit_fills_hole() {
        let parent = net("10.0.0.0/24");
        let acquired = vec![net("10.0.0.0/26"), net("10.0.0.128/26")];
        assert_eq!(first_fit(&parent, &acquired, 26), Some(net("10.0.0.64/26")));
        assert_eq!(first_fit(&parent, &acquired, 25), None);
    }

    #[test]
    fn test_first_fit_exhaustion() {
        let parent = net("192.168.0.0/30");
        let acquired = vec![net("192.168.0.0/31"), net("192.168.0.2/31")];
        assert_eq!(first_fit(&parent, &acquired, 31), None);
    }

    #[test]
    fn test_first_fit_rejects_bad_length() {
        let parent = net("10.0.0.0/16");
        assert_eq!(first_fit(&parent, &[], 8), None);
        assert_eq!(first_fit(&parent, &[], 33), None);
    }

    #[test]
    fn test_first_fit_ipv6() {
        let parent = net("2001:db8::/48");
        let acquired = vec![net("2001:db8::/64")];
        assert_eq!(first_fit(&parent, &acquired, 64), Some(net("2001:db8:0:1::/64")));
    }

    #[test]
    fn test_full_ipv6_space() {
        let parent = net("::/0");
        assert_eq!(PrefixRange::of(&parent).size(), u128::MAX);
        assert_eq!(first_fit(&parent, &[], 0), Some(parent));
        assert_eq!(first_fit(&parent, &[net("::/1")], 1), Some(net("8000::/1")));
    }

    #[test]
    fn test_free_space_decomposition() {
        let parent = net("10.0.0.0/24");
        let acquired = vec![net("10.0.0.0/26")];
        let free = free_ranges(&parent, &acquired);
        assert_eq!(free.len(), 1);

        let prefixes = decompose(&parent, &free[0]);
        assert_eq!(prefixes, vec![net("10.0.0.64/26"), net("10.0.0.128/25")]);
    }

    #[test]
    fn test_acquired_spans_coalesce() {
        let spans = acquired_spans(&[net("10.0.0.64/26"), net("10.0.0.0/26")]);
        assert_eq!(spans, vec![PrefixRange::of(&net("10.0.0.0/25"))]);
    }

    #[test]
    fn test_is_child_of() {
        let parent = net("10.0.0.0/16");
        assert!(is_child_of(&parent, &net("10.0.4.0/24")));
        assert!(!is_child_of(&parent, &net("10.1.0.0/24")));
        assert!(!is_child_of(&parent, &net("10.0.4.1/24")));
        assert!(!is_child_of(&parent, &net("2001:db8::/64")));
    }
}
