use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use rand::Rng;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
        }
    }
}

pub(crate) fn ip_to_u128(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

pub(crate) fn u128_to_ip(value: u128, family: IpFamily) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Inclusive range of addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpRange {
    pub start: u128,
    pub end: u128,
}

impl IpRange {
    pub fn len(&self) -> u128 {
        self.end - self.start + 1
    }

    pub fn contains(&self, value: u128) -> bool {
        self.start <= value && value <= self.end
    }
}

/// Merged, sorted address ranges of a single family.
///
/// Entries are CIDRs (`10.6.0.0/24`), dash ranges
/// (`10.6.0.10-10.6.0.20`) or single addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpPool {
    family: IpFamily,
    ranges: Vec<IpRange>,
}

impl IpPool {
    pub fn empty(family: IpFamily) -> Self {
        Self {
            family,
            ranges: Vec::new(),
        }
    }

    pub fn parse<S: AsRef<str>>(family: IpFamily, entries: &[S]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            ranges.push(parse_entry(family, entry)?);
        }
        Ok(Self {
            family,
            ranges: merge(ranges),
        })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of addresses, saturating for very large IPv6 pools.
    pub fn size(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.len()))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if IpFamily::of(ip) != self.family {
            return false;
        }
        let value = ip_to_u128(ip);
        let idx = self.ranges.partition_point(|r| r.end < value);
        self.ranges.get(idx).is_some_and(|r| r.contains(value))
    }

    /// Addresses of `used` that belong to this pool, sorted and deduplicated.
    fn used_in_pool(&self, used: &HashSet<IpAddr>) -> Vec<u128> {
        let mut values: Vec<u128> = used
            .iter()
            .filter(|ip| self.contains(ip))
            .map(ip_to_u128)
            .collect();
        values.sort_unstable();
        values.dedup();
        values
    }

    pub fn free_count(&self, used: &HashSet<IpAddr>) -> u128 {
        self.size()
            .saturating_sub(self.used_in_pool(used).len() as u128)
    }

    /// The `n`th address not in `used`, counting from the start of the pool.
    pub fn nth_free(&self, used: &HashSet<IpAddr>, mut n: u128) -> Option<IpAddr> {
        let used = self.used_in_pool(used);
        for range in &self.ranges {
            let taken: Vec<u128> = used
                .iter()
                .copied()
                .filter(|v| range.contains(*v))
                .collect();
            let free = range.len() - taken.len() as u128;
            if n >= free {
                n -= free;
                continue;
            }
            let mut candidate = range.start + n;
            for v in taken {
                if v <= candidate {
                    candidate += 1;
                } else {
                    break;
                }
            }
            return Some(u128_to_ip(candidate, self.family));
        }
        None
    }

    /// Picks a free address uniformly at random.
    pub fn random_free<R: Rng + ?Sized>(&self, used: &HashSet<IpAddr>, rng: &mut R) -> Option<IpAddr> {
        let free = self.free_count(used);
        if free == 0 {
            return None;
        }
        self.nth_free(used, rng.random_range(0..free))
    }
}

fn parse_entry(family: IpFamily, entry: &str) -> Result<IpRange> {
    let range = if let Some((start, end)) = entry.split_once('-') {
        let start = parse_ip(family, start.trim())?;
        let end = parse_ip(family, end.trim())?;
        if end < start {
            return Err(Error::InvalidIpPool(entry.to_owned()));
        }
        IpRange { start, end }
    } else if entry.contains('/') {
        let network: IpNetwork = entry.parse()?;
        if IpFamily::of(&network.ip()) != family {
            return Err(Error::InvalidIpPool(entry.to_owned()));
        }
        IpRange {
            start: ip_to_u128(&network.network()),
            end: ip_to_u128(&network.broadcast()),
        }
    } else {
        let ip = parse_ip(family, entry)?;
        IpRange { start: ip, end: ip }
    };
    Ok(range)
}

fn parse_ip(family: IpFamily, s: &str) -> Result<u128> {
    let ip: IpAddr = s
        .parse()
        .map_err(|_| Error::InvalidIpPool(s.to_owned()))?;
    if IpFamily::of(&ip) != family {
        return Err(Error::InvalidIpPool(s.to_owned()));
    }
    Ok(ip_to_u128(&ip))
}

fn merge(mut ranges: Vec<IpRange>) -> Vec<IpRange> {
    ranges.sort_unstable();
    let mut merged: Vec<IpRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_merge_overlapping() {
        let pool = IpPool::parse(
            IpFamily::V4,
            &["10.0.0.0/30", "10.0.0.2-10.0.0.5", "10.0.0.6", "10.0.1.1"],
        )
        .unwrap();
        assert_eq!(pool.ranges().len(), 2);
        assert_eq!(pool.size(), 8);
        assert!(pool.contains(&ip("10.0.0.6")));
        assert!(!pool.contains(&ip("10.0.0.7")));
        assert!(pool.contains(&ip("10.0.1.1")));
        assert!(!pool.contains(&ip("fd00::1")));
    }

    #[test]
    fn test_parse_rejects_wrong_family() {
        assert!(IpPool::parse(IpFamily::V4, &["fd00::/64"]).is_err());
        assert!(IpPool::parse(IpFamily::V6, &["10.0.0.1"]).is_err());
        assert!(IpPool::parse(IpFamily::V4, &["10.0.0.9-10.0.0.1"]).is_err());
        assert!(IpPool::parse(IpFamily::V4, &["nonsense"]).is_err());
    }

    #[test]
    fn test_nth_free_skips_used() {
        let pool = IpPool::parse(IpFamily::V4, &["10.0.0.1-10.0.0.3", "10.0.0.10-10.0.0.11"]).unwrap();
        let used: HashSet<IpAddr> = [ip("10.0.0.1"), ip("10.0.0.3"), ip("10.0.0.10")].into();
        assert_eq!(pool.free_count(&used), 2);
        assert_eq!(pool.nth_free(&used, 0), Some(ip("10.0.0.2")));
        assert_eq!(pool.nth_free(&used, 1), Some(ip("10.0.0.11")));
        assert_eq!(pool.nth_free(&used, 2), None);
    }

    #[test]
    fn test_random_free_exhausted() {
        let pool = IpPool::parse(IpFamily::V4, &["10.0.0.1"]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let used: HashSet<IpAddr> = [ip("10.0.0.1")].into();
        assert_eq!(pool.random_free(&used, &mut rng), None);
        assert_eq!(
            pool.random_free(&HashSet::new(), &mut rng),
            Some(ip("10.0.0.1"))
        );
    }

    #[test]
    fn test_random_free_ipv6() {
        let pool = IpPool::parse(IpFamily::V6, &["fd00::/120"]).unwrap();
        assert_eq!(pool.size(), 256);
        let mut rng = StdRng::seed_from_u64(1);
        let picked = pool.random_free(&HashSet::new(), &mut rng).unwrap();
        assert!(pool.contains(&picked));
    }
}
