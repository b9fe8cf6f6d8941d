use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use egress_crds::v1beta1::tunnel::EgressTunnel;
use ipnetwork::{Ipv4Network, Ipv6Network};
use tracing::{info, warn};

use crate::ippool::{IpFamily, ip_to_u128};
use crate::{Error, Result};

/// Hands out the lowest free value of an inclusive range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeAllocator {
    start: u128,
    end: u128,
    used: BTreeSet<u128>,
}

impl RangeAllocator {
    pub fn new(start: u128, end: u128) -> Self {
        Self {
            start,
            end,
            used: BTreeSet::new(),
        }
    }

    pub fn acquire(&mut self) -> Option<u128> {
        let mut candidate = self.start;
        for used in self.used.range(self.start..=self.end) {
            if *used != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate > self.end {
            return None;
        }
        self.used.insert(candidate);
        Some(candidate)
    }

    /// Marks `value` used. False when out of range or already taken.
    pub fn acquire_specific(&mut self, value: u128) -> bool {
        if value < self.start || value > self.end {
            return false;
        }
        self.used.insert(value)
    }

    pub fn release(&mut self, value: u128) {
        self.used.remove(&value);
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}

/// Mark and tunnel addresses held by one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelAllocation {
    pub mark: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl TunnelAllocation {
    /// The allocation recorded in a tunnel's status, if it has a mark.
    pub fn from_tunnel(tunnel: &EgressTunnel) -> Option<Self> {
        let mark = tunnel.mark()?;
        let status = tunnel.status.as_ref()?;
        Some(Self {
            mark,
            ipv4: status.tunnel.ipv4.parse().ok(),
            ipv6: status.tunnel.ipv6.parse().ok(),
        })
    }
}

type Compensation = Box<dyn FnOnce(&mut TunnelAllocators) + Send>;

fn release_ip(family: IpFamily, value: u128) -> Compensation {
    Box::new(move |a: &mut TunnelAllocators| {
        if let Some(r) = a.ip_allocator(family) {
            r.release(value);
        }
    })
}

#[derive(Clone, Debug)]
pub struct TunnelAllocators {
    marks: RangeAllocator,
    ipv4: Option<RangeAllocator>,
    ipv6: Option<RangeAllocator>,
    nodes: BTreeMap<String, TunnelAllocation>,
}

impl TunnelAllocators {
    pub fn new(
        mark_start: u32,
        mark_count: u32,
        ipv4_subnet: Option<Ipv4Network>,
        ipv6_subnet: Option<Ipv6Network>,
    ) -> Self {
        let mark_end = u128::from(mark_start) + u128::from(mark_count.max(1)) - 1;
        let ipv4 = ipv4_subnet.map(|net| {
            let (start, end) = (u32::from(net.network()), u32::from(net.broadcast()));
            // Skip the network and broadcast addresses when there are any.
            if net.prefix() < 31 {
                RangeAllocator::new(u128::from(start) + 1, u128::from(end) - 1)
            } else {
                RangeAllocator::new(u128::from(start), u128::from(end))
            }
        });
        let ipv6 = ipv6_subnet.map(|net| {
            let start = u128::from(net.network());
            let end = u128::from(net.broadcast());
            if net.prefix() < 127 {
                RangeAllocator::new(start + 1, end)
            } else {
                RangeAllocator::new(start, end)
            }
        });
        Self {
            marks: RangeAllocator::new(u128::from(mark_start), mark_end.min(u128::from(u32::MAX))),
            ipv4,
            ipv6,
            nodes: BTreeMap::new(),
        }
    }

    pub fn get(&self, node: &str) -> Option<&TunnelAllocation> {
        self.nodes.get(node)
    }

    /// Records an allocation found in an existing tunnel status. Conflicting
    /// values are dropped so the node gets fresh ones on its next reconcile.
    pub fn restore(&mut self, node: &str, allocation: TunnelAllocation) -> bool {
        if self.nodes.contains_key(node) {
            return true;
        }
        let mut undo: Vec<Compensation> = Vec::new();
        let mark = u128::from(allocation.mark);
        if !self.marks.acquire_specific(mark) {
            warn!(%node, mark = allocation.mark, "mark already in use, dropping");
            return false;
        }
        undo.push(Box::new(move |a: &mut TunnelAllocators| a.marks.release(mark)));

        let restored = self.restore_ip(allocation.ipv4.map(IpAddr::V4), &mut undo)
            && self.restore_ip(allocation.ipv6.map(IpAddr::V6), &mut undo);
        if !restored {
            warn!(%node, "tunnel address conflict, dropping");
            self.compensate(undo);
            return false;
        }
        self.nodes.insert(node.to_owned(), allocation);
        true
    }

    fn restore_ip(&mut self, ip: Option<IpAddr>, undo: &mut Vec<Compensation>) -> bool {
        let Some(ip) = ip else {
            return true;
        };
        let value = ip_to_u128(&ip);
        let allocator = match ip {
            IpAddr::V4(_) => self.ipv4.as_mut(),
            IpAddr::V6(_) => self.ipv6.as_mut(),
        };
        let Some(allocator) = allocator else {
            // The family is no longer configured.
            return true;
        };
        if !allocator.acquire_specific(value) {
            return false;
        }
        undo.push(release_ip(IpFamily::of(&ip), value));
        true
    }

    fn ip_allocator(&mut self, family: IpFamily) -> Option<&mut RangeAllocator> {
        match family {
            IpFamily::V4 => self.ipv4.as_mut(),
            IpFamily::V6 => self.ipv6.as_mut(),
        }
    }

    fn compensate(&mut self, undo: Vec<Compensation>) {
        for f in undo.into_iter().rev() {
            f(self);
        }
    }

    /// Returns the node's allocation, acquiring a mark and tunnel addresses
    /// for every configured family on first use. Nothing stays acquired
    /// when any step fails.
    pub fn acquire(&mut self, node: &str) -> Result<TunnelAllocation> {
        if let Some(existing) = self.nodes.get(node) {
            return Ok(existing.clone());
        }
        let mut undo: Vec<Compensation> = Vec::new();
        match self.acquire_steps(&mut undo) {
            Ok(allocation) => {
                info!(%node, mark = allocation.mark, ipv4 = ?allocation.ipv4, ipv6 = ?allocation.ipv6, "allocated tunnel");
                self.nodes.insert(node.to_owned(), allocation.clone());
                Ok(allocation)
            }
            Err(e) => {
                self.compensate(undo);
                Err(e)
            }
        }
    }

    fn acquire_steps(&mut self, undo: &mut Vec<Compensation>) -> Result<TunnelAllocation> {
        let mark = self
            .marks
            .acquire()
            .ok_or(Error::AllocatorExhausted("mark"))?;
        undo.push(Box::new(move |a: &mut TunnelAllocators| a.marks.release(mark)));

        let ipv4 = self
            .acquire_ip(IpFamily::V4, undo)?
            .map(|v| Ipv4Addr::from(v as u32));
        let ipv6 = self.acquire_ip(IpFamily::V6, undo)?.map(Ipv6Addr::from);

        Ok(TunnelAllocation {
            mark: u32::try_from(mark).map_err(|_| Error::AllocatorExhausted("mark"))?,
            ipv4,
            ipv6,
        })
    }

    fn acquire_ip(&mut self, family: IpFamily, undo: &mut Vec<Compensation>) -> Result<Option<u128>> {
        let Some(allocator) = self.ip_allocator(family) else {
            return Ok(None);
        };
        let value = allocator
            .acquire()
            .ok_or(Error::AllocatorExhausted(family.as_str()))?;
        undo.push(release_ip(family, value));
        Ok(Some(value))
    }

    pub fn release(&mut self, node: &str) -> Option<TunnelAllocation> {
        let allocation = self.nodes.remove(node)?;
        self.marks.release(u128::from(allocation.mark));
        if let (Some(ip), Some(r)) = (allocation.ipv4, self.ipv4.as_mut()) {
            r.release(u128::from(u32::from(ip)));
        }
        if let (Some(ip), Some(r)) = (allocation.ipv6, self.ipv6.as_mut()) {
            r.release(u128::from(ip));
        }
        info!(%node, mark = allocation.mark, "released tunnel");
        Some(allocation)
    }
}
