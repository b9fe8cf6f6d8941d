use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipnetwork::IpNetwork;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use egress_crds::v1beta1::tunnel::{EgressTunnel, Parent};

use crate::config::TunnelConfig;
use crate::ipset::IpFamily;
use crate::rules::PolicyRoute;
use crate::{Error, Result};

/// Priority of the rules sending marked traffic to a gateway table.
pub const RULE_PRIORITY: u32 = 99;

pub type Mac = [u8; 6];

pub fn parse_mac(s: &str) -> Result<Mac> {
    let mut mac = [0u8; 6];
    let mut octets = s.split(':');
    for byte in mac.iter_mut() {
        let octet = octets.next().ok_or_else(|| Error::InvalidMac(s.to_owned()))?;
        if octet.len() != 2 {
            return Err(Error::InvalidMac(s.to_owned()));
        }
        *byte = u8::from_str_radix(octet, 16).map_err(|_| Error::InvalidMac(s.to_owned()))?;
    }
    if octets.next().is_some() {
        return Err(Error::InvalidMac(s.to_owned()));
    }
    Ok(mac)
}

pub fn format_mac(mac: &Mac) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub(crate) fn family_of(ip: &IpAddr) -> IpFamily {
    match ip {
        IpAddr::V4(_) => IpFamily::Inet,
        IpAddr::V6(_) => IpFamily::Inet6,
    }
}

pub(crate) fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_unicast_link_local(),
    }
}

/// Another node's end of the tunnel, as published in its `EgressTunnel`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub mac: Mac,
    /// Addresses of the interface the peer's tunnel rides on.
    pub underlay: Vec<IpAddr>,
    /// Addresses of the peer's tunnel device.
    pub addresses: Vec<IpAddr>,
}

/// Tunnel and policy routing state one node should converge to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelState {
    /// Tunnel addresses the controller assigned to this node.
    pub local: Vec<IpAddr>,
    pub peers: BTreeMap<String, Peer>,
    /// Tunnel addresses of the remote gateway node behind each mark.
    pub gateways: BTreeMap<u32, Vec<IpAddr>>,
}

impl TunnelState {
    pub fn new(
        node_name: &str,
        tunnels: &[Arc<EgressTunnel>],
        routes: &[PolicyRoute],
        families: &[IpFamily],
    ) -> Self {
        let enabled = |ip: &IpAddr| families.contains(&family_of(ip));
        let mut state = TunnelState::default();
        let mut addresses: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        for tunnel in tunnels {
            let Some(status) = tunnel.status.as_ref() else {
                continue;
            };
            let name = tunnel.name_any();
            let ips: Vec<IpAddr> = [&status.tunnel.ipv4, &status.tunnel.ipv6]
                .into_iter()
                .filter_map(|ip| ip.parse().ok())
                .filter(enabled)
                .collect();
            if name == node_name {
                state.local = ips;
                continue;
            }
            addresses.insert(name.clone(), ips.clone());

            let Ok(mac) = parse_mac(&status.tunnel.mac) else {
                continue;
            };
            let parent = &status.tunnel.parent;
            let underlay: Vec<IpAddr> = [&parent.ipv4, &parent.ipv6]
                .into_iter()
                .filter_map(|ip| ip.parse().ok())
                .collect();
            if underlay.is_empty() {
                continue;
            }
            state.peers.insert(
                name,
                Peer {
                    mac,
                    underlay,
                    addresses: ips,
                },
            );
        }

        for route in routes.iter().filter(|r| r.gateway_node != node_name) {
            let Some(mark) = route.mark else {
                continue;
            };
            match addresses.get(&route.gateway_node) {
                Some(ips) if !ips.is_empty() => {
                    state.gateways.insert(mark, ips.clone());
                }
                _ => {}
            }
        }
        state
    }
}

/// Local end of the tunnel, published in this node's `EgressTunnel`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTunnel {
    pub mac: String,
    pub parent: Parent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub mac: Option<Mac>,
}

/// Interface carrying a default route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentLink {
    pub index: u32,
    pub name: String,
    pub address: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub parent: u32,
    pub local: IpAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FdbEntry {
    pub mac: Mac,
    pub dst: IpAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Neighbour {
    pub ip: IpAddr,
    pub mac: Mac,
}

/// `fwmark <mark> lookup <table>` at [`RULE_PRIORITY`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkRule {
    pub mark: u32,
    pub table: u32,
}

/// Default route of `table` through a gateway's tunnel address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRoute {
    pub table: u32,
    pub via: IpAddr,
}

/// Link, neighbour, rule and route operations the router needs from the
/// kernel.
pub trait Netlink: Send + Sync {
    /// Interface of the main table's default route for `family`, with its
    /// first global address.
    fn default_parent(
        &self,
        family: IpFamily,
    ) -> impl Future<Output = Result<Option<ParentLink>>> + Send;
    fn link(&self, name: &str) -> impl Future<Output = Result<Option<Link>>> + Send;
    fn add_vxlan(&self, spec: &VxlanSpec) -> impl Future<Output = Result<()>> + Send;
    fn set_up(&self, index: u32) -> impl Future<Output = Result<()>> + Send;
    fn addresses(&self, index: u32) -> impl Future<Output = Result<Vec<IpNetwork>>> + Send;
    fn add_address(&self, index: u32, address: IpNetwork) -> impl Future<Output = Result<()>> + Send;
    fn del_address(&self, index: u32, address: IpNetwork) -> impl Future<Output = Result<()>> + Send;
    fn fdb(&self, index: u32) -> impl Future<Output = Result<Vec<FdbEntry>>> + Send;
    fn add_fdb(&self, index: u32, entry: FdbEntry) -> impl Future<Output = Result<()>> + Send;
    fn del_fdb(&self, index: u32, entry: FdbEntry) -> impl Future<Output = Result<()>> + Send;
    fn neighbours(&self, index: u32) -> impl Future<Output = Result<Vec<Neighbour>>> + Send;
    fn add_neighbour(&self, index: u32, neighbour: Neighbour) -> impl Future<Output = Result<()>> + Send;
    fn del_neighbour(&self, index: u32, neighbour: Neighbour) -> impl Future<Output = Result<()>> + Send;
    /// Mark rules at [`RULE_PRIORITY`].
    fn rules(&self, family: IpFamily) -> impl Future<Output = Result<Vec<MarkRule>>> + Send;
    fn add_rule(&self, family: IpFamily, rule: MarkRule) -> impl Future<Output = Result<()>> + Send;
    fn del_rule(&self, family: IpFamily, rule: MarkRule) -> impl Future<Output = Result<()>> + Send;
    /// Default routes with a gateway, in any table.
    fn routes(&self, family: IpFamily) -> impl Future<Output = Result<Vec<TableRoute>>> + Send;
    fn add_route(&self, index: u32, route: TableRoute) -> impl Future<Output = Result<()>> + Send;
    fn del_route(&self, route: TableRoute) -> impl Future<Output = Result<()>> + Send;
}

/// Converges the vxlan device, its peers and the per-gateway routing tables
/// of one node. Every sync reads the kernel state first, so entries removed
/// or changed by someone else are repaired.
pub struct Router<N: Netlink> {
    netlink: N,
    config: TunnelConfig,
    mark_start: u32,
    mark_count: u32,
    families: Vec<IpFamily>,
}

impl<N: Netlink> Router<N> {
    pub fn new(
        netlink: N,
        config: TunnelConfig,
        mark_start: u32,
        mark_count: u32,
        families: Vec<IpFamily>,
    ) -> Self {
        Self {
            netlink,
            config,
            mark_start,
            mark_count,
            families,
        }
    }

    pub fn netlink(&self) -> &N {
        &self.netlink
    }

    /// Routing table of `mark`, `None` outside the mark range.
    pub fn table(&self, mark: u32) -> Option<u32> {
        let offset = mark.checked_sub(self.mark_start)?;
        if offset >= self.mark_count {
            return None;
        }
        self.config.table_start.checked_add(offset)
    }

    fn owns_table(&self, table: u32) -> bool {
        table
            .checked_sub(self.config.table_start)
            .is_some_and(|offset| offset < self.mark_count)
    }

    /// Programs `desired` and returns the local tunnel end, `None` when the
    /// node has no default route to carry it.
    pub async fn sync(&self, desired: &TunnelState) -> Result<Option<LocalTunnel>> {
        let mut parents = BTreeMap::new();
        for family in &self.families {
            if let Some(parent) = self.netlink.default_parent(*family).await? {
                parents.insert(*family, parent);
            }
        }
        let Some(underlay) = parents.values().next().cloned() else {
            warn!("no default route, skipping tunnel setup");
            return Ok(None);
        };

        let link = self.ensure_vxlan(&underlay).await?;
        self.sync_addresses(link.index, &desired.local).await?;
        self.sync_peers(link.index, family_of(&underlay.address), &desired.peers)
            .await?;
        self.sync_tables(link.index, &desired.gateways).await?;

        let address = |family: IpFamily| {
            parents
                .get(&family)
                .map(|p| p.address.to_string())
                .unwrap_or_default()
        };
        Ok(Some(LocalTunnel {
            mac: link.mac.as_ref().map(format_mac).unwrap_or_default(),
            parent: Parent {
                name: underlay.name.clone(),
                ipv4: address(IpFamily::Inet),
                ipv6: address(IpFamily::Inet6),
            },
        }))
    }

    async fn ensure_vxlan(&self, parent: &ParentLink) -> Result<Link> {
        if let Some(link) = self.netlink.link(&self.config.name).await? {
            self.netlink.set_up(link.index).await?;
            return Ok(link);
        }
        info!(name = %self.config.name, vni = self.config.vni, parent = %parent.name, "creating vxlan device");
        self.netlink
            .add_vxlan(&VxlanSpec {
                name: self.config.name.clone(),
                vni: self.config.vni,
                port: self.config.port,
                parent: parent.index,
                local: parent.address,
            })
            .await?;
        self.netlink
            .link(&self.config.name)
            .await?
            .ok_or_else(|| Error::LinkNotFound(self.config.name.clone()))
    }

    async fn sync_addresses(&self, index: u32, local: &[IpAddr]) -> Result<()> {
        let desired: Vec<IpNetwork> = local.iter().copied().map(IpNetwork::from).collect();
        let current = self.netlink.addresses(index).await?;
        for address in &current {
            if !desired.contains(address) && !is_link_local(&address.ip()) {
                debug!(%address, "removing tunnel address");
                self.netlink.del_address(index, *address).await?;
            }
        }
        for address in desired.iter().filter(|a| !current.contains(*a)) {
            info!(%address, "adding tunnel address");
            self.netlink.add_address(index, *address).await?;
        }
        Ok(())
    }

    /// FDB entries send each peer's MAC to its underlay address, neighbour
    /// entries resolve its tunnel addresses to that MAC.
    async fn sync_peers(
        &self,
        index: u32,
        underlay: IpFamily,
        peers: &BTreeMap<String, Peer>,
    ) -> Result<()> {
        let mut fdb = BTreeSet::new();
        let mut neighbours = BTreeSet::new();
        for peer in peers.values() {
            let Some(dst) = peer.underlay.iter().find(|ip| family_of(ip) == underlay) else {
                continue;
            };
            fdb.insert(FdbEntry {
                mac: peer.mac,
                dst: *dst,
            });
            neighbours.extend(peer.addresses.iter().map(|ip| Neighbour {
                ip: *ip,
                mac: peer.mac,
            }));
        }

        let current: BTreeSet<FdbEntry> = self.netlink.fdb(index).await?.into_iter().collect();
        for entry in current.difference(&fdb) {
            debug!(mac = %format_mac(&entry.mac), dst = %entry.dst, "removing fdb entry");
            self.netlink.del_fdb(index, *entry).await?;
        }
        for entry in fdb.difference(&current) {
            debug!(mac = %format_mac(&entry.mac), dst = %entry.dst, "adding fdb entry");
            self.netlink.add_fdb(index, *entry).await?;
        }

        let current: BTreeSet<Neighbour> =
            self.netlink.neighbours(index).await?.into_iter().collect();
        for neighbour in current.difference(&neighbours) {
            debug!(ip = %neighbour.ip, "removing tunnel neighbour");
            self.netlink.del_neighbour(index, *neighbour).await?;
        }
        for neighbour in neighbours.difference(&current) {
            debug!(ip = %neighbour.ip, mac = %format_mac(&neighbour.mac), "adding tunnel neighbour");
            self.netlink.add_neighbour(index, *neighbour).await?;
        }
        Ok(())
    }

    /// One table per remote gateway mark, holding a default route through
    /// the gateway's tunnel address.
    async fn sync_tables(&self, index: u32, gateways: &BTreeMap<u32, Vec<IpAddr>>) -> Result<()> {
        for family in &self.families {
            let mut rules = BTreeSet::new();
            let mut routes = BTreeSet::new();
            for (mark, ips) in gateways {
                let Some(via) = ips.iter().find(|ip| family_of(ip) == *family) else {
                    continue;
                };
                let Some(table) = self.table(*mark) else {
                    warn!(mark = %format!("{mark:#x}"), "mark outside the configured range");
                    continue;
                };
                rules.insert(MarkRule { mark: *mark, table });
                routes.insert(TableRoute { table, via: *via });
            }

            let current: BTreeSet<MarkRule> = self
                .netlink
                .rules(*family)
                .await?
                .into_iter()
                .filter(|r| self.owns_table(r.table))
                .collect();
            for rule in current.difference(&rules) {
                info!(family = family.as_str(), mark = %format!("{:#x}", rule.mark), table = rule.table, "removing mark rule");
                self.netlink.del_rule(*family, *rule).await?;
            }
            for rule in rules.difference(&current) {
                info!(family = family.as_str(), mark = %format!("{:#x}", rule.mark), table = rule.table, "adding mark rule");
                self.netlink.add_rule(*family, *rule).await?;
            }

            let current: BTreeSet<TableRoute> = self
                .netlink
                .routes(*family)
                .await?
                .into_iter()
                .filter(|r| self.owns_table(r.table))
                .collect();
            for route in current.difference(&routes) {
                debug!(table = route.table, via = %route.via, "removing gateway route");
                self.netlink.del_route(*route).await?;
            }
            for route in routes.difference(&current) {
                info!(table = route.table, via = %route.via, "adding gateway route");
                self.netlink.add_route(index, *route).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLinks {
    parents: BTreeMap<IpFamily, ParentLink>,
    links: BTreeMap<String, (Link, Option<VxlanSpec>, bool)>,
    addresses: BTreeMap<u32, Vec<IpNetwork>>,
    fdb: BTreeMap<u32, BTreeSet<FdbEntry>>,
    neighbours: BTreeMap<u32, BTreeSet<Neighbour>>,
    rules: BTreeSet<(IpFamily, MarkRule)>,
    routes: BTreeMap<TableRoute, u32>,
    writes: usize,
    next_index: u32,
}

/// In-process links, tables and rules. Writes are counted so callers can
/// check a converged sync is read-only.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetlink {
    state: Arc<Mutex<MemoryLinks>>,
}

impl MemoryNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryLinks> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> MutexGuard<'_, MemoryLinks> {
        let mut state = self.state();
        state.writes += 1;
        state
    }

    /// Adds a plain interface with a default route for `address`'s family.
    pub fn add_parent(&self, name: &str, address: IpAddr) -> u32 {
        let mut state = self.state();
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(
            name.to_owned(),
            (Link { index, mac: None }, None, true),
        );
        state.parents.insert(
            family_of(&address),
            ParentLink {
                index,
                name: name.to_owned(),
                address,
            },
        );
        index
    }

    pub fn vxlan(&self, name: &str) -> Option<VxlanSpec> {
        self.state().links.get(name).and_then(|(_, spec, _)| spec.clone())
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state().links.get(name).is_some_and(|(_, _, up)| *up)
    }

    pub fn set_down(&self, name: &str) {
        if let Some((_, _, up)) = self.state().links.get_mut(name) {
            *up = false;
        }
    }

    pub fn address_list(&self, index: u32) -> Vec<IpNetwork> {
        self.state().addresses.get(&index).cloned().unwrap_or_default()
    }

    pub fn fdb_entries(&self, index: u32) -> Vec<FdbEntry> {
        self.state()
            .fdb
            .get(&index)
            .map(|e| e.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn neighbour_entries(&self, index: u32) -> Vec<Neighbour> {
        self.state()
            .neighbours
            .get(&index)
            .map(|e| e.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rule_list(&self, family: IpFamily) -> Vec<MarkRule> {
        self.state()
            .rules
            .iter()
            .filter(|(f, _)| *f == family)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Routes with the interface they leave through.
    pub fn route_list(&self) -> Vec<(TableRoute, u32)> {
        self.state().routes.iter().map(|(r, i)| (*r, *i)).collect()
    }

    pub fn writes(&self) -> usize {
        self.state().writes
    }
}

impl Netlink for MemoryNetlink {
    async fn default_parent(&self, family: IpFamily) -> Result<Option<ParentLink>> {
        Ok(self.state().parents.get(&family).cloned())
    }

    async fn link(&self, name: &str) -> Result<Option<Link>> {
        Ok(self.state().links.get(name).map(|(link, _, _)| link.clone()))
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<()> {
        let mut state = self.write();
        state.next_index += 1;
        let index = state.next_index;
        let mac = [0x02, 0, 0, 0, 0, index as u8];
        state.links.insert(
            spec.name.clone(),
            (
                Link {
                    index,
                    mac: Some(mac),
                },
                Some(spec.clone()),
                true,
            ),
        );
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some((_, _, up)) = state.links.values_mut().find(|(l, _, _)| l.index == index) {
            if !*up {
                *up = true;
                state.writes += 1;
            }
        }
        Ok(())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNetwork>> {
        Ok(self.address_list(index))
    }

    async fn add_address(&self, index: u32, address: IpNetwork) -> Result<()> {
        self.write().addresses.entry(index).or_default().push(address);
        Ok(())
    }

    async fn del_address(&self, index: u32, address: IpNetwork) -> Result<()> {
        if let Some(addresses) = self.write().addresses.get_mut(&index) {
            addresses.retain(|a| *a != address);
        }
        Ok(())
    }

    async fn fdb(&self, index: u32) -> Result<Vec<FdbEntry>> {
        Ok(self.fdb_entries(index))
    }

    async fn add_fdb(&self, index: u32, entry: FdbEntry) -> Result<()> {
        self.write().fdb.entry(index).or_default().insert(entry);
        Ok(())
    }

    async fn del_fdb(&self, index: u32, entry: FdbEntry) -> Result<()> {
        if let Some(entries) = self.write().fdb.get_mut(&index) {
            entries.remove(&entry);
        }
        Ok(())
    }

    async fn neighbours(&self, index: u32) -> Result<Vec<Neighbour>> {
        Ok(self.neighbour_entries(index))
    }

    async fn add_neighbour(&self, index: u32, neighbour: Neighbour) -> Result<()> {
        let mut state = self.write();
        let entries = state.neighbours.entry(index).or_default();
        entries.retain(|n| n.ip != neighbour.ip);
        entries.insert(neighbour);
        Ok(())
    }

    async fn del_neighbour(&self, index: u32, neighbour: Neighbour) -> Result<()> {
        if let Some(entries) = self.write().neighbours.get_mut(&index) {
            entries.remove(&neighbour);
        }
        Ok(())
    }

    async fn rules(&self, family: IpFamily) -> Result<Vec<MarkRule>> {
        Ok(self.rule_list(family))
    }

    async fn add_rule(&self, family: IpFamily, rule: MarkRule) -> Result<()> {
        self.write().rules.insert((family, rule));
        Ok(())
    }

    async fn del_rule(&self, family: IpFamily, rule: MarkRule) -> Result<()> {
        self.write().rules.remove(&(family, rule));
        Ok(())
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<TableRoute>> {
        Ok(self
            .state()
            .routes
            .keys()
            .filter(|r| family_of(&r.via) == family)
            .copied()
            .collect())
    }

    async fn add_route(&self, index: u32, route: TableRoute) -> Result<()> {
        let mut state = self.write();
        // Replace semantics: one default route per table and family.
        state
            .routes
            .retain(|r, _| r.table != route.table || family_of(&r.via) != family_of(&route.via));
        state.routes.insert(route, index);
        Ok(())
    }

    async fn del_route(&self, route: TableRoute) -> Result<()> {
        self.write().routes.remove(&route);
        Ok(())
    }
}
