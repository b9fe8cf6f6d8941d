use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::pin;

use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use rtnetlink::packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteFlags, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::{Handle, IpVersion, LinkUnspec, LinkVxlan, RouteMessageBuilder};

use crate::Result;
use crate::ipset::IpFamily;
use crate::route::{
    FdbEntry, Link, Mac, MarkRule, Neighbour, Netlink, ParentLink, RULE_PRIORITY, TableRoute,
    VxlanSpec, family_of, is_link_local,
};

const MAIN_TABLE: u32 = 254;

/// [`Netlink`] over a route netlink socket.
#[derive(Clone)]
pub struct RtNetlink {
    handle: Handle,
}

impl RtNetlink {
    /// Opens the socket and serves it from a background task.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn links(&self) -> Result<Vec<LinkMessage>> {
        Ok(self.handle.link().get().execute().try_collect().await?)
    }

    async fn address_messages(&self, index: u32) -> Result<Vec<AddressMessage>> {
        Ok(self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await?)
    }

    async fn neighbour_messages(&self, index: u32) -> Result<Vec<NeighbourMessage>> {
        let messages: Vec<NeighbourMessage> =
            self.handle.neighbours().get().execute().try_collect().await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.header.ifindex == index)
            .collect())
    }

    /// Bridge family neighbour dump, which is where vxlan FDB entries live.
    async fn fdb_messages(&self, index: u32) -> Result<Vec<NeighbourMessage>> {
        let mut query = NeighbourMessage::default();
        query.header.family = AddressFamily::Bridge;
        let mut request = NetlinkMessage::from(RouteNetlinkMessage::GetNeighbour(query));
        request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.handle.clone();
        let mut response = pin!(handle.request(request)?);
        let mut messages = Vec::new();
        while let Some(message) = response.next().await {
            match message.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neighbour))
                    if neighbour.header.ifindex == index =>
                {
                    messages.push(neighbour)
                }
                NetlinkPayload::Error(e) => return Err(rtnetlink::Error::NetlinkError(e).into()),
                _ => {}
            }
        }
        Ok(messages)
    }

    async fn rule_messages(&self, family: IpFamily) -> Result<Vec<RuleMessage>> {
        Ok(self
            .handle
            .rule()
            .get(ip_version(family))
            .execute()
            .try_collect()
            .await?)
    }

    async fn route_messages(&self, family: IpFamily) -> Result<Vec<RouteMessage>> {
        let query = match family {
            IpFamily::Inet => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            IpFamily::Inet6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        Ok(self.handle.route().get(query).execute().try_collect().await?)
    }
}

fn ip_version(family: IpFamily) -> IpVersion {
    match family {
        IpFamily::Inet => IpVersion::V4,
        IpFamily::Inet6 => IpVersion::V6,
    }
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|a| match a {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

fn link_mac(link: &LinkMessage) -> Option<Mac> {
    link.attributes.iter().find_map(|a| match a {
        LinkAttribute::Address(address) => Mac::try_from(address.as_slice()).ok(),
        _ => None,
    })
}

fn address_network(message: &AddressMessage) -> Option<IpNetwork> {
    let ip = message.attributes.iter().find_map(|a| match a {
        AddressAttribute::Address(ip) => Some(*ip),
        _ => None,
    })?;
    IpNetwork::new(ip, message.header.prefix_len).ok()
}

/// Destination and link layer address of a neighbour or FDB entry.
fn neighbour_parts(message: &NeighbourMessage) -> Option<(IpAddr, Mac)> {
    let mut ip = None;
    let mut mac = None;
    for attribute in &message.attributes {
        match attribute {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                ip = Some(IpAddr::V4(*addr))
            }
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(addr)) => {
                ip = Some(IpAddr::V6(*addr))
            }
            NeighbourAttribute::LinkLocalAddress(lla) => mac = Mac::try_from(lla.as_slice()).ok(),
            _ => {}
        }
    }
    Some((ip?, mac?))
}

fn mark_rule(message: &RuleMessage) -> Option<MarkRule> {
    let mut priority = None;
    let mut mark = None;
    let mut table = u32::from(message.header.table);
    for attribute in &message.attributes {
        match attribute {
            RuleAttribute::Priority(p) => priority = Some(*p),
            RuleAttribute::FwMark(m) => mark = Some(*m),
            RuleAttribute::Table(t) => table = *t,
            _ => {}
        }
    }
    if priority != Some(RULE_PRIORITY) {
        return None;
    }
    Some(MarkRule { mark: mark?, table })
}

fn route_table(message: &RouteMessage) -> u32 {
    message
        .attributes
        .iter()
        .find_map(|a| match a {
            RouteAttribute::Table(t) => Some(*t),
            _ => None,
        })
        .unwrap_or(u32::from(message.header.table))
}

fn table_route(message: &RouteMessage) -> Option<TableRoute> {
    if message.header.destination_prefix_length != 0 {
        return None;
    }
    let via = message.attributes.iter().find_map(|a| match a {
        RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
        RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
        _ => None,
    })?;
    Some(TableRoute {
        table: route_table(message),
        via,
    })
}

impl Netlink for RtNetlink {
    async fn default_parent(&self, family: IpFamily) -> Result<Option<ParentLink>> {
        let routes = self.route_messages(family).await?;
        let oif = routes
            .iter()
            .filter(|r| r.header.destination_prefix_length == 0 && route_table(r) == MAIN_TABLE)
            .find_map(|r| {
                r.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Oif(index) => Some(*index),
                    _ => None,
                })
            });
        let Some(index) = oif else {
            return Ok(None);
        };
        let links = self.links().await?;
        let Some(name) = links
            .iter()
            .find(|l| l.header.index == index)
            .and_then(link_name)
        else {
            return Ok(None);
        };
        let address = self
            .addresses(index)
            .await?
            .into_iter()
            .map(|n| n.ip())
            .find(|ip| family_of(ip) == family && !is_link_local(ip));
        Ok(address.map(|address| ParentLink {
            index,
            name: name.to_owned(),
            address,
        }))
    }

    async fn link(&self, name: &str) -> Result<Option<Link>> {
        Ok(self
            .links()
            .await?
            .iter()
            .find(|l| link_name(l) == Some(name))
            .map(|l| Link {
                index: l.header.index,
                mac: link_mac(l),
            }))
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<()> {
        let builder = LinkVxlan::new(&spec.name, spec.vni)
            .dev(spec.parent)
            .port(spec.port)
            .learning(false)
            .up();
        let builder = match spec.local {
            IpAddr::V4(ip) => builder.local(ip),
            IpAddr::V6(ip) => builder.local6(ip),
        };
        self.handle.link().add(builder.build()).execute().await?;
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<IpNetwork>> {
        Ok(self
            .address_messages(index)
            .await?
            .iter()
            .filter_map(address_network)
            .collect())
    }

    async fn add_address(&self, index: u32, address: IpNetwork) -> Result<()> {
        self.handle
            .address()
            .add(index, address.ip(), address.prefix())
            .execute()
            .await?;
        Ok(())
    }

    async fn del_address(&self, index: u32, address: IpNetwork) -> Result<()> {
        for message in self.address_messages(index).await? {
            if address_network(&message) == Some(address) {
                self.handle.address().del(message).execute().await?;
            }
        }
        Ok(())
    }

    async fn fdb(&self, index: u32) -> Result<Vec<FdbEntry>> {
        Ok(self
            .fdb_messages(index)
            .await?
            .iter()
            .filter_map(neighbour_parts)
            .map(|(dst, mac)| FdbEntry { mac, dst })
            .collect())
    }

    async fn add_fdb(&self, index: u32, entry: FdbEntry) -> Result<()> {
        self.handle
            .neighbours()
            .add_bridge(index, &entry.mac)
            .destination(entry.dst)
            .flags(NeighbourFlags::Own)
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await?;
        Ok(())
    }

    async fn del_fdb(&self, index: u32, entry: FdbEntry) -> Result<()> {
        for message in self.fdb_messages(index).await? {
            if neighbour_parts(&message) == Some((entry.dst, entry.mac)) {
                self.handle.neighbours().del(message).execute().await?;
            }
        }
        Ok(())
    }

    /// Permanent entries only, the kernel owns the rest.
    async fn neighbours(&self, index: u32) -> Result<Vec<Neighbour>> {
        Ok(self
            .neighbour_messages(index)
            .await?
            .iter()
            .filter(|m| m.header.state == NeighbourState::Permanent)
            .filter_map(neighbour_parts)
            .map(|(ip, mac)| Neighbour { ip, mac })
            .collect())
    }

    async fn add_neighbour(&self, index: u32, neighbour: Neighbour) -> Result<()> {
        self.handle
            .neighbours()
            .add(index, neighbour.ip)
            .link_local_address(&neighbour.mac)
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await?;
        Ok(())
    }

    async fn del_neighbour(&self, index: u32, neighbour: Neighbour) -> Result<()> {
        for message in self.neighbour_messages(index).await? {
            if neighbour_parts(&message) == Some((neighbour.ip, neighbour.mac)) {
                self.handle.neighbours().del(message).execute().await?;
            }
        }
        Ok(())
    }

    async fn rules(&self, family: IpFamily) -> Result<Vec<MarkRule>> {
        Ok(self
            .rule_messages(family)
            .await?
            .iter()
            .filter_map(mark_rule)
            .collect())
    }

    async fn add_rule(&self, family: IpFamily, rule: MarkRule) -> Result<()> {
        let mut request = self
            .handle
            .rule()
            .add()
            .table_id(rule.table)
            .priority(RULE_PRIORITY);
        let message = request.message_mut();
        message.header.family = match family {
            IpFamily::Inet => AddressFamily::Inet,
            IpFamily::Inet6 => AddressFamily::Inet6,
        };
        message.header.action = RuleAction::ToTable;
        message.attributes.push(RuleAttribute::FwMark(rule.mark));
        message.attributes.push(RuleAttribute::FwMask(u32::MAX));
        request.execute().await?;
        Ok(())
    }

    async fn del_rule(&self, family: IpFamily, rule: MarkRule) -> Result<()> {
        for message in self.rule_messages(family).await? {
            if mark_rule(&message) == Some(rule) {
                self.handle.rule().del(message).execute().await?;
            }
        }
        Ok(())
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<TableRoute>> {
        Ok(self
            .route_messages(family)
            .await?
            .iter()
            .filter_map(table_route)
            .collect())
    }

    /// Gateway addresses live on other nodes, so the route is on-link.
    async fn add_route(&self, index: u32, route: TableRoute) -> Result<()> {
        let mut message = match route.via {
            IpAddr::V4(via) => RouteMessageBuilder::<Ipv4Addr>::new()
                .table_id(route.table)
                .output_interface(index)
                .gateway(via)
                .build(),
            IpAddr::V6(via) => RouteMessageBuilder::<Ipv6Addr>::new()
                .table_id(route.table)
                .output_interface(index)
                .gateway(via)
                .build(),
        };
        message.header.flags |= RouteFlags::Onlink;
        self.handle.route().add(message).replace().execute().await?;
        Ok(())
    }

    async fn del_route(&self, route: TableRoute) -> Result<()> {
        for message in self.route_messages(family_of(&route.via)).await? {
            if table_route(&message) == Some(route) {
                self.handle.route().del(message).execute().await?;
            }
        }
        Ok(())
    }
}
