use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use regex::Regex;

use crate::Result;

/// Snapshot of one OS network interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub mac: Option<[u8; 6]>,
    pub up: bool,
    pub broadcast: bool,
    pub noarp: bool,
    /// Enslaved to a bridge or bond.
    pub has_master: bool,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl Interface {
    pub fn has_link_local_v6(&self) -> bool {
        self.ipv6.iter().any(|ip| ip.is_unicast_link_local())
    }
}

/// Which responders an interface qualifies for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Qualification {
    pub arp: bool,
    pub ndp: bool,
}

pub fn qualify(intf: &Interface, exclude: Option<&Regex>) -> Qualification {
    let skipped = exclude.is_some_and(|re| re.is_match(&intf.name))
        || !intf.up
        || intf.has_master
        || intf.noarp;
    if skipped {
        return Qualification::default();
    }
    Qualification {
        arp: intf.broadcast,
        ndp: intf.has_link_local_v6(),
    }
}

pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> Result<Vec<Interface>>;
}

/// Reads interfaces from `getifaddrs` and `/sys/class/net`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<Interface>> {
        let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();
        for ifaddr in getifaddrs()? {
            let intf = by_name
                .entry(ifaddr.interface_name.clone())
                .or_insert_with(|| Interface {
                    name: ifaddr.interface_name.clone(),
                    ..Default::default()
                });
            intf.up = ifaddr.flags.contains(InterfaceFlags::IFF_UP);
            intf.broadcast = ifaddr.flags.contains(InterfaceFlags::IFF_BROADCAST);
            intf.noarp = ifaddr.flags.contains(InterfaceFlags::IFF_NOARP);
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(link) = address.as_link_addr() {
                if let Some(mac) = link.addr() {
                    intf.mac = Some(mac);
                }
            } else if let Some(v4) = address.as_sockaddr_in() {
                intf.ipv4.push(v4.ip());
            } else if let Some(v6) = address.as_sockaddr_in6() {
                intf.ipv6.push(v6.ip());
            }
        }

        let mut interfaces = Vec::with_capacity(by_name.len());
        for (name, mut intf) in by_name {
            // Interfaces can vanish between the two calls.
            let Ok(index) = if_nametoindex(name.as_str()) else {
                continue;
            };
            intf.index = index;
            intf.has_master = Path::new("/sys/class/net")
                .join(&name)
                .join("master")
                .exists();
            interfaces.push(intf);
        }
        Ok(interfaces)
    }
}
