use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{SockaddrIn6, recvfrom};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::announcer::{DropReason, Responder, ShouldAnnounce};
use crate::interfaces::Interface;
use crate::{Error, Result};

const NEIGHBOR_SOLICITATION: u8 = 135;
const NEIGHBOR_ADVERTISEMENT: u8 = 136;
const OPT_SOURCE_LL: u8 = 1;
const OPT_TARGET_LL: u8 = 2;
const FLAG_SOLICITED: u8 = 0x40;
const FLAG_OVERRIDE: u8 = 0x20;
const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborSolicitation {
    pub target: Ipv6Addr,
    pub source_ll: [u8; 6],
}

/// `ff02::1:ffXX:XXXX` carrying the low 24 bits of `ip`.
pub fn solicited_node_multicast(ip: Ipv6Addr) -> Ipv6Addr {
    let o = ip.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

/// Parses an ICMPv6 message as received on a raw ICMPv6 socket.
pub fn parse_solicitation(msg: &[u8]) -> Result<NeighborSolicitation, DropReason> {
    if msg.len() < 24 {
        return Err(DropReason::Error);
    }
    if msg[0] != NEIGHBOR_SOLICITATION || msg[1] != 0 {
        return Err(DropReason::MessageType);
    }
    let mut target = [0u8; 16];
    target.copy_from_slice(&msg[8..24]);

    let mut options = &msg[24..];
    while options.len() >= 8 {
        let len = usize::from(options[1]) * 8;
        if len == 0 || len > options.len() {
            return Err(DropReason::Error);
        }
        if options[0] == OPT_SOURCE_LL && len >= 8 {
            let mut source_ll = [0u8; 6];
            source_ll.copy_from_slice(&options[2..8]);
            return Ok(NeighborSolicitation {
                target: Ipv6Addr::from(target),
                source_ll,
            });
        }
        options = &options[len..];
    }
    Err(DropReason::NoSourceLL)
}

/// Neighbor advertisement for `target`. The kernel fills in the checksum.
pub fn build_advertisement(mac: [u8; 6], target: Ipv6Addr, gratuitous: bool) -> Vec<u8> {
    let flags = if gratuitous {
        FLAG_OVERRIDE
    } else {
        FLAG_SOLICITED
    };
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(&[NEIGHBOR_ADVERTISEMENT, 0, 0, 0, flags, 0, 0, 0]);
    msg.extend_from_slice(&target.octets());
    msg.extend_from_slice(&[OPT_TARGET_LL, 1]);
    msg.extend_from_slice(&mac);
    msg
}

/// Answers neighbor solicitations on one interface from a dedicated thread.
pub struct NdpResponder {
    interface: String,
    index: u32,
    mac: [u8; 6],
    socket: Arc<Socket>,
    closed: Arc<AtomicBool>,
    solicited_node_groups: Mutex<HashMap<Ipv6Addr, usize>>,
}

impl NdpResponder {
    pub fn new(intf: &Interface, should_announce: ShouldAnnounce) -> Result<Self> {
        let mac = intf
            .mac
            .ok_or_else(|| Error::NoHardwareAddress(intf.name.clone()))?;
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.bind_device(Some(intf.name.as_bytes()))?;
        socket.set_multicast_if_v6(intf.index)?;
        socket.set_multicast_hops_v6(255)?;
        socket.set_unicast_hops_v6(255)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let responder = Self {
            interface: intf.name.clone(),
            index: intf.index,
            mac,
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            solicited_node_groups: Mutex::new(HashMap::new()),
        };
        let socket = responder.socket.clone();
        let closed = responder.closed.clone();
        let interface = responder.interface.clone();
        let index = intf.index;
        std::thread::Builder::new()
            .name(format!("ndp-{}", intf.name))
            .spawn(move || serve(&socket, &closed, &interface, index, mac, &should_announce))?;
        info!(interface = %intf.name, "created NDP responder");
        Ok(responder)
    }

    fn advertise(&self, dst: Ipv6Addr, target: Ipv6Addr, gratuitous: bool) -> Result<()> {
        send_advertisement(&self.socket, self.index, self.mac, dst, target, gratuitous)
    }
}

fn send_advertisement(
    socket: &Socket,
    index: u32,
    mac: [u8; 6],
    dst: Ipv6Addr,
    target: Ipv6Addr,
    gratuitous: bool,
) -> Result<()> {
    let addr = SockAddr::from(SocketAddrV6::new(dst, 0, 0, index));
    socket.send_to(&build_advertisement(mac, target, gratuitous), &addr)?;
    Ok(())
}

fn serve(
    socket: &Socket,
    closed: &AtomicBool,
    interface: &str,
    index: u32,
    mac: [u8; 6],
    should_announce: &ShouldAnnounce,
) {
    let mut buf = [0u8; 1500];
    while !closed.load(Ordering::Relaxed) {
        let (n, src) = match recvfrom::<SockaddrIn6>(socket.as_raw_fd(), &mut buf) {
            Ok((n, Some(src))) => (n, src.ip()),
            Ok((_, None)) => continue,
            Err(Errno::EAGAIN | Errno::EINTR) => continue,
            Err(e) => {
                if !closed.load(Ordering::Relaxed) {
                    warn!(interface, error = %e, "reading NDP socket failed");
                }
                return;
            }
        };
        let ns = match parse_solicitation(&buf[..n]) {
            Ok(ns) => ns,
            Err(DropReason::NoSourceLL) => {
                trace!(interface, %src, "ignore solicitation without source link-layer address");
                continue;
            }
            Err(_) => continue,
        };
        match should_announce(IpAddr::V6(ns.target), interface) {
            DropReason::None => {}
            DropReason::NotMatchInterface => {
                debug!(interface, ip = %ns.target, "ignore NDP request, interface not selected");
                continue;
            }
            reason => {
                trace!(interface, ip = %ns.target, ?reason, "ignore NDP request");
                continue;
            }
        }
        if src.is_unspecified() {
            continue;
        }
        if let Err(e) = send_advertisement(socket, index, mac, src, ns.target, false) {
            warn!(interface, ip = %ns.target, error = %e, "failed to send neighbor advertisement");
        } else {
            debug!(interface, ip = %ns.target, %src, "sent neighbor advertisement");
        }
    }
}

impl Responder for NdpResponder {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn gratuitous(&self, ip: IpAddr) -> Result<()> {
        let IpAddr::V6(ip) = ip else {
            return Err(Error::WrongFamily(ip));
        };
        self.advertise(ALL_NODES, ip, true)
    }

    fn watch(&self, ip: IpAddr) -> Result<()> {
        let IpAddr::V6(ip) = ip else {
            return Err(Error::WrongFamily(ip));
        };
        let group = solicited_node_multicast(ip);
        let mut groups = self
            .solicited_node_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = groups.entry(group).or_default();
        *count += 1;
        if *count > 1 {
            return Ok(());
        }
        if let Err(e) = self.socket.join_multicast_v6(&group, self.index) {
            groups.remove(&group);
            return Err(e.into());
        }
        Ok(())
    }

    fn unwatch(&self, ip: IpAddr) -> Result<()> {
        let IpAddr::V6(ip) = ip else {
            return Err(Error::WrongFamily(ip));
        };
        let group = solicited_node_multicast(ip);
        let mut groups = self
            .solicited_node_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(count) = groups.get_mut(&group) else {
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        groups.remove(&group);
        self.socket.leave_multicast_v6(&group, self.index)?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        info!(interface = %self.interface, "closed NDP responder");
    }
}
