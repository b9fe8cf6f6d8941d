use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::announcer::{DropReason, Responder, ShouldAnnounce};
use crate::interfaces::Interface;
use crate::{Error, Result};

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IP: u16 = 0x0800;
const ETH_HEADER_LEN: usize = 14;
const ARP_FRAME_LEN: usize = ETH_HEADER_LEN + 28;
const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;
const BROADCAST: [u8; 6] = [0xff; 6];
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_hw: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_hw: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parses an Ethernet frame carrying an ARP request for IPv4 over Ethernet.
pub fn parse_request(frame: &[u8]) -> Result<ArpPacket, DropReason> {
    if frame.len() < ARP_FRAME_LEN {
        return Err(DropReason::Error);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_ARP {
        return Err(DropReason::MessageType);
    }
    let arp = &frame[ETH_HEADER_LEN..ARP_FRAME_LEN];
    let htype = u16::from_be_bytes([arp[0], arp[1]]);
    let ptype = u16::from_be_bytes([arp[2], arp[3]]);
    if htype != 1 || ptype != ETH_P_IP || arp[4] != 6 || arp[5] != 4 {
        return Err(DropReason::MessageType);
    }
    let operation = u16::from_be_bytes([arp[6], arp[7]]);
    if operation != OP_REQUEST {
        return Err(DropReason::ArpReply);
    }
    let mut packet = ArpPacket {
        operation,
        sender_hw: [0; 6],
        sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
        target_hw: [0; 6],
        target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
    };
    packet.sender_hw.copy_from_slice(&arp[8..14]);
    packet.target_hw.copy_from_slice(&arp[18..24]);
    Ok(packet)
}

pub fn build_frame(eth_dst: [u8; 6], eth_src: [u8; 6], packet: &ArpPacket) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ARP_FRAME_LEN);
    frame.extend_from_slice(&eth_dst);
    frame.extend_from_slice(&eth_src);
    frame.extend_from_slice(&ETH_P_ARP.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&ETH_P_IP.to_be_bytes());
    frame.push(6);
    frame.push(4);
    frame.extend_from_slice(&packet.operation.to_be_bytes());
    frame.extend_from_slice(&packet.sender_hw);
    frame.extend_from_slice(&packet.sender_ip.octets());
    frame.extend_from_slice(&packet.target_hw);
    frame.extend_from_slice(&packet.target_ip.octets());
    frame
}

/// Reply claiming `request.target_ip` for `mac`.
pub fn build_reply(mac: [u8; 6], request: &ArpPacket) -> Vec<u8> {
    build_frame(
        request.sender_hw,
        mac,
        &ArpPacket {
            operation: OP_REPLY,
            sender_hw: mac,
            sender_ip: request.target_ip,
            target_hw: request.sender_hw,
            target_ip: request.sender_ip,
        },
    )
}

/// Unsolicited broadcast reply so neighbours refresh their caches.
pub fn build_gratuitous(mac: [u8; 6], ip: Ipv4Addr) -> Vec<u8> {
    build_frame(
        BROADCAST,
        mac,
        &ArpPacket {
            operation: OP_REPLY,
            sender_hw: mac,
            sender_ip: ip,
            target_hw: BROADCAST,
            target_ip: ip,
        },
    )
}

/// Answers ARP requests on one interface from a dedicated thread.
pub struct ArpResponder {
    interface: String,
    mac: [u8; 6],
    socket: Arc<Socket>,
    closed: Arc<AtomicBool>,
}

impl ArpResponder {
    pub fn new(intf: &Interface, should_announce: ShouldAnnounce) -> Result<Self> {
        let mac = intf
            .mac
            .ok_or_else(|| Error::NoHardwareAddress(intf.name.clone()))?;
        let protocol = i32::from(ETH_P_ARP.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))?;
        bind_packet_socket(&socket, intf.index, ETH_P_ARP)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let responder = Self {
            interface: intf.name.clone(),
            mac,
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let socket = responder.socket.clone();
        let closed = responder.closed.clone();
        let interface = responder.interface.clone();
        std::thread::Builder::new()
            .name(format!("arp-{}", intf.name))
            .spawn(move || serve(&socket, &closed, &interface, mac, &should_announce))?;
        info!(interface = %intf.name, "created ARP responder");
        Ok(responder)
    }
}

fn serve(
    socket: &Socket,
    closed: &AtomicBool,
    interface: &str,
    mac: [u8; 6],
    should_announce: &ShouldAnnounce,
) {
    let mut buf = [0u8; 1500];
    while !closed.load(Ordering::Relaxed) {
        let n = match (&*socket).read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                if !closed.load(Ordering::Relaxed) {
                    warn!(interface, error = %e, "reading ARP socket failed");
                }
                return;
            }
        };
        let request = match parse_request(&buf[..n]) {
            Ok(request) => request,
            Err(_) => continue,
        };
        match should_announce(IpAddr::V4(request.target_ip), interface) {
            DropReason::None => {}
            DropReason::NotMatchInterface => {
                debug!(interface, ip = %request.target_ip, "ignore ARP request, interface not selected");
                continue;
            }
            reason => {
                trace!(interface, ip = %request.target_ip, ?reason, "ignore ARP request");
                continue;
            }
        }
        if let Err(e) = socket.send(&build_reply(mac, &request)) {
            warn!(interface, ip = %request.target_ip, error = %e, "failed to send ARP reply");
        } else {
            debug!(interface, ip = %request.target_ip, sender = %request.sender_ip, "sent ARP reply");
        }
    }
}

impl Responder for ArpResponder {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn gratuitous(&self, ip: IpAddr) -> Result<()> {
        let IpAddr::V4(ip) = ip else {
            return Err(Error::WrongFamily(ip));
        };
        self.socket.send(&build_gratuitous(self.mac, ip))?;
        Ok(())
    }

    fn watch(&self, _ip: IpAddr) -> Result<()> {
        Ok(())
    }

    fn unwatch(&self, _ip: IpAddr) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        info!(interface = %self.interface, "closed ARP responder");
    }
}

fn bind_packet_socket(socket: &Socket, ifindex: u32, protocol: u16) -> io::Result<()> {
    // SAFETY: sockaddr_ll is plain old data, zeroed is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = protocol.to_be();
    addr.sll_ifindex = ifindex as libc::c_int;
    // SAFETY: addr outlives the call and the length matches its type.
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            (&addr as *const libc::sockaddr_ll).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
