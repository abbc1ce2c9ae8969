//! Thin, synchronous rtnetlink operations: add/delete veth pairs, look up
//! links, move a link into another namespace, enslave to a bridge, flip
//! IFF_UP, assign addresses and add routes.
//!
//! Each operation is one request message on a blocking `NETLINK_ROUTE`
//! socket, acked with `NLM_F_ACK`; kernel errors come back as `nlmsgerr`
//! and are surfaced as the matching errno. Because the socket holds no
//! state beyond the sequence counter, a fresh socket can be opened inside
//! a foreign network namespace and acts on that namespace only.

use std::mem;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;

use super::conf::Cidr;
use crate::types::{BoxError, Result};

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 0x2;
const NLMSG_DONE: u16 = 0x3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_SETLINK: u16 = 19;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

pub const IFF_UP: u32 = 0x1;

const RECV_BUF_LEN: usize = 8192;

/// A link as seen by the kernel: its interface index and flags.
#[derive(Clone, Copy, Debug)]
pub struct Link {
    pub index: i32,
    pub flags: u32,
}

/// One blocking rtnetlink socket bound in the caller's current network
/// namespace.
pub struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    pub fn connect() -> Result<Netlink> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(BoxError::sys("socket", "netlink route", Errno::last()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(BoxError::sys("bind", "netlink route", Errno::last()));
        }

        Ok(Netlink { fd, seq: 0 })
    }

    /// Creates a veth pair; both ends start in the caller's namespace.
    pub fn link_add_veth(&mut self, name: &str, peer_name: &str) -> Result<()> {
        let mut req = self.request(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.payload(&ifinfomsg(0, 0, 0));
        req.attr_str(IFLA_IFNAME, name);

        let linkinfo = req.begin_nested(IFLA_LINKINFO);
        req.attr(IFLA_INFO_KIND, b"veth");
        let data = req.begin_nested(IFLA_INFO_DATA);
        let peer = req.begin_nested(VETH_INFO_PEER);
        req.payload(&ifinfomsg(0, 0, 0));
        req.attr_str(IFLA_IFNAME, peer_name);
        req.end_nested(peer);
        req.end_nested(data);
        req.end_nested(linkinfo);

        self.execute_ack(req, "add veth", name)
    }

    pub fn link_del(&mut self, index: i32) -> Result<()> {
        let mut req = self.request(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.payload(&ifinfomsg(index, 0, 0));
        self.execute_ack(req, "del link", &index.to_string())
    }

    /// Looks up a link by interface name in the caller's namespace.
    pub fn link_by_name(&mut self, name: &str) -> Result<Link> {
        let mut req = self.request(RTM_GETLINK, NLM_F_REQUEST);
        req.payload(&ifinfomsg(0, 0, 0));
        req.attr_str(IFLA_IFNAME, name);
        let seq = req.seq;
        self.send(req.finish())?;

        for msg in self.receive(seq)? {
            match msg.msg_type {
                NLMSG_ERROR => {
                    check_ack(&msg.payload, "get link", name)?;
                    return Err(BoxError::Net(format!(
                        "unexpected ack looking up {:?}",
                        name
                    )));
                }
                RTM_NEWLINK => {
                    if msg.payload.len() < 16 {
                        return Err(BoxError::Net(format!(
                            "short link response for {:?}",
                            name
                        )));
                    }
                    let index = i32::from_ne_bytes(msg.payload[4..8].try_into().unwrap());
                    let flags = u32::from_ne_bytes(msg.payload[8..12].try_into().unwrap());
                    return Ok(Link { index, flags });
                }
                _ => {}
            }
        }
        Err(BoxError::Net(format!("no response looking up {:?}", name)))
    }

    pub fn link_set_up(&mut self, index: i32) -> Result<()> {
        self.link_change_flags(index, IFF_UP, IFF_UP)
    }

    pub fn link_set_down(&mut self, index: i32) -> Result<()> {
        self.link_change_flags(index, 0, IFF_UP)
    }

    fn link_change_flags(&mut self, index: i32, flags: u32, change: u32) -> Result<()> {
        let mut req = self.request(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.payload(&ifinfomsg(index, flags, change));
        self.execute_ack(req, "set link flags", &index.to_string())
    }

    /// Moves a link into the network namespace of `pid`.
    pub fn link_set_ns_by_pid(&mut self, index: i32, pid: i32) -> Result<()> {
        let mut req = self.request(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.payload(&ifinfomsg(index, 0, 0));
        req.attr(IFLA_NET_NS_PID, &(pid as u32).to_ne_bytes());
        self.execute_ack(req, "set link netns", &index.to_string())
    }

    /// Enslaves a link to a bridge (or any master device).
    pub fn link_set_master(&mut self, index: i32, master_index: i32) -> Result<()> {
        let mut req = self.request(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.payload(&ifinfomsg(index, 0, 0));
        req.attr(IFLA_MASTER, &(master_index as u32).to_ne_bytes());
        self.execute_ack(req, "set link master", &index.to_string())
    }

    /// Assigns an address to a link. Local and peer address are the same,
    /// as appropriate for a point-to-point veth end.
    pub fn addr_add(&mut self, index: i32, addr: &Cidr) -> Result<()> {
        let mut req = self.request(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.payload(&ifaddrmsg(family(&addr.addr), addr.prefix, index as u32));
        req.attr(IFA_LOCAL, &ip_bytes(&addr.addr));
        req.attr(IFA_ADDRESS, &ip_bytes(&addr.addr));
        self.execute_ack(req, "add address", &addr.to_string())
    }

    /// Adds a unicast route through `gateway`, bound to the link with the
    /// given index.
    pub fn route_add(&mut self, index: i32, dst: &Cidr, gateway: IpAddr) -> Result<()> {
        let mut req = self.request(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.payload(&rtmsg(family(&dst.addr), dst.prefix));
        req.attr(RTA_DST, &ip_bytes(&dst.addr));
        req.attr(RTA_GATEWAY, &ip_bytes(&gateway));
        req.attr(RTA_OIF, &(index as u32).to_ne_bytes());
        self.execute_ack(req, "add route", &dst.to_string())
    }

    fn request(&mut self, msg_type: u16, flags: u16) -> Request {
        self.seq += 1;
        Request::new(msg_type, flags, self.seq)
    }

    fn execute_ack(&mut self, req: Request, op: &'static str, target: &str) -> Result<()> {
        let seq = req.seq;
        self.send(req.finish())?;
        for msg in self.receive(seq)? {
            if msg.msg_type == NLMSG_ERROR {
                return check_ack(&msg.payload, op, target);
            }
        }
        Err(BoxError::Net(format!("no ack for {} {}", op, target)))
    }

    fn send(&self, buf: Vec<u8>) -> Result<()> {
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(BoxError::sys("send", "netlink route", Errno::last()));
        }
        Ok(())
    }

    /// Reads one datagram and splits it into messages matching `seq`.
    fn receive(&self, seq: u32) -> Result<Vec<Message>> {
        let mut buf = [0u8; RECV_BUF_LEN];
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(BoxError::sys("recv", "netlink route", Errno::last()));
        }
        split_messages(&buf[..rc as usize], seq)
    }
}

struct Message {
    msg_type: u16,
    payload: Vec<u8>,
}

fn split_messages(data: &[u8], seq: u32) -> Result<Vec<Message>> {
    let mut msgs = Vec::new();
    let mut off = 0;
    while off + NLMSG_HDRLEN <= data.len() {
        let len = u32::from_ne_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(data[off + 4..off + 6].try_into().unwrap());
        let msg_seq = u32::from_ne_bytes(data[off + 8..off + 12].try_into().unwrap());
        if len < NLMSG_HDRLEN || off + len > data.len() {
            return Err(BoxError::Net("malformed netlink response".into()));
        }
        if msg_type == NLMSG_DONE {
            break;
        }
        if msg_seq == seq {
            msgs.push(Message {
                msg_type,
                payload: data[off + NLMSG_HDRLEN..off + len].to_vec(),
            });
        }
        off += align4(len);
    }
    Ok(msgs)
}

/// Decodes an `nlmsgerr` payload: code 0 is a positive ack, anything else
/// carries the negated errno.
fn check_ack(payload: &[u8], op: &'static str, target: &str) -> Result<()> {
    if payload.len() < 4 {
        return Err(BoxError::Net(format!("truncated ack for {} {}", op, target)));
    }
    let code = i32::from_ne_bytes(payload[..4].try_into().unwrap());
    if code == 0 {
        Ok(())
    } else {
        Err(BoxError::Sys {
            op,
            target: target.to_string(),
            source: Errno::from_raw(-code),
        })
    }
}

struct Request {
    buf: Vec<u8>,
    seq: u32,
}

impl Request {
    fn new(msg_type: u16, flags: u16, seq: u32) -> Request {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched in finish
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // port id
        Request { buf, seq }
    }

    fn payload(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn attr(&mut self, kind: u16, data: &[u8]) {
        let len = 4 + data.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.pad();
    }

    fn attr_str(&mut self, kind: u16, s: &str) {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        self.attr(kind, &data);
    }

    /// Opens a nested attribute; returns the offset to pass to
    /// `end_nested`.
    fn begin_nested(&mut self, kind: u16) -> usize {
        let at = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        at
    }

    fn end_nested(&mut self, at: usize) {
        let len = (self.buf.len() - at) as u16;
        self.buf[at..at + 2].copy_from_slice(&len.to_ne_bytes());
        self.pad();
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

fn ifinfomsg(index: i32, flags: u32, change: u32) -> [u8; 16] {
    let mut b = [0u8; 16];
    // family 0 (AF_UNSPEC), pad, type 0
    b[4..8].copy_from_slice(&index.to_ne_bytes());
    b[8..12].copy_from_slice(&flags.to_ne_bytes());
    b[12..16].copy_from_slice(&change.to_ne_bytes());
    b
}

fn ifaddrmsg(family: u8, prefix: u8, index: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0] = family;
    b[1] = prefix;
    // flags 0, scope RT_SCOPE_UNIVERSE
    b[3] = RT_SCOPE_UNIVERSE;
    b[4..8].copy_from_slice(&index.to_ne_bytes());
    b
}

fn rtmsg(family: u8, dst_len: u8) -> [u8; 12] {
    let mut b = [0u8; 12];
    b[0] = family;
    b[1] = dst_len;
    b[4] = RT_TABLE_MAIN;
    b[5] = RTPROT_BOOT;
    b[6] = RT_SCOPE_UNIVERSE;
    b[7] = RTN_UNICAST;
    b
}

fn family(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

fn ip_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_is_patched_on_finish() {
        let mut req = Request::new(RTM_GETLINK, NLM_F_REQUEST, 7);
        req.payload(&ifinfomsg(0, 0, 0));
        req.attr_str(IFLA_IFNAME, "eth0");
        let buf = req.finish();

        assert_eq!(buf.len() % 4, 0);
        let len = u32::from_ne_bytes(buf[..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len());
        assert_eq!(u16::from_ne_bytes(buf[4..6].try_into().unwrap()), RTM_GETLINK);
        assert_eq!(u32::from_ne_bytes(buf[8..12].try_into().unwrap()), 7);
    }

    #[test]
    fn attrs_are_aligned_and_nul_terminated() {
        let mut req = Request::new(RTM_NEWLINK, NLM_F_REQUEST, 1);
        req.payload(&ifinfomsg(0, 0, 0));
        req.attr_str(IFLA_IFNAME, "veth0");
        let buf = req.finish();

        // attr starts right after the fixed parts
        let at = NLMSG_HDRLEN + 16;
        let alen = u16::from_ne_bytes(buf[at..at + 2].try_into().unwrap());
        let akind = u16::from_ne_bytes(buf[at + 2..at + 4].try_into().unwrap());
        assert_eq!(akind, IFLA_IFNAME);
        assert_eq!(alen as usize, 4 + "veth0".len() + 1);
        assert_eq!(&buf[at + 4..at + 9], b"veth0");
        assert_eq!(buf[at + 9], 0);
    }

    #[test]
    fn nested_attr_lengths_cover_their_children() {
        let mut req = Request::new(RTM_NEWLINK, NLM_F_REQUEST, 1);
        req.payload(&ifinfomsg(0, 0, 0));
        let outer = req.begin_nested(IFLA_LINKINFO);
        req.attr(IFLA_INFO_KIND, b"veth");
        req.end_nested(outer);
        let buf = req.finish();

        let at = NLMSG_HDRLEN + 16;
        let outer_len = u16::from_ne_bytes(buf[at..at + 2].try_into().unwrap()) as usize;
        // nested header + inner attr header + "veth"
        assert_eq!(outer_len, 4 + 4 + 4);
        let kind = u16::from_ne_bytes(buf[at + 2..at + 4].try_into().unwrap());
        assert_eq!(kind, IFLA_LINKINFO);
    }

    #[test]
    fn split_messages_filters_by_sequence() {
        // two messages, seq 5 and seq 6
        let mut data = Vec::new();
        for seq in [5u32, 6] {
            let mut req = Request::new(RTM_NEWLINK, 0, seq);
            req.payload(&ifinfomsg(3, IFF_UP, 0));
            data.extend_from_slice(&req.finish());
        }

        let msgs = split_messages(&data, 6).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, RTM_NEWLINK);
        let index = i32::from_ne_bytes(msgs[0].payload[4..8].try_into().unwrap());
        assert_eq!(index, 3);
    }

    #[test]
    fn negative_ack_decodes_errno() {
        // nlmsgerr: error code followed by the original header
        let mut payload = (-(libc::EEXIST)).to_ne_bytes().to_vec();
        payload.extend_from_slice(&[0u8; NLMSG_HDRLEN]);
        match check_ack(&payload, "add veth", "veth0") {
            Err(BoxError::Sys { source, .. }) => assert_eq!(source, Errno::EEXIST),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn positive_ack_is_success() {
        let mut payload = 0i32.to_ne_bytes().to_vec();
        payload.extend_from_slice(&[0u8; NLMSG_HDRLEN]);
        assert!(check_ack(&payload, "add veth", "veth0").is_ok());
        assert!(check_ack(&[0u8; 2], "add veth", "veth0").is_err());
    }

    #[test]
    fn malformed_datagram_is_rejected() {
        let mut req = Request::new(RTM_NEWLINK, 0, 1);
        req.payload(&ifinfomsg(0, 0, 0));
        let mut buf = req.finish();
        buf[0] = 0xff; // length larger than the datagram
        buf[1] = 0xff;
        assert!(split_messages(&buf, 1).is_err());
    }

    #[test]
    fn connect_opens_a_route_socket() {
        // Plain socket creation needs no privileges.
        let nl = Netlink::connect().unwrap();
        assert!(nl.fd.as_raw_fd() >= 0);
    }

    #[test]
    fn loopback_lookup() {
        let mut nl = Netlink::connect().unwrap();
        let link = nl.link_by_name("lo").unwrap();
        assert!(link.index >= 1);
    }
}
