//! rtnetlink adapter: kernel operations and their asynchronous completions.
//!
//! All kernel work a link needs (addresses, routes, link flags, MTU,
//! enslavement) is expressed as a typed [`Op`], queued on the [`Rtnl`]
//! adapter, and acknowledged through a [`Completion`] carrying the netlink
//! errno. Completions are delivered in submission order, so a link's stage
//! counters drain in the order the requests were issued.
//!
//! The wire side talks raw NETLINK_ROUTE over a `libc` socket: nlmsghdr,
//! ifinfomsg/ifaddrmsg/rtmsg payloads and rtattr TLVs are assembled by hand.
//! Received datagrams are walked with one message iterator shared by the
//! request/ACK path and the multicast monitor. A detached adapter (no
//! socket) keeps requests pending until they are completed explicitly; the
//! daemon uses this at shutdown to cancel, tests use it to script kernel
//! acknowledgments.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::address::Address;
use crate::netdev::NetDev;
use crate::route::Route;

// ---------------------------------------------------------------------------
// Netlink constants (from linux/netlink.h, linux/rtnetlink.h, linux/if.h)
// ---------------------------------------------------------------------------

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_SETLINK: u16 = 19;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_ROOT: u16 = 0x0100;
const NLM_F_MATCH: u16 = 0x0200;
const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
const NLM_F_CREATE: u16 = 0x0400;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_REPLACE: u16 = 0x0100;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_NOOP: u16 = 1;

/// rtnetlink multicast group carrying link state changes.
const RTMGRP_LINK: u32 = 1;

const AF_INET: u8 = 2;
const AF_UNSPEC: u8 = 0;

// Link attributes (IFLA_*)
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_MASTER: u16 = 10;

// Address attributes (IFA_*)
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_LABEL: u16 = 3;
const IFA_BROADCAST: u16 = 4;
const IFA_CACHEINFO: u16 = 6;

// Route attributes (RTA_*)
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;

const RT_TABLE_MAIN: u8 = 254;
const RTN_UNICAST: u8 = 1;

/// Route/address scopes.
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;

/// Interface flag word bits (IFF_*).
pub const IFF_UP: u32 = 0x1;
pub const IFF_LOWER_UP: u32 = 0x10000;
pub const IFF_DORMANT: u32 = 0x20000;

const NLMSG_HDR_LEN: usize = 16;
const NLMSG_ALIGNTO: usize = 4;

const IFINFOMSG_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTMSG_LEN: usize = 12;
const CACHEINFO_LEN: usize = 16;

/// How long a blocking request socket waits for the kernel's reply before
/// giving up on the exchange.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUF_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Link messages (RTM_NEWLINK / RTM_DELLINK)
// ---------------------------------------------------------------------------

/// A parsed RTM_NEWLINK message.
#[derive(Debug, Clone)]
pub struct LinkMessage {
    /// Kernel interface index.
    pub ifindex: u32,
    /// Interface name, when the message carries IFLA_IFNAME.
    pub ifname: Option<String>,
    /// Hardware address; the kernel may omit it.
    pub mac: Option<[u8; 6]>,
    /// MTU, 0 when absent.
    pub mtu: u32,
    /// IFF_* flag word.
    pub flags: u32,
}

/// A link state change received from the kernel multicast group.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    NewLink(LinkMessage),
    DelLink(u32),
}

/// The ifi_index field of an ifinfomsg payload.
fn link_ifindex(payload: &[u8]) -> Option<u32> {
    let bytes = payload.get(4..8)?.try_into().ok()?;
    Some(i32::from_ne_bytes(bytes) as u32)
}

fn parse_link_message(payload: &[u8]) -> Option<LinkMessage> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }
    let ifindex = link_ifindex(payload)?;
    let flags = u32::from_ne_bytes(payload[8..12].try_into().ok()?);

    let attrs = parse_rtattrs(&payload[IFINFOMSG_LEN..]);

    let ifname = attrs.get(&IFLA_IFNAME).and_then(|d| {
        std::str::from_utf8(d)
            .ok()
            .map(|s| s.trim_end_matches('\0').to_string())
    });

    let mac = attrs.get(&IFLA_ADDRESS).and_then(|d| {
        if d.len() == 6 {
            let mut m = [0u8; 6];
            m.copy_from_slice(d);
            Some(m)
        } else {
            None
        }
    });

    let mtu = attrs
        .get(&IFLA_MTU)
        .and_then(|d| d.get(..4))
        .and_then(|d| d.try_into().ok())
        .map(u32::from_ne_bytes)
        .unwrap_or(0);

    Some(LinkMessage {
        ifindex,
        ifname,
        mac,
        mtu,
        flags,
    })
}

// ---------------------------------------------------------------------------
// Receive-buffer message iteration
// ---------------------------------------------------------------------------

/// One netlink message split out of a receive buffer.
struct RawMessage<'a> {
    msg_type: u16,
    payload: &'a [u8],
}

/// Walk the messages packed into one received datagram. Iteration stops at
/// the first header whose claimed length does not fit the buffer.
fn split_messages(buf: &[u8]) -> MessageIter<'_> {
    MessageIter { rest: buf }
}

struct MessageIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = RawMessage<'a>;

    fn next(&mut self) -> Option<RawMessage<'a>> {
        if self.rest.len() < NLMSG_HDR_LEN {
            return None;
        }
        let nlmsg_len = u32::from_ne_bytes(self.rest[0..4].try_into().ok()?) as usize;
        let msg_type = u16::from_ne_bytes(self.rest[4..6].try_into().ok()?);
        if nlmsg_len < NLMSG_HDR_LEN || nlmsg_len > self.rest.len() {
            return None;
        }

        let payload = &self.rest[NLMSG_HDR_LEN..nlmsg_len];
        self.rest = &self.rest[nlmsg_align(nlmsg_len).min(self.rest.len())..];
        Some(RawMessage { msg_type, payload })
    }
}

/// The errno leading an NLMSG_ERROR payload; zero is the ACK.
fn ack_errno(payload: &[u8]) -> i32 {
    payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_ne_bytes)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Netlink socket
// ---------------------------------------------------------------------------

/// Owned socket descriptor, closed on drop so every early exit in the
/// setup path releases it.
struct Fd(i32);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn set_recv_timeout(fd: &Fd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.0,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The port id the kernel assigned at bind time; requests carry it so
/// replies are routed back to us.
fn local_port(fd: &Fd) -> io::Result<u32> {
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd.0,
            &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.nl_pid)
}

/// A NETLINK_ROUTE socket.
pub struct NetlinkSocket {
    fd: Fd,
    seq: u32,
    pid: u32,
}

impl NetlinkSocket {
    /// Open a request/reply socket (no multicast groups).
    pub fn open() -> io::Result<Self> {
        Self::open_with_groups(0, false)
    }

    /// Open a non-blocking socket subscribed to link notifications.
    pub fn open_monitor() -> io::Result<Self> {
        Self::open_with_groups(RTMGRP_LINK, true)
    }

    fn open_with_groups(groups: u32, nonblock: bool) -> io::Result<Self> {
        let mut ty = libc::SOCK_RAW | libc::SOCK_CLOEXEC;
        if nonblock {
            ty |= libc::SOCK_NONBLOCK;
        }
        let raw = unsafe { libc::socket(libc::AF_NETLINK, ty, NETLINK_ROUTE) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = Fd(raw);

        let mut local: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        local.nl_family = libc::AF_NETLINK as u16;
        local.nl_groups = groups;
        let ret = unsafe {
            libc::bind(
                fd.0,
                &local as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if !nonblock {
            // A request socket must not stall the event loop when the
            // kernel never answers.
            set_recv_timeout(&fd, REPLY_TIMEOUT)?;
        }

        Ok(Self {
            pid: local_port(&fd)?,
            fd,
            seq: 1,
        })
    }

    fn next_seq(&mut self) -> u32 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    fn send(&self, msg: &[u8]) -> io::Result<()> {
        let sent =
            unsafe { libc::send(self.fd.0, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Send one request and collect `(type, payload)` for every reply
    /// message up to the terminating ACK or NLMSG_DONE. A negative ACK
    /// becomes the matching `io::Error`.
    fn request(&mut self, msg: &[u8]) -> io::Result<Vec<(u16, Vec<u8>)>> {
        self.send(msg)?;

        let mut responses = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];

        loop {
            let n = match self.recv(&mut buf, 0) {
                Ok(0) => return Ok(responses),
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    // Reply timeout; hand back whatever arrived.
                    return Ok(responses);
                }
                Err(e) => return Err(e),
            };

            for raw in split_messages(&buf[..n]) {
                match raw.msg_type {
                    NLMSG_DONE => return Ok(responses),
                    NLMSG_ERROR => {
                        let errno = ack_errno(raw.payload);
                        if errno < 0 {
                            return Err(io::Error::from_raw_os_error(-errno));
                        }
                        return Ok(responses);
                    }
                    NLMSG_NOOP => {}
                    other => responses.push((other, raw.payload.to_vec())),
                }
            }
        }
    }

    /// Drain pending multicast notifications without blocking.
    pub fn poll_events(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];

        while let Ok(n) = self.recv(&mut buf, libc::MSG_DONTWAIT) {
            if n == 0 {
                break;
            }
            for raw in split_messages(&buf[..n]) {
                match raw.msg_type {
                    RTM_NEWLINK => {
                        if let Some(m) = parse_link_message(raw.payload) {
                            events.push(LinkEvent::NewLink(m));
                        }
                    }
                    RTM_DELLINK => {
                        if let Some(ifindex) = link_ifindex(raw.payload) {
                            events.push(LinkEvent::DelLink(ifindex));
                        }
                    }
                    _ => {}
                }
            }
        }

        events
    }

    /// Dump all links (RTM_GETLINK).
    pub fn dump_links(&mut self) -> io::Result<Vec<LinkMessage>> {
        let seq = self.next_seq();
        let msg_len = NLMSG_HDR_LEN + IFINFOMSG_LEN;
        let mut msg = vec![0u8; nlmsg_align(msg_len)];

        put_u32(&mut msg, 0, msg_len as u32);
        put_u16(&mut msg, 4, RTM_GETLINK);
        put_u16(&mut msg, 6, NLM_F_REQUEST | NLM_F_DUMP);
        put_u32(&mut msg, 8, seq);
        put_u32(&mut msg, 12, self.pid);
        msg[NLMSG_HDR_LEN] = AF_UNSPEC;

        let responses = self.request(&msg)?;
        Ok(responses
            .iter()
            .filter(|(msg_type, _)| *msg_type == RTM_NEWLINK)
            .filter_map(|(_, payload)| parse_link_message(payload))
            .collect())
    }

    // -- modification requests ---------------------------------------------

    fn addr_request(
        &mut self,
        msg_type: u16,
        nl_flags: u16,
        ifindex: u32,
        addr: &Address,
        with_cacheinfo: bool,
    ) -> io::Result<()> {
        let mut attrs_len = 2 * rta_aligned_len(4); // IFA_LOCAL + IFA_ADDRESS
        if addr.broadcast.is_some() && msg_type == RTM_NEWADDR {
            attrs_len += rta_aligned_len(4);
        }
        let label_bytes = addr.label.as_ref().map(|l| l.len() + 1);
        if let Some(n) = label_bytes {
            attrs_len += rta_aligned_len(n);
        }
        if with_cacheinfo {
            attrs_len += rta_aligned_len(CACHEINFO_LEN);
        }

        let msg_len = NLMSG_HDR_LEN + IFADDRMSG_LEN + attrs_len;
        let mut msg = vec![0u8; nlmsg_align(msg_len)];
        let seq = self.next_seq();

        put_u32(&mut msg, 0, msg_len as u32);
        put_u16(&mut msg, 4, msg_type);
        put_u16(&mut msg, 6, NLM_F_REQUEST | NLM_F_ACK | nl_flags);
        put_u32(&mut msg, 8, seq);
        put_u32(&mut msg, 12, self.pid);

        let ifa = NLMSG_HDR_LEN;
        msg[ifa] = AF_INET;
        msg[ifa + 1] = addr.prefixlen;
        msg[ifa + 3] = addr.scope;
        put_u32(&mut msg, ifa + 4, ifindex);

        let mut off = NLMSG_HDR_LEN + IFADDRMSG_LEN;
        put_rta_ipv4(&mut msg, off, IFA_LOCAL, addr.in_addr);
        off += rta_aligned_len(4);
        put_rta_ipv4(&mut msg, off, IFA_ADDRESS, addr.in_addr);
        off += rta_aligned_len(4);

        if msg_type == RTM_NEWADDR
            && let Some(brd) = addr.broadcast
        {
            put_rta_ipv4(&mut msg, off, IFA_BROADCAST, brd);
            off += rta_aligned_len(4);
        }

        if let Some(ref label) = addr.label {
            let mut data = label.as_bytes().to_vec();
            data.push(0);
            put_rta_bytes(&mut msg, off, IFA_LABEL, &data);
            off += rta_aligned_len(data.len());
        }

        if with_cacheinfo {
            // struct ifa_cacheinfo: prefered, valid, cstamp, tstamp.
            let mut ci = [0u8; CACHEINFO_LEN];
            ci[0..4].copy_from_slice(&addr.preferred_lifetime.to_ne_bytes());
            ci[4..8].copy_from_slice(&addr.valid_lifetime.to_ne_bytes());
            put_rta_bytes(&mut msg, off, IFA_CACHEINFO, &ci);
        }

        self.request(&msg)?;
        Ok(())
    }

    fn route_request(
        &mut self,
        msg_type: u16,
        nl_flags: u16,
        ifindex: u32,
        route: &Route,
    ) -> io::Result<()> {
        let dst_len = if route.dst_prefixlen > 0 {
            rta_aligned_len(4)
        } else {
            0
        };
        let gw_len = if route.gateway.is_some() {
            rta_aligned_len(4)
        } else {
            0
        };
        let metric_len = if route.metric != 0 {
            rta_aligned_len(4)
        } else {
            0
        };
        let oif_len = rta_aligned_len(4);

        let msg_len = NLMSG_HDR_LEN + RTMSG_LEN + dst_len + gw_len + oif_len + metric_len;
        let mut msg = vec![0u8; nlmsg_align(msg_len)];
        let seq = self.next_seq();

        put_u32(&mut msg, 0, msg_len as u32);
        put_u16(&mut msg, 4, msg_type);
        put_u16(&mut msg, 6, NLM_F_REQUEST | NLM_F_ACK | nl_flags);
        put_u32(&mut msg, 8, seq);
        put_u32(&mut msg, 12, self.pid);

        let rt = NLMSG_HDR_LEN;
        msg[rt] = AF_INET;
        msg[rt + 1] = route.dst_prefixlen;
        msg[rt + 4] = RT_TABLE_MAIN;
        msg[rt + 6] = route.scope;
        msg[rt + 7] = RTN_UNICAST;

        let mut off = NLMSG_HDR_LEN + RTMSG_LEN;
        if route.dst_prefixlen > 0 {
            put_rta_ipv4(&mut msg, off, RTA_DST, route.dst);
            off += dst_len;
        }
        if let Some(gw) = route.gateway {
            put_rta_ipv4(&mut msg, off, RTA_GATEWAY, gw);
            off += gw_len;
        }
        put_rta_u32(&mut msg, off, RTA_OIF, ifindex);
        off += oif_len;
        if route.metric != 0 {
            put_rta_u32(&mut msg, off, RTA_PRIORITY, route.metric);
        }

        self.request(&msg)?;
        Ok(())
    }

    fn link_request(&mut self, ifindex: u32, build: impl FnOnce(&mut Vec<u8>)) -> io::Result<()> {
        let seq = self.next_seq();
        let mut msg = vec![0u8; NLMSG_HDR_LEN + IFINFOMSG_LEN];

        put_u16(&mut msg, 4, RTM_SETLINK);
        put_u16(&mut msg, 6, NLM_F_REQUEST | NLM_F_ACK);
        put_u32(&mut msg, 8, seq);
        put_u32(&mut msg, 12, self.pid);
        msg[NLMSG_HDR_LEN] = AF_UNSPEC;
        put_i32(&mut msg, NLMSG_HDR_LEN + 4, ifindex as i32);

        build(&mut msg);

        let len = msg.len();
        put_u32(&mut msg, 0, len as u32);
        msg.resize(nlmsg_align(len), 0);

        self.request(&msg)?;
        Ok(())
    }

    fn set_flags(&mut self, ifindex: u32, mask: u32, value: u32) -> io::Result<()> {
        self.link_request(ifindex, |msg| {
            put_u32(msg, NLMSG_HDR_LEN + 8, value & mask); // ifi_flags
            put_u32(msg, NLMSG_HDR_LEN + 12, mask); // ifi_change
        })
    }

    fn set_mtu(&mut self, ifindex: u32, mtu: u32) -> io::Result<()> {
        self.link_request(ifindex, |msg| {
            let off = msg.len();
            msg.resize(off + rta_aligned_len(4), 0);
            put_rta_u32(msg, off, IFLA_MTU, mtu);
        })
    }

    fn set_master(&mut self, ifindex: u32, master_ifindex: u32) -> io::Result<()> {
        self.link_request(ifindex, |msg| {
            let off = msg.len();
            msg.resize(off + rta_aligned_len(4), 0);
            put_rta_u32(msg, off, IFLA_MASTER, master_ifindex);
        })
    }
}

// ---------------------------------------------------------------------------
// Typed operations and completions
// ---------------------------------------------------------------------------

/// A kernel operation submitted on behalf of one link.
#[derive(Debug, Clone)]
pub enum Op {
    AddressConfigure(Address),
    AddressUpdate(Address),
    AddressDrop(Address),
    RouteConfigure(Route),
    RouteDrop(Route),
    SetFlags { mask: u32, value: u32 },
    SetMtu(u32),
    Enslave { master: NetDev },
}

/// Discriminant of [`Op`], echoed in the completion so the link knows which
/// handler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    AddressConfigure,
    AddressUpdate,
    AddressDrop,
    RouteConfigure,
    RouteDrop,
    SetFlags,
    SetMtu,
    Enslave,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::AddressConfigure(_) => OpKind::AddressConfigure,
            Op::AddressUpdate(_) => OpKind::AddressUpdate,
            Op::AddressDrop(_) => OpKind::AddressDrop,
            Op::RouteConfigure(_) => OpKind::RouteConfigure,
            Op::RouteDrop(_) => OpKind::RouteDrop,
            Op::SetFlags { .. } => OpKind::SetFlags,
            Op::SetMtu(_) => OpKind::SetMtu,
            Op::Enslave { .. } => OpKind::Enslave,
        }
    }
}

/// A queued request.
#[derive(Debug, Clone)]
pub struct Request {
    pub ifindex: u32,
    pub op: Op,
}

/// A finished kernel operation. `errno` is 0 on success, a negative errno
/// otherwise (`-libc::EEXIST`, `-libc::ENOENT`, ...).
#[derive(Debug, Clone)]
pub struct Completion {
    pub ifindex: u32,
    pub kind: OpKind,
    pub errno: i32,
}

/// The adapter: a request queue in front of the netlink socket.
///
/// `process()` executes queued requests and turns each ACK into a
/// completion; a detached adapter leaves requests pending so the caller
/// decides their outcome (`complete_next`, `cancel_pending`).
pub struct Rtnl {
    socket: Option<NetlinkSocket>,
    pending: VecDeque<Request>,
    completions: VecDeque<Completion>,
}

impl Rtnl {
    /// Adapter backed by a kernel socket.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            socket: Some(NetlinkSocket::open()?),
            pending: VecDeque::new(),
            completions: VecDeque::new(),
        })
    }

    /// Adapter without a socket; requests stay pending until completed
    /// explicitly.
    pub fn detached() -> Self {
        Self {
            socket: None,
            pending: VecDeque::new(),
            completions: VecDeque::new(),
        }
    }

    /// Queue an operation for `ifindex`.
    pub fn submit(&mut self, ifindex: u32, op: Op) {
        self.pending.push_back(Request { ifindex, op });
    }

    /// Execute every pending request against the kernel. No-op when
    /// detached.
    pub fn process(&mut self) {
        let Some(ref mut sock) = self.socket else {
            return;
        };

        while let Some(req) = self.pending.pop_front() {
            let result = match &req.op {
                Op::AddressConfigure(a) => sock.addr_request(
                    RTM_NEWADDR,
                    NLM_F_CREATE | NLM_F_EXCL,
                    req.ifindex,
                    a,
                    false,
                ),
                Op::AddressUpdate(a) => {
                    sock.addr_request(RTM_NEWADDR, NLM_F_REPLACE, req.ifindex, a, true)
                }
                Op::AddressDrop(a) => sock.addr_request(RTM_DELADDR, 0, req.ifindex, a, false),
                Op::RouteConfigure(r) => {
                    sock.route_request(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL, req.ifindex, r)
                }
                Op::RouteDrop(r) => sock.route_request(RTM_DELROUTE, 0, req.ifindex, r),
                Op::SetFlags { mask, value } => sock.set_flags(req.ifindex, *mask, *value),
                Op::SetMtu(mtu) => sock.set_mtu(req.ifindex, *mtu),
                Op::Enslave { master } => match master.resolve_ifindex() {
                    Some(master_ifindex) => sock.set_master(req.ifindex, master_ifindex),
                    None => Err(io::Error::from_raw_os_error(libc::ENODEV)),
                },
            };

            let errno = match result {
                Ok(()) => 0,
                Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            };
            self.completions.push_back(Completion {
                ifindex: req.ifindex,
                kind: req.op.kind(),
                errno,
            });
        }
    }

    /// Pop the next completion, oldest first.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    /// Complete the oldest pending request with the given errno. Used when
    /// detached (tests, cancellation paths).
    pub fn complete_next(&mut self, errno: i32) -> bool {
        match self.pending.pop_front() {
            Some(req) => {
                self.completions.push_back(Completion {
                    ifindex: req.ifindex,
                    kind: req.op.kind(),
                    errno,
                });
                true
            }
            None => false,
        }
    }

    /// Complete every pending request with `-ECANCELED`. Each request gets
    /// exactly one completion.
    pub fn cancel_pending(&mut self) {
        while self.complete_next(-libc::ECANCELED) {}
    }

    /// Discard pending requests for a link that is being destroyed; there
    /// is no one left to receive their completions.
    pub fn forget_link(&mut self, ifindex: u32) {
        self.pending.retain(|req| req.ifindex != ifindex);
        self.completions.retain(|c| c.ifindex != ifindex);
    }

    /// Queued, not yet executed requests (submission order).
    pub fn pending_requests(&self) -> &VecDeque<Request> {
        &self.pending
    }
}

// ---------------------------------------------------------------------------
// rtattr parsing / serialization helpers
// ---------------------------------------------------------------------------

fn parse_rtattrs(data: &[u8]) -> HashMap<u16, Vec<u8>> {
    let mut attrs = HashMap::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let rta_len = u16::from_ne_bytes(data[offset..offset + 2].try_into().unwrap()) as usize;
        let rta_type = u16::from_ne_bytes(data[offset + 2..offset + 4].try_into().unwrap());

        if rta_len < 4 || offset + rta_len > data.len() {
            break;
        }

        let base_type = rta_type & 0x3FFF;
        attrs.insert(base_type, data[offset + 4..offset + rta_len].to_vec());

        offset += rta_align(rta_len);
    }

    attrs
}

fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

fn rta_align(len: usize) -> usize {
    (len + 3) & !3
}

fn rta_aligned_len(payload_len: usize) -> usize {
    rta_align(4 + payload_len)
}

fn put_u16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
}

fn put_i32(buf: &mut [u8], offset: usize, val: i32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
}

fn put_rta_u32(buf: &mut [u8], offset: usize, rta_type: u16, val: u32) {
    put_u16(buf, offset, 8);
    put_u16(buf, offset + 2, rta_type);
    put_u32(buf, offset + 4, val);
}

fn put_rta_ipv4(buf: &mut [u8], offset: usize, rta_type: u16, addr: Ipv4Addr) {
    put_u16(buf, offset, 8);
    put_u16(buf, offset + 2, rta_type);
    buf[offset + 4..offset + 8].copy_from_slice(&addr.octets());
}

fn put_rta_bytes(buf: &mut [u8], offset: usize, rta_type: u16, data: &[u8]) {
    put_u16(buf, offset, (4 + data.len()) as u16);
    put_u16(buf, offset + 2, rta_type);
    buf[offset + 4..offset + 4 + data.len()].copy_from_slice(data);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::NetDevKind;

    #[test]
    fn test_nlmsg_align() {
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(17), 20);
    }

    #[test]
    fn test_rta_aligned_len() {
        assert_eq!(rta_aligned_len(4), 8);
        assert_eq!(rta_aligned_len(1), 8);
        assert_eq!(rta_aligned_len(16), 20);
    }

    #[test]
    fn test_put_rta_u32() {
        let mut buf = [0u8; 16];
        put_rta_u32(&mut buf, 0, IFLA_MTU, 1500);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 8);
        assert_eq!(u16::from_ne_bytes([buf[2], buf[3]]), IFLA_MTU);
        assert_eq!(u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]), 1500);
    }

    #[test]
    fn test_parse_rtattrs_truncated() {
        assert!(parse_rtattrs(&[0u8; 3]).is_empty());

        // rta_len claims more than the buffer holds.
        let mut data = [0u8; 8];
        put_u16(&mut data, 0, 100);
        put_u16(&mut data, 2, 1);
        assert!(parse_rtattrs(&data).is_empty());
    }

    #[test]
    fn test_split_messages_walks_datagram() {
        // One complete message, then a header claiming more than remains.
        let mut buf = vec![0u8; 36];
        put_u32(&mut buf, 0, 20); // nlmsg_len: header + 4 payload bytes
        put_u16(&mut buf, 4, 0x42);
        buf[16..20].copy_from_slice(&[1, 2, 3, 4]);
        put_u32(&mut buf, 20, 100); // truncated second message
        put_u16(&mut buf, 24, 0x43);

        let msgs: Vec<_> = split_messages(&buf).collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, 0x42);
        assert_eq!(msgs[0].payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_split_messages_short_buffer() {
        assert!(split_messages(&[0u8; 8]).next().is_none());
        assert!(split_messages(&[]).next().is_none());
    }

    #[test]
    fn test_split_messages_rejects_undersized_length() {
        // nlmsg_len smaller than the header itself.
        let mut buf = vec![0u8; 16];
        put_u32(&mut buf, 0, 8);
        assert!(split_messages(&buf).next().is_none());
    }

    #[test]
    fn test_ack_errno() {
        let mut payload = vec![0u8; 20];
        payload[0..4].copy_from_slice(&(-libc::EEXIST).to_ne_bytes());
        assert_eq!(ack_errno(&payload), -libc::EEXIST);

        // A bare or truncated payload counts as the ACK.
        assert_eq!(ack_errno(&[]), 0);
        assert_eq!(ack_errno(&[0, 0]), 0);
    }

    #[test]
    fn test_parse_link_message() {
        // ifinfomsg + IFLA_IFNAME("eth0\0") + IFLA_MTU(1500).
        let mut payload = vec![0u8; IFINFOMSG_LEN];
        put_i32(&mut payload, 4, 7);
        put_u32(&mut payload, 8, IFF_UP | IFF_LOWER_UP);

        let mut name_attr = vec![0u8; rta_aligned_len(5)];
        put_rta_bytes(&mut name_attr, 0, IFLA_IFNAME, b"eth0\0");
        payload.extend_from_slice(&name_attr);

        let mut mtu_attr = vec![0u8; rta_aligned_len(4)];
        put_rta_u32(&mut mtu_attr, 0, IFLA_MTU, 1500);
        payload.extend_from_slice(&mtu_attr);

        let m = parse_link_message(&payload).unwrap();
        assert_eq!(m.ifindex, 7);
        assert_eq!(m.ifname.as_deref(), Some("eth0"));
        assert_eq!(m.mtu, 1500);
        assert_eq!(m.flags, IFF_UP | IFF_LOWER_UP);
        assert!(m.mac.is_none());
    }

    #[test]
    fn test_detached_completion_order() {
        let mut rtnl = Rtnl::detached();
        rtnl.submit(3, Op::SetMtu(1400));
        rtnl.submit(
            3,
            Op::RouteConfigure(Route::default_via(Ipv4Addr::new(10, 0, 0, 1))),
        );

        assert!(rtnl.complete_next(0));
        assert!(rtnl.complete_next(-libc::EEXIST));
        assert!(!rtnl.complete_next(0));

        let first = rtnl.take_completion().unwrap();
        assert_eq!(first.kind, OpKind::SetMtu);
        assert_eq!(first.errno, 0);
        let second = rtnl.take_completion().unwrap();
        assert_eq!(second.kind, OpKind::RouteConfigure);
        assert_eq!(second.errno, -libc::EEXIST);
        assert!(rtnl.take_completion().is_none());
    }

    #[test]
    fn test_cancel_pending() {
        let mut rtnl = Rtnl::detached();
        rtnl.submit(1, Op::SetMtu(1400));
        rtnl.submit(2, Op::SetFlags {
            mask: IFF_UP,
            value: IFF_UP,
        });

        rtnl.cancel_pending();
        assert!(rtnl.pending_requests().is_empty());

        let mut count = 0;
        while let Some(c) = rtnl.take_completion() {
            assert_eq!(c.errno, -libc::ECANCELED);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_forget_link() {
        let mut rtnl = Rtnl::detached();
        rtnl.submit(1, Op::SetMtu(1400));
        rtnl.submit(2, Op::SetMtu(9000));
        rtnl.submit(1, Op::Enslave {
            master: NetDev {
                name: "br0".into(),
                kind: NetDevKind::Bridge,
            },
        });

        rtnl.forget_link(1);
        assert_eq!(rtnl.pending_requests().len(), 1);
        assert_eq!(rtnl.pending_requests()[0].ifindex, 2);
    }
}
