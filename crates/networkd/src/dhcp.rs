//! DHCPv4 client (RFC 2131).
//!
//! The client is a pure state machine: the daemon's event loop feeds it
//! received packets (`process_packet`), asks it for packets to transmit
//! (`next_packet`) and drives its timers (`tick`). State changes that the
//! owning link must react to are queued as [`DhcpEvent`]s and drained with
//! `take_event` — the link never inspects DORA internals, only the events
//! and the lease accessors.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::address::netmask_to_prefixlen;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BOOTP_REQUEST: u8 = 1;
const BOOTP_REPLY: u8 = 2;

const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;

/// Magic cookie that starts the options section (RFC 2131 §3).
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

// DHCP message types (option 53).
const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;
const DHCP_NAK: u8 = 6;
const DHCP_RELEASE: u8 = 7;

// Option codes.
const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_HOSTNAME: u8 = 12;
/// Interface MTU (requested when the profile sets UseMTU).
pub const OPT_INTERFACE_MTU: u8 = 26;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_RENEWAL_TIME: u8 = 58;
const OPT_REBINDING_TIME: u8 = 59;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 255;

// BOOTP fixed header + magic cookie.
const MIN_PACKET_SIZE: usize = 240;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened inside the client, reported to the owning link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpEvent {
    /// A lease was obtained for the first time.
    IpAcquire,
    /// The lease ran out without renewal.
    Expired,
    /// The client was stopped while it held a lease.
    Stop,
    /// A renewal produced a different address.
    IpChange,
    /// The server declined us (NAK); the client keeps retrying.
    NoLease,
    /// Client-internal error, carrying a negative errno.
    Error(i32),
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A successfully obtained DHCPv4 lease.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Assigned IPv4 address.
    pub address: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
    /// Default gateway, when offered.
    pub router: Option<Ipv4Addr>,
    /// DNS servers, when offered.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Interface MTU (option 26), when offered.
    pub mtu: Option<u16>,
    /// Hostname (option 12), when offered.
    pub hostname: Option<String>,
    /// The offering server.
    pub server_id: Ipv4Addr,
    /// Lease duration in seconds.
    pub lease_time: u32,
    /// T1 in seconds (default lease_time / 2).
    pub renewal_time: u32,
    /// T2 in seconds (default lease_time * 7/8).
    pub rebinding_time: u32,
    /// When the lease was obtained (monotonic).
    pub obtained_at: Instant,
}

impl Lease {
    /// Prefix length derived from the netmask.
    pub fn prefixlen(&self) -> u8 {
        netmask_to_prefixlen(self.netmask)
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_time)).saturating_sub(self.obtained_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    pub fn needs_renewal(&self) -> bool {
        self.obtained_at.elapsed() >= Duration::from_secs(u64::from(self.renewal_time))
    }

    pub fn needs_rebinding(&self) -> bool {
        self.obtained_at.elapsed() >= Duration::from_secs(u64::from(self.rebinding_time))
    }

    /// Serialize the lease to its state file (key=value lines).
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut content = String::new();
        content.push_str("# This is private data. Do not parse.\n");
        content.push_str(&format!("ADDRESS={}\n", self.address));
        content.push_str(&format!("NETMASK={}\n", self.netmask));
        if let Some(router) = self.router {
            content.push_str(&format!("ROUTER={router}\n"));
        }
        content.push_str(&format!("SERVER_ADDRESS={}\n", self.server_id));
        content.push_str(&format!("LIFETIME={}\n", self.lease_time));
        content.push_str(&format!("T1={}\n", self.renewal_time));
        content.push_str(&format!("T2={}\n", self.rebinding_time));
        for dns in &self.dns_servers {
            content.push_str(&format!("DNS={dns}\n"));
        }
        if let Some(mtu) = self.mtu {
            content.push_str(&format!("MTU={mtu}\n"));
        }
        if let Some(ref hostname) = self.hostname {
            content.push_str(&format!("HOSTNAME={hostname}\n"));
        }

        fs::write(path, content)
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefixlen())?;
        if let Some(router) = self.router {
            write!(f, " via {router}")?;
        }
        write!(f, " lease {}s from {}", self.lease_time, self.server_id)
    }
}

// ---------------------------------------------------------------------------
// Client state machine
// ---------------------------------------------------------------------------

/// DORA progress of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    /// Not running.
    Stopped,
    /// DISCOVER sent, waiting for an OFFER.
    Selecting,
    /// REQUEST sent after an OFFER, waiting for the ACK.
    Requesting,
    /// Lease held.
    Bound,
    /// T1 reached, renewing with the leasing server.
    Renewing,
    /// T2 reached, rebinding with any server.
    Rebinding,
}

impl fmt::Display for DhcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Selecting => write!(f, "SELECTING"),
            Self::Requesting => write!(f, "REQUESTING"),
            Self::Bound => write!(f, "BOUND"),
            Self::Renewing => write!(f, "RENEWING"),
            Self::Rebinding => write!(f, "REBINDING"),
        }
    }
}

/// The DHCPv4 client handle owned by one link.
pub struct DhcpClient {
    ifindex: u32,
    mac: Option<[u8; 6]>,
    hostname: Option<String>,
    request_options: Vec<u8>,

    state: DhcpState,
    xid: u32,
    lease: Option<Lease>,
    /// Offered address and server id, between OFFER and ACK.
    offer: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
    attempts: u32,
    last_send: Option<Instant>,

    events: VecDeque<DhcpEvent>,
}

impl DhcpClient {
    pub fn new() -> Self {
        Self {
            ifindex: 0,
            mac: None,
            hostname: None,
            request_options: vec![
                OPT_SUBNET_MASK,
                OPT_ROUTER,
                OPT_DNS,
                OPT_HOSTNAME,
                OPT_LEASE_TIME,
                OPT_RENEWAL_TIME,
                OPT_REBINDING_TIME,
            ],
            state: DhcpState::Stopped,
            xid: 0,
            lease: None,
            offer: None,
            attempts: 0,
            last_send: None,
            events: VecDeque::new(),
        }
    }

    pub fn set_index(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    pub fn set_mac(&mut self, mac: [u8; 6]) {
        self.mac = Some(mac);
    }

    pub fn set_hostname(&mut self, hostname: Option<String>) {
        self.hostname = hostname;
    }

    /// Add an option code to the parameter request list.
    pub fn set_request_option(&mut self, code: u8) {
        if !self.request_options.contains(&code) {
            self.request_options.push(code);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state != DhcpState::Stopped
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub fn get_lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Pop the oldest queued event.
    pub fn take_event(&mut self) -> Option<DhcpEvent> {
        self.events.pop_front()
    }

    /// Begin lease acquisition. The interface index and MAC must be set.
    pub fn start(&mut self) -> io::Result<()> {
        let Some(mac) = self.mac else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DHCP client has no MAC address",
            ));
        };
        if self.ifindex == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DHCP client has no interface index",
            ));
        }
        if self.is_running() {
            return Ok(());
        }

        self.xid = make_xid(mac, self.ifindex);
        self.state = DhcpState::Selecting;
        self.attempts = 0;
        self.last_send = None;
        Ok(())
    }

    /// Stop the client. A held lease is reported as [`DhcpEvent::Stop`]
    /// before being dropped.
    pub fn stop(&mut self) {
        if matches!(
            self.state,
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding
        ) {
            self.events.push_back(DhcpEvent::Stop);
        }
        self.state = DhcpState::Stopped;
        self.lease = None;
        self.offer = None;
        self.attempts = 0;
        self.last_send = None;
    }

    /// Exponential retransmission backoff, capped at 64 seconds.
    fn retransmit_timeout(&self) -> Duration {
        let secs = (4u64 << self.attempts.min(4)).min(64);
        Duration::from_secs(secs)
    }

    /// The next packet to transmit, if any is due at `now`.
    pub fn next_packet(&mut self, now: Instant) -> Option<DhcpPacket> {
        let mac = self.mac?;

        let due = match self.last_send {
            Some(last) => now.duration_since(last) >= self.retransmit_timeout(),
            None => true,
        };
        if !due {
            return None;
        }

        let pkt = match self.state {
            DhcpState::Stopped | DhcpState::Bound => return None,
            DhcpState::Selecting => {
                DhcpPacket::discover(self.xid, &mac, self.hostname.as_deref(), &self.request_options)
            }
            DhcpState::Requesting => {
                let (offered, server_id) = self.offer?;
                DhcpPacket::request(
                    self.xid,
                    &mac,
                    offered,
                    server_id,
                    Ipv4Addr::UNSPECIFIED,
                    self.hostname.as_deref(),
                    &self.request_options,
                )
            }
            DhcpState::Renewing | DhcpState::Rebinding => {
                let lease = self.lease.as_ref()?;
                DhcpPacket::request(
                    self.xid,
                    &mac,
                    lease.address,
                    None,
                    lease.address,
                    self.hostname.as_deref(),
                    &self.request_options,
                )
            }
        };

        self.last_send = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        Some(pkt)
    }

    /// Feed a received packet into the machine.
    pub fn process_packet(&mut self, pkt: &DhcpPacket) {
        if pkt.op != BOOTP_REPLY || pkt.xid != self.xid {
            return;
        }

        match (pkt.message_type(), self.state) {
            (Some(DHCP_OFFER), DhcpState::Selecting) => {
                self.offer = Some((pkt.yiaddr, pkt.server_id()));
                self.state = DhcpState::Requesting;
                self.attempts = 0;
                self.last_send = None;
            }
            (
                Some(DHCP_ACK),
                DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding,
            ) => match pkt.to_lease() {
                Ok(lease) => self.bind_lease(lease),
                Err(e) => {
                    log::warn!("DHCP ACK without usable lease: {e}");
                    self.events.push_back(DhcpEvent::Error(-libc::EINVAL));
                }
            },
            (
                Some(DHCP_NAK),
                DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding,
            ) => {
                self.events.push_back(DhcpEvent::NoLease);
                self.state = DhcpState::Selecting;
                self.offer = None;
                self.lease = None;
                self.attempts = 0;
                self.last_send = None;
            }
            _ => {}
        }
    }

    /// Store a lease and queue the matching event.
    pub(crate) fn bind_lease(&mut self, lease: Lease) {
        let event = match self.lease {
            None => DhcpEvent::IpAcquire,
            Some(ref old) if old.address != lease.address => DhcpEvent::IpChange,
            Some(_) => {
                // Same address renewed, only the timers move.
                self.lease = Some(lease);
                self.state = DhcpState::Bound;
                self.offer = None;
                return;
            }
        };
        self.lease = Some(lease);
        self.state = DhcpState::Bound;
        self.offer = None;
        self.attempts = 0;
        self.last_send = None;
        self.events.push_back(event);
    }

    /// Queue an event directly; used by the machinery around the client.
    pub(crate) fn push_event(&mut self, event: DhcpEvent) {
        self.events.push_back(event);
    }

    /// Advance lease timers.
    pub fn tick(&mut self, _now: Instant) {
        match self.state {
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding => {}
            _ => return,
        }
        let (expired, needs_rebinding, needs_renewal) = match self.lease {
            Some(ref lease) => (
                lease.is_expired(),
                lease.needs_rebinding(),
                lease.needs_renewal(),
            ),
            None => return,
        };

        if expired {
            self.lease = None;
            self.state = DhcpState::Selecting;
            self.attempts = 0;
            self.last_send = None;
            self.events.push_back(DhcpEvent::Expired);
        } else if needs_rebinding && self.state != DhcpState::Rebinding {
            self.state = DhcpState::Rebinding;
            self.last_send = None;
        } else if needs_renewal && self.state == DhcpState::Bound {
            self.state = DhcpState::Renewing;
            self.last_send = None;
        }
    }

    /// RELEASE packet for a clean shutdown, if a lease is held.
    pub fn build_release(&self) -> Option<DhcpPacket> {
        let lease = self.lease.as_ref()?;
        let mac = self.mac?;
        Some(DhcpPacket::release(
            self.xid,
            &mac,
            lease.address,
            lease.server_id,
        ))
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DhcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhcpClient")
            .field("ifindex", &self.ifindex)
            .field("state", &self.state)
            .field("xid", &format_args!("{:#010x}", self.xid))
            .field("lease", &self.lease)
            .finish()
    }
}

/// Transaction id from the MAC, interface index and clock; not a secret,
/// only a correlator.
fn make_xid(mac: [u8; 6], ifindex: u32) -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mac_fold = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    mac_fold ^ ifindex.rotate_left(16) ^ nanos
}

// ---------------------------------------------------------------------------
// Packet codec
// ---------------------------------------------------------------------------

/// A single DHCP option (type-length-value).
#[derive(Debug, Clone)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

/// Raw DHCP packet.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    fn new_request(xid: u32, mac: &[u8; 6]) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(mac);
        Self {
            op: BOOTP_REQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Vec::new(),
        }
    }

    fn push_common_options(&mut self, mac: &[u8; 6], hostname: Option<&str>, params: &[u8]) {
        let mut client_id = vec![HTYPE_ETHERNET];
        client_id.extend_from_slice(mac);
        self.options.push(DhcpOption {
            code: OPT_CLIENT_ID,
            data: client_id,
        });

        if let Some(hostname) = hostname {
            self.options.push(DhcpOption {
                code: OPT_HOSTNAME,
                data: hostname.as_bytes().to_vec(),
            });
        }

        if !params.is_empty() {
            self.options.push(DhcpOption {
                code: OPT_PARAMETER_LIST,
                data: params.to_vec(),
            });
        }
    }

    /// Build a DHCPDISCOVER.
    pub fn discover(xid: u32, mac: &[u8; 6], hostname: Option<&str>, params: &[u8]) -> Self {
        let mut pkt = Self::new_request(xid, mac);
        pkt.options.push(DhcpOption {
            code: OPT_MESSAGE_TYPE,
            data: vec![DHCP_DISCOVER],
        });
        pkt.push_common_options(mac, hostname, params);
        pkt
    }

    /// Build a DHCPREQUEST. `ciaddr` is the held address during renewal,
    /// unspecified while selecting.
    pub fn request(
        xid: u32,
        mac: &[u8; 6],
        requested: Ipv4Addr,
        server_id: Option<Ipv4Addr>,
        ciaddr: Ipv4Addr,
        hostname: Option<&str>,
        params: &[u8],
    ) -> Self {
        let mut pkt = Self::new_request(xid, mac);
        pkt.ciaddr = ciaddr;
        pkt.options.push(DhcpOption {
            code: OPT_MESSAGE_TYPE,
            data: vec![DHCP_REQUEST],
        });
        if ciaddr == Ipv4Addr::UNSPECIFIED {
            pkt.options.push(DhcpOption {
                code: OPT_REQUESTED_IP,
                data: requested.octets().to_vec(),
            });
        }
        if let Some(sid) = server_id {
            pkt.options.push(DhcpOption {
                code: OPT_SERVER_ID,
                data: sid.octets().to_vec(),
            });
        }
        pkt.push_common_options(mac, hostname, params);
        pkt
    }

    /// Build a DHCPRELEASE.
    pub fn release(xid: u32, mac: &[u8; 6], client_ip: Ipv4Addr, server_id: Ipv4Addr) -> Self {
        let mut pkt = Self::new_request(xid, mac);
        pkt.ciaddr = client_ip;
        pkt.options.push(DhcpOption {
            code: OPT_MESSAGE_TYPE,
            data: vec![DHCP_RELEASE],
        });
        pkt.options.push(DhcpOption {
            code: OPT_SERVER_ID,
            data: server_id.octets().to_vec(),
        });
        let mut client_id = vec![HTYPE_ETHERNET];
        client_id.extend_from_slice(mac);
        pkt.options.push(DhcpOption {
            code: OPT_CLIENT_ID,
            data: client_id,
        });
        pkt
    }

    pub fn message_type(&self) -> Option<u8> {
        self.options.iter().find_map(|opt| {
            if opt.code == OPT_MESSAGE_TYPE && !opt.data.is_empty() {
                Some(opt.data[0])
            } else {
                None
            }
        })
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.option_ipv4(OPT_SERVER_ID)
    }

    fn option_ipv4(&self, code: u8) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| {
            if opt.code == code && opt.data.len() == 4 {
                Some(Ipv4Addr::new(
                    opt.data[0],
                    opt.data[1],
                    opt.data[2],
                    opt.data[3],
                ))
            } else {
                None
            }
        })
    }

    fn option_ipv4_list(&self, code: u8) -> Vec<Ipv4Addr> {
        let mut addrs = Vec::new();
        for opt in &self.options {
            if opt.code == code && opt.data.len() >= 4 && opt.data.len() % 4 == 0 {
                for chunk in opt.data.chunks_exact(4) {
                    addrs.push(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]));
                }
            }
        }
        addrs
    }

    fn option_u32(&self, code: u8) -> Option<u32> {
        self.options.iter().find_map(|opt| {
            if opt.code == code && opt.data.len() == 4 {
                Some(u32::from_be_bytes([
                    opt.data[0],
                    opt.data[1],
                    opt.data[2],
                    opt.data[3],
                ]))
            } else {
                None
            }
        })
    }

    fn option_string(&self, code: u8) -> Option<String> {
        self.options.iter().find_map(|opt| {
            if opt.code == code && !opt.data.is_empty() {
                Some(String::from_utf8_lossy(&opt.data).to_string())
            } else {
                None
            }
        })
    }

    /// Extract a [`Lease`] from an ACK.
    pub fn to_lease(&self) -> Result<Lease, String> {
        if self.message_type() != Some(DHCP_ACK) {
            return Err("not a DHCPACK".to_string());
        }
        if self.yiaddr == Ipv4Addr::UNSPECIFIED {
            return Err("ACK has no yiaddr".to_string());
        }

        let lease_time = self.option_u32(OPT_LEASE_TIME).unwrap_or(3600);

        let mtu = self.options.iter().find_map(|opt| {
            if opt.code == OPT_INTERFACE_MTU && opt.data.len() == 2 {
                Some(u16::from_be_bytes([opt.data[0], opt.data[1]]))
            } else {
                None
            }
        });

        Ok(Lease {
            address: self.yiaddr,
            netmask: self
                .option_ipv4(OPT_SUBNET_MASK)
                .unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            router: self.option_ipv4_list(OPT_ROUTER).first().copied(),
            dns_servers: self.option_ipv4_list(OPT_DNS),
            mtu,
            hostname: self.option_string(OPT_HOSTNAME),
            server_id: self.server_id().unwrap_or(self.siaddr),
            lease_time,
            renewal_time: self.option_u32(OPT_RENEWAL_TIME).unwrap_or(lease_time / 2),
            rebinding_time: self
                .option_u32(OPT_REBINDING_TIME)
                .unwrap_or(lease_time / 8 * 7),
            obtained_at: Instant::now(),
        })
    }

    /// Serialize to wire format, padded to the BOOTP minimum.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(576);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&[0u8; 64]); // sname
        buf.extend_from_slice(&[0u8; 128]); // file
        buf.extend_from_slice(&MAGIC_COOKIE);

        for opt in &self.options {
            buf.push(opt.code);
            if opt.code == OPT_PAD || opt.code == OPT_END {
                continue;
            }
            buf.push(opt.data.len() as u8);
            buf.extend_from_slice(&opt.data);
        }
        buf.push(OPT_END);

        while buf.len() < 300 {
            buf.push(0);
        }
        buf
    }

    /// Parse from wire format.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(format!(
                "packet too short: {} < {MIN_PACKET_SIZE} bytes",
                data.len()
            ));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err("invalid magic cookie".to_string());
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            options: parse_options(&data[240..])?,
        })
    }
}

fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>, String> {
    let mut options = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        match code {
            OPT_PAD => {
                i += 1;
            }
            OPT_END => break,
            _ => {
                i += 1;
                if i >= data.len() {
                    break;
                }
                let len = data[i] as usize;
                i += 1;
                if i + len > data.len() {
                    return Err(format!("option {code} truncated at offset {i}"));
                }
                options.push(DhcpOption {
                    code,
                    data: data[i..i + len].to_vec(),
                });
                i += len;
            }
        }
    }
    Ok(options)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn ack_packet(xid: u32, address: Ipv4Addr) -> DhcpPacket {
        let mut pkt = DhcpPacket::new_request(xid, &MAC);
        pkt.op = BOOTP_REPLY;
        pkt.yiaddr = address;
        pkt.options = vec![
            DhcpOption {
                code: OPT_MESSAGE_TYPE,
                data: vec![DHCP_ACK],
            },
            DhcpOption {
                code: OPT_SUBNET_MASK,
                data: vec![255, 255, 255, 0],
            },
            DhcpOption {
                code: OPT_ROUTER,
                data: vec![192, 168, 1, 1],
            },
            DhcpOption {
                code: OPT_DNS,
                data: vec![192, 168, 1, 1, 8, 8, 8, 8],
            },
            DhcpOption {
                code: OPT_INTERFACE_MTU,
                data: 1400u16.to_be_bytes().to_vec(),
            },
            DhcpOption {
                code: OPT_SERVER_ID,
                data: vec![192, 168, 1, 1],
            },
            DhcpOption {
                code: OPT_LEASE_TIME,
                data: 3600u32.to_be_bytes().to_vec(),
            },
        ];
        pkt
    }

    fn offer_packet(xid: u32, address: Ipv4Addr) -> DhcpPacket {
        let mut pkt = DhcpPacket::new_request(xid, &MAC);
        pkt.op = BOOTP_REPLY;
        pkt.yiaddr = address;
        pkt.options = vec![
            DhcpOption {
                code: OPT_MESSAGE_TYPE,
                data: vec![DHCP_OFFER],
            },
            DhcpOption {
                code: OPT_SERVER_ID,
                data: vec![192, 168, 1, 1],
            },
        ];
        pkt
    }

    fn started_client() -> DhcpClient {
        let mut client = DhcpClient::new();
        client.set_index(2);
        client.set_mac(MAC);
        client.start().unwrap();
        client
    }

    #[test]
    fn test_start_requires_index_and_mac() {
        let mut client = DhcpClient::new();
        assert!(client.start().is_err());
        client.set_index(2);
        assert!(client.start().is_err());
        client.set_mac(MAC);
        assert!(client.start().is_ok());
        assert!(client.is_running());
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let pkt = DhcpPacket::discover(0x12345678, &MAC, Some("host-1"), &[1, 3, 6]);
        let bytes = pkt.serialize();
        assert!(bytes.len() >= 300);

        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.op, BOOTP_REQUEST);
        assert_eq!(parsed.xid, 0x12345678);
        assert_eq!(parsed.message_type(), Some(DHCP_DISCOVER));
        assert_eq!(parsed.option_string(OPT_HOSTNAME).as_deref(), Some("host-1"));
        assert_eq!(&parsed.chaddr[..6], &MAC);
    }

    #[test]
    fn test_parse_rejects_bad_cookie() {
        let mut bytes = DhcpPacket::discover(1, &MAC, None, &[]).serialize();
        bytes[236] = 0;
        assert!(DhcpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_dora_acquire() {
        let mut client = started_client();
        let now = Instant::now();

        let discover = client.next_packet(now).unwrap();
        assert_eq!(discover.message_type(), Some(DHCP_DISCOVER));

        client.process_packet(&offer_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(client.state(), DhcpState::Requesting);

        let request = client.next_packet(now).unwrap();
        assert_eq!(request.message_type(), Some(DHCP_REQUEST));

        client.process_packet(&ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(client.state(), DhcpState::Bound);
        assert_eq!(client.take_event(), Some(DhcpEvent::IpAcquire));
        assert_eq!(client.take_event(), None);

        let lease = client.get_lease().unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(lease.prefixlen(), 24);
        assert_eq!(lease.router, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(lease.mtu, Some(1400));
        assert_eq!(lease.dns_servers.len(), 2);
    }

    #[test]
    fn test_foreign_xid_ignored() {
        let mut client = started_client();
        client.process_packet(&offer_packet(
            client.xid.wrapping_add(1),
            Ipv4Addr::new(192, 168, 1, 50),
        ));
        assert_eq!(client.state(), DhcpState::Selecting);
    }

    #[test]
    fn test_nak_reports_no_lease() {
        let mut client = started_client();
        client.process_packet(&offer_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50)));

        let mut nak = DhcpPacket::new_request(client.xid, &MAC);
        nak.op = BOOTP_REPLY;
        nak.options = vec![DhcpOption {
            code: OPT_MESSAGE_TYPE,
            data: vec![DHCP_NAK],
        }];
        client.process_packet(&nak);

        assert_eq!(client.take_event(), Some(DhcpEvent::NoLease));
        assert_eq!(client.state(), DhcpState::Selecting);
        assert!(client.get_lease().is_none());
    }

    #[test]
    fn test_renewal_with_new_address_is_ip_change() {
        let mut client = started_client();
        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
                .to_lease()
                .unwrap(),
        );
        assert_eq!(client.take_event(), Some(DhcpEvent::IpAcquire));

        // Server hands out a different address on renewal.
        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 99))
                .to_lease()
                .unwrap(),
        );
        assert_eq!(client.take_event(), Some(DhcpEvent::IpChange));
        assert_eq!(
            client.get_lease().unwrap().address,
            Ipv4Addr::new(192, 168, 1, 99)
        );
    }

    #[test]
    fn test_renewal_with_same_address_is_silent() {
        let mut client = started_client();
        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
                .to_lease()
                .unwrap(),
        );
        assert_eq!(client.take_event(), Some(DhcpEvent::IpAcquire));

        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
                .to_lease()
                .unwrap(),
        );
        assert_eq!(client.take_event(), None);
    }

    #[test]
    fn test_stop_with_lease_reports_stop() {
        let mut client = started_client();
        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
                .to_lease()
                .unwrap(),
        );
        client.take_event();

        client.stop();
        assert_eq!(client.take_event(), Some(DhcpEvent::Stop));
        assert!(!client.is_running());
        assert!(client.get_lease().is_none());
    }

    #[test]
    fn test_stop_without_lease_is_silent() {
        let mut client = started_client();
        client.stop();
        assert_eq!(client.take_event(), None);
    }

    #[test]
    fn test_tick_expires_lease() {
        let mut client = started_client();
        let mut lease = ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
            .to_lease()
            .unwrap();
        lease.lease_time = 0;
        client.bind_lease(lease);
        client.take_event();

        client.tick(Instant::now());
        assert_eq!(client.take_event(), Some(DhcpEvent::Expired));
        assert!(client.get_lease().is_none());
        // Still running: acquisition restarts.
        assert_eq!(client.state(), DhcpState::Selecting);
    }

    #[test]
    fn test_request_option_dedup() {
        let mut client = DhcpClient::new();
        let before = client.request_options.len();
        client.set_request_option(OPT_INTERFACE_MTU);
        client.set_request_option(OPT_INTERFACE_MTU);
        assert_eq!(client.request_options.len(), before + 1);
    }

    #[test]
    fn test_requested_mtu_option_on_wire() {
        let mut client = started_client();
        client.set_request_option(OPT_INTERFACE_MTU);
        let discover = client.next_packet(Instant::now()).unwrap();
        let params = discover
            .options
            .iter()
            .find(|o| o.code == OPT_PARAMETER_LIST)
            .unwrap();
        assert!(params.data.contains(&OPT_INTERFACE_MTU));
    }

    #[test]
    fn test_lease_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases").join("2");

        let lease = ack_packet(1, Ipv4Addr::new(192, 168, 1, 50))
            .to_lease()
            .unwrap();
        lease.save(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("ADDRESS=192.168.1.50\n"));
        assert!(content.contains("NETMASK=255.255.255.0\n"));
        assert!(content.contains("ROUTER=192.168.1.1\n"));
        assert!(content.contains("MTU=1400\n"));
    }

    #[test]
    fn test_build_release() {
        let mut client = started_client();
        assert!(client.build_release().is_none());

        client.bind_lease(
            ack_packet(client.xid, Ipv4Addr::new(192, 168, 1, 50))
                .to_lease()
                .unwrap(),
        );
        let release = client.build_release().unwrap();
        assert_eq!(release.message_type(), Some(DHCP_RELEASE));
        assert_eq!(release.ciaddr, Ipv4Addr::new(192, 168, 1, 50));
    }
}
