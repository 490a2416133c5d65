//! IPv4 link-local address autoconfiguration (RFC 3927).
//!
//! Like the DHCP client this is a pure machine: `tick` returns ARP frames
//! the event loop must transmit, `process_frame` feeds received ARP traffic
//! back in, and the owning link drains [`Ipv4llEvent`]s. Candidates are
//! drawn from 169.254.1.0–169.254.254.255 with a seeded generator so an
//! interface prefers the same address across restarts.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Number of ARP probes before claiming an address.
const PROBE_NUM: u32 = 3;
/// Delay between probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Announcements sent after claiming.
const ANNOUNCE_NUM: u32 = 2;
/// Delay between announcements.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
/// After this many conflicts, back off before probing again.
const MAX_CONFLICTS: u32 = 10;
/// Back-off delay once conflict-limited.
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(60);

/// First claimable address, 169.254.1.0.
const RANGE_BASE: u32 = 0xA9FE0100;
/// Claimable addresses: 169.254.1.0 ..= 169.254.254.255.
const RANGE_SIZE: u32 = 254 * 256;

const ETH_P_ARP: u16 = 0x0806;
const ARP_REQUEST: u16 = 1;
/// Ethernet header (14) + ARP payload (28).
const ARP_FRAME_LEN: usize = 42;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened inside the client, reported to the owning link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4llEvent {
    /// A link-local address was successfully claimed.
    Bind,
    /// The client was stopped while it held an address.
    Stop,
    /// Another host claimed or defended our address.
    Conflict,
    /// Client-internal error, carrying a negative errno.
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ipv4llState {
    Stopped,
    Probing,
    Announcing,
    Running,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The IPv4LL client handle owned by one link.
#[derive(Debug)]
pub struct Ipv4llClient {
    ifindex: u32,
    mac: Option<[u8; 6]>,
    seed: u64,
    rng: u64,

    state: Ipv4llState,
    candidate: Option<Ipv4Addr>,
    probes_sent: u32,
    announces_sent: u32,
    next_action: Option<Instant>,
    conflicts: u32,

    events: VecDeque<Ipv4llEvent>,
}

impl Ipv4llClient {
    pub fn new() -> Self {
        Self {
            ifindex: 0,
            mac: None,
            seed: 0,
            rng: 0,
            state: Ipv4llState::Stopped,
            candidate: None,
            probes_sent: 0,
            announces_sent: 0,
            next_action: None,
            conflicts: 0,
            events: VecDeque::new(),
        }
    }

    pub fn set_index(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    pub fn set_mac(&mut self, mac: [u8; 6]) {
        self.mac = Some(mac);
    }

    /// Stable per-device seed; the same seed prefers the same address.
    pub fn set_address_seed(&mut self, seed: [u8; 8]) {
        self.seed = u64::from_be_bytes(seed);
    }

    pub fn is_running(&self) -> bool {
        self.state != Ipv4llState::Stopped
    }

    /// The claimed address. Present once [`Ipv4llEvent::Bind`] was emitted.
    pub fn address(&self) -> Option<Ipv4Addr> {
        match self.state {
            Ipv4llState::Announcing | Ipv4llState::Running => self.candidate,
            _ => None,
        }
    }

    /// Pop the oldest queued event.
    pub fn take_event(&mut self) -> Option<Ipv4llEvent> {
        self.events.pop_front()
    }

    /// Begin probing for an address. Interface index and MAC must be set.
    pub fn start(&mut self) -> io::Result<()> {
        if self.ifindex == 0 || self.mac.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "IPv4LL client has no interface index or MAC",
            ));
        }
        if self.is_running() {
            return Ok(());
        }

        self.rng = self.initial_rng();
        self.candidate = Some(self.pick_candidate());
        self.state = Ipv4llState::Probing;
        self.probes_sent = 0;
        self.announces_sent = 0;
        self.next_action = None;
        Ok(())
    }

    /// Stop the client. A claimed address is reported as
    /// [`Ipv4llEvent::Stop`] before being forgotten.
    pub fn stop(&mut self) {
        if self.address().is_some() {
            self.events.push_back(Ipv4llEvent::Stop);
        }
        self.state = Ipv4llState::Stopped;
        self.candidate = None;
        self.next_action = None;
    }

    fn initial_rng(&self) -> u64 {
        let mut state = self.seed;
        if state == 0 {
            // No enumerator seed; fall back to the MAC.
            let mac = self.mac.unwrap_or_default();
            let mut bytes = [0u8; 8];
            bytes[2..8].copy_from_slice(&mac);
            state = u64::from_be_bytes(bytes) ^ u64::from(self.ifindex);
        }
        if state == 0 { 0x9E3779B97F4A7C15 } else { state }
    }

    /// xorshift64* draw.
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn pick_candidate(&mut self) -> Ipv4Addr {
        let offset = (self.next_random() % u64::from(RANGE_SIZE)) as u32;
        Ipv4Addr::from(RANGE_BASE + offset)
    }

    /// Drive timers; returns an ARP frame to transmit when one is due.
    pub fn tick(&mut self, now: Instant) -> Option<Vec<u8>> {
        if let Some(due) = self.next_action
            && now < due
        {
            return None;
        }

        let mac = self.mac?;
        let candidate = self.candidate?;

        match self.state {
            Ipv4llState::Stopped | Ipv4llState::Running => None,
            Ipv4llState::Probing => {
                if self.probes_sent < PROBE_NUM {
                    self.probes_sent += 1;
                    self.next_action = Some(now + PROBE_INTERVAL);
                    Some(build_probe(mac, candidate))
                } else {
                    // Nobody objected; claim the address and announce it.
                    self.state = Ipv4llState::Announcing;
                    self.announces_sent = 1;
                    self.next_action = Some(now + ANNOUNCE_INTERVAL);
                    log::debug!("IPv4LL claimed {candidate}");
                    self.events.push_back(Ipv4llEvent::Bind);
                    Some(build_announce(mac, candidate))
                }
            }
            Ipv4llState::Announcing => {
                if self.announces_sent < ANNOUNCE_NUM {
                    self.announces_sent += 1;
                    self.next_action = Some(now + ANNOUNCE_INTERVAL);
                    Some(build_announce(mac, candidate))
                } else {
                    self.state = Ipv4llState::Running;
                    self.next_action = None;
                    None
                }
            }
        }
    }

    /// Feed a received ARP frame into the machine.
    pub fn process_frame(&mut self, frame: &[u8], now: Instant) {
        let Some(arp) = ArpPacket::parse(frame) else {
            return;
        };
        let Some(candidate) = self.candidate else {
            return;
        };
        let mac = self.mac.unwrap_or_default();
        if arp.sender_mac == mac {
            return;
        }

        // RFC 3927 §2.5: a conflict is someone else using the address, or
        // another host probing for it while we still probe ourselves.
        let defended = arp.sender_ip == candidate;
        let competing_probe = self.state == Ipv4llState::Probing
            && arp.target_ip == candidate
            && arp.sender_ip == Ipv4Addr::UNSPECIFIED;

        if !defended && !competing_probe {
            return;
        }

        log::debug!("IPv4LL conflict for {candidate}");
        self.events.push_back(Ipv4llEvent::Conflict);
        self.conflicts += 1;

        self.candidate = Some(self.pick_candidate());
        self.state = Ipv4llState::Probing;
        self.probes_sent = 0;
        self.announces_sent = 0;
        self.next_action = if self.conflicts >= MAX_CONFLICTS {
            Some(now + RATE_LIMIT_INTERVAL)
        } else {
            None
        };
    }
}

impl Default for Ipv4llClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ARP frame codec
// ---------------------------------------------------------------------------

/// The fields of an Ethernet ARP packet we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse a full Ethernet frame carrying IPv4-over-Ethernet ARP.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ARP_FRAME_LEN {
            return None;
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_ARP {
            return None;
        }
        let arp = &frame[14..];
        let htype = u16::from_be_bytes([arp[0], arp[1]]);
        let ptype = u16::from_be_bytes([arp[2], arp[3]]);
        if htype != 1 || ptype != 0x0800 || arp[4] != 6 || arp[5] != 4 {
            return None;
        }

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&arp[8..14]);
        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&arp[18..24]);

        Some(Self {
            op: u16::from_be_bytes([arp[6], arp[7]]),
            sender_mac,
            sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_mac,
            target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        })
    }
}

fn build_arp_frame(src_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ARP_FRAME_LEN);

    // Ethernet header: broadcast destination.
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETH_P_ARP.to_be_bytes());

    // ARP payload.
    frame.extend_from_slice(&1u16.to_be_bytes()); // htype: Ethernet
    frame.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype: IPv4
    frame.push(6); // hlen
    frame.push(4); // plen
    frame.extend_from_slice(&ARP_REQUEST.to_be_bytes());
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&sender_ip.octets());
    frame.extend_from_slice(&[0u8; 6]); // target MAC unknown
    frame.extend_from_slice(&target_ip.octets());

    frame
}

/// ARP probe: sender IP zero, asking who holds `candidate`.
fn build_probe(src_mac: [u8; 6], candidate: Ipv4Addr) -> Vec<u8> {
    build_arp_frame(src_mac, Ipv4Addr::UNSPECIFIED, candidate)
}

/// Gratuitous ARP announcement for a claimed address.
fn build_announce(src_mac: [u8; 6], candidate: Ipv4Addr) -> Vec<u8> {
    build_arp_frame(src_mac, candidate, candidate)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A gratuitous announcement from another host, for conflict tests.
    pub fn announce_frame(mac: [u8; 6], addr: Ipv4Addr) -> Vec<u8> {
        build_announce(mac, addr)
    }
}
