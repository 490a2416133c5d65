#![allow(dead_code)]

//! networkd — network link configuration daemon.
//!
//! Drives every kernel interface through a per-link state machine based on
//! `.network` profiles:
//! - enslavement to bridge/bond/vlan/macvlan parents
//! - link activation and static IPv4 addresses and routes
//! - DHCPv4 client with MTU/hostname/DNS side effects
//! - IPv4 link-local autoconfiguration (RFC 3927), arbitrated against DHCP
//! - per-link state files in `/run/systemd/network/links/`
//! - sd_notify protocol (READY/WATCHDOG/STATUS/STOPPING)
//! - SIGTERM/SIGINT shutdown, SIGHUP profile reload
//!
//! Usage:
//!   networkd              # Run as daemon
//!   networkd --help       # Show help

mod address;
mod config;
mod dhcp;
mod hostname;
mod ipv4ll;
mod link;
mod manager;
mod netdev;
mod resolv;
mod route;
mod rtnl;
mod udev;

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use manager::Manager;
use rtnl::{LinkEvent, NetlinkSocket, Rtnl};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

// ---------------------------------------------------------------------------
// Service-manager notifications
// ---------------------------------------------------------------------------

/// The keepalive interval for a configured watchdog period: kick at half
/// the period so one lost datagram does not trip it.
fn watchdog_from_usec(value: &str) -> Option<Duration> {
    let usec: u64 = value.parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2))
}

/// sd_notify endpoint plus watchdog pacing, resolved once at startup. A
/// missing endpoint turns every call into a no-op, so the daemon behaves
/// the same with and without a service manager.
struct Notifier {
    address: Option<String>,
    watchdog: Option<Duration>,
    last_watchdog: Instant,
}

impl Notifier {
    fn from_env() -> Self {
        Self::new(
            std::env::var("NOTIFY_SOCKET").ok(),
            std::env::var("WATCHDOG_USEC")
                .ok()
                .and_then(|v| watchdog_from_usec(&v)),
        )
    }

    fn new(address: Option<String>, watchdog: Option<Duration>) -> Self {
        Self {
            address,
            watchdog,
            last_watchdog: Instant::now(),
        }
    }

    fn send(&self, state: &str) {
        let Some(ref address) = self.address else {
            return;
        };
        let Ok(sock) = UnixDatagram::unbound() else {
            return;
        };

        // A leading '@' names a socket in the abstract namespace.
        let result = match address.strip_prefix('@') {
            Some(name) => SocketAddr::from_abstract_name(name.as_bytes())
                .and_then(|addr| sock.send_to_addr(state.as_bytes(), &addr)),
            None => sock.send_to(state.as_bytes(), address.as_str()),
        };
        if let Err(e) = result {
            log::debug!("could not notify service manager: {e}");
        }
    }

    fn ready(&self, status: &str) {
        self.send(&format!("READY=1\nSTATUS={status}"));
    }

    fn status(&self, status: &str) {
        self.send(&format!("STATUS={status}"));
    }

    fn stopping(&self) {
        self.send("STOPPING=1\nSTATUS=Shutting down");
    }

    /// Emit WATCHDOG=1 once the keepalive interval has elapsed.
    fn keepalive(&mut self) {
        if let Some(interval) = self.watchdog
            && self.last_watchdog.elapsed() >= interval
        {
            self.send("WATCHDOG=1");
            self.last_watchdog = Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Per-link protocol sockets
// ---------------------------------------------------------------------------

/// UDP socket bound to one interface for the DHCP exchange. The client
/// speaks before it has an address, so the socket needs broadcast
/// permission and a hard binding to the device.
struct DhcpSocket {
    fd: i32,
}

impl DhcpSocket {
    fn open(ifname: &str) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // From here on drop closes the descriptor on any failed step.
        let sock = Self { fd: raw };

        sock.enable(libc::SO_BROADCAST)?;
        sock.enable(libc::SO_REUSEADDR)?;
        sock.bind_to_device(ifname)?;
        sock.bind_client_port()?;
        Ok(sock)
    }

    fn enable(&self, option: libc::c_int) -> io::Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                option,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn bind_to_device(&self, ifname: &str) -> io::Result<()> {
        let name = std::ffi::CString::new(ifname)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"))?;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                name.as_ptr() as *const libc::c_void,
                name.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn bind_client_port(&self) -> io::Result<()> {
        let mut local: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        local.sin_family = libc::AF_INET as libc::sa_family_t;
        local.sin_port = DHCP_CLIENT_PORT.to_be();
        local.sin_addr.s_addr = libc::INADDR_ANY;

        let ret = unsafe {
            libc::bind(
                self.fd,
                &local as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Broadcast one packet to the server port.
    fn send(&self, pkt: &dhcp::DhcpPacket) -> io::Result<()> {
        let data = pkt.serialize();

        let mut dst: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        dst.sin_family = libc::AF_INET as libc::sa_family_t;
        dst.sin_port = DHCP_SERVER_PORT.to_be();
        dst.sin_addr.s_addr = u32::from(Ipv4Addr::BROADCAST).to_be();

        let sent = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &dst as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Pop one queued reply, if any. The socket is non-blocking.
    fn recv(&self) -> Option<dhcp::DhcpPacket> {
        let mut buf = [0u8; 4096];
        let n =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            return None;
        }
        dhcp::DhcpPacket::parse(&buf[..n as usize]).ok()
    }
}

impl Drop for DhcpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Raw packet socket carrying ARP on one interface, for IPv4LL probing.
struct ArpSocket {
    fd: i32,
}

impl ArpSocket {
    fn open(ifindex: u32) -> io::Result<Self> {
        let protocol = (libc::ETH_P_ARP as u16).to_be() as libc::c_int;
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                protocol,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self { fd: raw };
        sock.bind_to_ifindex(ifindex)?;
        Ok(sock)
    }

    fn bind_to_ifindex(&self, ifindex: u32) -> io::Result<()> {
        let mut local: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        local.sll_family = libc::AF_PACKET as u16;
        local.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        local.sll_ifindex = ifindex as i32;

        let ret = unsafe {
            libc::bind(
                self.fd,
                &local as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Transmit a prebuilt Ethernet ARP frame.
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let sent =
            unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Pop one queued frame, if any. The socket is non-blocking.
    fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1500];
        let n =
            unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            return None;
        }
        Some(buf[..n as usize].to_vec())
    }
}

impl Drop for ArpSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

fn print_help() {
    eprintln!("networkd — network link configuration daemon");
    eprintln!();
    eprintln!("Usage: networkd [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h    Show this help message");
    eprintln!("  --version     Show version information");
}

fn print_version() {
    eprintln!("networkd {}", env!("CARGO_PKG_VERSION"));
}

fn setup_logging() {
    let level = std::env::var("SYSTEMD_LOG_LEVEL")
        .ok()
        .and_then(|l| match l.to_lowercase().as_str() {
            "debug" | "7" => Some(log::LevelFilter::Debug),
            "info" | "6" => Some(log::LevelFilter::Info),
            "notice" | "5" | "warning" | "4" => Some(log::LevelFilter::Warn),
            "err" | "3" | "crit" | "2" | "alert" | "1" | "emerg" | "0" => {
                Some(log::LevelFilter::Error)
            }
            _ => None,
        })
        .unwrap_or(log::LevelFilter::Info);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][networkd][{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .ok();
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" => {
                print_version();
                return;
            }
            _ => {
                // Tolerate unknown flags; the service manager passes some.
            }
        }
    }

    setup_logging();
    log::info!("networkd starting");

    let mut notifier = Notifier::from_env();

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload)).ok();

    let rtnl = match Rtnl::new() {
        Ok(rtnl) => rtnl,
        Err(e) => {
            log::error!("could not open rtnetlink socket: {e}");
            notifier.status("Failed to open rtnetlink socket");
            std::process::exit(1);
        }
    };
    let mut monitor = match NetlinkSocket::open_monitor() {
        Ok(m) => m,
        Err(e) => {
            log::error!("could not subscribe to link notifications: {e}");
            std::process::exit(1);
        }
    };

    let mut manager = Manager::new(rtnl);
    manager.load_networks();
    if manager.networks.is_empty() {
        log::info!("no .network profiles found");
    }

    // Prime the registry from a full link dump.
    match NetlinkSocket::open().and_then(|mut sock| sock.dump_links()) {
        Ok(links) => {
            for msg in links {
                manager.process_link_message(&msg);
            }
        }
        Err(e) => {
            log::error!("could not enumerate links: {e}");
            notifier.status("Failed to enumerate links");
            std::process::exit(1);
        }
    }

    manager.rtnl.process();
    manager.process();

    notifier.ready("Managing network links");
    log::info!("networkd ready ({} link(s) tracked)", manager.links.len());

    let poll_interval = Duration::from_millis(500);

    // Per-link protocol sockets, opened lazily while a client runs and
    // closed by drop when it stops or the link goes away.
    let mut dhcp_sockets: HashMap<u64, DhcpSocket> = HashMap::new();
    let mut arp_sockets: HashMap<u64, ArpSocket> = HashMap::new();

    while !shutdown.load(Ordering::Relaxed) {
        if reload.swap(false, Ordering::Relaxed) {
            log::info!("reloading network profiles (SIGHUP)");
            manager.load_networks();
        }

        // Kernel link notifications.
        for event in monitor.poll_events() {
            match event {
                LinkEvent::NewLink(msg) => manager.process_link_message(&msg),
                LinkEvent::DelLink(ifindex) => {
                    let key = u64::from(ifindex);
                    dhcp_sockets.remove(&key);
                    arp_sockets.remove(&key);
                    manager.link_removed(ifindex);
                }
            }
        }

        manager.retry_uninitialized();

        // Drive the sub-protocol clients.
        let now = Instant::now();
        let ifindexes: Vec<u64> = manager.links.keys().copied().collect();
        for ifindex in ifindexes {
            let Some(link) = manager.links.get_mut(&ifindex) else {
                continue;
            };
            let ifname = link.ifname.clone();

            if let Some(ref mut client) = link.dhcp_client {
                if client.is_running() {
                    if !dhcp_sockets.contains_key(&ifindex) {
                        match DhcpSocket::open(&ifname) {
                            Ok(sock) => {
                                dhcp_sockets.insert(ifindex, sock);
                            }
                            Err(e) => log::warn!("{ifname}: could not open DHCP socket: {e}"),
                        }
                    }
                    if let Some(sock) = dhcp_sockets.get(&ifindex) {
                        while let Some(pkt) = sock.recv() {
                            client.process_packet(&pkt);
                        }
                        client.tick(now);
                        if let Some(pkt) = client.next_packet(now)
                            && let Err(e) = sock.send(&pkt)
                        {
                            log::warn!("{ifname}: could not send DHCP packet: {e}");
                        }
                    }
                } else {
                    dhcp_sockets.remove(&ifindex);
                }
            }

            if let Some(ref mut client) = link.ipv4ll {
                if client.is_running() {
                    if !arp_sockets.contains_key(&ifindex) {
                        match ArpSocket::open(ifindex as u32) {
                            Ok(sock) => {
                                arp_sockets.insert(ifindex, sock);
                            }
                            Err(e) => log::warn!("{ifname}: could not open ARP socket: {e}"),
                        }
                    }
                    if let Some(sock) = arp_sockets.get(&ifindex) {
                        while let Some(frame) = sock.recv() {
                            client.process_frame(&frame, now);
                        }
                        if let Some(frame) = client.tick(now)
                            && let Err(e) = sock.send(&frame)
                        {
                            log::warn!("{ifname}: could not send ARP frame: {e}");
                        }
                    }
                } else {
                    arp_sockets.remove(&ifindex);
                }
            }
        }

        // Dispatch client events, run kernel requests, dispatch their
        // completions.
        manager.process();
        manager.rtnl.process();
        manager.process();

        notifier.keepalive();
        std::thread::sleep(poll_interval);
    }

    log::info!("networkd shutting down");
    notifier.stopping();

    // Release held leases before the sockets go away.
    for (&ifindex, sock) in &dhcp_sockets {
        if let Some(link) = manager.links.get(&ifindex)
            && let Some(ref client) = link.dhcp_client
            && let Some(release) = client.build_release()
        {
            log::info!("{}: sending DHCPRELEASE", link.ifname);
            let _ = sock.send(&release);
        }
    }

    manager.shutdown();

    log::info!("networkd stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_from_usec() {
        assert_eq!(watchdog_from_usec("10000000"), Some(Duration::from_secs(5)));
        assert_eq!(watchdog_from_usec("0"), None);
        assert_eq!(watchdog_from_usec("not_a_number"), None);
        assert_eq!(watchdog_from_usec(""), None);
    }

    #[test]
    fn test_notifier_without_address_is_silent() {
        // Running outside a service manager must be a no-op, not a panic.
        let mut notifier = Notifier::new(None, Some(Duration::ZERO));
        notifier.ready("no service manager");
        notifier.status("still none");
        notifier.keepalive();
        notifier.stopping();
    }

    #[test]
    fn test_notifier_delivers_ready_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let notifier = Notifier::new(Some(path.to_string_lossy().into_owned()), None);
        notifier.ready("Managing network links");

        let mut buf = [0u8; 128];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\nSTATUS=Managing network links");
    }

    #[test]
    fn test_notifier_abstract_address() {
        let name = format!("networkd-test-notify-{}", std::process::id());
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let listener = UnixDatagram::bind_addr(&addr).unwrap();

        let notifier = Notifier::new(Some(format!("@{name}")), None);
        notifier.stopping();

        let mut buf = [0u8; 128];
        let n = listener.recv(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"STOPPING=1"));
    }

    #[test]
    fn test_keepalive_pacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();
        listener.set_nonblocking(true).unwrap();
        let address = path.to_string_lossy().into_owned();

        // A due watchdog sends one keepalive and rearms.
        let mut notifier = Notifier::new(Some(address.clone()), Some(Duration::ZERO));
        notifier.keepalive();
        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");

        // Nothing more until the next interval elapses.
        notifier.watchdog = Some(Duration::from_secs(3600));
        notifier.keepalive();
        assert!(listener.recv(&mut buf).is_err());

        // No watchdog configured: keepalive stays quiet.
        let mut quiet = Notifier::new(Some(address), None);
        quiet.keepalive();
        assert!(listener.recv(&mut buf).is_err());
    }

    #[test]
    fn test_dhcp_socket_needs_a_real_interface() {
        assert!(DhcpSocket::open("definitely-not-a-device-0").is_err());
    }

    #[test]
    fn test_dhcp_socket_rejects_interior_nul() {
        assert!(DhcpSocket::open("eth\0").is_err());
    }
}
