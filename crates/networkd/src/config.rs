//! Parser for `.network` configuration files.
//!
//! INI-style format with sections:
//! - `[Match]`   — which links the profile applies to (name glob, MAC)
//! - `[Network]` — address acquisition (DHCP, IPv4LL), virtual parents, DNS
//! - `[Address]` — one static address per section
//! - `[Route]`   — one static route per section
//! - `[DHCP]`    — DHCPv4 tunables (UseDNS, UseMTU, UseHostname,
//!   CriticalConnection)
//!
//! The profile produced here is consumed by the link state machine; it is
//! matched once per link lifetime.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::address::{Address, ipv4_broadcast};
use crate::netdev::{NetDev, NetDevKind};
use crate::route::Route;

/// Default search paths for `.network` files.
pub const NETWORK_DIRS: &[&str] = &[
    "/etc/systemd/network",
    "/run/systemd/network",
    "/usr/lib/systemd/network",
];

// ---------------------------------------------------------------------------
// Network profile
// ---------------------------------------------------------------------------

/// A parsed `.network` profile.
#[derive(Debug, Clone, Default)]
pub struct Network {
    /// Source file, for diagnostics.
    pub filename: Option<PathBuf>,

    /// `[Match] Name=` glob patterns.
    pub match_name: Vec<String>,
    /// `[Match] MACAddress=` values.
    pub match_mac: Vec<String>,

    /// Run a DHCPv4 client on matching links.
    pub dhcp: bool,
    /// Run IPv4 link-local autoconfiguration on matching links.
    pub ipv4ll: bool,

    /// Adopt DNS servers from the lease.
    pub dhcp_dns: bool,
    /// Adopt the interface MTU from the lease (option 26).
    pub dhcp_mtu: bool,
    /// Adopt the transient hostname from the lease.
    pub dhcp_hostname: bool,
    /// Never tear down lease state once acquired.
    pub dhcp_critical: bool,

    /// Virtual parents to enslave the link to.
    pub bridge: Option<String>,
    pub bond: Option<String>,
    pub vlans: Vec<String>,
    pub macvlans: Vec<String>,

    /// Static addresses and routes.
    pub addresses: Vec<Address>,
    pub routes: Vec<Route>,

    /// Static DNS servers.
    pub dns: Vec<Ipv4Addr>,
}

impl Network {
    pub fn with_defaults() -> Self {
        Self {
            dhcp_dns: true,
            dhcp_hostname: true,
            ..Self::default()
        }
    }

    /// Whether this profile matches the given interface.
    pub fn matches(&self, ifname: &str, mac: Option<&str>) -> bool {
        if self.match_name.is_empty() && self.match_mac.is_empty() {
            return true;
        }

        if !self.match_name.is_empty() && !self.match_name.iter().any(|pat| glob_match(pat, ifname))
        {
            return false;
        }

        if !self.match_mac.is_empty() {
            match mac {
                Some(m) => {
                    if !self.match_mac.iter().any(|a| a.eq_ignore_ascii_case(m)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        true
    }

    /// The virtual parents the link must be enslaved to, in a stable order.
    pub fn virtual_parents(&self) -> Vec<NetDev> {
        let mut parents = Vec::new();
        if let Some(ref name) = self.bridge {
            parents.push(NetDev::new(name, NetDevKind::Bridge));
        }
        if let Some(ref name) = self.bond {
            parents.push(NetDev::new(name, NetDevKind::Bond));
        }
        for name in &self.vlans {
            parents.push(NetDev::new(name, NetDevKind::Vlan));
        }
        for name in &self.macvlans {
            parents.push(NetDev::new(name, NetDevKind::Macvlan));
        }
        parents
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.filename {
            Some(ref p) => write!(f, "{}", p.display()),
            None => write!(f, "<anonymous>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load every `.network` file from the standard directories, sorted by file
/// name. Earlier files win when several match the same link.
pub fn load_networks() -> Vec<Network> {
    let dirs: Vec<PathBuf> = NETWORK_DIRS.iter().map(PathBuf::from).collect();
    load_networks_from(&dirs)
}

/// Load `.network` files from explicit directories.
pub fn load_networks_from(dirs: &[PathBuf]) -> Vec<Network> {
    let mut paths = Vec::new();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("network") {
                paths.push(path);
            }
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut networks = Vec::new();
    for path in paths {
        match fs::read_to_string(&path) {
            Ok(content) => match parse_network(&content) {
                Ok(mut network) => {
                    network.filename = Some(path);
                    networks.push(network);
                }
                Err(e) => log::warn!("{}: parse error: {}", path.display(), e),
            },
            Err(e) => log::warn!("{}: {}", path.display(), e),
        }
    }
    networks
}

#[derive(PartialEq)]
enum Section {
    None,
    Match,
    Network,
    Address,
    Route,
    Dhcp,
    Other,
}

/// Parse a `.network` file from its contents.
pub fn parse_network(content: &str) -> Result<Network, String> {
    let mut network = Network::with_defaults();
    let mut section = Section::None;
    // The [Address]/[Route] section currently being filled in.
    let mut cur_addr: Option<PartialAddress> = None;
    let mut cur_route: Option<Route> = None;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            if !line.ends_with(']') {
                return Err(format!("line {}: malformed section header", lineno + 1));
            }
            flush_address(&mut network, &mut cur_addr);
            flush_route(&mut network, &mut cur_route);
            section = match &line[1..line.len() - 1] {
                "Match" => Section::Match,
                "Network" => Section::Network,
                "Address" => {
                    cur_addr = Some(PartialAddress::default());
                    Section::Address
                }
                "Route" => {
                    cur_route = Some(Route {
                        dst: Ipv4Addr::UNSPECIFIED,
                        dst_prefixlen: 0,
                        gateway: None,
                        metric: 0,
                        scope: crate::rtnl::RT_SCOPE_UNIVERSE,
                    });
                    Section::Route
                }
                "DHCP" | "DHCPv4" => Section::Dhcp,
                _ => Section::Other,
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {}: expected key=value", lineno + 1));
        };
        let (key, value) = (key.trim(), value.trim());

        match section {
            Section::Match => match key {
                "Name" => network
                    .match_name
                    .extend(value.split_whitespace().map(str::to_string)),
                "MACAddress" => network
                    .match_mac
                    .extend(value.split_whitespace().map(str::to_string)),
                _ => {}
            },
            Section::Network => match key {
                "DHCP" => network.dhcp = parse_dhcp(value),
                "IPv4LL" => network.ipv4ll = parse_bool(value),
                "Bridge" => network.bridge = Some(value.to_string()),
                "Bond" => network.bond = Some(value.to_string()),
                "VLAN" => network.vlans.push(value.to_string()),
                "MACVLAN" => network.macvlans.push(value.to_string()),
                "DNS" => {
                    if let Ok(ip) = value.parse::<Ipv4Addr>() {
                        network.dns.push(ip);
                    }
                }
                "Address" => {
                    // Shorthand for a one-line [Address] section.
                    if let Some((ip, prefixlen)) = parse_ipv4_cidr(value) {
                        let mut a = Address::new(ip, prefixlen);
                        a.broadcast = Some(ipv4_broadcast(ip, prefixlen));
                        network.addresses.push(a);
                    }
                }
                "Gateway" => {
                    if let Ok(gw) = value.parse::<Ipv4Addr>() {
                        network.routes.push(Route::default_via(gw));
                    }
                }
                _ => {}
            },
            Section::Address => {
                if let Some(ref mut pa) = cur_addr {
                    match key {
                        "Address" => pa.cidr = parse_ipv4_cidr(value),
                        "Broadcast" => pa.broadcast = value.parse().ok(),
                        "Label" => pa.label = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
            Section::Route => {
                if let Some(ref mut rt) = cur_route {
                    match key {
                        "Gateway" => rt.gateway = value.parse().ok(),
                        "Destination" => {
                            if let Some((dst, prefixlen)) = parse_ipv4_cidr(value) {
                                rt.dst = dst;
                                rt.dst_prefixlen = prefixlen;
                            }
                        }
                        "Metric" => rt.metric = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
            Section::Dhcp => match key {
                "UseDNS" => network.dhcp_dns = parse_bool(value),
                "UseMTU" => network.dhcp_mtu = parse_bool(value),
                "UseHostname" => network.dhcp_hostname = parse_bool(value),
                "CriticalConnection" => network.dhcp_critical = parse_bool(value),
                _ => {}
            },
            Section::None => {
                return Err(format!("line {}: key outside any section", lineno + 1));
            }
            Section::Other => {}
        }
    }

    flush_address(&mut network, &mut cur_addr);
    flush_route(&mut network, &mut cur_route);

    Ok(network)
}

fn flush_address(network: &mut Network, cur: &mut Option<PartialAddress>) {
    if let Some(pa) = cur.take()
        && let Some(addr) = pa.build()
    {
        network.addresses.push(addr);
    }
}

fn flush_route(network: &mut Network, cur: &mut Option<Route>) {
    if let Some(rt) = cur.take()
        && (rt.gateway.is_some() || rt.dst_prefixlen > 0)
    {
        network.routes.push(rt);
    }
}

#[derive(Default)]
struct PartialAddress {
    cidr: Option<(Ipv4Addr, u8)>,
    broadcast: Option<Ipv4Addr>,
    label: Option<String>,
}

impl PartialAddress {
    fn build(self) -> Option<Address> {
        let (ip, prefixlen) = self.cidr?;
        let mut addr = Address::new(ip, prefixlen);
        addr.broadcast = Some(
            self.broadcast
                .unwrap_or_else(|| ipv4_broadcast(ip, prefixlen)),
        );
        addr.label = self.label;
        Some(addr)
    }
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1"
    )
}

/// `DHCP=` historically accepts booleans and protocol selectors; anything
/// that enables v4 counts.
fn parse_dhcp(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1" | "ipv4" | "both" | "v4"
    )
}

/// Parse `a.b.c.d/len`; a bare address defaults to /32.
pub fn parse_ipv4_cidr(value: &str) -> Option<(Ipv4Addr, u8)> {
    match value.split_once('/') {
        Some((ip, len)) => {
            let ip = ip.parse().ok()?;
            let len: u8 = len.parse().ok()?;
            if len > 32 {
                return None;
            }
            Some((ip, len))
        }
        None => Some((value.parse().ok()?, 32)),
    }
}

/// Simple glob matching supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_at(&p, &t)
}

fn glob_match_at(p: &[char], t: &[char]) -> bool {
    match (p.first(), t.first()) {
        (None, None) => true,
        (Some('*'), _) => glob_match_at(&p[1..], t) || (!t.is_empty() && glob_match_at(p, &t[1..])),
        (Some('?'), Some(_)) => glob_match_at(&p[1..], &t[1..]),
        (Some(pc), Some(tc)) if pc == tc => glob_match_at(&p[1..], &t[1..]),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("eth*", "eth0"));
        assert!(glob_match("en*", "ens3"));
        assert!(glob_match("eth?", "eth0"));
        assert!(!glob_match("eth?", "eth10"));
        assert!(!glob_match("wlan*", "eth0"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_parse_ipv4_cidr() {
        assert_eq!(
            parse_ipv4_cidr("10.0.0.5/24"),
            Some((Ipv4Addr::new(10, 0, 0, 5), 24))
        );
        assert_eq!(
            parse_ipv4_cidr("192.168.1.1"),
            Some((Ipv4Addr::new(192, 168, 1, 1), 32))
        );
        assert_eq!(parse_ipv4_cidr("10.0.0.5/33"), None);
        assert_eq!(parse_ipv4_cidr("banana/24"), None);
    }

    #[test]
    fn test_parse_static_profile() {
        let network = parse_network(
            "[Match]\n\
             Name=eth0\n\
             \n\
             [Network]\n\
             DHCP=no\n\
             \n\
             [Address]\n\
             Address=10.0.0.5/24\n\
             \n\
             [Route]\n\
             Gateway=10.0.0.1\n",
        )
        .unwrap();

        assert!(!network.dhcp);
        assert!(!network.ipv4ll);
        assert_eq!(network.addresses.len(), 1);
        assert_eq!(network.addresses[0].in_addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(network.addresses[0].prefixlen, 24);
        assert_eq!(
            network.addresses[0].broadcast,
            Some(Ipv4Addr::new(10, 0, 0, 255))
        );
        assert_eq!(network.routes.len(), 1);
        assert_eq!(network.routes[0].gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(network.routes[0].dst_prefixlen, 0);
    }

    #[test]
    fn test_parse_dhcp_profile() {
        let network = parse_network(
            "[Match]\n\
             Name=en*\n\
             \n\
             [Network]\n\
             DHCP=ipv4\n\
             IPv4LL=yes\n\
             \n\
             [DHCP]\n\
             UseMTU=yes\n\
             UseDNS=no\n\
             CriticalConnection=yes\n",
        )
        .unwrap();

        assert!(network.dhcp);
        assert!(network.ipv4ll);
        assert!(network.dhcp_mtu);
        assert!(!network.dhcp_dns);
        assert!(network.dhcp_hostname); // default
        assert!(network.dhcp_critical);
    }

    #[test]
    fn test_parse_virtual_parents() {
        let network = parse_network(
            "[Network]\n\
             Bridge=br0\n\
             VLAN=vlan10\n\
             VLAN=vlan20\n\
             MACVLAN=mv0\n",
        )
        .unwrap();

        let parents = network.virtual_parents();
        assert_eq!(parents.len(), 4);
        assert_eq!(parents[0].name, "br0");
        assert_eq!(parents[0].kind, NetDevKind::Bridge);
        assert_eq!(parents[1].name, "vlan10");
        assert_eq!(parents[3].kind, NetDevKind::Macvlan);
    }

    #[test]
    fn test_matches_by_name_and_mac() {
        let mut network = Network::with_defaults();
        network.match_name = vec!["eth*".into()];
        assert!(network.matches("eth0", None));
        assert!(!network.matches("wlan0", None));

        network.match_mac = vec!["52:54:00:12:34:56".into()];
        assert!(network.matches("eth0", Some("52:54:00:12:34:56")));
        assert!(network.matches("eth0", Some("52:54:00:12:34:56".to_uppercase().as_str())));
        assert!(!network.matches("eth0", Some("aa:bb:cc:dd:ee:ff")));
        assert!(!network.matches("eth0", None));
    }

    #[test]
    fn test_empty_match_matches_all() {
        let network = Network::with_defaults();
        assert!(network.matches("anything0", None));
    }

    #[test]
    fn test_multiple_address_sections() {
        let network = parse_network(
            "[Address]\n\
             Address=10.0.0.5/24\n\
             \n\
             [Address]\n\
             Address=10.0.1.5/24\n\
             Label=eth0:1\n",
        )
        .unwrap();

        assert_eq!(network.addresses.len(), 2);
        assert_eq!(network.addresses[1].label.as_deref(), Some("eth0:1"));
    }

    #[test]
    fn test_route_with_destination_and_metric() {
        let network = parse_network(
            "[Route]\n\
             Destination=172.16.0.0/12\n\
             Gateway=10.0.0.254\n\
             Metric=200\n",
        )
        .unwrap();

        assert_eq!(network.routes.len(), 1);
        let rt = &network.routes[0];
        assert_eq!(rt.dst, Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(rt.dst_prefixlen, 12);
        assert_eq!(rt.gateway, Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(rt.metric, 200);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_network("[Match\nName=eth0\n").is_err());
        assert!(parse_network("Name=eth0\n").is_err());
        assert!(parse_network("[Match]\njust a line\n").is_err());
    }

    #[test]
    fn test_load_networks_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("20-b.network"),
            "[Match]\nName=eth*\n[Network]\nDHCP=yes\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("10-a.network"),
            "[Match]\nName=eth0\n[Network]\nDHCP=no\n",
        )
        .unwrap();
        fs::write(dir.path().join("README"), "not a network file").unwrap();

        let networks = load_networks_from(&[dir.path().to_path_buf()]);
        assert_eq!(networks.len(), 2);
        // Sorted by file name: 10-a before 20-b.
        assert!(!networks[0].dhcp);
        assert!(networks[1].dhcp);
    }
}
