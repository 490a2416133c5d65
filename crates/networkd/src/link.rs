//! Per-interface configuration state machine.
//!
//! Each kernel interface is driven through a fixed sequence of stages:
//!
//! ```text
//! INITIALIZING → ENSLAVING → SETTING_ADDRESSES → SETTING_ROUTES → CONFIGURED
//!                                     ▲                               │
//!                                     └───── DHCP / IPv4LL events ────┘
//! any stage ── enslave failure / fatal kernel error ──► FAILED
//! ```
//!
//! Every kernel operation is asynchronous; a stage advances only when its
//! pending-acknowledgment counter drains to zero. Because a DHCP event can
//! regress the machine while acks from an earlier pass are still in flight,
//! the address and route handlers advance only when the state at decrement
//! time is still the stage whose counter they drained.

use std::fs;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::address::{Address, CACHE_INFO_INFINITY};
use crate::config::Network;
use crate::dhcp::{DhcpClient, DhcpEvent, Lease, OPT_INTERFACE_MTU};
use crate::hostname::HostnameClient;
use crate::ipv4ll::{Ipv4llClient, Ipv4llEvent};
use crate::route::Route;
use crate::rtnl::{Completion, IFF_DORMANT, IFF_LOWER_UP, IFF_UP, LinkMessage, Op, OpKind, Rtnl};
use crate::udev::Device;

/// Metric of the link-scope catch-all route installed for IPv4LL.
const IPV4LL_ROUTE_METRIC: u32 = 99;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Configuration stage of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Initializing,
    Enslaving,
    SettingAddresses,
    SettingRoutes,
    Configured,
    Failed,
}

impl LinkState {
    /// The collapsed representation written to the state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing | Self::Enslaving | Self::SettingAddresses | Self::SettingRoutes => {
                "configuring"
            }
            Self::Configured => "configured",
            Self::Failed => "failed",
        }
    }
}

/// Mutable access to the shared machinery a link handler may need: the
/// kernel adapter, the hostname collaborator and the manager's
/// resolv.conf dirty flag.
pub struct LinkContext<'a> {
    pub rtnl: &'a mut Rtnl,
    pub hostname: &'a HostnameClient,
    pub resolv_dirty: &'a mut bool,
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// One managed (or at least tracked) kernel interface.
#[derive(Debug)]
pub struct Link {
    /// Kernel interface index, the stable key.
    pub ifindex: u64,
    /// Current kernel name; changes on rename.
    pub ifname: String,
    /// Hardware address; all zeros until the kernel reports one.
    pub mac: [u8; 6],
    /// IFF_* flag word as last reported.
    pub flags: u32,
    /// MTU captured from the first message that carried one. Used to
    /// restore the interface when a leased MTU goes away.
    pub original_mtu: u32,

    pub state: LinkState,
    /// The matched profile; absent means tracked but unmanaged.
    pub network: Option<Network>,

    /// Outstanding enslave acknowledgments.
    pub enslaving: u32,
    /// Outstanding address acknowledgments.
    pub addr_messages: u32,
    /// Outstanding route acknowledgments.
    pub route_messages: u32,

    pub dhcp_client: Option<DhcpClient>,
    pub dhcp_lease: Option<Lease>,
    pub ipv4ll: Option<Ipv4llClient>,
    /// The link-local address currently installed (or being installed).
    pub ipv4ll_address: Option<Ipv4Addr>,

    pub udev_device: Option<Device>,

    state_file: PathBuf,
    lease_file: PathBuf,
}

impl Link {
    pub fn new(ifindex: u64, ifname: String, state_dir: &Path) -> Self {
        Self {
            ifindex,
            ifname,
            mac: [0; 6],
            flags: 0,
            original_mtu: 0,
            state: LinkState::Initializing,
            network: None,
            enslaving: 0,
            addr_messages: 0,
            route_messages: 0,
            dhcp_client: None,
            dhcp_lease: None,
            ipv4ll: None,
            ipv4ll_address: None,
            udev_device: None,
            state_file: state_dir.join("links").join(ifindex.to_string()),
            lease_file: state_dir.join("leases").join(ifindex.to_string()),
        }
    }

    fn ifx(&self) -> u32 {
        self.ifindex as u32
    }

    fn network_flags(&self) -> (bool, bool) {
        match self.network {
            Some(ref n) => (n.dhcp, n.ipv4ll),
            None => (false, false),
        }
    }

    // -- profile application ------------------------------------------------

    /// Apply a matched profile: create the sub-protocol clients and start
    /// walking the stages. Runs once, while still INITIALIZING.
    pub fn configure(&mut self, ctx: &mut LinkContext, network: Network, seed: Option<[u8; 8]>) {
        if self.state != LinkState::Initializing {
            return;
        }

        if network.ipv4ll {
            let mut client = Ipv4llClient::new();
            if let Some(seed) = seed {
                client.set_address_seed(seed);
            }
            client.set_index(self.ifx());
            client.set_mac(self.mac);
            self.ipv4ll = Some(client);
        }

        if network.dhcp {
            let mut client = DhcpClient::new();
            client.set_index(self.ifx());
            client.set_mac(self.mac);
            if network.dhcp_mtu {
                client.set_request_option(OPT_INTERFACE_MTU);
            }
            if let Ok(hostname) = nix::unistd::gethostname()
                && let Ok(hostname) = hostname.into_string()
            {
                client.set_hostname(Some(hostname));
            }
            self.dhcp_client = Some(client);
        }

        self.network = Some(network);

        self.enter_enslave(ctx);

        // Replay the flags seen so far, now that the profile is attached;
        // an already-present carrier starts the clients right away.
        let flags = self.flags;
        self.flags = 0;
        self.update_flags(flags);
    }

    // -- enslaving ----------------------------------------------------------

    fn enter_enslave(&mut self, ctx: &mut LinkContext) {
        self.state = LinkState::Enslaving;
        self.save();

        let parents = self
            .network
            .as_ref()
            .map(|n| n.virtual_parents())
            .unwrap_or_default();

        if parents.is_empty() {
            self.enslaved(ctx);
            return;
        }

        for parent in parents {
            log::debug!("{}: enslaving by '{}'", self.ifname, parent.name);
            ctx.rtnl.submit(self.ifx(), Op::Enslave { master: parent });
            self.enslaving += 1;
        }
    }

    fn enslave_handler(&mut self, ctx: &mut LinkContext, errno: i32) {
        if self.enslaving == 0 {
            log::debug!("{}: stray enslave ack", self.ifname);
            return;
        }
        self.enslaving -= 1;

        if self.state == LinkState::Failed {
            return;
        }

        if errno < 0 {
            log::error!(
                "{}: could not enslave: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
            self.enter_failed();
            return;
        }

        log::debug!("{}: enslaved", self.ifname);

        if self.enslaving == 0 {
            self.enslaved(ctx);
        }
    }

    /// All enslave acks landed (or no parents were named).
    fn enslaved(&mut self, ctx: &mut LinkContext) {
        if self.flags & IFF_UP == 0 {
            self.link_up(ctx);
        }

        let (dhcp, ipv4ll) = self.network_flags();
        if !dhcp && !ipv4ll {
            self.enter_set_addresses(ctx);
        }
    }

    fn link_up(&mut self, ctx: &mut LinkContext) {
        log::debug!("{}: bringing link up", self.ifname);
        ctx.rtnl.submit(self.ifx(), Op::SetFlags {
            mask: IFF_UP,
            value: IFF_UP,
        });
    }

    fn link_up_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }
        if errno >= 0 {
            let flags = self.flags | IFF_UP;
            self.update_flags(flags);
        } else {
            log::warn!(
                "{}: could not bring up interface: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }
    }

    // -- addresses ----------------------------------------------------------

    fn enter_set_addresses(&mut self, ctx: &mut LinkContext) {
        self.state = LinkState::SettingAddresses;

        let statics: Vec<Address> = self
            .network
            .as_ref()
            .map(|n| n.addresses.clone())
            .unwrap_or_default();
        let lease_addr = self.dhcp_lease.as_ref().map(|l| (l.address, l.netmask));
        let ll_addr = self.ipv4ll_address;

        if statics.is_empty() && lease_addr.is_none() && ll_addr.is_none() {
            self.enter_set_routes(ctx);
            return;
        }

        log::debug!("{}: setting addresses", self.ifname);

        for addr in statics {
            ctx.rtnl.submit(self.ifx(), Op::AddressConfigure(addr));
            self.addr_messages += 1;
        }

        // The link-local address only while no lease is held; once DHCP
        // acquires, the link-local one is merely deprecated.
        if lease_addr.is_none()
            && let Some(ll) = ll_addr
        {
            ctx.rtnl
                .submit(self.ifx(), Op::AddressConfigure(Address::ipv4ll(ll)));
            self.addr_messages += 1;
        }

        if let Some((addr, netmask)) = lease_addr {
            ctx.rtnl
                .submit(self.ifx(), Op::AddressConfigure(Address::from_lease(addr, netmask)));
            self.addr_messages += 1;
        }
    }

    fn address_handler(&mut self, ctx: &mut LinkContext, errno: i32) {
        if self.addr_messages == 0 {
            log::debug!("{}: stray address ack", self.ifname);
            return;
        }
        self.addr_messages -= 1;

        if self.state == LinkState::Failed {
            return;
        }

        if errno < 0 && errno != -libc::EEXIST {
            log::warn!(
                "{}: could not set address: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }

        // An ack from a pass that was since regressed must not advance the
        // new pass; only the drain observed in SETTING_ADDRESSES counts.
        if self.addr_messages == 0 && self.state == LinkState::SettingAddresses {
            log::debug!("{}: addresses set", self.ifname);
            self.enter_set_routes(ctx);
        }
    }

    fn address_update_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }
        if errno < 0 && errno != -libc::ENOENT {
            log::warn!(
                "{}: could not update address: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }
    }

    fn address_drop_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }
        if errno < 0 && errno != -libc::ENOENT {
            log::warn!(
                "{}: could not drop address: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }
    }

    // -- routes -------------------------------------------------------------

    fn enter_set_routes(&mut self, ctx: &mut LinkContext) {
        self.state = LinkState::SettingRoutes;

        let statics: Vec<Route> = self
            .network
            .as_ref()
            .map(|n| n.routes.clone())
            .unwrap_or_default();
        let gateway = self.dhcp_lease.as_ref().and_then(|l| l.router);
        let has_lease = self.dhcp_lease.is_some();
        let ll_bound = self.ipv4ll_address.is_some();

        if statics.is_empty() && !has_lease && !ll_bound {
            self.enter_configured();
            return;
        }

        log::debug!("{}: setting routes", self.ifname);

        for route in statics {
            ctx.rtnl.submit(self.ifx(), Op::RouteConfigure(route));
            self.route_messages += 1;
        }

        if ll_bound && !has_lease {
            ctx.rtnl.submit(
                self.ifx(),
                Op::RouteConfigure(Route::link_scope_default(IPV4LL_ROUTE_METRIC)),
            );
            self.route_messages += 1;
        }

        if let Some(gw) = gateway {
            // The netmask may mask out the gateway. Install an explicit
            // host route first so the default route resolves regardless.
            ctx.rtnl
                .submit(self.ifx(), Op::RouteConfigure(Route::gateway_host(gw)));
            self.route_messages += 1;

            ctx.rtnl
                .submit(self.ifx(), Op::RouteConfigure(Route::default_via(gw)));
            self.route_messages += 1;
        }
    }

    fn route_handler(&mut self, errno: i32) {
        if self.route_messages == 0 {
            log::debug!("{}: stray route ack", self.ifname);
            return;
        }
        self.route_messages -= 1;

        if self.state == LinkState::Failed {
            return;
        }

        if errno < 0 && errno != -libc::EEXIST {
            log::warn!(
                "{}: could not set route: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }

        // A reply belonging to a pass that has since been regressed must
        // only drain the counter, never complete the new pass.
        if self.route_messages == 0 && self.state == LinkState::SettingRoutes {
            log::debug!("{}: routes set", self.ifname);
            self.enter_configured();
        }
    }

    fn route_drop_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }
        if errno < 0 && errno != -libc::ENOENT {
            log::warn!(
                "{}: could not drop route: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }
    }

    // -- terminal transitions ------------------------------------------------

    fn enter_configured(&mut self) {
        log::info!("{}: link configured", self.ifname);
        self.state = LinkState::Configured;
        self.save();
    }

    fn enter_failed(&mut self) {
        log::warn!("{}: failed", self.ifname);
        self.state = LinkState::Failed;
        self.save();
    }

    // -- MTU ----------------------------------------------------------------

    fn set_mtu(&mut self, ctx: &mut LinkContext, mtu: u32) {
        log::debug!("{}: setting MTU: {}", self.ifname, mtu);
        ctx.rtnl.submit(self.ifx(), Op::SetMtu(mtu));
    }

    fn set_mtu_handler(&mut self, errno: i32) {
        if self.state == LinkState::Failed {
            return;
        }
        if errno < 0 {
            log::warn!(
                "{}: could not set MTU: {} (errno {})",
                self.ifname,
                errno_string(errno),
                -errno
            );
        }
    }

    // -- kernel message handling ---------------------------------------------

    /// Handle a completion delivered by the adapter.
    pub fn handle_completion(&mut self, ctx: &mut LinkContext, c: &Completion) {
        match c.kind {
            OpKind::Enslave => self.enslave_handler(ctx, c.errno),
            OpKind::AddressConfigure => self.address_handler(ctx, c.errno),
            OpKind::AddressUpdate => self.address_update_handler(c.errno),
            OpKind::AddressDrop => self.address_drop_handler(c.errno),
            OpKind::RouteConfigure => self.route_handler(c.errno),
            OpKind::RouteDrop => self.route_drop_handler(c.errno),
            OpKind::SetFlags => self.link_up_handler(c.errno),
            OpKind::SetMtu => self.set_mtu_handler(c.errno),
        }
    }

    /// Apply an RTM_NEWLINK message: rename, MTU capture, MAC change,
    /// flag diffing.
    pub fn update(&mut self, msg: &LinkMessage) {
        if self.state == LinkState::Failed {
            return;
        }

        if let Some(ref name) = msg.ifname
            && *name != self.ifname
        {
            log::info!("{}: renamed to {}", self.ifname, name);
            self.ifname = name.clone();
        }

        if self.original_mtu == 0 && msg.mtu != 0 {
            self.original_mtu = msg.mtu;
            log::debug!("{}: saved original MTU: {}", self.ifname, self.original_mtu);
        }

        // The kernel may broadcast NEWLINK messages without the MAC
        // address set; ignore those for the MAC path.
        if let Some(mac) = msg.mac
            && mac != self.mac
        {
            self.mac = mac;
            log::debug!("{}: MAC address: {}", self.ifname, format_mac(&mac));

            if let Some(ref mut client) = self.ipv4ll {
                client.set_mac(mac);
            }
            if let Some(ref mut client) = self.dhcp_client {
                client.set_mac(mac);
            }
        }

        self.update_flags(msg.flags);
    }

    /// Diff the kernel flag word and react to carrier changes.
    pub fn update_flags(&mut self, flags: u32) {
        if self.state == LinkState::Failed {
            return;
        }
        if self.flags == flags {
            return;
        }

        let added = (self.flags ^ flags) & flags;
        let removed = (self.flags ^ flags) & self.flags;

        // Carrier means LOWER_UP and not DORMANT.
        let carrier_gained = (added & IFF_LOWER_UP != 0 && flags & IFF_DORMANT == 0)
            || (removed & IFF_DORMANT != 0 && flags & IFF_LOWER_UP != 0);
        let carrier_lost = (self.flags & IFF_LOWER_UP != 0 && self.flags & IFF_DORMANT == 0)
            && (removed & IFF_LOWER_UP != 0 || added & IFF_DORMANT != 0);

        self.flags = flags;

        if self.network.is_none() {
            // Not currently managing this link; track the flags silently.
            return;
        }

        if added & IFF_UP != 0 {
            log::info!("{}: link is up", self.ifname);
        } else if removed & IFF_UP != 0 {
            log::info!("{}: link is down", self.ifname);
        }
        if added & IFF_LOWER_UP != 0 {
            log::debug!("{}: link is lower up", self.ifname);
        } else if removed & IFF_LOWER_UP != 0 {
            log::debug!("{}: link is lower down", self.ifname);
        }
        if added & IFF_DORMANT != 0 {
            log::debug!("{}: link is dormant", self.ifname);
        } else if removed & IFF_DORMANT != 0 {
            log::debug!("{}: link is not dormant", self.ifname);
        }

        if carrier_gained {
            log::info!("{}: gained carrier", self.ifname);

            let (dhcp, ipv4ll) = self.network_flags();
            if (dhcp || ipv4ll)
                && let Err(e) = self.acquire_conf()
            {
                log::warn!("{}: could not acquire configuration: {}", self.ifname, e);
                self.enter_failed();
            }
        } else if carrier_lost {
            log::info!("{}: lost carrier", self.ifname);

            // Stop the sub-protocols; the machine tears addresses down
            // only once they report their loss.
            if let Some(ref mut client) = self.dhcp_client {
                client.stop();
            }
            if let Some(ref mut client) = self.ipv4ll {
                client.stop();
            }
        }
    }

    /// Start the configured address-acquisition protocols.
    fn acquire_conf(&mut self) -> io::Result<()> {
        let (dhcp, ipv4ll) = self.network_flags();

        if ipv4ll && let Some(ref mut client) = self.ipv4ll {
            log::debug!("{}: acquiring IPv4 link-local address", self.ifname);
            client.start()?;
        }

        if dhcp && let Some(ref mut client) = self.dhcp_client {
            log::debug!("{}: acquiring DHCPv4 lease", self.ifname);
            client.start()?;
        }

        Ok(())
    }

    // -- DHCP events ----------------------------------------------------------

    /// Handle an event reported by the DHCP client.
    pub fn dhcp_event(&mut self, ctx: &mut LinkContext, event: DhcpEvent) {
        if self.state == LinkState::Failed {
            return;
        }
        let Some(network) = self.network.clone() else {
            return;
        };

        match event {
            DhcpEvent::NoLease => {
                log::debug!("{}: DHCP could not obtain a lease", self.ifname);
            }
            DhcpEvent::Expired | DhcpEvent::Stop | DhcpEvent::IpChange => {
                if network.dhcp_critical {
                    log::error!(
                        "{}: DHCPv4 connection considered system critical, \
                         ignoring request to reconfigure it",
                        self.ifname
                    );
                    return;
                }

                if self.dhcp_lease.is_some() {
                    self.dhcp_lease_lost(ctx);
                }

                if event == DhcpEvent::IpChange && self.dhcp_lease_acquired(ctx).is_err() {
                    self.enter_failed();
                    return;
                }

                if event == DhcpEvent::Expired && network.ipv4ll {
                    let start_result = match self.ipv4ll {
                        Some(ref mut client) if !client.is_running() => client.start(),
                        _ => Ok(()),
                    };
                    if let Err(e) = start_result {
                        log::warn!("{}: could not start IPv4 link-local: {}", self.ifname, e);
                        self.enter_failed();
                        return;
                    }
                    // A still-claimed address becomes preferred again.
                    if self.ipv4ll_address.is_some() {
                        self.ipv4ll_address_update(ctx, false);
                    }
                }
            }
            DhcpEvent::IpAcquire => {
                if self.dhcp_lease_acquired(ctx).is_err() {
                    self.enter_failed();
                    return;
                }
                if self.ipv4ll.is_some() {
                    if self.ipv4ll_address.is_some() {
                        self.ipv4ll_address_update(ctx, true);
                    } else if let Some(ref mut client) = self.ipv4ll {
                        client.stop();
                    }
                }
            }
            DhcpEvent::Error(errno) => {
                log::warn!("{}: DHCP error: {}", self.ifname, errno_string(errno));
            }
        }
    }

    /// Adopt the client's lease: log it, apply MTU/hostname/DNS side
    /// effects and regress to SETTING_ADDRESSES to install it.
    fn dhcp_lease_acquired(&mut self, ctx: &mut LinkContext) -> Result<(), ()> {
        let Some(lease) = self.dhcp_client.as_ref().and_then(|c| c.get_lease()).cloned() else {
            log::warn!("{}: DHCP event without a lease", self.ifname);
            return Err(());
        };
        let Some(gateway) = lease.router else {
            log::warn!("{}: DHCP lease carries no router", self.ifname);
            return Err(());
        };
        let Some(network) = self.network.clone() else {
            return Err(());
        };

        log::info!(
            "{}: DHCPv4 address {}/{} via {}",
            self.ifname,
            lease.address,
            lease.prefixlen(),
            gateway
        );

        self.dhcp_lease = Some(lease.clone());

        if network.dhcp_dns && !lease.dns_servers.is_empty() {
            *ctx.resolv_dirty = true;
        }

        if network.dhcp_mtu
            && let Some(mtu) = lease.mtu
        {
            // Only once the original MTU is known; otherwise there would
            // be nothing to restore on lease loss.
            if self.original_mtu != 0 {
                self.set_mtu(ctx, u32::from(mtu));
            }
        }

        if network.dhcp_hostname
            && let Some(ref hostname) = lease.hostname
        {
            ctx.hostname.set_hostname(hostname);
        }

        self.enter_set_addresses(ctx);

        Ok(())
    }

    /// Remove everything the lease put in place: address, the host route
    /// to the gateway, the default route, leased MTU, transient hostname.
    fn dhcp_lease_lost(&mut self, ctx: &mut LinkContext) {
        log::warn!("{}: DHCP lease lost", self.ifname);

        let Some(lease) = self.dhcp_lease.take() else {
            return;
        };
        let Some(network) = self.network.clone() else {
            return;
        };

        if let Some(gw) = lease.router {
            ctx.rtnl
                .submit(self.ifx(), Op::RouteDrop(Route::gateway_host(gw)));
            ctx.rtnl
                .submit(self.ifx(), Op::RouteDrop(Route::default_via(gw)));
        }
        ctx.rtnl.submit(
            self.ifx(),
            Op::AddressDrop(Address::from_lease(lease.address, lease.netmask)),
        );

        if network.dhcp_mtu
            && let Some(mtu) = lease.mtu
            && self.original_mtu != 0
            && u32::from(mtu) != self.original_mtu
        {
            let original = self.original_mtu;
            self.set_mtu(ctx, original);
        }

        if network.dhcp_hostname && lease.hostname.is_some() {
            ctx.hostname.set_hostname("");
        }

        if network.dhcp_dns && !lease.dns_servers.is_empty() {
            *ctx.resolv_dirty = true;
        }
    }

    // -- IPv4LL events --------------------------------------------------------

    /// Handle an event reported by the IPv4LL client.
    pub fn ipv4ll_event(&mut self, ctx: &mut LinkContext, event: Ipv4llEvent) {
        if self.state == LinkState::Failed {
            return;
        }

        match event {
            Ipv4llEvent::Stop | Ipv4llEvent::Conflict => {
                self.ipv4ll_address_lost(ctx);
            }
            Ipv4llEvent::Bind => {
                let Some(addr) = self.ipv4ll.as_ref().and_then(|c| c.address()) else {
                    log::warn!("{}: IPv4 link-local bind without an address", self.ifname);
                    return;
                };
                log::info!("{}: IPv4 link-local address {}", self.ifname, addr);
                self.ipv4ll_address = Some(addr);
                self.enter_set_addresses(ctx);
            }
            Ipv4llEvent::Error(errno) => {
                log::warn!(
                    "{}: IPv4 link-local error: {}",
                    self.ifname,
                    errno_string(errno)
                );
            }
        }
    }

    /// Re-issue the link-local address with an updated preferred lifetime:
    /// zero deprecates it next to a DHCP address, infinity re-approves it.
    fn ipv4ll_address_update(&mut self, ctx: &mut LinkContext, deprecate: bool) {
        let Some(addr) = self.ipv4ll_address else {
            return;
        };

        log::debug!(
            "{}: IPv4 link-local {} {}",
            self.ifname,
            if deprecate { "deprecate" } else { "approve" },
            addr
        );

        let mut address = Address::ipv4ll(addr);
        address.preferred_lifetime = if deprecate { 0 } else { CACHE_INFO_INFINITY };
        ctx.rtnl.submit(self.ifx(), Op::AddressUpdate(address));
    }

    /// Withdraw the link-local address and its catch-all route.
    fn ipv4ll_address_lost(&mut self, ctx: &mut LinkContext) {
        let Some(addr) = self.ipv4ll_address.take() else {
            return;
        };

        log::debug!("{}: IPv4 link-local release {}", self.ifname, addr);

        ctx.rtnl
            .submit(self.ifx(), Op::AddressDrop(Address::ipv4ll(addr)));
        ctx.rtnl.submit(
            self.ifx(),
            Op::RouteDrop(Route::link_scope_default(IPV4LL_ROUTE_METRIC)),
        );
    }

    // -- persistence ----------------------------------------------------------

    /// Persist the link state, logging instead of propagating failure.
    pub fn save(&self) {
        if let Err(e) = self.persist() {
            log::error!(
                "failed to save link data {}: {}",
                self.state_file.display(),
                e
            );
        }
    }

    /// Atomic write: temp file, mode 0644, flush, rename over the target.
    /// On any error both files are unlinked.
    fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_name = self
            .state_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self
            .state_file
            .with_file_name(format!(".#{}{}", file_name, std::process::id()));

        let result = (|| -> io::Result<()> {
            let mut f = fs::File::create(&temp_path)?;
            f.set_permissions(fs::Permissions::from_mode(0o644))?;

            write!(
                f,
                "# This is private data. Do not parse.\nSTATE={}\n",
                self.state.as_str()
            )?;

            if let Some(ref lease) = self.dhcp_lease {
                lease.save(&self.lease_file)?;
                writeln!(f, "DHCP_LEASE={}", self.lease_file.display())?;
            }

            f.flush()?;
            fs::rename(&temp_path, &self.state_file)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&self.state_file);
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn lease_file(&self) -> &Path {
        &self.lease_file
    }
}

pub(crate) fn errno_string(errno: i32) -> String {
    io::Error::from_raw_os_error(-errno).to_string()
}

pub(crate) fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
