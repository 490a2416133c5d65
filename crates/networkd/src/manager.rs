//! Link registry and event dispatch.
//!
//! The manager owns everything the links share: the registry keyed by
//! interface index, the rtnetlink adapter, the loaded `.network` profiles
//! and the process-wide collaborators (hostname client, device enumerator,
//! resolv.conf path). All handlers run on one thread; the manager simply
//! routes kernel completions and sub-protocol events to the owning link
//! until no work is left.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{self, Network};
use crate::hostname::HostnameClient;
use crate::link::{Link, LinkContext, LinkState, format_mac};
use crate::resolv;
use crate::rtnl::{LinkMessage, Rtnl};
use crate::udev::{self, DeviceEnumerator};

/// Runtime state directory; per-link files below `links/` and `leases/`.
const STATE_DIR: &str = "/run/systemd/network";

pub struct Manager {
    /// All tracked links, keyed by interface index.
    pub links: HashMap<u64, Link>,
    /// Loaded `.network` profiles, in match order.
    pub networks: Vec<Network>,

    pub rtnl: Rtnl,
    pub hostname: HostnameClient,
    pub enumerator: DeviceEnumerator,

    pub state_dir: PathBuf,
    pub resolv_conf_path: PathBuf,

    /// Inside a container there is no udev to wait for.
    pub in_container: bool,

    /// Set by link handlers when lease DNS data changed.
    pub resolv_dirty: bool,
}

impl Manager {
    pub fn new(rtnl: Rtnl) -> Self {
        let state_dir = PathBuf::from(STATE_DIR);
        Self {
            links: HashMap::new(),
            networks: Vec::new(),
            rtnl,
            hostname: HostnameClient::new(),
            enumerator: DeviceEnumerator::new(),
            resolv_conf_path: state_dir.join("resolv.conf"),
            state_dir,
            in_container: udev::detect_container(),
            resolv_dirty: false,
        }
    }

    /// Manager with every path below `root` and no udev wait (tests).
    pub fn with_root(rtnl: Rtnl, root: &Path) -> Self {
        let state_dir = root.join("network");
        Self {
            links: HashMap::new(),
            networks: Vec::new(),
            rtnl,
            hostname: HostnameClient::with_socket_path(&root.join("hostnamed.sock")),
            enumerator: DeviceEnumerator::with_data_dir(&root.join("udev-data")),
            resolv_conf_path: state_dir.join("resolv.conf"),
            state_dir,
            in_container: true,
            resolv_dirty: false,
        }
    }

    /// Load `.network` profiles from the standard directories.
    pub fn load_networks(&mut self) {
        self.networks = config::load_networks();
        log::info!("loaded {} network profile(s)", self.networks.len());
        for network in &self.networks {
            log::debug!("  {network}");
        }
    }

    /// Handle an RTM_NEWLINK message: create the link on first sight,
    /// apply the carried attributes, then try to initialize it.
    pub fn process_link_message(&mut self, msg: &LinkMessage) {
        let ifindex = u64::from(msg.ifindex);
        let is_new = !self.links.contains_key(&ifindex);

        if is_new {
            let Some(ifname) = msg.ifname.clone() else {
                log::warn!("RTM_NEWLINK for index {} without a name", msg.ifindex);
                return;
            };
            let link = Link::new(ifindex, ifname, &self.state_dir);
            log::info!("{}: link added", link.ifname);
            self.links.insert(ifindex, link);
        }

        if let Some(link) = self.links.get_mut(&ifindex) {
            link.update(msg);
        }

        if is_new {
            self.link_initialized(ifindex);
        }
    }

    /// Handle an RTM_DELLINK message.
    pub fn link_removed(&mut self, ifindex: u32) {
        let ifindex = u64::from(ifindex);
        if let Some(link) = self.links.remove(&ifindex) {
            log::info!("{}: link removed", link.ifname);
            // Nobody is left to receive completions for this link.
            self.rtnl.forget_link(ifindex as u32);
        }
    }

    /// Match a profile and start configuration, once the device is ready.
    /// Outside a container this waits for udev to finish rule processing.
    pub fn link_initialized(&mut self, ifindex: u64) {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        if link.state != LinkState::Initializing || link.network.is_some() {
            return;
        }

        let device = self.enumerator.device(ifindex);
        if !self.in_container {
            match device {
                Some(ref dev) if dev.is_initialized() => {}
                _ => {
                    log::debug!("{}: udev device not initialized, deferring", link.ifname);
                    return;
                }
            }
        }

        log::debug!("{}: link initialized", link.ifname);

        let mac_string = format_mac(&link.mac);
        let mac = (link.mac != [0u8; 6]).then_some(mac_string.as_str());
        let Some(network) = self
            .networks
            .iter()
            .find(|n| n.matches(&link.ifname, mac))
            .cloned()
        else {
            log::debug!("{}: no matching network profile, unmanaged", link.ifname);
            return;
        };

        log::info!("{}: matched network profile {}", link.ifname, network);

        let seed = device.as_ref().map(|d| d.seed());
        link.udev_device = device;

        let mut ctx = LinkContext {
            rtnl: &mut self.rtnl,
            hostname: &self.hostname,
            resolv_dirty: &mut self.resolv_dirty,
        };
        link.configure(&mut ctx, network, seed);
    }

    /// Retry links whose udev device was not ready when first seen.
    pub fn retry_uninitialized(&mut self) {
        let deferred: Vec<u64> = self
            .links
            .values()
            .filter(|l| l.state == LinkState::Initializing && l.network.is_none())
            .map(|l| l.ifindex)
            .collect();
        for ifindex in deferred {
            self.link_initialized(ifindex);
        }
    }

    /// Route queued kernel completions and sub-protocol events to their
    /// links until everything is quiet, then flush resolv.conf if needed.
    pub fn process(&mut self) {
        loop {
            let mut worked = self.dispatch_completions();
            worked |= self.dispatch_client_events();
            if !worked {
                break;
            }
        }

        if self.resolv_dirty {
            self.resolv_dirty = false;
            if let Err(e) = resolv::update_resolv_conf(self) {
                log::warn!("failed to update {}: {}", self.resolv_conf_path.display(), e);
            }
        }
    }

    fn dispatch_completions(&mut self) -> bool {
        let mut worked = false;
        loop {
            let Some(completion) = self.rtnl.take_completion() else {
                break;
            };
            worked = true;

            let Some(link) = self.links.get_mut(&u64::from(completion.ifindex)) else {
                log::debug!("completion for unknown link index {}", completion.ifindex);
                continue;
            };
            let mut ctx = LinkContext {
                rtnl: &mut self.rtnl,
                hostname: &self.hostname,
                resolv_dirty: &mut self.resolv_dirty,
            };
            link.handle_completion(&mut ctx, &completion);
        }
        worked
    }

    fn dispatch_client_events(&mut self) -> bool {
        let mut worked = false;
        let ifindexes: Vec<u64> = self.links.keys().copied().collect();

        for ifindex in ifindexes {
            loop {
                let Some(link) = self.links.get_mut(&ifindex) else {
                    break;
                };
                let Some(event) = link.dhcp_client.as_mut().and_then(|c| c.take_event()) else {
                    break;
                };
                worked = true;
                let mut ctx = LinkContext {
                    rtnl: &mut self.rtnl,
                    hostname: &self.hostname,
                    resolv_dirty: &mut self.resolv_dirty,
                };
                link.dhcp_event(&mut ctx, event);
            }

            loop {
                let Some(link) = self.links.get_mut(&ifindex) else {
                    break;
                };
                let Some(event) = link.ipv4ll.as_mut().and_then(|c| c.take_event()) else {
                    break;
                };
                worked = true;
                let mut ctx = LinkContext {
                    rtnl: &mut self.rtnl,
                    hostname: &self.hostname,
                    resolv_dirty: &mut self.resolv_dirty,
                };
                link.ipv4ll_event(&mut ctx, event);
            }
        }
        worked
    }

    /// Persist every managed link's state file.
    pub fn save_all(&self) {
        for link in self.links.values() {
            if link.network.is_some() {
                link.save();
            }
        }
    }

    /// Orderly teardown: stop the sub-protocols, let their loss events
    /// drive the cleanup, then cancel whatever the kernel never answered.
    pub fn shutdown(&mut self) {
        for link in self.links.values_mut() {
            if let Some(ref mut client) = link.dhcp_client {
                client.stop();
            }
            if let Some(ref mut client) = link.ipv4ll {
                client.stop();
            }
        }
        self.process();

        // Execute the teardown requests, then cancel anything still
        // pending; every request gets exactly one completion.
        self.rtnl.process();
        self.rtnl.cancel_pending();
        self.process();

        self.save_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtnl::{IFF_LOWER_UP, IFF_UP, Op};
    use std::fs;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn newlink(ifindex: u32, ifname: &str, flags: u32) -> LinkMessage {
        LinkMessage {
            ifindex,
            ifname: Some(ifname.to_string()),
            mac: Some(MAC),
            mtu: 1500,
            flags,
        }
    }

    fn test_manager() -> (Manager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::with_root(Rtnl::detached(), dir.path());
        (manager, dir)
    }

    #[test]
    fn test_one_link_per_ifindex() {
        let (mut manager, _dir) = test_manager();
        manager.process_link_message(&newlink(3, "eth0", 0));
        manager.process_link_message(&newlink(3, "eth0", IFF_UP));
        assert_eq!(manager.links.len(), 1);
        assert_eq!(manager.links[&3].flags, IFF_UP);
    }

    #[test]
    fn test_unmatched_link_is_tracked_unmanaged() {
        let (mut manager, _dir) = test_manager();
        manager.process_link_message(&newlink(3, "eth0", IFF_UP));

        let link = &manager.links[&3];
        assert!(link.network.is_none());
        assert_eq!(link.state, LinkState::Initializing);
        assert!(manager.rtnl.pending_requests().is_empty());
    }

    #[test]
    fn test_first_matching_profile_wins() {
        let (mut manager, _dir) = test_manager();

        let mut first = Network::with_defaults();
        first.match_name = vec!["eth*".into()];
        first.dhcp = true;
        manager.networks.push(first);

        let mut second = Network::with_defaults();
        second.match_name = vec!["eth0".into()];
        manager.networks.push(second);

        manager.process_link_message(&newlink(3, "eth0", IFF_UP | IFF_LOWER_UP));
        assert!(manager.links[&3].network.as_ref().unwrap().dhcp);
    }

    #[test]
    fn test_mac_match_requires_known_mac() {
        let (mut manager, _dir) = test_manager();

        let mut network = Network::with_defaults();
        network.match_mac = vec!["52:54:00:12:34:56".into()];
        network.dhcp = true;
        manager.networks.push(network);

        let mut msg = newlink(3, "eth0", IFF_UP);
        msg.mac = None;
        manager.process_link_message(&msg);
        assert!(manager.links[&3].network.is_none());

        // Remove and re-add with the MAC present.
        manager.link_removed(3);
        manager.process_link_message(&newlink(3, "eth0", IFF_UP));
        assert!(manager.links[&3].network.is_some());
    }

    #[test]
    fn test_link_removed_forgets_pending_requests() {
        let (mut manager, _dir) = test_manager();
        let mut network = Network::with_defaults();
        network.bridge = Some("br0".into());
        manager.networks.push(network);

        manager.process_link_message(&newlink(3, "eth0", IFF_UP));
        assert_eq!(manager.rtnl.pending_requests().len(), 1);

        manager.link_removed(3);
        assert!(manager.links.is_empty());
        assert!(manager.rtnl.pending_requests().is_empty());
    }

    #[test]
    fn test_completion_for_unknown_link_is_dropped() {
        let (mut manager, _dir) = test_manager();
        manager.rtnl.submit(9, Op::SetMtu(1500));
        manager.rtnl.complete_next(0);
        // Must not panic or loop.
        manager.process();
    }

    #[test]
    fn test_deferred_until_udev_ready() {
        let (mut manager, dir) = test_manager();
        manager.in_container = false;

        let mut network = Network::with_defaults();
        network.dhcp = true;
        manager.networks.push(network);

        manager.process_link_message(&newlink(3, "eth0", IFF_UP | IFF_LOWER_UP));
        assert!(manager.links[&3].network.is_none());

        // udev finishes processing the device.
        let udev_dir = dir.path().join("udev-data");
        fs::create_dir_all(&udev_dir).unwrap();
        fs::write(udev_dir.join("n3"), "E:ID_NET_DRIVER=e1000e\n").unwrap();

        manager.retry_uninitialized();
        let link = &manager.links[&3];
        assert!(link.network.is_some());
        assert!(link.udev_device.is_some());
        assert!(link.dhcp_client.as_ref().is_some_and(|c| c.is_running()));
    }

    #[test]
    fn test_shutdown_cancels_pending() {
        let (mut manager, _dir) = test_manager();
        let mut network = Network::with_defaults();
        network.bridge = Some("br0".into());
        manager.networks.push(network);

        manager.process_link_message(&newlink(3, "eth0", IFF_UP));
        assert!(!manager.rtnl.pending_requests().is_empty());

        manager.shutdown();
        assert!(manager.rtnl.pending_requests().is_empty());
        assert!(manager.rtnl.take_completion().is_none());
    }
}
