//! resolv.conf generation.
//!
//! DNS servers come from two places: static `DNS=` entries in a profile
//! and DHCP leases on links whose profile sets `UseDNS=`. The file is
//! regenerated from all links at once and only rewritten when its content
//! actually changed, so repeated lease events stay cheap.

use std::fs;
use std::io;
use std::net::Ipv4Addr;

use crate::manager::Manager;

/// Rewrite the manager's resolv.conf from the current link state.
pub fn update_resolv_conf(manager: &Manager) -> io::Result<()> {
    let path = &manager.resolv_conf_path;

    let mut servers: Vec<Ipv4Addr> = Vec::new();
    let mut add = |addr: Ipv4Addr, servers: &mut Vec<Ipv4Addr>| {
        if !servers.contains(&addr) {
            servers.push(addr);
        }
    };

    for link in manager.links.values() {
        let Some(ref network) = link.network else {
            continue;
        };
        for dns in &network.dns {
            add(*dns, &mut servers);
        }
        if network.dhcp_dns
            && let Some(ref lease) = link.dhcp_lease
        {
            for dns in &lease.dns_servers {
                add(*dns, &mut servers);
            }
        }
    }

    let mut content = String::from("# Generated by networkd. Do not edit.\n");
    for server in &servers {
        content.push_str(&format!("nameserver {server}\n"));
    }

    // Idempotent: leave an up-to-date file alone.
    if fs::read_to_string(path).is_ok_and(|existing| existing == content) {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
