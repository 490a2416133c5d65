//! networkctl — query the status of links managed by networkd.
//!
//! Usage:
//!   networkctl                  # List all links (same as `list`)
//!   networkctl list             # List all links with status
//!   networkctl status [LINK]    # Show detailed status of a link
//!   networkctl --help           # Show help
//!   networkctl --version        # Show version

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const SYS_CLASS_NET: &str = "/sys/class/net";
const LINKS_STATE_DIR: &str = "/run/systemd/network/links";

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("list");

    match command {
        "--help" | "-h" | "help" => print_help(),
        "--version" => print_version(),
        "list" => cmd_list(),
        "status" => cmd_status(args.get(2).map(|s| s.as_str())),
        other => {
            if other.starts_with('-') {
                cmd_list();
            } else {
                eprintln!("Unknown command: {other}");
                eprintln!("Try 'networkctl --help' for more information.");
                std::process::exit(1);
            }
        }
    }
}

fn print_help() {
    println!("networkctl — query the status of network links");
    println!();
    println!("Usage: networkctl [COMMAND] [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  list              List all network links (default)");
    println!("  status [LINK]     Show detailed status of a link or all links");
    println!();
    println!("Options:");
    println!("  -h, --help        Show this help message");
    println!("  --version         Show version information");
}

fn print_version() {
    println!("networkctl {}", env!("CARGO_PKG_VERSION"));
}

// ---------------------------------------------------------------------------
// Link enumeration via sysfs
// ---------------------------------------------------------------------------

/// Basic link information read from `/sys/class/net`.
struct LinkEntry {
    index: u64,
    name: String,
    operstate: String,
    mtu: String,
    mac: String,
}

fn read_sysfs(dir: &Path, name: &str, file: &str) -> String {
    fs::read_to_string(dir.join(name).join(file))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn enumerate_links(sys_dir: &Path) -> Vec<LinkEntry> {
    let mut links = Vec::new();
    let Ok(entries) = fs::read_dir(sys_dir) else {
        return links;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let index: u64 = match read_sysfs(sys_dir, &name, "ifindex").parse() {
            Ok(i) => i,
            Err(_) => continue,
        };
        links.push(LinkEntry {
            index,
            name: name.clone(),
            operstate: read_sysfs(sys_dir, &name, "operstate"),
            mtu: read_sysfs(sys_dir, &name, "mtu"),
            mac: read_sysfs(sys_dir, &name, "address"),
        });
    }

    links.sort_by_key(|l| l.index);
    links
}

// ---------------------------------------------------------------------------
// networkd state files
// ---------------------------------------------------------------------------

/// Parsed per-link state file written by networkd.
#[derive(Debug, Default, PartialEq)]
struct LinkStateFile {
    state: Option<String>,
    dhcp_lease: Option<PathBuf>,
}

impl fmt::Display for LinkStateFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state.as_deref().unwrap_or("unmanaged"))
    }
}

fn parse_state_file(content: &str) -> LinkStateFile {
    let mut parsed = LinkStateFile::default();
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some(("STATE", value)) => parsed.state = Some(value.to_string()),
            Some(("DHCP_LEASE", value)) => parsed.dhcp_lease = Some(PathBuf::from(value)),
            _ => {}
        }
    }
    parsed
}

fn read_link_state(state_dir: &Path, index: u64) -> LinkStateFile {
    match fs::read_to_string(state_dir.join(index.to_string())) {
        Ok(content) => parse_state_file(&content),
        Err(_) => LinkStateFile::default(),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list() {
    let links = enumerate_links(Path::new(SYS_CLASS_NET));

    println!("{:>3} {:<16} {:<12} {:<10}", "IDX", "LINK", "SETUP", "OPERATIONAL");
    for link in &links {
        let state = read_link_state(Path::new(LINKS_STATE_DIR), link.index);
        println!(
            "{:>3} {:<16} {:<12} {:<10}",
            link.index, link.name, state, link.operstate
        );
    }
    println!();
    println!("{} links listed.", links.len());
}

fn cmd_status(name: Option<&str>) {
    let links = enumerate_links(Path::new(SYS_CLASS_NET));

    for link in &links {
        if let Some(wanted) = name
            && link.name != wanted
        {
            continue;
        }

        let state = read_link_state(Path::new(LINKS_STATE_DIR), link.index);
        println!("● {} (index {})", link.name, link.index);
        println!("       Setup State: {state}");
        println!(" Operational State: {}", link.operstate);
        if !link.mac.is_empty() {
            println!("        HW Address: {}", link.mac);
        }
        if !link.mtu.is_empty() {
            println!("               MTU: {}", link.mtu);
        }
        if let Some(ref lease_path) = state.dhcp_lease
            && let Ok(lease) = fs::read_to_string(lease_path)
        {
            for line in lease.lines() {
                if let Some(("ADDRESS", value)) = line.split_once('=') {
                    println!("      DHCP Address: {value}");
                }
                if let Some(("ROUTER", value)) = line.split_once('=') {
                    println!("           Gateway: {value}");
                }
                if let Some(("DNS", value)) = line.split_once('=') {
                    println!("               DNS: {value}");
                }
            }
        }
        println!();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_file_configured_with_lease() {
        let parsed = parse_state_file(
            "# This is private data. Do not parse.\n\
             STATE=configured\n\
             DHCP_LEASE=/run/systemd/network/leases/2\n",
        );
        assert_eq!(parsed.state.as_deref(), Some("configured"));
        assert_eq!(
            parsed.dhcp_lease.as_deref(),
            Some(Path::new("/run/systemd/network/leases/2"))
        );
        assert_eq!(parsed.to_string(), "configured");
    }

    #[test]
    fn test_parse_state_file_no_lease() {
        let parsed = parse_state_file("STATE=configuring\n");
        assert_eq!(parsed.state.as_deref(), Some("configuring"));
        assert!(parsed.dhcp_lease.is_none());
    }

    #[test]
    fn test_parse_state_file_empty() {
        let parsed = parse_state_file("");
        assert_eq!(parsed, LinkStateFile::default());
        assert_eq!(parsed.to_string(), "unmanaged");
    }

    #[test]
    fn test_read_link_state_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_link_state(dir.path(), 42);
        assert!(parsed.state.is_none());
    }

    #[test]
    fn test_enumerate_links_from_fake_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let eth0 = dir.path().join("eth0");
        fs::create_dir_all(&eth0).unwrap();
        fs::write(eth0.join("ifindex"), "2\n").unwrap();
        fs::write(eth0.join("operstate"), "up\n").unwrap();
        fs::write(eth0.join("mtu"), "1500\n").unwrap();
        fs::write(eth0.join("address"), "52:54:00:12:34:56\n").unwrap();

        // A directory without an ifindex is skipped.
        fs::create_dir_all(dir.path().join("bonding_masters")).unwrap();

        let links = enumerate_links(dir.path());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].index, 2);
        assert_eq!(links[0].name, "eth0");
        assert_eq!(links[0].operstate, "up");
        assert_eq!(links[0].mac, "52:54:00:12:34:56");
    }
}
