//! Virtual network device parents (bridge, bond, vlan, macvlan).
//!
//! A link's profile may name virtual devices the interface should be
//! enslaved to. The devices themselves are created elsewhere (or already
//! exist); here we only describe them and resolve their kernel index for
//! the RTM_SETLINK IFLA_MASTER request.

use std::ffi::CString;
use std::fmt;

/// Kind of virtual parent device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetDevKind {
    Bridge,
    Bond,
    Vlan,
    Macvlan,
}

impl fmt::Display for NetDevKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Bond => write!(f, "bond"),
            Self::Vlan => write!(f, "vlan"),
            Self::Macvlan => write!(f, "macvlan"),
        }
    }
}

/// A named virtual parent device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetDev {
    pub name: String,
    pub kind: NetDevKind,
}

impl NetDev {
    pub fn new(name: &str, kind: NetDevKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }

    /// Kernel interface index of this device, if it exists.
    pub fn resolve_ifindex(&self) -> Option<u32> {
        let cname = CString::new(self.name.as_str()).ok()?;
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 { None } else { Some(index) }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
