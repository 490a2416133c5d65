//! Route specifications submitted to the kernel.

use std::fmt;
use std::net::Ipv4Addr;

use crate::rtnl::{RT_SCOPE_LINK, RT_SCOPE_UNIVERSE};

/// An IPv4 route specification for one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network; 0.0.0.0 with prefixlen 0 is the default route.
    pub dst: Ipv4Addr,
    /// Destination prefix length.
    pub dst_prefixlen: u8,
    /// Next-hop gateway.
    pub gateway: Option<Ipv4Addr>,
    /// Route metric; 0 leaves the kernel default.
    pub metric: u32,
    /// Route scope (RT_SCOPE_*).
    pub scope: u8,
}

impl Route {
    /// Default route via `gateway`.
    pub fn default_via(gateway: Ipv4Addr) -> Self {
        Self {
            dst: Ipv4Addr::UNSPECIFIED,
            dst_prefixlen: 0,
            gateway: Some(gateway),
            metric: 0,
            scope: RT_SCOPE_UNIVERSE,
        }
    }

    /// Host route to `gateway` itself, link scope. Installed before a
    /// default route whose gateway may lie outside the local subnet.
    pub fn gateway_host(gateway: Ipv4Addr) -> Self {
        Self {
            dst: gateway,
            dst_prefixlen: 32,
            gateway: None,
            metric: 0,
            scope: RT_SCOPE_LINK,
        }
    }

    /// Link-scope catch-all with an explicit metric, as installed for an
    /// IPv4LL-only configuration.
    pub fn link_scope_default(metric: u32) -> Self {
        Self {
            dst: Ipv4Addr::UNSPECIFIED,
            dst_prefixlen: 0,
            gateway: None,
            metric,
            scope: RT_SCOPE_LINK,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dst_prefixlen == 0 {
            write!(f, "default")?;
        } else {
            write!(f, "{}/{}", self.dst, self.dst_prefixlen)?;
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if self.metric != 0 {
            write!(f, " metric {}", self.metric)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_route() {
        let r = Route::default_via(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(r.dst_prefixlen, 0);
        assert_eq!(r.scope, RT_SCOPE_UNIVERSE);
        assert_eq!(r.to_string(), "default via 192.168.1.1");
    }

    #[test]
    fn test_gateway_host_route() {
        let r = Route::gateway_host(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(r.dst_prefixlen, 32);
        assert_eq!(r.gateway, None);
        assert_eq!(r.scope, RT_SCOPE_LINK);
        assert_eq!(r.to_string(), "192.168.1.1/32");
    }

    #[test]
    fn test_link_scope_default() {
        let r = Route::link_scope_default(99);
        assert_eq!(r.dst_prefixlen, 0);
        assert_eq!(r.metric, 99);
        assert_eq!(r.scope, RT_SCOPE_LINK);
        assert_eq!(r.to_string(), "default metric 99");
    }
}
