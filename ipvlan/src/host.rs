//! Access to the networking stack of the host.
//!
//! The driver and the BGP engine never talk to the kernel directly. Everything they need goes
//! through the [`HostNetwork`] trait, which is implemented on top of netlink (and `iptables` for
//! NAT) by [`Netlink`] on linux.

use core::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::subnet::Subnet;

pub mod iptables;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(target_os = "linux")]
pub use linux::Netlink;

/// Errors returned by [`HostNetwork`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("link {0} does not exist")]
    LinkNotFound(String),
    #[cfg(target_os = "linux")]
    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("iptables {args} failed: {output}")]
    Iptables { args: String, output: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Mode of an ipvlan link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVlanMode {
    L2,
    L3,
}

/// Scope of a route installed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    /// Destination is on the host itself.
    Host,
    /// Destination is directly reachable over the link.
    Link,
}

/// Who owns a route installed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Installed by the driver for its own subnet.
    Static,
    /// Learned from the BGP speaker. These routes are tagged so they can be flushed on startup.
    Bgp,
}

/// A route in the main IPv4 routing table of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoute {
    pub destination: Subnet,
    pub gateway: Option<Ipv4Addr>,
    /// Name of the output link.
    pub link: String,
    pub scope: RouteScope,
    pub origin: RouteOrigin,
}

impl HostRoute {
    /// Host scoped route for the local container subnet.
    pub fn subnet(destination: Subnet, link: &str) -> Self {
        Self {
            destination: destination.trunc(),
            gateway: None,
            link: link.to_string(),
            scope: RouteScope::Host,
            origin: RouteOrigin::Static,
        }
    }

    /// Link scoped route for a prefix learned over BGP.
    pub fn learned(destination: Subnet, next_hop: Option<Ipv4Addr>, link: &str) -> Self {
        Self {
            destination: destination.trunc(),
            gateway: next_hop,
            link: link.to_string(),
            scope: RouteScope::Link,
            origin: RouteOrigin::Bgp,
        }
    }
}

impl fmt::Display for HostRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {}", self.link)
    }
}

/// The host networking operations needed by the driver and the routing backends.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Index of the link with the given name.
    async fn link_index(&self, name: &str) -> Result<u32, HostError>;

    /// IPv4 addresses configured on the link with the given name.
    async fn link_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>, HostError>;

    /// Create an ipvlan link on top of `parent`, set its MTU and bring it up.
    async fn create_ipvlan(
        &self,
        name: &str,
        parent: &str,
        mode: IpVlanMode,
        mtu: u32,
    ) -> Result<(), HostError>;

    /// Remove the link with the given name.
    async fn delete_link(&self, name: &str) -> Result<(), HostError>;

    /// Install a route. Installing a route which already exists is not an error.
    async fn add_route(&self, route: &HostRoute) -> Result<(), HostError>;

    /// Remove a route.
    async fn del_route(&self, route: &HostRoute) -> Result<(), HostError>;

    /// Remove all BGP learned routes going out over `link`, returning how many were removed.
    async fn flush_bgp_routes(&self, link: &str) -> Result<usize, HostError>;

    /// Make sure traffic from `subnet` is masqueraded when leaving the host.
    async fn ensure_masquerade(&self, subnet: Subnet) -> Result<(), HostError>;
}
