//! Container endpoints managed by the driver.

use core::fmt;
use std::net::Ipv4Addr;

/// Locally administered prefix of every endpoint MAC address.
pub const MAC_PREFIX: [u8; 2] = [0x7a, 0x42];

/// Amount of characters of the endpoint id used as name of the endpoint link.
pub const LINK_NAME_LEN: usize = 5;

/// A 6 byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Derive the MAC address of an endpoint from its IPv4 address.
    ///
    /// # Examples
    ///
    /// ```
    /// use ipvlan::endpoint::MacAddr;
    /// use std::net::Ipv4Addr;
    ///
    /// let mac = MacAddr::from_ipv4(Ipv4Addr::new(192, 168, 1, 2));
    ///
    /// assert_eq!(mac.to_string(), "7a:42:c0:a8:01:02");
    /// ```
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        MacAddr([MAC_PREFIX[0], MAC_PREFIX[1], a, b, c, d])
    }

    /// The raw bytes of this address.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Name of the host link backing the endpoint with the given id.
pub fn link_name(endpoint_id: &str) -> String {
    endpoint_id.chars().take(LINK_NAME_LEN).collect()
}

/// Lifecycle of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// An address has been assigned, no link exists yet.
    Allocated,
    /// The endpoint link has been created.
    Joined,
    /// The container left, the link is kept until the endpoint is deleted.
    Left,
}

/// An endpoint known to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub address: Ipv4Addr,
    pub mac: MacAddr,
    pub state: EndpointState,
}

impl Endpoint {
    /// Create a new endpoint with the given address.
    pub fn new(id: String, address: Ipv4Addr) -> Self {
        Self {
            id,
            address,
            mac: MacAddr::from_ipv4(address),
            state: EndpointState::Allocated,
        }
    }
}
