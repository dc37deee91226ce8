//! A dedicated subnet module.
//!
//! The driver only ever deals with a single IPv4 container subnet, and the BGP prefixes learned
//! for other hosts. This type wraps an [`Ipv4Net`] and exposes the handful of operations the
//! address allocator and the route programming need.

use core::fmt;
use std::{net::Ipv4Addr, str::FromStr};

use ipnet::Ipv4Net;

/// Representation of an IPv4 subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    inner: Ipv4Net,
}

/// An error returned when creating a new [`Subnet`] with an invalid prefix length.
///
/// The max prefix length is 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixLenError;

/// An error returned when a string can't be parsed as a [`Subnet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetParseError(String);

impl Subnet {
    /// Create a new `Subnet` from the given [`Ipv4Addr`] and prefix length.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Subnet, PrefixLenError> {
        Ok(Self {
            inner: Ipv4Net::new(addr, prefix_len).map_err(|_| PrefixLenError)?,
        })
    }

    /// Returns the size of the prefix in bits.
    pub fn prefix_len(&self) -> u8 {
        self.inner.prefix_len()
    }

    /// Retuns the address used to construct this `Subnet`.
    pub fn address(&self) -> Ipv4Addr {
        self.inner.addr()
    }

    /// Returns the network part of the `Subnet`. All non prefix bits are set to 0.
    ///
    /// # Examples
    ///
    /// ```
    /// use ipvlan::subnet::Subnet;
    /// use std::net::Ipv4Addr;
    ///
    /// let subnet = Subnet::new(Ipv4Addr::new(10, 1, 2, 3), 8).unwrap();
    ///
    /// assert_eq!(subnet.network(), Ipv4Addr::new(10, 0, 0, 0));
    /// ```
    pub fn network(&self) -> Ipv4Addr {
        self.inner.network()
    }

    /// Returns the broadcast address for the subnet.
    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.inner.broadcast()
    }

    /// Returns this `Subnet` with all host bits cleared.
    pub fn trunc(&self) -> Subnet {
        Subnet {
            inner: self.inner.trunc(),
        }
    }

    /// Checks if this `Subnet` contains the provided [`Ipv4Addr`].
    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.inner.contains(&ip)
    }

    /// The first address in the subnet which can be handed out to a host.
    ///
    /// For regular subnets this is the address following the network address. /31 and /32
    /// subnets don't reserve a network and broadcast address, so every address is usable there.
    ///
    /// # Examples
    ///
    /// ```
    /// use ipvlan::subnet::Subnet;
    /// use std::net::Ipv4Addr;
    ///
    /// let subnet: Subnet = "192.168.1.0/24".parse().unwrap();
    ///
    /// assert_eq!(subnet.first_host(), Ipv4Addr::new(192, 168, 1, 1));
    /// assert_eq!(subnet.last_host(), Ipv4Addr::new(192, 168, 1, 254));
    /// ```
    pub fn first_host(&self) -> Ipv4Addr {
        if self.prefix_len() >= 31 {
            self.network()
        } else {
            Ipv4Addr::from(u32::from(self.network()) + 1)
        }
    }

    /// The last address in the subnet which can be handed out to a host.
    pub fn last_host(&self) -> Ipv4Addr {
        if self.prefix_len() >= 31 {
            self.broadcast_addr()
        } else {
            Ipv4Addr::from(u32::from(self.broadcast_addr()) - 1)
        }
    }
}

impl From<Ipv4Net> for Subnet {
    fn from(inner: Ipv4Net) -> Self {
        Self { inner }
    }
}

impl From<Subnet> for Ipv4Net {
    fn from(subnet: Subnet) -> Self {
        subnet.inner
    }
}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Net>()
            .map(Subnet::from)
            .map_err(|_| SubnetParseError(s.to_string()))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl fmt::Display for PrefixLenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Invalid prefix length for this address")
    }
}

impl std::error::Error for PrefixLenError {}

impl fmt::Display for SubnetParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid IPv4 subnet in CIDR notation", self.0)
    }
}

impl std::error::Error for SubnetParseError {}
