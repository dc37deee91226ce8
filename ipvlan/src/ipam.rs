//! Address allocation within the container subnet.

use std::{collections::BTreeSet, net::Ipv4Addr};

use crate::subnet::Subnet;

/// Errors returned by the [`IpAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpamError {
    #[error("no free address left in {0}")]
    Exhausted(Subnet),
    #[error("address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),
    #[error("address {ip} is not a host address of {subnet}")]
    OutOfRange { ip: Ipv4Addr, subnet: Subnet },
    #[error("address {0} is not allocated")]
    NotAllocated(Ipv4Addr),
}

/// Hands out host addresses of a single subnet.
///
/// Addresses are handed out in order, starting after the most recently allocated one and
/// wrapping around at the end of the subnet. Released addresses are therefore only reused once
/// the rest of the subnet has been cycled through.
#[derive(Debug)]
pub struct IpAllocator {
    subnet: Subnet,
    first: u32,
    last: u32,
    allocated: BTreeSet<u32>,
    cursor: Option<u32>,
}

impl IpAllocator {
    /// Create an allocator for the host addresses of `subnet`.
    pub fn new(subnet: Subnet) -> Self {
        let subnet = subnet.trunc();
        Self {
            subnet,
            first: u32::from(subnet.first_host()),
            last: u32::from(subnet.last_host()),
            allocated: BTreeSet::new(),
            cursor: None,
        }
    }

    /// The subnet this allocator hands out addresses from.
    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Amount of addresses currently allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }

    /// Allocate the next free address.
    pub fn request(&mut self) -> Result<Ipv4Addr, IpamError> {
        let size = u64::from(self.last - self.first) + 1;
        if self.allocated.len() as u64 >= size {
            return Err(IpamError::Exhausted(self.subnet));
        }

        let start = match self.cursor {
            Some(cursor) if cursor < self.last => cursor + 1,
            _ => self.first,
        };

        // There is at least one free address, so this terminates within one pass.
        let free = self
            .allocated
            .range(start..=self.last)
            .chain(self.allocated.range(self.first..start))
            .try_fold(start, |candidate, &taken| {
                if taken == candidate {
                    Ok(if candidate == self.last {
                        self.first
                    } else {
                        candidate + 1
                    })
                } else {
                    Err(candidate)
                }
            })
            .unwrap_or_else(|candidate| candidate);

        self.allocated.insert(free);
        self.cursor = Some(free);
        Ok(Ipv4Addr::from(free))
    }

    /// Allocate a specific address.
    pub fn request_specific(&mut self, ip: Ipv4Addr) -> Result<Ipv4Addr, IpamError> {
        let raw = u32::from(ip);
        if raw < self.first || raw > self.last {
            return Err(IpamError::OutOfRange {
                ip,
                subnet: self.subnet,
            });
        }
        if !self.allocated.insert(raw) {
            return Err(IpamError::AlreadyAllocated(ip));
        }
        Ok(ip)
    }

    /// Release a previously allocated address so it can be handed out again.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), IpamError> {
        if self.allocated.remove(&u32::from(ip)) {
            Ok(())
        } else {
            Err(IpamError::NotAllocated(ip))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::Ipv4Addr};

    use super::{IpAllocator, IpamError};

    fn allocator(subnet: &str) -> IpAllocator {
        IpAllocator::new(subnet.parse().unwrap())
    }

    #[test]
    fn hands_out_distinct_host_addresses() {
        let mut ipam = allocator("10.0.0.0/28");
        let mut seen = HashSet::new();
        for _ in 0..14 {
            let ip = ipam.request().unwrap();
            assert!(ipam.subnet().contains_ip(ip));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 0));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 0, 15));
            assert!(seen.insert(ip));
        }
        assert_eq!(
            ipam.request(),
            Err(IpamError::Exhausted("10.0.0.0/28".parse().unwrap()))
        );
    }

    #[test]
    fn released_addresses_are_reused_after_wrapping() {
        let mut ipam = allocator("10.0.0.0/29");
        let first = ipam.request().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 1));
        let second = ipam.request().unwrap();
        ipam.release(first).unwrap();

        // The cursor moves on before reusing the released address.
        assert_eq!(ipam.request().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_ne!(second, first);
        for _ in 0..3 {
            ipam.request().unwrap();
        }
        assert_eq!(ipam.request().unwrap(), first);
        assert!(ipam.request().is_err());
    }

    #[test]
    fn skips_specific_reservations() {
        let mut ipam = allocator("192.168.1.0/24");
        ipam.request_specific(Ipv4Addr::new(192, 168, 1, 1))
            .unwrap();
        assert_eq!(ipam.request().unwrap(), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(
            ipam.request_specific(Ipv4Addr::new(192, 168, 1, 2)),
            Err(IpamError::AlreadyAllocated(Ipv4Addr::new(192, 168, 1, 2)))
        );
        assert!(matches!(
            ipam.request_specific(Ipv4Addr::new(192, 168, 1, 255)),
            Err(IpamError::OutOfRange { .. })
        ));
        assert!(matches!(
            ipam.request_specific(Ipv4Addr::new(10, 0, 0, 1)),
            Err(IpamError::OutOfRange { .. })
        ));
    }

    #[test]
    fn release_unknown_address() {
        let mut ipam = allocator("192.168.1.0/24");
        assert_eq!(
            ipam.release(Ipv4Addr::new(192, 168, 1, 9)),
            Err(IpamError::NotAllocated(Ipv4Addr::new(192, 168, 1, 9)))
        );
    }

    #[test]
    fn point_to_point_subnet() {
        let mut ipam = allocator("10.1.1.0/31");
        assert_eq!(ipam.request().unwrap(), Ipv4Addr::new(10, 1, 1, 0));
        assert_eq!(ipam.request().unwrap(), Ipv4Addr::new(10, 1, 1, 1));
        assert!(ipam.request().is_err());
        assert_eq!(ipam.allocated(), 2);
    }
}
