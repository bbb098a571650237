use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An IPv4 address bound to an interface together with its netmask. The
/// host part indexes this node inside its subnet: host index 1 is the first
/// usable address and serves as the root of the discovery tree.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    address: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl InterfaceAddress {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> InterfaceAddress {
        InterfaceAddress { address, netmask }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }

    fn network(&self) -> u32 {
        u32::from(self.address) & u32::from(self.netmask)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.is_loopback()
    }

    /// A /32 address has no neighbours to discover.
    pub fn is_widearea(&self) -> bool {
        u32::from(self.netmask) == u32::MAX
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == self.network()
    }

    /// 1-based index of this address inside the subnet.
    pub fn position(&self) -> u32 {
        u32::from(self.address).wrapping_sub(self.network())
    }

    /// The address at 1-based host index `index`, or `None` when the index
    /// falls outside the subnet's host range.
    pub fn address_at(&self, index: u32) -> Option<Ipv4Addr> {
        if index == 0 || index >= self.num_hosts() + 1 {
            return None;
        }
        Some(Ipv4Addr::from(self.network() + index))
    }

    /// Number of usable host addresses (network and broadcast excluded).
    pub fn num_hosts(&self) -> u32 {
        let host_bits = 32 - self.prefix_len();
        if host_bits <= 1 {
            0
        } else {
            (1u32 << host_bits) - 2
        }
    }
}

impl Default for InterfaceAddress {
    fn default() -> InterfaceAddress {
        InterfaceAddress::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len())
    }
}

impl fmt::Debug for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Accepts `a.b.c.d/prefix`.
impl FromStr for InterfaceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<InterfaceAddress> {
        let mut parts = s.splitn(2, '/');
        let addr = parts
            .next()
            .unwrap_or("")
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::config(format!("bad interface address {:?}", s)))?;
        let prefix = parts
            .next()
            .ok_or_else(|| Error::config(format!("missing prefix in {:?}", s)))?
            .parse::<u32>()
            .map_err(|_| Error::config(format!("bad prefix in {:?}", s)))?;
        if prefix > 32 {
            return Err(Error::config(format!("bad prefix in {:?}", s)));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Ok(InterfaceAddress::new(addr, Ipv4Addr::from(mask)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_and_index() {
        let ifa: InterfaceAddress = "10.0.0.3/24".parse().unwrap();
        assert_eq!(ifa.position(), 3);
        assert_eq!(ifa.address_at(1), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ifa.address_at(254), Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(ifa.address_at(0), None);
        assert_eq!(ifa.address_at(255), None);
        assert_eq!(ifa.num_hosts(), 254);
    }

    #[test]
    fn membership() {
        let ifa: InterfaceAddress = "192.168.1.17/28".parse().unwrap();
        assert!(ifa.contains(Ipv4Addr::new(192, 168, 1, 30)));
        assert!(!ifa.contains(Ipv4Addr::new(192, 168, 1, 33)));
    }

    #[test]
    fn widearea_and_loopback() {
        assert!("127.0.0.1/8"
            .parse::<InterfaceAddress>()
            .unwrap()
            .is_loopback());
        assert!("10.1.1.1/32".parse::<InterfaceAddress>().unwrap().is_widearea());
    }

    #[test]
    fn display_round_trip() {
        let ifa: InterfaceAddress = "10.0.0.1/16".parse().unwrap();
        assert_eq!(ifa.to_string().parse::<InterfaceAddress>().unwrap(), ifa);
    }
}
