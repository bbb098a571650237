use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;
use crate::interface_address::InterfaceAddress;
use crate::kernel_buffer::KernelBuffer;
use crate::socket_address::SocketAddress;

/// One peer in the discovered tree: its address and the recursive size of
/// the subtree behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HierarchyNode {
    socket_address: SocketAddress,
    weight: u32,
}

impl HierarchyNode {
    pub fn new(socket_address: SocketAddress) -> HierarchyNode {
        HierarchyNode {
            socket_address,
            weight: 1,
        }
    }

    pub fn with_weight(socket_address: SocketAddress, weight: u32) -> HierarchyNode {
        HierarchyNode {
            socket_address,
            weight,
        }
    }

    pub fn socket_address(&self) -> &SocketAddress {
        &self.socket_address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn set_weight(&mut self, rhs: u32) {
        self.weight = rhs;
    }

    pub fn write(&self, out: &mut KernelBuffer) {
        out.write_socket_address(&self.socket_address);
        out.write_u32(self.weight);
    }

    pub fn read(input: &mut KernelBuffer) -> Result<HierarchyNode> {
        let socket_address = input.read_socket_address()?;
        let weight = input.read_u32()?;
        Ok(HierarchyNode {
            socket_address,
            weight,
        })
    }
}

impl fmt::Display for HierarchyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.socket_address, self.weight)
    }
}

/// This node's view of the overlay on one interface: an optional superior
/// and a set of subordinates. A peer is never superior and subordinate at
/// the same time, and this node never subordinates itself.
pub struct Hierarchy {
    interface_address: InterfaceAddress,
    socket_address: SocketAddress,
    principal: Option<HierarchyNode>,
    subordinates: HashMap<SocketAddress, HierarchyNode>,
}

impl Hierarchy {
    pub fn new(interface_address: InterfaceAddress, port: u16) -> Hierarchy {
        Hierarchy {
            interface_address,
            socket_address: SocketAddress::new_ipv4(interface_address.address(), port),
            principal: None,
            subordinates: HashMap::new(),
        }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.interface_address
    }

    pub fn socket_address(&self) -> &SocketAddress {
        &self.socket_address
    }

    pub fn principal(&self) -> Option<&HierarchyNode> {
        self.principal.as_ref()
    }

    pub fn has_principal(&self) -> bool {
        self.principal.is_some()
    }

    pub fn is_principal(&self, addr: &SocketAddress) -> bool {
        self.principal
            .as_ref()
            .map(|p| p.socket_address() == addr)
            .unwrap_or(false)
    }

    pub fn set_principal(&mut self, addr: SocketAddress) {
        self.subordinates.remove(&addr);
        self.principal = Some(HierarchyNode::new(addr));
    }

    pub fn unset_principal(&mut self) {
        self.principal = None;
    }

    pub fn add_subordinate(&mut self, addr: SocketAddress) -> bool {
        if addr == self.socket_address || self.is_principal(&addr) {
            return false;
        }
        self.subordinates
            .entry(addr.clone())
            .or_insert_with(|| HierarchyNode::new(addr));
        true
    }

    pub fn remove_subordinate(&mut self, addr: &SocketAddress) -> bool {
        self.subordinates.remove(addr).is_some()
    }

    pub fn has_subordinate(&self, addr: &SocketAddress) -> bool {
        self.subordinates.contains_key(addr)
    }

    pub fn num_subordinates(&self) -> usize {
        self.subordinates.len()
    }

    pub fn subordinates(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.subordinates.values()
    }

    pub fn set_subordinate_weight(&mut self, addr: &SocketAddress, weight: u32) -> bool {
        match self.subordinates.get_mut(addr) {
            Some(node) if node.weight() != weight => {
                node.set_weight(weight);
                true
            }
            _ => false,
        }
    }

    pub fn set_principal_weight(&mut self, weight: u32) -> bool {
        match &mut self.principal {
            Some(node) if node.weight() != weight => {
                node.set_weight(weight);
                true
            }
            _ => false,
        }
    }

    /// This node's own weight: itself plus everything behind its
    /// subordinates.
    pub fn total_weight(&self) -> u32 {
        1 + self.total_subordinate_weight()
    }

    pub fn total_subordinate_weight(&self) -> u32 {
        self.subordinates.values().map(|n| n.weight()).sum()
    }

    pub fn principal_weight(&self) -> u32 {
        self.principal.as_ref().map(|n| n.weight()).unwrap_or(0)
    }

    fn cache_filename(&self, directory: &Path) -> PathBuf {
        directory.join(format!("{}.cache", self.interface_address.address()))
    }

    /// Persist the current shape so the node can rejoin after a restart:
    /// the principal's address on the first line, one subordinate per
    /// subsequent line.
    pub fn write_cache(&self, directory: &Path) -> Result<()> {
        let path = self.cache_filename(directory);
        let mut out = std::fs::File::create(&path)?;
        match &self.principal {
            Some(p) => writeln!(out, "{}", p.socket_address())?,
            None => writeln!(out, "*")?,
        }
        let mut addrs: Vec<String> = self
            .subordinates
            .keys()
            .map(|a| a.to_string())
            .collect();
        addrs.sort();
        for addr in addrs {
            writeln!(out, "{}", addr)?;
        }
        debug!("hierarchy: wrote cache {:?}", path);
        Ok(())
    }

    /// Load a previously cached shape. Returns the cached principal, if
    /// any; cached subordinates are re-added to the set.
    pub fn read_cache(&mut self, directory: &Path) -> Result<Option<SocketAddress>> {
        let path = self.cache_filename(directory);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut lines = std::io::BufReader::new(file).lines();
        let principal = match lines.next() {
            Some(line) => {
                let line = line?;
                match line.trim().parse::<SocketAddress>() {
                    Ok(SocketAddress::Unspecified) | Err(_) => None,
                    Ok(addr) => Some(addr),
                }
            }
            None => None,
        };
        for line in lines {
            if let Ok(addr) = line?.trim().parse::<SocketAddress>() {
                if addr.is_set() {
                    self.add_subordinate(addr);
                }
            }
        }
        debug!("hierarchy: read cache {:?}", path);
        Ok(principal)
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: principal ", self.interface_address)?;
        match &self.principal {
            Some(p) => write!(f, "{}", p)?,
            None => write!(f, "-")?,
        }
        write!(f, ", subordinates")?;
        for s in self.subordinates.values() {
            write!(f, " {}", s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn hierarchy() -> Hierarchy {
        Hierarchy::new("10.0.0.1/24".parse().unwrap(), 33333)
    }

    fn addr(n: u8) -> SocketAddress {
        SocketAddress::new_ipv4(Ipv4Addr::new(10, 0, 0, n), 33333)
    }

    #[test]
    fn own_address_is_never_a_subordinate() {
        let mut h = hierarchy();
        assert!(!h.add_subordinate(addr(1)));
        assert_eq!(h.num_subordinates(), 0);
    }

    #[test]
    fn principal_and_subordinate_are_exclusive() {
        let mut h = hierarchy();
        assert!(h.add_subordinate(addr(2)));
        h.set_principal(addr(2));
        assert!(!h.has_subordinate(&addr(2)));
        // And while 2 is principal, it cannot become a subordinate.
        assert!(!h.add_subordinate(addr(2)));
    }

    #[test]
    fn weights_accumulate() {
        let mut h = hierarchy();
        h.add_subordinate(addr(2));
        h.add_subordinate(addr(3));
        assert_eq!(h.total_weight(), 3);
        assert!(h.set_subordinate_weight(&addr(2), 2));
        assert_eq!(h.total_weight(), 4);
        // Setting the same weight again reports no change.
        assert!(!h.set_subordinate_weight(&addr(2), 2));
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = hierarchy();
        h.set_principal(addr(9));
        h.add_subordinate(addr(2));
        h.add_subordinate(addr(3));
        h.write_cache(dir.path()).unwrap();
        let mut h2 = hierarchy();
        let principal = h2.read_cache(dir.path()).unwrap();
        assert_eq!(principal, Some(addr(9)));
        assert!(h2.has_subordinate(&addr(2)));
        assert!(h2.has_subordinate(&addr(3)));
    }

    #[test]
    fn cache_without_principal() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = hierarchy();
        h.add_subordinate(addr(2));
        h.write_cache(dir.path()).unwrap();
        let mut h2 = hierarchy();
        assert_eq!(h2.read_cache(dir.path()).unwrap(), None);
        assert!(h2.has_subordinate(&addr(2)));
    }

    #[test]
    fn missing_cache_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = hierarchy();
        assert_eq!(h.read_cache(dir.path()).unwrap(), None);
    }
}
