use std::net::Ipv4Addr;

use crate::interface_address::InterfaceAddress;

/// Enumerates candidate superior addresses inside a subnet. Host indices
/// form a rooted tree of branching factor `fanout` laid out in level
/// order: index 1 is the root, its children are 2..=fanout+1, and so on.
///
/// A node only probes positions that precede its own: first its ancestor
/// chain (nearest first), then every remaining lower index in level order.
/// The first usable address therefore never probes anyone and anchors the
/// tree.
pub struct TreeHierarchyIterator {
    candidates: std::vec::IntoIter<u32>,
    interface_address: InterfaceAddress,
}

fn parent_index(index: u32, fanout: u32) -> u32 {
    debug_assert!(index >= 2);
    (index - 2) / fanout + 1
}

impl TreeHierarchyIterator {
    pub fn new(interface_address: InterfaceAddress, fanout: u32) -> TreeHierarchyIterator {
        let fanout = fanout.max(1);
        let own = interface_address.position();
        let mut order = Vec::new();
        if own >= 2 && own <= interface_address.num_hosts() {
            // Ancestors, nearest first.
            let mut i = own;
            while i >= 2 {
                i = parent_index(i, fanout);
                order.push(i);
            }
            // Then everyone else below us, in level order.
            for i in 1..own {
                if !order.contains(&i) {
                    order.push(i);
                }
            }
        }
        TreeHierarchyIterator {
            candidates: order.into_iter(),
            interface_address,
        }
    }
}

impl Iterator for TreeHierarchyIterator {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let ifaddr = self.interface_address;
        self.candidates.find_map(|i| ifaddr.address_at(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(addr: &str, fanout: u32) -> Vec<Ipv4Addr> {
        TreeHierarchyIterator::new(addr.parse().unwrap(), fanout).collect()
    }

    #[test]
    fn the_root_probes_nobody() {
        assert!(candidates("10.0.0.1/24", 2).is_empty());
    }

    #[test]
    fn second_node_probes_the_root() {
        assert_eq!(candidates("10.0.0.2/24", 2), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[test]
    fn fourth_node_prefers_its_tree_parent() {
        // With fanout 2 the parent of index 4 is index 2; the root comes
        // next, then the remaining lower index.
        assert_eq!(
            candidates("10.0.0.4/24", 2),
            vec![
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 3),
            ]
        );
    }

    #[test]
    fn wide_fanout_collapses_to_the_root() {
        assert_eq!(
            candidates("10.0.0.7/24", 10000),
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 4),
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(10, 0, 0, 6),
            ]
        );
    }

    #[test]
    fn candidates_never_include_self_or_higher() {
        let own = Ipv4Addr::new(192, 168, 1, 9);
        for addr in candidates("192.168.1.9/28", 3) {
            assert_ne!(addr, own);
            assert!(u32::from(addr) < u32::from(own));
        }
    }
}
