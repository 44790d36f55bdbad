//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use prefix_trie::PrefixMap;
use serde::{Deserialize, Serialize};

// A candidate RP for a range of multicast groups, as learned from the
// elected RP-set (Bootstrap consumer) or static configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RpCandidate {
    pub rp_addr: Ipv4Addr,
    // Smaller is better, per the Bootstrap convention.
    pub priority: u8,
}

// The group-to-RP mapping table. Only consumes elected RP-set
// information; the Bootstrap election itself happens elsewhere.
#[derive(Debug, Default)]
pub struct RpTable {
    table: PrefixMap<Ipv4Network, Vec<RpCandidate>>,
    changed: bool,
}

// ===== impl RpTable =====

impl RpTable {
    // Adds or updates a candidate RP for a group prefix.
    pub(crate) fn add(
        &mut self,
        prefix: Ipv4Network,
        rp_addr: Ipv4Addr,
        priority: u8,
    ) {
        if self.table.get(&prefix).is_none() {
            self.table.insert(prefix, Vec::new());
        }
        let candidates = self.table.get_mut(&prefix).unwrap();
        match candidates.iter_mut().find(|c| c.rp_addr == rp_addr) {
            Some(candidate) => {
                if candidate.priority != priority {
                    candidate.priority = priority;
                    self.changed = true;
                }
            }
            None => {
                candidates.push(RpCandidate { rp_addr, priority });
                self.changed = true;
            }
        }
    }

    // Removes a candidate RP from a group prefix.
    pub(crate) fn delete(&mut self, prefix: Ipv4Network, rp_addr: Ipv4Addr) {
        if let Some(candidates) = self.table.get_mut(&prefix) {
            let before = candidates.len();
            candidates.retain(|c| c.rp_addr != rp_addr);
            if candidates.len() != before {
                self.changed = true;
            }
            if candidates.is_empty() {
                self.table.remove(&prefix);
            }
        }
    }

    // Ends an RP-set update. Returns whether anything changed, in which
    // case the per-group RP bindings must be recomputed.
    pub(crate) fn done(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    // Maps a group to its RP: longest matching group prefix, then best
    // priority, ties broken by the numerically-highest RP address.
    pub(crate) fn rp_find(&self, group: Ipv4Addr) -> Option<Ipv4Addr> {
        let prefix = Ipv4Network::new(group, Ipv4Addr::BITS as u8).unwrap();
        let (_, candidates) = self.table.get_lpm(&prefix)?;
        candidates
            .iter()
            .min_by_key(|c| (c.priority, std::cmp::Reverse(c.rp_addr)))
            .map(|c| c.rp_addr)
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::{ip4, net4};

    use super::*;

    #[test]
    fn test_rp_find() {
        let mut rps = RpTable::default();
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.1"), 192);
        rps.add(net4!("239.0.0.0/8"), ip4!("10.0.0.2"), 192);
        assert!(rps.done());

        assert_eq!(rps.rp_find(ip4!("239.1.1.1")), Some(ip4!("10.0.0.2")));
        assert_eq!(rps.rp_find(ip4!("224.1.1.1")), Some(ip4!("10.0.0.1")));
    }

    #[test]
    fn test_priority_and_tie_break() {
        let mut rps = RpTable::default();
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.1"), 192);
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.9"), 10);
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.5"), 10);
        rps.done();

        // Best priority wins; the highest address breaks the tie.
        assert_eq!(rps.rp_find(ip4!("225.0.0.1")), Some(ip4!("10.0.0.9")));
    }

    #[test]
    fn test_delete_and_done() {
        let mut rps = RpTable::default();
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.1"), 192);
        rps.done();

        // No-op updates don't report a change.
        rps.add(net4!("224.0.0.0/4"), ip4!("10.0.0.1"), 192);
        assert!(!rps.done());

        rps.delete(net4!("224.0.0.0/4"), ip4!("10.0.0.1"));
        assert!(rps.done());
        assert_eq!(rps.rp_find(ip4!("239.1.1.1")), None);
    }
}
