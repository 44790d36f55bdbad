//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use prefix_trie::PrefixMap;
use serde::{Deserialize, Serialize};

// A single entry of the unicast routing snapshot used for RPF.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MribEntry {
    pub prefix: Ipv4Network,
    pub next_hop: Ipv4Addr,
    pub ifindex: u32,
    pub metric_preference: u32,
    pub metric: u32,
}

// Staged updates of an open MRIB transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MribUpdate {
    Add(MribEntry),
    Delete(Ipv4Network),
}

// The MRIB: a longest-prefix-match snapshot of the unicast routing table,
// fed transactionally by the external route source. Readers always see
// fully-committed transactions.
#[derive(Debug, Default)]
pub struct Mrib {
    table: PrefixMap<Ipv4Network, MribEntry>,
    pending: Vec<MribUpdate>,
}

// ===== impl Mrib =====

impl Mrib {
    // Stages a route addition or replacement.
    pub(crate) fn add(&mut self, entry: MribEntry) {
        self.pending.push(MribUpdate::Add(entry));
    }

    // Stages a route removal.
    pub(crate) fn delete(&mut self, prefix: Ipv4Network) {
        self.pending.push(MribUpdate::Delete(prefix));
    }

    // Ends the transaction. Returns the prefixes whose routing changed,
    // for the RPF recomputation sweep.
    pub(crate) fn commit(&mut self) -> Vec<Ipv4Network> {
        let mut changed = Vec::new();

        for update in std::mem::take(&mut self.pending) {
            match update {
                MribUpdate::Add(entry) => {
                    let prefix = entry.prefix;
                    if self.table.insert(prefix, entry)
                        != Some(entry)
                    {
                        changed.push(prefix);
                    }
                }
                MribUpdate::Delete(prefix) => {
                    if self.table.remove(&prefix).is_some() {
                        changed.push(prefix);
                    }
                }
            }
        }

        changed
    }

    // Longest-prefix-match lookup for a host address.
    pub(crate) fn lookup(&self, addr: Ipv4Addr) -> Option<&MribEntry> {
        let prefix = Ipv4Network::new(addr, Ipv4Addr::BITS as u8).unwrap();
        self.table.get_lpm(&prefix).map(|(_, entry)| entry)
    }

    // Whether an address is covered by any of the given prefixes.
    pub(crate) fn is_covered(
        addr: Ipv4Addr,
        prefixes: &[Ipv4Network],
    ) -> bool {
        prefixes.iter().any(|prefix| prefix.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::{ip4, net4};

    use super::*;

    fn entry(
        prefix: Ipv4Network,
        next_hop: Ipv4Addr,
        ifindex: u32,
    ) -> MribEntry {
        MribEntry {
            prefix,
            next_hop,
            ifindex,
            metric_preference: 110,
            metric: 10,
        }
    }

    #[test]
    fn test_lpm() {
        let mut mrib = Mrib::default();
        mrib.add(entry(net4!("10.0.0.0/8"), ip4!("192.168.1.1"), 1));
        mrib.add(entry(net4!("10.1.0.0/16"), ip4!("192.168.2.1"), 2));
        let changed = mrib.commit();
        assert_eq!(changed.len(), 2);

        // Most specific prefix wins.
        let lpm = mrib.lookup(ip4!("10.1.2.3")).unwrap();
        assert_eq!(lpm.next_hop, ip4!("192.168.2.1"));
        let lpm = mrib.lookup(ip4!("10.2.2.3")).unwrap();
        assert_eq!(lpm.next_hop, ip4!("192.168.1.1"));
        assert!(mrib.lookup(ip4!("11.0.0.1")).is_none());
    }

    #[test]
    fn test_add_delete_restores_lookup() {
        let mut mrib = Mrib::default();
        mrib.add(entry(net4!("10.0.0.0/8"), ip4!("192.168.1.1"), 1));
        mrib.commit();

        let initial = *mrib.lookup(ip4!("10.0.0.5")).unwrap();

        // A more specific route takes over, then goes away.
        mrib.add(entry(net4!("10.0.0.0/24"), ip4!("192.168.3.1"), 3));
        mrib.commit();
        assert_eq!(mrib.lookup(ip4!("10.0.0.5")).unwrap().ifindex, 3);

        mrib.delete(net4!("10.0.0.0/24"));
        let changed = mrib.commit();
        assert_eq!(changed, vec![net4!("10.0.0.0/24")]);
        assert_eq!(*mrib.lookup(ip4!("10.0.0.5")).unwrap(), initial);
    }

    #[test]
    fn test_unchanged_add_is_not_reported() {
        let mut mrib = Mrib::default();
        let e = entry(net4!("10.0.0.0/8"), ip4!("192.168.1.1"), 1);
        mrib.add(e);
        mrib.commit();
        mrib.add(e);
        assert!(mrib.commit().is_empty());
    }

    #[test]
    fn test_is_covered() {
        let prefixes = vec![net4!("10.0.0.0/8"), net4!("172.16.0.0/12")];
        assert!(Mrib::is_covered(ip4!("10.1.1.1"), &prefixes));
        assert!(Mrib::is_covered(ip4!("172.16.5.5"), &prefixes));
        assert!(!Mrib::is_covered(ip4!("192.168.1.1"), &prefixes));
    }
}
