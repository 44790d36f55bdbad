//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::HELLO_HOLDTIME_FOREVER;
use crate::debug::Debug;
use crate::instance::ProtocolInputChannelsTx;
use crate::join_prune::JpAgg;
use crate::mre::MreKind;
use crate::mrt::MreId;
use crate::packet::hello::HelloMsg;
use crate::tasks::{self, TimeoutTask};

// Neighbors are keyed by (interface, primary address).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NeighborKey {
    pub ifindex: u32,
    pub addr: Ipv4Addr,
}

pub type Neighbors = BTreeMap<NeighborKey, Neighbor>;

// A PIM neighbor, built from its Hello messages.
#[derive(Debug)]
pub struct Neighbor {
    pub ifindex: u32,
    pub addr: Ipv4Addr,
    // Options from the most recent Hello. An option a Hello stops
    // carrying is reset, not remembered.
    pub hello_holdtime: u16,
    pub genid: Option<u32>,
    pub dr_priority: Option<u32>,
    pub lan_prune_delay: Option<crate::packet::hello::LanPruneDelayOption>,
    pub addr_list: Vec<Ipv4Addr>,
    // Created from a Join/Prune or Assert rather than a Hello.
    pub is_nohello: bool,
    pub created: DateTime<Utc>,
    // Liveness; absent when the announced holdtime is infinite.
    pub liveness_timer: Option<TimeoutTask>,

    // Pending Join/Prune state toward this neighbor and its flush
    // debounce.
    pub jp: JpAgg,
    pub jp_send_timer: Option<TimeoutTask>,

    // Weak back-references to the entries whose RPF fields point here,
    // one list per entry kind, with side lists spliced off while a
    // neighbor-wide recomputation drains them.
    lists: [Vec<MreId>; 4],
    processing_lists: [Vec<MreId>; 4],
}

// What a processed Hello changed.
#[derive(Debug, Default)]
pub struct HelloChanges {
    pub genid_changed: bool,
    pub dr_election_needed: bool,
    // Holdtime zero: the neighbor asked to be expired at once.
    pub expired: bool,
}

// ===== impl NeighborKey =====

impl std::fmt::Display for NeighborKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%{}", self.addr, self.ifindex)
    }
}

// ===== impl Neighbor =====

impl Neighbor {
    pub(crate) fn new(ifindex: u32, addr: Ipv4Addr) -> Neighbor {
        Debug::NbrCreate(&NeighborKey { ifindex, addr }).log();

        Neighbor {
            ifindex,
            addr,
            hello_holdtime: 0,
            genid: None,
            dr_priority: None,
            lan_prune_delay: None,
            addr_list: Default::default(),
            is_nohello: false,
            created: Utc::now(),
            liveness_timer: None,
            jp: Default::default(),
            jp_send_timer: None,
            lists: Default::default(),
            processing_lists: Default::default(),
        }
    }

    pub(crate) fn key(&self) -> NeighborKey {
        NeighborKey {
            ifindex: self.ifindex,
            addr: self.addr,
        }
    }

    // Applies a received Hello: all options are re-learned, the liveness
    // timer restarts from the announced holdtime.
    pub(crate) fn process_hello(
        &mut self,
        hello: &HelloMsg,
        default_holdtime: u16,
        tx: &ProtocolInputChannelsTx,
    ) -> HelloChanges {
        let mut changes = HelloChanges::default();

        let holdtime = hello.holdtime.unwrap_or(default_holdtime);
        self.hello_holdtime = holdtime;
        match holdtime {
            0 => {
                changes.expired = true;
                return changes;
            }
            HELLO_HOLDTIME_FOREVER => {
                self.liveness_timer = None;
            }
            _ => {
                self.liveness_timer = Some(tasks::nbr_timeout(
                    self.key(),
                    Duration::from_secs(holdtime.into()),
                    &tx.nbr_timeout,
                ));
            }
        }

        if self.genid.is_some()
            && hello.genid.is_some()
            && self.genid != hello.genid
        {
            Debug::NbrGenIdChange(&self.key()).log();
            changes.genid_changed = true;
        }
        self.genid = hello.genid;

        if self.dr_priority != hello.dr_priority {
            changes.dr_election_needed = true;
        }
        self.dr_priority = hello.dr_priority;

        // Retracting tracking support after announcing it is a policy
        // violation: the offending option is ignored, the neighbor kept.
        match (&self.lan_prune_delay, &hello.lan_prune_delay) {
            (Some(old), Some(new)) if old.t_bit && !new.t_bit => (),
            _ => self.lan_prune_delay = hello.lan_prune_delay,
        }
        self.addr_list = hello.addr_list.clone();
        self.is_nohello = false;

        changes
    }

    // ===== dependent-MRE bookkeeping =====
    //
    // An entry appears at most once across the active and processing
    // lists of its kind, no matter how many of its RPF fields reference
    // this neighbor.

    fn list_index(kind: MreKind) -> usize {
        match kind {
            MreKind::Rp => 0,
            MreKind::Wc => 1,
            MreKind::Sg => 2,
            MreKind::SgRpt => 3,
        }
    }

    pub(crate) fn attach_mre(&mut self, kind: MreKind, id: MreId) {
        let i = Self::list_index(kind);
        if !self.lists[i].contains(&id)
            && !self.processing_lists[i].contains(&id)
        {
            self.lists[i].push(id);
        }
    }

    pub(crate) fn detach_mre(&mut self, kind: MreKind, id: MreId) {
        let i = Self::list_index(kind);
        if let Some(pos) = self.lists[i].iter().position(|e| *e == id) {
            self.lists[i].swap_remove(pos);
            return;
        }
        if let Some(pos) =
            self.processing_lists[i].iter().position(|e| *e == id)
        {
            self.processing_lists[i].swap_remove(pos);
            return;
        }
        // A detach with no matching attach means the dependent lists are
        // corrupt; continuing would forward on stale state.
        panic!(
            "dependent-entry reference underflow: neighbor {} entry {}",
            self.key(),
            id,
        );
    }

    // How many times an entry appears across the dependent lists; must
    // never exceed one.
    #[cfg(feature = "testing")]
    pub fn attached_count(&self, kind: MreKind, id: MreId) -> usize {
        let i = Self::list_index(kind);
        self.lists[i].iter().filter(|e| **e == id).count()
            + self.processing_lists[i].iter().filter(|e| **e == id).count()
    }

    // Splices the active lists onto the processing side, so mutations
    // made while a neighbor-wide walk runs don't re-enter the walk.
    pub(crate) fn start_processing(&mut self) -> Vec<MreId> {
        let mut drained = Vec::new();
        for i in 0..4 {
            let list = std::mem::take(&mut self.lists[i]);
            self.processing_lists[i].extend(list.iter().copied());
            drained.extend(list);
        }
        drained
    }

    pub(crate) fn finish_processing(&mut self, kind: MreKind, id: MreId) {
        let i = Self::list_index(kind);
        self.processing_lists[i].retain(|e| *e != id);
    }

    pub(crate) fn dependent_ids(&self) -> Vec<MreId> {
        self.lists
            .iter()
            .chain(self.processing_lists.iter())
            .flatten()
            .copied()
            .collect()
    }

    pub(crate) fn has_dependents(&self) -> bool {
        self.lists.iter().any(|l| !l.is_empty())
            || self.processing_lists.iter().any(|l| !l.is_empty())
    }

}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;

    #[test]
    fn test_attach_is_idempotent() {
        let mut nbr = Neighbor::new(1, ip4!("10.0.0.2"));
        nbr.attach_mre(MreKind::Sg, 7);
        nbr.attach_mre(MreKind::Sg, 7);
        assert_eq!(nbr.dependent_ids(), vec![7]);

        nbr.detach_mre(MreKind::Sg, 7);
        assert!(!nbr.has_dependents());
    }

    #[test]
    fn test_attach_survives_splice() {
        let mut nbr = Neighbor::new(1, ip4!("10.0.0.2"));
        nbr.attach_mre(MreKind::Wc, 3);

        let drained = nbr.start_processing();
        assert_eq!(drained, vec![3]);

        // Still attached (on the processing side), so re-attaching is a
        // no-op and the entry stays unique.
        nbr.attach_mre(MreKind::Wc, 3);
        assert_eq!(nbr.dependent_ids(), vec![3]);

        nbr.finish_processing(MreKind::Wc, 3);
        assert!(!nbr.has_dependents());
    }

    #[test]
    #[should_panic(expected = "reference underflow")]
    fn test_detach_underflow_panics() {
        let mut nbr = Neighbor::new(1, ip4!("10.0.0.2"));
        nbr.detach_mre(MreKind::Sg, 99);
    }
}
