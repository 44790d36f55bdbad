//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;

use generational_arena::{Arena, Index};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::consts::ALL_MULTICAST_ADDR;
use crate::interface::Interfaces;
use crate::mre::{Mre, MreFlags, MreKind, MreKindMask, assert};
use crate::neighbor::NeighborKey;

pub type MreId = u32;
pub type MreIndex = Index;

// Interfaces processed per deferred-task drain turn; larger tables yield
// back to the event loop between batches.
const TASK_BATCH_SIZE: usize = 64;

// The sentinel interface index of the Register virtual interface. Join
// state on it models the register tunnel without touching the kernel.
pub const REGISTER_VIF_IFINDEX: u32 = u32::MAX;

// Deferred whole-table tasks.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MrtTaskKind {
    // The elected RP-set changed: rebind RP(G) everywhere.
    RpSetChanged,
    // Unicast routing changed for the given prefixes.
    MribChanged(Vec<Ipv4Network>),
    // A neighbor restarted (its GenID changed).
    NbrGenIdChanged(NeighborKey),
    // A neighbor is gone.
    NbrDied(NeighborKey),
}

#[derive(Debug)]
pub struct MrtTask {
    pub kind: MrtTaskKind,
    // Snapshot of the entries to visit; entries created mid-drain are not
    // re-entered.
    pub pending: VecDeque<MreId>,
}

// The multicast routing entry table. Entries live in an arena; the
// per-kind key trees map protocol keys to arena indexes, and stable entry
// ids give the weak references used across the neighbor ⇄ entry cycle.
#[derive(Debug, Default)]
pub struct Mrt {
    arena: Arena<Mre>,
    id_tree: HashMap<MreId, MreIndex>,
    rp_tree: BTreeMap<Ipv4Addr, MreIndex>,
    wc_tree: BTreeMap<Ipv4Addr, MreIndex>,
    sg_tree: BTreeMap<(Ipv4Addr, Ipv4Addr), MreIndex>,
    sg_rpt_tree: BTreeMap<(Ipv4Addr, Ipv4Addr), MreIndex>,
    next_id: MreId,
    tasks: VecDeque<MrtTask>,
    // Entries whose RPF neighbor is null, waiting for one to appear.
    orphans: BTreeSet<MreId>,
}

// ===== impl Mrt =====

impl Mrt {
    // Most-specific-first lookup over the kinds named in `lookup`.
    pub(crate) fn find(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        lookup: MreKindMask,
    ) -> Option<MreIndex> {
        if lookup.contains(MreKindMask::SG)
            && let Some(idx) = self.sg_tree.get(&(group, source))
        {
            return Some(*idx);
        }
        if lookup.contains(MreKindMask::SG_RPT)
            && let Some(idx) = self.sg_rpt_tree.get(&(group, source))
        {
            return Some(*idx);
        }
        if lookup.contains(MreKindMask::WC)
            && let Some(idx) = self.wc_tree.get(&group)
        {
            return Some(*idx);
        }
        if lookup.contains(MreKindMask::RP)
            && let Some(idx) = self.rp_tree.get(&source)
        {
            return Some(*idx);
        }
        None
    }

    // Lookup, creating the most specific kind named in `create` when
    // nothing matches. Creating an (S,G) or (S,G,rpt) entry doesn't force
    // creation of the (*,G) entry.
    pub(crate) fn find_or_create(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        lookup: MreKindMask,
        create: MreKindMask,
    ) -> Option<MreIndex> {
        if let Some(idx) = self.find(source, group, lookup) {
            return Some(idx);
        }

        let kind = if create.contains(MreKindMask::SG) {
            MreKind::Sg
        } else if create.contains(MreKindMask::SG_RPT) {
            MreKind::SgRpt
        } else if create.contains(MreKindMask::WC) {
            MreKind::Wc
        } else if create.contains(MreKindMask::RP) {
            MreKind::Rp
        } else {
            return None;
        };

        Some(self.create(kind, source, group))
    }

    fn create(
        &mut self,
        kind: MreKind,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> MreIndex {
        let id = self.next_id;
        self.next_id += 1;

        let group = match kind {
            MreKind::Rp => ALL_MULTICAST_ADDR,
            _ => group,
        };
        let mre = Mre::new(id, kind, source, group);
        crate::debug::Debug::MreCreate(kind, &source, &group).log();

        let idx = self.arena.insert(mre);
        self.id_tree.insert(id, idx);
        match kind {
            MreKind::Rp => {
                self.rp_tree.insert(source, idx);
            }
            MreKind::Wc => {
                self.wc_tree.insert(group, idx);
            }
            MreKind::Sg => {
                self.sg_tree.insert((group, source), idx);
            }
            MreKind::SgRpt => {
                self.sg_rpt_tree.insert((group, source), idx);
            }
        }
        idx
    }

    // Removes an entry from the table. The caller is responsible for
    // having detached it from its neighbors first.
    pub(crate) fn remove(&mut self, idx: MreIndex) -> Mre {
        let mre = self.arena.remove(idx).unwrap();
        crate::debug::Debug::MreDelete(mre.kind, &mre.source, &mre.group)
            .log();

        self.id_tree.remove(&mre.id);
        self.orphans.remove(&mre.id);
        match mre.kind {
            MreKind::Rp => {
                self.rp_tree.remove(&mre.source);
            }
            MreKind::Wc => {
                self.wc_tree.remove(&mre.group);
            }
            MreKind::Sg => {
                self.sg_tree.remove(&(mre.group, mre.source));
            }
            MreKind::SgRpt => {
                self.sg_rpt_tree.remove(&(mre.group, mre.source));
            }
        }
        mre
    }

    pub(crate) fn get(&self, idx: MreIndex) -> Option<&Mre> {
        self.arena.get(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: MreIndex) -> Option<&mut Mre> {
        self.arena.get_mut(idx)
    }

    pub(crate) fn index_by_id(&self, id: MreId) -> Option<MreIndex> {
        self.id_tree.get(&id).copied()
    }

    pub(crate) fn get_by_id(&self, id: MreId) -> Option<&Mre> {
        self.index_by_id(id).and_then(|idx| self.get(idx))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (MreIndex, &Mre)> {
        self.arena.iter()
    }

    pub(crate) fn ids(&self) -> Vec<MreId> {
        self.arena.iter().map(|(_, mre)| mre.id).collect()
    }

    // Per-kind entry accessors.

    pub(crate) fn rp_entry(&self, rp_addr: Ipv4Addr) -> Option<&Mre> {
        self.rp_tree.get(&rp_addr).and_then(|idx| self.get(*idx))
    }

    pub(crate) fn wc_entry(&self, group: Ipv4Addr) -> Option<&Mre> {
        self.wc_tree.get(&group).and_then(|idx| self.get(*idx))
    }

    pub(crate) fn sg_entry(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&Mre> {
        self.sg_tree
            .get(&(group, source))
            .and_then(|idx| self.get(*idx))
    }

    pub(crate) fn sg_rpt_entry(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&Mre> {
        self.sg_rpt_tree
            .get(&(group, source))
            .and_then(|idx| self.get(*idx))
    }

    // All (S,G) entries of a group.
    pub(crate) fn group_sg_entries(
        &self,
        group: Ipv4Addr,
    ) -> impl Iterator<Item = &Mre> {
        self.sg_tree
            .range((group, Ipv4Addr::UNSPECIFIED)..)
            .take_while(move |((g, _), _)| *g == group)
            .filter_map(|(_, idx)| self.get(*idx))
    }

    // All (S,G,rpt) entries of a group.
    pub(crate) fn group_sg_rpt_entries(
        &self,
        group: Ipv4Addr,
    ) -> impl Iterator<Item = &Mre> {
        self.sg_rpt_tree
            .range((group, Ipv4Addr::UNSPECIFIED)..)
            .take_while(move |((g, _), _)| *g == group)
            .filter_map(|(_, idx)| self.get(*idx))
    }

    // ===== orphan bookkeeping =====

    pub(crate) fn orphan_insert(&mut self, id: MreId) {
        self.orphans.insert(id);
    }

    pub(crate) fn orphan_remove(&mut self, id: MreId) {
        self.orphans.remove(&id);
    }

    pub(crate) fn orphan_ids(&self) -> Vec<MreId> {
        self.orphans.iter().copied().collect()
    }

    // ===== deferred tasks =====

    // Enqueues a whole-table task. The caller signals the drain channel.
    pub(crate) fn enqueue_task(&mut self, kind: MrtTaskKind) {
        let pending = self.ids().into();
        self.tasks.push_back(MrtTask { kind, pending });
    }

    // Enqueues a task over an explicit entry set (e.g. a spliced
    // dependent-neighbor list).
    pub(crate) fn enqueue_task_over(
        &mut self,
        kind: MrtTaskKind,
        ids: Vec<MreId>,
    ) {
        self.tasks.push_back(MrtTask {
            kind,
            pending: ids.into(),
        });
    }

    // Takes up to one batch of work from the task at the queue head.
    // Returns None when the queue is empty.
    pub(crate) fn next_task_batch(
        &mut self,
    ) -> Option<(MrtTaskKind, Vec<MreId>)> {
        let task = self.tasks.front_mut()?;
        let batch: Vec<_> = {
            let n = task.pending.len().min(TASK_BATCH_SIZE);
            task.pending.drain(..n).collect()
        };
        let kind = task.kind.clone();
        if task.pending.is_empty() {
            self.tasks.pop_front();
        }
        Some((kind, batch))
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    // ===== outgoing-interface lists =====
    //
    // The olist computations combine the downstream state of the group's
    // (*,*,RP), (*,G), (S,G,rpt) and (S,G) entries. Local (IGMP-learned)
    // receivers count only where this router is the DR or the Assert
    // winner.

    fn pim_include(&self, mre: &Mre, interfaces: &Interfaces) -> BTreeSet<u32> {
        mre.local_include
            .iter()
            .filter(|ifindex| {
                interfaces.i_am_dr(**ifindex)
                    || mre
                        .asserts
                        .get(*ifindex)
                        .is_some_and(|a| a.state == assert::State::Winner)
            })
            .copied()
            .collect()
    }

    pub(crate) fn immediate_olist(
        &self,
        mre: &Mre,
        interfaces: &Interfaces,
    ) -> BTreeSet<u32> {
        match mre.kind {
            MreKind::Rp => mre.joins(),
            MreKind::Wc | MreKind::Sg => {
                let mut olist = mre.joins();
                olist.extend(self.pim_include(mre, interfaces));
                &olist - &mre.lost_asserts()
            }
            MreKind::SgRpt => BTreeSet::new(),
        }
    }

    // inherited_olist(S,G,rpt): the shared-tree interfaces minus this
    // source's rpt-prunes, plus local shared-tree receivers.
    pub(crate) fn inherited_olist_sg_rpt(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        interfaces: &Interfaces,
    ) -> BTreeSet<u32> {
        let wc = self.wc_entry(group);
        let rp_addr = wc.and_then(|wc| wc.rp_addr);

        let mut olist = BTreeSet::new();
        if let Some(rp_addr) = rp_addr
            && let Some(rp) = self.rp_entry(rp_addr)
        {
            olist.extend(rp.joins());
        }
        if let Some(wc) = wc {
            olist.extend(wc.joins());
        }
        if let Some(sg_rpt) = self.sg_rpt_entry(source, group) {
            olist = &olist - &sg_rpt.prunes();
        }
        if let Some(wc) = wc {
            olist.extend(self.pim_include(wc, interfaces));
            olist = &olist - &wc.lost_asserts();
        }
        olist
    }

    // inherited_olist(S,G): what the MFC oif set is reconciled from.
    pub(crate) fn inherited_olist_sg(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        interfaces: &Interfaces,
    ) -> BTreeSet<u32> {
        let mut olist =
            self.inherited_olist_sg_rpt(source, group, interfaces);
        if let Some(sg) = self.sg_entry(source, group) {
            olist.extend(sg.joins());
            olist.extend(self.pim_include(sg, interfaces));
            olist = &olist - &sg.lost_asserts();
        }
        olist
    }

    // ===== JoinDesired derivations =====

    pub(crate) fn join_desired(
        &self,
        mre: &Mre,
        interfaces: &Interfaces,
    ) -> bool {
        match mre.kind {
            MreKind::Rp => self.join_desired_rp(mre, interfaces),
            MreKind::Wc => self.join_desired_wc(mre, interfaces),
            MreKind::Sg => self.join_desired_sg(mre, interfaces),
            MreKind::SgRpt => false,
        }
    }

    // (*,*,RP): downstream Join state, or a dependent (*,G) that would
    // join the shared tree through this RP.
    fn join_desired_rp(&self, mre: &Mre, interfaces: &Interfaces) -> bool {
        if !mre.joins().is_empty() {
            return true;
        }
        self.wc_tree.values().any(|idx| {
            self.get(*idx).is_some_and(|wc| {
                wc.rp_addr == Some(mre.source)
                    && self.join_desired_wc(wc, interfaces)
            })
        })
    }

    // (*,G): shared-tree interest exists and this router is not the RP.
    fn join_desired_wc(&self, mre: &Mre, interfaces: &Interfaces) -> bool {
        if mre.flags.contains(MreFlags::I_AM_RP) {
            return false;
        }
        if !self.immediate_olist(mre, interfaces).is_empty() {
            return true;
        }
        if let Some(rp_addr) = mre.rp_addr
            && let Some(rp) = self.rp_entry(rp_addr)
        {
            return !rp.joins().is_empty();
        }
        false
    }

    // (S,G): source-tree interest exists, and the source tree diverges
    // from the shared tree (or there is no shared tree).
    fn join_desired_sg(&self, mre: &Mre, interfaces: &Interfaces) -> bool {
        let mut olist = self.immediate_olist(mre, interfaces);
        olist.extend(self.inherited_olist_sg(
            mre.source,
            mre.group,
            interfaces,
        ));
        olist.remove(&REGISTER_VIF_IFINDEX);
        if olist.is_empty() {
            return false;
        }

        if mre.is_spt()
            || mre.flags.contains(MreFlags::WAS_SPT_SWITCH_DESIRED)
        {
            return true;
        }
        match self.wc_entry(mre.group) {
            None => true,
            Some(wc) => mre.rpfp_nbr_sg != wc.rpfp_nbr_wc,
        }
    }

    // RPTJoinDesired(G): the shared tree is or would be joined.
    pub(crate) fn rpt_join_desired(
        &self,
        group: Ipv4Addr,
        interfaces: &Interfaces,
    ) -> bool {
        if let Some(wc) = self.wc_entry(group) {
            if self.join_desired_wc(wc, interfaces) {
                return true;
            }
            if let Some(rp_addr) = wc.rp_addr
                && let Some(rp) = self.rp_entry(rp_addr)
                && self.join_desired_rp(rp, interfaces)
            {
                return true;
            }
        }
        false
    }

    // PruneDesired(S,G,rpt).
    pub(crate) fn prune_desired_sg_rpt(
        &self,
        mre: &Mre,
        interfaces: &Interfaces,
    ) -> bool {
        debug_assert_eq!(mre.kind, MreKind::SgRpt);

        if !self.rpt_join_desired(mre.group, interfaces) {
            return false;
        }
        if self
            .inherited_olist_sg_rpt(mre.source, mre.group, interfaces)
            .is_empty()
        {
            return true;
        }
        // The source joined the SPT away from the shared tree.
        if let Some(sg) = self.sg_entry(mre.source, mre.group)
            && sg.is_spt()
            && let Some(wc) = self.wc_entry(mre.group)
            && wc.rpfp_nbr_wc != sg.rpfp_nbr_sg
        {
            return true;
        }
        false
    }
}

// ===== impl MrtTaskKind =====

impl std::fmt::Display for MrtTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MrtTaskKind::RpSetChanged => write!(f, "rp-set changed"),
            MrtTaskKind::MribChanged(..) => write!(f, "mrib changed"),
            MrtTaskKind::NbrGenIdChanged(..) => {
                write!(f, "neighbor genid changed")
            }
            MrtTaskKind::NbrDied(..) => write!(f, "neighbor died"),
        }
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;

    #[test]
    fn test_find_most_specific_first() {
        let mut mrt = Mrt::default();
        let source = ip4!("10.0.0.5");
        let group = ip4!("239.1.1.1");

        let wc = mrt
            .find_or_create(
                Ipv4Addr::UNSPECIFIED,
                group,
                MreKindMask::WC,
                MreKindMask::WC,
            )
            .unwrap();
        let sg = mrt
            .find_or_create(source, group, MreKindMask::SG, MreKindMask::SG)
            .unwrap();

        // The (S,G) entry shadows the (*,G) entry when both are allowed.
        let found = mrt
            .find(source, group, MreKindMask::SG | MreKindMask::WC)
            .unwrap();
        assert_eq!(found, sg);

        // Without SG in the mask, (*,G) matches.
        let found = mrt.find(source, group, MreKindMask::WC).unwrap();
        assert_eq!(found, wc);

        // An empty create mask doesn't create anything.
        assert!(
            mrt.find_or_create(
                source,
                group,
                MreKindMask::SG_RPT,
                MreKindMask::empty()
            )
            .is_none()
        );
    }

    #[test]
    fn test_group_iteration() {
        let mut mrt = Mrt::default();
        let group = ip4!("239.1.1.1");
        let other = ip4!("239.2.2.2");

        for source in [ip4!("10.0.0.1"), ip4!("10.0.0.2")] {
            let _ = mrt.find_or_create(
                source,
                group,
                MreKindMask::SG,
                MreKindMask::SG,
            );
        }
        let _ = mrt.find_or_create(
            ip4!("10.0.0.3"),
            other,
            MreKindMask::SG,
            MreKindMask::SG,
        );

        let sources: Vec<_> =
            mrt.group_sg_entries(group).map(|mre| mre.source).collect();
        assert_eq!(sources, vec![ip4!("10.0.0.1"), ip4!("10.0.0.2")]);
    }

    #[test]
    fn test_rp_entry_group_is_all_multicast() {
        let mut mrt = Mrt::default();
        let rp = ip4!("10.0.0.1");
        let idx = mrt
            .find_or_create(
                rp,
                Ipv4Addr::UNSPECIFIED,
                MreKindMask::RP,
                MreKindMask::RP,
            )
            .unwrap();
        let mre = mrt.get(idx).unwrap();
        assert_eq!(mre.group, ALL_MULTICAST_ADDR);
        assert_eq!(mre.source, rp);
        assert!(mrt.rp_entry(rp).is_some());
    }

    #[test]
    fn test_inherited_olists() {
        use crate::interface::Interfaces;
        use crate::mre::downstream;

        let mut mrt = Mrt::default();
        let interfaces = Interfaces::default();
        let source = ip4!("10.0.0.5");
        let group = ip4!("239.1.1.1");

        // Shared tree joined on interfaces 1 and 2.
        let wc = mrt
            .find_or_create(
                Ipv4Addr::UNSPECIFIED,
                group,
                MreKindMask::WC,
                MreKindMask::WC,
            )
            .unwrap();
        for ifindex in [1, 2] {
            mrt.get_mut(wc).unwrap().downstream.entry(ifindex).or_default().state =
                downstream::State::Join;
        }

        // This source is rpt-pruned on interface 2.
        let sg_rpt = mrt
            .find_or_create(
                source,
                group,
                MreKindMask::SG_RPT,
                MreKindMask::SG_RPT,
            )
            .unwrap();
        mrt.get_mut(sg_rpt)
            .unwrap()
            .downstream
            .entry(2)
            .or_default()
            .state = downstream::State::Pruned;

        assert_eq!(
            mrt.inherited_olist_sg_rpt(source, group, &interfaces),
            BTreeSet::from([1])
        );

        // A source-tree Join on interface 3 adds to the inherited list.
        let sg = mrt
            .find_or_create(source, group, MreKindMask::SG, MreKindMask::SG)
            .unwrap();
        mrt.get_mut(sg).unwrap().downstream.entry(3).or_default().state =
            downstream::State::Join;

        assert_eq!(
            mrt.inherited_olist_sg(source, group, &interfaces),
            BTreeSet::from([1, 3])
        );

        // Another source of the group is unaffected by the rpt-prune.
        assert_eq!(
            mrt.inherited_olist_sg(ip4!("10.0.0.6"), group, &interfaces),
            BTreeSet::from([1, 2])
        );
    }

    #[test]
    fn test_task_batching() {
        let mut mrt = Mrt::default();
        for i in 0..100 {
            let source = Ipv4Addr::from(u32::from(ip4!("10.0.0.0")) + i);
            let _ = mrt.find_or_create(
                source,
                ip4!("239.1.1.1"),
                MreKindMask::SG,
                MreKindMask::SG,
            );
        }
        mrt.enqueue_task(MrtTaskKind::RpSetChanged);

        let (_, batch1) = mrt.next_task_batch().unwrap();
        assert_eq!(batch1.len(), TASK_BATCH_SIZE);
        assert!(mrt.has_tasks());
        let (_, batch2) = mrt.next_task_batch().unwrap();
        assert_eq!(batch2.len(), 100 - TASK_BATCH_SIZE);
        assert!(!mrt.has_tasks());
        assert!(mrt.next_task_batch().is_none());
    }
}
