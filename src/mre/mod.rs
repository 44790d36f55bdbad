//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod assert;
pub mod downstream;
pub mod register;
pub mod rpf;
pub mod upstream;

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::ALL_MULTICAST_ADDR;
use crate::mre::assert::AssertMetric;
use crate::mrib::MribEntry;
use crate::mrt::MreId;
use crate::neighbor::NeighborKey;
use crate::tasks::TimeoutTask;

// Multicast routing entry kinds, in most-specific-first lookup order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum MreKind {
    Sg,
    SgRpt,
    Wc,
    Rp,
}

bitflags! {
    // Entry-kind sets for table lookup and creation.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct MreKindMask: u8 {
        const RP = 0x01;
        const WC = 0x02;
        const SG = 0x04;
        const SG_RPT = 0x08;
    }
}

bitflags! {
    // Entry flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct MreFlags: u8 {
        // The (S,G) entry is on the shortest-path tree.
        const SPT = 0x01;
        // The source is on a directly attached subnet.
        const DIRECTLY_CONNECTED_S = 0x02;
        // Register encapsulation applies (DR toward a connected source).
        const COULD_REGISTER = 0x04;
        // This router is the RP for the entry's group.
        const I_AM_RP = 0x08;
        // An SPT-switch dataflow monitor has fired for this (S,G).
        const WAS_SPT_SWITCH_DESIRED = 0x10;
    }
}

// Per-interface downstream Join/Prune machinery.
#[derive(Debug, Default)]
pub struct DownstreamIf {
    pub state: downstream::State,
    pub expiry_timer: Option<TimeoutTask>,
    pub prune_pending_timer: Option<TimeoutTask>,
}

// Per-interface Assert machinery.
#[derive(Debug, Default)]
pub struct AssertIf {
    pub state: assert::State,
    pub winner_addr: Option<Ipv4Addr>,
    pub winner_metric: Option<AssertMetric>,
    pub assert_timer: Option<TimeoutTask>,
    // Throttle for data-plane-triggered Asserts (WRONGVIF upcalls).
    pub last_data_triggered: Option<std::time::Instant>,
}

// A multicast routing entry. The four kinds share one struct and differ in
// which fields and state machines apply; code branches on the kind tag.
#[derive(Debug)]
pub struct Mre {
    pub id: MreId,
    pub kind: MreKind,
    // (S,G)/(S,G,rpt): the source. (*,*,RP): the RP. (*,G): unspecified.
    pub source: Ipv4Addr,
    // (*,*,RP): the all-multicast prefix.
    pub group: Ipv4Addr,

    // The group's RP, shared by the WC/SG/SG-RPT entries of the group.
    pub rp_addr: Option<Ipv4Addr>,

    // Unicast snapshot entries toward the RP and the source.
    pub mrib_rp: Option<MribEntry>,
    pub mrib_s: Option<MribEntry>,

    // Cached upstream neighbors. Keys into the neighbor table rather than
    // owning handles, so teardown stays safe and idempotent.
    pub nbr_mrib_next_hop_rp: Option<NeighborKey>,
    pub nbr_mrib_next_hop_s: Option<NeighborKey>,
    pub rpfp_nbr_wc: Option<NeighborKey>,
    pub rpfp_nbr_sg: Option<NeighborKey>,
    pub rpfp_nbr_sg_rpt: Option<NeighborKey>,

    // Per-interface downstream and Assert state.
    pub downstream: BTreeMap<u32, DownstreamIf>,
    pub asserts: BTreeMap<u32, AssertIf>,

    // Interfaces with local (IGMP-learned) receivers.
    pub local_include: BTreeSet<u32>,

    // Upstream Join/Prune state.
    pub upstream: upstream::State,
    pub join_timer: Option<TimeoutTask>,
    pub override_timer: Option<TimeoutTask>,

    // (S,G) only.
    pub keepalive_timer: Option<TimeoutTask>,
    pub register: register::State,
    pub register_stop_timer: Option<TimeoutTask>,

    pub flags: MreFlags,
    pub created: DateTime<Utc>,
}

// ===== impl MreKind =====

impl MreKind {
    pub(crate) fn mask(&self) -> MreKindMask {
        match self {
            MreKind::Sg => MreKindMask::SG,
            MreKind::SgRpt => MreKindMask::SG_RPT,
            MreKind::Wc => MreKindMask::WC,
            MreKind::Rp => MreKindMask::RP,
        }
    }
}

impl std::fmt::Display for MreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MreKind::Sg => write!(f, "(S,G)"),
            MreKind::SgRpt => write!(f, "(S,G,rpt)"),
            MreKind::Wc => write!(f, "(*,G)"),
            MreKind::Rp => write!(f, "(*,*,RP)"),
        }
    }
}

// ===== impl Mre =====

impl Mre {
    pub(crate) fn new(
        id: MreId,
        kind: MreKind,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Mre {
        debug_assert!(kind != MreKind::Rp || group == ALL_MULTICAST_ADDR);

        Mre {
            id,
            kind,
            source,
            group,
            rp_addr: None,
            mrib_rp: None,
            mrib_s: None,
            nbr_mrib_next_hop_rp: None,
            nbr_mrib_next_hop_s: None,
            rpfp_nbr_wc: None,
            rpfp_nbr_sg: None,
            rpfp_nbr_sg_rpt: None,
            downstream: Default::default(),
            asserts: Default::default(),
            local_include: Default::default(),
            upstream: upstream::State::initial(kind),
            join_timer: None,
            override_timer: None,
            keepalive_timer: None,
            register: Default::default(),
            register_stop_timer: None,
            flags: MreFlags::empty(),
            created: Utc::now(),
        }
    }

    // The RPF interface toward the RP, from the unicast snapshot.
    pub(crate) fn rpf_interface_rp(&self) -> Option<u32> {
        self.mrib_rp.as_ref().map(|mrib| mrib.ifindex)
    }

    // The RPF interface toward the source.
    pub(crate) fn rpf_interface_s(&self) -> Option<u32> {
        self.mrib_s.as_ref().map(|mrib| mrib.ifindex)
    }

    // The assert-aware upstream neighbor for this entry.
    pub(crate) fn rpfp_nbr(&self) -> Option<NeighborKey> {
        match self.kind {
            MreKind::Rp => self.nbr_mrib_next_hop_rp,
            MreKind::Wc => self.rpfp_nbr_wc,
            MreKind::Sg => self.rpfp_nbr_sg,
            MreKind::SgRpt => self.rpfp_nbr_sg_rpt,
        }
    }

    pub(crate) fn is_spt(&self) -> bool {
        self.flags.contains(MreFlags::SPT)
    }

    pub(crate) fn is_directly_connected_s(&self) -> bool {
        self.flags.contains(MreFlags::DIRECTLY_CONNECTED_S)
    }

    // Interfaces on which this entry lost an Assert.
    pub(crate) fn lost_asserts(&self) -> BTreeSet<u32> {
        self.asserts
            .iter()
            .filter(|(_, a)| a.state == assert::State::Loser)
            .map(|(ifindex, _)| *ifindex)
            .collect()
    }

    // Interfaces whose downstream state machine is in Join or
    // Prune-Pending (a pending prune hasn't taken effect yet).
    pub(crate) fn joins(&self) -> BTreeSet<u32> {
        self.downstream
            .iter()
            .filter(|(_, d)| {
                matches!(
                    d.state,
                    downstream::State::Join | downstream::State::PrunePending
                )
            })
            .map(|(ifindex, _)| *ifindex)
            .collect()
    }

    // Interfaces with (S,G,rpt) downstream Prune state.
    pub(crate) fn prunes(&self) -> BTreeSet<u32> {
        debug_assert_eq!(self.kind, MreKind::SgRpt);
        self.downstream
            .iter()
            .filter(|(_, d)| {
                matches!(
                    d.state,
                    downstream::State::Pruned | downstream::State::PruneTmp
                )
            })
            .map(|(ifindex, _)| *ifindex)
            .collect()
    }

    // Whether the entry carries no protocol state and can be removed.
    // MFC references and pending table tasks are checked by the caller.
    pub(crate) fn can_remove(&self) -> bool {
        if !self.upstream.is_no_info() {
            return false;
        }
        if self.register != register::State::NoInfo {
            return false;
        }
        if self.join_timer.is_some()
            || self.override_timer.is_some()
            || self.keepalive_timer.is_some()
            || self.register_stop_timer.is_some()
        {
            return false;
        }
        if !self.local_include.is_empty() {
            return false;
        }
        if self
            .downstream
            .values()
            .any(|d| d.state != downstream::State::NoInfo)
        {
            return false;
        }
        if self.asserts.values().any(|a| a.state != assert::State::NoInfo) {
            return false;
        }
        true
    }
}
