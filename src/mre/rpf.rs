//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::mre::{MreFlags, MreKind, assert, register, upstream};
use crate::mrib::MribEntry;
use crate::mrt::MreId;
use crate::neighbor::{NeighborKey, Neighbors};

// Recomputes the unicast snapshot entries, the five cached RPF-neighbor
// fields and the neighbor back-references of one entry. Emits the
// Prune-old/Join-new pair when the upstream neighbor of a joined entry
// moves.
pub(crate) fn recompute(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    let kind = mre.kind;

    // Resolve the unicast routes toward the RP and the source.
    let rp_addr = match kind {
        MreKind::Rp => Some(mre.source),
        _ => mre.rp_addr,
    };
    let mrib_rp = rp_addr
        .and_then(|rp_addr| lookup_validated(state, interfaces, rp_addr));
    let (mrib_s, directly_connected_s) = match kind {
        MreKind::Sg | MreKind::SgRpt => {
            let mrib_s = lookup_validated(state, interfaces, mre.source);
            // A connected route has no next hop: the source is on-link.
            let connected = mrib_s
                .as_ref()
                .is_some_and(|mrib| mrib.next_hop.is_unspecified());
            (mrib_s, connected)
        }
        _ => (None, false),
    };

    // Derive the neighbor keys. A next hop with no neighbor state, or a
    // directly connected source, yields a null RPF neighbor.
    let nbr_mrib_next_hop_rp =
        mrib_rp.as_ref().and_then(|mrib| nbr_key(state, mrib, interfaces));
    let nbr_mrib_next_hop_s = if directly_connected_s {
        None
    } else {
        mrib_s.as_ref().and_then(|mrib| nbr_key(state, mrib, interfaces))
    };

    // An Assert winner on the RPF interface overrides the MRIB-derived
    // neighbor. (S,G,rpt) entries follow the shared-tree asserts of
    // their (*,G) entry.
    let mre = state.mrt.get(idx).unwrap();
    let rpf_iface_rp = mrib_rp.as_ref().map(|mrib| mrib.ifindex);
    let rpf_iface_s = mrib_s.as_ref().map(|mrib| mrib.ifindex);

    let wc_winner = match kind {
        MreKind::Wc => assert_winner_key(state, mre, rpf_iface_rp),
        MreKind::Sg | MreKind::SgRpt => state
            .mrt
            .wc_entry(mre.group)
            .and_then(|wc| assert_winner_key(state, wc, rpf_iface_rp)),
        MreKind::Rp => None,
    };
    let rpfp_nbr_wc = match kind {
        // (S,G) entries mirror the group's shared-tree RPF' for the
        // JoinDesired divergence checks.
        MreKind::Sg | MreKind::SgRpt => state
            .mrt
            .wc_entry(mre.group)
            .and_then(|wc| wc.rpfp_nbr_wc)
            .or(wc_winner.or(nbr_mrib_next_hop_rp)),
        _ => wc_winner.or(nbr_mrib_next_hop_rp),
    };
    let rpfp_nbr_sg = assert_winner_key(state, mre, rpf_iface_s)
        .or(nbr_mrib_next_hop_s);
    let rpfp_nbr_sg_rpt = wc_winner.or(nbr_mrib_next_hop_rp);

    let i_am_rp =
        rp_addr.is_some_and(|rp_addr| interfaces.is_my_addr(rp_addr));

    // Apply and diff.
    let mre = state.mrt.get_mut(idx).unwrap();
    let old_refs = referenced_nbrs(
        mre.nbr_mrib_next_hop_rp,
        mre.nbr_mrib_next_hop_s,
        mre.rpfp_nbr_wc,
        mre.rpfp_nbr_sg,
        mre.rpfp_nbr_sg_rpt,
    );
    let old_primary = mre.rpfp_nbr();

    mre.mrib_rp = mrib_rp;
    mre.mrib_s = mrib_s;
    mre.nbr_mrib_next_hop_rp = nbr_mrib_next_hop_rp;
    mre.nbr_mrib_next_hop_s = nbr_mrib_next_hop_s;
    mre.rpfp_nbr_wc = rpfp_nbr_wc;
    mre.rpfp_nbr_sg = rpfp_nbr_sg;
    mre.rpfp_nbr_sg_rpt = rpfp_nbr_sg_rpt;
    mre.flags
        .set(MreFlags::DIRECTLY_CONNECTED_S, directly_connected_s);
    mre.flags.set(MreFlags::I_AM_RP, i_am_rp);

    let new_refs = referenced_nbrs(
        nbr_mrib_next_hop_rp,
        nbr_mrib_next_hop_s,
        rpfp_nbr_wc,
        rpfp_nbr_sg,
        rpfp_nbr_sg_rpt,
    );
    let new_primary = mre.rpfp_nbr();

    // Keep the dependent lists in sync: one membership per entry no
    // matter how many fields reference the neighbor.
    for key in old_refs.difference(&new_refs) {
        // The neighbor may be mid-teardown and already gone.
        if let Some(nbr) = state.neighbors.get_mut(key) {
            nbr.detach_mre(kind, mre_id);
        }
    }
    for key in new_refs.difference(&old_refs) {
        if let Some(nbr) = state.neighbors.get_mut(key) {
            nbr.attach_mre(kind, mre_id);
        }
    }

    // Entries without an upstream neighbor park on the orphan list until
    // one appears.
    if new_primary.is_none() && !directly_connected_s {
        state.mrt.orphan_insert(mre_id);
    } else {
        state.mrt.orphan_remove(mre_id);
    }

    if old_primary != new_primary {
        upstream::rpf_neighbor_changed(
            instance,
            interfaces,
            mre_id,
            old_primary,
        );
    }
    if kind == MreKind::Sg {
        register::recompute_could_register(instance, interfaces, mre_id);
    }
}

// Detaches an entry from every neighbor that references it, ahead of
// entry removal.
pub(crate) fn detach_all(
    neighbors: &mut Neighbors,
    mre: &crate::mre::Mre,
) {
    let refs = referenced_nbrs(
        mre.nbr_mrib_next_hop_rp,
        mre.nbr_mrib_next_hop_s,
        mre.rpfp_nbr_wc,
        mre.rpfp_nbr_sg,
        mre.rpfp_nbr_sg_rpt,
    );
    for key in refs {
        if let Some(nbr) = neighbors.get_mut(&key) {
            nbr.detach_mre(mre.kind, mre.id);
        }
    }
}

// ===== helper functions =====

// Looks up the MRIB and validates that the next hop resolves to an
// active local interface; an unusable next hop counts as no route.
fn lookup_validated(
    state: &crate::instance::InstanceState,
    interfaces: &Interfaces,
    addr: Ipv4Addr,
) -> Option<MribEntry> {
    let mrib = state.mrib.lookup(addr)?;
    match interfaces.get_by_ifindex(mrib.ifindex) {
        Some(iface) if iface.is_active() => Some(*mrib),
        _ => {
            crate::error::Error::MribBadNextHop(addr, mrib.next_hop).log();
            None
        }
    }
}

fn nbr_key(
    state: &crate::instance::InstanceState,
    mrib: &MribEntry,
    interfaces: &Interfaces,
) -> Option<NeighborKey> {
    if mrib.next_hop.is_unspecified()
        || interfaces.is_my_addr(mrib.next_hop)
    {
        return None;
    }
    let key = NeighborKey {
        ifindex: mrib.ifindex,
        addr: mrib.next_hop,
    };
    state.neighbors.contains_key(&key).then_some(key)
}

// The Assert winner tracked by the entry on its RPF interface, if that
// winner has neighbor state.
fn assert_winner_key(
    state: &crate::instance::InstanceState,
    mre: &crate::mre::Mre,
    rpf_ifindex: Option<u32>,
) -> Option<NeighborKey> {
    let ifindex = rpf_ifindex?;
    let addr = assert::winner(mre, ifindex)?;
    let key = NeighborKey { ifindex, addr };
    state.neighbors.contains_key(&key).then_some(key)
}

fn referenced_nbrs(
    a: Option<NeighborKey>,
    b: Option<NeighborKey>,
    c: Option<NeighborKey>,
    d: Option<NeighborKey>,
    e: Option<NeighborKey>,
) -> BTreeSet<NeighborKey> {
    [a, b, c, d, e].into_iter().flatten().collect()
}
