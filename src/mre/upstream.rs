//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::consts::{
    ALL_MULTICAST_ADDR, ALL_MULTICAST_MASK_LEN, JOIN_PRUNE_HOLDTIME_RATIO,
    JOIN_PRUNE_PERIOD,
};
use crate::debug::Debug;
use crate::instance::{InstanceState, InstanceUpView};
use crate::interface::Interfaces;
use crate::join_prune::JpAction;
use crate::mre::{Mre, MreKind};
use crate::mrt::MreId;
use crate::neighbor::NeighborKey;
use crate::tasks;

// Upstream Join/Prune state. RP, WC and SG entries move between NoInfo
// and Joined; SG-RPT entries run the rpt-prune machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    NoInfo,
    Joined,
    RptNotJoined,
    Pruned,
    NotPruned,
}

// ===== impl State =====

impl State {
    pub(crate) fn initial(kind: MreKind) -> State {
        match kind {
            MreKind::SgRpt => State::RptNotJoined,
            _ => State::NoInfo,
        }
    }

    pub(crate) fn is_no_info(&self) -> bool {
        matches!(self, State::NoInfo | State::RptNotJoined)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::NoInfo => write!(f, "no-info"),
            State::Joined => write!(f, "joined"),
            State::RptNotJoined => write!(f, "rpt-not-joined"),
            State::Pruned => write!(f, "pruned"),
            State::NotPruned => write!(f, "not-pruned"),
        }
    }
}

// ===== global functions =====

// Re-evaluates JoinDesired (or PruneDesired for SG-RPT entries) and
// drives the upstream state machine. Invoked after every mutation that
// may have changed the derivation inputs.
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

    match mre.kind {
        MreKind::Rp | MreKind::Wc | MreKind::Sg => {
            let join_desired = state.mrt.join_desired(mre, interfaces);
            let joined = mre.upstream == State::Joined;
            if join_desired == joined {
                return;
            }

            let upstream_nbr = mre.rpfp_nbr();
            let params = jp_params(mre);
            let jp_period = jp_period(interfaces, mre);

            let mre = state.mrt.get_mut(idx).unwrap();
            if join_desired {
                change_state(mre, State::Joined);
                mre.join_timer = Some(tasks::join_timer(
                    mre_id,
                    Duration::from_secs(jp_period.into()),
                    &instance.tx.protocol_input.join_timer,
                ));
                enqueue_jp(
                    state,
                    instance.tx,
                    upstream_nbr,
                    params,
                    JpAction::Join,
                    jp_period,
                );
            } else {
                change_state(mre, State::NoInfo);
                mre.join_timer = None;
                enqueue_jp(
                    state,
                    instance.tx,
                    upstream_nbr,
                    params,
                    JpAction::Prune,
                    jp_period,
                );
            }
        }
        MreKind::SgRpt => recompute_sg_rpt(instance, interfaces, mre_id),
    }
}

// The SG-RPT upstream machine: prune this source off the shared tree
// while the shared tree is joined but the source's traffic isn't wanted
// on it.
fn recompute_sg_rpt(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    debug_assert_eq!(mre.kind, MreKind::SgRpt);

    let prune_desired = state.mrt.prune_desired_sg_rpt(mre, interfaces)
        && mre.rpfp_nbr_sg_rpt == state
            .mrt
            .wc_entry(mre.group)
            .and_then(|wc| wc.rpfp_nbr_wc);
    let rpt_join_desired =
        state.mrt.rpt_join_desired(mre.group, interfaces);
    let upstream_nbr = mre.rpfp_nbr();
    let params = jp_params(mre);
    let jp_period = jp_period(interfaces, mre);
    let old_state = mre.upstream;

    match old_state {
        State::RptNotJoined => {
            if prune_desired {
                let mre = state.mrt.get_mut(idx).unwrap();
                change_state(mre, State::Pruned);
                enqueue_jp(
                    state,
                    instance.tx,
                    upstream_nbr,
                    params,
                    JpAction::Prune,
                    jp_period,
                );
            }
        }
        State::Pruned => {
            if !prune_desired {
                let mre = state.mrt.get_mut(idx).unwrap();
                if rpt_join_desired {
                    change_state(mre, State::NotPruned);
                    enqueue_jp(
                        state,
                        instance.tx,
                        upstream_nbr,
                        params,
                        JpAction::Join,
                        jp_period,
                    );
                } else {
                    change_state(mre, State::RptNotJoined);
                }
            }
        }
        State::NotPruned => {
            let mre = state.mrt.get_mut(idx).unwrap();
            if prune_desired {
                change_state(mre, State::Pruned);
                mre.override_timer = None;
                enqueue_jp(
                    state,
                    instance.tx,
                    upstream_nbr,
                    params,
                    JpAction::Prune,
                    jp_period,
                );
            } else if !rpt_join_desired {
                change_state(mre, State::RptNotJoined);
                mre.override_timer = None;
            }
        }
        _ => (),
    }
}

// Join timer expiry: re-originate the periodic Join.
pub(crate) fn join_timer_expiry(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    if mre.upstream != State::Joined {
        return;
    }

    let upstream_nbr = mre.rpfp_nbr();
    let params = jp_params(mre);
    let jp_period = jp_period(interfaces, mre);

    let mre = state.mrt.get_mut(idx).unwrap();
    mre.join_timer = Some(tasks::join_timer(
        mre_id,
        Duration::from_secs(jp_period.into()),
        &instance.tx.protocol_input.join_timer,
    ));
    enqueue_jp(
        state,
        instance.tx,
        upstream_nbr,
        params,
        JpAction::Join,
        jp_period,
    );
}

// (S,G,rpt) Override timer expiry: the rescue Join toward the shared
// tree goes out now.
pub(crate) fn override_timer_expiry(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.override_timer = None;
    if mre.upstream != State::NotPruned {
        return;
    }

    let mre = state.mrt.get(idx).unwrap();
    let upstream_nbr = mre.rpfp_nbr();
    let params = jp_params(mre);
    let jp_period = jp_period(interfaces, mre);
    enqueue_jp(
        state,
        instance.tx,
        upstream_nbr,
        params,
        JpAction::Join,
        jp_period,
    );
}

// The upstream RPF neighbor changed while the entry is joined: move the
// tree over with an immediate Prune toward the old neighbor and a Join
// toward the new one.
pub(crate) fn rpf_neighbor_changed(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
    old_nbr: Option<NeighborKey>,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    if mre.upstream != State::Joined {
        return;
    }

    let new_nbr = mre.rpfp_nbr();
    let params = jp_params(mre);
    let jp_period = jp_period(interfaces, mre);

    if old_nbr.is_some() {
        enqueue_jp(
            state,
            instance.tx,
            old_nbr,
            params,
            JpAction::Prune,
            jp_period,
        );
    }
    if new_nbr.is_some() {
        enqueue_jp(
            state,
            instance.tx,
            new_nbr,
            params,
            JpAction::Join,
            jp_period,
        );
        let mre = state.mrt.get_mut(idx).unwrap();
        mre.join_timer = Some(tasks::join_timer(
            mre_id,
            Duration::from_secs(jp_period.into()),
            &instance.tx.protocol_input.join_timer,
        ));
    }
}

// The upstream neighbor restarted: make sure it relearns our Join soon.
pub(crate) fn genid_changed(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    if mre.upstream != State::Joined {
        return;
    }

    let t_override = t_override(interfaces, state, mre);
    let mre = state.mrt.get_mut(idx).unwrap();
    if let Some(join_timer) = &mut mre.join_timer
        && join_timer.remaining() > t_override
    {
        join_timer.reset(Some(t_override));
    }
}

// Another router on the LAN sent a Join for this entry toward our
// upstream neighbor: our own periodic Join is redundant for a while.
pub(crate) fn seen_join(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
    holdtime: u16,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();

    match mre.upstream {
        State::Joined => {
            if !suppression_enabled(interfaces, state, mre) {
                return;
            }
            let jp_period = jp_period(interfaces, mre);
            let t_suppressed = Duration::from_millis(
                rand::rng().random_range(
                    (u64::from(jp_period) * 1100)
                        ..=(u64::from(jp_period) * 1400),
                ),
            );
            let t_suppressed = t_suppressed
                .min(Duration::from_secs(holdtime.into()));
            let mre = state.mrt.get_mut(idx).unwrap();
            if let Some(join_timer) = &mut mre.join_timer
                && join_timer.remaining() < t_suppressed
            {
                join_timer.reset(Some(t_suppressed));
            }
        }
        // NotPruned: the shared tree is safe again.
        State::NotPruned => {
            let mre = state.mrt.get_mut(idx).unwrap();
            mre.override_timer = None;
        }
        _ => (),
    }
}

// Another router on the LAN pruned this entry toward our upstream
// neighbor: schedule a randomized override Join so the state survives.
pub(crate) fn seen_prune(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();

    match mre.upstream {
        State::Joined => {
            let t_override = random_override(interfaces, state, mre);
            let mre = state.mrt.get_mut(idx).unwrap();
            if let Some(join_timer) = &mut mre.join_timer
                && join_timer.remaining() > t_override
            {
                join_timer.reset(Some(t_override));
            }
        }
        State::NotPruned => {
            let t_override = random_override(interfaces, state, mre);
            let mre = state.mrt.get_mut(idx).unwrap();
            if mre.override_timer.is_none() {
                mre.override_timer = Some(tasks::override_timer(
                    mre_id,
                    t_override,
                    &instance.tx.protocol_input.override_timer,
                ));
            }
        }
        _ => (),
    }
}

// Queues one Join/Prune entry toward the upstream neighbor and arms the
// debounced flush. With no upstream neighbor the entry stays orphaned
// and nothing is sent.
pub(crate) fn enqueue_jp(
    state: &mut InstanceState,
    tx: &crate::instance::InstanceChannelsTx,
    nbr_key: Option<NeighborKey>,
    params: JpParams,
    action: JpAction,
    jp_period: u16,
) {
    let Some(nbr_key) = nbr_key else {
        return;
    };
    // A (*,G) record is meaningless until the group has an RP.
    if params.kind == MreKind::Wc && params.source.is_unspecified() {
        return;
    }
    let Some(nbr) = state.neighbors.get_mut(&nbr_key) else {
        return;
    };

    let holdtime =
        (JOIN_PRUNE_HOLDTIME_RATIO * f64::from(jp_period)) as u16;
    if let Err(error) = nbr.jp.add(
        params.source,
        params.group,
        params.group_mask_len,
        params.kind,
        action,
        holdtime,
    ) {
        error.log();
        return;
    }

    // Dispatch is deferred by one loop turn so a batch of transitions
    // coalesces into few packets.
    if nbr.jp_send_timer.is_none() {
        nbr.jp_send_timer = Some(tasks::jp_send_timer(
            nbr_key,
            Duration::ZERO,
            &tx.protocol_input.jp_send_timer,
        ));
    }
}

// The wire identity of an entry within a Join/Prune message.
#[derive(Clone, Copy, Debug)]
pub(crate) struct JpParams {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub group_mask_len: u8,
    pub kind: MreKind,
}

pub(crate) fn jp_params(mre: &Mre) -> JpParams {
    match mre.kind {
        MreKind::Rp => JpParams {
            source: mre.source,
            group: ALL_MULTICAST_ADDR,
            group_mask_len: ALL_MULTICAST_MASK_LEN,
            kind: MreKind::Rp,
        },
        MreKind::Wc => JpParams {
            // A (*,G) record carries the RP address as its source.
            source: mre.rp_addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
            group: mre.group,
            group_mask_len: Ipv4Addr::BITS as u8,
            kind: MreKind::Wc,
        },
        MreKind::Sg | MreKind::SgRpt => JpParams {
            source: mre.source,
            group: mre.group,
            group_mask_len: Ipv4Addr::BITS as u8,
            kind: mre.kind,
        },
    }
}

// ===== helper functions =====

fn change_state(mre: &mut Mre, state: State) {
    Debug::UpstreamStateChange(
        mre.kind,
        &mre.source,
        &mre.group,
        &mre.upstream,
        &state,
    )
    .log();
    mre.upstream = state;
}

// The Join/Prune period of the entry's RPF interface.
fn jp_period(interfaces: &Interfaces, mre: &Mre) -> u16 {
    let rpf_ifindex = match mre.kind {
        MreKind::Sg => mre.rpf_interface_s(),
        _ => mre.rpf_interface_rp(),
    };
    rpf_ifindex
        .and_then(|ifindex| interfaces.get_by_ifindex(ifindex))
        .map(|iface| iface.config.jp_period)
        .unwrap_or(JOIN_PRUNE_PERIOD)
}

// The override window of the entry's RPF interface.
fn t_override(
    interfaces: &Interfaces,
    state: &InstanceState,
    mre: &Mre,
) -> Duration {
    let rpf_ifindex = match mre.kind {
        MreKind::Sg => mre.rpf_interface_s(),
        _ => mre.rpf_interface_rp(),
    };
    rpf_ifindex
        .and_then(|ifindex| interfaces.get_by_ifindex(ifindex))
        .map(|iface| iface.jp_override_interval(&state.neighbors))
        .unwrap_or(Duration::from_millis(
            u64::from(crate::consts::LAN_DELAY_MSEC)
                + u64::from(crate::consts::OVERRIDE_INTERVAL_MSEC),
        ))
}

// A uniformly random delay within the override window, to avoid
// synchronized override Joins on the LAN.
fn random_override(
    interfaces: &Interfaces,
    state: &InstanceState,
    mre: &Mre,
) -> Duration {
    let t_override = t_override(interfaces, state, mre);
    Duration::from_millis(
        rand::rng().random_range(0..=t_override.as_millis() as u64),
    )
}

// Join suppression is in effect unless every neighbor on the RPF link
// announced tracking support (the LAN Prune Delay T-bit).
fn suppression_enabled(
    interfaces: &Interfaces,
    state: &InstanceState,
    mre: &Mre,
) -> bool {
    let rpf_ifindex = match mre.kind {
        MreKind::Sg => mre.rpf_interface_s(),
        _ => mre.rpf_interface_rp(),
    };
    let Some(ifindex) = rpf_ifindex else {
        return true;
    };
    !state
        .neighbors
        .values()
        .filter(|nbr| nbr.ifindex == ifindex)
        .all(|nbr| {
            nbr.lan_prune_delay
                .as_ref()
                .is_some_and(|opt| opt.t_bit)
        })
}
