//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::instance::ProtocolInputChannelsTx;
use crate::mre::{Mre, MreKind};
use crate::tasks;

// Per-interface downstream state. RP/WC/SG entries use NoInfo, Join and
// PrunePending; SG-RPT entries use NoInfo, Pruned, PrunePending and the
// two temporary states of end-of-message processing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    #[default]
    NoInfo,
    Join,
    PrunePending,
    Pruned,
    PruneTmp,
    PrunePendingTmp,
}

// ===== global functions =====

// Join reception for RP/WC/SG entries: move to or refresh Join state.
pub(crate) fn receive_join(
    mre: &mut Mre,
    ifindex: u32,
    holdtime: u16,
    tx: &ProtocolInputChannelsTx,
) {
    debug_assert_ne!(mre.kind, MreKind::SgRpt);

    let mre_id = mre.id;
    let downstream = mre.downstream.entry(ifindex).or_default();
    let old_state = downstream.state;

    match old_state {
        State::NoInfo | State::Join | State::PrunePending => {
            downstream.prune_pending_timer = None;
            downstream.expiry_timer = Some(tasks::expiry_timer(
                mre_id,
                ifindex,
                Duration::from_secs(holdtime.into()),
                &tx.expiry_timer,
            ));
            if old_state != State::Join {
                change_state(mre, ifindex, old_state, State::Join);
            }
        }
        _ => (),
    }
}

// Prune reception for RP/WC/SG entries. A Prune in NoInfo is ignored;
// from Join the transition is delayed by the override interval so another
// downstream router may rescue the state.
pub(crate) fn receive_prune(
    mre: &mut Mre,
    ifindex: u32,
    prune_pending: Duration,
    tx: &ProtocolInputChannelsTx,
) {
    debug_assert_ne!(mre.kind, MreKind::SgRpt);

    let mre_id = mre.id;
    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    if old_state == State::Join {
        downstream.prune_pending_timer = Some(tasks::prune_pending_timer(
            mre_id,
            ifindex,
            prune_pending,
            &tx.prune_pending_timer,
        ));
        change_state(mre, ifindex, old_state, State::PrunePending);
    }
}

// (S,G,rpt) Prune reception.
pub(crate) fn receive_prune_sg_rpt(
    mre: &mut Mre,
    ifindex: u32,
    holdtime: u16,
    prune_pending: Duration,
    tx: &ProtocolInputChannelsTx,
) {
    debug_assert_eq!(mre.kind, MreKind::SgRpt);

    let mre_id = mre.id;
    let downstream = mre.downstream.entry(ifindex).or_default();
    let old_state = downstream.state;

    match old_state {
        State::NoInfo => {
            downstream.prune_pending_timer = Some(tasks::prune_pending_timer(
                mre_id,
                ifindex,
                prune_pending,
                &tx.prune_pending_timer,
            ));
            downstream.expiry_timer = Some(tasks::expiry_timer(
                mre_id,
                ifindex,
                Duration::from_secs(holdtime.into()),
                &tx.expiry_timer,
            ));
            change_state(mre, ifindex, old_state, State::PrunePending);
        }
        State::Pruned | State::PruneTmp => {
            downstream.expiry_timer = Some(tasks::expiry_timer(
                mre_id,
                ifindex,
                Duration::from_secs(holdtime.into()),
                &tx.expiry_timer,
            ));
            if old_state == State::PruneTmp {
                change_state(mre, ifindex, old_state, State::Pruned);
            }
        }
        State::PrunePendingTmp => {
            change_state(mre, ifindex, old_state, State::PrunePending);
        }
        _ => (),
    }
}

// (S,G,rpt) Join reception cancels any downstream rpt-prune state.
pub(crate) fn receive_join_sg_rpt(mre: &mut Mre, ifindex: u32) {
    debug_assert_eq!(mre.kind, MreKind::SgRpt);

    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    match old_state {
        State::Pruned
        | State::PrunePending
        | State::PruneTmp
        | State::PrunePendingTmp => {
            downstream.prune_pending_timer = None;
            downstream.expiry_timer = None;
            change_state(mre, ifindex, old_state, State::NoInfo);
        }
        _ => (),
    }
}

// Start of a group record carrying a (*,G) Join: rpt-prune state not
// re-announced in the same message is marked for expiry.
pub(crate) fn receive_join_wc_begin(mre: &mut Mre, ifindex: u32) {
    debug_assert_eq!(mre.kind, MreKind::SgRpt);

    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    match old_state {
        State::Pruned => {
            change_state(mre, ifindex, old_state, State::PruneTmp);
        }
        State::PrunePending => {
            change_state(mre, ifindex, old_state, State::PrunePendingTmp);
        }
        _ => (),
    }
}

// End of a Join/Prune message containing (*,G) state: any rpt-prune still
// in a temporary state wasn't re-announced and is dropped.
pub(crate) fn receive_end_of_message(mre: &mut Mre, ifindex: u32) {
    debug_assert_eq!(mre.kind, MreKind::SgRpt);

    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    match old_state {
        State::PruneTmp | State::PrunePendingTmp => {
            downstream.prune_pending_timer = None;
            downstream.expiry_timer = None;
            change_state(mre, ifindex, old_state, State::NoInfo);
        }
        _ => (),
    }
}

// Prune-Pending timer expiry.
pub(crate) fn prune_pending_timer_expiry(mre: &mut Mre, ifindex: u32) {
    let kind = mre.kind;
    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    if old_state == State::PrunePending {
        downstream.prune_pending_timer = None;
        let new_state = match kind {
            // The rpt-prune is now in effect; it lives until the Expiry
            // timer fires or a Join cancels it.
            MreKind::SgRpt => State::Pruned,
            _ => {
                downstream.expiry_timer = None;
                State::NoInfo
            }
        };
        change_state(mre, ifindex, old_state, new_state);
    }
}

// Expiry timer expiry removes all downstream state on the interface.
pub(crate) fn expiry_timer_expiry(mre: &mut Mre, ifindex: u32) {
    let Some(downstream) = mre.downstream.get_mut(&ifindex) else {
        return;
    };
    let old_state = downstream.state;

    if old_state != State::NoInfo {
        downstream.expiry_timer = None;
        downstream.prune_pending_timer = None;
        change_state(mre, ifindex, old_state, State::NoInfo);
    }
}

// ===== helper functions =====

fn change_state(mre: &mut Mre, ifindex: u32, old_state: State, state: State) {
    Debug::DownstreamStateChange(
        mre.kind,
        &mre.source,
        &mre.group,
        ifindex,
        &old_state,
        &state,
    )
    .log();

    let downstream = mre.downstream.get_mut(&ifindex).unwrap();
    downstream.state = state;
}

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::NoInfo => write!(f, "no-info"),
            State::Join => write!(f, "join"),
            State::PrunePending => write!(f, "prune-pending"),
            State::Pruned => write!(f, "pruned"),
            State::PruneTmp => write!(f, "prune-tmp"),
            State::PrunePendingTmp => write!(f, "prune-pending-tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;
    use crate::instance::ProtocolInputChannelsTx;
    use crate::mre::Mre;

    const IFINDEX: u32 = 1;

    fn entry(kind: MreKind) -> (Mre, ProtocolInputChannelsTx) {
        let mre = Mre::new(1, kind, ip4!("10.0.0.5"), ip4!("239.1.1.1"));
        (mre, ProtocolInputChannelsTx::test_stub())
    }

    fn state(mre: &Mre) -> State {
        mre.downstream
            .get(&IFINDEX)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    #[test]
    fn test_join_prune_override() {
        let (mut mre, tx) = entry(MreKind::Sg);

        // Join creates the state and arms the Expiry timer.
        receive_join(&mut mre, IFINDEX, 210, &tx);
        assert_eq!(state(&mre), State::Join);
        assert!(mre.downstream[&IFINDEX].expiry_timer.is_some());

        // A Prune only starts the Prune-Pending countdown.
        receive_prune(&mut mre, IFINDEX, Duration::from_secs(3), &tx);
        assert_eq!(state(&mre), State::PrunePending);
        assert!(mre.downstream[&IFINDEX].prune_pending_timer.is_some());

        // A competing downstream Join overrides the pending prune.
        receive_join(&mut mre, IFINDEX, 210, &tx);
        assert_eq!(state(&mre), State::Join);
        assert!(mre.downstream[&IFINDEX].prune_pending_timer.is_none());

        // An uncontested prune takes effect when the timer fires.
        receive_prune(&mut mre, IFINDEX, Duration::from_secs(3), &tx);
        prune_pending_timer_expiry(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::NoInfo);
    }

    #[test]
    fn test_prune_in_no_info_is_ignored() {
        let (mut mre, tx) = entry(MreKind::Wc);
        receive_prune(&mut mre, IFINDEX, Duration::ZERO, &tx);
        assert_eq!(state(&mre), State::NoInfo);
    }

    #[test]
    fn test_expiry_clears_state() {
        let (mut mre, tx) = entry(MreKind::Sg);
        receive_join(&mut mre, IFINDEX, 210, &tx);
        expiry_timer_expiry(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::NoInfo);
        assert!(mre.downstream[&IFINDEX].expiry_timer.is_none());
    }

    #[test]
    fn test_sg_rpt_prune_lifecycle() {
        let (mut mre, tx) = entry(MreKind::SgRpt);

        receive_prune_sg_rpt(
            &mut mre,
            IFINDEX,
            210,
            Duration::from_secs(3),
            &tx,
        );
        assert_eq!(state(&mre), State::PrunePending);

        prune_pending_timer_expiry(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::Pruned);

        // A (*,G) Join in a later message marks the prune for expiry...
        receive_join_wc_begin(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::PruneTmp);

        // ...unless the same message re-announces it.
        receive_prune_sg_rpt(
            &mut mre,
            IFINDEX,
            210,
            Duration::from_secs(3),
            &tx,
        );
        assert_eq!(state(&mre), State::Pruned);

        // Next time nothing re-announces it: end of message drops it.
        receive_join_wc_begin(&mut mre, IFINDEX);
        receive_end_of_message(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::NoInfo);
    }

    #[test]
    fn test_sg_rpt_join_cancels_prune() {
        let (mut mre, tx) = entry(MreKind::SgRpt);
        receive_prune_sg_rpt(
            &mut mre,
            IFINDEX,
            210,
            Duration::from_secs(3),
            &tx,
        );
        prune_pending_timer_expiry(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::Pruned);

        receive_join_sg_rpt(&mut mre, IFINDEX);
        assert_eq!(state(&mre), State::NoInfo);
    }
}
