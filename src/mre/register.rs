//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::consts::REGISTER_PROBE_TIME;
use crate::debug::Debug;
use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::mre::{Mre, MreFlags, MreKind, downstream};
use crate::mrt::{MreId, REGISTER_VIF_IFINDEX};
use crate::packet::Packet;
use crate::packet::register::RegisterMsg;
use crate::tasks;

// DR-side Register state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    #[default]
    NoInfo,
    Join,
    JoinPending,
    Prune,
}

// ===== global functions =====

// Invariant: while the Keepalive timer runs, CouldRegister holds iff the
// interface toward S is a DR interface, the source is directly connected
// and this router is not the group's RP.
pub(crate) fn could_register(mre: &Mre, interfaces: &Interfaces) -> bool {
    debug_assert_eq!(mre.kind, MreKind::Sg);

    if mre.keepalive_timer.is_none() {
        return false;
    }
    if !mre.is_directly_connected_s() {
        return false;
    }
    if mre.flags.contains(MreFlags::I_AM_RP) {
        return false;
    }
    mre.rpf_interface_s()
        .is_some_and(|ifindex| interfaces.i_am_dr(ifindex))
}

// Recomputes CouldRegister and drives the Register machine.
pub(crate) fn recompute_could_register(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    if mre.kind != MreKind::Sg {
        return;
    }

    let could = could_register(mre, interfaces);
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.flags.set(MreFlags::COULD_REGISTER, could);

    match (mre.register, could) {
        (State::NoInfo, true) => {
            change_state(mre, State::Join);
            add_register_tunnel(mre);
        }
        (State::Join | State::JoinPending | State::Prune, false) => {
            change_state(mre, State::NoInfo);
            mre.register_stop_timer = None;
            remove_register_tunnel(mre);
        }
        _ => (),
    }
}

// Register-Stop reception from the RP.
pub(crate) fn receive_register_stop(
    instance: &mut InstanceUpView<'_>,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();

    match mre.register {
        State::Join | State::JoinPending => {
            change_state(mre, State::Prune);
            remove_register_tunnel(mre);
            mre.register_stop_timer = Some(tasks::register_stop_timer(
                mre_id,
                register_stop_interval(
                    instance.config.register_suppression_time,
                    instance.config.register_probe_time,
                ),
                &instance.tx.protocol_input.register_stop_timer,
            ));
        }
        _ => (),
    }
}

// Register-Stop timer expiry: probe the RP shortly before resuming
// encapsulation.
pub(crate) fn register_stop_timer_expiry(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();

    match mre.register {
        State::Prune => {
            change_state(mre, State::JoinPending);
            mre.register_stop_timer = Some(tasks::register_stop_timer(
                mre_id,
                Duration::from_secs(
                    instance.config.register_probe_time.into(),
                ),
                &instance.tx.protocol_input.register_stop_timer,
            ));

            send_null_register(state.mrt.get(idx).unwrap(), interfaces);
        }
        State::JoinPending => {
            change_state(mre, State::Join);
            mre.register_stop_timer = None;
            add_register_tunnel(mre);
        }
        _ => (),
    }
}

// The group's RP changed: suppression toward the old RP is void.
pub(crate) fn rp_changed(instance: &mut InstanceUpView<'_>, mre_id: MreId) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();

    match mre.register {
        State::Prune | State::JoinPending => {
            change_state(mre, State::Join);
            mre.register_stop_timer = None;
            add_register_tunnel(mre);
        }
        _ => (),
    }
}

// Whether data from this source must be register-encapsulated to the RP.
pub(crate) fn is_encapsulating(mre: &Mre) -> bool {
    mre.register == State::Join
}

// ===== helper functions =====

// The register tunnel is join state on the virtual Register interface,
// not a kernel mutation.
fn add_register_tunnel(mre: &mut Mre) {
    let downstream =
        mre.downstream.entry(REGISTER_VIF_IFINDEX).or_default();
    downstream.state = downstream::State::Join;
}

fn remove_register_tunnel(mre: &mut Mre) {
    mre.downstream.remove(&REGISTER_VIF_IFINDEX);
}

// Randomized suppression: random(0.5, 1.5) × suppression − probe,
// clamped to at least one second.
fn register_stop_interval(suppression: u16, probe: u16) -> Duration {
    let suppression_ms = u64::from(suppression) * 1000;
    let probe_ms = u64::from(probe) * 1000;
    let interval = rand::rng()
        .random_range((suppression_ms / 2)..=(suppression_ms * 3 / 2))
        .saturating_sub(probe_ms)
        .max(1000);
    Duration::from_millis(interval)
}

// Header-only Register probing whether the RP still wants suppression.
fn send_null_register(mre: &Mre, interfaces: &Interfaces) {
    let Some(rp_addr) = mre.rp_addr else {
        return;
    };
    let Some(ifindex) = mre.rpf_interface_rp() else {
        return;
    };
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return;
    };

    let msg = RegisterMsg {
        border: false,
        null_register: true,
        data: Bytes::new(),
    };
    iface.send_packet(rp_addr, Packet::Register(msg));
}

fn change_state(mre: &mut Mre, state: State) {
    Debug::RegisterStateChange(
        &mre.source,
        &mre.group,
        &mre.register,
        &state,
    )
    .log();
    mre.register = state;
}

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::NoInfo => write!(f, "no-info"),
            State::Join => write!(f, "join"),
            State::JoinPending => write!(f, "join-pending"),
            State::Prune => write!(f, "prune"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_stop_interval_bounds() {
        use crate::consts::REGISTER_SUPPRESSION_TIME;

        for _ in 0..100 {
            let interval = register_stop_interval(
                REGISTER_SUPPRESSION_TIME,
                REGISTER_PROBE_TIME,
            );
            // random(0.5, 1.5) × 60s − 5s, never below one second.
            assert!(interval >= Duration::from_secs(1));
            assert!(interval >= Duration::from_secs(25));
            assert!(interval <= Duration::from_secs(85));
        }
    }
}
