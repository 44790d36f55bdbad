//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::consts::{
    ASSERT_MAX_METRIC, ASSERT_MAX_METRIC_PREFERENCE, ASSERT_OVERRIDE_INTERVAL,
    ASSERT_WRONGVIF_RATE_LIMIT,
};
use crate::debug::Debug;
use crate::instance::ProtocolInputChannelsTx;
use crate::mre::Mre;
use crate::tasks;

// Per-interface Assert state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    #[default]
    NoInfo,
    Winner,
    Loser,
}

// Assert metric tuple, compared lexicographically; the numerically-higher
// address wins ties.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AssertMetric {
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub metric: u32,
    pub addr: Ipv4Addr,
}

// Outcome of an Assert event that the caller must act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssertAction {
    SendAssert,
}

// ===== impl AssertMetric =====

impl AssertMetric {
    // The metric used when there is no route toward the source or RP.
    pub(crate) fn infinite(addr: Ipv4Addr) -> AssertMetric {
        AssertMetric {
            rpt_bit: true,
            metric_preference: ASSERT_MAX_METRIC_PREFERENCE,
            metric: ASSERT_MAX_METRIC,
            addr,
        }
    }

    pub(crate) fn is_better_than(&self, other: &AssertMetric) -> bool {
        if self.rpt_bit != other.rpt_bit {
            return !self.rpt_bit;
        }
        if self.metric_preference != other.metric_preference {
            return self.metric_preference < other.metric_preference;
        }
        if self.metric != other.metric {
            return self.metric < other.metric;
        }
        self.addr > other.addr
    }
}

// ===== global functions =====

// This router's assert metric for the entry on the given interface:
// the unicast route toward S for (S,G) asserts, toward the RP with the
// RPT-bit set for (*,G) asserts.
pub(crate) fn my_assert_metric(mre: &Mre, my_addr: Ipv4Addr) -> AssertMetric {
    if let Some(mrib) = &mre.mrib_s
        && mre.is_spt()
    {
        return AssertMetric {
            rpt_bit: false,
            metric_preference: mrib.metric_preference,
            metric: mrib.metric,
            addr: my_addr,
        };
    }
    if let Some(mrib) = &mre.mrib_rp {
        return AssertMetric {
            rpt_bit: true,
            metric_preference: mrib.metric_preference,
            metric: mrib.metric,
            addr: my_addr,
        };
    }
    AssertMetric::infinite(my_addr)
}

// Assert reception. Returns whether an Assert of our own must go out.
pub(crate) fn receive_assert(
    mre: &mut Mre,
    ifindex: u32,
    their_metric: AssertMetric,
    my_metric: AssertMetric,
    assert_time: u16,
    tx: &ProtocolInputChannelsTx,
) -> Option<AssertAction> {
    let mre_id = mre.id;
    let assert = mre.asserts.entry(ifindex).or_default();
    let old_state = assert.state;

    if my_metric.is_better_than(&their_metric) {
        // Our metric wins: (re)assert ourselves and rate-limit reasserts
        // with the override margin on the timer.
        assert.state = State::Winner;
        assert.winner_addr = None;
        assert.winner_metric = None;
        assert.assert_timer = Some(tasks::assert_timer(
            mre_id,
            ifindex,
            winner_refresh_interval(assert_time),
            &tx.assert_timer,
        ));
        if old_state != State::Winner {
            log_state_change(mre, ifindex, old_state, State::Winner);
        }
        Some(AssertAction::SendAssert)
    } else {
        // The peer wins: track it as the Assert winner. The winner
        // overrides the MRIB-derived RPF' until its state expires.
        assert.state = State::Loser;
        assert.winner_addr = Some(their_metric.addr);
        assert.winner_metric = Some(their_metric);
        assert.assert_timer = Some(tasks::assert_timer(
            mre_id,
            ifindex,
            Duration::from_secs(assert_time.into()),
            &tx.assert_timer,
        ));
        if old_state != State::Loser {
            log_state_change(mre, ifindex, old_state, State::Loser);
        }
        None
    }
}

// Assert timer expiry: a Winner refreshes its claim, a Loser forgets the
// winner and falls back to the MRIB.
pub(crate) fn assert_timer_expiry(
    mre: &mut Mre,
    ifindex: u32,
    assert_time: u16,
    tx: &ProtocolInputChannelsTx,
) -> Option<AssertAction> {
    let mre_id = mre.id;
    let Some(assert) = mre.asserts.get_mut(&ifindex) else {
        return None;
    };
    let old_state = assert.state;

    match old_state {
        State::Winner => {
            assert.assert_timer = Some(tasks::assert_timer(
                mre_id,
                ifindex,
                winner_refresh_interval(assert_time),
                &tx.assert_timer,
            ));
            Some(AssertAction::SendAssert)
        }
        State::Loser => {
            assert.assert_timer = None;
            assert.winner_addr = None;
            assert.winner_metric = None;
            assert.state = State::NoInfo;
            log_state_change(mre, ifindex, old_state, State::NoInfo);
            None
        }
        State::NoInfo => None,
    }
}

// A WRONGVIF upcall reported downstream data on this interface. Asserts
// originated this way are throttled to one per second per (S,G,interface).
pub(crate) fn data_arrived_wrongvif(
    mre: &mut Mre,
    ifindex: u32,
    my_metric: AssertMetric,
    assert_time: u16,
    tx: &ProtocolInputChannelsTx,
) -> Option<AssertAction> {
    // Without a resolvable upstream there is nothing to assert.
    if my_metric.metric_preference == ASSERT_MAX_METRIC_PREFERENCE
        && my_metric.metric == ASSERT_MAX_METRIC
    {
        return None;
    }

    let mre_id = mre.id;
    let assert = mre.asserts.entry(ifindex).or_default();

    let now = Instant::now();
    if let Some(last) = assert.last_data_triggered
        && now.duration_since(last)
            < Duration::from_secs(ASSERT_WRONGVIF_RATE_LIMIT.into())
    {
        return None;
    }
    assert.last_data_triggered = Some(now);

    let old_state = assert.state;
    if old_state == State::NoInfo {
        assert.state = State::Winner;
        assert.assert_timer = Some(tasks::assert_timer(
            mre_id,
            ifindex,
            winner_refresh_interval(assert_time),
            &tx.assert_timer,
        ));
        log_state_change(mre, ifindex, old_state, State::Winner);
    }
    Some(AssertAction::SendAssert)
}

// Removes all Assert state on an interface (interface down, entry
// teardown).
pub(crate) fn clear(mre: &mut Mre, ifindex: u32) {
    if let Some(assert) = mre.asserts.get_mut(&ifindex) {
        let old_state = assert.state;
        assert.state = State::NoInfo;
        assert.winner_addr = None;
        assert.winner_metric = None;
        assert.assert_timer = None;
        if old_state != State::NoInfo {
            log_state_change(mre, ifindex, old_state, State::NoInfo);
        }
    }
}

// The Assert winner tracked on the given interface, if we lost there.
pub(crate) fn winner(mre: &Mre, ifindex: u32) -> Option<Ipv4Addr> {
    mre.asserts
        .get(&ifindex)
        .filter(|assert| assert.state == State::Loser)
        .and_then(|assert| assert.winner_addr)
}

// ===== helper functions =====

// Winners reassert one override interval ahead of the peers' expiry.
fn winner_refresh_interval(assert_time: u16) -> Duration {
    Duration::from_secs(
        assert_time.saturating_sub(ASSERT_OVERRIDE_INTERVAL).max(1).into(),
    )
}

fn log_state_change(
    mre: &Mre,
    ifindex: u32,
    old_state: State,
    state: State,
) {
    Debug::AssertStateChange(
        mre.kind,
        &mre.source,
        &mre.group,
        ifindex,
        &old_state,
        &state,
    )
    .log();
}

// ===== impl State =====

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::NoInfo => write!(f, "no-info"),
            State::Winner => write!(f, "winner"),
            State::Loser => write!(f, "loser"),
        }
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;

    #[test]
    fn test_metric_ordering() {
        let better = AssertMetric {
            rpt_bit: false,
            metric_preference: 100,
            metric: 5,
            addr: ip4!("10.0.0.2"),
        };
        let worse = AssertMetric {
            rpt_bit: false,
            metric_preference: 110,
            metric: 10,
            addr: ip4!("10.0.0.1"),
        };
        assert!(better.is_better_than(&worse));
        assert!(!worse.is_better_than(&better));

        // The RPT-bit dominates the numeric fields.
        let spt = AssertMetric { rpt_bit: false, ..worse };
        let rpt = AssertMetric { rpt_bit: true, ..better };
        assert!(spt.is_better_than(&rpt));

        // Full tie: the higher address wins.
        let low = AssertMetric {
            rpt_bit: false,
            metric_preference: 100,
            metric: 5,
            addr: ip4!("10.0.0.1"),
        };
        let high = AssertMetric { addr: ip4!("10.0.0.9"), ..low };
        assert!(high.is_better_than(&low));
        assert!(!low.is_better_than(&high));

        // Infinity loses to anything with a route.
        assert!(worse.is_better_than(&AssertMetric::infinite(ip4!("10.0.0.3"))));
    }
}
