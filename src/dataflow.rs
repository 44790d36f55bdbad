//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::DATAFLOW_TEST_FREQUENCY;
use crate::debug::Debug;
use crate::instance::ProtocolInputChannelsTx;
use crate::southbound::SgCount;
use crate::tasks::{self, IntervalTask};

// The two monitor kinds the core runs per (S,G): idle-expiry and
// SPT-switch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DataflowKind {
    Idle,
    SptSwitch,
}

// A fired threshold check, routed to the interested subsystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct DataflowSignal {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub kind: DataflowKind,
    pub threshold_interval: Duration,
    pub measured_interval: Duration,
    pub threshold_packets: Option<u64>,
    pub threshold_bytes: Option<u64>,
    pub measured_packets: u64,
    pub measured_bytes: u64,
    pub is_geq: bool,
}

// A per-(S,G) byte/packet threshold checker. The threshold interval is
// approximated by a sliding window: the kernel counter is sampled every
// interval/K seconds and the last K deltas are summed.
#[derive(Debug)]
pub struct DataflowMonitor {
    pub kind: DataflowKind,
    pub threshold_interval: Duration,
    // At least one threshold unit is set; exactly one comparison
    // direction applies.
    pub threshold_packets: Option<u64>,
    pub threshold_bytes: Option<u64>,
    pub is_geq: bool,

    deltas: [(u64, u64); DATAFLOW_TEST_FREQUENCY as usize],
    index: usize,
    samples: u32,
    last: Option<SgCount>,

    _tick_task: IntervalTask,
}

// ===== impl DataflowMonitor =====

impl DataflowMonitor {
    pub(crate) fn new(
        source: Ipv4Addr,
        group: Ipv4Addr,
        kind: DataflowKind,
        threshold_interval: Duration,
        threshold_packets: Option<u64>,
        threshold_bytes: Option<u64>,
        is_geq: bool,
        tx: &ProtocolInputChannelsTx,
    ) -> DataflowMonitor {
        debug_assert!(
            threshold_packets.is_some() || threshold_bytes.is_some()
        );

        let tick_task = tasks::dataflow_tick(
            source,
            group,
            kind,
            threshold_interval / DATAFLOW_TEST_FREQUENCY,
            &tx.dataflow_tick,
        );

        DataflowMonitor {
            kind,
            threshold_interval,
            threshold_packets,
            threshold_bytes,
            is_geq,
            deltas: Default::default(),
            index: 0,
            samples: 0,
            last: None,
            _tick_task: tick_task,
        }
    }

    // Feeds one kernel counter reading into the window and evaluates the
    // threshold. Returns the signal to deliver when it crossed.
    pub(crate) fn update(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        count: SgCount,
    ) -> Option<DataflowSignal> {
        let Some(last) = self.last.replace(count) else {
            // First reading establishes the baseline.
            return None;
        };

        // A decreasing counter means it wrapped (or the kernel entry was
        // replaced); this sample is unusable.
        if count.packets < last.packets || count.bytes < last.bytes {
            return None;
        }

        self.deltas[self.index] =
            (count.packets - last.packets, count.bytes - last.bytes);
        self.index = (self.index + 1) % self.deltas.len();
        self.samples = self.samples.saturating_add(1);

        // Until the ring is primed a "≤" check would report false idle.
        let primed = self.samples >= DATAFLOW_TEST_FREQUENCY;
        if !self.is_geq && !primed {
            return None;
        }

        let valid = if primed {
            self.deltas.len()
        } else {
            self.samples as usize
        };
        let measured_packets: u64 =
            self.deltas.iter().take(valid).map(|(p, _)| p).sum();
        let measured_bytes: u64 =
            self.deltas.iter().take(valid).map(|(_, b)| b).sum();

        let crossed = if self.is_geq {
            self.threshold_packets
                .is_some_and(|thr| measured_packets >= thr)
                || self.threshold_bytes.is_some_and(|thr| measured_bytes >= thr)
        } else {
            self.threshold_packets
                .is_some_and(|thr| measured_packets <= thr)
                || self.threshold_bytes.is_some_and(|thr| measured_bytes <= thr)
        };
        if !crossed {
            return None;
        }

        let signal = DataflowSignal {
            source,
            group,
            kind: self.kind,
            threshold_interval: self.threshold_interval,
            measured_interval: (self.threshold_interval
                / DATAFLOW_TEST_FREQUENCY)
                * valid as u32,
            threshold_packets: self.threshold_packets,
            threshold_bytes: self.threshold_bytes,
            measured_packets,
            measured_bytes,
            is_geq: self.is_geq,
        };
        Debug::DataflowSignal(
            &source,
            &group,
            match self.kind {
                DataflowKind::Idle => "idle",
                DataflowKind::SptSwitch => "spt-switch",
            },
        )
        .log();

        Some(signal)
    }
}

// ===== impl DataflowKind =====

impl std::fmt::Display for DataflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataflowKind::Idle => write!(f, "idle"),
            DataflowKind::SptSwitch => write!(f, "spt-switch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;
    use tokio::sync::mpsc;

    use super::*;
    use crate::instance::ProtocolInputChannelsTx;

    fn monitor(
        kind: DataflowKind,
        threshold_packets: Option<u64>,
        threshold_bytes: Option<u64>,
        is_geq: bool,
    ) -> (DataflowMonitor, ProtocolInputChannelsTx) {
        let tx = ProtocolInputChannelsTx::test_stub();
        let monitor = DataflowMonitor::new(
            ip4!("10.0.0.5"),
            ip4!("239.1.1.1"),
            kind,
            Duration::from_secs(100),
            threshold_packets,
            threshold_bytes,
            is_geq,
            &tx,
        );
        (monitor, tx)
    }

    fn feed(monitor: &mut DataflowMonitor, count: SgCount) -> Option<DataflowSignal> {
        monitor.update(ip4!("10.0.0.5"), ip4!("239.1.1.1"), count)
    }

    fn count(packets: u64, bytes: u64) -> SgCount {
        SgCount {
            packets,
            bytes,
            wrong_if: 0,
        }
    }

    #[test]
    fn test_geq_fires_on_traffic() {
        let (mut monitor, _tx) =
            monitor(DataflowKind::SptSwitch, None, Some(1000), true);

        // Baseline.
        assert!(feed(&mut monitor, count(0, 0)).is_none());
        // 1500 bytes in one sample crosses the 1000-byte threshold.
        let signal = feed(&mut monitor, count(10, 1500)).unwrap();
        assert_eq!(signal.measured_bytes, 1500);
        assert!(signal.is_geq);
    }

    #[test]
    fn test_leq_suppressed_until_primed() {
        let (mut monitor, _tx) =
            monitor(DataflowKind::Idle, Some(0), None, false);

        // Baseline plus three idle samples: not primed yet.
        assert!(feed(&mut monitor, count(100, 100)).is_none());
        for _ in 0..3 {
            assert!(feed(&mut monitor, count(100, 100)).is_none());
        }
        // The fourth idle sample primes the ring and fires.
        let signal = feed(&mut monitor, count(100, 100)).unwrap();
        assert_eq!(signal.measured_packets, 0);
        assert!(!signal.is_geq);
    }

    #[test]
    fn test_leq_not_fired_while_flowing() {
        let (mut monitor, _tx) =
            monitor(DataflowKind::Idle, Some(0), None, false);

        assert!(feed(&mut monitor, count(0, 0)).is_none());
        for i in 1..10u64 {
            // One packet per sample keeps the window sum above zero.
            assert!(feed(&mut monitor, count(i, i * 100)).is_none());
        }
    }

    #[test]
    fn test_counter_wrap_drops_sample() {
        let (mut monitor, _tx) =
            monitor(DataflowKind::SptSwitch, Some(5), None, true);

        assert!(feed(&mut monitor, count(1000, 1000)).is_none());
        // The counter went backwards: ignore, re-baseline.
        assert!(feed(&mut monitor, count(10, 10)).is_none());
        // Six packets since the new baseline fire the ≥5 check.
        assert!(feed(&mut monitor, count(16, 600)).is_some());
    }
}
