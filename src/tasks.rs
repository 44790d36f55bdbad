//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::{Sender, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio::{task, time};
use tracing::{Instrument, debug_span, error};

use crate::network;
use crate::southbound;

//
// PIM tasks diagram:
//                                 +--------------+
//                                 |  northbound  |
//                                 +--------------+
//                                       | ^
//                                       | |
//                    northbound_rx (1x) V | (1x) northbound_tx
//                                 +--------------+
//                  net_rx (1x) -> |              |
//               upcall_rx (1x) -> |              | -> (Nx) net_tx
//        hello timers (Nx/1x)  -> |   instance   | -> (1x) southbound
//     entry/neighbor timers    -> |              |
//         dataflow ticks (Nx)  -> |              |
//                                 +--------------+
//                              ibus_tx (1x) | ^ (1x) ibus_rx
//                                           | |
//                                           V |
//                                 +--------------+
//                                 |     ibus     |
//                                 +--------------+
//

// PIM inter-task message types.
pub mod messages {
    use std::net::Ipv4Addr;

    use serde::{Deserialize, Serialize};

    use crate::dataflow::DataflowKind;
    use crate::mrt::MreId;
    use crate::neighbor::NeighborKey;
    use crate::packet::{DecodeResult, Packet};
    use crate::southbound::{MfcReq, SgCount, Upcall};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum ProtocolMsg {
            NetRxPacket(NetRxPacketMsg),
            HelloInterval(HelloIntervalMsg),
            TriggeredHello(TriggeredHelloMsg),
            NbrTimeout(NbrTimeoutMsg),
            JpSendTimer(JpSendTimerMsg),
            JoinTimer(JoinTimerMsg),
            OverrideTimer(OverrideTimerMsg),
            ExpiryTimer(ExpiryTimerMsg),
            PrunePendingTimer(PrunePendingTimerMsg),
            AssertTimer(AssertTimerMsg),
            KeepaliveTimer(KeepaliveTimerMsg),
            RegisterStopTimer(RegisterStopTimerMsg),
            MrtTaskDrain(MrtTaskDrainMsg),
            DataflowTick(DataflowTickMsg),
            KernelUpcall(KernelUpcallMsg),
            SgCountUpd(SgCountUpdMsg),
            MfcResult(MfcResultMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NetRxPacketMsg {
            pub ifindex: u32,
            pub src: Ipv4Addr,
            pub packet: DecodeResult<Packet>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct HelloIntervalMsg {
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TriggeredHelloMsg {
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrTimeoutMsg {
            pub key: NeighborKey,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct JpSendTimerMsg {
            pub key: NeighborKey,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct JoinTimerMsg {
            pub mre_id: MreId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct OverrideTimerMsg {
            pub mre_id: MreId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct ExpiryTimerMsg {
            pub mre_id: MreId,
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct PrunePendingTimerMsg {
            pub mre_id: MreId,
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct AssertTimerMsg {
            pub mre_id: MreId,
            pub ifindex: u32,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct KeepaliveTimerMsg {
            pub mre_id: MreId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct RegisterStopTimerMsg {
            pub mre_id: MreId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct MrtTaskDrainMsg {}

        #[derive(Debug, Deserialize, Serialize)]
        pub struct DataflowTickMsg {
            pub source: Ipv4Addr,
            pub group: Ipv4Addr,
            pub kind: DataflowKind,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct KernelUpcallMsg {
            pub upcall: Upcall,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct SgCountUpdMsg {
            pub source: Ipv4Addr,
            pub group: Ipv4Addr,
            pub kind: DataflowKind,
            pub count: SgCount,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct MfcResultMsg {
            pub source: Ipv4Addr,
            pub group: Ipv4Addr,
            pub success: bool,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use super::*;

        #[derive(Debug, Serialize)]
        pub enum ProtocolMsg {
            NetTxPacket(NetTxPacketMsg),
            Mfc(MfcReq),
        }

        #[derive(Clone, Debug, Serialize)]
        pub struct NetTxPacketMsg {
            #[cfg(feature = "testing")]
            pub ifname: String,
            pub ifindex: u32,
            pub dst: Ipv4Addr,
            pub packet: Packet,
        }
    }
}

// ===== Task handles =====

/// A handle for an asynchronous task. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
}

/// A handle for a one-shot timer. Dropping the handle cancels the timer;
/// `reset` restarts it, optionally with a new duration.
#[derive(Debug)]
pub struct TimeoutTask {
    #[cfg(not(feature = "testing"))]
    inner: TimerInner,
}

/// A handle for a periodic timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct IntervalTask {
    #[cfg(not(feature = "testing"))]
    inner: TimerInner,
}

#[cfg(not(feature = "testing"))]
#[derive(Debug)]
struct TimerInner {
    _task: Task<()>,
    control: UnboundedSender<Option<Duration>>,
    next: Arc<Mutex<Instant>>,
}

// ===== impl Task =====

impl<T> Task<T> {
    /// Spawns a new asynchronous task, returning a handle for it.
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
        }
    }

    /// Spawns a task that is restarted if it panics, which keeps network
    /// receive loops alive in the face of malformed input. The task
    /// terminates for good once it completes normally.
    pub fn spawn_supervised<F, Fut>(spawn_fn: F) -> Task<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let join_handle = tokio::spawn(
            async move {
                loop {
                    let worker_task = Task::spawn(spawn_fn());
                    match worker_task.await {
                        Ok(_) => break,
                        Err(error) if error.is_panic() => {
                            error!("task panicked, restarting...");
                            continue;
                        }
                        Err(error) => {
                            error!(%error, "task failed");
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );
        Task { join_handle }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, task::JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.join_handle).poll(cx)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

// ===== impl TimeoutTask =====

impl TimeoutTask {
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(timeout: Duration, cb: F) -> TimeoutTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) =
            mpsc::unbounded_channel::<Option<Duration>>();

        let next = Arc::new(Mutex::new(Instant::now() + timeout));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let sleep = time::sleep(timeout);
                tokio::pin!(sleep);

                loop {
                    tokio::select! {
                        // Timeout has expired.
                        _ = &mut sleep => {
                            (cb)().await;
                            break;
                        }
                        message = control_rx.recv() => {
                            match message {
                                // Timeout has been restarted.
                                Some(new_timeout) => {
                                    let next = Instant::now()
                                        + new_timeout.unwrap_or(timeout);
                                    sleep.as_mut().reset(next);
                                    *next_child.lock().unwrap() = next;
                                }
                                // Timeout has been aborted.
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        TimeoutTask {
            inner: TimerInner {
                _task: task,
                control: control_tx,
                next,
            },
        }
    }

    /// Restarts the timeout, regardless of whether it has already expired.
    ///
    /// If a new timeout value isn't specified, the last value is reused.
    pub fn reset(&mut self, timeout: Option<Duration>) {
        #[cfg(not(feature = "testing"))]
        if self.inner.control.send(timeout).is_err() {
            error!("failed to reset timeout");
        }
    }

    /// Returns the remaining time before the timeout expires.
    pub fn remaining(&self) -> Duration {
        #[cfg(not(feature = "testing"))]
        {
            let next = self.inner.next.lock().unwrap();
            next.saturating_duration_since(Instant::now())
        }
        #[cfg(feature = "testing")]
        {
            Duration::ZERO
        }
    }
}

// ===== impl IntervalTask =====

impl IntervalTask {
    #[cfg(not(feature = "testing"))]
    pub fn new<F, Fut>(
        interval: Duration,
        tick_on_start: bool,
        mut cb: F,
    ) -> IntervalTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (control_tx, mut control_rx) =
            mpsc::unbounded_channel::<Option<Duration>>();

        let next = Arc::new(Mutex::new(Instant::now() + interval));
        let next_child = next.clone();

        let task = Task::spawn(
            async move {
                let mut ticker = if tick_on_start {
                    time::interval(interval)
                } else {
                    time::interval_at(Instant::now() + interval, interval)
                };

                loop {
                    tokio::select! {
                        // Interval timer has ticked.
                        _ = ticker.tick() => {
                            let next = Instant::now() + interval;
                            (cb)().await;
                            *next_child.lock().unwrap() = next;
                        }
                        message = control_rx.recv() => {
                            match message {
                                // Interval timer has been updated.
                                Some(new_interval) => {
                                    let new_interval =
                                        new_interval.unwrap_or(interval);
                                    ticker = time::interval(new_interval);
                                    *next_child.lock().unwrap() =
                                        Instant::now() + new_interval;
                                }
                                // Interval timer has been aborted.
                                None => break,
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        IntervalTask {
            inner: TimerInner {
                _task: task,
                control: control_tx,
                next,
            },
        }
    }

    /// Resets the interval.
    pub fn reset(&mut self, interval: Option<Duration>) {
        #[cfg(not(feature = "testing"))]
        if self.inner.control.send(interval).is_err() {
            error!("failed to reset interval");
        }
    }

    /// Returns the remaining time before the next interval tick.
    pub fn remaining(&self) -> Duration {
        #[cfg(not(feature = "testing"))]
        {
            let next = self.inner.next.lock().unwrap();
            next.saturating_duration_since(Instant::now())
        }
        #[cfg(feature = "testing")]
        {
            Duration::ZERO
        }
    }
}

// ===== PIM tasks =====

// Network Rx task.
pub(crate) fn net_rx(
    socket: Arc<crate::network::AsyncSocket>,
    net_packet_rxp: &Sender<messages::input::NetRxPacketMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let net_packet_rxp = net_packet_rxp.clone();

        Task::spawn_supervised(move || {
            let socket = socket.clone();
            let net_packet_rxp = net_packet_rxp.clone();
            async move {
                let _ = network::read_loop(socket, net_packet_rxp).await;
            }
            .in_current_span()
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Network Tx task.
#[allow(unused_mut)]
pub(crate) fn net_tx(
    socket: Arc<crate::network::AsyncSocket>,
    mut net_packet_txc: UnboundedReceiver<messages::output::NetTxPacketMsg>,
    #[cfg(feature = "testing")] proto_output_tx: &Sender<
        messages::ProtocolOutputMsg,
    >,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        Task::spawn(
            async move {
                network::write_loop(socket, net_packet_txc).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        let proto_output_tx = proto_output_tx.clone();
        Task::spawn(async move {
            // Relay message to the test framework.
            while let Some(msg) = net_packet_txc.recv().await {
                let msg = messages::ProtocolOutputMsg::NetTxPacket(msg);
                let _ = proto_output_tx.send(msg).await;
            }
        })
    }
}

// Kernel upcall Rx task.
pub(crate) fn upcall_rx(
    socket: Arc<crate::network::AsyncSocket>,
    upcallp: &Sender<messages::input::KernelUpcallMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("southbound");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let upcallp = upcallp.clone();

        Task::spawn_supervised(move || {
            let socket = socket.clone();
            let upcallp = upcallp.clone();
            async move {
                let _ = southbound::upcall_read_loop(socket, upcallp).await;
            }
            .in_current_span()
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Kernel MFC programming task.
#[allow(unused_mut)]
pub(crate) fn mfc_apply(
    socket: Arc<crate::network::AsyncSocket>,
    mut mfc_reqc: UnboundedReceiver<southbound::MfcReq>,
    sg_count_updp: &Sender<messages::input::SgCountUpdMsg>,
    mfc_resultp: &Sender<messages::input::MfcResultMsg>,
    #[cfg(feature = "testing")] proto_output_tx: &Sender<
        messages::ProtocolOutputMsg,
    >,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("southbound");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        let sg_count_updp = sg_count_updp.clone();
        let mfc_resultp = mfc_resultp.clone();
        Task::spawn(
            async move {
                southbound::apply_loop(
                    socket,
                    mfc_reqc,
                    sg_count_updp,
                    mfc_resultp,
                )
                .await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        let proto_output_tx = proto_output_tx.clone();
        Task::spawn(async move {
            // Relay message to the test framework.
            while let Some(msg) = mfc_reqc.recv().await {
                let msg = messages::ProtocolOutputMsg::Mfc(msg);
                let _ = proto_output_tx.send(msg).await;
            }
        })
    }
}

// Hello transmission interval.
pub(crate) fn hello_interval(
    ifindex: u32,
    interval: Duration,
    hello_intervalp: &Sender<messages::input::HelloIntervalMsg>,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let hello_intervalp = hello_intervalp.clone();
        IntervalTask::new(interval, true, move || {
            let hello_intervalp = hello_intervalp.clone();
            async move {
                let msg = messages::input::HelloIntervalMsg { ifindex };
                let _ = hello_intervalp.send(msg).await;
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}

// Randomly delayed Hello after an interface starts or a neighbor restart
// is detected.
pub(crate) fn triggered_hello(
    ifindex: u32,
    delay: Duration,
    triggered_hellop: &Sender<messages::input::TriggeredHelloMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let triggered_hellop = triggered_hellop.clone();
        TimeoutTask::new(delay, move || async move {
            let msg = messages::input::TriggeredHelloMsg { ifindex };
            let _ = triggered_hellop.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Neighbor liveness timeout.
pub(crate) fn nbr_timeout(
    key: crate::neighbor::NeighborKey,
    holdtime: Duration,
    nbr_timeoutp: &Sender<messages::input::NbrTimeoutMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let nbr_timeoutp = nbr_timeoutp.clone();
        TimeoutTask::new(holdtime, move || async move {
            let msg = messages::input::NbrTimeoutMsg { key };
            let _ = nbr_timeoutp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Join/Prune accumulator flush debounce.
pub(crate) fn jp_send_timer(
    key: crate::neighbor::NeighborKey,
    delay: Duration,
    jp_send_timerp: &Sender<messages::input::JpSendTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let jp_send_timerp = jp_send_timerp.clone();
        TimeoutTask::new(delay, move || async move {
            let msg = messages::input::JpSendTimerMsg { key };
            let _ = jp_send_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Upstream Join timer.
pub(crate) fn join_timer(
    mre_id: crate::mrt::MreId,
    timeout: Duration,
    join_timerp: &Sender<messages::input::JoinTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let join_timerp = join_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::JoinTimerMsg { mre_id };
            let _ = join_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// (S,G,rpt) upstream Override timer.
pub(crate) fn override_timer(
    mre_id: crate::mrt::MreId,
    timeout: Duration,
    override_timerp: &Sender<messages::input::OverrideTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let override_timerp = override_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::OverrideTimerMsg { mre_id };
            let _ = override_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Downstream Expiry timer.
pub(crate) fn expiry_timer(
    mre_id: crate::mrt::MreId,
    ifindex: u32,
    holdtime: Duration,
    expiry_timerp: &Sender<messages::input::ExpiryTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let expiry_timerp = expiry_timerp.clone();
        TimeoutTask::new(holdtime, move || async move {
            let msg = messages::input::ExpiryTimerMsg { mre_id, ifindex };
            let _ = expiry_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Downstream Prune-Pending timer.
pub(crate) fn prune_pending_timer(
    mre_id: crate::mrt::MreId,
    ifindex: u32,
    timeout: Duration,
    prune_pending_timerp: &Sender<messages::input::PrunePendingTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let prune_pending_timerp = prune_pending_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg =
                messages::input::PrunePendingTimerMsg { mre_id, ifindex };
            let _ = prune_pending_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Per-interface Assert timer.
pub(crate) fn assert_timer(
    mre_id: crate::mrt::MreId,
    ifindex: u32,
    timeout: Duration,
    assert_timerp: &Sender<messages::input::AssertTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let assert_timerp = assert_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::AssertTimerMsg { mre_id, ifindex };
            let _ = assert_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// (S,G) Keepalive timer.
pub(crate) fn keepalive_timer(
    mre_id: crate::mrt::MreId,
    timeout: Duration,
    keepalive_timerp: &Sender<messages::input::KeepaliveTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let keepalive_timerp = keepalive_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::KeepaliveTimerMsg { mre_id };
            let _ = keepalive_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Register-Stop timer.
pub(crate) fn register_stop_timer(
    mre_id: crate::mrt::MreId,
    timeout: Duration,
    register_stop_timerp: &Sender<messages::input::RegisterStopTimerMsg>,
) -> TimeoutTask {
    #[cfg(not(feature = "testing"))]
    {
        let register_stop_timerp = register_stop_timerp.clone();
        TimeoutTask::new(timeout, move || async move {
            let msg = messages::input::RegisterStopTimerMsg { mre_id };
            let _ = register_stop_timerp.send(msg).await;
        })
    }
    #[cfg(feature = "testing")]
    {
        TimeoutTask {}
    }
}

// Dataflow monitor sampling tick.
pub(crate) fn dataflow_tick(
    source: std::net::Ipv4Addr,
    group: std::net::Ipv4Addr,
    kind: crate::dataflow::DataflowKind,
    interval: Duration,
    dataflow_tickp: &Sender<messages::input::DataflowTickMsg>,
) -> IntervalTask {
    #[cfg(not(feature = "testing"))]
    {
        let dataflow_tickp = dataflow_tickp.clone();
        IntervalTask::new(interval, false, move || {
            let dataflow_tickp = dataflow_tickp.clone();
            async move {
                let msg = messages::input::DataflowTickMsg {
                    source,
                    group,
                    kind,
                };
                let _ = dataflow_tickp.send(msg).await;
            }
        })
    }
    #[cfg(feature = "testing")]
    {
        IntervalTask {}
    }
}
