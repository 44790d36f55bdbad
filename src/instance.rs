//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{
    Receiver, Sender, UnboundedReceiver, UnboundedSender,
};

use crate::debug::{Debug, InstanceInactiveReason, InterfaceInactiveReason};
use crate::error::Error;
use crate::ibus::IbusMsg;
use crate::interface::Interfaces;
use crate::mfc::MfcTable;
use crate::mrib::Mrib;
use crate::mrt::Mrt;
use crate::neighbor::Neighbors;
use crate::network::{self, AsyncSocket};
use crate::northbound::NorthboundMsg;
use crate::northbound::configuration::InstanceCfg;
use crate::packet::{DecodeError, PacketType};
use crate::rp::RpTable;
use crate::southbound::{self, MfcReq};
use crate::tasks;
use crate::tasks::Task;
use crate::tasks::messages::input::*;
use crate::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use crate::{events, northbound};

#[derive(Debug)]
pub struct Instance {
    // Instance name.
    pub name: String,
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: Option<InstanceState>,
    // Instance interfaces.
    pub interfaces: Interfaces,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
}

#[derive(Debug)]
pub struct InstanceState {
    // Shared receive socket and the multicast-routing socket.
    pub socket_rx: Arc<AsyncSocket>,
    pub mroute_socket: Arc<AsyncSocket>,
    _net_rx_task: Task<()>,
    _upcall_rx_task: Task<()>,
    _mfc_apply_task: Task<()>,

    // Requests to the kernel forwarding engine.
    pub southboundp: UnboundedSender<MfcReq>,

    // The PIM tables.
    pub neighbors: Neighbors,
    pub mrt: Mrt,
    pub mrib: Mrib,
    pub rps: RpTable,
    pub mfcs: MfcTable,

    // Message statistics.
    pub statistics: Statistics,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub discontinuity_time: Option<DateTime<Utc>>,
    pub errors: ErrorStatistics,
    pub msgs_rcvd: MessageStatistics,
    pub msgs_sent: MessageStatistics,
}

#[derive(Debug, Default)]
pub struct ErrorStatistics {
    pub total: u64,
    pub checksum: u64,
    pub malformed: u64,
    pub unknown_type: u64,
    pub unknown_family: u64,
    pub no_hello_neighbor: u64,
}

#[derive(Debug, Default)]
pub struct MessageStatistics {
    pub total: u64,
    pub hello: u64,
    pub register: u64,
    pub register_stop: u64,
    pub join_prune: u64,
    pub assert: u64,
    pub bootstrap: u64,
    pub other: u64,
}

pub struct InstanceUpView<'a> {
    pub name: &'a str,
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a InstanceChannelsTx,
}

#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub protocol_input: ProtocolInputChannelsTx,
    pub ibus: UnboundedSender<IbusMsg>,
    pub northbound: UnboundedSender<NorthboundMsg>,
    #[cfg(feature = "testing")]
    pub protocol_output: Sender<ProtocolOutputMsg>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    pub net_packet_rx: Sender<NetRxPacketMsg>,
    pub hello_interval: Sender<HelloIntervalMsg>,
    pub triggered_hello: Sender<TriggeredHelloMsg>,
    pub nbr_timeout: Sender<NbrTimeoutMsg>,
    pub jp_send_timer: Sender<JpSendTimerMsg>,
    pub join_timer: Sender<JoinTimerMsg>,
    pub override_timer: Sender<OverrideTimerMsg>,
    pub expiry_timer: Sender<ExpiryTimerMsg>,
    pub prune_pending_timer: Sender<PrunePendingTimerMsg>,
    pub assert_timer: Sender<AssertTimerMsg>,
    pub keepalive_timer: Sender<KeepaliveTimerMsg>,
    pub register_stop_timer: Sender<RegisterStopTimerMsg>,
    pub mrt_task_drain: UnboundedSender<MrtTaskDrainMsg>,
    pub dataflow_tick: Sender<DataflowTickMsg>,
    pub kernel_upcall: Sender<KernelUpcallMsg>,
    pub sg_count_upd: Sender<SgCountUpdMsg>,
    pub mfc_result: Sender<MfcResultMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub net_packet_rx: Receiver<NetRxPacketMsg>,
    pub hello_interval: Receiver<HelloIntervalMsg>,
    pub triggered_hello: Receiver<TriggeredHelloMsg>,
    pub nbr_timeout: Receiver<NbrTimeoutMsg>,
    pub jp_send_timer: Receiver<JpSendTimerMsg>,
    pub join_timer: Receiver<JoinTimerMsg>,
    pub override_timer: Receiver<OverrideTimerMsg>,
    pub expiry_timer: Receiver<ExpiryTimerMsg>,
    pub prune_pending_timer: Receiver<PrunePendingTimerMsg>,
    pub assert_timer: Receiver<AssertTimerMsg>,
    pub keepalive_timer: Receiver<KeepaliveTimerMsg>,
    pub register_stop_timer: Receiver<RegisterStopTimerMsg>,
    pub mrt_task_drain: UnboundedReceiver<MrtTaskDrainMsg>,
    pub dataflow_tick: Receiver<DataflowTickMsg>,
    pub kernel_upcall: Receiver<KernelUpcallMsg>,
    pub sg_count_upd: Receiver<SgCountUpdMsg>,
    pub mfc_result: Receiver<MfcResultMsg>,
}

#[derive(Debug)]
pub struct InstanceChannelsRx {
    pub protocol_input: ProtocolInputChannelsRx,
    pub ibus: UnboundedReceiver<IbusMsg>,
    pub northbound: UnboundedReceiver<NorthboundMsg>,
    #[cfg(feature = "testing")]
    pub protocol_output: Receiver<ProtocolOutputMsg>,
}

// ===== impl Instance =====

impl Instance {
    pub fn new(name: String) -> (Instance, InstanceChannelsRx) {
        Debug::InstanceCreate.log();

        let (protocol_input_tx, protocol_input_rx) =
            protocol_input_channels();
        let (ibus_txp, ibus_rxc) = mpsc::unbounded_channel();
        let (northbound_txp, northbound_rxc) = mpsc::unbounded_channel();
        #[cfg(feature = "testing")]
        let (protocol_output_txp, protocol_output_rxc) = mpsc::channel(64);

        let tx = InstanceChannelsTx {
            protocol_input: protocol_input_tx,
            ibus: ibus_txp,
            northbound: northbound_txp,
            #[cfg(feature = "testing")]
            protocol_output: protocol_output_txp,
        };
        let rx = InstanceChannelsRx {
            protocol_input: protocol_input_rx,
            ibus: ibus_rxc,
            northbound: northbound_rxc,
            #[cfg(feature = "testing")]
            protocol_output: protocol_output_rxc,
        };

        let instance = Instance {
            name,
            config: Default::default(),
            state: None,
            interfaces: Default::default(),
            tx,
        };

        (instance, rx)
    }

    // Checks if the instance needs to be started or stopped in response
    // to a northbound event.
    pub(crate) fn update(&mut self) {
        match self.is_ready() {
            Ok(()) if !self.is_active() => {
                self.start();
            }
            Err(reason) if self.is_active() => {
                self.stop(reason);
            }
            _ => (),
        }
    }

    fn start(&mut self) {
        Debug::InstanceStart.log();

        match InstanceState::new(&self.tx) {
            Ok(state) => {
                self.state = Some(state);
                self.update_interfaces();
            }
            Err(error) => {
                Error::IoError(error).log();
            }
        }
    }

    fn stop(&mut self, reason: InstanceInactiveReason) {
        if !self.is_active() {
            return;
        }

        Debug::InstanceStop(reason).log();

        let (mut instance, interfaces) = self.as_up().unwrap();
        for iface in interfaces.iter_mut() {
            iface.stop(&mut instance, InterfaceInactiveReason::InstanceDown);
        }
        self.state = None;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_some()
    }

    fn is_ready(&self) -> Result<(), InstanceInactiveReason> {
        if !self.config.enabled {
            return Err(InstanceInactiveReason::AdminDown);
        }
        Ok(())
    }

    // Returns a view struct for the instance if it's operational.
    pub(crate) fn as_up(
        &mut self,
    ) -> Option<(InstanceUpView<'_>, &mut Interfaces)> {
        if let Some(state) = &mut self.state {
            let instance = InstanceUpView {
                name: &self.name,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            Some((instance, &mut self.interfaces))
        } else {
            None
        }
    }

    // Re-evaluates the activation of every interface.
    pub(crate) fn update_interfaces(&mut self) {
        let used_vifs = self.interfaces.used_vif_ids();
        if let Some(state) = &mut self.state {
            let mut instance = InstanceUpView {
                name: &self.name,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            for iface in self.interfaces.iter_mut() {
                iface.update(&mut instance, &used_vifs);
            }
        }
    }

    pub(crate) fn update_interface(&mut self, ifname: &str) {
        let used_vifs = self.interfaces.used_vif_ids();
        if let Some(state) = &mut self.state {
            let mut instance = InstanceUpView {
                name: &self.name,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            if let Some(iface) = self.interfaces.get_mut_by_name(ifname) {
                iface.update(&mut instance, &used_vifs);
            }
        }
    }

    pub(crate) fn rerun_dr_election(&mut self, ifname: &str) {
        if let Some(state) = &self.state
            && let Some(iface) = self.interfaces.get_mut_by_name(ifname)
            && iface.dr_election(&state.neighbors)
        {
            let Some((mut instance, interfaces)) = self.as_up() else {
                return;
            };
            events::dr_changed(&mut instance, interfaces);
        }
    }

    // The main event loop.
    pub async fn run(mut self, mut rx: InstanceChannelsRx) {
        self.update();

        loop {
            tokio::select! {
                msg = rx.protocol_input.recv() => {
                    match msg {
                        Some(msg) => self.process_protocol_msg(msg),
                        None => break,
                    }
                }
                Some(msg) = rx.ibus.recv() => {
                    self.process_ibus_msg(msg);
                }
                msg = rx.northbound.recv() => {
                    match msg {
                        Some(msg) => self.process_northbound_msg(msg),
                        None => break,
                    }
                }
            }
        }

        self.stop(InstanceInactiveReason::AdminDown);
        Debug::InstanceDelete.log();
    }

    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        // Ignore event if the instance isn't active.
        let Some((mut instance, interfaces)) = self.as_up() else {
            return;
        };

        if let Err(error) =
            events::process_protocol_msg(&mut instance, interfaces, msg)
        {
            error.log();
        }
    }

    pub fn process_ibus_msg(&mut self, msg: IbusMsg) {
        if let Err(error) = events::process_ibus_msg(self, msg) {
            error.log();
        }
    }

    pub fn process_northbound_msg(&mut self, msg: NorthboundMsg) {
        match msg {
            NorthboundMsg::Config(msg) => {
                northbound::configuration::process_config_msg(self, msg);
            }
            NorthboundMsg::Query(msg, replyp) => {
                let reply = northbound::state::process_query_msg(self, msg);
                let _ = replyp.send(reply);
            }
        }
    }

    // Structural invariant checks for the test suite.
    //
    //  1. Every non-null RPF-neighbor field resolves to a live neighbor
    //     whose dependent list carries the entry exactly once.
    //  2. The cached unicast snapshot entries match a fresh
    //     longest-prefix-match lookup.
    //  3. Every mirrored forwarding entry has a valid iif and an oif set
    //     equal to the current inherited olist.
    #[cfg(feature = "testing")]
    pub fn validate_invariants(&self) {
        let Some(state) = &self.state else {
            return;
        };

        for (_, mre) in state.mrt.iter() {
            let refs = [
                mre.nbr_mrib_next_hop_rp,
                mre.nbr_mrib_next_hop_s,
                mre.rpfp_nbr_wc,
                mre.rpfp_nbr_sg,
                mre.rpfp_nbr_sg_rpt,
            ];
            for key in refs.into_iter().flatten() {
                let nbr = state
                    .neighbors
                    .get(&key)
                    .unwrap_or_else(|| panic!("dangling RPF neighbor {key}"));
                assert_eq!(
                    nbr.attached_count(mre.kind, mre.id),
                    1,
                    "dependent list corrupt for neighbor {key}"
                );
            }

            // Fresh MRIB lookups must agree with the cached snapshot.
            if let Some(mrib_s) = &mre.mrib_s {
                let fresh = state.mrib.lookup(mre.source);
                assert_eq!(fresh, Some(mrib_s), "stale MRIB entry toward S");
            }
            if let (Some(mrib_rp), Some(rp_addr)) =
                (&mre.mrib_rp, mre.rp_addr.or_else(|| {
                    (mre.kind == crate::mre::MreKind::Rp)
                        .then_some(mre.source)
                }))
            {
                let fresh = state.mrib.lookup(rp_addr);
                assert_eq!(fresh, Some(mrib_rp), "stale MRIB entry toward RP");
            }
        }

        for mfc in state.mfcs.iter() {
            assert!(mfc.iif_vif.is_some(), "forwarding entry without iif");
            let mut oifs = crate::southbound::VifSet::default();
            for ifindex in state.mrt.inherited_olist_sg(
                mfc.source,
                mfc.group,
                &self.interfaces,
            ) {
                if ifindex == crate::mrt::REGISTER_VIF_IFINDEX {
                    continue;
                }
                let vif = self.interfaces.vif_id(ifindex);
                if vif == mfc.iif_vif {
                    continue;
                }
                if let Some(vif) = vif {
                    oifs.insert(vif);
                }
            }
            assert_eq!(
                mfc.oifs, oifs,
                "forwarding entry oifs diverge from the inherited olist"
            );

            // WRONGVIF signaling stays enabled exactly where asserts may
            // originate: the iif and the forwarding interfaces.
            assert_eq!(
                mfc.oifs.0 & mfc.oifs_disable_wrongvif.0,
                0,
                "WRONGVIF suppressed on a forwarding interface"
            );
            if let Some(iif) = mfc.iif_vif {
                assert!(
                    !mfc.oifs_disable_wrongvif.contains(iif),
                    "WRONGVIF suppressed on the incoming interface"
                );
            }
        }
    }
}

// ===== impl InstanceState =====

impl InstanceState {
    fn new(
        tx: &InstanceChannelsTx,
    ) -> Result<InstanceState, crate::error::IoError> {
        use crate::error::IoError;

        let socket_rx = network::socket_rx()
            .map_err(IoError::SocketError)
            .map(Arc::new)?;
        let mroute_socket = southbound::mroute_socket()
            .map_err(IoError::SocketError)
            .map(Arc::new)?;

        let net_rx_task = tasks::net_rx(
            socket_rx.clone(),
            &tx.protocol_input.net_packet_rx,
        );
        let upcall_rx_task = tasks::upcall_rx(
            mroute_socket.clone(),
            &tx.protocol_input.kernel_upcall,
        );
        let (southboundp, southbound_rxc) = mpsc::unbounded_channel();
        let mfc_apply_task = tasks::mfc_apply(
            mroute_socket.clone(),
            southbound_rxc,
            &tx.protocol_input.sg_count_upd,
            &tx.protocol_input.mfc_result,
            #[cfg(feature = "testing")]
            &tx.protocol_output,
        );

        Ok(InstanceState {
            socket_rx,
            mroute_socket,
            _net_rx_task: net_rx_task,
            _upcall_rx_task: upcall_rx_task,
            _mfc_apply_task: mfc_apply_task,
            southboundp,
            neighbors: Default::default(),
            mrt: Default::default(),
            mrib: Default::default(),
            rps: Default::default(),
            mfcs: Default::default(),
            statistics: Default::default(),
        })
    }
}

// ===== impl Statistics =====

impl Statistics {
    pub(crate) fn update(&mut self, pkt_type: PacketType, sent: bool) {
        self.discontinuity_time = Some(Utc::now());
        let stats = if sent {
            &mut self.msgs_sent
        } else {
            &mut self.msgs_rcvd
        };
        stats.total += 1;
        match pkt_type {
            PacketType::Hello => stats.hello += 1,
            PacketType::Register => stats.register += 1,
            PacketType::RegisterStop => stats.register_stop += 1,
            PacketType::JoinPrune => stats.join_prune += 1,
            PacketType::Assert => stats.assert += 1,
            PacketType::Bootstrap => stats.bootstrap += 1,
            PacketType::Graft
            | PacketType::GraftAck
            | PacketType::CandRpAdv => stats.other += 1,
        }
    }

    pub(crate) fn update_error(&mut self, error: &DecodeError) {
        self.errors.total += 1;
        match error {
            DecodeError::InvalidChecksum => self.errors.checksum += 1,
            DecodeError::UnknownPacketType(..) => {
                self.errors.unknown_type += 1
            }
            DecodeError::UnknownAddressFamily(..) => {
                self.errors.unknown_family += 1
            }
            _ => self.errors.malformed += 1,
        }
    }
}

// ===== impl ProtocolInputChannelsTx =====

impl ProtocolInputChannelsTx {
    // Signals the deferred-task drain; tasks run after the triggering
    // event but before the next poll.
    pub(crate) fn schedule_task_drain(&self) {
        let _ = self.mrt_task_drain.send(MrtTaskDrainMsg {});
    }

    #[cfg(feature = "testing")]
    pub fn test_stub() -> ProtocolInputChannelsTx {
        protocol_input_channels().0
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            biased;
            msg = self.mrt_task_drain.recv() => {
                msg.map(ProtocolInputMsg::MrtTaskDrain)
            }
            msg = self.net_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::NetRxPacket)
            }
            msg = self.hello_interval.recv() => {
                msg.map(ProtocolInputMsg::HelloInterval)
            }
            msg = self.triggered_hello.recv() => {
                msg.map(ProtocolInputMsg::TriggeredHello)
            }
            msg = self.nbr_timeout.recv() => {
                msg.map(ProtocolInputMsg::NbrTimeout)
            }
            msg = self.jp_send_timer.recv() => {
                msg.map(ProtocolInputMsg::JpSendTimer)
            }
            msg = self.join_timer.recv() => {
                msg.map(ProtocolInputMsg::JoinTimer)
            }
            msg = self.override_timer.recv() => {
                msg.map(ProtocolInputMsg::OverrideTimer)
            }
            msg = self.expiry_timer.recv() => {
                msg.map(ProtocolInputMsg::ExpiryTimer)
            }
            msg = self.prune_pending_timer.recv() => {
                msg.map(ProtocolInputMsg::PrunePendingTimer)
            }
            msg = self.assert_timer.recv() => {
                msg.map(ProtocolInputMsg::AssertTimer)
            }
            msg = self.keepalive_timer.recv() => {
                msg.map(ProtocolInputMsg::KeepaliveTimer)
            }
            msg = self.register_stop_timer.recv() => {
                msg.map(ProtocolInputMsg::RegisterStopTimer)
            }
            msg = self.dataflow_tick.recv() => {
                msg.map(ProtocolInputMsg::DataflowTick)
            }
            msg = self.kernel_upcall.recv() => {
                msg.map(ProtocolInputMsg::KernelUpcall)
            }
            msg = self.sg_count_upd.recv() => {
                msg.map(ProtocolInputMsg::SgCountUpd)
            }
            msg = self.mfc_result.recv() => {
                msg.map(ProtocolInputMsg::MfcResult)
            }
        }
    }
}

// ===== helper functions =====

fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (net_packet_rxp, net_packet_rxc) = mpsc::channel(4);
    let (hello_intervalp, hello_intervalc) = mpsc::channel(4);
    let (triggered_hellop, triggered_helloc) = mpsc::channel(4);
    let (nbr_timeoutp, nbr_timeoutc) = mpsc::channel(4);
    let (jp_send_timerp, jp_send_timerc) = mpsc::channel(4);
    let (join_timerp, join_timerc) = mpsc::channel(4);
    let (override_timerp, override_timerc) = mpsc::channel(4);
    let (expiry_timerp, expiry_timerc) = mpsc::channel(4);
    let (prune_pending_timerp, prune_pending_timerc) = mpsc::channel(4);
    let (assert_timerp, assert_timerc) = mpsc::channel(4);
    let (keepalive_timerp, keepalive_timerc) = mpsc::channel(4);
    let (register_stop_timerp, register_stop_timerc) = mpsc::channel(4);
    let (mrt_task_drainp, mrt_task_drainc) = mpsc::unbounded_channel();
    let (dataflow_tickp, dataflow_tickc) = mpsc::channel(4);
    let (kernel_upcallp, kernel_upcallc) = mpsc::channel(4);
    let (sg_count_updp, sg_count_updc) = mpsc::channel(4);
    let (mfc_resultp, mfc_resultc) = mpsc::channel(4);

    let tx = ProtocolInputChannelsTx {
        net_packet_rx: net_packet_rxp,
        hello_interval: hello_intervalp,
        triggered_hello: triggered_hellop,
        nbr_timeout: nbr_timeoutp,
        jp_send_timer: jp_send_timerp,
        join_timer: join_timerp,
        override_timer: override_timerp,
        expiry_timer: expiry_timerp,
        prune_pending_timer: prune_pending_timerp,
        assert_timer: assert_timerp,
        keepalive_timer: keepalive_timerp,
        register_stop_timer: register_stop_timerp,
        mrt_task_drain: mrt_task_drainp,
        dataflow_tick: dataflow_tickp,
        kernel_upcall: kernel_upcallp,
        sg_count_upd: sg_count_updp,
        mfc_result: mfc_resultp,
    };
    let rx = ProtocolInputChannelsRx {
        net_packet_rx: net_packet_rxc,
        hello_interval: hello_intervalc,
        triggered_hello: triggered_helloc,
        nbr_timeout: nbr_timeoutc,
        jp_send_timer: jp_send_timerc,
        join_timer: join_timerc,
        override_timer: override_timerc,
        expiry_timer: expiry_timerc,
        prune_pending_timer: prune_pending_timerc,
        assert_timer: assert_timerc,
        keepalive_timer: keepalive_timerc,
        register_stop_timer: register_stop_timerc,
        mrt_task_drain: mrt_task_drainc,
        dataflow_tick: dataflow_tickc,
        kernel_upcall: kernel_upcallc,
        sg_count_upd: sg_count_updc,
        mfc_result: mfc_resultc,
    };

    (tx, rx)
}
