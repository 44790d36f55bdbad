//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use itertools::Itertools;
use rand::Rng;

use crate::consts::{
    ALL_MULTICAST_ADDR, ALL_PIM_ROUTERS, HELLO_HOLDTIME_RATIO, HELLO_PERIOD,
    KEEPALIVE_PERIOD, RP_KEEPALIVE_PERIOD,
};
use crate::dataflow::DataflowKind;
use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::Error;
use crate::ibus::IbusMsg;
use crate::instance::{Instance, InstanceUpView};
use crate::interface::Interfaces;
use crate::join_prune::JpAction;
use crate::mfc;
use crate::mre::{
    MreFlags, MreKind, MreKindMask, assert, downstream, register, rpf,
    upstream,
};
use crate::mrt::{MreId, MrtTaskKind};
use crate::neighbor::{Neighbor, NeighborKey};
use crate::packet::assert::AssertMsg;
use crate::packet::hello::HelloMsg;
use crate::packet::join_prune::JoinPruneMsg;
use crate::packet::register::{RegisterMsg, RegisterStopMsg};
use crate::packet::{
    DecodeResult, EncodedGroup, Packet, PacketType, SourceAddrFlags,
};
use crate::southbound::{MfcReq, Upcall, UpcallKind};
use crate::tasks;
use crate::tasks::messages::ProtocolInputMsg;

// ===== Protocol message dispatch =====

pub(crate) fn process_protocol_msg(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    msg: ProtocolInputMsg,
) -> Result<(), Error> {
    match msg {
        // Received network packet.
        ProtocolInputMsg::NetRxPacket(msg) => {
            process_packet(instance, interfaces, msg.ifindex, msg.src, msg.packet)?;
        }
        // Periodic or triggered Hello transmission.
        ProtocolInputMsg::HelloInterval(msg) => {
            process_hello_interval(instance, interfaces, msg.ifindex);
        }
        ProtocolInputMsg::TriggeredHello(msg) => {
            process_triggered_hello(instance, interfaces, msg.ifindex);
        }
        // Neighbor liveness expired.
        ProtocolInputMsg::NbrTimeout(msg) => {
            process_nbr_timeout(instance, interfaces, msg.key);
        }
        // Flush the Join/Prune accumulator of one neighbor.
        ProtocolInputMsg::JpSendTimer(msg) => {
            process_jp_send(instance, interfaces, msg.key);
        }
        // Entry timers.
        ProtocolInputMsg::JoinTimer(msg) => {
            upstream::join_timer_expiry(instance, interfaces, msg.mre_id);
        }
        ProtocolInputMsg::OverrideTimer(msg) => {
            upstream::override_timer_expiry(instance, interfaces, msg.mre_id);
        }
        ProtocolInputMsg::ExpiryTimer(msg) => {
            process_downstream_expiry(
                instance, interfaces, msg.mre_id, msg.ifindex,
            );
        }
        ProtocolInputMsg::PrunePendingTimer(msg) => {
            process_prune_pending(
                instance, interfaces, msg.mre_id, msg.ifindex,
            );
        }
        ProtocolInputMsg::AssertTimer(msg) => {
            process_assert_timer(instance, interfaces, msg.mre_id, msg.ifindex);
        }
        ProtocolInputMsg::KeepaliveTimer(msg) => {
            keepalive_expired(instance, interfaces, msg.mre_id);
        }
        ProtocolInputMsg::RegisterStopTimer(msg) => {
            register::register_stop_timer_expiry(
                instance, interfaces, msg.mre_id,
            );
        }
        // Deferred whole-table work.
        ProtocolInputMsg::MrtTaskDrain(_msg) => {
            process_mrt_task_drain(instance, interfaces);
        }
        // Dataflow monitor plumbing.
        ProtocolInputMsg::DataflowTick(msg) => {
            process_dataflow_tick(instance, msg.source, msg.group, msg.kind);
        }
        ProtocolInputMsg::SgCountUpd(msg) => {
            process_sg_count_upd(
                instance, interfaces, msg.source, msg.group, msg.kind,
                msg.count,
            );
        }
        // Kernel upcall.
        ProtocolInputMsg::KernelUpcall(msg) => {
            process_upcall(instance, interfaces, msg.upcall);
        }
        // Kernel MFC programming outcome.
        ProtocolInputMsg::MfcResult(msg) => {
            mfc::process_install_result(
                instance, msg.source, msg.group, msg.success,
            );
        }
    }

    Ok(())
}

// ===== Network packet receipt =====

pub(crate) fn process_packet(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    packet: DecodeResult<Packet>,
) -> Result<(), Error> {
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return Err(Error::InterfaceNotFound(ifindex));
    };
    if !iface.is_active() {
        return Ok(());
    }
    let ifname = iface.name.clone();

    // Malformed packets only bump counters; they never touch state.
    let packet = match packet {
        Ok(packet) => packet,
        Err(error) => {
            instance.state.statistics.update_error(&error);
            return Err(Error::PacketDecodeError(ifindex, src, error));
        }
    };

    if instance.config.trace_opts.packets_rx {
        Debug::PacketRx(&ifname, &src, &packet).log();
    }
    instance.state.statistics.update(packet.pkt_type(), false);

    match packet {
        Packet::Hello(hello) => {
            process_hello(instance, interfaces, ifindex, src, hello)?;
        }
        Packet::JoinPrune(msg) => {
            process_join_prune(instance, interfaces, ifindex, src, msg)?;
        }
        Packet::Assert(msg) => {
            process_assert(instance, interfaces, ifindex, src, msg)?;
        }
        Packet::Register(msg) => {
            process_register(instance, interfaces, ifindex, src, msg)?;
        }
        Packet::RegisterStop(msg) => {
            process_register_stop(instance, interfaces, ifindex, src, msg)?;
        }
        // Bootstrap, Graft, Graft-Ack and Candidate-RP-Advertisement are
        // counted and ignored.
        Packet::Other(..) => (),
    }

    Ok(())
}

// ===== Hello =====

fn process_hello(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    hello: HelloMsg,
) -> Result<(), Error> {
    let state = &mut *instance.state;
    let key = NeighborKey { ifindex, addr: src };

    let default_holdtime =
        (HELLO_HOLDTIME_RATIO * f64::from(HELLO_PERIOD)) as u16;
    let new_neighbor = !state.neighbors.contains_key(&key);
    let nbr = state
        .neighbors
        .entry(key)
        .or_insert_with(|| Neighbor::new(ifindex, src));
    let changes =
        nbr.process_hello(&hello, default_holdtime, &instance.tx.protocol_input);

    if changes.expired {
        remove_neighbor(instance, interfaces, key);
        return Ok(());
    }

    if changes.genid_changed {
        // The neighbor restarted: it must relearn us and our Joins.
        let state = &mut *instance.state;
        if let Some(iface) = interfaces.get_mut_by_ifindex(ifindex)
            && let Some(iface_state) = &mut iface.state
            && iface_state.triggered_hello.is_none()
        {
            iface_state.triggered_hello = Some(tasks::triggered_hello(
                ifindex,
                Duration::from_millis(rand::rng().random_range(0..=5000)),
                &instance.tx.protocol_input.triggered_hello,
            ));
        }
        let nbr = state.neighbors.get_mut(&key).unwrap();
        let ids = nbr.start_processing();
        if !ids.is_empty() {
            state
                .mrt
                .enqueue_task_over(MrtTaskKind::NbrGenIdChanged(key), ids);
            instance.tx.protocol_input.schedule_task_drain();
        }
    }

    if new_neighbor || changes.dr_election_needed {
        let state = &mut *instance.state;
        if let Some(iface) = interfaces.get_mut_by_ifindex(ifindex)
            && iface.dr_election(&state.neighbors)
        {
            dr_changed(instance, interfaces);
        }
    }

    if new_neighbor {
        // A new neighbor may adopt the entries waiting for an upstream.
        orphan_rescan(instance, interfaces);
    }

    Ok(())
}

fn process_hello_interval(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
) {
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return;
    };
    let Some(iface_state) = &iface.state else {
        return;
    };

    let hello = iface.build_hello(iface_state.genid);
    iface.send_packet(ALL_PIM_ROUTERS, Packet::Hello(hello));
    instance.state.statistics.update(PacketType::Hello, true);
}

fn process_triggered_hello(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
) {
    if let Some(iface) = interfaces.get_mut_by_ifindex(ifindex)
        && let Some(iface_state) = &mut iface.state
    {
        iface_state.triggered_hello = None;
    }
    process_hello_interval(instance, interfaces, ifindex);
}

// ===== Join/Prune =====

// Per-record source classification.
#[derive(Default)]
struct JpRecord {
    rp_joins: Vec<Ipv4Addr>,
    rp_prunes: Vec<Ipv4Addr>,
    wc_joins: Vec<Ipv4Addr>,
    wc_prunes: Vec<Ipv4Addr>,
    sg_joins: Vec<Ipv4Addr>,
    sg_prunes: Vec<Ipv4Addr>,
    sg_rpt_joins: Vec<Ipv4Addr>,
    sg_rpt_prunes: Vec<Ipv4Addr>,
}

fn classify_record(group: &EncodedGroup, msg_joins: &[crate::packet::EncodedSource], msg_prunes: &[crate::packet::EncodedSource]) -> JpRecord {
    let mut rec = JpRecord::default();
    // A record whose group is the all-multicast range carries (*,*,RP)
    // state; the encoded sources are the RP addresses.
    let is_rp_record = group.addr == ALL_MULTICAST_ADDR
        && group.mask_len != Ipv4Addr::BITS as u8;

    for source in msg_joins {
        if source.flags.contains(SourceAddrFlags::WILDCARD) {
            if is_rp_record {
                rec.rp_joins.push(source.addr);
            } else {
                rec.wc_joins.push(source.addr);
            }
        } else if source.flags.contains(SourceAddrFlags::RPT) {
            rec.sg_rpt_joins.push(source.addr);
        } else {
            rec.sg_joins.push(source.addr);
        }
    }
    for source in msg_prunes {
        if source.flags.contains(SourceAddrFlags::WILDCARD) {
            if is_rp_record {
                rec.rp_prunes.push(source.addr);
            } else {
                rec.wc_prunes.push(source.addr);
            }
        } else if source.flags.contains(SourceAddrFlags::RPT) {
            rec.sg_rpt_prunes.push(source.addr);
        } else {
            rec.sg_prunes.push(source.addr);
        }
    }
    rec
}

fn process_join_prune(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    msg: JoinPruneMsg,
) -> Result<(), Error> {
    ensure_hello_neighbor(instance, interfaces, ifindex, src)?;

    let i_am_target = interfaces.is_my_addr(msg.upstream_nbr);
    let target_key = NeighborKey {
        ifindex,
        addr: msg.upstream_nbr,
    };
    let holdtime = msg.holdtime;
    let prune_pending = prune_pending_interval(instance, interfaces, ifindex);

    let mut touched: Vec<MreId> = Vec::new();
    let mut eom_groups: Vec<Ipv4Addr> = Vec::new();

    for record in &msg.groups {
        let group = record.group.addr;
        let rec = classify_record(&record.group, &record.joins, &record.prunes);

        // (*,*,RP) state: the encoded source is the RP address.
        for rp_addr in &rec.rp_joins {
            if i_am_target {
                let id = lookup_or_create(
                    instance,
                    interfaces,
                    *rp_addr,
                    ALL_MULTICAST_ADDR,
                    MreKindMask::RP,
                    MreKindMask::RP,
                    &mut touched,
                );
                if let Some(id) = id {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_join(mre, ifindex, holdtime, tx);
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *rp_addr, ALL_MULTICAST_ADDR,
                    MreKindMask::RP, target_key, JpAction::Join, holdtime,
                );
            }
        }
        for rp_addr in &rec.rp_prunes {
            if i_am_target {
                if let Some(id) = lookup_only(
                    instance, *rp_addr, ALL_MULTICAST_ADDR, MreKindMask::RP,
                    &mut touched,
                ) {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_prune(
                            mre, ifindex, prune_pending, tx,
                        );
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *rp_addr, ALL_MULTICAST_ADDR,
                    MreKindMask::RP, target_key, JpAction::Prune, holdtime,
                );
            }
        }

        // (*,G) state.
        if i_am_target && !rec.wc_joins.is_empty() {
            // Existing rpt-prune state for the group must be refreshed
            // within this message or expire with it.
            let sg_rpt_ids: Vec<_> = instance
                .state
                .mrt
                .group_sg_rpt_entries(group)
                .map(|mre| mre.id)
                .collect();
            for id in sg_rpt_ids {
                with_entry(instance, id, |mre, _| {
                    downstream::receive_join_wc_begin(mre, ifindex);
                });
                touched.push(id);
            }
            eom_groups.push(group);
        }
        for _rp_addr in &rec.wc_joins {
            if i_am_target {
                let id = lookup_or_create(
                    instance,
                    interfaces,
                    Ipv4Addr::UNSPECIFIED,
                    group,
                    MreKindMask::WC,
                    MreKindMask::WC,
                    &mut touched,
                );
                if let Some(id) = id {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_join(mre, ifindex, holdtime, tx);
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, Ipv4Addr::UNSPECIFIED, group,
                    MreKindMask::WC, target_key, JpAction::Join, holdtime,
                );
            }
        }
        for _rp_addr in &rec.wc_prunes {
            if i_am_target {
                if let Some(id) = lookup_only(
                    instance,
                    Ipv4Addr::UNSPECIFIED,
                    group,
                    MreKindMask::WC,
                    &mut touched,
                ) {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_prune(
                            mre, ifindex, prune_pending, tx,
                        );
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, Ipv4Addr::UNSPECIFIED, group,
                    MreKindMask::WC, target_key, JpAction::Prune, holdtime,
                );
            }
        }

        // (S,G,rpt) state. A Prune creates a transient entry even when
        // no (*,G) state exists yet.
        for source in &rec.sg_rpt_joins {
            if i_am_target {
                if let Some(id) = lookup_only(
                    instance, *source, group, MreKindMask::SG_RPT,
                    &mut touched,
                ) {
                    with_entry(instance, id, |mre, _| {
                        downstream::receive_join_sg_rpt(mre, ifindex);
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *source, group,
                    MreKindMask::SG_RPT, target_key, JpAction::Join, holdtime,
                );
            }
        }
        for source in &rec.sg_rpt_prunes {
            if i_am_target {
                let id = lookup_or_create(
                    instance,
                    interfaces,
                    *source,
                    group,
                    MreKindMask::SG_RPT,
                    MreKindMask::SG_RPT,
                    &mut touched,
                );
                if let Some(id) = id {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_prune_sg_rpt(
                            mre,
                            ifindex,
                            holdtime,
                            prune_pending,
                            tx,
                        );
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *source, group,
                    MreKindMask::SG_RPT, target_key, JpAction::Prune,
                    holdtime,
                );
            }
        }

        // (S,G) state.
        for source in &rec.sg_joins {
            if i_am_target {
                let id = lookup_or_create(
                    instance,
                    interfaces,
                    *source,
                    group,
                    MreKindMask::SG,
                    MreKindMask::SG,
                    &mut touched,
                );
                if let Some(id) = id {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_join(mre, ifindex, holdtime, tx);
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *source, group, MreKindMask::SG,
                    target_key, JpAction::Join, holdtime,
                );
            }
        }
        for source in &rec.sg_prunes {
            if i_am_target {
                if let Some(id) = lookup_only(
                    instance, *source, group, MreKindMask::SG, &mut touched,
                ) {
                    with_entry(instance, id, |mre, tx| {
                        downstream::receive_prune(
                            mre, ifindex, prune_pending, tx,
                        );
                    });
                }
            } else {
                seen_jp(
                    instance, interfaces, *source, group, MreKindMask::SG,
                    target_key, JpAction::Prune, holdtime,
                );
                // The matching (S,G,rpt) entry sees the prune too and may
                // need to rescue the shared tree.
                seen_jp(
                    instance, interfaces, *source, group,
                    MreKindMask::SG_RPT, target_key, JpAction::Prune,
                    holdtime,
                );
            }
        }
    }

    // End of message: rpt-prunes not refreshed alongside their (*,G)
    // Join are gone.
    for group in eom_groups {
        let sg_rpt_ids: Vec<_> = instance
            .state
            .mrt
            .group_sg_rpt_entries(group)
            .map(|mre| mre.id)
            .collect();
        for id in sg_rpt_ids {
            with_entry(instance, id, |mre, _| {
                downstream::receive_end_of_message(mre, ifindex);
            });
            touched.push(id);
        }
    }

    for id in touched.into_iter().unique() {
        entry_changed(instance, interfaces, id);
    }

    Ok(())
}

// ===== Assert =====

fn process_assert(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    msg: AssertMsg,
) -> Result<(), Error> {
    ensure_hello_neighbor(instance, interfaces, ifindex, src)?;

    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return Err(Error::InterfaceNotFound(ifindex));
    };
    let Some(my_addr) = iface.system.primary_addr else {
        return Ok(());
    };

    let group = msg.group.addr;
    let their_metric = assert::AssertMetric {
        rpt_bit: msg.rpt_bit,
        metric_preference: msg.metric_preference,
        metric: msg.metric,
        addr: src,
    };

    // An (S,G) Assert carries the source; a (*,G) Assert has the
    // RPT-bit set and no source of interest.
    let mut touched = Vec::new();
    let (source, mask) = if msg.rpt_bit || msg.source.is_unspecified() {
        (Ipv4Addr::UNSPECIFIED, MreKindMask::WC)
    } else {
        (msg.source, MreKindMask::SG)
    };
    let Some(id) =
        lookup_or_create(instance, interfaces, source, group, mask, mask, &mut touched)
    else {
        return Ok(());
    };

    let state = &mut *instance.state;
    let idx = state.mrt.index_by_id(id).unwrap();
    let my_metric =
        assert::my_assert_metric(state.mrt.get(idx).unwrap(), my_addr);
    let mre = state.mrt.get_mut(idx).unwrap();
    let action = assert::receive_assert(
        mre,
        ifindex,
        their_metric,
        my_metric,
        instance.config.assert_time,
        &instance.tx.protocol_input,
    );

    if action == Some(assert::AssertAction::SendAssert) {
        send_assert(instance, interfaces, ifindex, id);
    }

    // A new Assert winner overrides RPF'.
    rpf::recompute(instance, interfaces, id);
    entry_changed(instance, interfaces, id);

    Ok(())
}

fn process_assert_timer(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
    ifindex: u32,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    let action = assert::assert_timer_expiry(
        mre,
        ifindex,
        instance.config.assert_time,
        &instance.tx.protocol_input,
    );

    if action == Some(assert::AssertAction::SendAssert) {
        send_assert(instance, interfaces, ifindex, mre_id);
    }

    rpf::recompute(instance, interfaces, mre_id);
    entry_changed(instance, interfaces, mre_id);
}

fn send_assert(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    ifindex: u32,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(mre) = state.mrt.get_by_id(mre_id) else {
        return;
    };
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return;
    };
    let Some(my_addr) = iface.system.primary_addr else {
        return;
    };

    let metric = assert::my_assert_metric(mre, my_addr);
    let msg = AssertMsg {
        group: EncodedGroup::new(mre.group, Ipv4Addr::BITS as u8),
        source: match mre.kind {
            MreKind::Wc => Ipv4Addr::UNSPECIFIED,
            _ => mre.source,
        },
        rpt_bit: metric.rpt_bit,
        metric_preference: metric.metric_preference,
        metric: metric.metric,
    };
    iface.send_packet(ALL_PIM_ROUTERS, Packet::Assert(msg));
    instance.state.statistics.update(PacketType::Assert, true);
}

// ===== Register (RP side) and Register-Stop (DR side) =====

fn process_register(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
    msg: RegisterMsg,
) -> Result<(), Error> {
    // The inner IP header names the (S,G); Null-Registers carry a dummy
    // header.
    if msg.data.len() < 20 {
        return Ok(());
    }
    let inner_src = Ipv4Addr::new(
        msg.data[12],
        msg.data[13],
        msg.data[14],
        msg.data[15],
    );
    let inner_grp = Ipv4Addr::new(
        msg.data[16],
        msg.data[17],
        msg.data[18],
        msg.data[19],
    );

    // Not the RP for this group: tell the DR to stop at once.
    let i_am_rp = instance
        .state
        .rps
        .rp_find(inner_grp)
        .is_some_and(|rp_addr| interfaces.is_my_addr(rp_addr));
    if !i_am_rp {
        send_register_stop(instance, interfaces, ifindex, src, inner_src, inner_grp);
        return Ok(());
    }

    // Register reception keeps the (S,G) state alive at the RP.
    let mut touched = Vec::new();
    let Some(id) = lookup_or_create(
        instance,
        interfaces,
        inner_src,
        inner_grp,
        MreKindMask::SG,
        MreKindMask::SG,
        &mut touched,
    ) else {
        return Ok(());
    };
    start_keepalive(instance, id);

    let state = &mut *instance.state;
    let mre = state.mrt.get_by_id(id).unwrap();
    let send_stop = msg.null_register || mre.is_spt();
    if send_stop {
        send_register_stop(instance, interfaces, ifindex, src, inner_src, inner_grp);
    }

    entry_changed(instance, interfaces, id);

    Ok(())
}

fn send_register_stop(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    ifindex: u32,
    dst: Ipv4Addr,
    source: Ipv4Addr,
    group: Ipv4Addr,
) {
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return;
    };
    let msg = RegisterStopMsg {
        group: EncodedGroup::new(group, Ipv4Addr::BITS as u8),
        source,
    };
    iface.send_packet(dst, Packet::RegisterStop(msg));
    instance
        .state
        .statistics
        .update(PacketType::RegisterStop, true);
}

// The Register-Stop arrives unicast from the RP, which is usually not
// an on-link neighbor; no Hello state is expected.
fn process_register_stop(
    instance: &mut InstanceUpView<'_>,
    _interfaces: &mut Interfaces,
    _ifindex: u32,
    _src: Ipv4Addr,
    msg: RegisterStopMsg,
) -> Result<(), Error> {
    let state = &mut *instance.state;
    let Some(idx) =
        state.mrt.find(msg.source, msg.group.addr, MreKindMask::SG)
    else {
        return Ok(());
    };
    let id = state.mrt.get(idx).unwrap().id;
    register::receive_register_stop(instance, id);

    Ok(())
}

// ===== Kernel upcalls =====

fn process_upcall(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    upcall: Upcall,
) {
    Debug::KernelUpcall(&upcall).log();

    let Some(ifindex) = interfaces.ifindex_of_vif(upcall.vif) else {
        return;
    };

    match upcall.kind {
        UpcallKind::NoCache => {
            process_upcall_nocache(
                instance, interfaces, ifindex, upcall.source, upcall.group,
            );
        }
        UpcallKind::WrongVif => {
            // The reconciliation marks the vifs whose WRONGVIF signals
            // are of no interest; the kernel can't pre-filter them.
            if instance
                .state
                .mfcs
                .get(upcall.source, upcall.group)
                .is_some_and(|mfc| {
                    mfc.oifs_disable_wrongvif.contains(upcall.vif)
                })
            {
                return;
            }
            process_upcall_wrongvif(
                instance, interfaces, ifindex, upcall.source, upcall.group,
            );
        }
        UpcallKind::WholePacket => {
            process_upcall_wholepkt(instance, interfaces, &upcall);
        }
    }
}

// Data from a new source: build the (S,G) state and the forwarding
// entry.
fn process_upcall_nocache(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    source: Ipv4Addr,
    group: Ipv4Addr,
) {
    if group.is_unspecified() || source.is_unspecified() {
        return;
    }

    let mut touched = Vec::new();
    let Some(id) = lookup_or_create(
        instance,
        interfaces,
        source,
        group,
        MreKindMask::SG,
        MreKindMask::SG,
        &mut touched,
    ) else {
        return;
    };

    start_keepalive(instance, id);

    // Packets arriving on the source's RPF interface are on the SPT.
    // The SPT bit never clears within the entry's lifetime.
    let state = &mut *instance.state;
    let idx = state.mrt.index_by_id(id).unwrap();
    let mre = state.mrt.get_mut(idx).unwrap();
    if mre.rpf_interface_s() == Some(ifindex)
        || mre.is_directly_connected_s()
    {
        mre.flags.insert(MreFlags::SPT);
    }

    register::recompute_could_register(instance, interfaces, id);
    entry_changed(instance, interfaces, id);
}

// Data arrived on an outgoing interface: a duplicate forwarder exists,
// assert for the link.
fn process_upcall_wrongvif(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    source: Ipv4Addr,
    group: Ipv4Addr,
) {
    let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
        return;
    };
    let Some(my_addr) = iface.system.primary_addr else {
        return;
    };

    let state = &mut *instance.state;
    let Some(idx) = state.mrt.find(
        source,
        group,
        MreKindMask::SG | MreKindMask::WC,
    ) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    let id = mre.id;
    let my_metric = assert::my_assert_metric(mre, my_addr);

    let mre = state.mrt.get_mut(idx).unwrap();
    let action = assert::data_arrived_wrongvif(
        mre,
        ifindex,
        my_metric,
        instance.config.assert_time,
        &instance.tx.protocol_input,
    );
    if action == Some(assert::AssertAction::SendAssert) {
        send_assert(instance, interfaces, ifindex, id);
    }
}

// A whole packet for Register encapsulation on the DR.
fn process_upcall_wholepkt(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    upcall: &Upcall,
) {
    let state = &mut *instance.state;
    let Some(idx) =
        state.mrt.find(upcall.source, upcall.group, MreKindMask::SG)
    else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    let id = mre.id;
    if !register::is_encapsulating(mre) {
        return;
    }
    let Some(rp_addr) = mre.rp_addr else {
        return;
    };
    let Some(rpf_ifindex) = mre.rpf_interface_rp() else {
        return;
    };
    let Some(iface) = interfaces.get_by_ifindex(rpf_ifindex) else {
        return;
    };

    let msg = RegisterMsg {
        border: false,
        null_register: false,
        data: upcall.data.clone(),
    };
    iface.send_packet(rp_addr, Packet::Register(msg));
    instance.state.statistics.update(PacketType::Register, true);

    // Register traffic counts as liveness for the source.
    start_keepalive(instance, id);
}

// ===== Dataflow monitors =====

fn process_dataflow_tick(
    instance: &mut InstanceUpView<'_>,
    source: Ipv4Addr,
    group: Ipv4Addr,
    kind: DataflowKind,
) {
    // Only sample while the monitor is still attached.
    let Some(mfc) = instance.state.mfcs.get(source, group) else {
        return;
    };
    let attached = match kind {
        DataflowKind::Idle => mfc.idle_monitor.is_some(),
        DataflowKind::SptSwitch => mfc.spt_monitor.is_some(),
    };
    if !attached {
        return;
    }
    let _ = instance.state.southboundp.send(MfcReq::GetSgCount {
        source,
        group,
        kind,
    });
}

fn process_sg_count_upd(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    source: Ipv4Addr,
    group: Ipv4Addr,
    kind: DataflowKind,
    count: crate::southbound::SgCount,
) {
    let state = &mut *instance.state;
    let Some(mfc) = state.mfcs.get_mut(source, group) else {
        return;
    };
    let monitor = match kind {
        DataflowKind::Idle => mfc.idle_monitor.as_mut(),
        DataflowKind::SptSwitch => mfc.spt_monitor.as_mut(),
    };
    let Some(monitor) = monitor else {
        return;
    };
    let Some(signal) = monitor.update(source, group, count) else {
        return;
    };

    match signal.kind {
        // No traffic for a keepalive period: the (S,G) state expires.
        DataflowKind::Idle => {
            let Some(idx) =
                state.mrt.find(source, group, MreKindMask::SG)
            else {
                // Nothing justifies the forwarding entry anymore.
                mfc::uninstall(instance, source, group, true);
                return;
            };
            let id = state.mrt.get(idx).unwrap().id;
            keepalive_expired(instance, interfaces, id);
        }
        // Enough shared-tree traffic: switch to the source tree.
        DataflowKind::SptSwitch => {
            mfc.spt_monitor = None;
            mfc.flags
                .remove(crate::mfc::MfcFlags::HAS_SPT_SWITCH_DATAFLOW_MONITOR);
            spt_switch_desired(instance, interfaces, source, group);
        }
    }
}

fn spt_switch_desired(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    source: Ipv4Addr,
    group: Ipv4Addr,
) {
    Debug::SptSwitch(&source, &group).log();

    let mut touched = Vec::new();
    let Some(id) = lookup_or_create(
        instance,
        interfaces,
        source,
        group,
        MreKindMask::SG,
        MreKindMask::SG,
        &mut touched,
    ) else {
        return;
    };

    let state = &mut *instance.state;
    let idx = state.mrt.index_by_id(id).unwrap();
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.flags.insert(MreFlags::WAS_SPT_SWITCH_DESIRED);

    start_keepalive(instance, id);
    entry_changed(instance, interfaces, id);
}

pub(crate) fn keepalive_expired(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.keepalive_timer = None;

    register::recompute_could_register(instance, interfaces, mre_id);
    entry_changed(instance, interfaces, mre_id);
}

// (Re)starts the (S,G) keepalive; the RP's decapsulation entries use
// the longer RP period.
fn start_keepalive(instance: &mut InstanceUpView<'_>, mre_id: MreId) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    debug_assert_eq!(mre.kind, MreKind::Sg);

    let period = if mre.flags.contains(MreFlags::I_AM_RP) {
        RP_KEEPALIVE_PERIOD
    } else {
        KEEPALIVE_PERIOD
    };
    match &mut mre.keepalive_timer {
        Some(timer) => {
            timer.reset(Some(Duration::from_secs(period.into())));
        }
        None => {
            mre.keepalive_timer = Some(tasks::keepalive_timer(
                mre_id,
                Duration::from_secs(period.into()),
                &instance.tx.protocol_input.keepalive_timer,
            ));
        }
    }
}

// ===== Downstream timers =====

fn process_downstream_expiry(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
    ifindex: u32,
) {
    with_entry(instance, mre_id, |mre, _| {
        downstream::expiry_timer_expiry(mre, ifindex);
    });
    entry_changed(instance, interfaces, mre_id);
}

fn process_prune_pending(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
    ifindex: u32,
) {
    with_entry(instance, mre_id, |mre, _| {
        downstream::prune_pending_timer_expiry(mre, ifindex);
    });
    entry_changed(instance, interfaces, mre_id);
}

// ===== Join/Prune transmission =====

fn process_jp_send(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    key: NeighborKey,
) {
    let crate::instance::InstanceState {
        neighbors,
        mrt,
        statistics,
        ..
    } = &mut *instance.state;

    let Some(nbr) = neighbors.get_mut(&key) else {
        return;
    };
    nbr.jp_send_timer = None;
    if nbr.jp.is_empty() {
        return;
    }

    let mut agg = std::mem::take(&mut nbr.jp);
    agg.auto_insert_rpt_prunes(mrt, interfaces);

    let Some(iface) = interfaces.get_by_ifindex(key.ifindex) else {
        return;
    };
    // MTU minus the IP header and the Router Alert option.
    let max_payload = (iface.system.mtu.unwrap_or(1500) as usize)
        .min(crate::consts::PIM_MAX_PACKET)
        .saturating_sub(24);

    let packets = agg.build_packets(key.addr, max_payload);
    for packet in packets {
        iface.send_packet(ALL_PIM_ROUTERS, Packet::JoinPrune(packet));
        statistics.update(PacketType::JoinPrune, true);
    }
}

// ===== Neighbor lifecycle =====

fn process_nbr_timeout(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    key: NeighborKey,
) {
    Debug::NbrTimeout(&key).log();
    remove_neighbor(instance, interfaces, key);
}

// Removes a neighbor. Its dependent entries are spliced onto a deferred
// task that recomputes their RPF state.
pub(crate) fn remove_neighbor(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    key: NeighborKey,
) {
    let state = &mut *instance.state;
    let Some(nbr) = state.neighbors.remove(&key) else {
        return;
    };
    Debug::NbrDelete(&key).log();

    let ids = nbr.dependent_ids();
    if !ids.is_empty() {
        state
            .mrt
            .enqueue_task_over(MrtTaskKind::NbrDied(key), ids);
        instance.tx.protocol_input.schedule_task_drain();
    }

    let state = &mut *instance.state;
    if let Some(iface) = interfaces.get_mut_by_ifindex(key.ifindex)
        && iface.dr_election(&state.neighbors)
    {
        dr_changed(instance, interfaces);
    }
}

// ===== Deferred task drain =====

fn process_mrt_task_drain(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    let Some((kind, batch)) = instance.state.mrt.next_task_batch() else {
        return;
    };
    Debug::MrtTaskDrain(&kind, batch.len()).log();

    match &kind {
        MrtTaskKind::RpSetChanged => {
            for id in batch {
                rebind_group_rp(instance, interfaces, id);
            }
        }
        MrtTaskKind::MribChanged(prefixes) => {
            for id in batch {
                let state = &*instance.state;
                let Some(mre) = state.mrt.get_by_id(id) else {
                    continue;
                };
                let affected = crate::mrib::Mrib::is_covered(
                    mre.source, prefixes,
                ) || mre.rp_addr.is_some_and(|rp_addr| {
                    crate::mrib::Mrib::is_covered(rp_addr, prefixes)
                });
                if affected {
                    rpf::recompute(instance, interfaces, id);
                    entry_changed(instance, interfaces, id);
                }
            }
        }
        MrtTaskKind::NbrGenIdChanged(key) => {
            for id in batch {
                upstream::genid_changed(instance, interfaces, id);
                let state = &mut *instance.state;
                if let Some(kind) =
                    state.mrt.get_by_id(id).map(|mre| mre.kind)
                    && let Some(nbr) = state.neighbors.get_mut(key)
                {
                    nbr.finish_processing(kind, id);
                }
            }
        }
        MrtTaskKind::NbrDied(_key) => {
            for id in batch {
                rpf::recompute(instance, interfaces, id);
                entry_changed(instance, interfaces, id);
            }
        }
    }

    // Remaining batches run on the next loop turn.
    if instance.state.mrt.has_tasks() {
        instance.tx.protocol_input.schedule_task_drain();
    }
}

// Rebinds RP(G) for one entry after an RP-set change. The WC, SG and
// SG-RPT entries of a group all converge on the same mapping within the
// sweep.
fn rebind_group_rp(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();
    if mre.kind == MreKind::Rp {
        return;
    }

    let new_rp = state.rps.rp_find(mre.group);
    if mre.rp_addr == new_rp {
        return;
    }

    let group = mre.group;
    let kind = mre.kind;
    Debug::RpChange(&group, &new_rp).log();
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.rp_addr = new_rp;

    if kind == MreKind::Sg {
        register::rp_changed(instance, mre_id);
    }
    rpf::recompute(instance, interfaces, mre_id);
    entry_changed(instance, interfaces, mre_id);
}

// ===== ibus input =====

pub(crate) fn process_ibus_msg(
    instance: &mut Instance,
    msg: IbusMsg,
) -> Result<(), Error> {
    match msg {
        IbusMsg::MribAdd(entry) => {
            if let Some(state) = &mut instance.state {
                state.mrib.add(entry);
            }
        }
        IbusMsg::MribDelete(prefix) => {
            if let Some(state) = &mut instance.state {
                state.mrib.delete(prefix);
            }
        }
        IbusMsg::MribDone => {
            if let Some(state) = &mut instance.state {
                let changed = state.mrib.commit();
                if !changed.is_empty() {
                    state
                        .mrt
                        .enqueue_task(MrtTaskKind::MribChanged(changed));
                    instance.tx.protocol_input.schedule_task_drain();
                }
            }
        }
        IbusMsg::RpAdd {
            prefix,
            rp_addr,
            priority,
        } => {
            if let Some(state) = &mut instance.state {
                state.rps.add(prefix, rp_addr, priority);
            }
        }
        IbusMsg::RpDelete { prefix, rp_addr } => {
            if let Some(state) = &mut instance.state {
                state.rps.delete(prefix, rp_addr);
            }
        }
        IbusMsg::RpDone => {
            if let Some(state) = &mut instance.state
                && state.rps.done()
            {
                state.mrt.enqueue_task(MrtTaskKind::RpSetChanged);
                instance.tx.protocol_input.schedule_task_drain();
            }
        }
        IbusMsg::InterfaceUpd {
            ifname,
            ifindex,
            mtu,
            operational,
            primary_addr,
            addr_list,
        } => {
            let iface = instance.interfaces.add(&ifname);
            iface.system.ifindex = Some(ifindex);
            iface.system.mtu = Some(mtu);
            iface.system.operational = operational;
            iface.system.primary_addr = primary_addr;
            iface.system.addr_list = addr_list;
            instance.update_interface(&ifname);
        }
        IbusMsg::InterfaceDel { ifname } => {
            if let Some((mut up, interfaces)) = instance.as_up() {
                let keys: Vec<_> = up
                    .state
                    .neighbors
                    .keys()
                    .copied()
                    .filter(|key| {
                        interfaces
                            .get_by_name(&ifname)
                            .and_then(|iface| iface.system.ifindex)
                            == Some(key.ifindex)
                    })
                    .collect();
                for key in keys {
                    remove_neighbor(&mut up, interfaces, key);
                }
                if let Some(iface) = interfaces.get_mut_by_name(&ifname) {
                    iface.stop(&mut up, InterfaceInactiveReason::Deleted);
                }
            }
            instance.interfaces.remove(&ifname);
            Debug::InterfaceDelete(&ifname).log();
        }
        IbusMsg::McastReceiverAdd { ifindex, group } => {
            if let Some((mut up, interfaces)) = instance.as_up() {
                process_receiver_add(&mut up, interfaces, ifindex, group);
            }
        }
        IbusMsg::McastReceiverDel { ifindex, group } => {
            if let Some((mut up, interfaces)) = instance.as_up() {
                process_receiver_del(&mut up, interfaces, ifindex, group);
            }
        }
    }

    Ok(())
}

// A local receiver joined the group (IGMP-learned membership).
pub(crate) fn process_receiver_add(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    group: Ipv4Addr,
) {
    let mut touched = Vec::new();
    let Some(id) = lookup_or_create(
        instance,
        interfaces,
        Ipv4Addr::UNSPECIFIED,
        group,
        MreKindMask::WC,
        MreKindMask::WC,
        &mut touched,
    ) else {
        return;
    };

    let state = &mut *instance.state;
    let idx = state.mrt.index_by_id(id).unwrap();
    let mre = state.mrt.get_mut(idx).unwrap();
    mre.local_include.insert(ifindex);

    // Existing (S,G) entries of the group inherit the new interface.
    let sg_ids: Vec<_> =
        state.mrt.group_sg_entries(group).map(|mre| mre.id).collect();

    entry_changed(instance, interfaces, id);
    for sg_id in sg_ids {
        entry_changed(instance, interfaces, sg_id);
    }
}

pub(crate) fn process_receiver_del(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifindex: u32,
    group: Ipv4Addr,
) {
    let state = &mut *instance.state;
    let Some(idx) =
        state.mrt.find(Ipv4Addr::UNSPECIFIED, group, MreKindMask::WC)
    else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    let id = mre.id;
    mre.local_include.remove(&ifindex);

    entry_changed(instance, interfaces, id);
}

// ===== orchestration helpers =====

// Runs the update pipeline after an entry mutation: upstream machine,
// register machine, forwarding reconciliation, then the removal check.
pub(crate) fn entry_changed(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    mre_id: MreId,
) {
    let state = &*instance.state;
    let Some(mre) = state.mrt.get_by_id(mre_id) else {
        return;
    };
    let kind = mre.kind;
    let source = mre.source;
    let group = mre.group;

    upstream::recompute(instance, interfaces, mre_id);

    match kind {
        MreKind::Sg => {
            register::recompute_could_register(instance, interfaces, mre_id);
            mfc::reconcile(instance, interfaces, source, group);
        }
        MreKind::SgRpt => {
            mfc::reconcile(instance, interfaces, source, group);
        }
        MreKind::Wc => {
            // Shared-tree changes reach every source of the group.
            let state = &*instance.state;
            let sg_ids: Vec<_> = state
                .mrt
                .group_sg_entries(group)
                .map(|mre| (mre.id, mre.source))
                .collect();
            let sg_rpt_ids: Vec<_> = state
                .mrt
                .group_sg_rpt_entries(group)
                .map(|mre| mre.id)
                .collect();
            let mfc_keys: Vec<_> = state
                .mfcs
                .group_entries(group)
                .map(|mfc| mfc.source)
                .collect();

            for (sg_id, sg_source) in sg_ids {
                upstream::recompute(instance, interfaces, sg_id);
                mfc::reconcile(instance, interfaces, sg_source, group);
            }
            for sg_rpt_id in sg_rpt_ids {
                upstream::recompute(instance, interfaces, sg_rpt_id);
            }
            for mfc_source in mfc_keys {
                mfc::reconcile(instance, interfaces, mfc_source, group);
            }
        }
        MreKind::Rp => {
            // The (*,*,RP) tree feeds the shared trees of its groups.
            let state = &*instance.state;
            let wc_ids: Vec<_> = state
                .mrt
                .iter()
                .filter(|(_, mre)| {
                    mre.kind == MreKind::Wc && mre.rp_addr == Some(source)
                })
                .map(|(_, mre)| mre.id)
                .collect();
            for wc_id in wc_ids {
                upstream::recompute(instance, interfaces, wc_id);
            }
        }
    }

    try_remove(instance, mre_id);
}

// Deferred removal check, run after each mutation. An entry goes away
// once all its machines are quiescent and nothing references it.
pub(crate) fn try_remove(
    instance: &mut InstanceUpView<'_>,
    mre_id: MreId,
) {
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get(idx).unwrap();

    if !mre.can_remove() {
        return;
    }

    // A forwarding entry still justifies its routing entries.
    let justifies = match mre.kind {
        MreKind::Sg | MreKind::SgRpt => {
            state.mfcs.get(mre.source, mre.group).is_some()
        }
        MreKind::Wc => state.mfcs.group_entries(mre.group).next().is_some(),
        MreKind::Rp => state.mrt.iter().any(|(_, other)| {
            other.kind == MreKind::Wc && other.rp_addr == Some(mre.source)
        }),
    };
    if justifies {
        return;
    }

    let mre = state.mrt.remove(idx);
    rpf::detach_all(&mut state.neighbors, &mre);
}

// The DR changed somewhere: local-membership forwarding and register
// eligibility depend on it everywhere.
pub(crate) fn dr_changed(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    for id in instance.state.mrt.ids() {
        register::recompute_could_register(instance, interfaces, id);
        entry_changed(instance, interfaces, id);
    }
}

// A neighbor appeared: entries with a null RPF neighbor may resolve now.
fn orphan_rescan(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    for id in instance.state.mrt.orphan_ids() {
        rpf::recompute(instance, interfaces, id);
        entry_changed(instance, interfaces, id);
    }
}

// Looks up an entry, creating it if allowed. New entries get their RP
// binding and RPF state initialized.
fn lookup_or_create(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    source: Ipv4Addr,
    group: Ipv4Addr,
    lookup: MreKindMask,
    create: MreKindMask,
    touched: &mut Vec<MreId>,
) -> Option<MreId> {
    let state = &mut *instance.state;

    if let Some(idx) = state.mrt.find(source, group, lookup) {
        let id = state.mrt.get(idx).unwrap().id;
        touched.push(id);
        return Some(id);
    }

    let idx = state.mrt.find_or_create(source, group, lookup, create)?;
    let id = state.mrt.get(idx).unwrap().id;

    // Bind the group's RP.
    let crate::instance::InstanceState { mrt, rps, .. } = state;
    let mre = mrt.get_mut(idx).unwrap();
    if mre.kind != MreKind::Rp {
        mre.rp_addr = rps.rp_find(group);
    }

    rpf::recompute(instance, interfaces, id);
    touched.push(id);
    Some(id)
}

fn lookup_only(
    instance: &mut InstanceUpView<'_>,
    source: Ipv4Addr,
    group: Ipv4Addr,
    lookup: MreKindMask,
    touched: &mut Vec<MreId>,
) -> Option<MreId> {
    let state = &*instance.state;
    let idx = state.mrt.find(source, group, lookup)?;
    let id = state.mrt.get(idx).unwrap().id;
    touched.push(id);
    Some(id)
}

// Runs a closure over one entry with the timer channels in scope.
fn with_entry<F>(instance: &mut InstanceUpView<'_>, mre_id: MreId, f: F)
where
    F: FnOnce(&mut crate::mre::Mre, &crate::instance::ProtocolInputChannelsTx),
{
    let state = &mut *instance.state;
    let Some(idx) = state.mrt.index_by_id(mre_id) else {
        return;
    };
    let mre = state.mrt.get_mut(idx).unwrap();
    f(mre, &instance.tx.protocol_input);
}

// A Join/Prune for this entry was overheard toward another router's
// upstream neighbor; suppression and override apply when that neighbor
// is also our RPF'.
fn seen_jp(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    source: Ipv4Addr,
    group: Ipv4Addr,
    lookup: MreKindMask,
    target_key: NeighborKey,
    action: JpAction,
    holdtime: u16,
) {
    // Overheard (S,G,rpt) Prunes create the transient entry too, so a
    // later (*,G) Join can carry the matching prune.
    let idx = if lookup == MreKindMask::SG_RPT && action == JpAction::Prune {
        instance.state.mrt.find_or_create(
            source,
            group,
            lookup,
            MreKindMask::SG_RPT,
        )
    } else {
        instance.state.mrt.find(source, group, lookup)
    };
    let Some(idx) = idx else {
        return;
    };

    let state = &*instance.state;
    let mre = state.mrt.get(idx).unwrap();
    let id = mre.id;
    if mre.rpfp_nbr() != Some(target_key) {
        try_remove(instance, id);
        return;
    }

    match action {
        JpAction::Join => {
            upstream::seen_join(instance, interfaces, id, holdtime);
        }
        JpAction::Prune => {
            upstream::seen_prune(instance, interfaces, id);
        }
    }
    try_remove(instance, id);
}

// Join/Prune and Assert senders must have Hello state, unless the
// interface accepts no-Hello neighbors.
fn ensure_hello_neighbor(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    ifindex: u32,
    src: Ipv4Addr,
) -> Result<(), Error> {
    let state = &mut *instance.state;
    let key = NeighborKey { ifindex, addr: src };
    if state.neighbors.contains_key(&key) {
        return Ok(());
    }

    let accept = interfaces
        .get_by_ifindex(ifindex)
        .is_some_and(|iface| iface.config.accept_nohello_neighbors);
    if !accept {
        state.statistics.errors.no_hello_neighbor += 1;
        state.statistics.errors.total += 1;
        return Err(Error::NoHelloNeighbor(ifindex, src));
    }

    let mut nbr = Neighbor::new(ifindex, src);
    nbr.is_nohello = true;
    state.neighbors.insert(key, nbr);
    Ok(())
}

// The Prune-Pending interval of a link: zero on point-to-point links,
// the override window when other downstream routers may object.
fn prune_pending_interval(
    instance: &InstanceUpView<'_>,
    interfaces: &Interfaces,
    ifindex: u32,
) -> Duration {
    let nbr_count = instance
        .state
        .neighbors
        .keys()
        .filter(|key| key.ifindex == ifindex)
        .count();
    if nbr_count > 1 {
        interfaces
            .get_by_ifindex(ifindex)
            .map(|iface| {
                iface.jp_override_interval(&instance.state.neighbors)
            })
            .unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}
