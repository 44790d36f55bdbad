//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::consts::{
    KEEPALIVE_PERIOD, RP_KEEPALIVE_PERIOD, SPT_SWITCH_BYTES,
    SPT_SWITCH_INTERVAL,
};
use crate::dataflow::{DataflowKind, DataflowMonitor};
use crate::debug::Debug;
use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::mre::MreFlags;
use crate::mrt::REGISTER_VIF_IFINDEX;
use crate::southbound::{MfcAddReq, MfcReq, VifSet};

bitflags! {
    // MFC entry flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct MfcFlags: u8 {
        const TASK_DELETE_PENDING = 0x01;
        const TASK_DELETE_DONE = 0x02;
        const HAS_IDLE_DATAFLOW_MONITOR = 0x04;
        const HAS_SPT_SWITCH_DATAFLOW_MONITOR = 0x08;
        const HAS_FORCED_DELETION = 0x10;
        // The kernel accepted the last add.
        const INSTALLED = 0x20;
        // The last add failed; retried once per reconciliation turn.
        const RETRY_PENDING = 0x40;
    }
}

// One mirrored kernel forwarding entry.
#[derive(Debug)]
pub struct Mfc {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub rp_addr: Option<Ipv4Addr>,
    pub iif_vif: Option<u8>,
    pub oifs: VifSet,
    pub oifs_disable_wrongvif: VifSet,
    pub flags: MfcFlags,
    pub idle_monitor: Option<DataflowMonitor>,
    pub spt_monitor: Option<DataflowMonitor>,
}

// The kernel MFC mirror, keyed by (S,G).
#[derive(Debug, Default)]
pub struct MfcTable {
    tree: BTreeMap<(Ipv4Addr, Ipv4Addr), Mfc>,
}

// ===== impl MfcTable =====

impl MfcTable {
    pub(crate) fn get(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&Mfc> {
        self.tree.get(&(group, source))
    }

    pub(crate) fn get_mut(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
    ) -> Option<&mut Mfc> {
        self.tree.get_mut(&(group, source))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mfc> {
        self.tree.values()
    }

    pub(crate) fn group_entries(
        &self,
        group: Ipv4Addr,
    ) -> impl Iterator<Item = &Mfc> {
        self.tree
            .range((group, Ipv4Addr::UNSPECIFIED)..)
            .take_while(move |((g, _), _)| *g == group)
            .map(|(_, mfc)| mfc)
    }

    fn entry(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> &mut Mfc {
        self.tree.entry((group, source)).or_insert_with(|| Mfc {
            source,
            group,
            rp_addr: None,
            iif_vif: None,
            oifs: VifSet::default(),
            oifs_disable_wrongvif: VifSet::default(),
            flags: MfcFlags::empty(),
            idle_monitor: None,
            spt_monitor: None,
        })
    }

    fn remove(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Option<Mfc> {
        self.tree.remove(&(group, source))
    }
}

// ===== global functions =====

// Reconciles the (S,G) forwarding entry against the current routing
// entries: computes the final desired iif and oif set and issues at most
// one kernel add-or-replace (or delete) per turn.
pub(crate) fn reconcile(
    instance: &mut InstanceUpView<'_>,
    interfaces: &Interfaces,
    source: Ipv4Addr,
    group: Ipv4Addr,
) {
    let state = &mut *instance.state;

    // Desired state, from the routing entries.
    let sg = state.mrt.sg_entry(source, group);
    let wc = state.mrt.wc_entry(group);

    // No justifying entry: the forwarding entry must go.
    if sg.is_none() && wc.is_none() {
        uninstall(instance, source, group, true);
        return;
    }

    // iif: the source tree when traffic is (or should be) arriving on
    // it, the RP tree otherwise.
    let iif_ifindex = match sg {
        Some(sg) if sg.is_spt() || sg.is_directly_connected_s() => {
            sg.rpf_interface_s()
        }
        Some(sg) => sg.rpf_interface_rp().or_else(|| {
            wc.and_then(|wc| wc.rpf_interface_rp())
        }),
        None => wc.and_then(|wc| wc.rpf_interface_rp()),
    };
    let iif_vif =
        iif_ifindex.and_then(|ifindex| interfaces.vif_id(ifindex));
    let Some(iif_vif) = iif_vif else {
        uninstall(instance, source, group, true);
        return;
    };

    let rp_addr = sg
        .and_then(|sg| sg.rp_addr)
        .or_else(|| wc.and_then(|wc| wc.rp_addr));

    // oifs: the inherited olist, excluding the register tunnel and the
    // incoming interface.
    let mut oifs = VifSet::default();
    for ifindex in state.mrt.inherited_olist_sg(source, group, interfaces) {
        if ifindex == REGISTER_VIF_IFINDEX || Some(ifindex) == iif_ifindex {
            continue;
        }
        if let Some(vif) = interfaces.vif_id(ifindex) {
            oifs.insert(vif);
        }
    }

    let keepalive_running =
        sg.is_some_and(|sg| sg.keepalive_timer.is_some());
    let i_am_rp = sg
        .map(|sg| sg.flags.contains(MreFlags::I_AM_RP))
        .or_else(|| wc.map(|wc| wc.flags.contains(MreFlags::I_AM_RP)))
        .unwrap_or(false);
    let spt = sg.is_some_and(|sg| sg.is_spt());
    let spt_switch_done = sg.is_some_and(|sg| {
        sg.flags.contains(MreFlags::WAS_SPT_SWITCH_DESIRED)
    });

    // Forwarding entries exist to carry traffic; with no interest at all
    // and no keepalive the entry is not justified.
    if oifs.is_empty() && !keepalive_running {
        uninstall(instance, source, group, false);
        return;
    }

    // WRONGVIF signals drive data-triggered Asserts on the forwarding
    // interfaces; on every other vif they are noise and get suppressed.
    let mut wrongvif_suppress = VifSet::default();
    for vif in interfaces.used_vif_ids() {
        if vif != iif_vif && !oifs.contains(vif) {
            wrongvif_suppress.insert(vif);
        }
    }

    let mfc = state.mfcs.entry(source, group);
    let changed = mfc.iif_vif != Some(iif_vif)
        || mfc.oifs != oifs
        || mfc.oifs_disable_wrongvif != wrongvif_suppress
        || mfc.rp_addr != rp_addr
        || !mfc.flags.contains(MfcFlags::INSTALLED)
        || mfc.flags.contains(MfcFlags::RETRY_PENDING);
    mfc.iif_vif = Some(iif_vif);
    mfc.oifs = oifs;
    mfc.oifs_disable_wrongvif = wrongvif_suppress;
    mfc.rp_addr = rp_addr;
    mfc.flags.remove(MfcFlags::HAS_FORCED_DELETION);
    mfc.flags.remove(MfcFlags::RETRY_PENDING);

    if changed {
        Debug::MfcInstall(&source, &group, iif_vif, &oifs).log();
        mfc.flags.insert(MfcFlags::INSTALLED);
        let _ = state.southboundp.send(MfcReq::AddMfc(MfcAddReq {
            source,
            group,
            iif: iif_vif,
            oifs,
            wrongvif_suppress,
            rp_addr,
        }));
    }

    // Idle monitor: expires the (S,G) state when traffic stops. The RP's
    // register-decapsulation entries idle out on the longer RP period.
    if mfc.idle_monitor.is_none() {
        let period = if i_am_rp {
            RP_KEEPALIVE_PERIOD
        } else {
            KEEPALIVE_PERIOD
        };
        mfc.idle_monitor = Some(DataflowMonitor::new(
            source,
            group,
            DataflowKind::Idle,
            Duration::from_secs(period.into()),
            Some(0),
            None,
            false,
            &instance.tx.protocol_input,
        ));
        mfc.flags.insert(MfcFlags::HAS_IDLE_DATAFLOW_MONITOR);
    }

    // SPT-switch monitor: watches shared-tree traffic for the switch
    // threshold on last-hop routers.
    let spt_switch_wanted = instance.config.spt_switch_enabled
        && !spt
        && !spt_switch_done
        && !i_am_rp;
    if spt_switch_wanted && mfc.spt_monitor.is_none() {
        mfc.spt_monitor = Some(DataflowMonitor::new(
            source,
            group,
            DataflowKind::SptSwitch,
            Duration::from_secs(
                instance
                    .config
                    .spt_switch_interval
                    .unwrap_or(SPT_SWITCH_INTERVAL)
                    .into(),
            ),
            None,
            Some(
                instance
                    .config
                    .spt_switch_bytes
                    .unwrap_or(SPT_SWITCH_BYTES),
            ),
            true,
            &instance.tx.protocol_input,
        ));
        mfc.flags.insert(MfcFlags::HAS_SPT_SWITCH_DATAFLOW_MONITOR);
    } else if !spt_switch_wanted && mfc.spt_monitor.is_some() {
        mfc.spt_monitor = None;
        mfc.flags.remove(MfcFlags::HAS_SPT_SWITCH_DATAFLOW_MONITOR);
    }
}

// Removes the (S,G) forwarding entry. `forced` marks removals caused by
// a vanished or invalid justifying entry.
pub(crate) fn uninstall(
    instance: &mut InstanceUpView<'_>,
    source: Ipv4Addr,
    group: Ipv4Addr,
    forced: bool,
) {
    let state = &mut *instance.state;
    let Some(mut mfc) = state.mfcs.remove(source, group) else {
        return;
    };

    if forced {
        mfc.flags.insert(MfcFlags::HAS_FORCED_DELETION);
    }
    mfc.flags.insert(MfcFlags::TASK_DELETE_PENDING);
    mfc.idle_monitor = None;
    mfc.spt_monitor = None;

    if mfc.flags.contains(MfcFlags::INSTALLED) {
        Debug::MfcUninstall(&source, &group).log();
        let _ = state.southboundp.send(MfcReq::DelMfc { source, group });
    }
    mfc.flags.insert(MfcFlags::TASK_DELETE_DONE);
}

// The kernel reported the outcome of the last add for this (S,G).
pub(crate) fn process_install_result(
    instance: &mut InstanceUpView<'_>,
    source: Ipv4Addr,
    group: Ipv4Addr,
    success: bool,
) {
    let state = &mut *instance.state;
    let Some(mfc) = state.mfcs.get_mut(source, group) else {
        return;
    };

    if success {
        mfc.flags.insert(MfcFlags::INSTALLED);
        mfc.flags.remove(MfcFlags::RETRY_PENDING);
    } else {
        crate::error::Error::MfcInstallError(source, group).log();
        mfc.flags.remove(MfcFlags::INSTALLED);
        mfc.flags.insert(MfcFlags::RETRY_PENDING);
    }
}
