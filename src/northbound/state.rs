//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::instance::Instance;
use crate::mfc::MfcFlags;
use crate::mre::MreKind;
use crate::southbound::VifSet;

// Operator state queries.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub enum QueryMsg {
    Interfaces,
    Neighbors,
    Entries,
    Mfc,
}

#[derive(Clone, Debug, EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum QueryReply {
    Interfaces(Vec<InterfaceBrief>),
    Neighbors(Vec<NeighborBrief>),
    Entries(Vec<MreBrief>),
    Mfc(Vec<MfcBrief>),
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceBrief {
    pub name: String,
    pub ifindex: Option<u32>,
    pub active: bool,
    pub dr_addr: Option<Ipv4Addr>,
    pub dr_priority: u32,
    pub hello_period: u16,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborBrief {
    pub ifindex: u32,
    pub addr: Ipv4Addr,
    pub holdtime: u16,
    pub dr_priority: Option<u32>,
    pub genid: Option<u32>,
    pub uptime: DateTime<Utc>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct MreBrief {
    pub id: u32,
    pub kind: MreKind,
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub rp_addr: Option<Ipv4Addr>,
    pub upstream_state: String,
    pub register_state: String,
    // The assert-aware upstream neighbor.
    pub rpf_neighbor: Option<Ipv4Addr>,
    pub spt: bool,
    pub directly_connected: bool,
    pub could_register: bool,
    pub i_am_rp: bool,
    pub keepalive_running: bool,
    pub join_ifindexes: Vec<u32>,
    pub uptime: DateTime<Utc>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct MfcBrief {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub iif_vif: Option<u8>,
    pub oifs: VifSet,
    pub installed: bool,
    pub retry_pending: bool,
    pub forced_deletion: bool,
}

// ===== global functions =====

// Renders one operator state query.
pub(crate) fn process_query_msg(
    instance: &Instance,
    msg: QueryMsg,
) -> QueryReply {
    match msg {
        QueryMsg::Interfaces => QueryReply::Interfaces(
            instance
                .interfaces
                .iter()
                .map(|iface| InterfaceBrief {
                    name: iface.name.clone(),
                    ifindex: iface.system.ifindex,
                    active: iface.is_active(),
                    dr_addr: iface
                        .state
                        .as_ref()
                        .and_then(|state| state.dr_addr),
                    dr_priority: iface.config.dr_priority,
                    hello_period: iface.config.hello_period,
                })
                .collect(),
        ),
        QueryMsg::Neighbors => {
            let neighbors = match &instance.state {
                Some(state) => state
                    .neighbors
                    .values()
                    .map(|nbr| NeighborBrief {
                        ifindex: nbr.ifindex,
                        addr: nbr.addr,
                        holdtime: nbr.hello_holdtime,
                        dr_priority: nbr.dr_priority,
                        genid: nbr.genid,
                        uptime: nbr.created,
                    })
                    .collect(),
                None => Vec::new(),
            };
            QueryReply::Neighbors(neighbors)
        }
        QueryMsg::Entries => {
            let entries = match &instance.state {
                Some(state) => state
                    .mrt
                    .iter()
                    .map(|(_, mre)| MreBrief {
                        id: mre.id,
                        kind: mre.kind,
                        source: mre.source,
                        group: mre.group,
                        rp_addr: mre.rp_addr,
                        upstream_state: mre.upstream.to_string(),
                        register_state: mre.register.to_string(),
                        rpf_neighbor: mre.rpfp_nbr().map(|key| key.addr),
                        spt: mre.is_spt(),
                        directly_connected: mre.is_directly_connected_s(),
                        could_register: mre
                            .flags
                            .contains(crate::mre::MreFlags::COULD_REGISTER),
                        i_am_rp: mre
                            .flags
                            .contains(crate::mre::MreFlags::I_AM_RP),
                        keepalive_running: mre.keepalive_timer.is_some(),
                        join_ifindexes: mre.joins().into_iter().collect(),
                        uptime: mre.created,
                    })
                    .collect(),
                None => Vec::new(),
            };
            QueryReply::Entries(entries)
        }
        QueryMsg::Mfc => {
            let entries = match &instance.state {
                Some(state) => state
                    .mfcs
                    .iter()
                    .map(|mfc| MfcBrief {
                        source: mfc.source,
                        group: mfc.group,
                        iif_vif: mfc.iif_vif,
                        oifs: mfc.oifs,
                        installed: mfc.flags.contains(MfcFlags::INSTALLED),
                        retry_pending: mfc
                            .flags
                            .contains(MfcFlags::RETRY_PENDING),
                        forced_deletion: mfc
                            .flags
                            .contains(MfcFlags::HAS_FORCED_DELETION),
                    })
                    .collect(),
                None => Vec::new(),
            };
            QueryReply::Mfc(entries)
        }
    }
}
