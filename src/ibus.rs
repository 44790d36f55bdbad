//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::mrib::MribEntry;

// Messages from the external collaborators: the unicast route feed, the
// elected RP-set source, the interface manager and the local membership
// (IGMP) source.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum IbusMsg {
    // Unicast routing feed. `MribDone` ends a transaction and triggers a
    // single RPF recomputation sweep.
    MribAdd(MribEntry),
    MribDelete(Ipv4Network),
    MribDone,
    // Elected RP-set feed.
    RpAdd {
        prefix: Ipv4Network,
        rp_addr: Ipv4Addr,
        priority: u8,
    },
    RpDelete {
        prefix: Ipv4Network,
        rp_addr: Ipv4Addr,
    },
    RpDone,
    // Interface updates from the system.
    InterfaceUpd {
        ifname: String,
        ifindex: u32,
        mtu: u32,
        operational: bool,
        primary_addr: Option<Ipv4Addr>,
        addr_list: Vec<Ipv4Addr>,
    },
    InterfaceDel {
        ifname: String,
    },
    // Local (IGMP-learned) membership.
    McastReceiverAdd {
        ifindex: u32,
        group: Ipv4Addr,
    },
    McastReceiverDel {
        ifindex: u32,
        group: Ipv4Addr,
    },
}
