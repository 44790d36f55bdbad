//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tracing::{debug, debug_span};

use crate::mre::{MreKind, assert, downstream, register, upstream};
use crate::mrt::MrtTaskKind;
use crate::neighbor::NeighborKey;
use crate::packet::Packet;
use crate::southbound::{Upcall, VifSet};

// PIM debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceCreate,
    InstanceDelete,
    InstanceStart,
    InstanceStop(InstanceInactiveReason),
    InterfaceCreate(&'a str),
    InterfaceDelete(&'a str),
    InterfaceStart(&'a str),
    InterfaceStop(&'a str, InterfaceInactiveReason),
    PacketRx(&'a str, &'a Ipv4Addr, &'a Packet),
    PacketTx(&'a str, &'a Ipv4Addr, &'a Packet),
    NbrCreate(&'a NeighborKey),
    NbrDelete(&'a NeighborKey),
    NbrTimeout(&'a NeighborKey),
    NbrGenIdChange(&'a NeighborKey),
    DrChange(&'a str, &'a Option<Ipv4Addr>),
    MreCreate(MreKind, &'a Ipv4Addr, &'a Ipv4Addr),
    MreDelete(MreKind, &'a Ipv4Addr, &'a Ipv4Addr),
    DownstreamStateChange(
        MreKind,
        &'a Ipv4Addr,
        &'a Ipv4Addr,
        u32,
        &'a downstream::State,
        &'a downstream::State,
    ),
    UpstreamStateChange(
        MreKind,
        &'a Ipv4Addr,
        &'a Ipv4Addr,
        &'a upstream::State,
        &'a upstream::State,
    ),
    AssertStateChange(
        MreKind,
        &'a Ipv4Addr,
        &'a Ipv4Addr,
        u32,
        &'a assert::State,
        &'a assert::State,
    ),
    RegisterStateChange(
        &'a Ipv4Addr,
        &'a Ipv4Addr,
        &'a register::State,
        &'a register::State,
    ),
    RpChange(&'a Ipv4Addr, &'a Option<Ipv4Addr>),
    MfcInstall(&'a Ipv4Addr, &'a Ipv4Addr, u8, &'a VifSet),
    MfcUninstall(&'a Ipv4Addr, &'a Ipv4Addr),
    DataflowSignal(&'a Ipv4Addr, &'a Ipv4Addr, &'a str),
    SptSwitch(&'a Ipv4Addr, &'a Ipv4Addr),
    KernelUpcall(&'a Upcall),
    MrtTaskDrain(&'a MrtTaskKind, usize),
}

// Reason why the PIM instance is inactive.
#[derive(Debug)]
pub enum InstanceInactiveReason {
    AdminDown,
}

// Reason why PIM is inactive on an interface.
#[derive(Debug)]
pub enum InterfaceInactiveReason {
    InstanceDown,
    AdminDown,
    OperationalDown,
    MissingIfindex,
    MissingIpAddress,
    Deleted,
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceCreate
            | Debug::InstanceDelete
            | Debug::InstanceStart => {
                // Parent span(s): pim-instance
                debug!("{}", self);
            }
            Debug::InstanceStop(reason) => {
                // Parent span(s): pim-instance
                debug!(%reason, "{}", self);
            }
            Debug::InterfaceCreate(name)
            | Debug::InterfaceDelete(name)
            | Debug::InterfaceStart(name) => {
                // Parent span(s): pim-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InterfaceStop(name, reason) => {
                // Parent span(s): pim-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::PacketRx(ifname, src, packet) => {
                // Parent span(s): pim-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("input", interface = %ifname, %src).in_scope(
                        || {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        },
                    );
                });
            }
            Debug::PacketTx(ifname, dst, packet) => {
                // Parent span(s): pim-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("output", interface = %ifname, %dst).in_scope(
                        || {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        },
                    );
                });
            }
            Debug::NbrCreate(key)
            | Debug::NbrDelete(key)
            | Debug::NbrTimeout(key)
            | Debug::NbrGenIdChange(key) => {
                // Parent span(s): pim-instance
                debug!(neighbor = %key, "{}", self);
            }
            Debug::DrChange(ifname, dr) => {
                // Parent span(s): pim-instance
                let dr = match dr {
                    Some(dr) => dr.to_string(),
                    None => "none".to_owned(),
                };
                debug!(interface = %ifname, %dr, "{}", self);
            }
            Debug::MreCreate(kind, source, group)
            | Debug::MreDelete(kind, source, group) => {
                // Parent span(s): pim-instance
                debug!(%kind, %source, %group, "{}", self);
            }
            Debug::DownstreamStateChange(
                kind,
                source,
                group,
                ifindex,
                old_state,
                new_state,
            ) => {
                // Parent span(s): pim-instance
                debug!(
                    %kind, %source, %group, %ifindex,
                    %old_state, %new_state, "{}", self
                );
            }
            Debug::UpstreamStateChange(
                kind,
                source,
                group,
                old_state,
                new_state,
            ) => {
                // Parent span(s): pim-instance
                debug!(
                    %kind, %source, %group, %old_state, %new_state,
                    "{}", self
                );
            }
            Debug::AssertStateChange(
                kind,
                source,
                group,
                ifindex,
                old_state,
                new_state,
            ) => {
                // Parent span(s): pim-instance
                debug!(
                    %kind, %source, %group, %ifindex,
                    %old_state, %new_state, "{}", self
                );
            }
            Debug::RegisterStateChange(source, group, old_state, new_state) => {
                // Parent span(s): pim-instance
                debug!(%source, %group, %old_state, %new_state, "{}", self);
            }
            Debug::RpChange(group, rp_addr) => {
                // Parent span(s): pim-instance
                let rp_addr = match rp_addr {
                    Some(rp_addr) => rp_addr.to_string(),
                    None => "none".to_owned(),
                };
                debug!(%group, rp = %rp_addr, "{}", self);
            }
            Debug::MfcInstall(source, group, iif, oifs) => {
                // Parent span(s): pim-instance
                debug!(%source, %group, %iif, oifs = ?oifs, "{}", self);
            }
            Debug::MfcUninstall(source, group) => {
                // Parent span(s): pim-instance
                debug!(%source, %group, "{}", self);
            }
            Debug::DataflowSignal(source, group, kind) => {
                // Parent span(s): pim-instance
                debug!(%source, %group, %kind, "{}", self);
            }
            Debug::SptSwitch(source, group) => {
                // Parent span(s): pim-instance
                debug!(%source, %group, "{}", self);
            }
            Debug::KernelUpcall(upcall) => {
                // Parent span(s): pim-instance
                debug!(?upcall, "{}", self);
            }
            Debug::MrtTaskDrain(kind, batch) => {
                // Parent span(s): pim-instance
                debug!(task = %kind, %batch, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate => {
                write!(f, "instance created")
            }
            Debug::InstanceDelete => {
                write!(f, "instance deleted")
            }
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStop(..) => {
                write!(f, "stopping instance")
            }
            Debug::InterfaceCreate(..) => {
                write!(f, "interface created")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface deleted")
            }
            Debug::InterfaceStart(..) => {
                write!(f, "starting interface")
            }
            Debug::InterfaceStop(..) => {
                write!(f, "stopping interface")
            }
            Debug::PacketRx(..) | Debug::PacketTx(..) => {
                write!(f, "packet")
            }
            Debug::NbrCreate(..) => {
                write!(f, "neighbor created")
            }
            Debug::NbrDelete(..) => {
                write!(f, "neighbor deleted")
            }
            Debug::NbrTimeout(..) => {
                write!(f, "neighbor timed out")
            }
            Debug::NbrGenIdChange(..) => {
                write!(f, "neighbor restarted")
            }
            Debug::DrChange(..) => {
                write!(f, "DR changed")
            }
            Debug::MreCreate(..) => {
                write!(f, "routing entry created")
            }
            Debug::MreDelete(..) => {
                write!(f, "routing entry deleted")
            }
            Debug::DownstreamStateChange(..) => {
                write!(f, "downstream state change")
            }
            Debug::UpstreamStateChange(..) => {
                write!(f, "upstream state change")
            }
            Debug::AssertStateChange(..) => {
                write!(f, "assert state change")
            }
            Debug::RegisterStateChange(..) => {
                write!(f, "register state change")
            }
            Debug::RpChange(..) => {
                write!(f, "group RP changed")
            }
            Debug::MfcInstall(..) => {
                write!(f, "forwarding entry installed")
            }
            Debug::MfcUninstall(..) => {
                write!(f, "forwarding entry removed")
            }
            Debug::DataflowSignal(..) => {
                write!(f, "dataflow threshold crossed")
            }
            Debug::SptSwitch(..) => {
                write!(f, "switching to shortest-path tree")
            }
            Debug::KernelUpcall(..) => {
                write!(f, "kernel upcall")
            }
            Debug::MrtTaskDrain(..) => {
                write!(f, "draining deferred task batch")
            }
        }
    }
}

// ===== impl InstanceInactiveReason =====

impl std::fmt::Display for InstanceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
        }
    }
}

// ===== impl InterfaceInactiveReason =====

impl std::fmt::Display for InterfaceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceInactiveReason::InstanceDown => {
                write!(f, "PIM instance down")
            }
            InterfaceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InterfaceInactiveReason::OperationalDown => {
                write!(f, "operational status down")
            }
            InterfaceInactiveReason::MissingIfindex => {
                write!(f, "missing ifindex")
            }
            InterfaceInactiveReason::MissingIpAddress => {
                write!(f, "missing IP address")
            }
            InterfaceInactiveReason::Deleted => {
                write!(f, "interface deleted")
            }
        }
    }
}
