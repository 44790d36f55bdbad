//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

use crate::consts::{
    ALL_PIM_ROUTERS, DR_PRIORITY_DEFAULT, HELLO_HOLDTIME_RATIO, HELLO_PERIOD,
    HELLO_TRIGGERED_DELAY, JOIN_PRUNE_PERIOD, LAN_DELAY_MSEC,
    OVERRIDE_INTERVAL_MSEC,
};
use crate::debug::{Debug, InterfaceInactiveReason};
use crate::error::{Error, IoError};
use crate::instance::InstanceUpView;
use crate::neighbor::Neighbors;
use crate::network::{self, AsyncSocket};
use crate::packet::Packet;
use crate::packet::hello::{HelloMsg, LanPruneDelayOption};
use crate::southbound::{MAX_VIFS, MfcReq};
use crate::tasks;
use crate::tasks::messages::output::NetTxPacketMsg;
use crate::tasks::{IntervalTask, Task, TimeoutTask};

// PIM interface collection, keyed by name with ifindex lookups.
#[derive(Debug, Default)]
pub struct Interfaces {
    tree: BTreeMap<String, Interface>,
}

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub system: InterfaceSys,
    pub config: InterfaceCfg,
    pub state: Option<InterfaceState>,
}

// Interface data learned from the system.
#[derive(Debug, Default)]
pub struct InterfaceSys {
    pub ifindex: Option<u32>,
    pub primary_addr: Option<Ipv4Addr>,
    pub addr_list: Vec<Ipv4Addr>,
    pub mtu: Option<u32>,
    pub operational: bool,
}

// Per-interface configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceCfg {
    pub enabled: bool,
    pub hello_period: u16,
    pub dr_priority: u32,
    pub jp_period: u16,
    pub propagation_delay: u16,
    pub override_interval: u16,
    // Accept Join/Prune and Assert from senders without Hello state.
    pub accept_nohello_neighbors: bool,
}

// Per-interface operational state.
#[derive(Debug)]
pub struct InterfaceState {
    pub net: InterfaceNet,
    // Kernel virtual-interface id.
    pub vif_id: u8,
    // Our Generation ID on this interface.
    pub genid: u32,
    pub hello_timer: IntervalTask,
    pub triggered_hello: Option<TimeoutTask>,
    // The elected DR; our own address when we win.
    pub dr_addr: Option<Ipv4Addr>,
}

// Interface socket and Tx task.
#[derive(Debug)]
pub struct InterfaceNet {
    pub socket_tx: Arc<AsyncSocket>,
    _net_tx_task: Task<()>,
    pub net_tx_packetp: UnboundedSender<NetTxPacketMsg>,
}

// ===== impl Interfaces =====

impl Interfaces {
    pub(crate) fn get_by_name(&self, name: &str) -> Option<&Interface> {
        self.tree.get(name)
    }

    pub(crate) fn get_mut_by_name(
        &mut self,
        name: &str,
    ) -> Option<&mut Interface> {
        self.tree.get_mut(name)
    }

    pub(crate) fn get_by_ifindex(&self, ifindex: u32) -> Option<&Interface> {
        self.tree
            .values()
            .find(|iface| iface.system.ifindex == Some(ifindex))
    }

    pub(crate) fn get_mut_by_ifindex(
        &mut self,
        ifindex: u32,
    ) -> Option<&mut Interface> {
        self.tree
            .values_mut()
            .find(|iface| iface.system.ifindex == Some(ifindex))
    }

    pub(crate) fn add(&mut self, name: &str) -> &mut Interface {
        self.tree
            .entry(name.to_owned())
            .or_insert_with(|| Interface::new(name.to_owned()))
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.tree.remove(name);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.tree.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Interface> {
        self.tree.values_mut()
    }

    // Whether this router is the DR on the given interface.
    pub(crate) fn i_am_dr(&self, ifindex: u32) -> bool {
        self.get_by_ifindex(ifindex)
            .is_some_and(|iface| iface.i_am_dr())
    }

    // Whether the address is one of our own on any interface.
    pub(crate) fn is_my_addr(&self, addr: Ipv4Addr) -> bool {
        self.tree.values().any(|iface| {
            iface.system.primary_addr == Some(addr)
                || iface.system.addr_list.contains(&addr)
        })
    }

    pub(crate) fn used_vif_ids(&self) -> Vec<u8> {
        self.tree
            .values()
            .filter_map(|iface| iface.state.as_ref())
            .map(|state| state.vif_id)
            .collect()
    }

    pub(crate) fn vif_id(&self, ifindex: u32) -> Option<u8> {
        self.get_by_ifindex(ifindex)
            .and_then(|iface| iface.state.as_ref())
            .map(|state| state.vif_id)
    }

    pub(crate) fn ifindex_of_vif(&self, vif: u8) -> Option<u32> {
        self.tree
            .values()
            .find(|iface| {
                iface.state.as_ref().map(|s| s.vif_id) == Some(vif)
            })
            .and_then(|iface| iface.system.ifindex)
    }
}

// ===== impl Interface =====

impl Interface {
    fn new(name: String) -> Interface {
        Debug::InterfaceCreate(&name).log();

        Interface {
            name,
            system: Default::default(),
            config: Default::default(),
            state: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_some()
    }

    // Checks if the interface needs to be started or stopped in response
    // to a northbound or southbound event.
    pub(crate) fn update(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        interfaces_vifs: &[u8],
    ) {
        match self.is_ready() {
            Ok(()) if !self.is_active() => {
                if let Err(error) = self.start(instance, interfaces_vifs) {
                    Error::InterfaceStartError(
                        self.name.clone(),
                        error,
                    )
                    .log();
                }
            }
            Err(reason) if self.is_active() => {
                self.stop(instance, reason);
            }
            _ => (),
        }
    }

    fn is_ready(&self) -> Result<(), InterfaceInactiveReason> {
        if !self.config.enabled {
            return Err(InterfaceInactiveReason::AdminDown);
        }
        if !self.system.operational {
            return Err(InterfaceInactiveReason::OperationalDown);
        }
        if self.system.ifindex.is_none() {
            return Err(InterfaceInactiveReason::MissingIfindex);
        }
        if self.system.primary_addr.is_none() {
            return Err(InterfaceInactiveReason::MissingIpAddress);
        }
        Ok(())
    }

    fn start(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        used_vifs: &[u8],
    ) -> Result<(), IoError> {
        Debug::InterfaceStart(&self.name).log();

        let ifindex = self.system.ifindex.unwrap();

        // Create the Tx socket and task.
        let net = InterfaceNet::new(&self.name, instance)?;

        // Join ALL-PIM-ROUTERS on the shared Rx socket.
        network::join_multicast(&instance.state.socket_rx, ifindex)
            .map_err(IoError::MulticastJoinError)?;

        // Tell the kernel forwarder about the new vif.
        let vif_id = (0..MAX_VIFS)
            .find(|vif| !used_vifs.contains(vif))
            .expect("out of multicast vifs");
        let _ = instance
            .state
            .southboundp
            .send(MfcReq::AddVif { ifindex, vif: vif_id });

        // Start Hello transmission: the periodic timer plus a short
        // randomized initial delay.
        let hello_timer = tasks::hello_interval(
            ifindex,
            Duration::from_secs(self.config.hello_period.into()),
            &instance.tx.protocol_input.hello_interval,
        );
        let triggered_hello = Some(tasks::triggered_hello(
            ifindex,
            Duration::from_millis(
                rand::rng()
                    .random_range(0..=u64::from(HELLO_TRIGGERED_DELAY) * 1000),
            ),
            &instance.tx.protocol_input.triggered_hello,
        ));

        self.state = Some(InterfaceState {
            net,
            vif_id,
            genid: rand::random(),
            hello_timer,
            triggered_hello,
            dr_addr: self.system.primary_addr,
        });

        Ok(())
    }

    pub(crate) fn stop(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        reason: InterfaceInactiveReason,
    ) {
        let Some(state) = self.state.take() else {
            return;
        };

        Debug::InterfaceStop(&self.name, reason).log();

        // Say goodbye so neighbors expire us at once.
        let mut hello = self.build_hello(state.genid);
        hello.holdtime = Some(0);
        let _ = state.net.net_tx_packetp.send(NetTxPacketMsg {
            #[cfg(feature = "testing")]
            ifname: self.name.clone(),
            ifindex: self.system.ifindex.unwrap_or(0),
            dst: ALL_PIM_ROUTERS,
            packet: Packet::Hello(hello),
        });

        if let Some(ifindex) = self.system.ifindex {
            let _ = network::leave_multicast(
                &instance.state.socket_rx,
                ifindex,
            );
        }
        let _ = instance
            .state
            .southboundp
            .send(MfcReq::DelVif { vif: state.vif_id });
    }

    // Builds our Hello for this interface.
    pub(crate) fn build_hello(&self, genid: u32) -> HelloMsg {
        let holdtime =
            (HELLO_HOLDTIME_RATIO * f64::from(self.config.hello_period)) as u16;
        HelloMsg {
            holdtime: Some(holdtime),
            lan_prune_delay: Some(LanPruneDelayOption {
                t_bit: false,
                lan_delay: self.config.propagation_delay,
                override_interval: self.config.override_interval,
            }),
            dr_priority: Some(self.config.dr_priority),
            genid: Some(genid),
            addr_list: self
                .system
                .addr_list
                .iter()
                .filter(|addr| Some(**addr) != self.system.primary_addr)
                .copied()
                .collect(),
        }
    }

    pub(crate) fn send_packet(&self, dst: Ipv4Addr, packet: Packet) {
        if let Some(state) = &self.state {
            Debug::PacketTx(&self.name, &dst, &packet).log();
            let _ = state.net.net_tx_packetp.send(NetTxPacketMsg {
                #[cfg(feature = "testing")]
                ifname: self.name.clone(),
                ifindex: self.system.ifindex.unwrap_or(0),
                dst,
                packet,
            });
        }
    }

    pub(crate) fn i_am_dr(&self) -> bool {
        match &self.state {
            Some(state) => {
                state.dr_addr.is_some()
                    && state.dr_addr == self.system.primary_addr
            }
            None => false,
        }
    }

    // DR election: numerically-highest DR priority wins, ties broken by
    // the numerically-highest address. If any router on the link didn't
    // announce a priority, the election falls back to addresses only.
    pub(crate) fn dr_election(&mut self, neighbors: &Neighbors) -> bool {
        let Some(my_addr) = self.system.primary_addr else {
            return false;
        };
        let Some(ifindex) = self.system.ifindex else {
            return false;
        };
        let Some(state) = &mut self.state else {
            return false;
        };

        let nbrs: Vec<_> = neighbors
            .values()
            .filter(|nbr| nbr.ifindex == ifindex)
            .collect();

        let priority_usable =
            nbrs.iter().all(|nbr| nbr.dr_priority.is_some());

        let mut candidates: Vec<(u32, Ipv4Addr)> = nbrs
            .iter()
            .map(|nbr| {
                (nbr.dr_priority.unwrap_or(DR_PRIORITY_DEFAULT), nbr.addr)
            })
            .collect();
        candidates.push((self.config.dr_priority, my_addr));

        let winner = if priority_usable {
            candidates.iter().max_by_key(|(prio, addr)| (*prio, *addr))
        } else {
            candidates.iter().max_by_key(|(_, addr)| *addr)
        }
        .map(|(_, addr)| *addr);

        let changed = state.dr_addr != winner;
        if changed {
            Debug::DrChange(&self.name, &winner).log();
            state.dr_addr = winner;
        }
        changed
    }

    // Effective LAN propagation delay and override interval: the maxima
    // announced on the link, or the defaults if any neighbor omitted the
    // LAN Prune Delay option.
    pub(crate) fn effective_overrides(
        &self,
        neighbors: &Neighbors,
    ) -> (u16, u16) {
        let Some(ifindex) = self.system.ifindex else {
            return (LAN_DELAY_MSEC, OVERRIDE_INTERVAL_MSEC);
        };

        let mut lan_delay = self.config.propagation_delay;
        let mut override_interval = self.config.override_interval;
        for nbr in neighbors.values().filter(|nbr| nbr.ifindex == ifindex) {
            match &nbr.lan_prune_delay {
                Some(opt) => {
                    lan_delay = lan_delay.max(opt.lan_delay);
                    override_interval =
                        override_interval.max(opt.override_interval);
                }
                None => {
                    return (LAN_DELAY_MSEC, OVERRIDE_INTERVAL_MSEC);
                }
            }
        }
        (lan_delay, override_interval)
    }

    // The Join/Prune override window of the link (LAN delay plus
    // override interval).
    pub(crate) fn jp_override_interval(
        &self,
        neighbors: &Neighbors,
    ) -> Duration {
        let (lan_delay, override_interval) =
            self.effective_overrides(neighbors);
        Duration::from_millis(u64::from(lan_delay) + u64::from(override_interval))
    }
}

// ===== impl InterfaceCfg =====

impl Default for InterfaceCfg {
    fn default() -> InterfaceCfg {
        InterfaceCfg {
            enabled: false,
            hello_period: HELLO_PERIOD,
            dr_priority: DR_PRIORITY_DEFAULT,
            jp_period: JOIN_PRUNE_PERIOD,
            propagation_delay: LAN_DELAY_MSEC,
            override_interval: OVERRIDE_INTERVAL_MSEC,
            accept_nohello_neighbors: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;
    use crate::neighbor::Neighbor;
    use crate::packet::hello::LanPruneDelayOption;

    fn test_iface() -> Interfaces {
        let mut interfaces = Interfaces::default();
        let iface = interfaces.add("eth0");
        iface.system.ifindex = Some(1);
        interfaces
    }

    #[test]
    fn test_effective_overrides_maxima() {
        let interfaces = test_iface();
        let iface = interfaces.get_by_name("eth0").unwrap();

        let mut neighbors = Neighbors::default();
        for (addr, lan_delay, override_interval) in [
            (ip4!("192.168.1.3"), 600, 3000),
            (ip4!("192.168.1.4"), 400, 2000),
        ] {
            let mut nbr = Neighbor::new(1, addr);
            nbr.lan_prune_delay = Some(LanPruneDelayOption {
                t_bit: false,
                lan_delay,
                override_interval,
            });
            neighbors.insert(nbr.key(), nbr);
        }

        // All neighbors announce the option: the maxima apply.
        assert_eq!(iface.effective_overrides(&neighbors), (600, 3000));
        assert_eq!(
            iface.jp_override_interval(&neighbors),
            Duration::from_millis(3600)
        );
    }

    #[test]
    fn test_missing_option_reverts_to_defaults() {
        let interfaces = test_iface();
        let iface = interfaces.get_by_name("eth0").unwrap();

        let mut neighbors = Neighbors::default();
        let mut nbr = Neighbor::new(1, ip4!("192.168.1.3"));
        nbr.lan_prune_delay = Some(LanPruneDelayOption {
            t_bit: false,
            lan_delay: 600,
            override_interval: 3000,
        });
        neighbors.insert(nbr.key(), nbr);
        let nbr = Neighbor::new(1, ip4!("192.168.1.4"));
        neighbors.insert(nbr.key(), nbr);

        // One neighbor without the option drags the link back to the
        // default delay values.
        assert_eq!(
            iface.effective_overrides(&neighbors),
            (LAN_DELAY_MSEC, OVERRIDE_INTERVAL_MSEC)
        );
    }
}

// ===== impl InterfaceNet =====

impl InterfaceNet {
    fn new(
        ifname: &str,
        instance: &InstanceUpView<'_>,
    ) -> Result<InterfaceNet, IoError> {
        let socket_tx = network::socket_tx(ifname)
            .map_err(IoError::SocketError)
            .map(Arc::new)?;

        let (net_tx_packetp, net_tx_packetc) = mpsc::unbounded_channel();
        let net_tx_task = tasks::net_tx(
            socket_tx.clone(),
            net_tx_packetc,
            #[cfg(feature = "testing")]
            &instance.tx.protocol_output,
        );

        Ok(InterfaceNet {
            socket_tx,
            _net_tx_task: net_tx_task,
            net_tx_packetp,
        })
    }
}
