//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use const_addrs::{ip4, net4};
use holo_pim::ibus::IbusMsg;
use holo_pim::instance::{Instance, InstanceChannelsRx};
use holo_pim::mre::MreKind;
use holo_pim::mrib::MribEntry;
use holo_pim::neighbor::NeighborKey;
use holo_pim::northbound::NorthboundMsg;
use holo_pim::northbound::configuration::ConfigMsg;
use holo_pim::northbound::state::{MreBrief, QueryMsg};
use holo_pim::packet::hello::HelloMsg;
use holo_pim::packet::join_prune::JoinPruneMsg;
use holo_pim::packet::register::{RegisterMsg, RegisterStopMsg};
use holo_pim::packet::{EncodedGroup, Packet, SourceAddrFlags};
use holo_pim::southbound::{Upcall, UpcallKind};
use holo_pim::tasks::messages::ProtocolOutputMsg;
use holo_pim::tasks::messages::input::{
    JpSendTimerMsg, KernelUpcallMsg, NbrTimeoutMsg, NetRxPacketMsg,
    ProtocolMsg, RegisterStopTimerMsg, SgCountUpdMsg,
};
use tokio::sync::oneshot;

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);
const RP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

//
// Helper functions.
//

fn setup() -> (Instance, InstanceChannelsRx) {
    let (mut instance, rx) = Instance::new("test".to_owned());
    config(&mut instance, ConfigMsg::InstanceEnable(true));
    (instance, rx)
}

fn config(instance: &mut Instance, msg: ConfigMsg) {
    instance.process_northbound_msg(NorthboundMsg::Config(msg));
}

fn add_interface(
    instance: &mut Instance,
    ifname: &str,
    ifindex: u32,
    addr: Ipv4Addr,
) {
    config(
        instance,
        ConfigMsg::InterfaceEnable {
            ifname: ifname.to_owned(),
            enabled: true,
        },
    );
    instance.process_ibus_msg(IbusMsg::InterfaceUpd {
        ifname: ifname.to_owned(),
        ifindex,
        mtu: 1500,
        operational: true,
        primary_addr: Some(addr),
        addr_list: vec![addr],
    });
}

fn hello_from(instance: &mut Instance, ifindex: u32, src: Ipv4Addr) {
    let hello = HelloMsg {
        holdtime: Some(105),
        lan_prune_delay: None,
        dr_priority: Some(1),
        genid: Some(0x1111),
        addr_list: vec![],
    };
    instance.process_protocol_msg(ProtocolMsg::NetRxPacket(NetRxPacketMsg {
        ifindex,
        src,
        packet: Ok(Packet::Hello(hello)),
    }));
}

fn add_route(
    instance: &mut Instance,
    prefix: ipnetwork::Ipv4Network,
    next_hop: Ipv4Addr,
    ifindex: u32,
    metric_preference: u32,
    metric: u32,
) {
    instance.process_ibus_msg(IbusMsg::MribAdd(MribEntry {
        prefix,
        next_hop,
        ifindex,
        metric_preference,
        metric,
    }));
    instance.process_ibus_msg(IbusMsg::MribDone);
}

fn add_rp(instance: &mut Instance) {
    instance.process_ibus_msg(IbusMsg::RpAdd {
        prefix: net4!("224.0.0.0/4"),
        rp_addr: RP,
        priority: 192,
    });
    instance.process_ibus_msg(IbusMsg::RpDone);
}

// Drains the queued protocol-input messages (deferred tasks and timer
// signals) back into the instance.
async fn pump(instance: &mut Instance, rx: &mut InstanceChannelsRx) {
    loop {
        match tokio::time::timeout(
            Duration::from_millis(20),
            rx.protocol_input.recv(),
        )
        .await
        {
            Ok(Some(msg)) => instance.process_protocol_msg(msg),
            _ => break,
        }
    }
    instance.validate_invariants();
}

// Flushes the Join/Prune accumulator of one upstream neighbor.
fn flush_jp(instance: &mut Instance, ifindex: u32, addr: Ipv4Addr) {
    instance.process_protocol_msg(ProtocolMsg::JpSendTimer(JpSendTimerMsg {
        key: NeighborKey { ifindex, addr },
    }));
}

// Collects the packets emitted since the last call.
async fn collect_tx(rx: &mut InstanceChannelsRx) -> Vec<(u32, Packet)> {
    let mut packets = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(
        Duration::from_millis(20),
        rx.protocol_output.recv(),
    )
    .await
    {
        if let ProtocolOutputMsg::NetTxPacket(msg) = msg {
            packets.push((msg.ifindex, msg.packet));
        }
    }
    packets
}

fn query_entries(instance: &mut Instance) -> Vec<MreBrief> {
    let (replyp, mut replyc) = oneshot::channel();
    instance
        .process_northbound_msg(NorthboundMsg::Query(QueryMsg::Entries, replyp));
    replyc.try_recv().unwrap().into_entries().unwrap()
}

fn find_entry(
    entries: &[MreBrief],
    kind: MreKind,
    source: Ipv4Addr,
    group: Ipv4Addr,
) -> Option<MreBrief> {
    entries
        .iter()
        .find(|e| e.kind == kind && e.source == source && e.group == group)
        .cloned()
}

fn join_prune_packets(packets: &[(u32, Packet)]) -> Vec<&JoinPruneMsg> {
    packets
        .iter()
        .filter_map(|(_, packet)| match packet {
            Packet::JoinPrune(msg) => Some(msg),
            _ => None,
        })
        .collect()
}

// Standard topology: a receiver-side interface (eth0/vif 0) and an
// upstream interface (eth1/vif 1) with one PIM neighbor toward the RP.
async fn setup_last_hop(
    instance: &mut Instance,
    rx: &mut InstanceChannelsRx,
) {
    add_interface(instance, "eth0", 1, ip4!("192.168.1.2"));
    add_interface(instance, "eth1", 2, ip4!("192.168.2.2"));
    hello_from(instance, 2, ip4!("192.168.2.1"));
    add_rp(instance);
    add_route(instance, net4!("10.0.0.0/8"), ip4!("192.168.2.1"), 2, 110, 10);
    pump(instance, rx).await;
    // Discard the startup output (goodbyes, vif programming).
    let _ = collect_tx(rx).await;
}

//
// Tests.
//

// A receiver appears on a last-hop DR: the (*,G) entry forms, joins the
// shared tree and the Join goes out toward the RP. Source data via a
// NOCACHE upcall then builds (S,G) state off the shortest-path tree.
#[tokio::test]
async fn test_last_hop_joins_shared_tree() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;

    instance.process_ibus_msg(IbusMsg::McastReceiverAdd {
        ifindex: 1,
        group: GROUP,
    });
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let wc = find_entry(&entries, MreKind::Wc, Ipv4Addr::UNSPECIFIED, GROUP)
        .expect("missing (*,G) entry");
    assert_eq!(wc.upstream_state, "joined");
    assert_eq!(wc.rp_addr, Some(RP));
    assert_eq!(wc.rpf_neighbor, Some(ip4!("192.168.2.1")));

    // The queued Join flushes one loop turn later.
    flush_jp(&mut instance, 2, ip4!("192.168.2.1"));
    let packets = collect_tx(&mut rx).await;
    let jps = join_prune_packets(&packets);
    assert_eq!(jps.len(), 1);
    let jp = jps[0];
    assert_eq!(jp.upstream_nbr, ip4!("192.168.2.1"));
    assert_eq!(jp.groups.len(), 1);
    assert_eq!(jp.groups[0].group.addr, GROUP);
    // The (*,G) Join carries the RP as its source with S, W and R set.
    let join = &jp.groups[0].joins[0];
    assert_eq!(join.addr, RP);
    assert!(join.flags.contains(SourceAddrFlags::WILDCARD));
    assert!(join.flags.contains(SourceAddrFlags::RPT));

    // Source traffic arrives on the shared tree (non-RPF interface).
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::NoCache,
                vif: 0,
                source: ip4!("10.1.2.5"),
                group: GROUP,
                data: Bytes::new(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .expect("missing (S,G) entry");
    assert!(!sg.spt);
    assert!(sg.keepalive_running);
}

// SPT switch: the dataflow monitor fires, the (S,G) upstream machine
// joins the source tree, and the next (*,G) Join carries the matching
// (S,G,rpt) Prune.
#[tokio::test]
async fn test_spt_switch() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;

    // A second upstream neighbor provides a diverging path toward the
    // source.
    hello_from(&mut instance, 2, ip4!("192.168.2.9"));
    add_route(
        &mut instance,
        net4!("10.1.0.0/16"),
        ip4!("192.168.2.9"),
        2,
        110,
        10,
    );

    instance.process_ibus_msg(IbusMsg::McastReceiverAdd {
        ifindex: 1,
        group: GROUP,
    });
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::NoCache,
                vif: 0,
                source: ip4!("10.1.2.5"),
                group: GROUP,
                data: Bytes::new(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;
    flush_jp(&mut instance, 2, ip4!("192.168.2.1"));
    let _ = collect_tx(&mut rx).await;

    // Drive the SPT-switch monitor over its byte threshold: baseline,
    // then traffic.
    for (packets, bytes) in [(0, 0), (10, 1500)] {
        instance.process_protocol_msg(ProtocolMsg::SgCountUpd(
            SgCountUpdMsg {
                source: ip4!("10.1.2.5"),
                group: GROUP,
                kind: holo_pim::dataflow::DataflowKind::SptSwitch,
                count: holo_pim::southbound::SgCount {
                    packets,
                    bytes,
                    wrong_if: 0,
                },
            },
        ));
    }
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    assert_eq!(sg.upstream_state, "joined");
    assert_eq!(sg.rpf_neighbor, Some(ip4!("192.168.2.9")));
    assert!(sg.keepalive_running);

    // The Join(S,G) goes to the source-tree neighbor.
    flush_jp(&mut instance, 2, ip4!("192.168.2.9"));
    let packets = collect_tx(&mut rx).await;
    let jps = join_prune_packets(&packets);
    assert!(jps.iter().any(|jp| {
        jp.upstream_nbr == ip4!("192.168.2.9")
            && jp.groups.iter().any(|g| {
                g.joins.iter().any(|s| {
                    s.addr == ip4!("10.1.2.5")
                        && s.flags == SourceAddrFlags::SPARSE
                })
            })
    }));

    // Re-emitting the (*,G) Join now carries the (S,G,rpt) Prune for
    // the switched source.
    instance.process_ibus_msg(IbusMsg::McastReceiverDel {
        ifindex: 1,
        group: GROUP,
    });
    pump(&mut instance, &mut rx).await;
    flush_jp(&mut instance, 2, ip4!("192.168.2.1"));
    let _ = collect_tx(&mut rx).await;

    instance.process_ibus_msg(IbusMsg::McastReceiverAdd {
        ifindex: 1,
        group: GROUP,
    });
    pump(&mut instance, &mut rx).await;
    flush_jp(&mut instance, 2, ip4!("192.168.2.1"));
    let packets = collect_tx(&mut rx).await;
    let jps = join_prune_packets(&packets);
    assert!(jps.iter().any(|jp| {
        jp.upstream_nbr == ip4!("192.168.2.1")
            && jp.groups.iter().any(|g| {
                g.joins.iter().any(|s| s.addr == RP)
                    && g.prunes.iter().any(|s| {
                        s.addr == ip4!("10.1.2.5")
                            && s.flags.contains(SourceAddrFlags::RPT)
                            && !s.flags.contains(SourceAddrFlags::WILDCARD)
                    })
            })
    }));
}

// Assert loser: a preferred Assert on the RPF interface overrides the
// MRIB-derived upstream neighbor, and the next Join goes to the winner.
#[tokio::test]
async fn test_assert_loser() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;
    hello_from(&mut instance, 2, ip4!("192.168.2.5"));

    instance.process_ibus_msg(IbusMsg::McastReceiverAdd {
        ifindex: 1,
        group: GROUP,
    });
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::NoCache,
                vif: 1,
                source: ip4!("10.1.2.5"),
                group: GROUP,
                data: Bytes::new(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;
    let _ = collect_tx(&mut rx).await;

    // Our metric toward the source is (110, 10); the assert carries a
    // preferred (100, 5).
    instance.process_protocol_msg(ProtocolMsg::NetRxPacket(NetRxPacketMsg {
        ifindex: 2,
        src: ip4!("192.168.2.5"),
        packet: Ok(Packet::Assert(holo_pim::packet::assert::AssertMsg {
            group: EncodedGroup {
                addr: GROUP,
                flags: Default::default(),
                mask_len: 32,
            },
            source: ip4!("10.1.2.5"),
            rpt_bit: false,
            metric_preference: 100,
            metric: 5,
        })),
    }));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    // The Assert winner overrides the MRIB next hop.
    assert_eq!(sg.rpf_neighbor, Some(ip4!("192.168.2.5")));

    // The moved Join goes to the winner.
    flush_jp(&mut instance, 2, ip4!("192.168.2.5"));
    let packets = collect_tx(&mut rx).await;
    let jps = join_prune_packets(&packets);
    assert!(jps.iter().any(|jp| {
        jp.upstream_nbr == ip4!("192.168.2.5")
            && jp.groups.iter().any(|g| {
                g.joins.iter().any(|s| s.addr == ip4!("10.1.2.5"))
            })
    }));
}

// Register cycle on the DR: Join → (Register-Stop) → Prune →
// (timer) → JoinPending with a Null-Register probe → (timer) → Join.
#[tokio::test]
async fn test_register_cycle() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;

    // The source is directly connected on eth0, where we are the DR.
    add_route(
        &mut instance,
        net4!("192.168.1.0/24"),
        Ipv4Addr::UNSPECIFIED,
        1,
        0,
        0,
    );
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::NoCache,
                vif: 0,
                source: ip4!("192.168.1.7"),
                group: GROUP,
                data: Bytes::new(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("192.168.1.7"), GROUP)
        .unwrap();
    assert!(sg.directly_connected);
    assert!(sg.could_register);
    assert_eq!(sg.register_state, "join");

    // Encapsulated data flows through the register tunnel.
    let inner = Bytes::from_static(&[
        0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00,
        0x00, 0xc0, 0xa8, 0x01, 0x07, 0xef, 0x01, 0x01, 0x01,
    ]);
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::WholePacket,
                vif: 0,
                source: ip4!("192.168.1.7"),
                group: GROUP,
                data: inner.clone(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;
    let packets = collect_tx(&mut rx).await;
    assert!(packets.iter().any(|(_, packet)| {
        matches!(packet, Packet::Register(msg)
            if !msg.null_register && msg.data == inner)
    }));

    // Register-Stop from the RP suppresses encapsulation.
    instance.process_protocol_msg(ProtocolMsg::NetRxPacket(NetRxPacketMsg {
        ifindex: 2,
        src: RP,
        packet: Ok(Packet::RegisterStop(RegisterStopMsg {
            group: EncodedGroup {
                addr: GROUP,
                flags: Default::default(),
                mask_len: 32,
            },
            source: ip4!("192.168.1.7"),
        })),
    }));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("192.168.1.7"), GROUP)
        .unwrap();
    assert_eq!(sg.register_state, "prune");

    // The suppression timer fires: probe the RP with a Null-Register.
    let sg_id = find_entry(
        &query_entries(&mut instance),
        MreKind::Sg,
        ip4!("192.168.1.7"),
        GROUP,
    )
    .unwrap()
    .id;
    instance.process_protocol_msg(ProtocolMsg::RegisterStopTimer(
        RegisterStopTimerMsg { mre_id: sg_id },
    ));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("192.168.1.7"), GROUP)
        .unwrap();
    assert_eq!(sg.register_state, "join-pending");
    let packets = collect_tx(&mut rx).await;
    assert!(packets.iter().any(|(_, packet)| {
        matches!(packet, Packet::Register(msg) if msg.null_register)
    }));

    // The probe timer fires: encapsulation resumes.
    instance.process_protocol_msg(ProtocolMsg::RegisterStopTimer(
        RegisterStopTimerMsg { mre_id: sg_id },
    ));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("192.168.1.7"), GROUP)
        .unwrap();
    assert_eq!(sg.register_state, "join");
}

// Neighbor death drains the dependent-entry list and orphans entries
// whose RPF neighbor is gone; a returning neighbor adopts them again.
#[tokio::test]
async fn test_neighbor_death() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;

    instance.process_ibus_msg(IbusMsg::McastReceiverAdd {
        ifindex: 1,
        group: GROUP,
    });
    instance.process_protocol_msg(ProtocolMsg::KernelUpcall(
        KernelUpcallMsg {
            upcall: Upcall {
                kind: UpcallKind::NoCache,
                vif: 1,
                source: ip4!("10.1.2.5"),
                group: GROUP,
                data: Bytes::new(),
            },
        },
    ));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    assert_eq!(sg.rpf_neighbor, Some(ip4!("192.168.2.1")));

    // The neighbor's liveness timer fires.
    instance.process_protocol_msg(ProtocolMsg::NbrTimeout(NbrTimeoutMsg {
        key: NeighborKey {
            ifindex: 2,
            addr: ip4!("192.168.2.1"),
        },
    }));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    assert_eq!(sg.rpf_neighbor, None);

    // The neighbor comes back: the orphaned entries resolve again.
    hello_from(&mut instance, 2, ip4!("192.168.2.1"));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    assert_eq!(sg.rpf_neighbor, Some(ip4!("192.168.2.1")));
}

// A received (S,G,rpt) Prune with no (*,G) state creates a transient
// entry that expires once its downstream state empties.
#[tokio::test]
async fn test_transient_sg_rpt_entry() {
    let (mut instance, mut rx) = setup();
    setup_last_hop(&mut instance, &mut rx).await;
    // A downstream neighbor on eth0 sends the Prune toward us.
    hello_from(&mut instance, 1, ip4!("192.168.1.9"));
    pump(&mut instance, &mut rx).await;

    let jp = JoinPruneMsg {
        upstream_nbr: ip4!("192.168.1.2"),
        holdtime: 210,
        groups: vec![holo_pim::packet::join_prune::JpGroupRecord {
            group: EncodedGroup {
                addr: GROUP,
                flags: Default::default(),
                mask_len: 32,
            },
            joins: vec![],
            prunes: vec![holo_pim::packet::EncodedSource {
                addr: ip4!("10.1.2.5"),
                flags: SourceAddrFlags::SPARSE | SourceAddrFlags::RPT,
                mask_len: 32,
            }],
        }],
    };
    instance.process_protocol_msg(ProtocolMsg::NetRxPacket(NetRxPacketMsg {
        ifindex: 1,
        src: ip4!("192.168.1.9"),
        packet: Ok(Packet::JoinPrune(jp)),
    }));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    assert!(
        find_entry(&entries, MreKind::SgRpt, ip4!("10.1.2.5"), GROUP)
            .is_some()
    );
}

// Register reception at the RP: (S,G) state forms and a Null-Register
// is answered with a Register-Stop.
#[tokio::test]
async fn test_rp_register_reception() {
    let (mut instance, mut rx) = setup();
    add_interface(&mut instance, "eth0", 1, RP);
    add_interface(&mut instance, "eth1", 2, ip4!("192.168.2.2"));
    hello_from(&mut instance, 2, ip4!("192.168.2.1"));
    add_rp(&mut instance);
    add_route(
        &mut instance,
        net4!("10.1.0.0/16"),
        ip4!("192.168.2.1"),
        2,
        110,
        10,
    );
    pump(&mut instance, &mut rx).await;
    let _ = collect_tx(&mut rx).await;

    // A Null-Register probe from a DR.
    let inner = vec![
        0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00,
        0x00, 0x0a, 0x01, 0x02, 0x05, 0xef, 0x01, 0x01, 0x01,
    ];
    instance.process_protocol_msg(ProtocolMsg::NetRxPacket(NetRxPacketMsg {
        ifindex: 2,
        src: ip4!("192.168.2.1"),
        packet: Ok(Packet::Register(RegisterMsg {
            border: false,
            null_register: true,
            data: Bytes::from(inner),
        })),
    }));
    pump(&mut instance, &mut rx).await;

    let entries = query_entries(&mut instance);
    let sg = find_entry(&entries, MreKind::Sg, ip4!("10.1.2.5"), GROUP)
        .unwrap();
    assert!(sg.i_am_rp);
    assert!(sg.keepalive_running);

    let packets = collect_tx(&mut rx).await;
    assert!(packets.iter().any(|(ifindex, packet)| {
        *ifindex == 2
            && matches!(packet, Packet::RegisterStop(msg)
                if msg.source == ip4!("10.1.2.5") && msg.group.addr == GROUP)
    }));
}

