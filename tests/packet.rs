//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bytes::Bytes;
use const_addrs::ip4;
use holo_pim::packet::assert::AssertMsg;
use holo_pim::packet::hello::{HelloMsg, LanPruneDelayOption};
use holo_pim::packet::join_prune::{JoinPruneMsg, JpGroupRecord};
use holo_pim::packet::register::{RegisterMsg, RegisterStopMsg};
use holo_pim::packet::{
    DecodeError, DecodeResult, EncodedGroup, EncodedSource, GroupAddrFlags,
    Packet, SourceAddrFlags,
};

//
// Helper functions.
//

fn test_encode_packet(bytes_expected: &[u8], packet: &DecodeResult<Packet>) {
    let bytes_actual = packet.as_ref().unwrap().encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(bytes: &[u8], packet_expected: &DecodeResult<Packet>) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static HELLO1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x20, 0x00, 0x6a, 0xf9, // header
            0x00, 0x01, 0x00, 0x02, 0x00, 0x69, // holdtime 105
            0x00, 0x02, 0x00, 0x04, 0x01, 0xf4, 0x09, 0xc4, // lan delay
            0x00, 0x13, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, // dr prio
            0x00, 0x14, 0x00, 0x04, 0x12, 0x34, 0x56, 0x78, // genid
        ],
        Ok(Packet::Hello(HelloMsg {
            holdtime: Some(105),
            lan_prune_delay: Some(LanPruneDelayOption {
                t_bit: false,
                lan_delay: 500,
                override_interval: 2500,
            }),
            dr_priority: Some(1),
            genid: Some(0x12345678),
            addr_list: vec![],
        })),
    )
});

static JOIN_PRUNE1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x23, 0x00, 0x09, 0x10, // header
            0x01, 0x00, 0xc0, 0xa8, 0x01, 0x01, // upstream neighbor
            0x00, 0x01, 0x00, 0xd2, // reserved, 1 group, holdtime 210
            0x01, 0x00, 0x00, 0x20, 0xef, 0x01, 0x01, 0x01, // group
            0x00, 0x01, 0x00, 0x01, // 1 join, 1 prune
            0x01, 0x00, 0x04, 0x20, 0x0a, 0x00, 0x00, 0x05, // (S,G) join
            0x01, 0x00, 0x05, 0x20, 0x0a, 0x00, 0x00, 0x09, // rpt prune
        ],
        Ok(Packet::JoinPrune(JoinPruneMsg {
            upstream_nbr: ip4!("192.168.1.1"),
            holdtime: 210,
            groups: vec![JpGroupRecord {
                group: EncodedGroup {
                    addr: ip4!("239.1.1.1"),
                    flags: GroupAddrFlags::empty(),
                    mask_len: 32,
                },
                joins: vec![EncodedSource {
                    addr: ip4!("10.0.0.5"),
                    flags: SourceAddrFlags::SPARSE,
                    mask_len: 32,
                }],
                prunes: vec![EncodedSource {
                    addr: ip4!("10.0.0.9"),
                    flags: SourceAddrFlags::SPARSE | SourceAddrFlags::RPT,
                    mask_len: 32,
                }],
            }],
        })),
    )
});

static ASSERT1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x25, 0x00, 0xde, 0x5f, // header
            0x01, 0x00, 0x00, 0x20, 0xef, 0x01, 0x01, 0x01, // group
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x05, // source
            0x00, 0x00, 0x00, 0x6e, // metric preference 110
            0x00, 0x00, 0x00, 0x0a, // metric 10
        ],
        Ok(Packet::Assert(AssertMsg {
            group: EncodedGroup {
                addr: ip4!("239.1.1.1"),
                flags: GroupAddrFlags::empty(),
                mask_len: 32,
            },
            source: ip4!("10.0.0.5"),
            rpt_bit: false,
            metric_preference: 110,
            metric: 10,
        })),
    )
});

static REGISTER_NULL1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x21, 0x00, 0xde, 0xff, // header (checksum over header only)
            0x40, 0x00, 0x00, 0x00, // null-register bit
        ],
        Ok(Packet::Register(RegisterMsg {
            border: false,
            null_register: true,
            data: Bytes::new(),
        })),
    )
});

static REGISTER_DATA1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    let inner = vec![
        0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00,
        0x00, 0x0a, 0x00, 0x00, 0x05, 0xef, 0x01, 0x01, 0x01,
    ];
    let mut bytes = vec![
        0x21, 0x00, 0xde, 0xff, // header
        0x00, 0x00, 0x00, 0x00, // flags
    ];
    bytes.extend(&inner);
    (
        bytes,
        Ok(Packet::Register(RegisterMsg {
            border: false,
            null_register: false,
            data: Bytes::from(inner),
        })),
    )
});

static REGISTER_STOP1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x22, 0x00, 0xe1, 0xd7, // header
            0x01, 0x00, 0x00, 0x20, 0xef, 0x01, 0x01, 0x01, // group
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x05, // source
        ],
        Ok(Packet::RegisterStop(RegisterStopMsg {
            group: EncodedGroup {
                addr: ip4!("239.1.1.1"),
                flags: GroupAddrFlags::empty(),
                mask_len: 32,
            },
            source: ip4!("10.0.0.5"),
        })),
    )
});

static BAD_VERSION1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![0x30, 0x00, 0xcf, 0xff],
        Err(DecodeError::InvalidVersion(3)),
    )
});

static BAD_CHECKSUM1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x25, 0x00, 0xde, 0x60, // corrupted checksum
            0x01, 0x00, 0x00, 0x20, 0xef, 0x01, 0x01, 0x01,
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x05,
            0x00, 0x00, 0x00, 0x6e,
            0x00, 0x00, 0x00, 0x0a,
        ],
        Err(DecodeError::InvalidChecksum),
    )
});

static BAD_FAMILY1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x25, 0x00, 0xdd, 0x5f, // header
            0x02, 0x00, 0x00, 0x20, 0xef, 0x01, 0x01, 0x01, // IPv6 family
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x05,
            0x00, 0x00, 0x00, 0x6e,
            0x00, 0x00, 0x00, 0x0a,
        ],
        Err(DecodeError::UnknownAddressFamily(2)),
    )
});

static BAD_MASKLEN1: Lazy<(Vec<u8>, DecodeResult<Packet>)> = Lazy::new(|| {
    (
        vec![
            0x25, 0x00, 0xde, 0x5e, // header
            0x01, 0x00, 0x00, 0x21, 0xef, 0x01, 0x01, 0x01, // /33 group
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x05,
            0x00, 0x00, 0x00, 0x6e,
            0x00, 0x00, 0x00, 0x0a,
        ],
        Err(DecodeError::InvalidMaskLength(33)),
    )
});

//
// Tests.
//

#[test]
fn test_encode_hello1() {
    let (ref bytes, ref packet) = *HELLO1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_hello1() {
    let (ref bytes, ref packet) = *HELLO1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_join_prune1() {
    let (ref bytes, ref packet) = *JOIN_PRUNE1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_join_prune1() {
    let (ref bytes, ref packet) = *JOIN_PRUNE1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_assert1() {
    let (ref bytes, ref packet) = *ASSERT1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_assert1() {
    let (ref bytes, ref packet) = *ASSERT1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_register_null1() {
    let (ref bytes, ref packet) = *REGISTER_NULL1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_register_null1() {
    let (ref bytes, ref packet) = *REGISTER_NULL1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_register_data1() {
    let (ref bytes, ref packet) = *REGISTER_DATA1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_register_data1() {
    let (ref bytes, ref packet) = *REGISTER_DATA1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_register_stop1() {
    let (ref bytes, ref packet) = *REGISTER_STOP1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_register_stop1() {
    let (ref bytes, ref packet) = *REGISTER_STOP1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_bad_version1() {
    let (ref bytes, ref packet) = *BAD_VERSION1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_bad_checksum1() {
    let (ref bytes, ref packet) = *BAD_CHECKSUM1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_bad_family1() {
    let (ref bytes, ref packet) = *BAD_FAMILY1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_bad_masklen1() {
    let (ref bytes, ref packet) = *BAD_MASKLEN1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_truncated() {
    assert_eq!(
        Packet::decode(&[0x20, 0x00]),
        Err(DecodeError::IncompletePacket)
    );

    // A Join/Prune announcing more sources than it carries.
    let (bytes, _) = &*JOIN_PRUNE1;
    let mut truncated = bytes.clone();
    truncated.truncate(bytes.len() - 8);
    // The checksum no longer matches after truncation.
    assert!(Packet::decode(&truncated).is_err());
}

// Round-trip law: decoding a valid message and re-encoding it yields the
// original bytes.
#[test]
fn test_round_trip() {
    for (bytes, _) in [
        &*HELLO1,
        &*JOIN_PRUNE1,
        &*ASSERT1,
        &*REGISTER_NULL1,
        &*REGISTER_DATA1,
        &*REGISTER_STOP1,
    ] {
        let packet = Packet::decode(bytes).unwrap();
        assert_eq!(packet.encode().as_ref(), &bytes[..]);
    }
}
