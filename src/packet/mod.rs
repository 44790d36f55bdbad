//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod assert;
pub mod hello;
pub mod join_prune;
pub mod register;

use std::cell::RefCell;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use internet_checksum::Checksum;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::consts::PIM_VERSION;
use crate::packet::assert::AssertMsg;
use crate::packet::hello::HelloMsg;
use crate::packet::join_prune::JoinPruneMsg;
use crate::packet::register::{RegisterMsg, RegisterStopMsg};

// Type aliases.
pub type DecodeResult<T> = Result<T, DecodeError>;

// Scratch buffer shared by all encode methods on the same thread.
thread_local!(
    pub static TLS_BUF: RefCell<BytesMut> =
        RefCell::new(BytesMut::with_capacity(65536))
);

// Address family numbers used by the PIM encoded address formats.
//
// IANA registry:
// https://www.iana.org/assignments/address-family-numbers/address-family-numbers.xhtml
pub const ADDR_FAMILY_IPV4: u8 = 1;
pub const ADDR_FAMILY_IPV6: u8 = 2;
pub const NATIVE_ENCODING: u8 = 0;

// Encoded address sizes for the IPv4 address family.
pub const ENCODED_UNICAST_SIZE: usize = 6;
pub const ENCODED_GROUP_SIZE: usize = 8;
pub const ENCODED_SOURCE_SIZE: usize = 8;

//
// PIM Common Header Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |PIM Ver| Type  |   Reserved    |           Checksum            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
pub const PIM_HDR_SIZE: usize = 4;

// PIM Message Types.
//
// IANA registry:
// https://www.iana.org/assignments/pim-parameters/pim-parameters.xhtml
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PacketType {
    Hello = 0,
    Register = 1,
    RegisterStop = 2,
    JoinPrune = 3,
    Bootstrap = 4,
    Assert = 5,
    Graft = 6,
    GraftAck = 7,
    CandRpAdv = 8,
}

// PIM decode errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    IncompletePacket,
    InvalidVersion(u8),
    UnknownPacketType(u8),
    InvalidChecksum,
    UnknownAddressFamily(u8),
    InvalidEncodingType(u8),
    InvalidMaskLength(u8),
    ReadOutOfBounds,
}

bitflags! {
    // Encoded-Group address flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct GroupAddrFlags: u8 {
        const ZONE_SCOPE = 0x01;
    }
}

bitflags! {
    // Encoded-Source address flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct SourceAddrFlags: u8 {
        const RPT = 0x01;
        const WILDCARD = 0x02;
        const SPARSE = 0x04;
    }
}

//
// Encoded-Group Address Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Addr Family   | Encoding Type |B| Reserved  |Z|  Mask Len     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                Group multicast Address                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct EncodedGroup {
    pub addr: Ipv4Addr,
    pub flags: GroupAddrFlags,
    pub mask_len: u8,
}

//
// Encoded-Source Address Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Addr Family   | Encoding Type | Rsrvd   |S|W|R|  Mask Len     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Source Address                         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct EncodedSource {
    pub addr: Ipv4Addr,
    pub flags: SourceAddrFlags,
    pub mask_len: u8,
}

// PIM protocol packet.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Packet {
    Hello(HelloMsg),
    Register(RegisterMsg),
    RegisterStop(RegisterStopMsg),
    JoinPrune(JoinPruneMsg),
    Assert(AssertMsg),
    // Message types that are decoded and counted, but otherwise ignored
    // (Bootstrap, Graft, Graft-Ack, Candidate-RP-Advertisement).
    Other(PacketType, Bytes),
}

// ===== impl Packet =====

impl Packet {
    // Encodes PIM packet into a bytes buffer.
    pub fn encode(&self) -> BytesMut {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            buf.put_u8((PIM_VERSION << 4) | self.pkt_type() as u8);
            buf.put_u8(0);
            // The checksum will be initialized later.
            buf.put_u16(0);

            match self {
                Packet::Hello(msg) => msg.encode(&mut buf),
                Packet::Register(msg) => msg.encode(&mut buf),
                Packet::RegisterStop(msg) => msg.encode(&mut buf),
                Packet::JoinPrune(msg) => msg.encode(&mut buf),
                Packet::Assert(msg) => msg.encode(&mut buf),
                Packet::Other(_, body) => buf.put_slice(body),
            }

            update_cksum(&mut buf, self.pkt_type());
            buf.clone()
        })
    }

    // Decodes PIM packet from a bytes buffer.
    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < PIM_HDR_SIZE {
            return Err(DecodeError::IncompletePacket);
        }

        let mut buf = Bytes::copy_from_slice(data);
        let first_byte = buf.try_get_u8()?;
        let version = first_byte >> 4;
        if version != PIM_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let pkt_type = first_byte & 0x0F;
        let Some(pkt_type) = PacketType::from_u8(pkt_type) else {
            return Err(DecodeError::UnknownPacketType(pkt_type));
        };
        let _reserved = buf.try_get_u8()?;
        let _checksum = buf.try_get_u16()?;
        verify_cksum(data, pkt_type)?;

        let packet = match pkt_type {
            PacketType::Hello => Packet::Hello(HelloMsg::decode(&mut buf)?),
            PacketType::Register => {
                Packet::Register(RegisterMsg::decode(&mut buf)?)
            }
            PacketType::RegisterStop => {
                Packet::RegisterStop(RegisterStopMsg::decode(&mut buf)?)
            }
            PacketType::JoinPrune => {
                Packet::JoinPrune(JoinPruneMsg::decode(&mut buf)?)
            }
            PacketType::Assert => Packet::Assert(AssertMsg::decode(&mut buf)?),
            PacketType::Bootstrap
            | PacketType::Graft
            | PacketType::GraftAck
            | PacketType::CandRpAdv => Packet::Other(pkt_type, buf),
        };

        Ok(packet)
    }

    pub fn pkt_type(&self) -> PacketType {
        match self {
            Packet::Hello(_) => PacketType::Hello,
            Packet::Register(_) => PacketType::Register,
            Packet::RegisterStop(_) => PacketType::RegisterStop,
            Packet::JoinPrune(_) => PacketType::JoinPrune,
            Packet::Assert(_) => PacketType::Assert,
            Packet::Other(pkt_type, _) => *pkt_type,
        }
    }
}

// ===== impl EncodedGroup =====

impl EncodedGroup {
    pub(crate) fn new(addr: Ipv4Addr, mask_len: u8) -> EncodedGroup {
        EncodedGroup {
            addr,
            flags: GroupAddrFlags::empty(),
            mask_len,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ADDR_FAMILY_IPV4);
        buf.put_u8(NATIVE_ENCODING);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.mask_len);
        buf.put_u32(self.addr.into());
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let (addr, flags, mask_len) = get_encoded_addr(buf)?;
        Ok(EncodedGroup {
            addr,
            flags: GroupAddrFlags::from_bits_truncate(flags),
            mask_len,
        })
    }
}

// ===== impl EncodedSource =====

impl EncodedSource {
    pub(crate) fn new(
        addr: Ipv4Addr,
        flags: SourceAddrFlags,
        mask_len: u8,
    ) -> EncodedSource {
        EncodedSource {
            addr,
            flags,
            mask_len,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ADDR_FAMILY_IPV4);
        buf.put_u8(NATIVE_ENCODING);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.mask_len);
        buf.put_u32(self.addr.into());
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let (addr, flags, mask_len) = get_encoded_addr(buf)?;
        Ok(EncodedSource {
            addr,
            flags: SourceAddrFlags::from_bits_truncate(flags),
            mask_len,
        })
    }
}

// ===== helper functions =====

// The Register checksum covers the PIM header only, so the encapsulated
// data packet doesn't need to be touched when forwarding natively.
fn update_cksum(buf: &mut BytesMut, pkt_type: PacketType) {
    let mut cksum = Checksum::new();
    match pkt_type {
        PacketType::Register => cksum.add_bytes(&buf[..PIM_HDR_SIZE]),
        _ => cksum.add_bytes(buf),
    }
    buf[2..4].copy_from_slice(&cksum.checksum());
}

fn verify_cksum(data: &[u8], pkt_type: PacketType) -> DecodeResult<()> {
    let mut cksum = Checksum::new();
    match pkt_type {
        PacketType::Register => cksum.add_bytes(&data[..PIM_HDR_SIZE]),
        _ => cksum.add_bytes(data),
    }
    if cksum.checksum() != [0, 0] {
        return Err(DecodeError::InvalidChecksum);
    }
    Ok(())
}

pub(crate) fn put_encoded_unicast(buf: &mut BytesMut, addr: Ipv4Addr) {
    buf.put_u8(ADDR_FAMILY_IPV4);
    buf.put_u8(NATIVE_ENCODING);
    buf.put_u32(addr.into());
}

pub(crate) fn get_encoded_unicast(buf: &mut Bytes) -> DecodeResult<Ipv4Addr> {
    let family = buf.try_get_u8()?;
    if family != ADDR_FAMILY_IPV4 {
        return Err(DecodeError::UnknownAddressFamily(family));
    }
    let encoding = buf.try_get_u8()?;
    if encoding != NATIVE_ENCODING {
        return Err(DecodeError::InvalidEncodingType(encoding));
    }
    Ok(Ipv4Addr::from(buf.try_get_u32()?))
}

fn get_encoded_addr(buf: &mut Bytes) -> DecodeResult<(Ipv4Addr, u8, u8)> {
    let family = buf.try_get_u8()?;
    if family != ADDR_FAMILY_IPV4 {
        return Err(DecodeError::UnknownAddressFamily(family));
    }
    let encoding = buf.try_get_u8()?;
    if encoding != NATIVE_ENCODING {
        return Err(DecodeError::InvalidEncodingType(encoding));
    }
    let flags = buf.try_get_u8()?;
    let mask_len = buf.try_get_u8()?;
    if mask_len > Ipv4Addr::BITS as u8 {
        return Err(DecodeError::InvalidMaskLength(mask_len));
    }
    let addr = Ipv4Addr::from(buf.try_get_u32()?);
    Ok((addr, flags, mask_len))
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::IncompletePacket => {
                write!(f, "incomplete packet")
            }
            DecodeError::InvalidVersion(version) => {
                write!(f, "invalid PIM version: {version}")
            }
            DecodeError::UnknownPacketType(pkt_type) => {
                write!(f, "unknown packet type: {pkt_type}")
            }
            DecodeError::InvalidChecksum => {
                write!(f, "invalid checksum")
            }
            DecodeError::UnknownAddressFamily(family) => {
                write!(f, "unknown address family: {family}")
            }
            DecodeError::InvalidEncodingType(encoding) => {
                write!(f, "invalid address encoding type: {encoding}")
            }
            DecodeError::InvalidMaskLength(mask_len) => {
                write!(f, "invalid mask length: {mask_len}")
            }
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}
