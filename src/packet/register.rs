//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::packet::{
    DecodeResult, EncodedGroup, get_encoded_unicast, put_encoded_unicast,
};

// Register message flag bits.
const REGISTER_BORDER_BIT: u32 = 1 << 31;
const REGISTER_NULL_BIT: u32 = 1 << 30;

//
// PIM Register message.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |B|N|                     Reserved2                             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// .                     Multicast data packet                     .
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct RegisterMsg {
    pub border: bool,
    pub null_register: bool,
    // The encapsulated IP packet (empty for Null-Registers).
    pub data: Bytes,
}

//
// PIM Register-Stop message.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |            Group Address (Encoded-Group format)               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |            Source Address (Encoded-Unicast format)            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct RegisterStopMsg {
    pub group: EncodedGroup,
    pub source: Ipv4Addr,
}

// ===== impl RegisterMsg =====

impl RegisterMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.border {
            flags |= REGISTER_BORDER_BIT;
        }
        if self.null_register {
            flags |= REGISTER_NULL_BIT;
        }
        buf.put_u32(flags);
        buf.put_slice(&self.data);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let flags = buf.try_get_u32()?;
        let data = buf.clone();

        Ok(RegisterMsg {
            border: flags & REGISTER_BORDER_BIT != 0,
            null_register: flags & REGISTER_NULL_BIT != 0,
            data,
        })
    }
}

// ===== impl RegisterStopMsg =====

impl RegisterStopMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        self.group.encode(buf);
        put_encoded_unicast(buf, self.source);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let group = EncodedGroup::decode(buf)?;
        let source = get_encoded_unicast(buf)?;

        Ok(RegisterStopMsg { group, source })
    }
}
