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
    DecodeResult, get_encoded_unicast, put_encoded_unicast,
    ENCODED_UNICAST_SIZE,
};

// Hello option types.
//
// IANA registry:
// https://www.iana.org/assignments/pim-parameters/pim-parameters.xhtml#pim-parameters-3
pub const OPTION_HOLDTIME: u16 = 1;
pub const OPTION_LAN_PRUNE_DELAY: u16 = 2;
pub const OPTION_DR_PRIORITY: u16 = 19;
pub const OPTION_GENID: u16 = 20;
pub const OPTION_ADDR_LIST: u16 = 24;

// T-bit of the LAN Prune Delay option.
const LAN_PRUNE_DELAY_TBIT: u16 = 1 << 15;

//
// PIM Hello message.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          OptionType           |         OptionLength          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                          OptionValue                          |
// |                              ...                              |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// Unknown options are skipped on input. On output the recognized options
// are emitted in ascending option-type order.
//
#[derive(Clone, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct HelloMsg {
    pub holdtime: Option<u16>,
    pub lan_prune_delay: Option<LanPruneDelayOption>,
    pub dr_priority: Option<u32>,
    pub genid: Option<u32>,
    pub addr_list: Vec<Ipv4Addr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct LanPruneDelayOption {
    // When set, the neighbor is capable of disabling Join suppression.
    pub t_bit: bool,
    // Propagation delay of the link (milliseconds).
    pub lan_delay: u16,
    // Override interval of the link (milliseconds).
    pub override_interval: u16,
}

// ===== impl HelloMsg =====

impl HelloMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        if let Some(holdtime) = self.holdtime {
            buf.put_u16(OPTION_HOLDTIME);
            buf.put_u16(2);
            buf.put_u16(holdtime);
        }
        if let Some(lan_prune_delay) = &self.lan_prune_delay {
            let mut lan_delay = lan_prune_delay.lan_delay & !LAN_PRUNE_DELAY_TBIT;
            if lan_prune_delay.t_bit {
                lan_delay |= LAN_PRUNE_DELAY_TBIT;
            }
            buf.put_u16(OPTION_LAN_PRUNE_DELAY);
            buf.put_u16(4);
            buf.put_u16(lan_delay);
            buf.put_u16(lan_prune_delay.override_interval);
        }
        if let Some(dr_priority) = self.dr_priority {
            buf.put_u16(OPTION_DR_PRIORITY);
            buf.put_u16(4);
            buf.put_u32(dr_priority);
        }
        if let Some(genid) = self.genid {
            buf.put_u16(OPTION_GENID);
            buf.put_u16(4);
            buf.put_u32(genid);
        }
        if !self.addr_list.is_empty() {
            buf.put_u16(OPTION_ADDR_LIST);
            buf.put_u16((self.addr_list.len() * ENCODED_UNICAST_SIZE) as u16);
            for addr in &self.addr_list {
                put_encoded_unicast(buf, *addr);
            }
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let mut hello = HelloMsg::default();

        while buf.remaining() >= 4 {
            let option_type = buf.try_get_u16()?;
            let option_len = buf.try_get_u16()? as usize;
            if buf.remaining() < option_len {
                return Err(crate::packet::DecodeError::IncompletePacket);
            }
            let mut value = buf.split_to(option_len);

            match (option_type, option_len) {
                (OPTION_HOLDTIME, 2) => {
                    hello.holdtime = Some(value.try_get_u16()?);
                }
                (OPTION_LAN_PRUNE_DELAY, 4) => {
                    let lan_delay = value.try_get_u16()?;
                    let override_interval = value.try_get_u16()?;
                    hello.lan_prune_delay = Some(LanPruneDelayOption {
                        t_bit: lan_delay & LAN_PRUNE_DELAY_TBIT != 0,
                        lan_delay: lan_delay & !LAN_PRUNE_DELAY_TBIT,
                        override_interval,
                    });
                }
                (OPTION_DR_PRIORITY, 4) => {
                    hello.dr_priority = Some(value.try_get_u32()?);
                }
                (OPTION_GENID, 4) => {
                    hello.genid = Some(value.try_get_u32()?);
                }
                (OPTION_ADDR_LIST, _) => {
                    while value.remaining() >= ENCODED_UNICAST_SIZE {
                        hello.addr_list.push(get_encoded_unicast(&mut value)?);
                    }
                }
                // Skip unknown options and recognized options of
                // unexpected length.
                _ => (),
            }
        }

        Ok(hello)
    }
}
