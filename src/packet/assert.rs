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

// High bit of the metric preference field carries the RPT-bit.
const ASSERT_RPT_BIT: u32 = 1 << 31;

//
// PIM Assert message.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Group Address (Encoded-Group format)                |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Source Address (Encoded-Unicast format)             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |R|                     Metric Preference                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                             Metric                            |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct AssertMsg {
    pub group: EncodedGroup,
    pub source: Ipv4Addr,
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub metric: u32,
}

// ===== impl AssertMsg =====

impl AssertMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        self.group.encode(buf);
        put_encoded_unicast(buf, self.source);
        let mut preference = self.metric_preference & !ASSERT_RPT_BIT;
        if self.rpt_bit {
            preference |= ASSERT_RPT_BIT;
        }
        buf.put_u32(preference);
        buf.put_u32(self.metric);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let group = EncodedGroup::decode(buf)?;
        let source = get_encoded_unicast(buf)?;
        let preference = buf.try_get_u32()?;
        let metric = buf.try_get_u32()?;

        Ok(AssertMsg {
            group,
            source,
            rpt_bit: preference & ASSERT_RPT_BIT != 0,
            metric_preference: preference & !ASSERT_RPT_BIT,
            metric,
        })
    }
}
