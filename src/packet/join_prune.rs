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
    DecodeResult, EncodedGroup, EncodedSource, get_encoded_unicast,
    put_encoded_unicast,
};

//
// PIM Join/Prune message.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |        Upstream Neighbor Address (Encoded-Unicast format)     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Reserved     | Num groups    |          Holdtime             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         Multicast Group Address 1 (Encoded-Group format)      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |   Number of Joined Sources    |   Number of Pruned Sources    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |        Joined Source Address 1 (Encoded-Source format)        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                             ...                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct JoinPruneMsg {
    pub upstream_nbr: Ipv4Addr,
    pub holdtime: u16,
    pub groups: Vec<JpGroupRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct JpGroupRecord {
    pub group: EncodedGroup,
    pub joins: Vec<EncodedSource>,
    pub prunes: Vec<EncodedSource>,
}

// ===== impl JoinPruneMsg =====

impl JoinPruneMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        put_encoded_unicast(buf, self.upstream_nbr);
        buf.put_u8(0);
        buf.put_u8(self.groups.len() as u8);
        buf.put_u16(self.holdtime);

        for group in &self.groups {
            group.group.encode(buf);
            buf.put_u16(group.joins.len() as u16);
            buf.put_u16(group.prunes.len() as u16);
            for source in &group.joins {
                source.encode(buf);
            }
            for source in &group.prunes {
                source.encode(buf);
            }
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let upstream_nbr = get_encoded_unicast(buf)?;
        let _reserved = buf.try_get_u8()?;
        let num_groups = buf.try_get_u8()?;
        let holdtime = buf.try_get_u16()?;

        let mut groups = Vec::with_capacity(num_groups as usize);
        for _ in 0..num_groups {
            let group = EncodedGroup::decode(buf)?;
            let num_joins = buf.try_get_u16()?;
            let num_prunes = buf.try_get_u16()?;

            let mut joins = Vec::with_capacity(num_joins as usize);
            for _ in 0..num_joins {
                joins.push(EncodedSource::decode(buf)?);
            }
            let mut prunes = Vec::with_capacity(num_prunes as usize);
            for _ in 0..num_prunes {
                prunes.push(EncodedSource::decode(buf)?);
            }

            groups.push(JpGroupRecord {
                group,
                joins,
                prunes,
            });
        }

        Ok(JoinPruneMsg {
            upstream_nbr,
            holdtime,
            groups,
        })
    }
}
