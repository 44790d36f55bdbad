//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::consts::ALL_MULTICAST_MASK_LEN;
use crate::error::Error;
use crate::interface::Interfaces;
use crate::mre::{MreFlags, MreKind};
use crate::mrt::Mrt;
use crate::packet::join_prune::{JoinPruneMsg, JpGroupRecord};
use crate::packet::{
    ENCODED_GROUP_SIZE, ENCODED_SOURCE_SIZE, ENCODED_UNICAST_SIZE,
    EncodedGroup, EncodedSource, PIM_HDR_SIZE, SourceAddrFlags,
};

// Hard caps of the Join/Prune wire format.
const MAX_GROUPS_PER_MSG: usize = 0xff;
const MAX_SOURCES_PER_GROUP: usize = 0xffff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum JpAction {
    Join,
    Prune,
}

// Join and Prune source lists for one entry kind of one group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct JpSources {
    pub joins: Vec<Ipv4Addr>,
    pub prunes: Vec<Ipv4Addr>,
}

// The pending Join/Prune state of one group toward one upstream neighbor.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct JpGroup {
    pub group: Ipv4Addr,
    pub group_mask_len: u8,
    pub rp: JpSources,
    pub wc: JpSources,
    pub sg: JpSources,
    pub sg_rpt: JpSources,
}

// Per-upstream-neighbor Join/Prune accumulator. Entries coalesce under
// the protocol's redundancy rules until the debounced flush builds the
// wire messages.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct JpAgg {
    pub groups: Vec<JpGroup>,
    pub holdtime: u16,
}

// ===== impl JpSources =====

impl JpSources {
    fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.prunes.is_empty()
    }
}

// ===== impl JpGroup =====

impl JpGroup {
    fn new(group: Ipv4Addr, group_mask_len: u8) -> JpGroup {
        JpGroup {
            group,
            group_mask_len,
            rp: Default::default(),
            wc: Default::default(),
            sg: Default::default(),
            sg_rpt: Default::default(),
        }
    }

    fn sources_n(&self) -> usize {
        [&self.rp, &self.wc, &self.sg, &self.sg_rpt]
            .iter()
            .map(|s| s.joins.len() + s.prunes.len())
            .sum()
    }

    fn message_size(&self) -> usize {
        ENCODED_GROUP_SIZE + 4 + self.sources_n() * ENCODED_SOURCE_SIZE
    }
}

// ===== impl JpAgg =====

impl JpAgg {
    pub(crate) fn reset(&mut self) {
        self.groups.clear();
        self.holdtime = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn message_size(&self) -> usize {
        PIM_HDR_SIZE
            + ENCODED_UNICAST_SIZE
            + 4
            + self
                .groups
                .iter()
                .map(JpGroup::message_size)
                .sum::<usize>()
    }

    fn group_entry(&mut self, group: Ipv4Addr, mask_len: u8) -> &mut JpGroup {
        if let Some(pos) = self
            .groups
            .iter()
            .position(|g| g.group == group && g.group_mask_len == mask_len)
        {
            &mut self.groups[pos]
        } else {
            self.groups.push(JpGroup::new(group, mask_len));
            self.groups.last_mut().unwrap()
        }
    }

    // Queues one entry, applying the redundancy rules:
    //  - duplicates are accepted and ignored;
    //  - a Join and a Prune for the same entry in one batch is an error;
    //  - (*,G) state supersedes accumulated (S,G,rpt) state;
    //  - an (S,G) Join supersedes the matching (S,G,rpt) Prune.
    pub(crate) fn add(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        group_mask_len: u8,
        kind: MreKind,
        action: JpAction,
        holdtime: u16,
    ) -> Result<(), Error> {
        let jp_group = self.group_entry(group, group_mask_len);

        let sources = match kind {
            MreKind::Rp => {
                match action {
                    JpAction::Join => {
                        if jp_group.rp.joins.contains(&source) {
                            return Ok(());
                        }
                    }
                    JpAction::Prune => {
                        if jp_group.rp.prunes.contains(&source) {
                            return Ok(());
                        }
                    }
                }
                &mut jp_group.rp
            }
            MreKind::Wc => {
                match action {
                    JpAction::Join => {
                        if jp_group.wc.joins.contains(&source) {
                            return Ok(());
                        }
                        if jp_group.wc.prunes.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                        jp_group.sg_rpt.joins.clear();
                    }
                    JpAction::Prune => {
                        if jp_group.wc.joins.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                        if jp_group.wc.prunes.contains(&source) {
                            return Ok(());
                        }
                        jp_group.sg_rpt.joins.clear();
                        jp_group.sg_rpt.prunes.clear();
                    }
                }
                &mut jp_group.wc
            }
            MreKind::SgRpt => {
                match action {
                    JpAction::Join => {
                        if !jp_group.wc.joins.is_empty()
                            || !jp_group.wc.prunes.is_empty()
                        {
                            // Inherited from the (*,G) state.
                            return Ok(());
                        }
                        if jp_group.sg_rpt.joins.contains(&source) {
                            return Ok(());
                        }
                        if jp_group.sg_rpt.prunes.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                    }
                    JpAction::Prune => {
                        if !jp_group.wc.prunes.is_empty() {
                            return Ok(());
                        }
                        if jp_group.sg_rpt.joins.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                        if jp_group.sg_rpt.prunes.contains(&source)
                            || jp_group.sg.joins.contains(&source)
                            || jp_group.sg.prunes.contains(&source)
                        {
                            return Ok(());
                        }
                    }
                }
                &mut jp_group.sg_rpt
            }
            MreKind::Sg => {
                match action {
                    JpAction::Join => {
                        if jp_group.sg.joins.contains(&source) {
                            return Ok(());
                        }
                        if jp_group.sg.prunes.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                        jp_group.sg_rpt.prunes.retain(|s| *s != source);
                    }
                    JpAction::Prune => {
                        if jp_group.sg.joins.contains(&source) {
                            return Err(Error::JpConflictingEntry(
                                source, group,
                            ));
                        }
                        if jp_group.sg.prunes.contains(&source) {
                            return Ok(());
                        }
                        jp_group.sg_rpt.prunes.retain(|s| *s != source);
                    }
                }
                &mut jp_group.sg
            }
        };

        match action {
            JpAction::Join => sources.joins.push(source),
            JpAction::Prune => sources.prunes.push(source),
        }
        self.holdtime = holdtime;

        Ok(())
    }

    // For every queued (*,G) Join, inserts an (S,G,rpt) Prune for each
    // source of the group that is off the shared tree or has no remaining
    // downstream interest.
    pub(crate) fn auto_insert_rpt_prunes(
        &mut self,
        mrt: &Mrt,
        interfaces: &Interfaces,
    ) {
        let holdtime = self.holdtime;
        let wc_joined_groups: Vec<Ipv4Addr> = self
            .groups
            .iter()
            .filter(|g| !g.wc.joins.is_empty())
            .map(|g| g.group)
            .collect();

        for group in wc_joined_groups {
            let Some(wc) = mrt.wc_entry(group) else {
                continue;
            };

            let mut prune_sources = Vec::new();

            // (S,G) entries forwarding (or about to forward) on the SPT
            // with a diverging RPF neighbor must stay pruned off the
            // shared tree.
            for sg in mrt.group_sg_entries(group) {
                if (sg.is_spt()
                    || sg.flags.contains(MreFlags::WAS_SPT_SWITCH_DESIRED))
                    && wc.rpfp_nbr_wc != sg.rpfp_nbr_sg
                {
                    prune_sources.push(sg.source);
                }
            }
            // (S,G,rpt) entries with no remaining downstream interest, or
            // diverging from the shared tree after an Assert.
            for sg_rpt in mrt.group_sg_rpt_entries(group) {
                if prune_sources.contains(&sg_rpt.source) {
                    continue;
                }
                if mrt
                    .inherited_olist_sg_rpt(sg_rpt.source, group, interfaces)
                    .is_empty()
                    || wc.rpfp_nbr_wc != sg_rpt.rpfp_nbr_sg_rpt
                {
                    prune_sources.push(sg_rpt.source);
                }
            }

            for source in prune_sources {
                let _ = self.add(
                    source,
                    group,
                    Ipv4Addr::BITS as u8,
                    MreKind::SgRpt,
                    JpAction::Prune,
                    holdtime,
                );
            }
        }
    }

    // Builds the wire messages, fragmenting on the MTU and on the 8-bit
    // group and 16-bit source count fields. When only a prefix of a
    // group's (S,G,rpt) Prunes fits alongside its (*,G) Join, the
    // numerically-smallest sources win and the rest rely on the next
    // periodic Join.
    pub(crate) fn build_packets(
        &self,
        upstream_nbr: Ipv4Addr,
        max_payload: usize,
    ) -> Vec<JoinPruneMsg> {
        let mut packets = Vec::new();
        let mut current = JpAgg {
            holdtime: self.holdtime,
            ..Default::default()
        };

        for jp_group in &self.groups {
            if current.groups.len() == MAX_GROUPS_PER_MSG {
                flush(&mut packets, &mut current, upstream_nbr);
            }
            // Start a fresh packet when the whole group record can't fit
            // in the remaining space but could fit in an empty one.
            if !current.groups.is_empty()
                && current.message_size() + jp_group.message_size()
                    > max_payload
            {
                flush(&mut packets, &mut current, upstream_nbr);
            }

            // The (S,G,rpt) Prunes travel with their (*,G) Join, smallest
            // addresses first so a truncated prefix is deterministic.
            let mut rpt_prunes = jp_group.sg_rpt.prunes.clone();
            rpt_prunes.sort();

            let segments: [(MreKind, JpAction, &[Ipv4Addr]); 8] = [
                (MreKind::Rp, JpAction::Join, &jp_group.rp.joins),
                (MreKind::Rp, JpAction::Prune, &jp_group.rp.prunes),
                (MreKind::Wc, JpAction::Join, &jp_group.wc.joins),
                (MreKind::Wc, JpAction::Prune, &jp_group.wc.prunes),
                (MreKind::SgRpt, JpAction::Prune, &rpt_prunes),
                (MreKind::SgRpt, JpAction::Join, &jp_group.sg_rpt.joins),
                (MreKind::Sg, JpAction::Join, &jp_group.sg.joins),
                (MreKind::Sg, JpAction::Prune, &jp_group.sg.prunes),
            ];

            let mut j_sources_n = 0;
            let mut p_sources_n = 0;

            for (kind, action, sources) in segments {
                for source in sources {
                    let counter = match action {
                        JpAction::Join => &mut j_sources_n,
                        JpAction::Prune => &mut p_sources_n,
                    };
                    if *counter == MAX_SOURCES_PER_GROUP
                        || current.message_size() + ENCODED_SOURCE_SIZE
                            > max_payload
                    {
                        flush(&mut packets, &mut current, upstream_nbr);
                        j_sources_n = 0;
                        p_sources_n = 0;
                    }
                    match action {
                        JpAction::Join => j_sources_n += 1,
                        JpAction::Prune => p_sources_n += 1,
                    }
                    let mask_len = match kind {
                        MreKind::Rp => ALL_MULTICAST_MASK_LEN,
                        _ => jp_group.group_mask_len,
                    };
                    let _ = current.add(
                        *source,
                        jp_group.group,
                        mask_len,
                        kind,
                        action,
                        self.holdtime,
                    );
                }
            }
        }

        if !current.groups.is_empty() {
            flush(&mut packets, &mut current, upstream_nbr);
        }

        packets
    }

    // Renders the accumulated state as one wire message body.
    fn to_message(&self, upstream_nbr: Ipv4Addr) -> JoinPruneMsg {
        let mut groups = Vec::with_capacity(self.groups.len());

        for jp_group in &self.groups {
            let mut joins = Vec::new();
            let mut prunes = Vec::new();
            let wildcard =
                SourceAddrFlags::SPARSE
                    | SourceAddrFlags::WILDCARD
                    | SourceAddrFlags::RPT;
            let host_len = Ipv4Addr::BITS as u8;

            for source in &jp_group.rp.joins {
                joins.push(EncodedSource::new(*source, wildcard, host_len));
            }
            for source in &jp_group.wc.joins {
                joins.push(EncodedSource::new(*source, wildcard, host_len));
            }
            for source in &jp_group.sg_rpt.joins {
                joins.push(EncodedSource::new(
                    *source,
                    SourceAddrFlags::SPARSE | SourceAddrFlags::RPT,
                    host_len,
                ));
            }
            for source in &jp_group.sg.joins {
                joins.push(EncodedSource::new(
                    *source,
                    SourceAddrFlags::SPARSE,
                    host_len,
                ));
            }
            for source in &jp_group.rp.prunes {
                prunes.push(EncodedSource::new(*source, wildcard, host_len));
            }
            for source in &jp_group.wc.prunes {
                prunes.push(EncodedSource::new(*source, wildcard, host_len));
            }
            for source in &jp_group.sg_rpt.prunes {
                prunes.push(EncodedSource::new(
                    *source,
                    SourceAddrFlags::SPARSE | SourceAddrFlags::RPT,
                    host_len,
                ));
            }
            for source in &jp_group.sg.prunes {
                prunes.push(EncodedSource::new(
                    *source,
                    SourceAddrFlags::SPARSE,
                    host_len,
                ));
            }

            groups.push(JpGroupRecord {
                group: EncodedGroup::new(
                    jp_group.group,
                    jp_group.group_mask_len,
                ),
                joins,
                prunes,
            });
        }

        JoinPruneMsg {
            upstream_nbr,
            holdtime: self.holdtime,
            groups,
        }
    }
}

// ===== helper functions =====

fn flush(
    packets: &mut Vec<JoinPruneMsg>,
    current: &mut JpAgg,
    upstream_nbr: Ipv4Addr,
) {
    if !current.groups.is_empty() {
        packets.push(current.to_message(upstream_nbr));
        let holdtime = current.holdtime;
        current.reset();
        current.holdtime = holdtime;
    }
}

#[cfg(test)]
mod tests {
    use const_addrs::ip4;

    use super::*;

    const HOLDTIME: u16 = 210;

    fn add(
        agg: &mut JpAgg,
        source: Ipv4Addr,
        group: Ipv4Addr,
        kind: MreKind,
        action: JpAction,
    ) -> Result<(), Error> {
        agg.add(source, group, Ipv4Addr::BITS as u8, kind, action, HOLDTIME)
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut agg = JpAgg::default();
        let (s, g) = (ip4!("10.0.0.1"), ip4!("239.1.1.1"));
        add(&mut agg, s, g, MreKind::Sg, JpAction::Join).unwrap();
        add(&mut agg, s, g, MreKind::Sg, JpAction::Join).unwrap();
        assert_eq!(agg.groups[0].sg.joins.len(), 1);
    }

    #[test]
    fn test_join_prune_conflict() {
        let mut agg = JpAgg::default();
        let (s, g) = (ip4!("10.0.0.1"), ip4!("239.1.1.1"));
        add(&mut agg, s, g, MreKind::Sg, JpAction::Join).unwrap();
        assert!(add(&mut agg, s, g, MreKind::Sg, JpAction::Prune).is_err());
    }

    #[test]
    fn test_wc_join_purges_rpt_state() {
        let mut agg = JpAgg::default();
        let g = ip4!("239.1.1.1");
        let rp = ip4!("10.0.0.100");
        add(&mut agg, ip4!("10.0.0.1"), g, MreKind::SgRpt, JpAction::Join)
            .unwrap();
        add(&mut agg, rp, g, MreKind::Wc, JpAction::Join).unwrap();
        // The (S,G,rpt) Join is inherited from the (*,G) Join.
        assert!(agg.groups[0].sg_rpt.joins.is_empty());

        // And new explicit (S,G,rpt) Joins are dropped as redundant.
        add(&mut agg, ip4!("10.0.0.2"), g, MreKind::SgRpt, JpAction::Join)
            .unwrap();
        assert!(agg.groups[0].sg_rpt.joins.is_empty());
    }

    #[test]
    fn test_sg_join_removes_rpt_prune() {
        let mut agg = JpAgg::default();
        let (s, g) = (ip4!("10.0.0.1"), ip4!("239.1.1.1"));
        add(&mut agg, s, g, MreKind::SgRpt, JpAction::Prune).unwrap();
        add(&mut agg, s, g, MreKind::Sg, JpAction::Join).unwrap();
        assert!(agg.groups[0].sg_rpt.prunes.is_empty());
        assert_eq!(agg.groups[0].sg.joins, vec![s]);
    }

    #[test]
    fn test_fragmentation_10k_prunes() {
        let mut agg = JpAgg::default();
        let g = ip4!("239.1.1.1");
        let rp = ip4!("10.0.0.100");
        add(&mut agg, rp, g, MreKind::Wc, JpAction::Join).unwrap();
        let base = u32::from(ip4!("10.1.0.0"));
        for i in 0..10_000u32 {
            add(
                &mut agg,
                Ipv4Addr::from(base + i),
                g,
                MreKind::SgRpt,
                JpAction::Prune,
            )
            .unwrap();
        }

        // 1500-byte MTU, 24 bytes of IP header and Router Alert.
        let max_payload = 1500 - 24;
        let packets = agg.build_packets(ip4!("192.168.1.1"), max_payload);
        assert!(packets.len() > 1);

        let mut total_sources = 0;
        for packet in &packets {
            // No packet exceeds the available payload.
            let size = PIM_HDR_SIZE
                + ENCODED_UNICAST_SIZE
                + 4
                + packet
                    .groups
                    .iter()
                    .map(|g| {
                        ENCODED_GROUP_SIZE
                            + 4
                            + (g.joins.len() + g.prunes.len())
                                * ENCODED_SOURCE_SIZE
                    })
                    .sum::<usize>();
            assert!(size <= max_payload);

            // Counts match the encoded records.
            for group in &packet.groups {
                assert!(group.joins.len() <= MAX_SOURCES_PER_GROUP);
                assert!(group.prunes.len() <= MAX_SOURCES_PER_GROUP);
                total_sources += group.joins.len() + group.prunes.len();
            }
        }
        // Every queued source went out: the (*,G) Join plus the prunes.
        assert_eq!(total_sources, 10_000 + 1);

        // The first packet carries the numerically smallest sources.
        let first_prunes: Vec<_> = packets[0].groups[0]
            .prunes
            .iter()
            .map(|s| s.addr)
            .collect();
        let mut sorted = first_prunes.clone();
        sorted.sort();
        assert_eq!(first_prunes, sorted);
        assert_eq!(first_prunes[0], Ipv4Addr::from(base));
    }

    #[test]
    fn test_group_count_fragmentation() {
        let mut agg = JpAgg::default();
        for i in 0..300u32 {
            let group = Ipv4Addr::from(u32::from(ip4!("239.0.0.0")) + i);
            add(
                &mut agg,
                ip4!("10.0.0.1"),
                group,
                MreKind::Sg,
                JpAction::Join,
            )
            .unwrap();
        }

        let packets = agg.build_packets(ip4!("192.168.1.1"), usize::MAX);
        assert!(packets.len() >= 2);
        for packet in &packets {
            assert!(packet.groups.len() <= MAX_GROUPS_PER_MSG);
        }
        let total: usize =
            packets.iter().map(|p| p.groups.len()).sum();
        assert_eq!(total, 300);
    }
}
