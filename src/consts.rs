//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

// PIM IP protocol number.
pub const PIM_IP_PROTO: i32 = 103;

// Supported PIM protocol version.
pub const PIM_VERSION: u8 = 2;

// ALL-PIM-ROUTERS multicast address (224.0.0.13).
pub const ALL_PIM_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 13);

// The all-multicast prefix used as the group of (*,*,RP) entries.
pub const ALL_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 0);
pub const ALL_MULTICAST_MASK_LEN: u8 = 4;

// Hello defaults (seconds unless noted).
pub const HELLO_PERIOD: u16 = 30;
pub const HELLO_HOLDTIME_RATIO: f64 = 3.5;
pub const HELLO_TRIGGERED_DELAY: u16 = 5;
pub const HELLO_HOLDTIME_FOREVER: u16 = 0xffff;
pub const DR_PRIORITY_DEFAULT: u32 = 1;

// LAN Prune Delay defaults (milliseconds).
pub const LAN_DELAY_MSEC: u16 = 500;
pub const OVERRIDE_INTERVAL_MSEC: u16 = 2500;

// Join/Prune defaults.
pub const JOIN_PRUNE_PERIOD: u16 = 60;
pub const JOIN_PRUNE_HOLDTIME_RATIO: f64 = 3.5;

// Assert defaults.
pub const ASSERT_TIME: u16 = 180;
pub const ASSERT_OVERRIDE_INTERVAL: u16 = 3;
pub const ASSERT_MAX_METRIC_PREFERENCE: u32 = 0x7fffffff;
pub const ASSERT_MAX_METRIC: u32 = 0xffffffff;
// Asserts triggered by WRONGVIF upcalls are limited to one per second
// per (S,G,interface).
pub const ASSERT_WRONGVIF_RATE_LIMIT: u16 = 1;

// Register defaults.
pub const REGISTER_SUPPRESSION_TIME: u16 = 60;
pub const REGISTER_PROBE_TIME: u16 = 5;

// (S,G) keepalive periods. The RP uses the longer period on its
// register-decapsulation entries.
pub const KEEPALIVE_PERIOD: u16 = 210;
pub const RP_KEEPALIVE_PERIOD: u16 =
    3 * REGISTER_SUPPRESSION_TIME + REGISTER_PROBE_TIME;

// Number of measurement buckets per dataflow threshold interval.
pub const DATAFLOW_TEST_FREQUENCY: u32 = 4;

// Default SPT switch threshold: switch on the first forwarded packet.
pub const SPT_SWITCH_INTERVAL: u16 = 100;
pub const SPT_SWITCH_BYTES: u64 = 0;

// Largest PIM payload carried in a single IPv4 packet (IP header and
// Router Alert option excluded).
pub const PIM_MAX_PACKET: usize = 65535 - 20 - 4;
