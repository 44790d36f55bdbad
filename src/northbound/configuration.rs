//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};

use crate::consts::{
    ASSERT_TIME, REGISTER_PROBE_TIME, REGISTER_SUPPRESSION_TIME,
};
use crate::instance::Instance;

// Instance-wide configuration.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InstanceCfg {
    pub enabled: bool,
    // SPT-switch policy: switch after `bytes` bytes within `interval`
    // seconds of shared-tree traffic.
    pub spt_switch_enabled: bool,
    pub spt_switch_interval: Option<u16>,
    pub spt_switch_bytes: Option<u64>,
    // Protocol timers (seconds).
    pub assert_time: u16,
    pub register_suppression_time: u16,
    pub register_probe_time: u16,
    pub trace_opts: TraceOptions,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct TraceOptions {
    pub packets_rx: bool,
    pub packets_tx: bool,
    pub ibus: bool,
}

// Operator configuration commands.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum ConfigMsg {
    InstanceEnable(bool),
    SptSwitch {
        enabled: bool,
        interval: Option<u16>,
        bytes: Option<u64>,
    },
    ProtocolTimers {
        assert_time: u16,
        register_suppression_time: u16,
        register_probe_time: u16,
    },
    TraceOptions(TraceOptions),
    InterfaceEnable {
        ifname: String,
        enabled: bool,
    },
    InterfaceHelloPeriod {
        ifname: String,
        period: u16,
    },
    InterfaceDrPriority {
        ifname: String,
        priority: u32,
    },
    InterfaceJpPeriod {
        ifname: String,
        period: u16,
    },
    InterfaceLanDelay {
        ifname: String,
        propagation_delay: u16,
        override_interval: u16,
    },
    InterfaceAcceptNohello {
        ifname: String,
        accept: bool,
    },
}

// ===== impl InstanceCfg =====

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            enabled: false,
            spt_switch_enabled: true,
            spt_switch_interval: None,
            spt_switch_bytes: None,
            assert_time: ASSERT_TIME,
            register_suppression_time: REGISTER_SUPPRESSION_TIME,
            register_probe_time: REGISTER_PROBE_TIME,
            trace_opts: Default::default(),
        }
    }
}

// ===== global functions =====

// Applies one operator configuration command.
pub(crate) fn process_config_msg(instance: &mut Instance, msg: ConfigMsg) {
    match msg {
        ConfigMsg::InstanceEnable(enabled) => {
            instance.config.enabled = enabled;
            instance.update();
        }
        ConfigMsg::SptSwitch {
            enabled,
            interval,
            bytes,
        } => {
            instance.config.spt_switch_enabled = enabled;
            instance.config.spt_switch_interval = interval;
            instance.config.spt_switch_bytes = bytes;
        }
        ConfigMsg::ProtocolTimers {
            assert_time,
            register_suppression_time,
            register_probe_time,
        } => {
            instance.config.assert_time = assert_time;
            instance.config.register_suppression_time =
                register_suppression_time;
            instance.config.register_probe_time = register_probe_time;
        }
        ConfigMsg::TraceOptions(trace_opts) => {
            instance.config.trace_opts = trace_opts;
        }
        ConfigMsg::InterfaceEnable { ifname, enabled } => {
            instance.interfaces.add(&ifname).config.enabled = enabled;
            instance.update_interface(&ifname);
        }
        ConfigMsg::InterfaceHelloPeriod { ifname, period } => {
            instance.interfaces.add(&ifname).config.hello_period = period;
        }
        ConfigMsg::InterfaceDrPriority { ifname, priority } => {
            instance.interfaces.add(&ifname).config.dr_priority = priority;
            instance.rerun_dr_election(&ifname);
        }
        ConfigMsg::InterfaceJpPeriod { ifname, period } => {
            instance.interfaces.add(&ifname).config.jp_period = period;
        }
        ConfigMsg::InterfaceLanDelay {
            ifname,
            propagation_delay,
            override_interval,
        } => {
            let iface = instance.interfaces.add(&ifname);
            iface.config.propagation_delay = propagation_delay;
            iface.config.override_interval = override_interval;
        }
        ConfigMsg::InterfaceAcceptNohello { ifname, accept } => {
            instance.interfaces.add(&ifname).config.accept_nohello_neighbors =
                accept;
        }
    }
}
