//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod configuration;
pub mod state;

use tokio::sync::oneshot;

use crate::northbound::configuration::ConfigMsg;
use crate::northbound::state::{QueryMsg, QueryReply};

// Operator requests. Configuration is injected through here; no
// environment variables are read.
#[derive(Debug)]
pub enum NorthboundMsg {
    Config(ConfigMsg),
    Query(QueryMsg, oneshot::Sender<QueryReply>),
}
