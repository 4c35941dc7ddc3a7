// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the meshbus CLI

pub mod broker;
pub mod config;
pub mod node;

pub use self::broker::BrokerCommand;
pub use self::config::ConfigCommand;
pub use self::node::NodeCommand;
