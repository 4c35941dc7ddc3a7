// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

/// meshbus Rust SDK
///
/// Connect an agent to a mesh node, announce what it can do, exchange messages
/// and take part in help requests.

pub mod client;

pub use client::{AgentClient, ClientError};
pub use meshbus_core::domain::agent::{AgentId, Availability};
pub use meshbus_core::domain::help::HelpRequestId;
pub use meshbus_core::domain::message::{Message, MessageType};
