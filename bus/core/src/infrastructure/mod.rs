// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Infrastructure Layer
//!
//! Adapters behind the domain traits: the JSON wire codec, the pub/sub
//! connection manager and backends, the cross-domain link, repositories and
//! the in-process event bus.

pub mod codec;
pub mod domain_link;
pub mod event_bus;
pub mod repositories;
pub mod transport;

pub use codec::JsonCodec;
pub use domain_link::PubSubDomainLink;
pub use event_bus::{BusEvent, EventBus};
pub use transport::{ConnectionManager, InMemoryPubSub};
