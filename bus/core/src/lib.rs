// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `meshbus-core` - Agent Collaboration Bus
//!
//! Discovery, messaging, help requests and trust accounting for independent
//! agent processes sharing a pub/sub substrate.
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `Message`, `DiscoveredAgent`, `HelpRequest`, `StoreForwardEntry`, `CircuitBreaker`, config |
//! | [`application`] | Application | registry, router, store-and-forward, dead letters, help requests, node |
//! | [`infrastructure`] | Infrastructure | JSON codec, transport backends, repositories, event bus |

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
