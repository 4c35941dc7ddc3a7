// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer
//!
//! Pure types and state machines. Nothing in here performs I/O; time is passed
//! in by callers wherever an invariant depends on it.
//!
//! | Module | Aggregate / Concern |
//! |--------|---------------------|
//! | [`agent`] | `DiscoveredAgent`, trust arithmetic |
//! | [`message`] | `Message` envelope and type tags |
//! | [`help`] | `HelpRequest` lifecycle |
//! | [`delivery`] | `StoreForwardEntry`, `DeadMessage`, failure taxonomy |
//! | [`circuit_breaker`] | per-domain breaker state machine |
//! | [`backoff`] | exponential backoff with jitter |
//! | [`transport`] | `PubSubBackend` substrate boundary |
//! | [`link`] | `RemoteDomainLink` and the forward/ack wire types |
//! | [`repository`] | persistence contracts |
//! | [`events`] | bus domain events |
//! | [`mesh_config`] | `MeshConfigManifest` |

pub mod agent;
pub mod backoff;
pub mod circuit_breaker;
pub mod delivery;
pub mod events;
pub mod help;
pub mod link;
pub mod mesh_config;
pub mod message;
pub mod repository;
pub mod transport;
