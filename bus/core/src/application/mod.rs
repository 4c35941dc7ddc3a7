// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer
//!
//! Services that own the bus's mutable state and coordinate the domain types
//! over the infrastructure adapters.
//!
//! | Module | Service |
//! |--------|---------|
//! | [`registry`] | `AgentRegistry` |
//! | [`router`] | `MessageRouter` |
//! | [`store_forward`] | `StoreForwardEngine`, `DeliveryHandle` |
//! | [`dead_letter`] | `DeadLetterManager`, `RecoveryExecutor` |
//! | [`help`] | `HelpRequestManager` |
//! | [`circuit_breakers`] | `CircuitBreakerRegistry` |
//! | [`correlation`] | `Correlator`, `ReplyCorrelator` |
//! | [`gateway`] | `DomainGateway` |
//! | [`sweeper`] | `MaintenanceSweeper` |
//! | [`node`] | `MeshNode` composition root |

pub mod circuit_breakers;
pub mod correlation;
pub mod dead_letter;
pub mod gateway;
pub mod help;
pub mod node;
pub mod registry;
pub mod router;
pub mod store_forward;
pub mod sweeper;

pub use circuit_breakers::CircuitBreakerRegistry;
pub use correlation::{CorrelationError, ReplyCorrelator};
pub use dead_letter::{DeadLetterManager, RecoveryExecutor};
pub use help::HelpRequestManager;
pub use node::MeshNode;
pub use registry::AgentRegistry;
pub use router::{MessageRouter, RouteError, RoutingDecision};
pub use store_forward::{DeliveryHandle, StoreForwardEngine};
