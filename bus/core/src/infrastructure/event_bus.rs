// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Bus Domain Events
//
// In-process broadcast of registry, help, delivery and circuit events using a
// tokio broadcast channel. Cross-domain failures surface to applications here
// (and through dead letter queries) since they never fail the original send.
//
// In-memory only: events are lost on restart and slow receivers lag.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{CircuitEvent, DeliveryEvent, HelpEvent, RegistryEvent};
use crate::domain::help::HelpRequestId;

/// Unified event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Registry(RegistryEvent),
    Help(HelpEvent),
    Delivery(DeliveryEvent),
    Circuit(CircuitEvent),
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BusEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_registry_event(&self, event: RegistryEvent) {
        self.publish(BusEvent::Registry(event));
    }

    pub fn publish_help_event(&self, event: HelpEvent) {
        self.publish(BusEvent::Help(event));
    }

    pub fn publish_delivery_event(&self, event: DeliveryEvent) {
        self.publish(BusEvent::Delivery(event));
    }

    pub fn publish_circuit_event(&self, event: CircuitEvent) {
        self.publish(BusEvent::Circuit(event));
    }

    fn publish(&self, event: BusEvent) {
        debug!("Publishing event: {:?}", event);
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the lifecycle of a single help request
    pub fn subscribe_help(&self, request_id: HelpRequestId) -> HelpEventReceiver {
        HelpEventReceiver {
            receiver: self.sender.subscribe(),
            request_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BusEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<BusEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<BusEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one help request
pub struct HelpEventReceiver {
    receiver: broadcast::Receiver<BusEvent>,
    request_id: HelpRequestId,
}

impl HelpEventReceiver {
    pub async fn recv(&mut self) -> Result<HelpEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let BusEvent::Help(help_event) = event {
                if help_event.request_id() == self.request_id {
                    return Ok(help_event);
                }
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{AgentId, DomainId};
    use crate::domain::help::HelpStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_registry_event(RegistryEvent::AgentDiscovered {
            agent_id: AgentId::new("sql-expert"),
            domain: DomainId::new("local"),
            capabilities: vec!["sql".to_string()],
            discovered_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            BusEvent::Registry(RegistryEvent::AgentDiscovered { agent_id, .. }) => {
                assert_eq!(agent_id, AgentId::new("sql-expert"));
            }
            other => panic!("Wrong event type received: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_help_event_filtering() {
        let event_bus = EventBus::new(10);
        let request_id = HelpRequestId::new();
        let mut receiver = event_bus.subscribe_help(request_id);

        event_bus.publish_help_event(HelpEvent::HelpFinished {
            request_id: HelpRequestId::new(),
            status: HelpStatus::Timeout,
            finished_at: Utc::now(),
        });
        event_bus.publish_help_event(HelpEvent::HelpFinished {
            request_id,
            status: HelpStatus::Completed,
            finished_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            HelpEvent::HelpFinished { request_id: id, status, .. } => {
                assert_eq!(id, request_id);
                assert_eq!(status, HelpStatus::Completed);
            }
            other => panic!("Wrong event received: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_registry_event(RegistryEvent::AgentsPruned {
            count: 2,
            pruned_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
