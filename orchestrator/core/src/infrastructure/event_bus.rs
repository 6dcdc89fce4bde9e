// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming using tokio broadcast channels. The reconcile
// driver subscribes to it instead of polling; the CLI can stream it.
// Events are not persisted (lost on restart); reconcilers are level-triggered
// and recover from the stored state.

use crate::domain::events::{ActivationEvent, AttachmentEvent, BlobEvent};
use crate::domain::pool::PoolName;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Attachment(AttachmentEvent),
    Blob(BlobEvent),
    Activation(ActivationEvent),
}

impl DomainEvent {
    /// Pool the event concerns
    pub fn pool(&self) -> &PoolName {
        match self {
            Self::Attachment(e) => e.pool(),
            Self::Blob(e) => e.pool(),
            Self::Activation(e) => e.pool(),
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_attachment_event(&self, event: AttachmentEvent) {
        self.publish(DomainEvent::Attachment(event));
    }

    pub fn publish_blob_event(&self, event: BlobEvent) {
        self.publish(DomainEvent::Blob(event));
    }

    pub fn publish_activation_event(&self, event: ActivationEvent) {
        self.publish(DomainEvent::Activation(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe to the events of a single pool
    pub fn subscribe_pool(&self, pool: PoolName) -> PoolEventReceiver {
        let receiver = self.sender.subscribe();
        PoolEventReceiver { receiver, pool }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
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

/// Receiver filtered to one pool
pub struct PoolEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    pool: PoolName,
}

impl PoolEventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.pool() == &self.pool {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pool::NodeId;
    use chrono::Utc;

    fn activated(pool: &str) -> AttachmentEvent {
        AttachmentEvent::PoolActivated {
            pool: PoolName::from(pool),
            node: NodeId::from("n1"),
            activated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_attachment_event(activated("p1"));

        match receiver.recv().await.unwrap() {
            DomainEvent::Attachment(AttachmentEvent::PoolActivated { pool, node, .. }) => {
                assert_eq!(pool, PoolName::from("p1"));
                assert_eq!(node, NodeId::from("n1"));
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_pool(PoolName::from("p2"));

        event_bus.publish_attachment_event(activated("p1"));
        event_bus.publish_activation_event(ActivationEvent::WorkItemsChanged {
            pool: PoolName::from("p2"),
            assigned_node: None,
            changed_at: Utc::now(),
        });

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.pool(), &PoolName::from("p2"));
        assert!(matches!(received, DomainEvent::Activation(_)));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_attachment_event(activated("p1"));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
