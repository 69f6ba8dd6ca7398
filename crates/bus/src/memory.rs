//! In-process publish/subscribe.
//!
//! Implements the same traits as the ZeroMQ sockets so stages can be wired
//! together without a broker. Each subscriber gets its own unbounded queue,
//! which keeps publish order and never drops a message.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};

struct Route {
    prefixes: Arc<Mutex<Vec<String>>>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Route {
    fn matches(&self, topic: &str) -> bool {
        self.prefixes
            .lock()
            .map(|p| p.iter().any(|prefix| topic.starts_with(prefix.as_str())))
            .unwrap_or(false)
    }
}

/// Shared routing table for in-process publishers and subscribers.
#[derive(Clone, Default)]
pub struct MemoryBus {
    routes: Arc<Mutex<Vec<Route>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher { bus: self.clone() }
    }

    /// Create a subscriber. It receives nothing until it subscribes to a prefix.
    pub fn subscriber(&self) -> MemorySubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        let prefixes = Arc::new(Mutex::new(Vec::new()));
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                prefixes: prefixes.clone(),
                tx,
            });
        }
        MemorySubscriber {
            prefixes,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn deliver(&self, message: Message) -> Result<usize, BusError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| BusError::Transport("memory bus routing table poisoned".into()))?;
        // Dropped subscribers are pruned on the next publish.
        routes.retain(|route| !route.tx.is_closed());
        let mut delivered = 0;
        for route in routes.iter().filter(|r| r.matches(&message.topic)) {
            if route.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

/// Publisher half of a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryPublisher {
    bus: MemoryBus,
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let topic = message.topic.clone();
        let delivered = self.bus.deliver(message)?;
        debug!(topic = %topic, delivered, "published in-process");
        Ok(())
    }
}

/// Subscriber half of a [`MemoryBus`].
pub struct MemorySubscriber {
    prefixes: Arc<Mutex<Vec<String>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

#[async_trait]
impl EventSubscriber for MemorySubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        let mut prefixes = self
            .prefixes
            .lock()
            .map_err(|_| BusError::Transport("memory bus subscription poisoned".into()))?;
        prefixes.push(topic_prefix.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BusError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher();
        let subscriber = bus.subscriber();
        subscriber.subscribe("features-data").await.unwrap();

        for cycle in 0..5u64 {
            publisher
                .publish(Message::new("features-data", &cycle).unwrap())
                .await
                .unwrap();
        }

        for expected in 0..5u64 {
            let msg = subscriber.recv().await.unwrap();
            assert_eq!(msg.decode::<u64>().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn filters_by_prefix() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher();
        let subscriber = bus.subscriber();
        subscriber.subscribe("anomaly-events").await.unwrap();

        publisher.publish(Message::new("rul-predictions", &1u8).unwrap()).await.unwrap();
        publisher.publish(Message::new("anomaly-events", &2u8).unwrap()).await.unwrap();

        let msg = subscriber.recv().await.unwrap();
        assert_eq!(msg.topic, "anomaly-events");
        let nothing = tokio::time::timeout(Duration::from_millis(50), subscriber.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher();
        let a = bus.subscriber();
        let b = bus.subscriber();
        a.subscribe("features-data").await.unwrap();
        b.subscribe("features-data").await.unwrap();

        publisher.publish(Message::new("features-data", &"x").unwrap()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().decode::<String>().unwrap(), "x");
        assert_eq!(b.recv().await.unwrap().decode::<String>().unwrap(), "x");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher();
        drop(bus.subscriber());
        publisher.publish(Message::new("features-data", &0u8).unwrap()).await.unwrap();
    }
}
