//! Transport seam.
//!
//! The device engine only needs `publish` and `subscribe`; connection
//! lifecycle belongs to the concrete adapter.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{BridgeError, BridgeResult};

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Per-message publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    pub qos: Qos,
    pub retain: bool,
}

impl PublishOptions {
    /// QoS 1, not retained.
    pub const fn command() -> Self {
        Self {
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    /// QoS 1, retained.
    pub const fn retained() -> Self {
        Self {
            qos: Qos::AtLeastOnce,
            retain: true,
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload.
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions)
        -> BridgeResult<()>;

    /// Subscribe to a set of topics.
    async fn subscribe(&self, topics: &[String]) -> BridgeResult<()>;
}

/// A message recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub options: PublishOptions,
}

/// In-memory transport that records everything.
///
/// Used by tests and by the binary's dry-run mode.
#[derive(Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Published messages for one topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Drain and return all published messages.
    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> BridgeResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport(format!("publish to {} rejected", topic)));
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            options,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> BridgeResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("subscribe rejected".into()));
        }
        self.subscriptions.lock().extend(topics.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_records() {
        let transport = MemoryTransport::new();
        tokio_test::block_on(transport.publish("a/b", "x", PublishOptions::retained())).unwrap();
        tokio_test::block_on(transport.subscribe(&["c/#".to_string()])).unwrap();

        assert_eq!(transport.published_to("a/b").len(), 1);
        assert!(transport.published()[0].options.retain);
        assert_eq!(transport.subscriptions(), vec!["c/#".to_string()]);

        transport.set_failing(true);
        assert!(tokio_test::block_on(transport.publish("a/b", "y", PublishOptions::command())).is_err());
        assert_eq!(transport.take_published().len(), 1);
        assert!(transport.published().is_empty());
    }
}
