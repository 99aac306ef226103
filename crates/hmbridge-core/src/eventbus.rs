//! Event bus for the bridge.
//!
//! State changes and availability transitions are fanned out over a tokio
//! broadcast channel. Publishing never blocks, so the state store can notify
//! observers synchronously while holding no locks.

use tokio::sync::broadcast;

use crate::device::Device;
use crate::event::BridgeEvent;
use crate::StateMap;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Observer notified after every successful channel update.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, device: &Device, channel: &str, state: &StateMap);
}

/// Event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: BridgeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&BridgeEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StateObserver for EventBus {
    fn state_changed(&self, device: &Device, channel: &str, state: &StateMap) {
        self.publish(BridgeEvent::StateChanged {
            device: device.clone(),
            channel: channel.to_string(),
            state: state.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<BridgeEvent>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event bus receiver lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&BridgeEvent) -> bool + Send,
{
    rx: broadcast::Receiver<BridgeEvent>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&BridgeEvent) -> bool + Send,
{
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if (self.filter)(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some(event);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_observer_publishes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let mut state = StateMap::new();
        state.insert("batteryPercentage".into(), json!(80));
        bus.state_changed(&Device::new("HMA-1", "abc"), "data", &state);

        match rx.recv().await {
            Some(BridgeEvent::StateChanged { device, channel, state, .. }) => {
                assert_eq!(device.device_id, "abc");
                assert_eq!(channel, "data");
                assert_eq!(state["batteryPercentage"], json!(80));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_filtered(BridgeEvent::is_availability_event);
        let device = Device::new("HMB-1", "xyz");

        bus.state_changed(&device, "data", &StateMap::new());
        bus.publish(BridgeEvent::AvailabilityChanged {
            device: device.clone(),
            online: false,
            timestamp: 0,
        });

        let event = rx.recv().await.unwrap();
        assert!(event.is_availability_event());
        assert_eq!(event.device(), &device);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.publish(BridgeEvent::AvailabilityChanged {
            device: Device::new("HMA-1", "a"),
            online: true,
            timestamp: 0,
        }));
    }
}
