//! Device manager.
//!
//! Ties the engine together: it owns the state store, dispatcher, poll
//! scheduler and availability tracker, reacts to inbound transport messages,
//! drives the polling loop and pushes state, availability and discovery
//! documents out through the [`Transport`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use hmbridge_core::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeResult, Device, EventBus, PublishOptions,
    Transport,
};

use crate::addressing::DeviceTopics;
use crate::availability::{AvailabilityChange, AvailabilityTracker, TimeoutId, TimeoutOutcome};
use crate::discovery::documents_for;
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::registry::SchemaRegistry;
use crate::scheduler::PollScheduler;
use crate::state::DeviceStateStore;
use crate::telegram::Telegram;

/// Send a telegram on both outbound addressing epochs.
async fn send_telegram(transport: &dyn Transport, topics: &DeviceTopics, payload: &str) {
    for topic in topics.outbound() {
        if let Err(e) = transport
            .publish(topic, payload, PublishOptions::command())
            .await
        {
            warn!("Failed to send '{}' to {}: {}", payload, topic, e);
        }
    }
}

/// A message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Runtime for all configured devices.
pub struct DeviceManager {
    store: Arc<DeviceStateStore>,
    dispatcher: CommandDispatcher,
    scheduler: PollScheduler,
    availability: AvailabilityTracker,
    transport: Arc<dyn Transport>,
    event_bus: EventBus,
    response_timeout: Duration,
    discovery_prefix: String,
    /// Armed response timeouts per device
    timeouts: DashMap<Device, Vec<(TimeoutId, JoinHandle<()>)>>,
    /// Held from a state change until its telegrams are published
    device_locks: DashMap<Device, Arc<Mutex<()>>>,
}

impl DeviceManager {
    pub fn new(config: &BridgeConfig, registry: Arc<SchemaRegistry>, transport: Arc<dyn Transport>) -> Self {
        let event_bus = EventBus::new();
        let store = Arc::new(DeviceStateStore::new(registry, config.topic_prefix.clone()));
        store.add_observer(Arc::new(event_bus.clone()));

        Self {
            dispatcher: CommandDispatcher::new(store.clone()),
            scheduler: PollScheduler::new(config.polling_interval, config.request_spacing, config.poll),
            availability: AvailabilityTracker::new(config.allowed_consecutive_timeouts),
            store,
            transport,
            event_bus,
            response_timeout: config.response_timeout,
            discovery_prefix: config.discovery_prefix.clone(),
            timeouts: DashMap::new(),
            device_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn availability(&self) -> &AvailabilityTracker {
        &self.availability
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn devices(&self) -> Vec<Device> {
        self.store.devices()
    }

    /// Add one device. Fails with `SchemaNotFound` for unknown families.
    pub fn add_device(&self, device: &Device) -> BridgeResult<()> {
        let topics = self.store.register(device)?;
        info!(
            "Added device {} (current id {})",
            device, topics.current_id
        );
        Ok(())
    }

    /// Add configured devices, skipping unknown families. Fails with
    /// `NoDevices` when none could be added.
    pub fn add_devices(&self, devices: &[Device]) -> BridgeResult<usize> {
        let mut added = 0;
        for device in devices {
            match self.add_device(device) {
                Ok(()) => added += 1,
                Err(e) => warn!("Skipping device {}: {}", device, e),
            }
        }
        if added == 0 {
            return Err(BridgeError::NoDevices);
        }
        Ok(added)
    }

    /// Every topic the bridge listens on: inbound telegram topics of both
    /// epochs plus one control topic per command.
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics = Vec::new();
        for device in self.store.devices() {
            if let Ok(addressing) = self.store.topics_for(&device) {
                topics.extend(addressing.inbound().iter().map(|t| t.to_string()));
            }
            if let Ok(control) = self.store.control_topics_for(&device) {
                topics.extend(control);
            }
        }
        topics
    }

    pub async fn subscribe_all(&self) -> BridgeResult<()> {
        let topics = self.subscription_topics();
        debug!("Subscribing to {} topics", topics.len());
        self.transport.subscribe(&topics).await
    }

    /// Route one inbound message: device telegrams update state, control
    /// messages go to the dispatcher, anything else is ignored.
    pub async fn on_inbound_message(&self, topic: &str, payload: &str) {
        if let Some(device) = self.store.resolve_inbound(topic) {
            self.handle_telegram(&device, payload).await;
        } else if let Some(device) = self.store.resolve_control(topic) {
            self.handle_command(&device, topic, payload).await;
        } else {
            debug!("Ignoring message on {}", topic);
        }
    }

    fn device_lock(&self, device: &Device) -> Arc<Mutex<()>> {
        self.device_locks.entry(device.clone()).or_default().clone()
    }

    /// Handle inbound messages one at a time, in arrival order.
    ///
    /// The queue is unbounded so a transport event loop can hand messages
    /// over without waiting for handlers that publish through it.
    pub fn spawn_inbound_worker(self: &Arc<Self>) -> (mpsc::UnboundedSender<InboundMessage>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                manager.on_inbound_message(&message.topic, &message.payload).await;
            }
            debug!("Inbound queue closed");
        });
        (tx, handle)
    }

    pub async fn handle_telegram(&self, device: &Device, payload: &str) {
        let lock = self.device_lock(device);
        let _guard = lock.lock().await;

        let telegram = Telegram::parse(payload);
        debug!("Telegram from {}: {}", device, telegram);

        let applied = match self.store.apply_telegram(device, &telegram) {
            Ok(Some(applied)) => applied,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to apply telegram from {}: {}", device, e);
                return;
            }
        };

        if applied.state.is_none() {
            return;
        }
        self.scheduler.mark_answered(device, &applied.channel);

        if applied.controls_availability {
            self.retire_timeouts(device);
            if let Some(change) = self.availability.record_response(device) {
                self.publish_availability(device, change).await;
            }
        }
    }

    pub async fn handle_command(&self, device: &Device, topic: &str, payload: &str) -> DispatchOutcome {
        let lock = self.device_lock(device);
        let _guard = lock.lock().await;

        let outcome = self.dispatcher.dispatch(device, topic, payload);
        if let DispatchOutcome::Handled { command, messages, .. } = &outcome {
            if let Ok(topics) = self.store.topics_for(device) {
                for message in messages {
                    send_telegram(self.transport.as_ref(), &topics, message).await;
                }
            }
            self.event_bus.publish(BridgeEvent::CommandHandled {
                device: device.clone(),
                command: command.clone(),
                published: messages.len(),
                timestamp: chrono::Utc::now().timestamp(),
            });
        }
        outcome
    }

    /// Scheduler tick period: GCD of all polled channel intervals.
    pub fn tick_period(&self) -> Duration {
        let schemas: Vec<_> = self
            .store
            .devices()
            .iter()
            .filter_map(|device| self.store.schema_for(device).ok())
            .collect();
        self.scheduler.tick_period(schemas.iter().map(|schema| &**schema))
    }

    /// Send every due refresh request.
    pub async fn tick(self: &Arc<Self>, now: Instant) {
        for device in self.store.devices() {
            let (Ok(schema), Ok(topics)) = (self.store.schema_for(&device), self.store.topics_for(&device)) else {
                continue;
            };
            let Some(poll) = self.scheduler.plan(&device, &schema, now) else {
                continue;
            };

            if poll.arm_timeout {
                self.arm_timeout(&device);
            }

            for request in poll.requests {
                debug!("Requesting {} from {}", request.channel, device);
                if request.delay.is_zero() {
                    send_telegram(self.transport.as_ref(), &topics, &request.payload).await;
                } else {
                    let transport = self.transport.clone();
                    let topics = topics.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(request.delay).await;
                        send_telegram(transport.as_ref(), &topics, &request.payload).await;
                    });
                }
            }
        }
    }

    fn arm_timeout(self: &Arc<Self>, device: &Device) {
        let id = self.availability.arm(device);
        let manager = self.clone();
        let owner = device.clone();
        let delay = self.response_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.on_response_timeout(&owner, id).await;
        });
        self.timeouts.entry(device.clone()).or_default().push((id, handle));
    }

    fn retire_timeouts(&self, device: &Device) {
        if let Some((_, handles)) = self.timeouts.remove(device) {
            for (_, handle) in handles {
                handle.abort();
            }
        }
    }

    /// A response timeout fired.
    pub async fn on_response_timeout(&self, device: &Device, id: TimeoutId) {
        if let Some(mut handles) = self.timeouts.get_mut(device) {
            handles.retain(|(armed, _)| *armed != id);
        }
        let outcome = self.availability.expire(device, id);
        if outcome == TimeoutOutcome::Stale {
            debug!("Ignoring retired timeout for {}", device);
            return;
        }
        self.scheduler.mark_timed_out(device);

        debug!(
            "Response timeout for {} ({}/{} misses)",
            device,
            self.availability.misses(device),
            self.availability.threshold()
        );
        if let Some(change) = outcome.change() {
            self.publish_availability(device, change).await;
        }
    }

    async fn publish_availability(&self, device: &Device, change: AvailabilityChange) {
        info!("Device {} is now {}", device, change.payload());
        let Ok(topics) = self.store.topics_for(device) else {
            return;
        };
        if let Err(e) = self
            .transport
            .publish(&topics.availability, change.payload(), PublishOptions::retained())
            .await
        {
            warn!("Failed to publish availability of {}: {}", device, e);
        }
        self.event_bus.publish(BridgeEvent::AvailabilityChanged {
            device: device.clone(),
            online: change.is_online(),
            timestamp: chrono::Utc::now().timestamp(),
        });

        if change.is_online() {
            if let Err(e) = self.publish_discovery(device).await {
                warn!("Failed to publish discovery for {}: {}", device, e);
            }
        }
    }

    /// Publish retained discovery documents for one device.
    pub async fn publish_discovery(&self, device: &Device) -> BridgeResult<usize> {
        let schema = self.store.schema_for(device)?;
        let topics = self.store.topics_for(device)?;
        let state = self.store.state_for(device)?;
        let documents = documents_for(
            device,
            &schema,
            &topics,
            &state,
            self.store.topic_prefix(),
            &self.discovery_prefix,
        );

        for document in &documents {
            let payload = document.payload().map_err(|e| BridgeError::Other(e.into()))?;
            self.transport
                .publish(&document.topic, &payload, PublishOptions::retained())
                .await?;
        }
        debug!("Published {} discovery documents for {}", documents.len(), device);
        Ok(documents.len())
    }

    pub async fn publish_discovery_all(&self) {
        for device in self.store.devices() {
            if let Err(e) = self.publish_discovery(&device).await {
                warn!("Failed to publish discovery for {}: {}", device, e);
            }
        }
    }

    /// Forward channel state changes to `<prefix>/<deviceId>/<channel>` as
    /// retained JSON.
    pub fn spawn_state_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.event_bus.subscribe_filtered(|event| event.is_state_event());
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let BridgeEvent::StateChanged { device, channel, state, .. } = event else {
                    continue;
                };
                let Ok(topics) = manager.store.topics_for(&device) else {
                    continue;
                };
                let payload = match serde_json::to_string(&state) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to serialize state of {}: {}", device, e);
                        continue;
                    }
                };
                if let Err(e) = manager
                    .transport
                    .publish(&topics.channel_topic(&channel), &payload, PublishOptions::retained())
                    .await
                {
                    warn!("Failed to publish state of {}: {}", device, e);
                }
            }
        })
    }

    /// Poll forever at the tick period.
    pub async fn run_scheduler(self: Arc<Self>) {
        let period = self.tick_period();
        info!("Polling scheduler started, tick period {:?}", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let now = interval.tick().await;
            self.tick(now).await;
        }
    }

    /// Start the runtime: state forwarding, subscriptions, discovery and the
    /// polling loop. Returns the spawned tasks.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let forwarder = self.spawn_state_forwarder();
        if let Err(e) = self.subscribe_all().await {
            warn!("Initial subscription failed: {}", e);
        }
        self.publish_discovery_all().await;
        let scheduler = tokio::spawn(self.clone().run_scheduler());
        vec![forwarder, scheduler]
    }
}
