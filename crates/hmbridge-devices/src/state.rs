//! Per-device runtime state.
//!
//! The store owns, for every configured device, the last-known state of each
//! message channel together with the device's schema and cached addressing.
//! Slots are created lazily on first access and live for the process lifetime.
//!
//! All channel states of a device sit behind one mutex, so an update is
//! atomic with respect to every other update of that device and readers
//! always see a consistent snapshot.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use hmbridge_core::{BridgeError, BridgeResult, Device, StateMap, StateObserver};

use crate::addressing::DeviceTopics;
use crate::registry::SchemaRegistry;
use crate::schema::DeviceSchema;
use crate::telegram::Telegram;

struct DeviceSlot {
    schema: Arc<DeviceSchema>,
    topics: Arc<DeviceTopics>,
    channels: Mutex<HashMap<String, StateMap>>,
}

impl DeviceSlot {
    /// Stored state of a channel, or its schema default.
    fn channel_state(channels: &HashMap<String, StateMap>, schema: &DeviceSchema, key: &str) -> StateMap {
        channels
            .get(key)
            .cloned()
            .or_else(|| schema.channel(key).map(|c| c.default_state.clone()))
            .unwrap_or_default()
    }

    fn effective_state(&self) -> StateMap {
        let channels = self.channels.lock();
        let mut merged = StateMap::new();
        for channel in &self.schema.channels {
            let state = Self::channel_state(&channels, &self.schema, &channel.key);
            merged.extend(state);
        }
        merged
    }
}

/// Result of applying an inbound telegram.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTelegram {
    pub channel: String,
    pub controls_availability: bool,
    /// New channel state, `None` if the telegram carried no known field
    pub state: Option<StateMap>,
}

/// Device state store.
pub struct DeviceStateStore {
    registry: Arc<SchemaRegistry>,
    topic_prefix: String,
    slots: DashMap<Device, Arc<DeviceSlot>>,
    /// Inbound telegram topic → device
    inbound: DashMap<String, Device>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
}

impl DeviceStateStore {
    pub fn new(registry: Arc<SchemaRegistry>, topic_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            topic_prefix: topic_prefix.into(),
            slots: DashMap::new(),
            inbound: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer notified after every channel update.
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        self.observers.write().push(observer);
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    fn slot(&self, device: &Device) -> BridgeResult<Arc<DeviceSlot>> {
        if let Some(slot) = self.slots.get(device) {
            return Ok(slot.clone());
        }

        let schema = self.registry.require(&device.family_id)?;
        let topics = Arc::new(DeviceTopics::compute(device, &schema, &self.topic_prefix));
        let slot = self
            .slots
            .entry(device.clone())
            .or_insert_with(|| {
                debug!("Creating state slot for {}", device);
                Arc::new(DeviceSlot {
                    schema,
                    topics: topics.clone(),
                    channels: Mutex::new(HashMap::new()),
                })
            })
            .clone();

        for topic in slot.topics.inbound() {
            self.inbound.insert(topic.to_string(), device.clone());
        }
        Ok(slot)
    }

    /// Make sure a device has a slot. Fails with `SchemaNotFound` for unknown families.
    pub fn register(&self, device: &Device) -> BridgeResult<Arc<DeviceTopics>> {
        self.slot(device).map(|slot| slot.topics.clone())
    }

    pub fn is_known(&self, device: &Device) -> bool {
        self.slots.contains_key(device)
    }

    /// Known devices, sorted.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.slots.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }

    pub fn topics_for(&self, device: &Device) -> BridgeResult<Arc<DeviceTopics>> {
        self.register(device)
    }

    pub fn schema_for(&self, device: &Device) -> BridgeResult<Arc<DeviceSchema>> {
        self.slot(device).map(|slot| slot.schema.clone())
    }

    /// Effective device state: union of all channel states in channel order.
    pub fn state_for(&self, device: &Device) -> BridgeResult<StateMap> {
        Ok(self.slot(device)?.effective_state())
    }

    /// State of one channel, defaulted from the schema if never written.
    pub fn state_for_channel(&self, device: &Device, channel: &str) -> BridgeResult<StateMap> {
        let slot = self.slot(device)?;
        if slot.schema.channel(channel).is_none() {
            return Err(BridgeError::validation(format!(
                "Device {} has no channel '{}'",
                device, channel
            )));
        }
        let channels = slot.channels.lock();
        Ok(DeviceSlot::channel_state(&channels, &slot.schema, channel))
    }

    /// Read-modify-write a channel.
    ///
    /// `updater` receives the current channel state and returns a patch that
    /// is shallow-merged into it. Observers are notified with the new state
    /// once the lock is released.
    pub fn update_channel<F>(&self, device: &Device, channel: &str, updater: F) -> BridgeResult<StateMap>
    where
        F: FnOnce(&StateMap) -> StateMap,
    {
        let slot = self.slot(device)?;
        if slot.schema.channel(channel).is_none() {
            return Err(BridgeError::validation(format!(
                "Device {} has no channel '{}'",
                device, channel
            )));
        }

        let new_state = {
            let mut channels = slot.channels.lock();
            let mut state = DeviceSlot::channel_state(&channels, &slot.schema, channel);
            let patch = updater(&state);
            state.extend(patch);
            channels.insert(channel.to_string(), state.clone());
            state
        };

        for observer in self.observers.read().iter() {
            observer.state_changed(device, channel, &new_state);
        }
        Ok(new_state)
    }

    /// Operator control topics, one per command across all channels.
    pub fn control_topics_for(&self, device: &Device) -> BridgeResult<Vec<String>> {
        let slot = self.slot(device)?;
        Ok(slot
            .schema
            .commands()
            .map(|(_, command)| slot.topics.command_topic(&command.name))
            .collect())
    }

    /// Device publishing on an inbound telegram topic.
    pub fn resolve_inbound(&self, topic: &str) -> Option<Device> {
        self.inbound.get(topic).map(|d| d.value().clone())
    }

    /// Device owning an operator control topic.
    pub fn resolve_control(&self, topic: &str) -> Option<Device> {
        self.slots
            .iter()
            .find(|entry| entry.value().topics.command_path(topic).is_some())
            .map(|entry| entry.key().clone())
    }

    /// Route a telegram to its channel and merge the decoded fields.
    pub fn apply_telegram(&self, device: &Device, telegram: &Telegram) -> BridgeResult<Option<AppliedTelegram>> {
        let schema = self.schema_for(device)?;
        let Some(channel) = schema.channel_for_telegram(telegram) else {
            debug!("No channel of {} accepts telegram '{}'", device, telegram);
            return Ok(None);
        };

        let patch = channel.decode(telegram);
        let state = if patch.is_empty() {
            None
        } else {
            Some(self.update_channel(device, &channel.key, |_| patch)?)
        };
        Ok(Some(AppliedTelegram {
            channel: channel.key.clone(),
            controls_availability: channel.controls_availability,
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChannelDefinition, FieldTransform};
    use proptest::prelude::*;
    use serde_json::json;

    struct Recorder(Mutex<Vec<(String, StateMap)>>);

    impl StateObserver for Recorder {
        fn state_changed(&self, _device: &Device, channel: &str, state: &StateMap) {
            self.0.lock().push((channel.to_string(), state.clone()));
        }
    }

    fn store() -> DeviceStateStore {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                DeviceSchema::builder("TST", "Test")
                    .channel(
                        ChannelDefinition::new("data", "cd=1")
                            .with_availability_control()
                            .with_field("pe", "soc", FieldTransform::Integer)
                            .with_field("o1", "output1", FieldTransform::Boolean)
                            .with_default("output1", json!(false)),
                    )
                    .channel(
                        ChannelDefinition::new("cells", "cd=13")
                            .with_marker("ce")
                            .with_field("c1", "cells.c1", FieldTransform::Integer),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        DeviceStateStore::new(Arc::new(registry), "hm2mqtt")
    }

    #[test]
    fn test_lazy_default_state() {
        let store = store();
        let device = Device::new("TST-1", "abc");
        assert!(!store.is_known(&device));
        assert_eq!(store.state_for_channel(&device, "data").unwrap()["output1"], json!(false));
        assert!(store.is_known(&device));
        assert!(store.state_for_channel(&device, "nope").is_err());
    }

    #[test]
    fn test_unknown_family() {
        let store = store();
        let err = store.register(&Device::new("XYZ-1", "abc")).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaNotFound(_)));
        assert!(store.devices().is_empty());
    }

    #[test]
    fn test_update_merges_and_notifies() {
        let store = store();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        store.add_observer(recorder.clone());
        let device = Device::new("TST-1", "abc");

        store.update_channel(&device, "data", |_| {
            let mut patch = StateMap::new();
            patch.insert("soc".into(), json!(40));
            patch
        })
        .unwrap();
        let state = store
            .update_channel(&device, "data", |current| {
                assert_eq!(current["soc"], json!(40));
                let mut patch = StateMap::new();
                patch.insert("output1".into(), json!(true));
                patch
            })
            .unwrap();

        assert_eq!(state["soc"], json!(40));
        assert_eq!(state["output1"], json!(true));
        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, "data");
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 250;

        let store = store();
        let device = Device::new("TST-1", "abc");

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..INCREMENTS {
                        store
                            .update_channel(&device, "data", |current| {
                                let soc = current.get("soc").and_then(|v| v.as_i64()).unwrap_or(0);
                                let mut patch = StateMap::new();
                                patch.insert("soc".into(), json!(soc + 1));
                                patch
                            })
                            .unwrap();
                    }
                });
            }
        });

        let state = store.state_for_channel(&device, "data").unwrap();
        assert_eq!(state["soc"], json!((THREADS * INCREMENTS) as i64));
    }

    #[test]
    fn test_apply_telegram_routes_by_marker() {
        let store = store();
        let device = Device::new("TST-1", "abc");

        let applied = store.apply_telegram(&device, &Telegram::parse("ce=1,c1=3300")).unwrap().unwrap();
        assert_eq!(applied.channel, "cells");
        assert!(!applied.controls_availability);

        let applied = store.apply_telegram(&device, &Telegram::parse("pe=77")).unwrap().unwrap();
        assert_eq!(applied.channel, "data");
        assert!(applied.controls_availability);

        let state = store.state_for(&device).unwrap();
        assert_eq!(state["soc"], json!(77));
        assert_eq!(state["cells"], json!({"c1": 3300}));

        let applied = store.apply_telegram(&device, &Telegram::parse("zz=1")).unwrap().unwrap();
        assert!(applied.state.is_none());
    }

    #[test]
    fn test_topic_resolution() {
        let store = store();
        let device = Device::new("TST-1", "abc");
        store.register(&device).unwrap();

        assert_eq!(store.resolve_inbound("hame_energy/TST-1/device/abc/ctrl"), Some(device.clone()));
        assert_eq!(store.resolve_inbound("marstek_energy/TST-1/device/abc/ctrl"), Some(device.clone()));
        assert_eq!(store.resolve_inbound("hame_energy/TST-1/App/abc/ctrl"), None);
        assert_eq!(store.resolve_control("hm2mqtt/abc/control/restart"), Some(device));
        assert_eq!(store.resolve_control("hm2mqtt/zzz/control/restart"), None);
    }

    proptest! {
        #[test]
        fn prop_effective_state_is_union_of_channels(
            updates in proptest::collection::vec((any::<bool>(), 0usize..2, any::<i64>()), 0..50)
        ) {
            let store = store();
            let device = Device::new("TST-1", "abc");
            const DATA_KEYS: [&str; 2] = ["soc", "output1"];

            for (to_data, key, value) in updates {
                let (channel, key) = if to_data { ("data", DATA_KEYS[key]) } else { ("cells", "cells") };
                store
                    .update_channel(&device, channel, |_| {
                        let mut patch = StateMap::new();
                        patch.insert(key.to_string(), json!(value));
                        patch
                    })
                    .unwrap();
            }

            let data = store.state_for_channel(&device, "data").unwrap();
            let cells = store.state_for_channel(&device, "cells").unwrap();
            let effective = store.state_for(&device).unwrap();

            let mut union = data.clone();
            union.extend(cells.clone());
            prop_assert_eq!(&effective, &union);
            for (key, value) in &effective {
                let owner = if key == "cells" { &cells } else { &data };
                prop_assert_eq!(owner.get(key), Some(value));
            }
        }
    }
}
