//! Device engine for the hmbridge battery/inverter bridge.
//!
//! This crate turns the hardware's `key=value` telegram protocol into
//! structured per-device state and operator commands back into telegrams.
//!
//! ```text
//! transport ──▶ DeviceManager ──▶ DeviceStateStore ──▶ EventBus ──▶ state topics
//!                    │                   ▲
//!                    ├─▶ CommandDispatcher (schema commands)
//!                    ├─▶ PollScheduler ──▶ refresh telegrams
//!                    └─▶ AvailabilityTracker ──▶ availability topic
//! ```
//!
//! Device families are declared as [`DeviceSchema`] values and looked up by
//! family prefix in the [`SchemaRegistry`].

pub mod adapters;
pub mod addressing;
pub mod availability;
pub mod commands;
pub mod crypto;
pub mod discovery;
pub mod dispatcher;
pub mod families;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod telegram;

pub use addressing::DeviceTopics;
pub use availability::{AvailabilityChange, AvailabilityTracker, TimeoutId, TimeoutOutcome};
pub use crypto::{obfuscate_id, reveal_id};
pub use discovery::{documents_for, DiscoveryConfig, DiscoveryDocument};
pub use dispatcher::{CommandContext, CommandDispatcher, DispatchOutcome};
pub use manager::{DeviceManager, InboundMessage};
pub use registry::SchemaRegistry;
pub use scheduler::{ChannelPhase, DevicePoll, PollScheduler, RefreshRequest};
pub use schema::{
    Advertisement, ChannelDefinition, Component, DeviceSchema, FieldTransform, PollInterval,
    StatePath,
};
pub use state::{AppliedTelegram, DeviceStateStore};
pub use telegram::Telegram;

#[cfg(feature = "mqtt")]
pub use adapters::{run_event_loop, MqttTransport};
