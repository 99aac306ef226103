//! Core types for the hmbridge battery/inverter bridge.
//!
//! This crate defines the pieces shared by the device engine and the binary:
//! device identity, the error taxonomy, configuration, the state-change event
//! bus and the transport seam.

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod transport;

pub use config::{BridgeConfig, MqttConfig, PollOptions};
pub use device::Device;
pub use error::{BridgeError, BridgeResult};
pub use event::BridgeEvent;
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, StateObserver};
pub use transport::{MemoryTransport, PublishOptions, PublishedMessage, Qos, Transport};

/// State object of one message channel (or the merged state of a device).
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, BridgeConfig, MqttConfig, PollOptions};
    pub use crate::device::Device;
    pub use crate::error::{BridgeError, BridgeResult};
    pub use crate::event::BridgeEvent;
    pub use crate::eventbus::{EventBus, StateObserver};
    pub use crate::transport::{PublishOptions, Qos, Transport};
    pub use crate::StateMap;
}
