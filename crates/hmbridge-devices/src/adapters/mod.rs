//! Transport adapters.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `mqtt` | MQTT transport over rumqttc (default) |

#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "mqtt")]
pub use mqtt::{run_event_loop, MqttTransport};
