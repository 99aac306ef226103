//! Events published on the bridge event bus.

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::StateMap;

/// Bridge event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A channel's state was updated
    StateChanged {
        device: Device,
        channel: String,
        state: StateMap,
        timestamp: i64,
    },

    /// Device availability flipped
    AvailabilityChanged {
        device: Device,
        online: bool,
        timestamp: i64,
    },

    /// An operator command was handled
    CommandHandled {
        device: Device,
        command: String,
        published: usize,
        timestamp: i64,
    },
}

impl BridgeEvent {
    /// Get the device this event is about.
    pub fn device(&self) -> &Device {
        match self {
            Self::StateChanged { device, .. }
            | Self::AvailabilityChanged { device, .. }
            | Self::CommandHandled { device, .. } => device,
        }
    }

    /// Get the event timestamp (unix seconds).
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::StateChanged { timestamp, .. }
            | Self::AvailabilityChanged { timestamp, .. }
            | Self::CommandHandled { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_state_event(&self) -> bool {
        matches!(self, Self::StateChanged { .. })
    }

    pub fn is_availability_event(&self) -> bool {
        matches!(self, Self::AvailabilityChanged { .. })
    }
}
