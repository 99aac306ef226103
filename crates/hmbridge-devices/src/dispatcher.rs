//! Operator command dispatch.
//!
//! A control message on `<prefix>/<deviceId>/control/<command>` is matched
//! against the device schema's commands (channels in registration order,
//! then commands in registration order). The handler gets a
//! [`CommandContext`] to read state, patch its channel and queue outbound
//! telegrams. Nothing a handler does, including panicking, escapes
//! [`CommandDispatcher::dispatch`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use hmbridge_core::{BridgeError, BridgeResult, Device, StateMap};

use crate::state::DeviceStateStore;

/// What a handler sees while it runs.
pub struct CommandContext<'a> {
    device: &'a Device,
    channel: &'a str,
    payload: &'a str,
    state: StateMap,
    store: &'a DeviceStateStore,
    outgoing: Vec<String>,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        device: &'a Device,
        channel: &'a str,
        payload: &'a str,
        state: StateMap,
        store: &'a DeviceStateStore,
    ) -> Self {
        Self {
            device,
            channel,
            payload,
            state,
            store,
            outgoing: Vec::new(),
        }
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn channel(&self) -> &str {
        self.channel
    }

    /// Raw operator payload.
    pub fn payload(&self) -> &str {
        self.payload
    }

    /// Effective device state as of the start of the command (or the last
    /// [`update`](Self::update)).
    pub fn state(&self) -> &StateMap {
        &self.state
    }

    /// Queue a telegram for the device.
    pub fn publish(&mut self, telegram: impl fmt::Display) {
        self.outgoing.push(telegram.to_string());
    }

    /// Patch the command's channel. The closure runs under the device lock
    /// and receives the channel's current state. Returns the new channel state.
    pub fn update<F>(&mut self, patch: F) -> BridgeResult<StateMap>
    where
        F: FnOnce(&StateMap) -> StateMap,
    {
        let updated = self.store.update_channel(self.device, self.channel, patch)?;
        self.state = self.store.state_for(self.device)?;
        Ok(updated)
    }

    pub fn into_outgoing(self) -> Vec<String> {
        self.outgoing
    }
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; `messages` are the telegrams to transmit
    Handled {
        command: String,
        channel: String,
        messages: Vec<String>,
    },
    /// Topic is not under the device's control prefix
    NotAControlTopic,
    UnknownCommand { command: String },
    /// Payload failed validation; nothing was published
    Rejected { command: String, reason: String },
    /// Handler panicked
    Failed { command: String },
}

impl DispatchOutcome {
    pub fn messages(&self) -> &[String] {
        match self {
            Self::Handled { messages, .. } => messages,
            _ => &[],
        }
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }
}

/// Command dispatcher.
pub struct CommandDispatcher {
    store: Arc<DeviceStateStore>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<DeviceStateStore>) -> Self {
        Self { store }
    }

    /// Dispatch an operator control message for `device`.
    pub fn dispatch(&self, device: &Device, topic: &str, payload: &str) -> DispatchOutcome {
        let (topics, schema, state) = match (
            self.store.topics_for(device),
            self.store.schema_for(device),
            self.store.state_for(device),
        ) {
            (Ok(topics), Ok(schema), Ok(state)) => (topics, schema, state),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!("Cannot dispatch for {}: {}", device, e);
                return DispatchOutcome::NotAControlTopic;
            }
        };

        let Some(path) = topics.command_path(topic) else {
            return DispatchOutcome::NotAControlTopic;
        };

        let Some((channel, command)) = schema.commands().find(|(_, c)| c.name == path) else {
            warn!("{}", BridgeError::UnknownCommand {
                device: device.to_string(),
                command: path.to_string(),
            });
            return DispatchOutcome::UnknownCommand {
                command: path.to_string(),
            };
        };

        debug!("Dispatching {} '{}' for {}", command.name, payload, device);
        let mut ctx = CommandContext::new(device, &channel.key, payload, state, &self.store);
        let result = catch_unwind(AssertUnwindSafe(|| (command.handler)(&mut ctx)));

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled {
                command: command.name.clone(),
                channel: channel.key.clone(),
                messages: ctx.into_outgoing(),
            },
            Ok(Err(e)) => {
                warn!("Command {} for {} rejected: {}", command.name, device, e);
                DispatchOutcome::Rejected {
                    command: command.name.clone(),
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                error!("Command handler {} panicked for {}", command.name, device);
                DispatchOutcome::Failed {
                    command: command.name.clone(),
                }
            }
        }
    }
}
