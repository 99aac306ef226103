//! Declarative device schemas.
//!
//! A [`DeviceSchema`] describes one device family: its message channels, how
//! each telegram field maps into channel state, which operator commands the
//! channel accepts and which values are advertised for discovery. Schemas are
//! assembled once at startup through the builder methods below and are never
//! mutated afterwards.
//!
//! ```text
//! DeviceSchema (HMA)
//! ├─ channel "data"        cd=1   ── fields, commands, advertisements
//! ├─ channel "cell-data"   cd=13  ── fields (marker: "ce")
//! └─ channel "calibration" cd=14  ── fields (marker: "cl")
//! ```

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hmbridge_core::{BridgeError, BridgeResult, PollOptions, StateMap};

use crate::commands::normalize_time;
use crate::dispatcher::CommandContext;
use crate::telegram::Telegram;

/// Dotted path into a channel state object, e.g. `timePeriod1.startTime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePath(String);

impl StatePath {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Top-level key this path writes under.
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    pub fn get<'a>(&self, state: &'a StateMap) -> Option<&'a Value> {
        let mut segments = self.segments();
        let mut current = state.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Write `value`, creating intermediate objects as needed.
    pub fn set(&self, state: &mut StateMap, value: Value) {
        let segments: Vec<&str> = self.segments().collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = state;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(StateMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(StateMap::new());
            }
            current = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    pub fn get_bool(&self, state: &StateMap) -> Option<bool> {
        self.get(state).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, state: &StateMap) -> Option<i64> {
        self.get(state).and_then(Value::as_i64)
    }

    pub fn get_str<'a>(&self, state: &'a StateMap) -> Option<&'a str> {
        self.get(state).and_then(Value::as_str)
    }
}

impl From<&str> for StatePath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for StatePath {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a raw telegram value becomes a state value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldTransform {
    /// Signed integer
    Integer,
    /// Number multiplied by a factor
    Scaled(f64),
    /// `1`/`0` (or `true`/`false`)
    Boolean,
    /// One bit of an integer value
    Bit(u8),
    /// Protocol code to name
    Lookup(&'static [(&'static str, &'static str)]),
    /// `H:M` normalized to `HH:MM`
    Time,
}

impl FieldTransform {
    /// Convert a raw value. `None` means the value is unusable and the field
    /// is left out of the patch.
    pub fn apply(&self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        match self {
            Self::Integer => raw.parse::<i64>().ok().map(Value::from),
            Self::Scaled(factor) => {
                let scaled = raw.parse::<f64>().ok()? * factor;
                let rounded = (scaled * 1000.0).round() / 1000.0;
                serde_json::Number::from_f64(rounded).map(Value::Number)
            }
            Self::Boolean => match raw {
                "1" | "true" => Some(Value::Bool(true)),
                "0" | "false" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Bit(bit) => raw
                .parse::<i64>()
                .ok()?
                .checked_shr(u32::from(*bit))
                .map(|v| Value::Bool(v & 1 == 1)),
            Self::Lookup(table) => table
                .iter()
                .find(|(code, _)| *code == raw)
                .map(|(_, name)| Value::String(name.to_string())),
            Self::Time => normalize_time(raw).map(Value::String),
        }
    }
}

/// Wire key → state path mapping.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub key: String,
    pub path: StatePath,
    pub transform: FieldTransform,
}

/// Command handler: validates the payload, then publishes and/or patches state
/// through the context.
pub type CommandHandler = Arc<dyn Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync>;

/// Named operator command.
#[derive(Clone)]
pub struct CommandDefinition {
    pub name: String,
    pub handler: CommandHandler,
}

impl fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Discovery component kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Sensor,
    BinarySensor,
    Switch,
    Number,
    Select,
    Button,
    Text,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Switch => "switch",
            Self::Number => "number",
            Self::Select => "select",
            Self::Button => "button",
            Self::Text => "text",
        }
    }

    /// Whether the entity reads a value from the state topic.
    pub fn has_state(&self) -> bool {
        !matches!(self, Self::Button)
    }
}

/// A state value advertised to the discovery convention.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub path: StatePath,
    pub component: Component,
    pub name: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub icon: Option<String>,
    /// Command name (relative to the device's control topic)
    pub command: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub options: Vec<String>,
    /// Only advertise when this returns true for the effective device state
    pub enabled: Option<fn(&StateMap) -> bool>,
}

impl Advertisement {
    fn new(component: Component, path: impl Into<StatePath>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            component,
            name: name.into(),
            unit: None,
            device_class: None,
            state_class: None,
            icon: None,
            command: None,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
            enabled: None,
        }
    }

    pub fn sensor(path: impl Into<StatePath>, name: impl Into<String>) -> Self {
        Self::new(Component::Sensor, path, name)
    }

    pub fn binary_sensor(path: impl Into<StatePath>, name: impl Into<String>) -> Self {
        Self::new(Component::BinarySensor, path, name)
    }

    pub fn switch(
        path: impl Into<StatePath>,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self::new(Component::Switch, path, name).with_command(command)
    }

    pub fn number(
        path: impl Into<StatePath>,
        name: impl Into<String>,
        command: impl Into<String>,
        min: f64,
        max: f64,
    ) -> Self {
        let mut adv = Self::new(Component::Number, path, name).with_command(command);
        adv.min = Some(min);
        adv.max = Some(max);
        adv.step = Some(1.0);
        adv
    }

    pub fn select(
        path: impl Into<StatePath>,
        name: impl Into<String>,
        command: impl Into<String>,
        options: &[&str],
    ) -> Self {
        let mut adv = Self::new(Component::Select, path, name).with_command(command);
        adv.options = options.iter().map(|o| o.to_string()).collect();
        adv
    }

    pub fn text(
        path: impl Into<StatePath>,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self::new(Component::Text, path, name).with_command(command)
    }

    /// Buttons have no state; the command name doubles as the object id.
    pub fn button(command: impl Into<String>, name: impl Into<String>) -> Self {
        let command = command.into();
        Self::new(Component::Button, command.clone(), name).with_command(command)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn with_state_class(mut self, class: impl Into<String>) -> Self {
        self.state_class = Some(class.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn enabled_when(mut self, predicate: fn(&StateMap) -> bool) -> Self {
        self.enabled = Some(predicate);
        self
    }

    /// Shorthand for a power sensor in watts.
    pub fn power(path: impl Into<StatePath>, name: impl Into<String>) -> Self {
        Self::sensor(path, name)
            .with_unit("W")
            .with_device_class("power")
            .with_state_class("measurement")
    }

    pub fn is_enabled(&self, state: &StateMap) -> bool {
        self.enabled.map_or(true, |predicate| predicate(state))
    }
}

/// Channel poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    /// Use the configured polling interval
    Default,
    Fixed(Duration),
}

/// One message channel of a device family.
#[derive(Debug, Clone)]
pub struct ChannelDefinition {
    pub key: String,
    pub refresh_payload: String,
    pub poll_interval: PollInterval,
    pub controls_availability: bool,
    pub enabled: fn(&PollOptions) -> bool,
    /// Wire key identifying this channel's telegrams
    pub marker: Option<String>,
    pub fields: Vec<FieldDefinition>,
    pub commands: Vec<CommandDefinition>,
    pub advertisements: Vec<Advertisement>,
    pub default_state: StateMap,
}

fn always(_: &PollOptions) -> bool {
    true
}

impl ChannelDefinition {
    pub fn new(key: impl Into<String>, refresh_payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            refresh_payload: refresh_payload.into(),
            poll_interval: PollInterval::Default,
            controls_availability: false,
            enabled: always,
            marker: None,
            fields: Vec::new(),
            commands: Vec::new(),
            advertisements: Vec::new(),
            default_state: StateMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = PollInterval::Fixed(interval);
        self
    }

    pub fn with_availability_control(mut self) -> Self {
        self.controls_availability = true;
        self
    }

    pub fn with_enabled(mut self, predicate: fn(&PollOptions) -> bool) -> Self {
        self.enabled = predicate;
        self
    }

    pub fn with_marker(mut self, key: impl Into<String>) -> Self {
        self.marker = Some(key.into());
        self
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        path: impl Into<StatePath>,
        transform: FieldTransform,
    ) -> Self {
        self.fields.push(FieldDefinition {
            key: key.into(),
            path: path.into(),
            transform,
        });
        self
    }

    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut CommandContext<'_>) -> BridgeResult<()> + Send + Sync + 'static,
    {
        self.commands.push(CommandDefinition {
            name: name.into(),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn with_advertisement(mut self, advertisement: Advertisement) -> Self {
        self.advertisements.push(advertisement);
        self
    }

    pub fn with_default(mut self, path: impl Into<StatePath>, value: Value) -> Self {
        path.into().set(&mut self.default_state, value);
        self
    }

    pub fn interval(&self, default: Duration) -> Duration {
        match self.poll_interval {
            PollInterval::Default => default,
            PollInterval::Fixed(interval) => interval,
        }
    }

    pub fn is_enabled(&self, options: &PollOptions) -> bool {
        (self.enabled)(options)
    }

    pub fn command(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Decode a telegram into a partial channel state.
    pub fn decode(&self, telegram: &Telegram) -> StateMap {
        let mut patch = StateMap::new();
        for field in &self.fields {
            if let Some(value) = telegram.get(&field.key).and_then(|raw| field.transform.apply(raw)) {
                field.path.set(&mut patch, value);
            }
        }
        patch
    }

    /// Top-level state keys this channel writes.
    pub fn state_roots(&self) -> HashSet<&str> {
        self.fields
            .iter()
            .map(|f| f.path.root())
            .chain(self.default_state.keys().map(String::as_str))
            .collect()
    }
}

/// Immutable schema of one device family.
#[derive(Debug, Clone)]
pub struct DeviceSchema {
    pub family: String,
    pub model: String,
    pub manufacturer: String,
    /// Current-epoch topics use the obfuscated device id
    pub obfuscate_current_id: bool,
    pub channels: Vec<ChannelDefinition>,
}

impl DeviceSchema {
    pub fn builder(family: impl Into<String>, model: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: DeviceSchema {
                family: family.into(),
                model: model.into(),
                manufacturer: "Hame".to_string(),
                obfuscate_current_id: false,
                channels: Vec::new(),
            },
        }
    }

    pub fn channel(&self, key: &str) -> Option<&ChannelDefinition> {
        self.channels.iter().find(|c| c.key == key)
    }

    /// Channel an inbound telegram belongs to.
    ///
    /// A telegram carrying a channel's marker key belongs to that channel;
    /// otherwise it belongs to the first channel without a marker.
    pub fn channel_for_telegram(&self, telegram: &Telegram) -> Option<&ChannelDefinition> {
        self.channels
            .iter()
            .find(|c| c.marker.as_deref().is_some_and(|m| telegram.contains(m)))
            .or_else(|| self.channels.iter().find(|c| c.marker.is_none()))
    }

    /// Every command with its owning channel, in registration order.
    pub fn commands(&self) -> impl Iterator<Item = (&ChannelDefinition, &CommandDefinition)> {
        self.channels
            .iter()
            .flat_map(|channel| channel.commands.iter().map(move |command| (channel, command)))
    }
}

/// Builder for [`DeviceSchema`].
pub struct SchemaBuilder {
    schema: DeviceSchema,
}

impl SchemaBuilder {
    pub fn obfuscated(mut self) -> Self {
        self.schema.obfuscate_current_id = true;
        self
    }

    pub fn channel(mut self, channel: ChannelDefinition) -> Self {
        self.schema.channels.push(channel);
        self
    }

    /// Finish the schema.
    ///
    /// Fails when there are no channels, channel keys repeat, or two channels
    /// write the same top-level state key.
    pub fn build(self) -> BridgeResult<DeviceSchema> {
        let schema = self.schema;
        if schema.channels.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "Schema {} has no channels",
                schema.family
            )));
        }

        let mut keys = HashSet::new();
        let mut roots: HashSet<&str> = HashSet::new();
        for channel in &schema.channels {
            if !keys.insert(channel.key.as_str()) {
                return Err(BridgeError::Configuration(format!(
                    "Schema {} repeats channel '{}'",
                    schema.family, channel.key
                )));
            }
            for root in channel.state_roots() {
                if !roots.insert(root) {
                    return Err(BridgeError::Configuration(format!(
                        "Schema {}: state key '{}' is written by more than one channel",
                        schema.family, root
                    )));
                }
            }
        }
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_path_get_set() {
        let mut state = StateMap::new();
        let path = StatePath::new("timePeriod1.startTime");
        path.set(&mut state, json!("06:00"));
        assert_eq!(path.get_str(&state), Some("06:00"));
        assert_eq!(path.root(), "timePeriod1");

        StatePath::new("timePeriod1.enabled").set(&mut state, json!(true));
        assert_eq!(state["timePeriod1"], json!({"startTime": "06:00", "enabled": true}));

        StatePath::new("flat").set(&mut state, json!(3));
        assert_eq!(StatePath::new("flat").get_i64(&state), Some(3));
        assert_eq!(StatePath::new("flat.nested").get(&state), None);
    }

    #[test]
    fn test_transforms() {
        assert_eq!(FieldTransform::Integer.apply("42"), Some(json!(42)));
        assert_eq!(FieldTransform::Integer.apply("x"), None);
        assert_eq!(FieldTransform::Scaled(0.01).apply("1234"), Some(json!(12.34)));
        assert_eq!(FieldTransform::Boolean.apply("1"), Some(json!(true)));
        assert_eq!(FieldTransform::Boolean.apply("2"), None);
        assert_eq!(FieldTransform::Bit(1).apply("2"), Some(json!(true)));
        assert_eq!(FieldTransform::Bit(0).apply("2"), Some(json!(false)));
        assert_eq!(FieldTransform::Bit(63).apply("-1"), Some(json!(true)));
        assert_eq!(FieldTransform::Bit(64).apply("1"), None);
        assert_eq!(FieldTransform::Time.apply("6:5"), Some(json!("06:05")));
        assert_eq!(FieldTransform::Time.apply("25:00"), None);
        static TABLE: &[(&str, &str)] = &[("0", "off"), ("1", "on")];
        assert_eq!(FieldTransform::Lookup(TABLE).apply("1"), Some(json!("on")));
        assert_eq!(FieldTransform::Lookup(TABLE).apply("9"), None);
    }

    #[test]
    fn test_channel_discrimination() {
        let schema = DeviceSchema::builder("TST", "Test")
            .channel(ChannelDefinition::new("data", "cd=1").with_field("pe", "soc", FieldTransform::Integer))
            .channel(
                ChannelDefinition::new("cells", "cd=13")
                    .with_marker("ce")
                    .with_field("c1", "cell1", FieldTransform::Integer),
            )
            .build()
            .unwrap();

        let data = Telegram::parse("pe=50");
        let cells = Telegram::parse("ce=1,c1=3300");
        assert_eq!(schema.channel_for_telegram(&data).unwrap().key, "data");
        assert_eq!(schema.channel_for_telegram(&cells).unwrap().key, "cells");

        let patch = schema.channel("data").unwrap().decode(&Telegram::parse("pe=50,zz=1"));
        assert_eq!(patch.len(), 1);
        assert_eq!(patch["soc"], json!(50));
    }

    #[test]
    fn test_build_rejects_colliding_roots() {
        let result = DeviceSchema::builder("TST", "Test")
            .channel(ChannelDefinition::new("a", "cd=1").with_field("x", "value", FieldTransform::Integer))
            .channel(ChannelDefinition::new("b", "cd=2").with_field("y", "value.inner", FieldTransform::Integer))
            .build();
        assert!(result.is_err());

        assert!(DeviceSchema::builder("TST", "Test").build().is_err());
    }
}
