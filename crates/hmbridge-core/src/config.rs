//! Bridge configuration.
//!
//! Defaults and environment variable names live in small constant modules so
//! the binary and the tests agree on them. `BridgeConfig::from_env` builds a
//! configuration from the process environment; `from_lookup` does the same
//! from any key/value source.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::Device;
use crate::error::{BridgeError, BridgeResult};

/// Default values.
pub mod defaults {
    pub const BROKER: &str = "localhost";
    pub const PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const TOPIC_PREFIX: &str = "hm2mqtt";
    pub const DISCOVERY_PREFIX: &str = "homeassistant";
    pub const POLLING_INTERVAL_SECS: u64 = 60;
    pub const RESPONSE_TIMEOUT_SECS: u64 = 15;
    pub const ALLOWED_CONSECUTIVE_TIMEOUTS: u32 = 3;
    pub const REQUEST_SPACING_MS: u64 = 100;
    pub const MAX_REQUEST_SPACING_MS: u64 = 60_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const BROKER_URL: &str = "MQTT_BROKER_URL";
    pub const CLIENT_ID: &str = "MQTT_CLIENT_ID";
    pub const USERNAME: &str = "MQTT_USERNAME";
    pub const PASSWORD: &str = "MQTT_PASSWORD";
    pub const KEEP_ALIVE: &str = "MQTT_KEEP_ALIVE";
    pub const TOPIC_PREFIX: &str = "MQTT_TOPIC_PREFIX";
    pub const DISCOVERY_PREFIX: &str = "MQTT_DISCOVERY_PREFIX";
    pub const POLLING_INTERVAL: &str = "MQTT_POLLING_INTERVAL";
    pub const RESPONSE_TIMEOUT: &str = "MQTT_RESPONSE_TIMEOUT";
    pub const ALLOWED_CONSECUTIVE_TIMEOUTS: &str = "MQTT_ALLOWED_CONSECUTIVE_TIMEOUTS";
    pub const REQUEST_SPACING_MS: &str = "MQTT_REQUEST_SPACING_MS";
    pub const POLL_CELL_DATA: &str = "POLL_CELL_DATA";
    pub const POLL_EXTRA_BATTERY_DATA: &str = "POLL_EXTRA_BATTERY_DATA";
    pub const POLL_CALIBRATION_DATA: &str = "POLL_CALIBRATION_DATA";
    /// Devices are read from `DEVICE_0`, `DEVICE_1`, ... until the first gap.
    pub const DEVICE_PREFIX: &str = "DEVICE_";
    pub const LOG_JSON: &str = "HMBRIDGE_LOG_JSON";
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID (auto-generated if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_port() -> u16 {
    defaults::PORT
}

fn default_keep_alive() -> u64 {
    defaults::KEEP_ALIVE_SECS
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: defaults::PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive: defaults::KEEP_ALIVE_SECS,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Parse `mqtt://host[:port]` (the scheme is optional).
    pub fn from_url(url: &str) -> BridgeResult<Self> {
        let rest = url
            .trim()
            .trim_start_matches("mqtt://")
            .trim_start_matches("tcp://")
            .trim_end_matches('/');
        if rest.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "Invalid broker URL '{}'",
                url
            )));
        }
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    BridgeError::Configuration(format!("Invalid broker port in '{}'", url))
                })?;
                Ok(Self::new(host).with_port(port))
            }
            None => Ok(Self::new(rest)),
        }
    }

    /// Client id, generating a unique one when not configured.
    pub fn client_id_or_generate(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("hmbridge-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self::new(defaults::BROKER)
    }
}

/// Flags enabling the optional message channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptions {
    #[serde(default)]
    pub cell_data: bool,
    #[serde(default)]
    pub extra_battery_data: bool,
    #[serde(default)]
    pub calibration_data: bool,
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub devices: Vec<Device>,
    /// Poll interval for channels that use the default interval
    pub polling_interval: Duration,
    /// How long to wait for a response to a refresh request
    pub response_timeout: Duration,
    /// Consecutive missed responses before a device is marked offline
    pub allowed_consecutive_timeouts: u32,
    /// Stagger between refresh requests sent in the same tick
    pub request_spacing: Duration,
    pub poll: PollOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            topic_prefix: defaults::TOPIC_PREFIX.to_string(),
            discovery_prefix: defaults::DISCOVERY_PREFIX.to_string(),
            devices: Vec::new(),
            polling_interval: Duration::from_secs(defaults::POLLING_INTERVAL_SECS),
            response_timeout: Duration::from_secs(defaults::RESPONSE_TIMEOUT_SECS),
            allowed_consecutive_timeouts: defaults::ALLOWED_CONSECUTIVE_TIMEOUTS,
            request_spacing: Duration::from_millis(defaults::REQUEST_SPACING_MS),
            poll: PollOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(env_vars::BROKER_URL) {
            config.mqtt = MqttConfig::from_url(&url)?;
        }
        config.mqtt.client_id = lookup(env_vars::CLIENT_ID).filter(|s| !s.is_empty());
        config.mqtt.username = lookup(env_vars::USERNAME).filter(|s| !s.is_empty());
        config.mqtt.password = lookup(env_vars::PASSWORD).filter(|s| !s.is_empty());
        if let Some(keep_alive) = parse_var::<u64>(&lookup, env_vars::KEEP_ALIVE)? {
            config.mqtt.keep_alive = keep_alive;
        }

        if let Some(prefix) = lookup(env_vars::TOPIC_PREFIX).filter(|s| !s.is_empty()) {
            config.topic_prefix = prefix;
        }
        if let Some(prefix) = lookup(env_vars::DISCOVERY_PREFIX).filter(|s| !s.is_empty()) {
            config.discovery_prefix = prefix;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, env_vars::POLLING_INTERVAL)? {
            config.polling_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, env_vars::RESPONSE_TIMEOUT)? {
            config.response_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, env_vars::ALLOWED_CONSECUTIVE_TIMEOUTS)? {
            config.allowed_consecutive_timeouts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, env_vars::REQUEST_SPACING_MS)? {
            config.request_spacing = Duration::from_millis(ms);
        }

        config.poll = PollOptions {
            cell_data: parse_flag(&lookup, env_vars::POLL_CELL_DATA),
            extra_battery_data: parse_flag(&lookup, env_vars::POLL_EXTRA_BATTERY_DATA),
            calibration_data: parse_flag(&lookup, env_vars::POLL_CALIBRATION_DATA),
        };

        let mut index = 0;
        while let Some(spec) = lookup(&format!("{}{}", env_vars::DEVICE_PREFIX, index)) {
            config.devices.push(spec.parse()?);
            index += 1;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.polling_interval.is_zero() {
            return Err(BridgeError::Configuration(
                "Polling interval must be greater than zero".into(),
            ));
        }
        if self.response_timeout.is_zero() {
            return Err(BridgeError::Configuration(
                "Response timeout must be greater than zero".into(),
            ));
        }
        if self.request_spacing > Duration::from_millis(defaults::MAX_REQUEST_SPACING_MS) {
            return Err(BridgeError::Configuration(format!(
                "Request spacing must not exceed {} ms",
                defaults::MAX_REQUEST_SPACING_MS
            )));
        }
        if self.allowed_consecutive_timeouts == 0 {
            return Err(BridgeError::Configuration(
                "Allowed consecutive timeouts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> BridgeResult<Option<T>> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| BridgeError::Configuration(format!("Invalid value for {}: '{}'", key, raw))),
        _ => Ok(None),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}
