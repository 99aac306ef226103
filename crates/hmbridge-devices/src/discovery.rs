//! Home Assistant MQTT discovery documents.
//!
//! One retained config message per advertised value:
//!
//! ```text
//! <discoveryPrefix>/<component>/<topicPrefix>_<deviceId>/<objectId>/config
//! ```
//!
//! State is read from the channel's JSON state topic through a value template;
//! commands go to the device's control topic.

use serde::{Deserialize, Serialize};

use hmbridge_core::{Device, StateMap};

use crate::addressing::DeviceTopics;
use crate::schema::{Advertisement, ChannelDefinition, Component, DeviceSchema};

/// Discovery config payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub name: String,

    pub unique_id: String,

    pub object_id: String,

    pub device: DiscoveryDevice,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,

    #[serde(rename = "unit_of_measurement", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<String>,

    pub availability_topic: String,
}

/// Device block shared by all entities of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
}

/// A config message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub topic: String,
    pub config: DiscoveryConfig,
}

impl DiscoveryDocument {
    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.config)
    }
}

/// Object id of an advertisement: its path with separators flattened.
fn object_id(advertisement: &Advertisement) -> String {
    advertisement
        .path
        .as_str()
        .replace(['.', '/'], "_")
}

fn value_template(advertisement: &Advertisement) -> String {
    let accessor: String = advertisement
        .path
        .segments()
        .map(|s| format!("['{}']", s))
        .collect();
    match advertisement.component {
        Component::BinarySensor | Component::Switch => {
            format!("{{{{ 'ON' if value_json{} else 'OFF' }}}}", accessor)
        }
        _ => format!("{{{{ value_json{} }}}}", accessor),
    }
}

fn document(
    device: &Device,
    schema: &DeviceSchema,
    topics: &DeviceTopics,
    channel: &ChannelDefinition,
    advertisement: &Advertisement,
    topic_prefix: &str,
    discovery_prefix: &str,
) -> DiscoveryDocument {
    let node_id = format!("{}_{}", topic_prefix, device.device_id);
    let object = object_id(advertisement);
    let component = advertisement.component;

    let config = DiscoveryConfig {
        name: advertisement.name.clone(),
        unique_id: format!("{}_{}", node_id, object),
        object_id: format!("{}_{}", node_id, object),
        device: DiscoveryDevice {
            identifiers: vec![node_id.clone()],
            name: format!("{} {}", schema.model, device.device_id),
            model: format!("{} ({})", schema.model, device.family_id),
            manufacturer: schema.manufacturer.clone(),
        },
        state_topic: component
            .has_state()
            .then(|| topics.channel_topic(&channel.key)),
        value_template: component.has_state().then(|| value_template(advertisement)),
        command_topic: advertisement
            .command
            .as_deref()
            .map(|command| topics.command_topic(command)),
        payload_on: (component == Component::Switch).then(|| "ON".to_string()),
        payload_off: (component == Component::Switch).then(|| "OFF".to_string()),
        payload_press: (component == Component::Button).then(|| "PRESS".to_string()),
        unit: advertisement.unit.clone(),
        device_class: advertisement.device_class.clone(),
        state_class: advertisement.state_class.clone(),
        icon: advertisement.icon.clone(),
        min: advertisement.min,
        max: advertisement.max,
        step: advertisement.step,
        options: advertisement.options.clone(),
        availability_topic: topics.availability.clone(),
    };

    DiscoveryDocument {
        topic: format!("{}/{}/{}/{}/config", discovery_prefix, component.as_str(), node_id, object),
        config,
    }
}

/// Discovery documents for every advertisement enabled by `state`.
pub fn documents_for(
    device: &Device,
    schema: &DeviceSchema,
    topics: &DeviceTopics,
    state: &StateMap,
    topic_prefix: &str,
    discovery_prefix: &str,
) -> Vec<DiscoveryDocument> {
    schema
        .channels
        .iter()
        .flat_map(|channel| channel.advertisements.iter().map(move |adv| (channel, adv)))
        .filter(|(_, adv)| adv.is_enabled(state))
        .map(|(channel, adv)| {
            document(device, schema, topics, channel, adv, topic_prefix, discovery_prefix)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;
    use crate::schema::ChannelDefinition;
    use serde_json::json;

    fn schema() -> DeviceSchema {
        DeviceSchema::builder("TST", "Test Box")
            .channel(
                ChannelDefinition::new("data", "cd=1")
                    .with_advertisement(Advertisement::power("solarPower", "Solar Power"))
                    .with_advertisement(Advertisement::switch("output1", "Output 1", "output1"))
                    .with_advertisement(Advertisement::button("restart", "Restart"))
                    .with_advertisement(
                        Advertisement::sensor("timePeriod1.startTime", "Period 1 Start")
                            .enabled_when(|s| s.get("timePeriods").is_some()),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_documents() {
        let schema = schema();
        let device = Device::new("TST-1", "abc");
        let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");
        let docs = documents_for(&device, &schema, &topics, &StateMap::new(), "hm2mqtt", "homeassistant");

        assert_eq!(docs.len(), 3);
        let power = &docs[0];
        assert_eq!(power.topic, "homeassistant/sensor/hm2mqtt_abc/solarPower/config");
        assert_eq!(power.config.state_topic.as_deref(), Some("hm2mqtt/abc/data"));
        assert_eq!(power.config.value_template.as_deref(), Some("{{ value_json['solarPower'] }}"));
        assert_eq!(power.config.unit.as_deref(), Some("W"));
        assert_eq!(power.config.availability_topic, "hm2mqtt/abc/availability");

        let switch = &docs[1];
        assert_eq!(switch.config.command_topic.as_deref(), Some("hm2mqtt/abc/control/output1"));
        assert_eq!(
            switch.config.value_template.as_deref(),
            Some("{{ 'ON' if value_json['output1'] else 'OFF' }}")
        );

        let button = &docs[2];
        assert!(button.config.state_topic.is_none());
        assert_eq!(button.config.payload_press.as_deref(), Some("PRESS"));

        let json: serde_json::Value = serde_json::from_str(&button.payload().unwrap()).unwrap();
        assert!(json.get("state_topic").is_none());
        assert_eq!(json["device"]["manufacturer"], json!("Hame"));
    }

    #[test]
    fn test_enabled_predicate() {
        let schema = schema();
        let device = Device::new("TST-1", "abc");
        let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");
        let mut state = StateMap::new();
        state.insert("timePeriods".into(), json!(true));
        let docs = documents_for(&device, &schema, &topics, &state, "hm2mqtt", "homeassistant");
        assert_eq!(docs.len(), 4);
        assert_eq!(docs[3].topic, "homeassistant/sensor/hm2mqtt_abc/timePeriod1_startTime/config");
        assert_eq!(
            docs[3].config.value_template.as_deref(),
            Some("{{ value_json['timePeriod1']['startTime'] }}")
        );
    }

    #[test]
    fn test_builtin_families_advertise() {
        let registry = SchemaRegistry::builtin();
        for family in ["HMA-1", "HMB-1", "HMG-50"] {
            let device = Device::new(family, "abc");
            let schema = registry.resolve(family).unwrap();
            let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");
            let docs = documents_for(&device, &schema, &topics, &StateMap::new(), "hm2mqtt", "homeassistant");
            assert!(!docs.is_empty(), "{} advertises nothing", family);
        }
    }
}
