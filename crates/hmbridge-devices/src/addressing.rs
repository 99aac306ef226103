//! Topic addressing.
//!
//! Two addressing epochs coexist and both are always served:
//!
//! ```text
//! legacy   hame_energy/<familyId>/device/<deviceId>/ctrl      (telegrams in)
//!          hame_energy/<familyId>/App/<deviceId>/ctrl         (commands out)
//! current  marstek_energy/<familyId>/device/<currentId>/ctrl
//!          marstek_energy/<familyId>/App/<currentId>/ctrl
//! bridge   <prefix>/<deviceId>/control/<command>              (operator in)
//!          <prefix>/<deviceId>/<channel>                      (state out)
//!          <prefix>/<deviceId>/availability
//! ```
//!
//! `currentId` is the raw device id unless the family obfuscates it.

use serde::Serialize;

use hmbridge_core::Device;

use crate::crypto::obfuscate_id;
use crate::schema::DeviceSchema;

pub const LEGACY_ROOT: &str = "hame_energy";
pub const CURRENT_ROOT: &str = "marstek_energy";

/// All topics of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTopics {
    /// Identifier used in current-epoch topics
    pub current_id: String,
    pub device_legacy: String,
    pub device_current: String,
    pub command_legacy: String,
    pub command_current: String,
    pub control: String,
    pub publish: String,
    pub availability: String,
}

impl DeviceTopics {
    pub fn compute(device: &Device, schema: &DeviceSchema, prefix: &str) -> Self {
        let current_id = if schema.obfuscate_current_id {
            obfuscate_id(&device.device_id)
        } else {
            device.device_id.clone()
        };
        let family_id = &device.family_id;
        let device_id = &device.device_id;
        let publish = format!("{}/{}", prefix, device_id);

        Self {
            device_legacy: format!("{}/{}/device/{}/ctrl", LEGACY_ROOT, family_id, device_id),
            device_current: format!("{}/{}/device/{}/ctrl", CURRENT_ROOT, family_id, current_id),
            command_legacy: format!("{}/{}/App/{}/ctrl", LEGACY_ROOT, family_id, device_id),
            command_current: format!("{}/{}/App/{}/ctrl", CURRENT_ROOT, family_id, current_id),
            control: format!("{}/control", publish),
            availability: format!("{}/availability", publish),
            publish,
            current_id,
        }
    }

    /// Topics the device publishes telegrams on.
    pub fn inbound(&self) -> [&str; 2] {
        [&self.device_legacy, &self.device_current]
    }

    /// Topics the device listens for commands on.
    pub fn outbound(&self) -> [&str; 2] {
        [&self.command_legacy, &self.command_current]
    }

    /// Operator-facing state topic of a channel.
    pub fn channel_topic(&self, channel: &str) -> String {
        format!("{}/{}", self.publish, channel)
    }

    /// Operator-facing control topic of a command.
    pub fn command_topic(&self, command: &str) -> String {
        format!("{}/{}", self.control, command)
    }

    /// Command path of an operator control topic, if it belongs to this device.
    pub fn command_path<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.control.as_str())?
            .strip_prefix('/')
            .filter(|path| !path.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::reveal_id;
    use crate::registry::SchemaRegistry;

    #[test]
    fn test_plain_family_topics() {
        let registry = SchemaRegistry::builtin();
        let device = Device::new("HMA-1", "0011aabbccdd");
        let schema = registry.resolve(&device.family_id).unwrap();
        let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");

        assert_eq!(topics.device_legacy, "hame_energy/HMA-1/device/0011aabbccdd/ctrl");
        assert_eq!(topics.device_current, "marstek_energy/HMA-1/device/0011aabbccdd/ctrl");
        assert_eq!(topics.command_legacy, "hame_energy/HMA-1/App/0011aabbccdd/ctrl");
        assert_eq!(topics.control, "hm2mqtt/0011aabbccdd/control");
        assert_eq!(topics.availability, "hm2mqtt/0011aabbccdd/availability");
        assert_eq!(topics.channel_topic("data"), "hm2mqtt/0011aabbccdd/data");
    }

    #[test]
    fn test_obfuscated_family_topics() {
        let registry = SchemaRegistry::builtin();
        let device = Device::new("HMG-50", "0011aabbccdd");
        let schema = registry.resolve(&device.family_id).unwrap();
        let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");

        assert_ne!(topics.current_id, device.device_id);
        assert_eq!(reveal_id(&topics.current_id).unwrap(), device.device_id);
        assert!(topics.device_current.contains(&topics.current_id));
        // Legacy epoch always uses the raw id.
        assert!(topics.device_legacy.contains("/0011aabbccdd/"));
    }

    #[test]
    fn test_command_path() {
        let registry = SchemaRegistry::builtin();
        let device = Device::new("HMA-1", "abc");
        let schema = registry.resolve(&device.family_id).unwrap();
        let topics = DeviceTopics::compute(&device, &schema, "hm2mqtt");

        assert_eq!(topics.command_path("hm2mqtt/abc/control/discharge-depth"), Some("discharge-depth"));
        assert_eq!(
            topics.command_path("hm2mqtt/abc/control/time-period/1/enabled"),
            Some("time-period/1/enabled")
        );
        assert_eq!(topics.command_path("hm2mqtt/abc/control/"), None);
        assert_eq!(topics.command_path("hm2mqtt/abc/controlx"), None);
        assert_eq!(topics.command_path("hm2mqtt/other/control/restart"), None);
    }
}
