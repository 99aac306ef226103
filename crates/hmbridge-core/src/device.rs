//! Device identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// A physical device: `{familyId, deviceId}`.
///
/// `family_id` follows `<Family>-<variant>` (e.g. `HMA-1`); the family prefix
/// selects the schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub family_id: String,
    pub device_id: String,
}

impl Device {
    pub fn new(family_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            family_id: family_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Family prefix with the trailing `-<digits>` variant stripped.
    ///
    /// `HMA-1` → `HMA`, `HMG-50` → `HMG`. Ids without a numeric variant are
    /// returned unchanged.
    pub fn family(&self) -> &str {
        family_prefix(&self.family_id)
    }
}

/// Strip a trailing `-<digits>` suffix.
pub fn family_prefix(family_id: &str) -> &str {
    match family_id.rsplit_once('-') {
        Some((prefix, variant))
            if !prefix.is_empty()
                && !variant.is_empty()
                && variant.bytes().all(|b| b.is_ascii_digit()) =>
        {
            prefix
        }
        _ => family_id,
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family_id, self.device_id)
    }
}

impl FromStr for Device {
    type Err = BridgeError;

    /// Parse `<familyId>:<deviceId>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family_id, device_id) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| BridgeError::Configuration(format!("Invalid device spec '{}'", s)))?;
        let (family_id, device_id) = (family_id.trim(), device_id.trim());
        if family_id.is_empty() || device_id.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "Invalid device spec '{}': expected <familyId>:<deviceId>",
                s
            )));
        }
        Ok(Self::new(family_id, device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_prefix() {
        assert_eq!(family_prefix("HMA-1"), "HMA");
        assert_eq!(family_prefix("HMG-50"), "HMG");
        assert_eq!(family_prefix("HMB"), "HMB");
        assert_eq!(family_prefix("HMA-x"), "HMA-x");
        assert_eq!(family_prefix("-1"), "-1");
    }

    #[test]
    fn test_parse_device() {
        let device: Device = "HMA-1:0123456789ab".parse().unwrap();
        assert_eq!(device.family_id, "HMA-1");
        assert_eq!(device.device_id, "0123456789ab");
        assert_eq!(device.family(), "HMA");
        assert_eq!(device.to_string(), "HMA-1:0123456789ab");

        assert!("HMA-1".parse::<Device>().is_err());
        assert!(":abc".parse::<Device>().is_err());
    }
}
