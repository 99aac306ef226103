//! Device schema registry.
//!
//! A process-scoped, read-only map from family prefix to schema. It is filled
//! once (built-in families via [`SchemaRegistry::builtin`], or explicitly with
//! [`SchemaRegistry::register`] before being shared) and only read afterwards.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

use hmbridge_core::device::family_prefix;
use hmbridge_core::{BridgeError, BridgeResult};

use crate::families;
use crate::schema::DeviceSchema;

static BUILTIN: Lazy<Arc<SchemaRegistry>> = Lazy::new(|| {
    let mut registry = SchemaRegistry::new();
    families::register_builtin(&mut registry);
    Arc::new(registry)
});

/// Family prefix → schema.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<DeviceSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in family.
    pub fn builtin() -> Arc<SchemaRegistry> {
        BUILTIN.clone()
    }

    /// Register a schema under its family prefix.
    ///
    /// Registering the same family twice is an error; the first schema stays.
    pub fn register(&mut self, schema: DeviceSchema) -> BridgeResult<()> {
        if self.schemas.contains_key(&schema.family) {
            return Err(BridgeError::SchemaAlreadyRegistered(schema.family));
        }
        self.schemas.insert(schema.family.clone(), Arc::new(schema));
        Ok(())
    }

    /// Schema for a family id such as `HMA-1`.
    pub fn resolve(&self, family_id: &str) -> Option<Arc<DeviceSchema>> {
        self.schemas.get(family_prefix(family_id)).cloned()
    }

    /// Like [`resolve`](Self::resolve) but reports `SchemaNotFound`.
    pub fn require(&self, family_id: &str) -> BridgeResult<Arc<DeviceSchema>> {
        self.resolve(family_id)
            .ok_or_else(|| BridgeError::SchemaNotFound(family_id.to_string()))
    }

    pub fn families(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChannelDefinition;

    fn schema(family: &str, model: &str) -> DeviceSchema {
        DeviceSchema::builder(family, model)
            .channel(ChannelDefinition::new("data", "cd=1"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = SchemaRegistry::new();
        registry.register(schema("TST", "Test")).unwrap();

        assert_eq!(registry.resolve("TST-1").unwrap().model, "Test");
        assert_eq!(registry.resolve("TST-42").unwrap().family, "TST");
        assert!(registry.resolve("TST").is_some());
        assert!(registry.resolve("XYZ-1").is_none());
        assert!(matches!(registry.require("XYZ-1"), Err(BridgeError::SchemaNotFound(_))));
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = SchemaRegistry::new();
        registry.register(schema("TST", "First")).unwrap();
        let err = registry.register(schema("TST", "Second")).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaAlreadyRegistered(ref f) if f == "TST"));
        assert_eq!(registry.resolve("TST-1").unwrap().model, "First");
    }

    #[test]
    fn test_builtin_families() {
        let registry = SchemaRegistry::builtin();
        assert_eq!(registry.families(), vec!["HMA", "HMB", "HMG"]);
    }
}
