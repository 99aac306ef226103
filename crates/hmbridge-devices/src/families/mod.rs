//! Built-in device families.

pub mod b2500;
pub mod venus;

use tracing::error;

use hmbridge_core::BridgeResult;

use crate::registry::SchemaRegistry;
use crate::schema::DeviceSchema;

/// Schemas of every built-in family.
pub fn builtin_schemas() -> Vec<BridgeResult<DeviceSchema>> {
    vec![b2500::hmb_schema(), b2500::hma_schema(), venus::hmg_schema()]
}

/// Register every built-in family. A family whose schema fails to build is
/// logged and left out.
pub fn register_builtin(registry: &mut SchemaRegistry) {
    for schema in builtin_schemas() {
        if let Err(e) = schema.and_then(|schema| registry.register(schema)) {
            error!("Failed to register built-in device family: {}", e);
        }
    }
}
