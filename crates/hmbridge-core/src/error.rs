//! Error taxonomy for the bridge.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the device engine and its collaborators.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No schema is registered for the device family
    #[error("No schema registered for device family: {0}")]
    SchemaNotFound(String),

    /// A schema was registered twice for the same family
    #[error("Schema already registered for device family: {0}")]
    SchemaAlreadyRegistered(String),

    /// No command matches the inbound control path
    #[error("Unknown command '{command}' for device {device}")]
    UnknownCommand { device: String, command: String },

    /// Payload rejected by a command's accepted formats
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Publish or subscribe rejected by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// None of the configured devices resolved to a known family
    #[error("No valid devices configured")]
    NoDevices,

    /// Identifier obfuscation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Other error
    #[error("Bridge error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoDevices | Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnknownCommand {
            device: "HMA-1:abc".to_string(),
            command: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown command 'nope' for device HMA-1:abc");
        assert!(!err.is_fatal());
        assert!(BridgeError::NoDevices.is_fatal());
    }
}
