//! Error types for gpufleet

use thiserror::Error;

/// Main error type for gpufleet
#[derive(Error, Debug)]
pub enum FleetError {
    /// Required credential or endpoint material is missing
    #[error("Configuration incomplete: {0}")]
    ConfigIncomplete(String),

    /// Remote engine unreachable or timed out
    #[error("Connection error: {0}")]
    Connection(String),

    /// Referenced node, spec, image or workload does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller may not act on another principal's workload
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Remote create or start failed
    #[error("Provision failed: {0}")]
    ProvisionFailure(String),

    /// Request is well-formed but cannot be acted on
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Remote engine answered with a non-success status
    #[error("Engine returned {status}: {message}")]
    Engine {
        /// HTTP status code reported by the engine
        status: u16,
        /// Engine-provided message
        message: String,
    },

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// True when the engine reported that the object does not exist
    pub fn is_engine_not_found(&self) -> bool {
        matches!(self, FleetError::Engine { status: 404, .. })
    }
}

/// Result type for gpufleet operations
pub type FleetResult<T> = Result<T, FleetError>;

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::ConfigIncomplete("client key missing".to_string());
        assert_eq!(err.to_string(), "Configuration incomplete: client key missing");

        let err = FleetError::Engine {
            status: 409,
            message: "name already in use".to_string(),
        };
        assert_eq!(err.to_string(), "Engine returned 409: name already in use");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FleetError = io_err.into();
        assert!(matches!(err, FleetError::Io(_)));
    }

    #[test]
    fn test_engine_not_found() {
        let err = FleetError::Engine {
            status: 404,
            message: "no such container".to_string(),
        };
        assert!(err.is_engine_not_found());
        assert!(!FleetError::NotFound("x".to_string()).is_engine_not_found());
    }
}
