use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Clone for GatewayError {
    fn clone(&self) -> Self {
        match self {
            GatewayError::Io(e) => GatewayError::Network(e.to_string()),
            GatewayError::Network(s) => GatewayError::Network(s.clone()),
            GatewayError::Parse(s) => GatewayError::Parse(s.clone()),
            GatewayError::Serialization(s) => GatewayError::Serialization(s.clone()),
            GatewayError::Configuration(s) => GatewayError::Configuration(s.clone()),
            GatewayError::Capacity(s) => GatewayError::Capacity(s.clone()),
            GatewayError::Unavailable(s) => GatewayError::Unavailable(s.clone()),
            GatewayError::Authentication(s) => GatewayError::Authentication(s.clone()),
            GatewayError::InvalidRequest(s) => GatewayError::InvalidRequest(s.clone()),
            GatewayError::NotFound(s) => GatewayError::NotFound(s.clone()),
            GatewayError::AlreadyExists(s) => GatewayError::AlreadyExists(s.clone()),
            GatewayError::InvalidState(s) => GatewayError::InvalidState(s.clone()),
            GatewayError::Timeout(s) => GatewayError::Timeout(s.clone()),
            GatewayError::Shutdown => GatewayError::Shutdown,
            GatewayError::Internal(s) => GatewayError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for GatewayError {
    fn from(e: bincode::error::EncodeError) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for GatewayError {
    fn from(e: bincode::error::DecodeError) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}
