//! Workshop Error Types
//!
//! Centralized error handling for all Workshop components

use std::fmt;

/// Main error type for Workshop operations
#[derive(Debug)]
pub enum WorkshopError {
    /// IO-related errors
    Io(std::io::Error),
    /// Serialization/deserialization errors
    Serde(serde_json::Error),
    /// Configuration errors
    Config(String),
    /// Chat gateway errors
    Gateway(String),
    /// Snapshot/save-slot errors
    Persistence(String),
    /// An instance, element or conversation could not be resolved
    NotFound(String),
}

impl fmt::Display for WorkshopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkshopError::Io(err) => write!(f, "IO error: {}", err),
            WorkshopError::Serde(err) => write!(f, "Serialization error: {}", err),
            WorkshopError::Config(msg) => write!(f, "Configuration error: {}", msg),
            WorkshopError::Gateway(msg) => write!(f, "Gateway error: {}", msg),
            WorkshopError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            WorkshopError::NotFound(what) => write!(f, "Not found: {}", what),
        }
    }
}

impl std::error::Error for WorkshopError {}

/// Convenience result type for Workshop operations
pub type Result<T> = std::result::Result<T, WorkshopError>;

impl From<std::io::Error> for WorkshopError {
    fn from(err: std::io::Error) -> Self {
        WorkshopError::Io(err)
    }
}

impl From<serde_json::Error> for WorkshopError {
    fn from(err: serde_json::Error) -> Self {
        WorkshopError::Serde(err)
    }
}

impl From<toml::de::Error> for WorkshopError {
    fn from(err: toml::de::Error) -> Self {
        WorkshopError::Config(err.to_string())
    }
}
