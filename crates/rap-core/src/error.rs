//! Application-wide error types
//!
//! This module defines a centralized error type using `thiserror` for
//! clean error handling across the proxy and the analysis engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
///
/// This provides a centralized error handling strategy with:
/// - Structured error variants for different failure modes
/// - Serde support so gateway errors can be returned as JSON
/// - Automatic Display implementation via thiserror
/// - Automatic conversion from common error types
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum AppError {
    /// Could not connect to or complete a call against the upstream API
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Disk error while persisting a capture
    #[error("Capture write failed: {0}")]
    CaptureWriteFailure(String),

    /// No capture directory matches the requested id
    #[error("No capture found for request id: {0}")]
    CaptureNotFound(String),

    /// The same request id appears under more than one date directory
    #[error("Request id matches captures under more than one date: {0}")]
    CaptureAmbiguous(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Convert AppError to String for CLI exit messages
impl From<AppError> for String {
    fn from(error: AppError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

// Automatic conversions from common error types
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
