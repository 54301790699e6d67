//! Error types for gateway operations.
//!
//! Every variant maps to one wire-level [`ErrorCode`]; the HTTP layer derives
//! the status code from it.

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

/// Machine-readable error classification carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConfigError,
    AuthDenied,
    AuthFailed,
    InvalidRequest,
    ServerNotFound,
    ServerError,
    StreamingNotSupported,
    TelemetryError,
}

impl ErrorCode {
    /// Stable string form, also used as a metric attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigError => "config_error",
            ErrorCode::AuthDenied => "auth_denied",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::ServerNotFound => "server_not_found",
            ErrorCode::ServerError => "server_error",
            ErrorCode::StreamingNotSupported => "streaming_not_supported",
            ErrorCode::TelemetryError => "telemetry_error",
        }
    }
}

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration could not be loaded or failed validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Caller address is not in the allowlist
    #[error("client not allowed: {0}")]
    ClientNotAllowed(IpAddr),

    /// Bearer token missing or wrong
    #[error("auth failed")]
    AuthFailed,

    /// Request body could not be understood
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No managed server with this id
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// Server exists but has no running subprocess
    #[error("server '{0}' is not running")]
    NotRunning(String),

    /// Subprocess could not be launched
    #[error("failed to start server '{0}': {1}")]
    Spawn(String, String),

    /// Write to or read from the subprocess failed
    #[error("transport error for server '{0}': {1}")]
    Transport(String, String),

    /// Call did not complete within the request timeout
    #[error("call to server '{0}' cancelled after timeout")]
    CallTimeout(String),

    /// The client cannot receive an event stream
    #[error("streaming not supported: {0}")]
    StreamingNotSupported(String),

    /// Telemetry pipeline could not be initialised or flushed
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl GatewayError {
    /// Wire-level classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Config(_) => ErrorCode::ConfigError,
            GatewayError::ClientNotAllowed(_) => ErrorCode::AuthDenied,
            GatewayError::AuthFailed => ErrorCode::AuthFailed,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::ServerNotFound(_) => ErrorCode::ServerNotFound,
            GatewayError::NotRunning(_)
            | GatewayError::Spawn(..)
            | GatewayError::Transport(..)
            | GatewayError::CallTimeout(_) => ErrorCode::ServerError,
            GatewayError::StreamingNotSupported(_) => ErrorCode::StreamingNotSupported,
            GatewayError::Telemetry(_) => ErrorCode::TelemetryError,
        }
    }

    /// The managed server this error concerns, if any.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            GatewayError::ServerNotFound(id)
            | GatewayError::NotRunning(id)
            | GatewayError::Spawn(id, _)
            | GatewayError::Transport(id, _)
            | GatewayError::CallTimeout(id) => Some(id),
            _ => None,
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
