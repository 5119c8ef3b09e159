//! Error taxonomy for the security control plane.
//!
//! Every rejection carries internal detail for logs and audit events, but
//! callers only ever see the stable code and the opaque public message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the security components.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Permission denied: {method} requires {required}")]
    PermissionDenied { method: String, required: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Client blocked: {client_id}")]
    ClientBlocked { client_id: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("API key not found: {0}")]
    KeyNotFound(String),

    #[error("API key already revoked: {0}")]
    KeyAlreadyRevoked(String),

    #[error("Quota exceeded for role {role}: {limit} active keys")]
    QuotaExceeded { role: String, limit: usize },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Method already registered: {0}")]
    MethodAlreadyRegistered(String),

    #[error("Deadline exceeded while stopping {0}")]
    DeadlineExceeded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SecurityError {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::AuthenticationRequired(_) => "AUTHENTICATION_REQUIRED",
            SecurityError::InvalidToken(_) => "INVALID_TOKEN",
            SecurityError::TokenExpired => "TOKEN_EXPIRED",
            SecurityError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SecurityError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            SecurityError::ClientBlocked { .. } => "CLIENT_BLOCKED",
            SecurityError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SecurityError::SessionExpired(_) => "SESSION_EXPIRED",
            SecurityError::KeyNotFound(_) => "KEY_NOT_FOUND",
            SecurityError::KeyAlreadyRevoked(_) => "KEY_ALREADY_REVOKED",
            SecurityError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            SecurityError::ValidationFailed(_) => "VALIDATION_FAILED",
            SecurityError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            SecurityError::MethodNotFound(_) => "METHOD_NOT_FOUND",
            SecurityError::MethodAlreadyRegistered(_) => "METHOD_ALREADY_REGISTERED",
            SecurityError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            SecurityError::Configuration(_) => "CONFIGURATION_ERROR",
            SecurityError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON-RPC error code for the transport layer.
    pub fn rpc_code(&self) -> i32 {
        match self {
            SecurityError::AuthenticationRequired(_)
            | SecurityError::InvalidToken(_)
            | SecurityError::TokenExpired
            | SecurityError::SessionNotFound(_)
            | SecurityError::SessionExpired(_) => -32001,
            SecurityError::PermissionDenied { .. } => -32003,
            SecurityError::RateLimitExceeded(_) | SecurityError::ClientBlocked { .. } => -32002,
            SecurityError::KeyNotFound(_) | SecurityError::KeyAlreadyRevoked(_) => -32004,
            SecurityError::QuotaExceeded { .. } => -32005,
            SecurityError::ValidationFailed(_) => -32602,
            SecurityError::MethodNotFound(_) => -32601,
            SecurityError::MethodAlreadyRegistered(_)
            | SecurityError::PersistenceFailure(_)
            | SecurityError::DeadlineExceeded(_)
            | SecurityError::Configuration(_)
            | SecurityError::Internal(_) => -32603,
        }
    }

    /// Message safe to hand back to a remote caller.
    ///
    /// Never includes secret material, internal state, or other clients'
    /// identifiers.
    pub fn public_message(&self) -> &'static str {
        match self {
            SecurityError::AuthenticationRequired(_) => "Authentication required",
            SecurityError::InvalidToken(_) | SecurityError::TokenExpired => {
                "Invalid or expired token"
            }
            SecurityError::PermissionDenied { .. } => "Permission denied",
            SecurityError::RateLimitExceeded(_) => "Rate limit exceeded",
            SecurityError::ClientBlocked { .. } => "Too many violations, try again later",
            SecurityError::SessionNotFound(_) | SecurityError::SessionExpired(_) => {
                "Invalid or expired session"
            }
            SecurityError::KeyNotFound(_) => "API key not found",
            SecurityError::KeyAlreadyRevoked(_) => "API key already revoked",
            SecurityError::QuotaExceeded { .. } => "API key quota exceeded",
            SecurityError::ValidationFailed(_) => "Invalid parameters",
            SecurityError::MethodNotFound(_) => "Method not found",
            SecurityError::MethodAlreadyRegistered(_)
            | SecurityError::PersistenceFailure(_)
            | SecurityError::DeadlineExceeded(_)
            | SecurityError::Configuration(_)
            | SecurityError::Internal(_) => "Internal error",
        }
    }

    /// Whether this error is a security rejection that must be audited.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            SecurityError::AuthenticationRequired(_)
                | SecurityError::InvalidToken(_)
                | SecurityError::TokenExpired
                | SecurityError::PermissionDenied { .. }
                | SecurityError::RateLimitExceeded(_)
                | SecurityError::ClientBlocked { .. }
                | SecurityError::SessionNotFound(_)
                | SecurityError::SessionExpired(_)
        )
    }
}

impl From<std::io::Error> for SecurityError {
    fn from(err: std::io::Error) -> Self {
        SecurityError::PersistenceFailure(err.to_string())
    }
}

/// Error payload returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// JSON-RPC error code.
    pub rpc_code: i32,
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable, non-leaking message.
    pub message: String,
}

impl From<&SecurityError> for ErrorResponse {
    fn from(err: &SecurityError) -> Self {
        Self {
            rpc_code: err.rpc_code(),
            code: err.code().to_string(),
            message: err.public_message().to_string(),
        }
    }
}

/// Result type for security operations.
pub type Result<T> = std::result::Result<T, SecurityError>;
