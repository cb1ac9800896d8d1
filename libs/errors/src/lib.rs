//! Unified error handling for gateway services
//!
//! Startup and lifecycle failures surface through [`ServiceError`]. Per-request
//! Modbus failures never reach this type; they are answered on the wire.

use thiserror::Error;

// ============================================================================
// ServiceError - Main error type
// ============================================================================

/// Main error type for service startup and lifecycle
#[derive(Debug, Error)]
pub enum ServiceError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // ======================================
    // Communication Errors
    // ======================================
    #[error("Failed to bind listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Backend init failed for slave {slave_id}: {reason}")]
    BackendInit { slave_id: u8, reason: String },

    // ======================================
    // System Errors
    // ======================================
    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ServiceError
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error category enum - used for classification in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Internal,
}

impl ServiceError {
    /// Shorthand for a field-level validation failure
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::ConfigNotFound(_) => {
                ErrorCategory::Configuration
            },
            Self::Bind { .. } | Self::BackendInit { .. } => ErrorCategory::Network,
            Self::Logging(_) | Self::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Process exit code for a fatal startup error
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration => 2,
            ErrorCategory::Network | ErrorCategory::Internal => 1,
        }
    }
}
