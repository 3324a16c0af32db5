//! Error types for the NetCache control plane

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Logic Errors
    // =========================================================================
    /// Oversized or malformed protocol message, never transmitted
    #[error("Malformed message: {0}")]
    Format(String),

    /// Key is already resident in the cache
    #[error("Key already cached: {key}")]
    AlreadyExists { key: String },

    /// Key is not resident / not known
    #[error("Key not found: {key}")]
    NotFound { key: String },

    /// No free storage rows or validity ids left
    #[error("Cache resources exhausted: {resource}")]
    Exhausted { resource: String },

    /// Requested allocation size is not valid
    #[error("Invalid allocation size: {size}")]
    InvalidSize { size: usize },

    // =========================================================================
    // Switch Control Errors
    // =========================================================================
    /// A switch control call failed
    #[error("Switch RPC '{operation}' failed: {reason}")]
    Rpc { operation: String, reason: String },

    // =========================================================================
    // Client / Transport Errors
    // =========================================================================
    /// Feature exists in the interface but has no implementation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A request did not complete in time
    #[error("Timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u64 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an `Rpc` error for the given switch operation.
    pub fn rpc(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::Rpc {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an `Exhausted` error for the named resource.
    pub fn exhausted(resource: impl Into<String>) -> Self {
        Error::Exhausted {
            resource: resource.into(),
        }
    }

    /// Short machine-friendly label, used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Format(_) => "format",
            Error::AlreadyExists { .. } => "already_exists",
            Error::NotFound { .. } => "not_found",
            Error::Exhausted { .. } => "exhausted",
            Error::InvalidSize { .. } => "invalid_size",
            Error::Rpc { .. } => "rpc",
            Error::Unsupported(_) => "unsupported",
            Error::Timeout { .. } => "timeout",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Yaml(_) => "yaml",
            Error::Internal(_) => "internal",
        }
    }
}
