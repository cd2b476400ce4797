//! Error types for the proxy control plane.

use thiserror::Error;

/// Registry and service errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No service registered under this name.
    #[error("no service: {0}")]
    NoService(String),

    /// The service has no backend with this name.
    #[error("no backend: {backend} in service {service}")]
    NoBackend { service: String, backend: String },

    /// A service with this name already exists.
    #[error("duplicate service: {0}")]
    DuplicateService(String),

    /// A backend with this name already exists.
    #[error("duplicate backend: {backend} in service {service}")]
    #[allow(dead_code)] // Backends are replaced in place today
    DuplicateBackend { service: String, backend: String },

    /// The service listener could not be opened.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A configured address is not usable.
    #[error("invalid address: {addr}")]
    InvalidAddress { addr: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::NoService(_) => "no_service",
            ProxyError::NoBackend { .. } => "no_backend",
            ProxyError::DuplicateService(_) => "duplicate_service",
            ProxyError::DuplicateBackend { .. } => "duplicate_backend",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::InvalidAddress { .. } => "invalid_address",
            ProxyError::Io(_) => "io_error",
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
