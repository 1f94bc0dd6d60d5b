//! Error types for the edge gateway and service registry.

use crate::model::InstanceId;
use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors returned by registry mutations.
///
/// Every variant is raised before any state is touched, so a failed
/// mutation never leaves a partial update behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The route definition failed shape validation.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// The instance definition failed shape validation.
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// A route with this name already exists.
    #[error("route '{name}' already exists")]
    DuplicateName { name: String },

    /// Another route already owns this (pattern, priority) pair.
    #[error("pattern '{pattern}' with priority {priority} is already used by route '{existing}'")]
    ConflictingPattern {
        pattern: String,
        priority: u32,
        existing: String,
    },

    /// The route already has an instance at this address.
    #[error("route '{route}' already has an instance at {address}")]
    DuplicateInstance { route: String, address: String },

    /// No route with this name.
    #[error("route '{name}' not found")]
    RouteNotFound { name: String },

    /// No instance with this id.
    #[error("instance {id} not found")]
    InstanceNotFound { id: InstanceId },

    /// The instance is draining and no longer accepts health updates.
    #[error("instance {id} is draining")]
    InstanceDraining { id: InstanceId },
}

impl RegistryError {
    /// Returns the HTTP status the admin API reports for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::InvalidRoute(_) | RegistryError::InvalidInstance(_) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::RouteNotFound { .. } | RegistryError::InstanceNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RegistryError::DuplicateName { .. }
            | RegistryError::ConflictingPattern { .. }
            | RegistryError::DuplicateInstance { .. }
            | RegistryError::InstanceDraining { .. } => StatusCode::CONFLICT,
        }
    }
}

/// Errors returned when a request cannot be matched to a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No route pattern matches the request path.
    #[error("no route matches path {path}")]
    NoMatchingRoute { path: String },

    /// The matched route has no healthy instance.
    #[error("route '{route}' has no healthy instance")]
    NoHealthyInstance { route: String },

    /// Routes matched the path but none had its required header satisfied.
    #[error("required header missing or mismatched for path {path}")]
    ForbiddenHeaderMismatch { path: String },
}

impl RouteError {
    /// Returns the HTTP status the gateway answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouteError::NoMatchingRoute { .. } => StatusCode::NOT_FOUND,
            RouteError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouteError::ForbiddenHeaderMismatch { .. } => StatusCode::FORBIDDEN,
        }
    }
}

/// Errors that can occur while running the gateway process.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration error.
    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },

    /// TLS handshake error.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The backend did not answer within the request timeout.
    #[error("backend {address} timed out after {duration_ms}ms")]
    BackendTimeout { address: String, duration_ms: u64 },

    /// The backend could not be reached or answered with a transport error.
    #[error("backend {address} unavailable: {reason}")]
    BackendUnavailable { address: String, reason: String },

    /// Routing failed.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// Registry mutation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
