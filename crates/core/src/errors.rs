use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for depot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for depot storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object absent from the backend
    #[error("object '{key}' not found")]
    NotFound { key: String },

    /// A backend driver failed (network, credentials, protocol)
    #[error("{backend} backend {operation} failed: {message}")]
    Backend {
        backend: String,
        operation: String,
        message: String,
    },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Metadata/node service failures surfaced by the storage manager
    #[error("metadata service error: {message}")]
    Metadata { message: String },

    /// Malformed or unusable artifact content
    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a not-found error for a content key
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create a backend driver error
    #[must_use]
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            backend: backend.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn io(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::Io {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// Create a metadata service error
    #[must_use]
    pub fn metadata(message: impl Into<String>) -> Self {
        Error::Metadata {
            message: message.into(),
        }
    }

    /// Create an invalid-artifact error
    #[must_use]
    pub fn invalid_artifact(reason: impl Into<String>) -> Self {
        Error::InvalidArtifact {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether this error means the object is simply absent
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
