use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for tandem operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tandem operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-sequence wire record
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Process-level worker failure, fatal to the owning service
    #[error("worker crashed: {message}")]
    WorkerCrash { message: String },

    /// Shared-memory allocation or mapping failure
    #[error("shared memory resource '{name}' error: {message}")]
    Resource {
        name: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Illegal API call given the current task or service state
    #[error("invalid state: expected {expected}, but was {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation not permitted, e.g. unlinking a region twice
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Worker process launch failures
    #[error("failed to launch '{command}': {message}")]
    Spawn { command: String, message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },
}

impl Error {
    /// Create a protocol error from any displayable cause.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Create a resource error without an underlying I/O source.
    pub fn resource(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Resource {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
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
