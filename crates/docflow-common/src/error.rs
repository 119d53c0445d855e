//! Error types for docflow

use thiserror::Error;

/// Result type alias for docflow operations
pub type Result<T> = std::result::Result<T, DocFlowError>;

/// Unified error type for all docflow operations
///
/// Errors are cloneable so a single failure can be fanned out to every
/// handler interested in it (exception handler, end-of-transfer future).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocFlowError {
    #[error("MongoDB error: {0}")]
    MongoDB(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// A peer broke the flow-control protocol (second subscriber, second
    /// pending pull, request after completion).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Operation attempted on a stream that already reached its terminal state
    #[error("Stream is closed")]
    StreamClosed,

    /// The operation was cancelled before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Error raised by an upstream source (cursor, publisher, driver)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Error raised by a downstream sink (file, network socket)
    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection timeout - retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient error that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocFlowError {
    /// Returns true if re-issuing the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DocFlowError::Timeout(_) | DocFlowError::Transient(_) | DocFlowError::Connection(_)
        )
    }

    /// Returns true if this error is a flow-control protocol violation
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, DocFlowError::Protocol(_))
    }
}

impl From<serde_json::Error> for DocFlowError {
    fn from(err: serde_json::Error) -> Self {
        DocFlowError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DocFlowError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DocFlowError::Timeout(err.to_string()),
            std::io::ErrorKind::Interrupted => DocFlowError::Transient(err.to_string()),
            _ => DocFlowError::Io(err.to_string()),
        }
    }
}

impl From<DocFlowError> for std::io::Error {
    fn from(err: DocFlowError) -> Self {
        let kind = match &err {
            DocFlowError::StreamClosed => std::io::ErrorKind::BrokenPipe,
            DocFlowError::Timeout(_) => std::io::ErrorKind::TimedOut,
            DocFlowError::Protocol(_) => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocFlowError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } => DocFlowError::Connection(err.to_string()),
            ErrorKind::Io(_) => DocFlowError::Connection(err.to_string()),
            ErrorKind::InvalidArgument { .. } => DocFlowError::Configuration(err.to_string()),
            _ => DocFlowError::MongoDB(err.to_string()),
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocFlowError {
    fn from(err: bson::ser::Error) -> Self {
        DocFlowError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocFlowError {
    fn from(err: bson::de::Error) -> Self {
        DocFlowError::Serialization(format!("BSON deserialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::oid::Error> for DocFlowError {
    fn from(err: bson::oid::Error) -> Self {
        DocFlowError::Serialization(format!("Invalid ObjectId: {}", err))
    }
}
