//! Error types for rookery

/// Result type alias for rookery operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rookery
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors (bad flags, malformed service path)
    #[error("Configuration error: {0}")]
    Config(String),
    /// Transient coordination-store errors (retryable)
    #[error("Coordination store error: {0}")]
    Coord(String),
    /// The store definitively lost or revoked our lease
    #[error("Lease lost: {0}")]
    LeaseLost(String),
    /// Lock or slot contention (retry with backoff)
    #[error("Contention: {0}")]
    Contention(String),
    /// Processor validation failure at registration
    #[error("{0}")]
    InvalidProcessor(String),
    /// Transport bind / serve-loop startup failure
    #[error("Bind error: {0}")]
    Bind(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Key or resource not present in the store
    #[error("Not found: {0}")]
    NotFound(String),
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether a coordination-store failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Coord(_) | Error::Contention(_) | Error::Timeout(_)
        )
    }
}
