use thiserror::Error;

/// Result type for admission-control operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors that can occur while deciding whether to admit a request
#[derive(Error, Debug)]
pub enum GateError {
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Whether the error means the store could not execute the atomic
    /// operation, as opposed to a caller/config error.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, GateError::StoreUnavailable(_) | GateError::Redis(_))
    }
}
