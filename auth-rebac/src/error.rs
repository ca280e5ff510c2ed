use thiserror::Error;

/// Errors surfaced by the authorization core.
///
/// Graph limits hit during a check resolve to a DENY decision and are only
/// visible in the decision's `limit` tag and in trace spans. Only an
/// expansion that cannot finish its backward walk in time reports
/// `TraversalTimeout`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebacError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("ReBAC backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cursor expired or invalidated: {0}")]
    ExpiredCursor(String),

    #[error("Backing store failure: {0}")]
    BackingStoreFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Traversal timed out: {0}")]
    TraversalTimeout(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RebacError {
    /// Whether the error came from the backing store rather than the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            RebacError::Storage(_) | RebacError::BackingStoreFailure(_) | RebacError::CircuitOpen
        )
    }
}

impl From<anyhow::Error> for RebacError {
    fn from(err: anyhow::Error) -> Self {
        RebacError::Internal(format!("{:#}", err))
    }
}

impl From<sqlx::Error> for RebacError {
    fn from(err: sqlx::Error) -> Self {
        RebacError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for RebacError {
    fn from(err: config::ConfigError) -> Self {
        RebacError::InvalidConfig(err.to_string())
    }
}

/// Shared errors come back from single-flight cache loaders wrapped in an `Arc`.
impl From<std::sync::Arc<RebacError>> for RebacError {
    fn from(err: std::sync::Arc<RebacError>) -> Self {
        std::sync::Arc::try_unwrap(err).unwrap_or_else(|shared| (*shared).clone())
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
