//! Error types for the pooling engine.
//!
//! Creation and enlistment failures are always surfaced to the caller.
//! Destroy and cleanup failures are logged and swallowed by the pool.

use thiserror::Error;

/// Failure reported by a resource collaborator (factory or physical connection).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ResourceError {
    message: String,
    retryable: bool,
}

impl ResourceError {
    /// A failure that is not expected to clear up on retry.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A transient failure (e.g. backend temporarily unreachable).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Errors surfaced by pool, listener and connection-manager operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool exhausted: no connection available in {pool} within {timeout_ms}ms")]
    PoolExhausted { pool: String, timeout_ms: u64 },

    #[error("Unable to create physical connection: {0}")]
    ResourceCreationFailure(#[source] ResourceError),

    #[error("Physical connection failure: {0}")]
    ResourceFailure(#[source] ResourceError),

    #[error("Transaction enlistment failed: {0}")]
    EnlistmentFailure(String),

    #[error("Pool {0} is shut down")]
    Shutdown(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection handle {0} is closed")]
    HandleClosed(u64),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl PoolError {
    /// Returns true if an allocation that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::ResourceCreationFailure(cause) => cause.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error should be logged as a warning rather than an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Shutdown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_retryable_warning() {
        let err = PoolError::PoolExhausted {
            pool: "orders".to_string(),
            timeout_ms: 250,
        };
        assert!(err.is_retryable());
        assert!(err.is_warning());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_creation_failure_follows_cause() {
        let transient = PoolError::ResourceCreationFailure(ResourceError::retryable("refused"));
        let fatal = PoolError::ResourceCreationFailure(ResourceError::new("bad password"));
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_resource_failure_never_retryable() {
        let err = PoolError::ResourceFailure(ResourceError::retryable("reset by peer"));
        assert!(!err.is_retryable());
        assert!(!err.is_warning());
    }
}
