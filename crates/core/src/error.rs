use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Metrics unavailable for ad {ad_id}: {reason}")]
    MetricsUnavailable { ad_id: String, reason: String },

    #[error("Action execution failed: {0}")]
    ActionExecutionFailed(String),

    #[error("Action {0} is already reverted")]
    AlreadyReverted(Uuid),

    #[error("Action is not revertible: {0}")]
    NotRevertible(String),

    #[error("Stale target: {0}")]
    StaleTarget(String),

    #[error("Rule misconfigured: {0}")]
    RuleMisconfigured(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tier limit exceeded: {0}")]
    TierLimit(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Action log store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Only loss of the action log aborts a whole pass; everything else is
    /// contained to a single (rule, ad) pair.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}

/// Failure reported by an ad-platform collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Rate limited by ad platform")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Unauthorized: platform token rejected")]
    Unauthorized,

    #[error("Entity not found on platform: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Platform API error {code}: {message}")]
    Api { code: i32, message: String },
}

impl PlatformError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PlatformError::RateLimited { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            PlatformError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_fatal() {
        assert!(EngineError::Store("disk gone".into()).is_fatal());
        assert!(!EngineError::ActionExecutionFailed("502".into()).is_fatal());
        assert!(!EngineError::Timeout {
            operation: "metrics".into(),
            timeout_ms: 10
        }
        .is_fatal());
    }

    #[test]
    fn test_platform_error_rate_limit_helpers() {
        let err = PlatformError::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert!(!PlatformError::Unauthorized.is_rate_limited());
        assert_eq!(PlatformError::Unauthorized.retry_after_ms(), None);
    }
}
