//! Core error kinds shared by every DTSN service.
//!
//! Each variant maps to a stable wire code so the HTTP surface can return
//! the same `code` strings regardless of which subsystem rejected the
//! request.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Rejected input (malformed address, bad URI, bad payload shape).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Uniqueness violation (address or URI already registered).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A configured hard cap was reached.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Bad HMAC. Reported to callers under the invalid-argument code.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Node version below the configured minimum.
    #[error("upgrade required: {0}")]
    UpgradeRequired(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator (bus, store, token service) is unreachable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Retryable failure inside a mutation critical section.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Misconfiguration; the process cannot make progress.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Stable wire code string for the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) | CoreError::AuthFailure(_) => "InvalidArgumentError",
            CoreError::Conflict(_) => "ConflictError",
            CoreError::CapacityExceeded(_) => "ForbiddenError",
            CoreError::UpgradeRequired(_) => "UpgradeRequiredError",
            CoreError::NotFound(_) => "NotFoundError",
            CoreError::DependencyUnavailable(_)
            | CoreError::Transient(_)
            | CoreError::Fatal(_) => "InternalServerError",
        }
    }

    /// True when a bounded-backoff retry is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::DependencyUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Validation("x".into()).code(), "InvalidArgumentError");
        assert_eq!(CoreError::Conflict("x".into()).code(), "ConflictError");
        assert_eq!(CoreError::CapacityExceeded("x".into()).code(), "ForbiddenError");
        assert_eq!(CoreError::UpgradeRequired("x".into()).code(), "UpgradeRequiredError");
        assert_eq!(CoreError::NotFound("x".into()).code(), "NotFoundError");
        assert_eq!(CoreError::Transient("x".into()).code(), "InternalServerError");
    }

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::Transient("t".into()).is_retryable());
        assert!(CoreError::DependencyUnavailable("d".into()).is_retryable());
        assert!(!CoreError::Validation("v".into()).is_retryable());
        assert!(!CoreError::Fatal("f".into()).is_retryable());
    }
}
