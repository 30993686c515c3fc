//! Error types for the settlement engine
//!
//! Typed failures for every engine operation: role and state validation,
//! precondition checks, wallet arithmetic, configuration loading, and the
//! external escrow payment provider.

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// No caller identity was supplied
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller is not a party to the order or has the wrong role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Order, proof, dispute, listing, or wallet missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested transition is invalid from the current status
    #[error("State conflict: cannot {action} from {status}: {reason}")]
    StateConflict {
        status: String,
        action: String,
        reason: String,
    },

    /// A business precondition failed (missing proof, insufficient balance, ...)
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Escrow payment provider error or timeout; the triggering transition
    /// did not commit and the caller may retry
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an unauthenticated error
    pub fn unauthenticated<S: Into<String>>(msg: S) -> Self {
        Self::Unauthenticated(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a state-conflict error
    pub fn state_conflict<S: Into<String>>(status: S, action: S, reason: S) -> Self {
        Self::StateConflict {
            status: status.into(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create a precondition-failed error
    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create an upstream-failure error
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamFailure(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the operation unchanged.
    /// Only provider failures qualify; state and precondition errors are
    /// user-correctable, not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamFailure(_))
    }
}
