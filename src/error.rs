//! Error types for capwarden

use thiserror::Error;

/// Every failure an authorization or management operation can surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapError {
    /// Malformed principal, resource, action, amount or an empty action set.
    #[error("validation error: {0}")]
    Validation(String),

    /// The actor lacks the capability the operation requires.
    #[error("{actor} is not authorized to {action} on {resource}")]
    Unauthorized {
        actor: String,
        action: String,
        resource: String,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// A state machine transition out of a terminal state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A usage ceiling would be exceeded.
    #[error("quota exceeded on capability {capability_id} ({usage_type}, {period}): {remaining} remaining of {limit}")]
    QuotaExceeded {
        capability_id: String,
        usage_type: String,
        period: String,
        limit: f64,
        remaining: f64,
    },

    /// The persistence layer could not serve the request. Verification treats
    /// this as deny.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored data violates a structural invariant (cycle, undecodable row).
    #[error("data integrity error: {0}")]
    Integrity(String),
}

impl CapError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CapError::NotFound { kind, id: id.into() }
    }

    /// Whether an embedding system may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CapError::StoreUnavailable(_))
    }
}

/// Result type alias for capwarden operations
pub type Result<T> = std::result::Result<T, CapError>;

/// Convert a storage-layer error to `CapError::StoreUnavailable`
pub(crate) fn store_err<E: std::error::Error>(e: E) -> CapError {
    CapError::StoreUnavailable(e.to_string())
}

/// Convert a row codec error to `CapError::Integrity`
pub(crate) fn codec_err(e: serde_json::Error) -> CapError {
    CapError::Integrity(format!("undecodable row: {}", e))
}
