//! Error taxonomy for the cognitive substrate.

use thiserror::Error;

/// Main error type surfaced by every subsystem.
#[derive(Debug, Error)]
pub enum CortexError {
    /// A mutating operation named an entity that does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The rule engine denied a data operation.
    #[error("operation '{operation}' on '{table}' denied by rule {rule_id}: {reason}")]
    RuleDenied {
        operation: String,
        table: String,
        rule_id: i64,
        reason: String,
    },

    /// A policy or quota check rejected an operation.
    #[error("quota exceeded for policy '{policy}': {reason}")]
    QuotaExceeded { policy: String, reason: String },

    /// Optimistic-lock or transaction-retry exhaustion.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The underlying database or vector backend failed.
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// An internal assertion failed (dimension mismatch, malformed metadata).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Metadata or entity codec failure at the storage boundary.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for CortexError {
    fn from(error: rusqlite::Error) -> Self {
        CortexError::Backend(error.to_string())
    }
}

impl From<serde_json::Error> for CortexError {
    fn from(error: serde_json::Error) -> Self {
        CortexError::Serialization(error.to_string())
    }
}

/// Result alias used throughout the crate.
pub type CortexResult<T> = Result<T, CortexError>;

impl CortexError {
    /// Shorthand for the common not-found construction.
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        CortexError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
