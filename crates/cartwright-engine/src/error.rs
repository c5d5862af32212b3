//! # Engine Error Types
//!
//! ## Error Kinds
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CartError                                       │
//! │                                                                         │
//! │  Caller input          State               Store / providers           │
//! │  ─────────────         ─────               ──────────────────          │
//! │  InvalidArgument       NotAllowed          Db(DbError)                 │
//! │  InvalidData           NotFound            Provider(ProviderError)     │
//! │                        Duplicate           Config                      │
//! │                                                                         │
//! │  Only Db(DbError::Conflict) is retried by run_transactionally.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use cartwright_core::{CoreError, ValidationError};
use cartwright_db::{DbError, TransactionError};
use thiserror::Error;

/// Result type alias for engine operations.
pub type CartResult<T> = Result<T, CartError>;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum CartError {
    /// Entity absent.
    #[error("{entity} with id {id} was not found")]
    NotFound { entity: String, id: String },

    /// Malformed or incomplete caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Input that is well formed but not acceptable.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Operation invalid for the current state.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// Uniqueness violation surfaced from the store.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Store failure. `DbError::Conflict` is retryable.
    #[error("Database error: {0}")]
    Db(DbError),

    /// Payment provider failure, propagated unchanged.
    #[error("Payment provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Engine configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CartError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CartError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        CartError::NotAllowed(message.into())
    }

    pub fn completed(cart_id: &str) -> Self {
        CartError::NotAllowed(format!("Cart {cart_id} is completed and cannot be modified"))
    }
}

/// Errors reported by payment provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider id is not registered.
    #[error("Payment provider {0} is not registered")]
    UnknownProvider(String),

    /// The provider has no record of the session or payment.
    #[error("Payment session not found at provider")]
    SessionNotFound,

    /// The operation already happened at the provider (e.g. a repeated capture).
    #[error("Payment already succeeded")]
    AlreadySucceeded,

    /// The provider declined the operation.
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Conversions
// =============================================================================

/// ```text
/// DbError::NotFound        → CartError::NotFound
/// DbError::UniqueViolation → CartError::Duplicate
/// everything else          → CartError::Db
/// ```
impl From<DbError> for CartError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => CartError::NotFound { entity, id },
            DbError::UniqueViolation { field, value } => {
                CartError::Duplicate(format!("{field} '{value}' already exists"))
            }
            other => CartError::Db(other),
        }
    }
}

impl From<ValidationError> for CartError {
    fn from(err: ValidationError) -> Self {
        if err.is_missing() {
            CartError::InvalidArgument(err.to_string())
        } else {
            CartError::InvalidData(err.to_string())
        }
    }
}

impl From<CoreError> for CartError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => v.into(),
            other => CartError::NotAllowed(other.to_string()),
        }
    }
}

impl TransactionError for CartError {
    fn is_transaction_conflict(&self) -> bool {
        matches!(self, CartError::Db(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_mapping() {
        let err: CartError = DbError::not_found("Cart", "c1").into();
        assert!(matches!(err, CartError::NotFound { ref id, .. } if id == "c1"));

        let err: CartError = DbError::duplicate("code", "TEN").into();
        assert!(matches!(err, CartError::Duplicate(_)));

        let err: CartError = DbError::Conflict("busy".into()).into();
        assert!(err.is_transaction_conflict());

        let err: CartError = DbError::QueryFailed("syntax".into()).into();
        assert!(!err.is_transaction_conflict());
    }

    #[test]
    fn test_validation_mapping() {
        let err: CartError = ValidationError::Required { field: "key".into() }.into();
        assert!(matches!(err, CartError::InvalidArgument(_)));

        let err: CartError = ValidationError::InvalidFormat {
            field: "country_code".into(),
            reason: "bad".into(),
        }
        .into();
        assert!(matches!(err, CartError::InvalidData(_)));
    }

    #[test]
    fn test_core_errors_are_not_allowed() {
        let err: CartError = CoreError::RefundExceedsBalance { requested: 10, refundable: 5 }.into();
        assert!(matches!(err, CartError::NotAllowed(_)));
        assert!(!CartError::completed("c1").is_transaction_conflict());
    }
}
