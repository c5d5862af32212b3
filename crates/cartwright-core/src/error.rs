//! # Error Types
//!
//! Domain-specific error types for cartwright-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cartwright-core errors (this file)                                    │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  cartwright-db errors (separate crate)                                 │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  cartwright-engine errors                                              │
//! │  └── CartError        - NotFound / InvalidData / NotAllowed / ...      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → CartError → caller               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Variant cannot cover the requested quantity.
    ///
    /// ## When This Occurs
    /// - Variant manages inventory, does not allow backorders, and the
    ///   requested line quantity exceeds `inventory_quantity`
    #[error("Variant {variant_id} does not have the required inventory: available {available}, requested {requested}")]
    InsufficientInventory {
        variant_id: String,
        available: i64,
        requested: i64,
    },

    /// Cart has exceeded maximum allowed line items.
    #[error("Cart cannot have more than {max} line items")]
    CartTooLarge { max: usize },

    /// A shipping option's requirement (min/max subtotal) is not satisfied.
    #[error("Shipping option {option_id} is not available for this cart: {reason}")]
    ShippingRequirementNotMet { option_id: String, reason: String },

    /// Requested refund is larger than what the payments can give back.
    #[error("Refund amount {requested} exceeds refundable balance {refundable}")]
    RefundExceedsBalance { requested: i64, refundable: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., non-scalar metadata value, bad country code).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Returns true when the caller omitted something rather than sent
    /// something malformed.
    pub fn is_missing(&self) -> bool {
        matches!(self, ValidationError::Required { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::RefundExceedsBalance {
            requested: 500,
            refundable: 300,
        };
        assert_eq!(
            err.to_string(),
            "Refund amount 500 exceeds refundable balance 300"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "region_id".to_string(),
        };
        assert_eq!(err.to_string(), "region_id is required");
        assert!(err.is_missing());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::MustBePositive {
            field: "quantity".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
