//! # Validation Module
//!
//! Input validation for cart operations.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: API surface (out of scope)                                   │
//! │  └── Deserialization, shape checks                                     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  └── Quantities, metadata keys/values, codes, emails, countries        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  └── NOT NULL, UNIQUE, CHECK and foreign key constraints               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use cartwright_core::validation::{validate_quantity, validate_metadata_key};
//!
//! assert!(validate_quantity(5).is_ok());
//! assert!(validate_quantity(0).is_err());
//! assert!(validate_metadata_key("").is_err());
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::{MAX_CART_ITEMS, MAX_ITEM_QUANTITY};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Quantities
// =============================================================================

/// Validates a line item quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates that a cart can accept another distinct line item.
pub fn validate_cart_size(current_items: usize) -> ValidationResult<()> {
    if current_items >= MAX_CART_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 0,
            max: MAX_CART_ITEMS as i64,
        });
    }

    Ok(())
}

/// Validates a monetary amount that must be strictly positive (refunds,
/// gift card values).
pub fn validate_positive_amount(field: &str, amount: i64) -> ValidationResult<()> {
    if amount <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Metadata
// =============================================================================

/// Validates a metadata key.
///
/// ## Rules
/// - Must not be empty or whitespace
/// - At most 100 characters
pub fn validate_metadata_key(key: &str) -> ValidationResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "metadata key".to_string(),
        });
    }

    if key.len() > 100 {
        return Err(ValidationError::TooLong {
            field: "metadata key".to_string(),
            max: 100,
        });
    }

    Ok(())
}

/// Validates a metadata value. Only scalars (string, number, bool, null)
/// are accepted.
pub fn validate_metadata_value(key: &str, value: &Value) -> ValidationResult<()> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(ValidationError::InvalidFormat {
            field: format!("metadata.{key}"),
            reason: "value must be a string, number, boolean or null".to_string(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Identifiers & Codes
// =============================================================================

/// Normalizes and validates a discount or gift card code.
///
/// ## Returns
/// The trimmed, upper-cased code.
///
/// ## Example
/// ```rust
/// use cartwright_core::validation::normalize_code;
///
/// assert_eq!(normalize_code(" summer10 ").unwrap(), "SUMMER10");
/// assert!(normalize_code("  ").is_err());
/// ```
pub fn normalize_code(code: &str) -> ValidationResult<String> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if code.len() > 64 {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: 64,
        });
    }

    if code.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "code".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(code.to_uppercase())
}

/// Validates an ISO 3166-1 alpha-2 country code and returns it lower-cased.
pub fn normalize_country_code(code: &str) -> ValidationResult<String> {
    let code = code.trim();

    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidFormat {
            field: "country_code".to_string(),
            reason: "must be a two-letter country code".to_string(),
        });
    }

    Ok(code.to_lowercase())
}

/// Basic e-mail shape check: one `@` with text on both sides and a dot in
/// the domain part.
pub fn validate_email(email: &str) -> ValidationResult<String> {
    let email = email.trim();

    if email.is_empty() {
        return Err(ValidationError::Required {
            field: "email".to_string(),
        });
    }

    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.contains('@')
        }
        None => false,
    };

    if !valid {
        return Err(ValidationError::InvalidFormat {
            field: "email".to_string(),
            reason: "not a valid e-mail address".to_string(),
        });
    }

    Ok(email.to_lowercase())
}

// =============================================================================
// Unit Tests
// =============================================================================
