//! # Shipping Rules
//!
//! Profile matching between line items and shipping methods, option
//! requirements, and free-shipping pricing.
//!
//! ## Profile Matching
//! ```text
//! LineItem.shipping_profile_id ──┐
//!                                ├── match? ── item.has_shipping = true
//! ShippingMethod.profile_id ─────┘
//!
//! profile_id = None on a method  →  ships every profile
//! ```

use crate::error::CoreError;
use crate::money::Money;
use crate::types::{LineItem, ShippingMethod, ShippingOption, ShippingRequirement};

/// True when `method` can fulfil `item`.
pub fn method_serves_item(method: &ShippingMethod, item: &LineItem) -> bool {
    match (&method.profile_id, &item.shipping_profile_id) {
        (None, _) => true,
        (Some(method_profile), Some(item_profile)) => method_profile == item_profile,
        (Some(_), None) => false,
    }
}

/// A line item is fulfillable if at least one attached method serves it.
pub fn validate_line_item_shipping(methods: &[ShippingMethod], item: &LineItem) -> bool {
    methods.iter().any(|m| method_serves_item(m, item))
}

/// Cart-level validity: every item is fulfillable.
pub fn cart_is_fulfillable(methods: &[ShippingMethod], items: &[LineItem]) -> bool {
    items.iter().all(|item| validate_line_item_shipping(methods, item))
}

/// Recomputes `has_shipping` on every item. Returns the ids of items whose
/// flag changed.
pub fn refresh_has_shipping(items: &mut [LineItem], methods: &[ShippingMethod]) -> Vec<String> {
    let mut changed = Vec::new();
    for item in items.iter_mut() {
        let has_shipping = validate_line_item_shipping(methods, item);
        if item.has_shipping != has_shipping {
            item.has_shipping = has_shipping;
            changed.push(item.id.clone());
        }
    }
    changed
}

/// Methods that no longer serve any remaining item.
pub fn orphaned_methods<'a>(methods: &'a [ShippingMethod], items: &[LineItem]) -> Vec<&'a ShippingMethod> {
    methods
        .iter()
        .filter(|m| !items.iter().any(|item| method_serves_item(m, item)))
        .collect()
}

/// Methods a new method with `profile_id` supersedes (one method per
/// fulfillment profile).
pub fn superseded_methods<'a>(
    methods: &'a [ShippingMethod],
    profile_id: Option<&str>,
) -> Vec<&'a ShippingMethod> {
    methods
        .iter()
        .filter(|m| m.profile_id.as_deref() == profile_id)
        .collect()
}

/// Checks an option's subtotal requirements.
///
/// ## Example
/// ```rust
/// use cartwright_core::money::Money;
/// use cartwright_core::shipping::check_requirements;
/// use cartwright_core::types::{ShippingOption, ShippingRequirement};
///
/// let option = ShippingOption {
///     id: "so_express".into(),
///     name: "Express".into(),
///     region_id: "reg_us".into(),
///     profile_id: None,
///     amount: Some(500),
///     requirements: vec![ShippingRequirement::MinSubtotal(1000)],
///     data: Default::default(),
/// };
/// assert!(check_requirements(&option, Money::from_cents(1500)).is_ok());
/// assert!(check_requirements(&option, Money::from_cents(500)).is_err());
/// ```
pub fn check_requirements(option: &ShippingOption, subtotal: Money) -> Result<(), CoreError> {
    for requirement in &option.requirements {
        match *requirement {
            ShippingRequirement::MinSubtotal(min) if subtotal.cents() < min => {
                return Err(CoreError::ShippingRequirementNotMet {
                    option_id: option.id.clone(),
                    reason: format!("subtotal must be at least {}", Money::from_cents(min)),
                });
            }
            ShippingRequirement::MaxSubtotal(max) if subtotal.cents() > max => {
                return Err(CoreError::ShippingRequirementNotMet {
                    option_id: option.id.clone(),
                    reason: format!("subtotal must be at most {}", Money::from_cents(max)),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Zeroes method prices when `free_shipping` is set, restores the original
/// price otherwise. Returns the ids of methods whose price changed.
pub fn apply_free_shipping(methods: &mut [ShippingMethod], free_shipping: bool) -> Vec<String> {
    let mut changed = Vec::new();
    for method in methods.iter_mut() {
        let target = if free_shipping { 0 } else { method.original_price };
        if method.price != target {
            method.price = target;
            changed.push(method.id.clone());
        }
    }
    changed
}

// =============================================================================
// Unit Tests
// =============================================================================
