//! # Discount Math
//!
//! Eligibility checks and line-item adjustments for discount rules.
//!
//! ## Rule Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  percentage     value = bps of each eligible item's subtotal           │
//! │                 1000 bps on 2 × 1000  →  200                           │
//! │                                                                         │
//! │  fixed/total    value spread over eligible items by subtotal share,    │
//! │                 capped at the eligible subtotal, remainder on last     │
//! │                                                                         │
//! │  fixed/item     value × quantity per eligible item, capped per item    │
//! │                                                                         │
//! │  free_shipping  no adjustments; shipping prices are zeroed instead     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An item is eligible when it allows discounts and passes every product
//! condition (products, types, collections, tags) of the rule.
//! Customer-group conditions apply to the cart as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::money::{Money, RoundingPolicy};
use crate::types::{
    new_id, Discount, DiscountConditionType, DiscountRule, DiscountRuleType, LineItem,
    LineItemAdjustment, AllocationType,
};

// =============================================================================
// Rejections
// =============================================================================

/// Reasons a discount cannot be used on a cart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscountRejection {
    #[error("The discount code is disabled")]
    Disabled,

    #[error("The discount is not valid yet")]
    NotStarted,

    #[error("The discount is expired")]
    Expired,

    #[error("Discount has been used maximum allowed times")]
    UsageLimitReached,

    #[error("The discount is not available in the current region")]
    RegionNotAllowed,

    #[error("Discount is not valid for the current customer")]
    CustomerNotEligible,

    #[error("Discount {code} is not valid for any of the cart items")]
    NoEligibleItems { code: String },
}

/// Checks the cart-independent validity of a discount at `now` in `region_id`.
///
/// ## Checks (in order)
/// 1. not disabled
/// 2. `starts_at <= now`
/// 3. `ends_at` (if any) is in the future
/// 4. usage limit not reached
/// 5. region is in the allowed set
pub fn check_validity(
    discount: &Discount,
    region_id: &str,
    now: DateTime<Utc>,
) -> Result<(), DiscountRejection> {
    if discount.is_disabled {
        return Err(DiscountRejection::Disabled);
    }

    if discount.starts_at > now {
        return Err(DiscountRejection::NotStarted);
    }

    if let Some(ends_at) = discount.ends_at {
        if ends_at <= now {
            return Err(DiscountRejection::Expired);
        }
    }

    if let Some(limit) = discount.usage_limit {
        if discount.usage_count >= limit {
            return Err(DiscountRejection::UsageLimitReached);
        }
    }

    if !discount.regions.iter().any(|r| r == region_id) {
        return Err(DiscountRejection::RegionNotAllowed);
    }

    Ok(())
}

// =============================================================================
// Conditions
// =============================================================================

/// True when the rule restricts which products it applies to.
pub fn has_product_conditions(rule: &DiscountRule) -> bool {
    rule.conditions
        .iter()
        .any(|c| c.condition_type != DiscountConditionType::CustomerGroups)
}

/// True when the rule restricts which customers may use it.
pub fn has_customer_conditions(rule: &DiscountRule) -> bool {
    rule.conditions
        .iter()
        .any(|c| c.condition_type == DiscountConditionType::CustomerGroups)
}

/// Evaluates the rule's product conditions against one line item.
pub fn item_matches_conditions(rule: &DiscountRule, item: &LineItem) -> bool {
    rule.conditions.iter().all(|condition| {
        let subject: Vec<String> = match condition.condition_type {
            DiscountConditionType::Products => item.product_id.iter().cloned().collect(),
            DiscountConditionType::ProductTypes => item.product_type_id.iter().cloned().collect(),
            DiscountConditionType::ProductCollections => {
                item.product_collection_id.iter().cloned().collect()
            }
            DiscountConditionType::ProductTags => item.product_tag_ids.clone(),
            DiscountConditionType::CustomerGroups => return true,
        };
        condition.matches(&subject)
    })
}

/// Evaluates the rule's customer-group conditions against a customer's groups.
pub fn customer_matches_conditions(rule: &DiscountRule, group_ids: &[String]) -> bool {
    rule.conditions
        .iter()
        .filter(|c| c.condition_type == DiscountConditionType::CustomerGroups)
        .all(|c| c.matches(group_ids))
}

/// Items the discount can adjust.
pub fn eligible_items<'a>(rule: &DiscountRule, items: &'a [LineItem]) -> Vec<&'a LineItem> {
    items
        .iter()
        .filter(|item| item.allow_discounts && item_matches_conditions(rule, item))
        .collect()
}

/// Checks that a conditional, non-free-shipping rule hits at least one item.
pub fn check_items_eligible(discount: &Discount, items: &[LineItem]) -> Result<(), DiscountRejection> {
    if discount.is_free_shipping() || !has_product_conditions(&discount.rule) {
        return Ok(());
    }

    if eligible_items(&discount.rule, items).is_empty() {
        return Err(DiscountRejection::NoEligibleItems {
            code: discount.code.clone(),
        });
    }

    Ok(())
}

/// Resource lists of a condition-upsert payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionResources {
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub product_collections: Vec<String>,
    #[serde(default)]
    pub product_types: Vec<String>,
    #[serde(default)]
    pub product_tags: Vec<String>,
    #[serde(default)]
    pub customer_groups: Vec<String>,
}

/// Picks the condition type of an upsert payload.
///
/// The first non-empty list wins, in the order: products,
/// product_collections, product_types, product_tags, customer_groups.
///
/// ## Example
/// ```rust
/// use cartwright_core::discount::{resolve_condition_type, ConditionResources};
/// use cartwright_core::types::DiscountConditionType;
///
/// let data = ConditionResources {
///     product_tags: vec!["tag_sale".into()],
///     customer_groups: vec!["vip".into()],
///     ..Default::default()
/// };
/// let (kind, ids) = resolve_condition_type(&data).unwrap();
/// assert_eq!(kind, DiscountConditionType::ProductTags);
/// assert_eq!(ids, vec!["tag_sale".to_string()]);
/// ```
pub fn resolve_condition_type(
    data: &ConditionResources,
) -> Result<(DiscountConditionType, Vec<String>), ValidationError> {
    let candidates = [
        (DiscountConditionType::Products, &data.products),
        (DiscountConditionType::ProductCollections, &data.product_collections),
        (DiscountConditionType::ProductTypes, &data.product_types),
        (DiscountConditionType::ProductTags, &data.product_tags),
        (DiscountConditionType::CustomerGroups, &data.customer_groups),
    ];

    candidates
        .into_iter()
        .find(|(_, ids)| !ids.is_empty())
        .map(|(kind, ids)| (kind, ids.clone()))
        .ok_or_else(|| ValidationError::Required {
            field: "condition resources".to_string(),
        })
}

// =============================================================================
// Adjustments
// =============================================================================

/// Computes the line-item adjustments a discount produces on `items`.
///
/// Amounts never exceed an item's subtotal. Free-shipping rules produce
/// no adjustments.
pub fn calculate_adjustments(
    discount: &Discount,
    items: &[LineItem],
    policy: RoundingPolicy,
) -> Vec<LineItemAdjustment> {
    let rule = &discount.rule;
    let eligible = eligible_items(rule, items);
    if eligible.is_empty() || rule.value <= 0 {
        return Vec::new();
    }

    let amounts: Vec<(&LineItem, Money)> = match (rule.rule_type, rule.allocation) {
        (DiscountRuleType::FreeShipping, _) => return Vec::new(),
        (DiscountRuleType::Percentage, _) => {
            let bps = rule.value.clamp(0, 10_000) as u32;
            eligible
                .iter()
                .map(|item| (*item, item.subtotal().apply_bps(bps, policy)))
                .collect()
        }
        (DiscountRuleType::Fixed, AllocationType::Item) => eligible
            .iter()
            .map(|item| {
                let amount = Money::from_cents(rule.value).multiply_quantity(item.quantity);
                (*item, amount.min(item.subtotal()))
            })
            .collect(),
        (DiscountRuleType::Fixed, AllocationType::Total) => {
            let eligible_subtotal: Money = eligible.iter().map(|i| i.subtotal()).sum();
            let to_spread = Money::from_cents(rule.value).min(eligible_subtotal);
            let mut remaining = to_spread;
            let last = eligible.len() - 1;

            eligible
                .iter()
                .enumerate()
                .map(|(idx, item)| {
                    let share = if idx == last {
                        remaining
                    } else {
                        to_spread
                            .proportion(item.subtotal().cents(), eligible_subtotal.cents(), policy)
                            .min(remaining)
                    };
                    remaining -= share;
                    (*item, share.min(item.subtotal()))
                })
                .collect()
        }
    };

    amounts
        .into_iter()
        .filter(|(_, amount)| amount.is_positive())
        .map(|(item, amount)| LineItemAdjustment {
            id: new_id(),
            item_id: item.id.clone(),
            discount_id: Some(discount.id.clone()),
            description: "discount".to_string(),
            amount: amount.cents(),
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{
        DiscountCondition, DiscountConditionOperator, Metadata,
    };
    use chrono::Duration;

    pub(crate) fn item(id: &str, unit_price: i64, quantity: i64) -> LineItem {
        let now = Utc::now();
        LineItem {
            id: id.to_string(),
            cart_id: "cart".into(),
            variant_id: format!("variant_{id}"),
            product_id: Some(format!("prod_{id}")),
            product_collection_id: None,
            product_type_id: None,
            product_tag_ids: vec![],
            shipping_profile_id: Some("default".into()),
            title: id.to_string(),
            unit_price,
            quantity,
            should_merge: true,
            allow_discounts: true,
            has_shipping: false,
            metadata: Metadata::new(),
            tax_lines: vec![],
            adjustments: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn discount(code: &str, rule_type: DiscountRuleType, value: i64) -> Discount {
        let now = Utc::now();
        Discount {
            id: format!("disc_{code}"),
            code: code.to_string(),
            is_dynamic: false,
            is_disabled: false,
            parent_discount_id: None,
            rule: DiscountRule {
                id: format!("rule_{code}"),
                rule_type,
                value,
                allocation: AllocationType::Total,
                description: None,
                conditions: vec![],
            },
            regions: vec!["reg_us".into()],
            starts_at: now - Duration::days(1),
            ends_at: None,
            usage_limit: None,
            usage_count: 0,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn total(adjustments: &[LineItemAdjustment]) -> i64 {
        adjustments.iter().map(|a| a.amount).sum()
    }

    #[test]
    fn test_percentage_discount() {
        let items = vec![item("a", 1000, 2)];
        let d = discount("TEN", DiscountRuleType::Percentage, 1000);
        let adjustments = calculate_adjustments(&d, &items, RoundingPolicy::HalfUp);
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].amount, 200);
        assert_eq!(adjustments[0].discount_id.as_deref(), Some("disc_TEN"));
    }

    #[test]
    fn test_fixed_total_is_capped_and_spread() {
        let items = vec![item("a", 1000, 1), item("b", 2000, 1)];
        let d = discount("FIX", DiscountRuleType::Fixed, 500);
        let adjustments = calculate_adjustments(&d, &items, RoundingPolicy::HalfUp);
        assert_eq!(total(&adjustments), 500);
        assert_eq!(adjustments[0].amount, 167);
        assert_eq!(adjustments[1].amount, 333);

        let huge = discount("HUGE", DiscountRuleType::Fixed, 10_000);
        let adjustments = calculate_adjustments(&huge, &items, RoundingPolicy::HalfUp);
        assert_eq!(total(&adjustments), 3000);
    }

    #[test]
    fn test_fixed_item_allocation() {
        let items = vec![item("a", 300, 2)];
        let mut d = discount("EACH", DiscountRuleType::Fixed, 200);
        d.rule.allocation = AllocationType::Item;
        let adjustments = calculate_adjustments(&d, &items, RoundingPolicy::HalfUp);
        assert_eq!(total(&adjustments), 400);

        d.rule.value = 500;
        let adjustments = calculate_adjustments(&d, &items, RoundingPolicy::HalfUp);
        assert_eq!(total(&adjustments), 600);
    }

    #[test]
    fn test_free_shipping_has_no_adjustments() {
        let items = vec![item("a", 1000, 1)];
        let d = discount("SHIP", DiscountRuleType::FreeShipping, 0);
        assert!(calculate_adjustments(&d, &items, RoundingPolicy::HalfUp).is_empty());
    }

    #[test]
    fn test_conditions_restrict_items() {
        let items = vec![item("a", 1000, 1), item("b", 1000, 1)];
        let mut d = discount("ONLY_A", DiscountRuleType::Percentage, 5000);
        d.rule.conditions.push(DiscountCondition {
            id: "cond".into(),
            rule_id: d.rule.id.clone(),
            condition_type: DiscountConditionType::Products,
            operator: DiscountConditionOperator::In,
            resource_ids: vec!["prod_a".into()],
        });

        let adjustments = calculate_adjustments(&d, &items, RoundingPolicy::HalfUp);
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].item_id, "a");
        assert!(check_items_eligible(&d, &items).is_ok());
        assert!(matches!(
            check_items_eligible(&d, &items[1..]),
            Err(DiscountRejection::NoEligibleItems { .. })
        ));
    }

    #[test]
    fn test_items_not_allowing_discounts_are_skipped() {
        let mut items = vec![item("a", 1000, 1)];
        items[0].allow_discounts = false;
        let d = discount("TEN", DiscountRuleType::Percentage, 1000);
        assert!(calculate_adjustments(&d, &items, RoundingPolicy::HalfUp).is_empty());
    }

    #[test]
    fn test_validity_checks() {
        let now = Utc::now();
        let mut d = discount("TEN", DiscountRuleType::Percentage, 1000);
        assert!(check_validity(&d, "reg_us", now).is_ok());
        assert_eq!(
            check_validity(&d, "reg_eu", now),
            Err(DiscountRejection::RegionNotAllowed)
        );

        d.usage_limit = Some(1);
        d.usage_count = 1;
        assert_eq!(
            check_validity(&d, "reg_us", now),
            Err(DiscountRejection::UsageLimitReached)
        );

        d.usage_limit = None;
        d.ends_at = Some(now - Duration::hours(1));
        assert_eq!(check_validity(&d, "reg_us", now), Err(DiscountRejection::Expired));

        d.ends_at = None;
        d.starts_at = now + Duration::hours(1);
        assert_eq!(check_validity(&d, "reg_us", now), Err(DiscountRejection::NotStarted));

        d.is_disabled = true;
        assert_eq!(check_validity(&d, "reg_us", now), Err(DiscountRejection::Disabled));
    }

    #[test]
    fn test_customer_group_conditions() {
        let mut d = discount("VIP", DiscountRuleType::Percentage, 1000);
        assert!(!has_customer_conditions(&d.rule));
        d.rule.conditions.push(DiscountCondition {
            id: "cond".into(),
            rule_id: d.rule.id.clone(),
            condition_type: DiscountConditionType::CustomerGroups,
            operator: DiscountConditionOperator::In,
            resource_ids: vec!["vip".into()],
        });

        assert!(has_customer_conditions(&d.rule));
        assert!(!has_product_conditions(&d.rule));
        assert!(customer_matches_conditions(&d.rule, &["vip".to_string()]));
        assert!(!customer_matches_conditions(&d.rule, &[]));
        assert!(item_matches_conditions(&d.rule, &item("a", 100, 1)));
    }

    #[test]
    fn test_resolve_condition_type_priority_and_empty() {
        let data = ConditionResources {
            products: vec!["p".into()],
            product_collections: vec!["c".into()],
            ..Default::default()
        };
        assert_eq!(
            resolve_condition_type(&data).unwrap().0,
            DiscountConditionType::Products
        );

        let data = ConditionResources {
            product_types: vec!["t".into()],
            customer_groups: vec!["g".into()],
            ..Default::default()
        };
        assert_eq!(
            resolve_condition_type(&data).unwrap().0,
            DiscountConditionType::ProductTypes
        );

        assert!(resolve_condition_type(&ConditionResources::default()).is_err());
    }
}
