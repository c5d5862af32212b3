//! # Discount Engine
//!
//! Discount administration, condition upserts, and the per-cart
//! eligibility and slot logic.
//!
//! ## Discount Slots
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Cart.discounts                                                         │
//! │                                                                         │
//! │   regular slot         percentage / fixed     replaced on apply        │
//! │   free-shipping slot   free_shipping          independent of regular   │
//! │                                                                         │
//! │  Applying TEN then FIVEOFF leaves [FIVEOFF].                           │
//! │  Applying TEN then FREESHIP leaves [TEN, FREESHIP].                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Validation Order
//! 1. code exists (`NotFound`)
//! 2. enabled, started, not expired, under usage limit, region allowed
//! 3. customer-group conditions hold for the cart's customer
//! 4. a conditional regular rule hits at least one cart item
//!
//! Failures in 2-4 are `NotAllowed`.

use std::sync::Arc;

use cartwright_core::discount::{
    calculate_adjustments, check_items_eligible, check_validity, customer_matches_conditions,
    has_customer_conditions, resolve_condition_type, ConditionResources, DiscountRejection,
};
use cartwright_core::validation::{normalize_code, validate_positive_amount};
use cartwright_core::{
    new_id, AllocationType, Cart, Discount, DiscountCondition, DiscountConditionOperator, DiscountRule,
    DiscountRuleType, Metadata, RoundingPolicy,
};
use cartwright_db::{
    run_transactionally, CartRepository, Database, DbError, DiscountRepository, LineItemRepository,
    TransactionOptions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::error::{CartError, CartResult};
use crate::services::CustomerService;

// =============================================================================
// Inputs
// =============================================================================

/// A condition supplied together with a new discount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionInput {
    pub operator: DiscountConditionOperator,
    #[serde(flatten)]
    pub resources: ConditionResources,
}

/// Payload for [`DiscountEngine::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDiscountInput {
    pub code: String,
    pub rule_type: DiscountRuleType,
    /// Basis points for percentage rules, minor units for fixed rules.
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub allocation: AllocationType,
    pub description: Option<String>,
    pub regions: Vec<String>,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub is_disabled: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ConditionInput>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Payload for [`DiscountEngine::upsert_condition`]. Without `id` a new
/// condition is created; with `id` its resources are replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertConditionInput {
    pub id: Option<String>,
    pub rule_id: String,
    pub operator: DiscountConditionOperator,
    #[serde(flatten)]
    pub resources: ConditionResources,
}

fn rejected(rejection: DiscountRejection) -> CartError {
    CartError::NotAllowed(rejection.to_string())
}

fn condition_from(
    rule_id: &str,
    operator: DiscountConditionOperator,
    resources: &ConditionResources,
) -> CartResult<DiscountCondition> {
    let (condition_type, resource_ids) =
        resolve_condition_type(resources).map_err(|e| CartError::InvalidData(e.to_string()))?;
    Ok(DiscountCondition {
        id: new_id(),
        rule_id: rule_id.to_string(),
        condition_type,
        operator,
        resource_ids,
    })
}

// =============================================================================
// Engine
// =============================================================================

pub struct DiscountEngine {
    db: Database,
    tx_options: TransactionOptions,
    customers: Arc<dyn CustomerService>,
    rounding: RoundingPolicy,
}

impl DiscountEngine {
    pub fn new(
        db: Database,
        tx_options: TransactionOptions,
        customers: Arc<dyn CustomerService>,
        rounding: RoundingPolicy,
    ) -> Self {
        DiscountEngine {
            db,
            tx_options,
            customers,
            rounding,
        }
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    /// Creates a discount with its rule, regions and conditions.
    pub async fn create(&self, input: CreateDiscountInput) -> CartResult<Discount> {
        let discount = Self::build(input)?;

        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| {
            let discount = discount.clone();
            async move {
                let result = DiscountRepository::insert(&mut *tx, &discount)
                    .await
                    .map(|()| discount)
                    .map_err(CartError::from);
                (tx, result)
            }
        })
        .await
        .inspect(|d| info!(discount_id = %d.id, code = %d.code, "Discount created"))
    }

    fn build(input: CreateDiscountInput) -> CartResult<Discount> {
        let code = normalize_code(&input.code)?;

        if input.regions.is_empty() {
            return Err(CartError::InvalidArgument("Discount must have at least one region".into()));
        }

        match input.rule_type {
            DiscountRuleType::Percentage => {
                if !(1..=10_000).contains(&input.value) {
                    return Err(CartError::InvalidData(
                        "Percentage discounts must be between 1 and 10000 basis points".into(),
                    ));
                }
            }
            DiscountRuleType::Fixed => {
                validate_positive_amount("value", input.value)?;
                if input.regions.len() > 1 {
                    return Err(CartError::InvalidData("Fixed discounts can have one region".into()));
                }
            }
            DiscountRuleType::FreeShipping => {}
        }

        if let (Some(starts_at), Some(ends_at)) = (input.starts_at, input.ends_at) {
            if ends_at <= starts_at {
                return Err(CartError::InvalidData("ends_at must be after starts_at".into()));
            }
        }

        let rule_id = new_id();
        let conditions = input
            .conditions
            .iter()
            .map(|c| condition_from(&rule_id, c.operator, &c.resources))
            .collect::<CartResult<Vec<_>>>()?;

        let now = Utc::now();
        Ok(Discount {
            id: new_id(),
            code,
            is_dynamic: input.is_dynamic,
            is_disabled: input.is_disabled,
            parent_discount_id: None,
            rule: DiscountRule {
                id: rule_id,
                rule_type: input.rule_type,
                value: if input.rule_type == DiscountRuleType::FreeShipping { 0 } else { input.value },
                allocation: input.allocation,
                description: input.description,
                conditions,
            },
            regions: input.regions,
            starts_at: input.starts_at.unwrap_or(now),
            ends_at: input.ends_at,
            usage_limit: input.usage_limit,
            usage_count: 0,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// Creates a child code of a dynamic discount. The child shares the
    /// parent's rule and regions and has its own usage counter.
    pub async fn create_dynamic_code(
        &self,
        parent_id: &str,
        code: &str,
        usage_limit: Option<i64>,
    ) -> CartResult<Discount> {
        let code = normalize_code(code)?;

        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| {
            let code = code.clone();
            async move {
                let result = Self::create_dynamic_code_in(&mut *tx, parent_id, code, usage_limit).await;
                (tx, result)
            }
        })
        .await
        .inspect(|d| info!(parent_id = %parent_id, code = %d.code, "Dynamic discount code created"))
    }

    async fn create_dynamic_code_in(
        conn: &mut SqliteConnection,
        parent_id: &str,
        code: String,
        usage_limit: Option<i64>,
    ) -> CartResult<Discount> {
        let parent = DiscountRepository::get(conn, parent_id)
            .await?
            .ok_or_else(|| CartError::not_found("Discount", parent_id))?;
        if !parent.is_dynamic {
            return Err(CartError::not_allowed(format!(
                "Discount {} must be dynamic to create codes",
                parent.code
            )));
        }

        let now = Utc::now();
        let child = Discount {
            id: new_id(),
            code,
            is_dynamic: true,
            is_disabled: false,
            parent_discount_id: Some(parent.id.clone()),
            rule: parent.rule.clone(),
            regions: parent.regions.clone(),
            starts_at: now,
            ends_at: parent.ends_at,
            usage_limit,
            usage_count: 0,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        };
        DiscountRepository::insert(conn, &child).await?;
        Ok(child)
    }

    pub async fn retrieve_by_code(&self, code: &str) -> CartResult<Discount> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        DiscountRepository::get_by_code(&mut conn, code)
            .await?
            .ok_or_else(|| CartError::not_found("Discount", code))
    }

    /// Creates or updates a discount condition.
    ///
    /// The condition type is the first non-empty resource list. A second
    /// condition with the same rule, type and operator is `Duplicate`.
    pub async fn upsert_condition(&self, input: UpsertConditionInput) -> CartResult<DiscountCondition> {
        let candidate = condition_from(&input.rule_id, input.operator, &input.resources)?;

        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| {
            let candidate = candidate.clone();
            let id = input.id.clone();
            async move {
                let result = Self::upsert_condition_in(&mut *tx, id, candidate).await;
                (tx, result)
            }
        })
        .await
    }

    async fn upsert_condition_in(
        conn: &mut SqliteConnection,
        id: Option<String>,
        candidate: DiscountCondition,
    ) -> CartResult<DiscountCondition> {
        match id {
            Some(id) => {
                let mut existing = DiscountRepository::get_condition(conn, &id)
                    .await?
                    .ok_or_else(|| CartError::not_found("DiscountCondition", &id))?;
                DiscountRepository::replace_condition_resources(conn, &id, &candidate.resource_ids).await?;
                existing.resource_ids = candidate.resource_ids;
                debug!(condition_id = %id, "Discount condition resources replaced");
                Ok(existing)
            }
            None => {
                DiscountRepository::insert_condition(conn, &candidate).await?;
                debug!(condition_id = %candidate.id, "Discount condition created");
                Ok(candidate)
            }
        }
    }

    /// Deletes a condition. Returns false when it did not exist.
    pub async fn delete_condition(&self, condition_id: &str) -> CartResult<bool> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = DiscountRepository::delete_condition(&mut *tx, condition_id)
                .await
                .map_err(CartError::from);
            (tx, result)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Cart-level operations (run inside the caller's transaction)
    // -------------------------------------------------------------------------

    /// Checks customer-group conditions. No customer means false.
    pub async fn can_apply_for_customer(&self, rule: &DiscountRule, customer_id: Option<&str>) -> CartResult<bool> {
        let Some(customer_id) = customer_id else {
            return Ok(false);
        };
        let customer = self.customers.retrieve(customer_id).await?;
        Ok(customer_matches_conditions(rule, &customer.group_ids))
    }

    /// Full eligibility of `discount` on `cart` right now.
    pub async fn validate_for_cart(&self, discount: &Discount, cart: &Cart) -> CartResult<()> {
        check_validity(discount, &cart.region_id, Utc::now()).map_err(rejected)?;

        if has_customer_conditions(&discount.rule)
            && !self
                .can_apply_for_customer(&discount.rule, cart.customer_id.as_deref())
                .await?
        {
            return Err(rejected(DiscountRejection::CustomerNotEligible));
        }

        check_items_eligible(discount, &cart.items).map_err(rejected)
    }

    /// Applies `code` to the cart, replacing whatever occupied the same slot.
    pub async fn apply_discount(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        code: &str,
    ) -> CartResult<Discount> {
        let discount = DiscountRepository::get_by_code(conn, code)
            .await?
            .ok_or_else(|| CartError::not_found("Discount", code))?;

        self.validate_for_cart(&discount, cart).await?;

        let free_shipping = discount.is_free_shipping();
        let replaced: Vec<String> = cart
            .discounts
            .iter()
            .filter(|d| d.is_free_shipping() == free_shipping && d.id != discount.id)
            .map(|d| d.id.clone())
            .collect();
        for discount_id in &replaced {
            CartRepository::remove_discount(conn, &cart.id, discount_id).await?;
        }
        CartRepository::add_discount(conn, &cart.id, &discount.id).await?;

        cart.discounts.retain(|d| d.is_free_shipping() != free_shipping);
        cart.discounts.push(discount.clone());

        info!(cart_id = %cart.id, code = %discount.code, replaced = replaced.len(), "Discount applied");
        Ok(discount)
    }

    /// Detaches `code`. Returns false when it was not applied.
    pub async fn remove_discount(&self, conn: &mut SqliteConnection, cart: &mut Cart, code: &str) -> CartResult<bool> {
        let code = code.trim().to_uppercase();
        let Some(discount_id) = cart.discounts.iter().find(|d| d.code == code).map(|d| d.id.clone()) else {
            return Ok(false);
        };

        CartRepository::remove_discount(conn, &cart.id, &discount_id).await?;
        cart.discounts.retain(|d| d.id != discount_id);
        info!(cart_id = %cart.id, code = %code, "Discount removed");
        Ok(true)
    }

    /// Recomputes the adjustments of the regular discount on every item.
    pub async fn refresh_adjustments(&self, conn: &mut SqliteConnection, cart: &mut Cart) -> CartResult<()> {
        let adjustments = match cart.regular_discount() {
            Some(discount) => calculate_adjustments(discount, &cart.items, self.rounding),
            None => Vec::new(),
        };

        LineItemRepository::replace_adjustments(conn, &cart.id, &adjustments).await?;
        for item in cart.items.iter_mut() {
            item.adjustments = adjustments.iter().filter(|a| a.item_id == item.id).cloned().collect();
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
