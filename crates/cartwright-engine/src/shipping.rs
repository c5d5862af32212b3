//! # Shipping Method Manager
//!
//! Attaches shipping options to carts, keeps one method per fulfillment
//! profile, and keeps item `has_shipping` flags and free-shipping pricing
//! consistent with the attached methods.
//!
//! ## Price Resolution
//! ```text
//! custom options for cart?
//!   ├── yes ── option_id among them? ── no ──► NotFound
//!   │                                 └─ yes ─► negotiated price
//!   └── no ─── option.amount? ── Some(a) ──► a
//!                             └─ None ────► ShippingOptionService::calculate_price
//!
//! free-shipping discount on cart ──► price = 0, original_price kept
//! ```

use std::sync::Arc;

use cartwright_core::shipping::{
    apply_free_shipping, check_requirements, orphaned_methods, refresh_has_shipping, superseded_methods,
};
use cartwright_core::{new_id, Cart, CustomShippingOption, LineItem, Metadata, Money, ShippingMethod};
use cartwright_db::{LineItemRepository, ShippingMethodRepository};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::error::{CartError, CartResult};
use crate::services::ShippingOptionService;

/// A negotiated price for one shipping option on one cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomShippingOptionInput {
    pub shipping_option_id: String,
    pub price: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

pub struct ShippingMethodManager {
    options: Arc<dyn ShippingOptionService>,
}

impl ShippingMethodManager {
    pub fn new(options: Arc<dyn ShippingOptionService>) -> Self {
        ShippingMethodManager { options }
    }

    /// Attaches `option_id` to the cart, replacing the method of the same
    /// profile. Returns the stored method.
    pub async fn add_shipping_method(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        option_id: &str,
        data: Metadata,
    ) -> CartResult<ShippingMethod> {
        let custom = ShippingMethodRepository::list_custom_options(conn, &cart.id).await?;
        let custom_price = if custom.is_empty() {
            None
        } else {
            let negotiated = custom
                .iter()
                .find(|c| c.shipping_option_id == option_id)
                .ok_or_else(|| CartError::not_found("CustomShippingOption", option_id))?;
            Some(negotiated.price)
        };

        let option = self.options.retrieve(option_id).await?;
        if option.region_id != cart.region_id {
            return Err(CartError::not_allowed(format!(
                "Shipping option {option_id} is not available in region {}",
                cart.region_id
            )));
        }

        let subtotal: Money = cart.items.iter().map(LineItem::subtotal).sum();
        check_requirements(&option, subtotal)?;

        let price = match (custom_price, option.amount) {
            (Some(price), _) => price,
            (None, Some(amount)) => amount,
            (None, None) => self.options.calculate_price(&option, cart, &data).await?,
        };
        if price < 0 {
            return Err(CartError::InvalidData(format!("Shipping option {option_id} has a negative price")));
        }

        let superseded: Vec<String> = superseded_methods(&cart.shipping_methods, option.profile_id.as_deref())
            .into_iter()
            .map(|m| m.id.clone())
            .collect();
        for method_id in &superseded {
            ShippingMethodRepository::delete(conn, method_id).await?;
        }
        cart.shipping_methods.retain(|m| !superseded.contains(&m.id));

        let method = ShippingMethod {
            id: new_id(),
            cart_id: cart.id.clone(),
            shipping_option_id: option.id.clone(),
            name: option.name.clone(),
            profile_id: option.profile_id.clone(),
            price,
            original_price: price,
            is_custom: custom_price.is_some(),
            data,
            tax_lines: Vec::new(),
        };
        ShippingMethodRepository::insert(conn, &method).await?;
        let method_id = method.id.clone();
        cart.shipping_methods.push(method);

        self.adjust_free_shipping(conn, cart).await?;
        self.refresh_item_shipping(conn, cart).await?;

        info!(
            cart_id = %cart.id,
            option_id = %option_id,
            price,
            replaced = superseded.len(),
            "Shipping method added"
        );

        cart.shipping_methods
            .iter()
            .find(|m| m.id == method_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("ShippingMethod", method_id))
    }

    /// Detaches a method. Returns false when it was not on the cart.
    pub async fn remove_shipping_method(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        method_id: &str,
    ) -> CartResult<bool> {
        if !cart.shipping_methods.iter().any(|m| m.id == method_id) {
            return Ok(false);
        }

        ShippingMethodRepository::delete(conn, method_id).await?;
        cart.shipping_methods.retain(|m| m.id != method_id);
        self.refresh_item_shipping(conn, cart).await?;

        info!(cart_id = %cart.id, method_id = %method_id, "Shipping method removed");
        Ok(true)
    }

    /// Stores negotiated prices consulted by [`Self::add_shipping_method`].
    pub async fn create_custom_shipping_options(
        &self,
        conn: &mut SqliteConnection,
        cart: &Cart,
        inputs: Vec<CustomShippingOptionInput>,
    ) -> CartResult<Vec<CustomShippingOption>> {
        let mut created = Vec::with_capacity(inputs.len());

        for input in inputs {
            if input.price < 0 {
                return Err(CartError::InvalidData(format!(
                    "Custom price for {} must not be negative",
                    input.shipping_option_id
                )));
            }
            let option = self.options.retrieve(&input.shipping_option_id).await?;
            if option.region_id != cart.region_id {
                return Err(CartError::not_allowed(format!(
                    "Shipping option {} is not available in region {}",
                    option.id, cart.region_id
                )));
            }

            let custom = CustomShippingOption {
                id: new_id(),
                cart_id: cart.id.clone(),
                shipping_option_id: input.shipping_option_id,
                price: input.price,
                metadata: input.metadata,
            };
            ShippingMethodRepository::insert_custom_option(conn, &custom).await?;
            created.push(custom);
        }

        debug!(cart_id = %cart.id, count = created.len(), "Custom shipping options created");
        Ok(created)
    }

    /// Zeroes or restores method prices to match the free-shipping slot.
    pub async fn adjust_free_shipping(&self, conn: &mut SqliteConnection, cart: &mut Cart) -> CartResult<()> {
        let free_shipping = cart.has_free_shipping();
        let changed = apply_free_shipping(&mut cart.shipping_methods, free_shipping);

        for method in cart.shipping_methods.iter().filter(|m| changed.contains(&m.id)) {
            ShippingMethodRepository::update_price(conn, &method.id, method.price).await?;
        }
        if !changed.is_empty() {
            debug!(cart_id = %cart.id, free_shipping, count = changed.len(), "Shipping prices adjusted");
        }
        Ok(())
    }

    /// Recomputes `has_shipping` on every item and persists the changes.
    pub async fn refresh_item_shipping(&self, conn: &mut SqliteConnection, cart: &mut Cart) -> CartResult<()> {
        let changed = refresh_has_shipping(&mut cart.items, &cart.shipping_methods);
        for item in cart.items.iter().filter(|i| changed.contains(&i.id)) {
            LineItemRepository::update(conn, item).await?;
        }
        Ok(())
    }

    /// Deletes methods that no longer serve any item. Returns how many.
    pub async fn remove_orphaned_methods(&self, conn: &mut SqliteConnection, cart: &mut Cart) -> CartResult<usize> {
        let orphaned: Vec<String> = orphaned_methods(&cart.shipping_methods, &cart.items)
            .into_iter()
            .map(|m| m.id.clone())
            .collect();

        for method_id in &orphaned {
            ShippingMethodRepository::delete(conn, method_id).await?;
        }
        cart.shipping_methods.retain(|m| !orphaned.contains(&m.id));

        if !orphaned.is_empty() {
            info!(cart_id = %cart.id, count = orphaned.len(), "Removed shipping methods without items");
        }
        Ok(orphaned.len())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, InMemoryShippingOptions};
    use cartwright_core::{Discount, DiscountRule, DiscountRuleType, AllocationType};
    use cartwright_db::{CartRepository, Database};
    use chrono::Utc;

    async fn setup() -> (Database, ShippingMethodManager, Cart) {
        let db = testing::database().await;
        let manager = ShippingMethodManager::new(Arc::new(InMemoryShippingOptions::default()));

        let mut cart = Cart::new("reg_us");
        cart.items.push(testing::line_item(&cart.id, "variant_shirt", 1000, 2));
        let mut conn = db.pool().acquire().await.unwrap();
        CartRepository::insert(&mut conn, &cart).await.unwrap();
        LineItemRepository::insert(&mut conn, &cart.items[0]).await.unwrap();
        drop(conn);

        (db, manager, cart)
    }

    fn free_shipping() -> Discount {
        let now = Utc::now();
        Discount {
            id: new_id(),
            code: "FREESHIP".into(),
            is_dynamic: false,
            is_disabled: false,
            parent_discount_id: None,
            rule: DiscountRule {
                id: new_id(),
                rule_type: DiscountRuleType::FreeShipping,
                value: 0,
                allocation: AllocationType::Total,
                description: None,
                conditions: vec![],
            },
            regions: vec!["reg_us".into()],
            starts_at: now,
            ends_at: None,
            usage_limit: None,
            usage_count: 0,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_add_method_replaces_same_profile_and_flags_items() {
        let (db, manager, mut cart) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        manager.add_shipping_method(&mut conn, &mut cart, "so_standard", Metadata::new()).await.unwrap();
        assert!(cart.items[0].has_shipping);

        let express = manager.add_shipping_method(&mut conn, &mut cart, "so_express", Metadata::new()).await.unwrap();
        assert_eq!(cart.shipping_methods.len(), 1);
        assert_eq!(cart.shipping_methods[0].id, express.id);

        let stored = ShippingMethodRepository::list_for_cart(&mut conn, &cart.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].price, 1500);
    }

    #[tokio::test]
    async fn test_option_errors() {
        let (db, manager, mut cart) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let err = manager.add_shipping_method(&mut conn, &mut cart, "so_missing", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));

        let err = manager.add_shipping_method(&mut conn, &mut cart, "so_eu", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));

        // subtotal 2000 is below the 5000 minimum
        let err = manager.add_shipping_method(&mut conn, &mut cart, "so_overnight", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn test_calculated_and_custom_prices() {
        let (db, manager, mut cart) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let calculated = manager.add_shipping_method(&mut conn, &mut cart, "so_calculated", Metadata::new()).await.unwrap();
        assert_eq!(calculated.price, testing::CALCULATED_SHIPPING_PRICE);

        manager
            .create_custom_shipping_options(
                &mut conn,
                &cart,
                vec![CustomShippingOptionInput {
                    shipping_option_id: "so_standard".into(),
                    price: 250,
                    metadata: Metadata::new(),
                }],
            )
            .await
            .unwrap();

        let custom = manager.add_shipping_method(&mut conn, &mut cart, "so_standard", Metadata::new()).await.unwrap();
        assert_eq!(custom.price, 250);
        assert!(custom.is_custom);

        let err = manager.add_shipping_method(&mut conn, &mut cart, "so_express", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_free_shipping_zeroes_and_restores() {
        let (db, manager, mut cart) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        manager.add_shipping_method(&mut conn, &mut cart, "so_standard", Metadata::new()).await.unwrap();
        cart.discounts.push(free_shipping());
        manager.adjust_free_shipping(&mut conn, &mut cart).await.unwrap();
        assert_eq!(cart.shipping_methods[0].price, 0);
        assert_eq!(cart.shipping_methods[0].original_price, 500);

        cart.discounts.clear();
        manager.adjust_free_shipping(&mut conn, &mut cart).await.unwrap();
        let stored = ShippingMethodRepository::list_for_cart(&mut conn, &cart.id).await.unwrap();
        assert_eq!(stored[0].price, 500);
    }

    #[tokio::test]
    async fn test_orphaned_methods_and_removal() {
        let (db, manager, mut cart) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let method = manager.add_shipping_method(&mut conn, &mut cart, "so_standard", Metadata::new()).await.unwrap();
        assert_eq!(manager.remove_orphaned_methods(&mut conn, &mut cart).await.unwrap(), 0);

        let item_id = cart.items[0].id.clone();
        LineItemRepository::delete(&mut conn, &item_id).await.unwrap();
        cart.items.clear();
        assert_eq!(manager.remove_orphaned_methods(&mut conn, &mut cart).await.unwrap(), 1);
        assert!(!manager.remove_shipping_method(&mut conn, &mut cart, &method.id).await.unwrap());
    }
}
