//! Line item operations.
//!
//! ```text
//! add_line_item(variant, qty, metadata)
//!   ├── same variant + metadata already in cart ──► quantity += qty
//!   └── otherwise                                ──► new row
//!   then: inventory check, unit price from PriceSelectionStrategy,
//!         refresh derived state
//! ```

use cartwright_core::validation::{validate_cart_size, validate_metadata_key, validate_metadata_value, validate_quantity};
use cartwright_core::{new_id, Cart, CoreError, LineItem, Metadata, Region, Variant};
use cartwright_db::{run_transactionally, LineItemRepository};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::CartAggregate;
use crate::error::{CartError, CartResult};
use crate::events::CartEvent;
use crate::services::PriceContext;

/// A variant and quantity to add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemInput {
    pub variant_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LineItemInput {
    pub fn new(variant_id: impl Into<String>, quantity: i64) -> Self {
        LineItemInput {
            variant_id: variant_id.into(),
            quantity,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddLineItemOptions {
    /// Reject variants whose product is not in the cart's sales channel.
    pub validate_sales_channels: bool,
}

impl Default for AddLineItemOptions {
    fn default() -> Self {
        AddLineItemOptions {
            validate_sales_channels: true,
        }
    }
}

/// Quantity and/or metadata change for an existing line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItemPatch {
    pub quantity: Option<i64>,
    /// Merged key by key into the line's metadata.
    pub metadata: Option<Metadata>,
}

fn ensure_inventory(variant: &Variant, quantity: i64) -> CartResult<()> {
    if variant.can_fulfill(quantity) {
        return Ok(());
    }
    Err(CoreError::InsufficientInventory {
        variant_id: variant.id.clone(),
        available: variant.inventory_quantity,
        requested: quantity,
    }
    .into())
}

impl CartAggregate {
    pub async fn add_line_item(&self, cart_id: &str, input: LineItemInput) -> CartResult<Cart> {
        self.add_line_item_with(cart_id, input, AddLineItemOptions::default()).await
    }

    pub async fn add_line_item_with(
        &self,
        cart_id: &str,
        input: LineItemInput,
        options: AddLineItemOptions,
    ) -> CartResult<Cart> {
        validate_quantity(input.quantity)?;

        let input = &input;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                self.add_line_item_to(&mut *tx, &mut cart, &region, input, options).await?;
                self.refresh(&mut *tx, &mut cart, &region).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Adds or merges one line. Does not refresh derived state.
    pub(super) async fn add_line_item_to(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        region: &Region,
        input: &LineItemInput,
        options: AddLineItemOptions,
    ) -> CartResult<()> {
        validate_quantity(input.quantity)?;
        let variant = self.services.variants.retrieve(&input.variant_id).await?;

        if options.validate_sales_channels && self.features.sales_channels {
            if let Some(channel) = &cart.sales_channel_id {
                if !variant.product.sales_channel_ids.contains(channel) {
                    return Err(CartError::InvalidData(format!(
                        "The product {} must belong to the sales channel {channel} on the cart",
                        variant.product.title
                    )));
                }
            }
        }

        let existing = cart
            .items
            .iter()
            .position(|item| item.merges_with(&variant.id, &input.metadata));

        match existing {
            Some(index) => {
                let quantity = cart.items[index].quantity + input.quantity;
                validate_quantity(quantity)?;
                ensure_inventory(&variant, quantity)?;
                let unit_price = self.unit_price(cart, region, &variant, quantity).await?;

                let item = &mut cart.items[index];
                item.quantity = quantity;
                item.unit_price = unit_price;
                item.updated_at = Utc::now();
                LineItemRepository::update(conn, item).await?;
                debug!(cart_id = %cart.id, item_id = %item.id, quantity, "Merged into existing line item");
            }
            None => {
                validate_cart_size(cart.items.len())?;
                ensure_inventory(&variant, input.quantity)?;
                let unit_price = self.unit_price(cart, region, &variant, input.quantity).await?;

                let item = Self::line_item_for(cart, &variant, unit_price, input);
                LineItemRepository::insert(conn, &item).await?;
                info!(cart_id = %cart.id, variant_id = %variant.id, quantity = input.quantity, "Line item added");
                cart.items.push(item);
            }
        }

        Ok(())
    }

    fn line_item_for(cart: &Cart, variant: &Variant, unit_price: i64, input: &LineItemInput) -> LineItem {
        let now = Utc::now();
        let product = &variant.product;
        LineItem {
            id: new_id(),
            cart_id: cart.id.clone(),
            variant_id: variant.id.clone(),
            product_id: Some(product.id.clone()),
            product_collection_id: product.collection_id.clone(),
            product_type_id: product.type_id.clone(),
            product_tag_ids: product.tag_ids.clone(),
            shipping_profile_id: product.profile_id.clone(),
            title: if product.title.is_empty() { variant.title.clone() } else { product.title.clone() },
            unit_price,
            quantity: input.quantity,
            should_merge: true,
            allow_discounts: product.discountable,
            has_shipping: false,
            metadata: input.metadata.clone(),
            tax_lines: Vec::new(),
            adjustments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Unit price for the cart's region, customer and the given quantity.
    pub(super) async fn unit_price(
        &self,
        cart: &Cart,
        region: &Region,
        variant: &Variant,
        quantity: i64,
    ) -> CartResult<i64> {
        let context = PriceContext {
            region_id: region.id.clone(),
            currency_code: region.currency_code.clone(),
            customer_id: cart.customer_id.clone(),
            quantity,
        };
        self.services.prices.calculate_unit_price(variant, &context).await
    }

    /// Re-derives every unit price for `region` and the current customer.
    pub(super) async fn reprice_items(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        region: &Region,
    ) -> CartResult<()> {
        for index in 0..cart.items.len() {
            let (variant_id, quantity) = (cart.items[index].variant_id.clone(), cart.items[index].quantity);
            let variant = self.services.variants.retrieve(&variant_id).await?;
            let unit_price = self.unit_price(cart, region, &variant, quantity).await?;

            let item = &mut cart.items[index];
            if item.unit_price != unit_price {
                item.unit_price = unit_price;
                LineItemRepository::update(conn, item).await?;
            }
        }
        Ok(())
    }

    pub async fn update_line_item(&self, cart_id: &str, line_item_id: &str, patch: LineItemPatch) -> CartResult<Cart> {
        if let Some(quantity) = patch.quantity {
            validate_quantity(quantity)?;
        }

        let patch = &patch;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.update_line_item_in(&mut *tx, cart_id, line_item_id, patch).await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    async fn update_line_item_in(
        &self,
        conn: &mut SqliteConnection,
        cart_id: &str,
        line_item_id: &str,
        patch: &LineItemPatch,
    ) -> CartResult<Cart> {
        let mut cart = Self::load_active(conn, cart_id).await?;
        let region = self.services.regions.retrieve(&cart.region_id).await?;
        let index = cart
            .items
            .iter()
            .position(|item| item.id == line_item_id)
            .ok_or_else(|| CartError::not_found("LineItem", line_item_id))?;

        if let Some(quantity) = patch.quantity {
            let variant = self.services.variants.retrieve(&cart.items[index].variant_id).await?;
            ensure_inventory(&variant, quantity)?;
            let unit_price = self.unit_price(&cart, &region, &variant, quantity).await?;
            let item = &mut cart.items[index];
            item.quantity = quantity;
            item.unit_price = unit_price;
        }

        if let Some(metadata) = &patch.metadata {
            for (key, value) in metadata {
                validate_metadata_key(key)?;
                validate_metadata_value(key, value)?;
                cart.items[index].metadata.insert(key.clone(), value.clone());
            }
        }

        cart.items[index].updated_at = Utc::now();
        LineItemRepository::update(conn, &cart.items[index]).await?;
        self.refresh(conn, &mut cart, &region).await?;
        Ok(cart)
    }

    /// Removes a line. Removing an id that is not in the cart is a no-op.
    pub async fn remove_line_item(&self, cart_id: &str, line_item_id: &str) -> CartResult<Cart> {
        let (cart, removed) = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.remove_line_item_in(&mut *tx, cart_id, line_item_id).await;
            (tx, result)
        })
        .await?;

        if removed {
            self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        }
        Ok(cart)
    }

    async fn remove_line_item_in(
        &self,
        conn: &mut SqliteConnection,
        cart_id: &str,
        line_item_id: &str,
    ) -> CartResult<(Cart, bool)> {
        let mut cart = Self::load_active(conn, cart_id).await?;
        if cart.item(line_item_id).is_none() {
            debug!(cart_id = %cart_id, item_id = %line_item_id, "Line item not in cart, nothing to remove");
            return Ok((cart, false));
        }

        let region = self.services.regions.retrieve(&cart.region_id).await?;
        LineItemRepository::delete(conn, line_item_id).await?;
        cart.items.retain(|item| item.id != line_item_id);

        self.shipping.remove_orphaned_methods(conn, &mut cart).await?;
        self.refresh(conn, &mut cart, &region).await?;

        info!(cart_id = %cart_id, item_id = %line_item_id, "Line item removed");
        Ok((cart, true))
    }

    /// Moves the cart to another sales channel and drops lines whose product
    /// is not sold there.
    pub(super) async fn change_sales_channel(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        channel: &str,
    ) -> CartResult<()> {
        cart.sales_channel_id = Some(channel.to_string());

        let mut dropped = Vec::new();
        for item in &cart.items {
            let variant = self.services.variants.retrieve(&item.variant_id).await?;
            if !variant.product.sales_channel_ids.iter().any(|id| id == channel) {
                dropped.push(item.id.clone());
            }
        }

        for item_id in &dropped {
            LineItemRepository::delete(conn, item_id).await?;
        }
        if !dropped.is_empty() {
            cart.items.retain(|item| !dropped.contains(&item.id));
            self.shipping.remove_orphaned_methods(conn, cart).await?;
            debug!(cart_id = %cart.id, channel, removed = dropped.len(), "Dropped items outside sales channel");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use cartwright_core::TotalsConfig;
    use cartwright_db::CartRelations;

    #[tokio::test]
    async fn test_add_merges_same_variant_and_metadata() {
        let h = Harness::new().await;
        let cart = h.empty_cart().await;

        h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 1)).await.unwrap();
        let cart = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 2)).await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);

        let mut engraved = LineItemInput::new("variant_shirt", 1);
        engraved.metadata.insert("engraving".into(), "AB".into());
        let cart = h.cart.add_line_item(&cart.id, engraved).await.unwrap();
        assert_eq!(cart.items.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_adds_to_one_cart_both_commit() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::on_disk(&dir).await;
        let cart = h.cart_with_shirts(1).await;

        let (first, second) = tokio::join!(
            h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 2)),
            h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 3)),
        );
        first.unwrap();
        second.unwrap();

        let stored = h.cart.retrieve(&cart.id, &CartRelations::all()).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].quantity, 6);
    }

    #[tokio::test]
    async fn test_add_rejects_bad_input() {
        let h = Harness::new().await;
        let cart = h.empty_cart().await;

        let err = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 0)).await.unwrap_err();
        assert!(matches!(err, CartError::InvalidData(_)));

        let err = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_ghost", 1)).await.unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));

        // only 5 mugs in stock
        let err = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_mug", 6)).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));

        let err = h.cart.add_line_item("cart_missing", LineItemInput::new("variant_shirt", 1)).await.unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sales_channel_validation() {
        let h = Harness::new().await;
        let cart = h
            .cart
            .create(crate::cart::CreateCartInput {
                region_id: Some("reg_us".into()),
                sales_channel_id: Some("sc_web".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        // the mug is only sold in the retail channel
        let err = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_mug", 1)).await.unwrap_err();
        assert!(matches!(err, CartError::InvalidData(_)));

        let cart = h
            .cart
            .add_line_item_with(
                &cart.id,
                LineItemInput::new("variant_mug", 1),
                AddLineItemOptions { validate_sales_channels: false },
            )
            .await
            .unwrap();
        assert_eq!(cart.items.len(), 1);
    }

    #[tokio::test]
    async fn test_changing_sales_channel_drops_foreign_items() {
        let h = Harness::new().await;
        let cart = h
            .cart
            .create(crate::cart::CreateCartInput {
                region_id: Some("reg_us".into()),
                sales_channel_id: Some("sc_web".into()),
                items: vec![LineItemInput::new("variant_shirt", 1)],
                ..Default::default()
            })
            .await
            .unwrap();
        h.cart
            .add_line_item_with(
                &cart.id,
                LineItemInput::new("variant_mug", 1),
                AddLineItemOptions { validate_sales_channels: false },
            )
            .await
            .unwrap();

        let cart = h
            .cart
            .update(
                &cart.id,
                crate::cart::UpdateCartInput {
                    sales_channel_id: Some("sc_retail".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cart.sales_channel_id.as_deref(), Some("sc_retail"));
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].variant_id, "variant_mug");
    }

    #[tokio::test]
    async fn test_update_line_item() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(1).await;
        let item_id = cart.items[0].id.clone();

        let patch = LineItemPatch {
            quantity: Some(4),
            metadata: Some(serde_json::from_value(serde_json::json!({ "size": "L" })).unwrap()),
        };
        let cart = h.cart.update_line_item(&cart.id, &item_id, patch).await.unwrap();
        assert_eq!(cart.items[0].quantity, 4);
        assert_eq!(cart.items[0].metadata["size"], "L");

        let err = h
            .cart
            .update_line_item(&cart.id, "item_elsewhere", LineItemPatch { quantity: Some(1), metadata: None })
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_cart() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(2).await;
        let before = h.cart.retrieve_with_totals(&cart.id, &TotalsConfig::default()).await.unwrap();

        let added = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shoes", 1)).await.unwrap();
        let new_item = added.items.iter().find(|i| i.variant_id == "variant_shoes").unwrap().id.clone();
        h.cart.remove_line_item(&cart.id, &new_item).await.unwrap();

        let after = h.cart.retrieve_with_totals(&cart.id, &TotalsConfig::default()).await.unwrap();
        let ids = |c: &Cart| c.items.iter().map(|i| (i.id.clone(), i.quantity)).collect::<Vec<_>>();
        assert_eq!(ids(&before.cart), ids(&after.cart));
        assert_eq!(before.totals, after.totals);
    }

    #[tokio::test]
    async fn test_remove_absent_item_is_noop() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(2).await;
        let mut events = h.events.subscribe();

        let unchanged = h.cart.remove_line_item(&cart.id, "item_missing").await.unwrap();
        assert_eq!(unchanged.items.len(), 1);
        assert_eq!(unchanged.items[0].quantity, 2);
        assert!(events.try_recv().is_err());

        let stored = h.cart.retrieve(&cart.id, &CartRelations::all()).await.unwrap();
        assert_eq!(stored.items.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_last_item_drops_orphaned_shipping() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(1).await;
        let cart = h.cart.add_shipping_method(&cart.id, "so_standard", Metadata::new()).await.unwrap();
        assert_eq!(cart.shipping_methods.len(), 1);

        let cart = h.cart.remove_line_item(&cart.id, &cart.items[0].id.clone()).await.unwrap();
        assert!(cart.items.is_empty());
        assert!(cart.shipping_methods.is_empty());
    }
}
