//! # Cart Aggregate
//!
//! The public entry point for cart mutation and checkout preparation.
//!
//! ## Unit of Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  cart.add_line_item(cart_id, input)                                     │
//! │                                                                         │
//! │  run_transactionally ─┬─ load cart (all relations), reject completed   │
//! │                       ├─ mutate rows through repositories              │
//! │                       ├─ refresh derived state                         │
//! │                       │    adjustments → free shipping → has_shipping  │
//! │                       │    → tax lines (automatic taxes)               │
//! │                       │    → payment sessions (if any exist)           │
//! │                       └─ COMMIT  (retried from scratch on conflict)    │
//! │                                                                         │
//! │  after commit ──► EventBus::emit(cart.updated)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operations are spread over submodules by concern:
//!
//! - [`items`] - line items
//! - [`region`] - addresses and region changes
//! - [`checkout`] - discounts, gift cards, shipping, payments, tax lines,
//!   completion

mod checkout;
mod items;
mod region;

use std::sync::Arc;

use cartwright_core::validation::{validate_email, validate_metadata_key, validate_metadata_value};
use cartwright_core::{
    AddressInput, Cart, CartTotals, Metadata, Region, TotalsCalculator, TotalsConfig,
};
use cartwright_db::{
    run_transactionally, CartFilter, CartRelations, CartRepository, Database, DbError, TransactionOptions,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::config::{EngineConfig, FeatureFlags};
use crate::discount::DiscountEngine;
use crate::error::{CartError, CartResult};
use crate::events::{CartEvent, EventBus};
use crate::payment::{PaymentOrchestrator, PaymentProviderRegistry};
use crate::services::{
    CustomerService, PriceSelectionStrategy, RegionService, ShippingOptionService, TaxProvider, VariantService,
};
use crate::shipping::ShippingMethodManager;

pub use items::{AddLineItemOptions, LineItemInput, LineItemPatch};

// =============================================================================
// Inputs
// =============================================================================

/// Payload for [`CartAggregate::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCartInput {
    pub region_id: Option<String>,
    pub country_code: Option<String>,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub sales_channel_id: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItemInput>,
    pub billing_address: Option<AddressInput>,
    pub shipping_address: Option<AddressInput>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Patch for [`CartAggregate::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCartInput {
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub region_id: Option<String>,
    pub country_code: Option<String>,
    pub billing_address: Option<AddressInput>,
    pub shipping_address: Option<AddressInput>,
    /// Replaces every applied discount.
    pub discounts: Option<Vec<String>>,
    /// Replaces every applied gift card.
    pub gift_cards: Option<Vec<String>>,
    pub sales_channel_id: Option<String>,
    /// Merged key by key into the existing metadata.
    pub metadata: Option<Metadata>,
}

/// A cart together with its computed totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoratedCart {
    #[serde(flatten)]
    pub cart: Cart,
    pub totals: CartTotals,
}

// =============================================================================
// Collaborators
// =============================================================================

/// Everything the aggregate consumes but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub regions: Arc<dyn RegionService>,
    pub variants: Arc<dyn VariantService>,
    pub prices: Arc<dyn PriceSelectionStrategy>,
    pub taxes: Arc<dyn TaxProvider>,
    pub customers: Arc<dyn CustomerService>,
    pub shipping_options: Arc<dyn ShippingOptionService>,
    pub events: Arc<dyn EventBus>,
    pub payment_providers: Arc<PaymentProviderRegistry>,
}

// =============================================================================
// Aggregate
// =============================================================================

pub struct CartAggregate {
    db: Database,
    tx_options: TransactionOptions,
    features: FeatureFlags,
    totals: TotalsCalculator,
    services: Collaborators,
    discounts: DiscountEngine,
    shipping: ShippingMethodManager,
    payments: PaymentOrchestrator,
}

impl CartAggregate {
    pub fn new(db: Database, config: &EngineConfig, services: Collaborators) -> Self {
        let tx_options = config.transaction_options();
        let rounding = config.totals.rounding;

        CartAggregate {
            discounts: DiscountEngine::new(
                db.clone(),
                tx_options.clone(),
                services.customers.clone(),
                rounding,
            ),
            shipping: ShippingMethodManager::new(services.shipping_options.clone()),
            payments: PaymentOrchestrator::new(
                services.payment_providers.clone(),
                services.customers.clone(),
                config.features,
            ),
            totals: TotalsCalculator::new(rounding),
            features: config.features,
            tx_options,
            services,
            db,
        }
    }

    /// Discount administration.
    pub fn discount_engine(&self) -> &DiscountEngine {
        &self.discounts
    }

    pub fn totals_calculator(&self) -> TotalsCalculator {
        self.totals
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Creates a cart in a region, optionally with addresses and items.
    pub async fn create(&self, input: CreateCartInput) -> CartResult<Cart> {
        let region_id = input
            .region_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CartError::InvalidArgument("region_id is required".into()))?;
        let region = self.services.regions.retrieve(region_id).await?;

        let input = &input;
        let region = &region;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.create_in(&mut *tx, input, region).await;
            (tx, result)
        })
        .await?;

        info!(cart_id = %cart.id, region_id = %cart.region_id, items = cart.items.len(), "Cart created");
        self.emit(CartEvent::Created { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    async fn create_in(&self, conn: &mut SqliteConnection, input: &CreateCartInput, region: &Region) -> CartResult<Cart> {
        let mut cart = Cart::new(&region.id);

        if let Some(customer_id) = &input.customer_id {
            let customer = self.services.customers.retrieve(customer_id).await?;
            cart.customer_id = Some(customer.id);
            cart.email = Some(customer.email);
        } else if let Some(email) = &input.email {
            let email = validate_email(email)?;
            let customer = self.services.customers.retrieve_or_create_by_email(&email).await?;
            cart.customer_id = Some(customer.id);
            cart.email = Some(email);
        }

        if self.features.sales_channels {
            cart.sales_channel_id = input.sales_channel_id.clone();
        }

        for (key, value) in &input.metadata {
            validate_metadata_key(key)?;
            validate_metadata_value(key, value)?;
        }
        cart.metadata = input.metadata.clone();

        if let Some(address) = &input.billing_address {
            let address = self.resolve_address(conn, address).await?;
            cart.billing_address_id = Some(address.id.clone());
            cart.billing_address = Some(address);
        }

        match (&input.shipping_address, &input.country_code) {
            (Some(address), _) => {
                let address = self.resolve_address(conn, address).await?;
                Self::ensure_country_in_region(address.country_code.as_deref(), region)?;
                cart.shipping_address_id = Some(address.id.clone());
                cart.shipping_address = Some(address);
            }
            (None, Some(country_code)) => {
                let address = self.country_only_address(conn, country_code, region).await?;
                cart.shipping_address_id = Some(address.id.clone());
                cart.shipping_address = Some(address);
            }
            (None, None) => {
                if let [only] = region.countries.as_slice() {
                    let address = self.country_only_address(conn, only, region).await?;
                    cart.shipping_address_id = Some(address.id.clone());
                    cart.shipping_address = Some(address);
                }
            }
        }

        CartRepository::insert(conn, &cart).await?;

        for item in &input.items {
            self.add_line_item_to(conn, &mut cart, region, item, AddLineItemOptions::default())
                .await?;
        }
        self.refresh(conn, &mut cart, region).await?;

        Ok(cart)
    }

    /// A cart with the requested relations.
    pub async fn retrieve(&self, cart_id: &str, relations: &CartRelations) -> CartResult<Cart> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        CartRepository::load(&mut conn, cart_id, relations)
            .await?
            .ok_or_else(|| CartError::not_found("Cart", cart_id))
    }

    /// A fully loaded cart with every total computed.
    pub async fn retrieve_with_totals(&self, cart_id: &str, config: &TotalsConfig) -> CartResult<DecoratedCart> {
        let cart = self.retrieve(cart_id, &CartRelations::all()).await?;
        Ok(self.decorate_totals(cart, config))
    }

    pub async fn list(&self, filter: &CartFilter) -> CartResult<Vec<Cart>> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        Ok(CartRepository::list(&mut conn, filter).await?)
    }

    /// Applies a patch. Emits `cart.customer_updated` when the customer
    /// changed, `cart.updated` always.
    pub async fn update(&self, cart_id: &str, input: UpdateCartInput) -> CartResult<Cart> {
        let input = &input;
        let (cart, customer_changed) =
            run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
                let result = self.update_in(&mut *tx, cart_id, input).await;
                (tx, result)
            })
            .await?;

        if customer_changed {
            self.emit(CartEvent::CustomerUpdated {
                cart_id: cart.id.clone(),
                customer_id: cart.customer_id.clone(),
            })
            .await;
        }
        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    async fn update_in(
        &self,
        conn: &mut SqliteConnection,
        cart_id: &str,
        input: &UpdateCartInput,
    ) -> CartResult<(Cart, bool)> {
        if input.country_code.is_some() && input.shipping_address.is_some() {
            return Err(CartError::InvalidData(
                "Provide either a country code or a shipping address, not both".into(),
            ));
        }

        let mut cart = Self::load_active(conn, cart_id).await?;
        let mut region = self.services.regions.retrieve(&cart.region_id).await?;
        let previous_customer = cart.customer_id.clone();

        if let Some(customer_id) = &input.customer_id {
            let customer = self.services.customers.retrieve(customer_id).await?;
            cart.customer_id = Some(customer.id);
            cart.email = Some(customer.email);
        } else if let Some(email) = &input.email {
            let email = validate_email(email)?;
            if cart.email.as_deref() != Some(email.as_str()) {
                let customer = self.services.customers.retrieve_or_create_by_email(&email).await?;
                cart.customer_id = Some(customer.id);
                cart.email = Some(email);
            }
        }
        let customer_changed = cart.customer_id != previous_customer;

        if let Some(address) = &input.billing_address {
            let address = self.resolve_address(conn, address).await?;
            cart.billing_address_id = Some(address.id.clone());
            cart.billing_address = Some(address);
        }

        if let Some(region_id) = input.region_id.as_deref().filter(|id| *id != cart.region_id) {
            let new_region = self.services.regions.retrieve(region_id).await?;
            self.set_region_in(conn, &mut cart, &region, &new_region, input.country_code.as_deref())
                .await?;
            region = new_region;
        } else if let Some(code) = input.country_code.as_deref() {
            let address = self.country_only_address(conn, code, &region).await?;
            cart.shipping_address_id = Some(address.id.clone());
            cart.shipping_address = Some(address);
        }

        if let Some(address) = &input.shipping_address {
            self.update_shipping_address_in(conn, &mut cart, &mut region, address).await?;
        }

        if self.features.sales_channels {
            if let Some(channel) = &input.sales_channel_id {
                if cart.sales_channel_id.as_ref() != Some(channel) {
                    self.change_sales_channel(conn, &mut cart, channel).await?;
                }
            }
        }

        if let Some(metadata) = &input.metadata {
            for (key, value) in metadata {
                validate_metadata_key(key)?;
                validate_metadata_value(key, value)?;
                cart.metadata.insert(key.clone(), value.clone());
            }
        }

        if let Some(codes) = &input.gift_cards {
            CartRepository::clear_gift_cards(conn, &cart.id).await?;
            cart.gift_cards.clear();
            for code in codes {
                self.apply_gift_card_in(conn, &mut cart, code).await?;
            }
        }

        if customer_changed {
            self.reprice_items(conn, &mut cart, &region).await?;
        }

        if let Some(codes) = &input.discounts {
            CartRepository::clear_discounts(conn, &cart.id).await?;
            cart.discounts.clear();
            for code in codes {
                self.discounts.apply_discount(conn, &mut cart, code).await?;
            }
        }

        CartRepository::update(conn, &cart).await?;
        self.refresh(conn, &mut cart, &region).await?;

        Ok((cart, customer_changed))
    }

    /// Deletes an active cart and its provider sessions.
    pub async fn delete(&self, cart_id: &str) -> CartResult<()> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.delete_in(&mut *tx, cart_id).await;
            (tx, result)
        })
        .await?;

        info!(cart_id = %cart_id, "Cart deleted");
        Ok(())
    }

    async fn delete_in(&self, conn: &mut SqliteConnection, cart_id: &str) -> CartResult<()> {
        let cart = Self::load_active(conn, cart_id).await?;
        for session in &cart.payment_sessions {
            self.payments.delete_session(conn, session).await?;
        }
        CartRepository::delete(conn, cart_id).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Sets one scalar metadata key, leaving the other keys alone.
    pub async fn set_metadata(&self, cart_id: &str, key: &str, value: serde_json::Value) -> CartResult<Cart> {
        validate_metadata_key(key)?;
        validate_metadata_value(key, &value)?;

        let value = &value;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                cart.metadata.insert(key.to_string(), value.clone());
                CartRepository::update(&mut *tx, &cart).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    pub async fn delete_metadata(&self, cart_id: &str, key: &str) -> CartResult<Cart> {
        validate_metadata_key(key)?;

        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                if cart.metadata.remove(key).is_some() {
                    CartRepository::update(&mut *tx, &cart).await?;
                }
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    // -------------------------------------------------------------------------
    // Totals
    // -------------------------------------------------------------------------

    /// Computes the totals selected by `config`. Never persists.
    pub fn decorate_totals(&self, cart: Cart, config: &TotalsConfig) -> DecoratedCart {
        let totals = self.totals.calculate(&cart, config);
        DecoratedCart { cart, totals }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Loads every relation; `NotFound` if absent, `NotAllowed` if completed.
    async fn load_active(conn: &mut SqliteConnection, cart_id: &str) -> CartResult<Cart> {
        let cart = CartRepository::load(conn, cart_id, &CartRelations::all())
            .await?
            .ok_or_else(|| CartError::not_found("Cart", cart_id))?;
        if cart.is_completed() {
            return Err(CartError::completed(cart_id));
        }
        Ok(cart)
    }

    /// Brings every derived row in line with the cart's current contents.
    async fn refresh(&self, conn: &mut SqliteConnection, cart: &mut Cart, region: &Region) -> CartResult<()> {
        self.discounts.refresh_adjustments(conn, cart).await?;
        self.shipping.adjust_free_shipping(conn, cart).await?;
        self.shipping.refresh_item_shipping(conn, cart).await?;

        if region.automatic_taxes {
            self.create_tax_lines_in(conn, cart, region).await?;
        }

        if !cart.payment_sessions.is_empty() {
            let total = self.totals.total(cart).cents();
            cart.payment_sessions = self.payments.set_payment_sessions(conn, cart, region, total).await?;
        }

        debug!(cart_id = %cart.id, "Cart derived state refreshed");
        Ok(())
    }

    async fn emit(&self, event: CartEvent) {
        self.services.events.emit(event).await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Harness};
    use cartwright_core::{AddressPayload, CartStatus};

    #[tokio::test]
    async fn test_create_requires_region() {
        let h = Harness::new().await;
        let err = h.cart.create(CreateCartInput::default()).await.unwrap_err();
        assert!(matches!(err, CartError::InvalidArgument(_)));

        let err = h
            .cart
            .create(CreateCartInput {
                region_id: Some("reg_mars".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_with_items_and_email() {
        let h = Harness::new().await;
        let mut events = h.events.subscribe();

        let cart = h
            .cart
            .create(CreateCartInput {
                region_id: Some("reg_us".into()),
                email: Some("Shopper@Example.com".into()),
                items: vec![LineItemInput::new("variant_shirt", 2)],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].unit_price, 1000);
        assert!(cart.customer_id.is_some());
        assert_eq!(cart.shipping_country().as_deref(), Some("us"));
        assert_eq!(events.recv().await.unwrap().name(), "cart.created");

        let stored = h.cart.retrieve(&cart.id, &CartRelations::all()).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.status, CartStatus::Active);
    }

    #[tokio::test]
    async fn test_create_rejects_country_outside_region() {
        let h = Harness::new().await;
        let err = h
            .cart
            .create(CreateCartInput {
                region_id: Some("reg_us".into()),
                shipping_address: Some(AddressInput::Payload(AddressPayload {
                    country_code: Some("DE".into()),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_update_customer_emits_customer_updated() {
        let h = Harness::new().await;
        let cart = h.empty_cart().await;
        let mut events = h.events.subscribe();

        let updated = h
            .cart
            .update(
                &cart.id,
                UpdateCartInput {
                    email: Some("new@example.com".into()),
                    metadata: Some(serde_json::from_value(serde_json::json!({ "source": "app" })).unwrap()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.email.as_deref(), Some("new@example.com"));
        assert_eq!(updated.metadata["source"], "app");
        assert_eq!(events.recv().await.unwrap().name(), "cart.customer_updated");
        assert_eq!(events.recv().await.unwrap().name(), "cart.updated");
    }

    #[tokio::test]
    async fn test_metadata_merges_and_rejects_bad_input() {
        let h = Harness::new().await;
        let cart = h.empty_cart().await;

        h.cart.set_metadata(&cart.id, "gift_note", "Happy birthday".into()).await.unwrap();
        let cart = h.cart.set_metadata(&cart.id, "wrap", true.into()).await.unwrap();
        assert_eq!(cart.metadata.len(), 2);

        let err = h.cart.set_metadata(&cart.id, "", "x".into()).await.unwrap_err();
        assert!(matches!(err, CartError::InvalidArgument(_)));
        let err = h
            .cart
            .set_metadata(&cart.id, "nested", serde_json::json!({ "a": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidData(_)));

        let cart = h.cart.delete_metadata(&cart.id, "wrap").await.unwrap();
        assert_eq!(cart.metadata.len(), 1);
        assert!(cart.metadata.contains_key("gift_note"));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let h = Harness::new().await;
        let first = h.empty_cart().await;
        let second = h.empty_cart().await;

        let all = h.cart.list(&CartFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        h.cart.delete(&first.id).await.unwrap();
        let err = h.cart.retrieve(&first.id, &CartRelations::none()).await.unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
        assert!(h.cart.retrieve(&second.id, &CartRelations::none()).await.is_ok());
    }

    #[tokio::test]
    async fn test_totals_for_single_line() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(2).await;

        let decorated = h.cart.retrieve_with_totals(&cart.id, &TotalsConfig::default()).await.unwrap();
        assert_eq!(decorated.totals.subtotal, Some(2000));
        assert_eq!(decorated.totals.total, Some(2000));

        let only_total = h.cart.decorate_totals(decorated.cart, &TotalsConfig::total_only());
        assert_eq!(only_total.totals.subtotal, None);
        assert_eq!(only_total.totals.total, Some(2000));

        let json = serde_json::to_value(&only_total).unwrap();
        assert_eq!(json["totals"]["total"], 2000);
        assert_eq!(json["id"], cart.id.as_str());
    }

    #[tokio::test]
    async fn test_completed_cart_rejects_mutations() {
        let h = Harness::new().await;
        let cart = h.cart_with_shirts(1).await;
        testing::discount(&h, "TEN", cartwright_core::DiscountRuleType::Percentage, 1000).await;

        h.cart.set_payment_sessions(&cart.id).await.unwrap();
        h.cart.authorize_payment(&cart.id, &Metadata::new()).await.unwrap();
        let completed = h.cart.complete(&cart.id).await.unwrap();
        assert!(completed.is_completed());

        let err = h.cart.add_line_item(&cart.id, LineItemInput::new("variant_shirt", 1)).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
        let err = h.cart.apply_discount(&cart.id, "TEN").await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
        let err = h.cart.delete(&cart.id).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
        let err = h.cart.set_metadata(&cart.id, "k", "v".into()).await.unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
    }
}
