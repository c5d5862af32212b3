//! Discounts, gift cards, shipping, payments, tax lines and completion.
//!
//! ## Checkout Flow
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ add shipping │──►│ set payment      │──►│ authorize        │──►│ complete │
//! │ method       │   │ sessions/select  │   │ selected session │   │          │
//! └──────────────┘   └──────────────────┘   └────────┬─────────┘   └────┬─────┘
//!                                                    │                  │
//!                                          AUTHORIZED ──► Payment       ├─ gift card balances
//!                                          for the cart total           ├─ discount usage
//!                                                                       └─ status = completed
//! ```

use cartwright_core::discount::check_validity;
use cartwright_core::{
    Cart, CartStatus, CustomShippingOption, Metadata, Payment, PaymentSessionStatus, Refund, RefundReason, Region,
    TotalsConfig,
};
use cartwright_db::{
    run_transactionally, CartRepository, DbError, DiscountRepository, GiftCardRepository, LineItemRepository,
    PaymentRepository, PaymentSessionRepository, ShippingMethodRepository,
};
use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use super::CartAggregate;
use crate::error::{CartError, CartResult};
use crate::events::CartEvent;
use crate::shipping::CustomShippingOptionInput;

impl CartAggregate {
    // -------------------------------------------------------------------------
    // Discounts and gift cards
    // -------------------------------------------------------------------------

    /// Applies a discount code. A second regular discount replaces the first.
    #[instrument(skip(self))]
    pub async fn apply_discount(&self, cart_id: &str, code: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                self.discounts.apply_discount(&mut *tx, &mut cart, code).await?;
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

    #[instrument(skip(self))]
    pub async fn remove_discount(&self, cart_id: &str, code: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                if self.discounts.remove_discount(&mut *tx, &mut cart, code).await? {
                    let region = self.services.regions.retrieve(&cart.region_id).await?;
                    self.refresh(&mut *tx, &mut cart, &region).await?;
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

    /// Links a gift card to the cart. The card must be enabled, unexpired
    /// and issued for the cart's region.
    pub(super) async fn apply_gift_card_in(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        code: &str,
    ) -> CartResult<()> {
        let card = GiftCardRepository::get_by_code(conn, code)
            .await?
            .ok_or_else(|| CartError::not_found("GiftCard", code))?;

        if card.is_disabled {
            return Err(CartError::not_allowed(format!("Gift card {} is disabled", card.code)));
        }
        if card.ends_at.is_some_and(|ends_at| ends_at <= Utc::now()) {
            return Err(CartError::not_allowed(format!("Gift card {} is expired", card.code)));
        }
        if card.region_id != cart.region_id {
            return Err(CartError::not_allowed(format!(
                "Gift card {} cannot be used in the current region",
                card.code
            )));
        }

        if !cart.gift_cards.iter().any(|g| g.id == card.id) {
            CartRepository::add_gift_card(conn, &cart.id, &card.id).await?;
            debug!(cart_id = %cart.id, gift_card_id = %card.id, "Gift card linked");
            cart.gift_cards.push(card);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shipping
    // -------------------------------------------------------------------------

    #[instrument(skip(self, data))]
    pub async fn add_shipping_method(&self, cart_id: &str, option_id: &str, data: Metadata) -> CartResult<Cart> {
        let data = &data;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                self.shipping
                    .add_shipping_method(&mut *tx, &mut cart, option_id, data.clone())
                    .await?;
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

    #[instrument(skip(self))]
    pub async fn remove_shipping_method(&self, cart_id: &str, method_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                if self.shipping.remove_shipping_method(&mut *tx, &mut cart, method_id).await? {
                    let region = self.services.regions.retrieve(&cart.region_id).await?;
                    self.refresh(&mut *tx, &mut cart, &region).await?;
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

    #[instrument(skip(self, options))]
    pub async fn create_custom_shipping_options(
        &self,
        cart_id: &str,
        options: Vec<CustomShippingOptionInput>,
    ) -> CartResult<Vec<CustomShippingOption>> {
        let options = &options;
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let cart = Self::load_active(&mut *tx, cart_id).await?;
                self.shipping
                    .create_custom_shipping_options(&mut *tx, &cart, options.clone())
                    .await
            }
            .await;
            (tx, result)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Payment sessions
    // -------------------------------------------------------------------------

    fn cart_total(&self, cart: &Cart) -> i64 {
        self.totals.total(cart).cents()
    }

    /// Creates or refreshes one session per provider of the cart's region.
    #[instrument(skip(self))]
    pub async fn set_payment_sessions(&self, cart_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                let total = self.cart_total(&cart);
                cart.payment_sessions = self
                    .payments
                    .set_payment_sessions(&mut *tx, &cart, &region, total)
                    .await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Selects the session of `provider_id`, creating it if needed.
    #[instrument(skip(self))]
    pub async fn set_payment_session(&self, cart_id: &str, provider_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                let total = self.cart_total(&cart);
                self.payments
                    .select_session(&mut *tx, &cart, &region, provider_id, total)
                    .await?;
                cart.payment_sessions = PaymentSessionRepository::list_for_cart(&mut *tx, &cart.id).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Replaces the provider session with a fresh one for the current total.
    #[instrument(skip(self))]
    pub async fn refresh_payment_session(&self, cart_id: &str, provider_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                let session = cart
                    .payment_sessions
                    .iter()
                    .find(|s| s.provider_id == provider_id)
                    .cloned()
                    .ok_or_else(|| CartError::not_found("PaymentSession", provider_id))?;

                let total = self.cart_total(&cart);
                self.payments
                    .refresh_session(&mut *tx, &session, &cart, total, &region.currency_code)
                    .await?;
                cart.payment_sessions = PaymentSessionRepository::list_for_cart(&mut *tx, &cart.id).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Deletes the provider session. Absent sessions are ignored.
    #[instrument(skip(self))]
    pub async fn delete_payment_session(&self, cart_id: &str, provider_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let session = cart.payment_sessions.iter().find(|s| s.provider_id == provider_id).cloned();
                if let Some(session) = session {
                    self.payments.delete_session(&mut *tx, &session).await?;
                    cart.payment_sessions.retain(|s| s.id != session.id);
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

    /// Merges caller data into the selected session.
    #[instrument(skip(self, data))]
    pub async fn update_payment_session(&self, cart_id: &str, data: Metadata) -> CartResult<Cart> {
        let data = &data;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let selected = cart
                    .selected_session()
                    .cloned()
                    .ok_or_else(|| CartError::not_allowed("The cart has no selected payment session"))?;

                let updated = self.payments.update_session_data(&mut *tx, &selected, data).await?;
                if let Some(slot) = cart.payment_sessions.iter_mut().find(|s| s.id == updated.id) {
                    *slot = updated;
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
    // Authorization and completion
    // -------------------------------------------------------------------------

    /// Authorizes the selected session and records a payment for the cart
    /// total. Zero-total carts are stamped without a provider call.
    #[instrument(skip(self, context))]
    pub async fn authorize_payment(&self, cart_id: &str, context: &Metadata) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.authorize_payment_in(&mut *tx, cart_id, context).await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    async fn authorize_payment_in(
        &self,
        conn: &mut SqliteConnection,
        cart_id: &str,
        context: &Metadata,
    ) -> CartResult<Cart> {
        let mut cart = Self::load_active(conn, cart_id).await?;
        let total = self.cart_total(&cart);
        let has_current_payment = self.cancel_stale_payments(conn, &mut cart, total).await?;

        if total == 0 {
            if cart.payment_authorized_at.is_none() {
                cart.payment_authorized_at = Some(Utc::now());
                CartRepository::update(conn, &cart).await?;
            }
            info!(cart_id = %cart_id, "Zero-total cart authorized without a provider");
            return Ok(cart);
        }

        if cart.payment_authorized_at.is_some() && has_current_payment {
            debug!(cart_id = %cart_id, "Cart already authorized");
            return Ok(cart);
        }

        let region = self.services.regions.retrieve(&cart.region_id).await?;
        cart.payment_sessions = self.payments.set_payment_sessions(conn, &cart, &region, total).await?;
        let selected = cart
            .selected_session()
            .cloned()
            .ok_or_else(|| CartError::not_allowed("You cannot complete a cart without a selected payment session"))?;

        let session = self
            .payments
            .authorize_session(conn, &selected.id, context)
            .await?
            .ok_or_else(|| CartError::not_found("PaymentSession", &selected.id))?;

        if session.status == PaymentSessionStatus::Authorized {
            let payment = self.payments.create_payment(conn, &session, total).await?;
            cart.payment_authorized_at = Some(Utc::now());
            CartRepository::update(conn, &cart).await?;
            info!(cart_id = %cart_id, payment_id = %payment.id, amount = total, "Cart payment authorized");
        } else {
            info!(cart_id = %cart_id, status = ?session.status, "Payment session not authorized");
        }

        if let Some(slot) = cart.payment_sessions.iter_mut().find(|s| s.id == session.id) {
            *slot = session;
        }
        Ok(cart)
    }

    /// Cancels live payments whose amount no longer matches `total` and
    /// clears the cart's authorization when one was canceled. Returns whether
    /// a live payment for `total` remains.
    async fn cancel_stale_payments(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        total: i64,
    ) -> CartResult<bool> {
        let mut has_current = false;
        let mut canceled = false;

        for payment in PaymentRepository::list_for_cart(conn, &cart.id).await? {
            if payment.canceled_at.is_some() {
                continue;
            }
            if payment.amount == total && !has_current {
                has_current = true;
                continue;
            }
            if payment.is_captured() {
                return Err(CartError::not_allowed(format!(
                    "Payment {} was captured for {} but the cart total is {total}",
                    payment.id, payment.amount
                )));
            }
            self.payments.cancel_payment(conn, &payment.id).await?;
            canceled = true;
            info!(cart_id = %cart.id, payment_id = %payment.id, amount = payment.amount, total, "Stale payment canceled");
        }

        if canceled {
            cart.payment_authorized_at = None;
            CartRepository::update(conn, cart).await?;
        }
        Ok(has_current)
    }

    /// Marks the cart completed. Requires an authorized payment unless the
    /// total is zero.
    #[instrument(skip(self))]
    pub async fn complete(&self, cart_id: &str) -> CartResult<Cart> {
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.complete_in(&mut *tx, cart_id).await;
            (tx, result)
        })
        .await?;

        info!(cart_id = %cart.id, "Cart completed");
        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    async fn complete_in(&self, conn: &mut SqliteConnection, cart_id: &str) -> CartResult<Cart> {
        let mut cart = Self::load_active(conn, cart_id).await?;
        let config = TotalsConfig {
            gift_card_total: true,
            total: true,
            ..TotalsConfig::none()
        };
        let totals = self.totals.calculate(&cart, &config);
        let total = totals.total.unwrap_or(0);

        if total > 0 {
            let payments = PaymentRepository::list_for_cart(conn, cart_id).await?;
            let covered = payments.iter().any(|p| p.canceled_at.is_none() && p.amount == total);
            if cart.payment_authorized_at.is_none() || !covered {
                return Err(CartError::not_allowed("The cart payment has not been authorized for the cart total"));
            }
        }

        let now = Utc::now();
        for applied in &cart.discounts {
            let current = DiscountRepository::get(conn, &applied.id)
                .await?
                .ok_or_else(|| CartError::not_found("Discount", &applied.id))?;
            check_validity(&current, &cart.region_id, now).map_err(|rejection| {
                CartError::not_allowed(format!("Discount {} can no longer be used: {rejection}", current.code))
            })?;
        }

        let mut remaining = totals.gift_card_total.unwrap_or(0);
        for card in &mut cart.gift_cards {
            if remaining == 0 {
                break;
            }
            let used = card.balance.min(remaining);
            card.balance -= used;
            remaining -= used;
            GiftCardRepository::update_balance(conn, &card.id, card.balance).await?;
        }

        for discount in &mut cart.discounts {
            DiscountRepository::increment_usage(conn, &discount.id).await?;
            discount.usage_count += 1;
        }

        cart.status = CartStatus::Completed;
        cart.completed_at = Some(now);
        cart.updated_at = now;
        CartRepository::update(conn, &cart).await?;
        Ok(cart)
    }

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    pub async fn list_payments(&self, cart_id: &str) -> CartResult<Vec<Payment>> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        Ok(PaymentRepository::list_for_cart(&mut conn, cart_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn capture_payment(&self, payment_id: &str) -> CartResult<Payment> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.payments.capture_payment(&mut *tx, payment_id).await;
            (tx, result)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_payment(&self, payment_id: &str) -> CartResult<Payment> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self.payments.cancel_payment(&mut *tx, payment_id).await;
            (tx, result)
        })
        .await
    }

    /// Refunds `amount` across the given payments, in order.
    #[instrument(skip(self, note))]
    pub async fn refund_payments(
        &self,
        payment_ids: &[String],
        amount: i64,
        reason: RefundReason,
        note: Option<String>,
    ) -> CartResult<Refund> {
        let note = &note;
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self
                .payments
                .refund_payments(&mut *tx, payment_ids, amount, reason, note.clone())
                .await;
            (tx, result)
        })
        .await
    }

    #[instrument(skip(self, note))]
    pub async fn refund_from_payment(
        &self,
        payment_id: &str,
        amount: i64,
        reason: RefundReason,
        note: Option<String>,
    ) -> CartResult<Refund> {
        let note = &note;
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = self
                .payments
                .refund_from_payment(&mut *tx, payment_id, amount, reason, note.clone())
                .await;
            (tx, result)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Tax lines
    // -------------------------------------------------------------------------

    /// Recreates tax lines for every item and shipping method.
    #[instrument(skip(self))]
    pub async fn create_tax_lines(&self, cart_id: &str) -> CartResult<Cart> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let region = self.services.regions.retrieve(&cart.region_id).await?;
                self.create_tax_lines_in(&mut *tx, &mut cart, &region).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_tax_lines(&self, cart_id: &str) -> CartResult<Cart> {
        run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                Self::delete_tax_lines_in(&mut *tx, &mut cart).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await
    }

    pub(super) async fn create_tax_lines_in(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        region: &Region,
    ) -> CartResult<()> {
        let mut lines = self.services.taxes.tax_lines(cart, region).await?;

        for item in &mut cart.items {
            let item_lines = lines.items.remove(&item.id).unwrap_or_default();
            LineItemRepository::replace_tax_lines(conn, &item.id, &item_lines).await?;
            item.tax_lines = item_lines;
        }
        for method in &mut cart.shipping_methods {
            let method_lines = lines.shipping_methods.remove(&method.id).unwrap_or_default();
            ShippingMethodRepository::replace_tax_lines(conn, &method.id, &method_lines).await?;
            method.tax_lines = method_lines;
        }

        debug!(cart_id = %cart.id, items = cart.items.len(), methods = cart.shipping_methods.len(), "Tax lines created");
        Ok(())
    }

    async fn delete_tax_lines_in(conn: &mut SqliteConnection, cart: &mut Cart) -> CartResult<()> {
        LineItemRepository::delete_tax_lines_for_cart(conn, &cart.id).await?;
        ShippingMethodRepository::delete_tax_lines_for_cart(conn, &cart.id).await?;
        cart.items.iter_mut().for_each(|i| i.tax_lines.clear());
        cart.shipping_methods.iter_mut().for_each(|m| m.tax_lines.clear());
        Ok(())
    }
}
