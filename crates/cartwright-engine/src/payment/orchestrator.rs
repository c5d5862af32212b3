//! # Payment Orchestrator
//!
//! Creates, reconciles, authorizes, captures, refunds and deletes payment
//! sessions and payments through the registered adapters.
//!
//! ## Session Reconciliation
//! ```text
//! set_payment_sessions(cart, region, amount)
//!   │
//!   ├── session for a provider no longer in the region ──► delete
//!   ├── session whose amount/currency drifted          ──► refresh (delete + recreate)
//!   ├── session up to date                             ──► keep as is
//!   ├── region provider without a session              ──► create
//!   └── exactly one session, none selected             ──► select it
//! ```
//!
//! Every method takes the active connection explicitly; the caller owns
//! the transaction.

use std::sync::Arc;

use cartwright_core::refund::plan_refund;
use cartwright_core::validation::validate_positive_amount;
use cartwright_core::{
    new_id, Cart, Metadata, Payment, PaymentSession, PaymentSessionStatus, Refund, RefundReason, Region,
};
use cartwright_db::{PaymentRepository, PaymentSessionRepository, RefundRepository};
use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::{PaymentContext, PaymentProviderRegistry};
use crate::config::FeatureFlags;
use crate::error::{CartError, CartResult, ProviderError};
use crate::services::CustomerService;

pub struct PaymentOrchestrator {
    registry: Arc<PaymentProviderRegistry>,
    customers: Arc<dyn CustomerService>,
    features: FeatureFlags,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: Arc<PaymentProviderRegistry>,
        customers: Arc<dyn CustomerService>,
        features: FeatureFlags,
    ) -> Self {
        PaymentOrchestrator {
            registry,
            customers,
            features,
        }
    }

    pub fn registry(&self) -> &PaymentProviderRegistry {
        &self.registry
    }

    async fn context(&self, cart: &Cart, amount: i64, currency_code: &str) -> CartResult<PaymentContext> {
        let customer_metadata = match &cart.customer_id {
            Some(customer_id) => self.customers.retrieve(customer_id).await?.metadata,
            None => Metadata::new(),
        };

        Ok(PaymentContext {
            cart_id: cart.id.clone(),
            email: cart.email.clone(),
            customer_id: cart.customer_id.clone(),
            region_id: cart.region_id.clone(),
            currency_code: currency_code.to_string(),
            amount,
            shipping_address: cart.shipping_address.clone(),
            shipping_methods: cart.shipping_methods.clone(),
            customer_metadata,
        })
    }

    fn has_drifted(&self, session: &PaymentSession, amount: i64, currency_code: &str) -> bool {
        if session.currency_code != currency_code {
            return true;
        }
        !self.features.partial_payment_sessions && session.amount != amount
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Creates a provider payment and a PENDING session row.
    pub async fn create_session(
        &self,
        conn: &mut SqliteConnection,
        provider_id: &str,
        cart: &Cart,
        amount: i64,
        currency_code: &str,
    ) -> CartResult<PaymentSession> {
        let provider = self.registry.get(provider_id)?;
        let context = self.context(cart, amount, currency_code).await?;
        let created = provider.create_payment(&context).await?;

        if let (Some(collected), Some(customer_id)) = (created.collected_data, cart.customer_id.as_deref()) {
            if !collected.is_empty() {
                debug!(customer_id = %customer_id, keys = collected.len(), "Merging collected customer data");
                self.customers.merge_metadata(customer_id, collected).await?;
            }
        }

        let now = Utc::now();
        let session = PaymentSession {
            id: new_id(),
            cart_id: cart.id.clone(),
            provider_id: provider_id.to_string(),
            status: PaymentSessionStatus::Pending,
            data: created.session_data,
            amount,
            currency_code: currency_code.to_string(),
            is_selected: false,
            is_initiated: true,
            payment_authorized_at: None,
            created_at: now,
            updated_at: now,
        };
        PaymentSessionRepository::insert(conn, &session).await?;

        info!(cart_id = %cart.id, provider_id = %provider_id, amount, "Payment session created");
        Ok(session)
    }

    /// Ensures exactly one up-to-date session per region provider.
    pub async fn set_payment_sessions(
        &self,
        conn: &mut SqliteConnection,
        cart: &Cart,
        region: &Region,
        amount: i64,
    ) -> CartResult<Vec<PaymentSession>> {
        let existing = PaymentSessionRepository::list_for_cart(conn, &cart.id).await?;
        let currency_code = region.currency_code.as_str();
        let mut sessions = Vec::with_capacity(region.payment_providers.len());

        for session in existing {
            if !region.payment_providers.contains(&session.provider_id) {
                self.delete_session(conn, &session).await?;
            } else if self.has_drifted(&session, amount, currency_code) {
                sessions.push(self.refresh_session(conn, &session, cart, amount, currency_code).await?);
            } else {
                sessions.push(session);
            }
        }

        for provider_id in &region.payment_providers {
            if !sessions.iter().any(|s| &s.provider_id == provider_id) {
                let session = self.create_session(conn, provider_id, cart, amount, currency_code).await?;
                sessions.push(session);
            }
        }

        if let [only] = sessions.as_mut_slice() {
            if !only.is_selected {
                PaymentSessionRepository::select(conn, &cart.id, &only.provider_id).await?;
                only.is_selected = true;
            }
        }

        Ok(sessions)
    }

    /// Deletes the provider payment and the session row, then recreates
    /// both. Selection is preserved.
    pub async fn refresh_session(
        &self,
        conn: &mut SqliteConnection,
        session: &PaymentSession,
        cart: &Cart,
        amount: i64,
        currency_code: &str,
    ) -> CartResult<PaymentSession> {
        debug!(session_id = %session.id, provider_id = %session.provider_id, "Refreshing payment session");

        self.delete_session(conn, session).await?;
        let mut fresh = self
            .create_session(conn, &session.provider_id, cart, amount, currency_code)
            .await?;

        if session.is_selected {
            fresh.is_selected = true;
            PaymentSessionRepository::update(conn, &fresh).await?;
        }
        Ok(fresh)
    }

    /// Makes `provider_id` the selected session, creating it if needed and
    /// pushing the current cart context to the provider.
    pub async fn select_session(
        &self,
        conn: &mut SqliteConnection,
        cart: &Cart,
        region: &Region,
        provider_id: &str,
        amount: i64,
    ) -> CartResult<PaymentSession> {
        if !region.payment_providers.iter().any(|p| p == provider_id) {
            return Err(CartError::not_allowed(format!(
                "Payment provider {provider_id} is not available in region {}",
                region.id
            )));
        }

        let existing = cart.payment_sessions.iter().find(|s| s.provider_id == provider_id);
        let mut session = match existing {
            Some(session) => {
                let provider = self.registry.get(provider_id)?;
                let context = self.context(cart, amount, &region.currency_code).await?;
                let mut updated = session.clone();
                updated.data = provider.update_payment(&session.data, &context).await?;
                updated
            }
            None => {
                self.create_session(conn, provider_id, cart, amount, &region.currency_code)
                    .await?
            }
        };

        session.is_selected = true;
        PaymentSessionRepository::update(conn, &session).await?;
        PaymentSessionRepository::select(conn, &cart.id, provider_id).await?;

        info!(cart_id = %cart.id, provider_id = %provider_id, "Payment session selected");
        Ok(session)
    }

    /// Merges caller data into a session through its provider.
    pub async fn update_session_data(
        &self,
        conn: &mut SqliteConnection,
        session: &PaymentSession,
        data: &Metadata,
    ) -> CartResult<PaymentSession> {
        let provider = self.registry.get(&session.provider_id)?;
        let mut updated = session.clone();
        updated.data = provider.update_payment_data(&session.data, data).await?;
        PaymentSessionRepository::update(conn, &updated).await?;
        Ok(updated)
    }

    /// Deletes the provider payment and the session row. A session the
    /// provider no longer knows about, or a row that is already gone, is
    /// not an error.
    pub async fn delete_session(&self, conn: &mut SqliteConnection, session: &PaymentSession) -> CartResult<()> {
        match self.registry.get(&session.provider_id) {
            Ok(provider) => match provider.delete_payment(&session.data).await {
                Ok(()) => {}
                Err(ProviderError::SessionNotFound) => {
                    warn!(session_id = %session.id, provider_id = %session.provider_id, "Provider session already gone");
                }
                Err(e) => return Err(e.into()),
            },
            Err(_) => {
                warn!(provider_id = %session.provider_id, "Deleting session of unregistered provider");
            }
        }

        if !PaymentSessionRepository::delete(conn, &session.id).await? {
            debug!(session_id = %session.id, "Payment session row already deleted");
        }
        Ok(())
    }

    /// Authorizes a session. `None` if the session no longer exists.
    pub async fn authorize_session(
        &self,
        conn: &mut SqliteConnection,
        session_id: &str,
        context: &Metadata,
    ) -> CartResult<Option<PaymentSession>> {
        let Some(mut session) = PaymentSessionRepository::get(conn, session_id).await? else {
            debug!(session_id = %session_id, "Authorize skipped, session not found");
            return Ok(None);
        };

        let provider = self.registry.get(&session.provider_id)?;
        let result = provider.authorize_payment(&session.data, context).await?;
        session.status = result.status;
        session.data = result.data;

        if session.status == PaymentSessionStatus::Authorized && self.features.authorization_timestamps {
            session.payment_authorized_at = Some(Utc::now());
        }

        PaymentSessionRepository::update(conn, &session).await?;
        info!(session_id = %session.id, status = ?session.status, "Payment session authorized");
        Ok(Some(session))
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Records the charge produced by an authorized session.
    pub async fn create_payment(
        &self,
        conn: &mut SqliteConnection,
        session: &PaymentSession,
        amount: i64,
    ) -> CartResult<Payment> {
        let provider = self.registry.get(&session.provider_id)?;
        let data = provider.get_payment_data(&session.data).await?;
        let now = Utc::now();

        let payment = Payment {
            id: new_id(),
            cart_id: Some(session.cart_id.clone()),
            provider_id: session.provider_id.clone(),
            amount,
            currency_code: session.currency_code.clone(),
            amount_refunded: 0,
            data,
            captured_at: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        PaymentRepository::insert(conn, &payment).await?;
        Ok(payment)
    }

    async fn load_payment(conn: &mut SqliteConnection, payment_id: &str) -> CartResult<Payment> {
        PaymentRepository::get(conn, payment_id)
            .await?
            .ok_or_else(|| CartError::not_found("Payment", payment_id))
    }

    /// Captures a payment. A provider reporting the capture as already done
    /// counts as success.
    pub async fn capture_payment(&self, conn: &mut SqliteConnection, payment_id: &str) -> CartResult<Payment> {
        let mut payment = Self::load_payment(conn, payment_id).await?;
        if payment.canceled_at.is_some() {
            return Err(CartError::not_allowed(format!("Payment {payment_id} is canceled")));
        }
        if payment.is_captured() {
            return Ok(payment);
        }

        let provider = self.registry.get(&payment.provider_id)?;
        match provider.capture_payment(&payment.data).await {
            Ok(data) => payment.data = data,
            Err(ProviderError::AlreadySucceeded) => {
                warn!(payment_id = %payment_id, "Provider reports capture already succeeded");
            }
            Err(e) => return Err(e.into()),
        }

        payment.captured_at = Some(Utc::now());
        PaymentRepository::update(conn, &payment).await?;
        info!(payment_id = %payment_id, amount = payment.amount, "Payment captured");
        Ok(payment)
    }

    pub async fn cancel_payment(&self, conn: &mut SqliteConnection, payment_id: &str) -> CartResult<Payment> {
        let mut payment = Self::load_payment(conn, payment_id).await?;
        if payment.canceled_at.is_some() {
            return Ok(payment);
        }

        let provider = self.registry.get(&payment.provider_id)?;
        payment.data = provider.cancel_payment(&payment.data).await?;
        payment.canceled_at = Some(Utc::now());
        PaymentRepository::update(conn, &payment).await?;
        info!(payment_id = %payment_id, "Payment canceled");
        Ok(payment)
    }

    /// Refunds `amount` across `payment_ids`, draining them in order.
    /// Repeated ids are refunded from once.
    ///
    /// Rejected with `NotAllowed`, leaving every payment untouched, when the
    /// captured refundable balance is smaller than `amount`. One `Refund`
    /// record covers the whole amount.
    pub async fn refund_payments(
        &self,
        conn: &mut SqliteConnection,
        payment_ids: &[String],
        amount: i64,
        reason: RefundReason,
        note: Option<String>,
    ) -> CartResult<Refund> {
        validate_positive_amount("amount", amount)?;

        let mut payments: Vec<Payment> = Vec::with_capacity(payment_ids.len());
        for payment_id in payment_ids {
            // a repeated id must not count its balance twice
            if payments.iter().any(|p| &p.id == payment_id) {
                continue;
            }
            payments.push(Self::load_payment(conn, payment_id).await?);
        }

        let allocations = plan_refund(&payments, amount)?;

        for allocation in &allocations {
            let Some(payment) = payments.iter_mut().find(|p| p.id == allocation.payment_id) else {
                continue;
            };
            let provider = self.registry.get(&payment.provider_id)?;
            payment.data = provider.refund_payment(&payment.data, allocation.amount).await?;
            payment.amount_refunded += allocation.amount;
            PaymentRepository::update(conn, payment).await?;
        }

        let refund = Refund {
            id: new_id(),
            payment_ids: allocations.iter().map(|a| a.payment_id.clone()).collect(),
            amount,
            reason,
            note,
            created_at: Utc::now(),
        };
        RefundRepository::insert(conn, &refund, &allocations).await?;

        info!(refund_id = %refund.id, amount, payments = allocations.len(), "Refund created");
        Ok(refund)
    }

    /// Refunds from a single payment.
    pub async fn refund_from_payment(
        &self,
        conn: &mut SqliteConnection,
        payment_id: &str,
        amount: i64,
        reason: RefundReason,
        note: Option<String>,
    ) -> CartResult<Refund> {
        self.refund_payments(conn, &[payment_id.to_string()], amount, reason, note)
            .await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ScriptedProvider};
    use cartwright_db::CartRepository;

    struct Fixture {
        db: cartwright_db::Database,
        orchestrator: PaymentOrchestrator,
        provider: Arc<ScriptedProvider>,
        cart: Cart,
        region: Region,
    }

    async fn fixture() -> Fixture {
        let db = testing::database().await;
        let provider = Arc::new(ScriptedProvider::new("card"));
        let registry = PaymentProviderRegistry::new().with(provider.clone());
        let orchestrator = PaymentOrchestrator::new(
            Arc::new(registry),
            Arc::new(testing::InMemoryCustomers::default()),
            FeatureFlags::default(),
        );

        let mut region = testing::us_region();
        region.payment_providers = vec!["system".into(), "card".into()];

        let cart = Cart::new(&region.id);
        let mut conn = db.pool().acquire().await.unwrap();
        CartRepository::insert(&mut conn, &cart).await.unwrap();
        drop(conn);

        Fixture { db, orchestrator, provider, cart, region }
    }

    async fn captured_payment(f: &Fixture, conn: &mut SqliteConnection, amount: i64) -> Payment {
        let session = f
            .orchestrator
            .create_session(conn, "card", &f.cart, amount, "usd")
            .await
            .unwrap();
        let payment = f.orchestrator.create_payment(conn, &session, amount).await.unwrap();
        PaymentSessionRepository::delete(conn, &session.id).await.unwrap();
        f.orchestrator.capture_payment(conn, &payment.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_payment_sessions_is_idempotent() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();

        let first = f.orchestrator.set_payment_sessions(&mut conn, &f.cart, &f.region, 2000).await.unwrap();
        let second = f.orchestrator.set_payment_sessions(&mut conn, &f.cart, &f.region, 2000).await.unwrap();

        assert_eq!(first.len(), 2);
        let ids = |s: &[PaymentSession]| {
            let mut v: Vec<(String, PaymentSessionStatus)> = s.iter().map(|s| (s.id.clone(), s.status)).collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(f.provider.created(), 1);
    }

    #[tokio::test]
    async fn test_set_payment_sessions_refreshes_drift_and_drops_removed_providers() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();

        let first = f.orchestrator.set_payment_sessions(&mut conn, &f.cart, &f.region, 2000).await.unwrap();
        let card_id = first.iter().find(|s| s.provider_id == "card").unwrap().id.clone();

        let mut region = f.region.clone();
        region.payment_providers = vec!["card".into()];
        let second = f.orchestrator.set_payment_sessions(&mut conn, &f.cart, &region, 2500).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_ne!(second[0].id, card_id);
        assert_eq!(second[0].amount, 2500);
        assert!(second[0].is_selected);
        assert_eq!(f.provider.deleted(), 1);
    }

    #[tokio::test]
    async fn test_create_session_unknown_provider_is_not_found() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let err = f
            .orchestrator
            .create_session(&mut conn, "paypal", &f.cart, 100, "usd")
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_provider_session() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let session = f.orchestrator.create_session(&mut conn, "card", &f.cart, 100, "usd").await.unwrap();

        f.provider.fail_delete_with(ProviderError::SessionNotFound);
        f.orchestrator.delete_session(&mut conn, &session).await.unwrap();
        f.orchestrator.delete_session(&mut conn, &session).await.unwrap();
        assert!(PaymentSessionRepository::get(&mut conn, &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authorize_missing_session_is_noop() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let result = f.orchestrator.authorize_session(&mut conn, "gone", &Metadata::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_authorize_stamps_timestamp_when_enabled() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let session = f.orchestrator.create_session(&mut conn, "card", &f.cart, 100, "usd").await.unwrap();

        let authorized = f
            .orchestrator
            .authorize_session(&mut conn, &session.id, &Metadata::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authorized.status, PaymentSessionStatus::Authorized);
        assert!(authorized.payment_authorized_at.is_some());

        let quiet = PaymentOrchestrator::new(
            f.orchestrator.registry.clone(),
            Arc::new(testing::InMemoryCustomers::default()),
            FeatureFlags { authorization_timestamps: false, ..FeatureFlags::default() },
        );
        let other = quiet.create_session(&mut conn, "system", &f.cart, 100, "usd").await.unwrap();
        let authorized = quiet.authorize_session(&mut conn, &other.id, &Metadata::new()).await.unwrap().unwrap();
        assert!(authorized.payment_authorized_at.is_none());
    }

    #[tokio::test]
    async fn test_capture_tolerates_already_succeeded() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let session = f.orchestrator.create_session(&mut conn, "card", &f.cart, 1000, "usd").await.unwrap();
        let payment = f.orchestrator.create_payment(&mut conn, &session, 1000).await.unwrap();

        f.provider.fail_capture_with(ProviderError::AlreadySucceeded);
        let captured = f.orchestrator.capture_payment(&mut conn, &payment.id).await.unwrap();
        assert!(captured.is_captured());

        let session2 = f.orchestrator.create_session(&mut conn, "system", &f.cart, 500, "usd").await.unwrap();
        let payment2 = f.orchestrator.create_payment(&mut conn, &session2, 500).await.unwrap();
        f.provider.fail_capture_with(ProviderError::Declined("insufficient funds".into()));
        // system provider is unaffected by the card script
        assert!(f.orchestrator.capture_payment(&mut conn, &payment2.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_refund_drains_in_order_and_creates_one_record() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let first = captured_payment(&f, &mut conn, 1000).await;
        let second = captured_payment(&f, &mut conn, 1000).await;

        let refund = f
            .orchestrator
            .refund_payments(
                &mut conn,
                &[first.id.clone(), second.id.clone()],
                1500,
                RefundReason::Return,
                Some("two shirts".into()),
            )
            .await
            .unwrap();
        assert_eq!(refund.amount, 1500);
        assert_eq!(refund.payment_ids, vec![first.id.clone(), second.id.clone()]);

        let first = PaymentRepository::get(&mut conn, &first.id).await.unwrap().unwrap();
        let second = PaymentRepository::get(&mut conn, &second.id).await.unwrap().unwrap();
        assert_eq!(first.amount_refunded, 1000);
        assert_eq!(second.amount_refunded, 500);
    }

    #[tokio::test]
    async fn test_refund_over_balance_is_rejected_and_leaves_payments_unchanged() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let payment = captured_payment(&f, &mut conn, 1000).await;

        f.orchestrator
            .refund_from_payment(&mut conn, &payment.id, 400, RefundReason::Other, None)
            .await
            .unwrap();

        let err = f
            .orchestrator
            .refund_from_payment(&mut conn, &payment.id, 601, RefundReason::Other, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));

        let stored = PaymentRepository::get(&mut conn, &payment.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_refunded, 400);
        assert!(stored.amount_refunded <= stored.amount);

        let err = f
            .orchestrator
            .refund_from_payment(&mut conn, &payment.id, 0, RefundReason::Other, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_repeated_payment_id_counts_balance_once() {
        let f = fixture().await;
        let mut conn = f.db.pool().acquire().await.unwrap();
        let payment = captured_payment(&f, &mut conn, 1000).await;
        let ids = vec![payment.id.clone(), payment.id.clone()];

        let err = f
            .orchestrator
            .refund_payments(&mut conn, &ids, 2000, RefundReason::Return, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::NotAllowed(_)));
        assert_eq!(f.provider.refunded(), 0);

        let stored = PaymentRepository::get(&mut conn, &payment.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_refunded, 0);

        let refund = f
            .orchestrator
            .refund_payments(&mut conn, &ids, 1000, RefundReason::Return, None)
            .await
            .unwrap();
        assert_eq!(refund.payment_ids, vec![payment.id.clone()]);
        assert_eq!(f.provider.refunded(), 1);
    }
}
