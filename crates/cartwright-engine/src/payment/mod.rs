//! # Payments
//!
//! ## Provider Capability
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  PaymentProviderRegistry  (built at start-up, passed by reference)     │
//! │                                                                         │
//! │   "system" ──► SystemPaymentProvider (manual, no-op)                   │
//! │   "stripe" ──► StripeProvider                                          │
//! │   ...                                                                   │
//! │                                                                         │
//! │  Every adapter implements PaymentProvider; the orchestrator looks      │
//! │  adapters up by provider id and never downcasts.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Session state lives in `payment_sessions`; created charges live in
//! `payments`. Provider calls happen inside the cart's transaction, after
//! the session row has been read and before it is written.

pub mod orchestrator;
pub mod registry;
pub mod system;

use async_trait::async_trait;
use cartwright_core::{Address, Metadata, PaymentSessionStatus, ShippingMethod};

use crate::error::ProviderError;

pub use orchestrator::PaymentOrchestrator;
pub use registry::PaymentProviderRegistry;
pub use system::SystemPaymentProvider;

/// Provider-agnostic view of the cart a session is created for.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentContext {
    pub cart_id: String,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub region_id: String,
    pub currency_code: String,
    pub amount: i64,
    pub shipping_address: Option<Address>,
    pub shipping_methods: Vec<ShippingMethod>,
    /// Data previously collected from the customer by any provider.
    pub customer_metadata: Metadata,
}

/// Result of creating a payment at a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatedPayment {
    pub session_data: Metadata,
    /// Customer data the provider wants merged into the customer record.
    pub collected_data: Option<Metadata>,
}

/// Result of an authorization attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationResult {
    pub status: PaymentSessionStatus,
    pub data: Metadata,
}

/// The capability every payment adapter implements.
///
/// Failures propagate unchanged; the orchestrator only tolerates
/// `AlreadySucceeded` on capture and `SessionNotFound` on delete.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn create_payment(&self, context: &PaymentContext) -> Result<CreatedPayment, ProviderError>;

    /// Pushes fresh cart context to an existing provider payment.
    async fn update_payment(
        &self,
        session_data: &Metadata,
        context: &PaymentContext,
    ) -> Result<Metadata, ProviderError>;

    /// Merges caller-supplied data into the session data.
    async fn update_payment_data(
        &self,
        session_data: &Metadata,
        data: &Metadata,
    ) -> Result<Metadata, ProviderError>;

    async fn delete_payment(&self, session_data: &Metadata) -> Result<(), ProviderError>;

    async fn authorize_payment(
        &self,
        session_data: &Metadata,
        context: &Metadata,
    ) -> Result<AuthorizationResult, ProviderError>;

    async fn capture_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError>;

    async fn cancel_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError>;

    async fn refund_payment(&self, payment_data: &Metadata, amount: i64) -> Result<Metadata, ProviderError>;

    /// Data to store on the `Payment` created from an authorized session.
    async fn get_payment_data(&self, session_data: &Metadata) -> Result<Metadata, ProviderError>;

    async fn get_status(&self, session_data: &Metadata) -> Result<PaymentSessionStatus, ProviderError>;
}
