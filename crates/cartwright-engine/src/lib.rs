//! # cartwright-engine: Cart Mutation & Checkout Engine
//!
//! Every public operation loads a cart, changes it, recomputes what depends
//! on the change and persists the result inside one retryable transaction.
//! Events are emitted only after the transaction commits.
//!
//! ## Operation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  caller                                                                 │
//! │    │  add_line_item / apply_discount / add_shipping_method / ...       │
//! │    ▼                                                                    │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │ run_transactionally (retries on SQLITE_BUSY with backoff)        │ │
//! │  │                                                                   │ │
//! │  │   load cart ─► validate ─► mutate rows ─► refresh                │ │
//! │  │                                            │                      │ │
//! │  │          ┌─────────────────────────────────┼──────────────┐       │ │
//! │  │          ▼                 ▼               ▼              ▼       │ │
//! │  │   DiscountEngine   ShippingMethod   TotalsCalculator  PaymentOrch │ │
//! │  │   (adjustments)    Manager (prices) (cart totals)     (sessions)  │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │    │  commit                                                            │
//! │    ▼                                                                    │
//! │  EventBus::emit(cart.updated | cart.customer_updated | ...)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cart`] - The `CartAggregate` and its inputs
//! - [`discount`] - Discount creation, validation and adjustments
//! - [`shipping`] - Shipping method pricing and profile rules
//! - [`payment`] - Provider capability, registry and session orchestration
//! - [`services`] - Collaborator traits (regions, variants, prices, taxes, ...)
//! - [`events`] - Cart events and the broadcast bus
//! - [`config`] - Layered engine configuration
//! - [`error`] - Engine error kinds

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cart;
pub mod config;
pub mod discount;
pub mod error;
pub mod events;
pub mod payment;
pub mod services;
pub mod shipping;

#[cfg(test)]
pub mod testing;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cart::{
    AddLineItemOptions, CartAggregate, Collaborators, CreateCartInput, DecoratedCart, LineItemInput,
    LineItemPatch, UpdateCartInput,
};
pub use config::{EngineConfig, FeatureFlags};
pub use discount::DiscountEngine;
pub use error::{CartError, CartResult, ProviderError};
pub use events::{BroadcastEventBus, CartEvent, EventBus};
pub use payment::{PaymentOrchestrator, PaymentProvider, PaymentProviderRegistry, SystemPaymentProvider};
pub use shipping::ShippingMethodManager;
