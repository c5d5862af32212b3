//! # cartwright-core: Pure Checkout Logic for Cartwright
//!
//! This crate is the **heart** of the cart engine. It contains the money
//! math and the consistency rules for a cart as pure functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cartwright Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              cartwright-engine (CartAggregate)                  │   │
//! │  │    add_line_item, apply_discount, add_shipping_method, ...     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ cartwright-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │   │
//! │  │   │  types   │ │  totals  │ │ discount │ │ shipping │          │   │
//! │  │   │  Cart    │ │ Totals   │ │ adjust-  │ │ profile  │          │   │
//! │  │   │ LineItem │ │Calculator│ │  ments   │ │  checks  │          │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐                       │   │
//! │  │   │  money   │ │  refund  │ │validation│                       │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘                       │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 cartwright-db (Database Layer)                  │   │
//! │  │              SQLite queries, migrations, repositories           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Cart, LineItem, PaymentSession, Discount, ...)
//! - [`money`] - Money type with integer arithmetic and rounding policies
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//! - [`totals`] - The TotalsCalculator
//! - [`discount`] - Discount eligibility and line-item adjustments
//! - [`shipping`] - Shipping profile validation and option pricing
//! - [`refund`] - Refund allocation across payments
//!
//! ## Example Usage
//!
//! ```rust
//! use cartwright_core::money::{Money, RoundingPolicy};
//!
//! let price = Money::from_cents(1000);
//! let ten_percent = price.apply_bps(1000, RoundingPolicy::HalfUp);
//! assert_eq!(ten_percent.cents(), 100);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod discount;
pub mod error;
pub mod money;
pub mod refund;
pub mod shipping;
pub mod totals;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::{Money, RoundingPolicy};
pub use totals::{CartTotals, LineItemTotals, TotalsCalculator, TotalsConfig};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum distinct line items allowed in a single cart.
pub const MAX_CART_ITEMS: usize = 250;

/// Maximum quantity of a single line item.
pub const MAX_ITEM_QUANTITY: i64 = 10_000;

/// Provider id that routes to the built-in manual payment provider.
pub const SYSTEM_PROVIDER_ID: &str = "system";
