//! # cartwright-db: Database Layer for Cartwright
//!
//! SQLite storage for carts and everything that hangs off them, plus the
//! retry loop every cart mutation runs inside.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cartwright Data Flow                             │
//! │                                                                         │
//! │  CartAggregate::add_line_item(cart_id, input)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   cartwright-db (THIS CRATE)                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  transaction  │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │               │    │               │    │  (embedded)  │  │   │
//! │  │   │ run_transact- │───►│ CartRepo      │    │ 001_initial  │  │   │
//! │  │   │ ionally       │    │ LineItemRepo  │    │              │  │   │
//! │  │   │ (retry loop)  │    │ PaymentRepo   │    │              │  │   │
//! │  │   └───────┬───────┘    └───────────────┘    └──────────────┘  │   │
//! │  │           │                                                     │   │
//! │  │   ┌───────┴───────┐                                             │   │
//! │  │   │   Database    │  SqlitePool, WAL, foreign keys              │   │
//! │  │   └───────────────┘                                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`transaction`] - `run_transactionally` and its retry options
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations (cart, line item, payment, ...)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cartwright_db::{run_transactionally, CartRepository, Database, DbConfig, TransactionOptions};
//!
//! let db = Database::new(DbConfig::new("cartwright.db")).await?;
//!
//! let cart = run_transactionally(db.pool(), &TransactionOptions::default(), |mut tx| async move {
//!     let result = CartRepository::get(&mut *tx, "cart_id").await;
//!     (tx, result)
//! })
//! .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod transaction;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use transaction::{run_transactionally, TransactionError, TransactionOptions, Tx};

// Repository re-exports for convenience
pub use repository::address::AddressRepository;
pub use repository::cart::{CartFilter, CartRelations, CartRepository};
pub use repository::discount::DiscountRepository;
pub use repository::gift_card::GiftCardRepository;
pub use repository::line_item::LineItemRepository;
pub use repository::payment::{PaymentRepository, PaymentSessionRepository, RefundRepository};
pub use repository::shipping::ShippingMethodRepository;
