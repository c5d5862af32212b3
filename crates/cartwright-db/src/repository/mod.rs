//! # Repository Module
//!
//! Database repository implementations for Cartwright.
//!
//! ## Explicit Connection Passing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_transactionally(pool, opts, |mut tx| async move {                 │
//! │      CartRepository::load(&mut *tx, id, &relations).await              │
//! │      LineItemRepository::insert(&mut *tx, &item).await                 │
//! │      ...                                                               │
//! │  })                                                                    │
//! │                                                                         │
//! │  Repositories hold no state. Every function takes the connection       │
//! │  (usually the active transaction) as its first argument, so all        │
//! │  reads and writes of one unit of work share one transaction.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`CartRepository`](cart::CartRepository) - Carts, relation loading, discount/gift card links
//! - [`AddressRepository`](address::AddressRepository) - Addresses
//! - [`LineItemRepository`](line_item::LineItemRepository) - Line items, tax lines, adjustments
//! - [`ShippingMethodRepository`](shipping::ShippingMethodRepository) - Shipping methods and custom options
//! - [`PaymentSessionRepository`](payment::PaymentSessionRepository) - Sessions, payments, refunds
//! - [`DiscountRepository`](discount::DiscountRepository) - Discounts, rules, conditions
//! - [`GiftCardRepository`](gift_card::GiftCardRepository) - Gift cards

pub mod address;
pub mod cart;
pub mod discount;
pub mod gift_card;
pub mod line_item;
pub mod payment;
pub mod shipping;

use cartwright_core::Metadata;

use crate::error::DbResult;

/// Parses a JSON object column.
pub(crate) fn metadata_from_json(raw: &str) -> DbResult<Metadata> {
    if raw.is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Serializes a JSON object column.
pub(crate) fn metadata_to_json(metadata: &Metadata) -> DbResult<String> {
    Ok(serde_json::to_string(metadata)?)
}

/// Parses a JSON string-array column.
pub(crate) fn ids_from_json(raw: &str) -> DbResult<Vec<String>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Serializes a JSON string-array column.
pub(crate) fn ids_to_json(ids: &[String]) -> DbResult<String> {
    Ok(serde_json::to_string(ids)?)
}

/// Converts a stored basis-point rate.
pub(crate) fn rate_from_db(rate_bps: i64) -> u32 {
    rate_bps.clamp(0, u32::MAX as i64) as u32
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_columns() {
        let mut metadata = Metadata::new();
        metadata.insert("gift".into(), serde_json::json!(true));
        let raw = metadata_to_json(&metadata).unwrap();
        assert_eq!(metadata_from_json(&raw).unwrap(), metadata);
        assert!(metadata_from_json("").unwrap().is_empty());
        assert!(metadata_from_json("[1]").is_err());

        assert_eq!(ids_from_json(r#"["a","b"]"#).unwrap(), vec!["a", "b"]);
        assert_eq!(ids_to_json(&[]).unwrap(), "[]");
    }

    #[test]
    fn test_rate_from_db() {
        assert_eq!(rate_from_db(825), 825);
        assert_eq!(rate_from_db(-1), 0);
    }
}
