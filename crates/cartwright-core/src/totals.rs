//! # Totals Calculator
//!
//! Computes the derived monetary fields of a cart snapshot. Pure: it
//! never mutates the cart and never recomputes tax lines or adjustments.
//!
//! ## Composition Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  subtotal        = Σ item.unit_price × item.quantity                   │
//! │  discount_total  = Σ item adjustments           (capped at subtotal)   │
//! │  shipping_total  = Σ method.price     (already zeroed by free shipping)│
//! │  tax_total       = Σ (item subtotal − item discount) × item tax lines  │
//! │                  + Σ method.price × method tax lines                   │
//! │  gift_card_total = min(Σ card balances, amount due before gift cards)  │
//! │                                                                         │
//! │  total = subtotal − discount_total + shipping_total + tax_total        │
//! │          − gift_card_total                               (floor 0)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```rust
//! use cartwright_core::{Cart, TotalsCalculator, TotalsConfig, RoundingPolicy};
//!
//! let cart = Cart::new("reg_us");
//! let totals = TotalsCalculator::new(RoundingPolicy::HalfUp)
//!     .calculate(&cart, &TotalsConfig::default());
//! assert_eq!(totals.total, Some(0));
//! ```

use serde::{Deserialize, Serialize};

use crate::money::{Money, RoundingPolicy};
use crate::types::{Cart, LineItem, ShippingMethod};

// =============================================================================
// Configuration
// =============================================================================

/// Selects which fields `TotalsCalculator::calculate` fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsConfig {
    pub subtotal: bool,
    pub discount_total: bool,
    pub shipping_total: bool,
    pub tax_total: bool,
    pub gift_card_total: bool,
    pub total: bool,
    /// Include per-line-item totals.
    pub items: bool,
}

impl Default for TotalsConfig {
    fn default() -> Self {
        TotalsConfig {
            subtotal: true,
            discount_total: true,
            shipping_total: true,
            tax_total: true,
            gift_card_total: true,
            total: true,
            items: true,
        }
    }
}

impl TotalsConfig {
    /// Nothing selected; combine with the builder methods.
    pub fn none() -> Self {
        TotalsConfig {
            subtotal: false,
            discount_total: false,
            shipping_total: false,
            tax_total: false,
            gift_card_total: false,
            total: false,
            items: false,
        }
    }

    /// Only the grand total.
    pub fn total_only() -> Self {
        TotalsConfig {
            total: true,
            ..TotalsConfig::none()
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Totals for a single line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemTotals {
    pub item_id: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub subtotal: i64,
    pub discount_total: i64,
    pub tax_total: i64,
    pub total: i64,
}

/// Derived cart fields. Unselected fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub subtotal: Option<i64>,
    pub discount_total: Option<i64>,
    pub shipping_total: Option<i64>,
    pub tax_total: Option<i64>,
    pub gift_card_total: Option<i64>,
    pub total: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub items: Vec<LineItemTotals>,
}

// =============================================================================
// Calculator
// =============================================================================

/// Pure totals computation with a fixed rounding policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalsCalculator {
    rounding: RoundingPolicy,
}

impl TotalsCalculator {
    pub fn new(rounding: RoundingPolicy) -> Self {
        TotalsCalculator { rounding }
    }

    pub fn rounding(&self) -> RoundingPolicy {
        self.rounding
    }

    /// Totals for one line item, from its persisted adjustments and tax lines.
    pub fn line_item_totals(&self, item: &LineItem) -> LineItemTotals {
        let subtotal = item.subtotal();
        let discount = item.discount_total().min(subtotal).floor_zero();
        let taxable = (subtotal - discount).floor_zero();
        let tax: Money = item
            .tax_lines
            .iter()
            .map(|line| taxable.apply_bps(line.rate_bps, self.rounding))
            .sum();

        LineItemTotals {
            item_id: item.id.clone(),
            unit_price: item.unit_price,
            quantity: item.quantity,
            subtotal: subtotal.cents(),
            discount_total: discount.cents(),
            tax_total: tax.cents(),
            total: (taxable + tax).cents(),
        }
    }

    fn shipping_tax(&self, method: &ShippingMethod) -> Money {
        let price = Money::from_cents(method.price);
        method
            .tax_lines
            .iter()
            .map(|line| price.apply_bps(line.rate_bps, self.rounding))
            .sum()
    }

    pub fn subtotal(&self, cart: &Cart) -> Money {
        cart.items.iter().map(LineItem::subtotal).sum()
    }

    pub fn shipping_total(&self, cart: &Cart) -> Money {
        cart.shipping_methods
            .iter()
            .map(|m| Money::from_cents(m.price))
            .sum()
    }

    /// Grand total only.
    pub fn total(&self, cart: &Cart) -> Money {
        Money::from_cents(self.calculate(cart, &TotalsConfig::total_only()).total.unwrap_or(0))
    }

    /// Computes every total and keeps the ones selected by `config`.
    pub fn calculate(&self, cart: &Cart, config: &TotalsConfig) -> CartTotals {
        let item_totals: Vec<LineItemTotals> =
            cart.items.iter().map(|i| self.line_item_totals(i)).collect();

        let subtotal = self.subtotal(cart);
        let discount_total = Money::from_cents(item_totals.iter().map(|t| t.discount_total).sum())
            .min(subtotal);
        let shipping_total = self.shipping_total(cart);
        let item_tax = Money::from_cents(item_totals.iter().map(|t| t.tax_total).sum());
        let shipping_tax: Money = cart.shipping_methods.iter().map(|m| self.shipping_tax(m)).sum();
        let tax_total = item_tax + shipping_tax;

        let due_before_gift_cards = (subtotal - discount_total + shipping_total + tax_total).floor_zero();
        let gift_card_balance: Money = cart
            .gift_cards
            .iter()
            .map(|g| Money::from_cents(g.balance))
            .sum();
        let gift_card_total = gift_card_balance.floor_zero().min(due_before_gift_cards);

        let total = (due_before_gift_cards - gift_card_total).floor_zero();

        let pick = |selected: bool, value: Money| selected.then_some(value.cents());
        CartTotals {
            subtotal: pick(config.subtotal, subtotal),
            discount_total: pick(config.discount_total, discount_total),
            shipping_total: pick(config.shipping_total, shipping_total),
            tax_total: pick(config.tax_total, tax_total),
            gift_card_total: pick(config.gift_card_total, gift_card_total),
            total: pick(config.total, total),
            items: if config.items { item_totals } else { Vec::new() },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
