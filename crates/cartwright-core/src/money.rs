//! # Money Module
//!
//! Provides the `Money` type and the `RoundingPolicy` used wherever a
//! fractional minor unit has to be resolved.
//!
//! ## Integer Minor Units
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  In floating point:                                                     │
//! │    0.1 + 0.2 = 0.30000000000000004  ❌ WRONG!                           │
//! │                                                                         │
//! │  OUR SOLUTION: Integer minor units (cents for USD)                     │
//! │    1000 × 10% = 100 exactly                                            │
//! │    1000 × 8.25% = 82.5 → RoundingPolicy decides: 83 / 82 / 82          │
//! │                                                                         │
//! │  Every fraction is resolved in exactly ONE place: RoundingPolicy       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use cartwright_core::money::{Money, RoundingPolicy};
//!
//! let price = Money::from_cents(1099);
//! let line = price * 2i64;
//! assert_eq!(line.cents(), 2198);
//!
//! let tax = Money::from_cents(1000).apply_bps(825, RoundingPolicy::HalfUp);
//! assert_eq!(tax.cents(), 83);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

/// Basis points in one whole (10000 bps = 100%).
pub const BPS_SCALE: i64 = 10_000;

// =============================================================================
// Rounding Policy
// =============================================================================

/// How a fractional minor unit is resolved.
///
/// ## Policies
/// ```text
/// ┌──────────────┬──────────┬──────────┬──────────┬──────────┐
/// │ exact value  │   82.4   │   82.5   │   83.5   │   82.9   │
/// ├──────────────┼──────────┼──────────┼──────────┼──────────┤
/// │ HalfUp       │    82    │    83    │    84    │    83    │
/// │ HalfEven     │    82    │    82    │    84    │    83    │
/// │ Floor        │    82    │    82    │    83    │    82    │
/// └──────────────┴──────────┴──────────┴──────────┴──────────┘
/// ```
///
/// `HalfUp` rounds halves away from zero. `HalfEven` is bankers rounding.
/// `Floor` always rounds toward negative infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    #[default]
    HalfUp,
    HalfEven,
    Floor,
}

impl RoundingPolicy {
    /// Divides `numerator` by a positive `denominator` and rounds the
    /// quotient according to the policy.
    ///
    /// A zero or negative denominator yields zero.
    pub fn divide(self, numerator: i128, denominator: i128) -> i128 {
        if denominator <= 0 {
            return 0;
        }

        let quotient = numerator.div_euclid(denominator);
        let remainder = numerator.rem_euclid(denominator);
        let twice = remainder * 2;

        match self {
            RoundingPolicy::Floor => quotient,
            RoundingPolicy::HalfEven => {
                if twice > denominator || (twice == denominator && quotient % 2 != 0) {
                    quotient + 1
                } else {
                    quotient
                }
            }
            RoundingPolicy::HalfUp => {
                if numerator >= 0 {
                    if twice >= denominator {
                        quotient + 1
                    } else {
                        quotient
                    }
                } else if twice > denominator {
                    // Euclidean quotient is below the exact value for negatives,
                    // so ties stay on the side away from zero.
                    quotient + 1
                } else {
                    quotient
                }
            }
        }
    }
}

impl fmt::Display for RoundingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundingPolicy::HalfUp => "half_up",
            RoundingPolicy::HalfEven => "half_even",
            RoundingPolicy::Floor => "floor",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit of the cart's currency.
///
/// ## Where Money Flows
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  PriceSelectionStrategy ──► LineItem.unit_price ──► item subtotal      │
/// │                                                        │               │
/// │  Discount rule ──► LineItemAdjustment.amount ──────────┤               │
/// │  ShippingOption ──► ShippingMethod.price ──────────────┤               │
/// │  TaxLine.rate_bps ──► tax_total ───────────────────────┤               │
/// │  GiftCard.balance ──► gift_card_total ─────────────────┤               │
/// │                                                        ▼               │
/// │                                              CartTotals.total          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    ///
    /// ## Example
    /// ```rust
    /// use cartwright_core::money::Money;
    ///
    /// let price = Money::from_cents(1099);
    /// assert_eq!(price.cents(), 1099);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Multiplies money by a quantity.
    ///
    /// ## Example
    /// ```rust
    /// use cartwright_core::money::Money;
    ///
    /// let unit_price = Money::from_cents(299);
    /// assert_eq!(unit_price.multiply_quantity(3).cents(), 897);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Applies a rate in basis points (1000 = 10%) and rounds the result.
    ///
    /// Used for percentage discounts and tax lines. The multiplication is
    /// done in i128 so large amounts cannot overflow.
    ///
    /// ## Example
    /// ```rust
    /// use cartwright_core::money::{Money, RoundingPolicy};
    ///
    /// let amount = Money::from_cents(1000);
    /// assert_eq!(amount.apply_bps(825, RoundingPolicy::HalfUp).cents(), 83);
    /// assert_eq!(amount.apply_bps(825, RoundingPolicy::HalfEven).cents(), 82);
    /// assert_eq!(amount.apply_bps(825, RoundingPolicy::Floor).cents(), 82);
    /// ```
    pub fn apply_bps(&self, bps: u32, policy: RoundingPolicy) -> Money {
        let raw = policy.divide(self.0 as i128 * bps as i128, BPS_SCALE as i128);
        Money(raw as i64)
    }

    /// Returns `self × part / whole`, rounded by `policy`.
    ///
    /// Used to spread a fixed amount across items in proportion to their
    /// share of a subtotal. A non-positive `whole` yields zero.
    pub fn proportion(&self, part: i64, whole: i64, policy: RoundingPolicy) -> Money {
        let raw = policy.divide(self.0 as i128 * part as i128, whole as i128);
        Money(raw as i64)
    }

    /// Returns the smaller of two values.
    #[inline]
    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    /// Clamps negative values to zero.
    #[inline]
    pub fn floor_zero(self) -> Money {
        if self.0 < 0 {
            Money(0)
        } else {
            self
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl From<i64> for Money {
    fn from(cents: i64) -> Self {
        Money(cents)
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(1099).to_string(), "10.99");
        assert_eq!(Money::from_cents(500).to_string(), "5.00");
        assert_eq!(Money::from_cents(-550).to_string(), "-5.50");
        assert_eq!(Money::from_cents(0).to_string(), "0.00");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_cents(1000);
        let b = Money::from_cents(500);

        assert_eq!((a + b).cents(), 1500);
        assert_eq!((a - b).cents(), 500);
        assert_eq!((a * 3i64).cents(), 3000);

        let total: Money = vec![a, b, b].into_iter().sum();
        assert_eq!(total.cents(), 2000);
    }

    #[test]
    fn test_percentage_exact() {
        let amount = Money::from_cents(2000);
        for policy in [RoundingPolicy::HalfUp, RoundingPolicy::HalfEven, RoundingPolicy::Floor] {
            assert_eq!(amount.apply_bps(1000, policy).cents(), 200);
        }
    }

    #[test]
    fn test_rounding_policies_on_ties() {
        // 82.5 and 83.5
        assert_eq!(RoundingPolicy::HalfUp.divide(825, 10), 83);
        assert_eq!(RoundingPolicy::HalfEven.divide(825, 10), 82);
        assert_eq!(RoundingPolicy::Floor.divide(825, 10), 82);

        assert_eq!(RoundingPolicy::HalfUp.divide(835, 10), 84);
        assert_eq!(RoundingPolicy::HalfEven.divide(835, 10), 84);
        assert_eq!(RoundingPolicy::Floor.divide(835, 10), 83);
    }

    #[test]
    fn test_rounding_negative_values() {
        assert_eq!(RoundingPolicy::HalfUp.divide(-825, 10), -83);
        assert_eq!(RoundingPolicy::HalfUp.divide(-824, 10), -82);
        assert_eq!(RoundingPolicy::Floor.divide(-821, 10), -83);
    }

    #[test]
    fn test_zero_denominator() {
        assert_eq!(RoundingPolicy::HalfUp.divide(100, 0), 0);
        assert_eq!(Money::from_cents(100).proportion(1, 0, RoundingPolicy::HalfUp).cents(), 0);
    }

    #[test]
    fn test_proportion() {
        // 500 spread over 1000 / 3000
        let share = Money::from_cents(500).proportion(1000, 3000, RoundingPolicy::HalfUp);
        assert_eq!(share.cents(), 167);
        let floor = Money::from_cents(500).proportion(1000, 3000, RoundingPolicy::Floor);
        assert_eq!(floor.cents(), 166);
    }

    #[test]
    fn test_floor_zero_and_min() {
        assert_eq!(Money::from_cents(-5).floor_zero(), Money::zero());
        assert_eq!(Money::from_cents(5).floor_zero().cents(), 5);
        assert_eq!(Money::from_cents(5).min(Money::from_cents(3)).cents(), 3);
    }

    #[test]
    fn test_rounding_policy_serde() {
        let json = serde_json::to_string(&RoundingPolicy::HalfEven).unwrap();
        assert_eq!(json, "\"half_even\"");
        let parsed: RoundingPolicy = serde_json::from_str("\"floor\"").unwrap();
        assert_eq!(parsed, RoundingPolicy::Floor);
    }
}
