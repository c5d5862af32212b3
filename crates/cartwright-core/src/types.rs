//! # Domain Types
//!
//! Core domain types used throughout Cartwright.
//!
//! ## Aggregate Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Cart                                      │
//! │  id • region_id • customer_id? • sales_channel_id? • status • metadata │
//! │                                                                         │
//! │  ├── billing_address?  / shipping_address?        (Address)            │
//! │  ├── items[]            LineItem ── tax_lines[] ── adjustments[]       │
//! │  ├── shipping_methods[] ShippingMethod ── tax_lines[]                  │
//! │  ├── payment_sessions[] PaymentSession (one per region provider)       │
//! │  ├── discounts[]        ≤ 1 regular  +  ≤ 1 free_shipping              │
//! │  └── gift_cards[]       GiftCard                                        │
//! │                                                                         │
//! │  Owned elsewhere, read as snapshots:                                   │
//! │    Region • Variant/ProductSnapshot • Customer • ShippingOption        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Every persisted entity uses a UUID v4 string `id`. Discounts and gift
//! cards also carry a human-facing `code`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Free-form, caller-namespaced key/value data.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Generates a fresh entity identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Cart
// =============================================================================

/// Lifecycle state of a cart. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    #[default]
    Active,
    Completed,
}

/// The cart aggregate.
///
/// Relations (`items`, `shipping_methods`, ...) are only populated when the
/// corresponding relation was requested at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    pub id: String,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub region_id: String,
    pub sales_channel_id: Option<String>,
    pub billing_address_id: Option<String>,
    pub shipping_address_id: Option<String>,
    pub billing_address: Option<Address>,
    pub shipping_address: Option<Address>,
    pub items: Vec<LineItem>,
    pub shipping_methods: Vec<ShippingMethod>,
    pub payment_sessions: Vec<PaymentSession>,
    pub discounts: Vec<Discount>,
    pub gift_cards: Vec<GiftCard>,
    pub status: CartStatus,
    pub payment_authorized_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    /// Creates an empty active cart in the given region.
    pub fn new(region_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Cart {
            id: new_id(),
            email: None,
            customer_id: None,
            region_id: region_id.into(),
            sales_channel_id: None,
            billing_address_id: None,
            shipping_address_id: None,
            billing_address: None,
            shipping_address: None,
            items: Vec::new(),
            shipping_methods: Vec::new(),
            payment_sessions: Vec::new(),
            discounts: Vec::new(),
            gift_cards: Vec::new(),
            status: CartStatus::Active,
            payment_authorized_at: None,
            completed_at: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status == CartStatus::Completed
    }

    /// The applied non-free-shipping discount, if any.
    pub fn regular_discount(&self) -> Option<&Discount> {
        self.discounts.iter().find(|d| !d.is_free_shipping())
    }

    /// The applied free-shipping discount, if any.
    pub fn free_shipping_discount(&self) -> Option<&Discount> {
        self.discounts.iter().find(|d| d.is_free_shipping())
    }

    #[inline]
    pub fn has_free_shipping(&self) -> bool {
        self.free_shipping_discount().is_some()
    }

    /// The session chosen for checkout.
    pub fn selected_session(&self) -> Option<&PaymentSession> {
        self.payment_sessions.iter().find(|s| s.is_selected)
    }

    pub fn item(&self, item_id: &str) -> Option<&LineItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Country of the shipping address, lower-cased.
    pub fn shipping_country(&self) -> Option<String> {
        self.shipping_address
            .as_ref()
            .and_then(|a| a.country_code.as_ref())
            .map(|c| c.to_lowercase())
    }
}

// =============================================================================
// Address
// =============================================================================

/// A postal address, either stand-alone or owned by a customer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub address_1: Option<String>,
    pub address_2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Inline address data supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressPayload {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub address_1: Option<String>,
    pub address_2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub country_code: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AddressPayload {
    /// Materializes the payload as a new address row.
    pub fn into_address(self) -> Address {
        Address {
            id: new_id(),
            customer_id: None,
            first_name: self.first_name,
            last_name: self.last_name,
            company: self.company,
            address_1: self.address_1,
            address_2: self.address_2,
            city: self.city,
            province: self.province,
            postal_code: self.postal_code,
            country_code: self.country_code.map(|c| c.to_lowercase()),
            phone: self.phone,
            metadata: self.metadata,
        }
    }
}

/// Either a reference to a stored address or an inline payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressInput {
    Id(String),
    Payload(AddressPayload),
}

// =============================================================================
// Line Item
// =============================================================================

/// One purchasable variant and its quantity within a cart.
///
/// Product attributes used by discount conditions and shipping profile
/// checks are snapshotted when the item is added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub cart_id: String,
    pub variant_id: String,
    pub product_id: Option<String>,
    pub product_collection_id: Option<String>,
    pub product_type_id: Option<String>,
    #[serde(default)]
    pub product_tag_ids: Vec<String>,
    pub shipping_profile_id: Option<String>,
    pub title: String,
    /// Unit price in minor units of the cart's currency.
    pub unit_price: i64,
    pub quantity: i64,
    pub should_merge: bool,
    pub allow_discounts: bool,
    pub has_shipping: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tax_lines: Vec<TaxLine>,
    #[serde(default)]
    pub adjustments: Vec<LineItemAdjustment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LineItem {
    /// `unit_price × quantity`.
    #[inline]
    pub fn subtotal(&self) -> Money {
        Money::from_cents(self.unit_price).multiply_quantity(self.quantity)
    }

    /// Sum of all discount adjustments on this item.
    pub fn discount_total(&self) -> Money {
        self.adjustments.iter().map(|a| Money::from_cents(a.amount)).sum()
    }

    /// True when this line and the candidate describe the same purchase and
    /// can be merged into one row.
    pub fn merges_with(&self, variant_id: &str, metadata: &Metadata) -> bool {
        self.should_merge && self.variant_id == variant_id && &self.metadata == metadata
    }
}

/// A derived tax line for a line item or shipping method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    /// Rate in basis points (825 = 8.25%).
    pub rate_bps: u32,
}

/// A discount's effect on one line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemAdjustment {
    pub id: String,
    pub item_id: String,
    pub discount_id: Option<String>,
    pub description: String,
    pub amount: i64,
}

// =============================================================================
// Shipping
// =============================================================================

/// A shipping option instance attached to a cart with a snapshotted price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingMethod {
    pub id: String,
    pub cart_id: String,
    pub shipping_option_id: String,
    pub name: String,
    /// `None` means the option can ship any profile.
    pub profile_id: Option<String>,
    pub price: i64,
    /// Price before free-shipping zeroing.
    pub original_price: i64,
    pub is_custom: bool,
    #[serde(default)]
    pub data: Metadata,
    #[serde(default)]
    pub tax_lines: Vec<TaxLine>,
}

/// A negotiated price override for a shipping option on one cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomShippingOption {
    pub id: String,
    pub cart_id: String,
    pub shipping_option_id: String,
    pub price: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

// =============================================================================
// Payment Session
// =============================================================================

/// Status of a provider payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    #[default]
    Pending,
    RequiresMore,
    Authorized,
    Canceled,
    Error,
}

/// Per-provider, pre-authorization payment negotiation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: String,
    pub cart_id: String,
    pub provider_id: String,
    pub status: PaymentSessionStatus,
    /// Opaque provider data.
    #[serde(default)]
    pub data: Metadata,
    pub amount: i64,
    pub currency_code: String,
    pub is_selected: bool,
    pub is_initiated: bool,
    pub payment_authorized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Payment & Refund
// =============================================================================

/// A created charge, distinct from the session that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub cart_id: Option<String>,
    pub provider_id: String,
    pub amount: i64,
    pub currency_code: String,
    /// Monotonically non-decreasing, never above `amount`.
    pub amount_refunded: i64,
    #[serde(default)]
    pub data: Metadata,
    pub captured_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    #[inline]
    pub fn is_captured(&self) -> bool {
        self.captured_at.is_some()
    }

    /// Balance that can still be refunded. Uncaptured payments have none.
    pub fn refundable(&self) -> i64 {
        if self.is_captured() {
            (self.amount - self.amount_refunded).max(0)
        } else {
            0
        }
    }
}

/// Why money is being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Discount,
    Return,
    Swap,
    ClaimRefund,
    #[default]
    Other,
}

/// A refund of `amount` drawn from one or more payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub payment_ids: Vec<String>,
    pub amount: i64,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Discount
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DiscountRuleType {
    /// `value` is basis points of the eligible subtotal.
    Percentage,
    /// `value` is an amount in minor units.
    Fixed,
    FreeShipping,
}

/// How a fixed discount is spread over items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    /// One amount for the whole cart, split in proportion to item subtotals.
    #[default]
    Total,
    /// The amount applies to each unit of every eligible item.
    Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DiscountConditionType {
    Products,
    ProductTypes,
    ProductCollections,
    ProductTags,
    CustomerGroups,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DiscountConditionOperator {
    In,
    NotIn,
}

/// An allow (`In`) or deny (`NotIn`) list of resources of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountCondition {
    pub id: String,
    pub rule_id: String,
    pub condition_type: DiscountConditionType,
    pub operator: DiscountConditionOperator,
    pub resource_ids: Vec<String>,
}

impl DiscountCondition {
    /// Evaluates the condition against the resource ids a subject has for
    /// this condition's type.
    pub fn matches(&self, subject_ids: &[String]) -> bool {
        let hit = subject_ids.iter().any(|id| self.resource_ids.contains(id));
        match self.operator {
            DiscountConditionOperator::In => hit,
            DiscountConditionOperator::NotIn => !hit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountRule {
    pub id: String,
    pub rule_type: DiscountRuleType,
    pub value: i64,
    pub allocation: AllocationType,
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Vec<DiscountCondition>,
}

/// A promotional rule applicable via a code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discount {
    pub id: String,
    /// Stored upper-case; lookups are case-insensitive.
    pub code: String,
    pub is_dynamic: bool,
    pub is_disabled: bool,
    pub parent_discount_id: Option<String>,
    pub rule: DiscountRule,
    /// Regions where the code may be used.
    pub regions: Vec<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<i64>,
    pub usage_count: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Discount {
    #[inline]
    pub fn is_free_shipping(&self) -> bool {
        self.rule.rule_type == DiscountRuleType::FreeShipping
    }
}

// =============================================================================
// Gift Card
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftCard {
    pub id: String,
    pub code: String,
    pub value: i64,
    pub balance: i64,
    pub region_id: String,
    pub is_disabled: bool,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// External Snapshots
// =============================================================================

/// A region as exposed by the region service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    pub currency_code: String,
    /// Default flat tax rate in basis points.
    pub tax_rate_bps: u32,
    /// ISO 3166-1 alpha-2 codes, lower-case.
    pub countries: Vec<String>,
    pub payment_providers: Vec<String>,
    pub gift_cards_taxable: bool,
    /// When true, tax lines are recreated after every cart change.
    pub automatic_taxes: bool,
}

impl Region {
    pub fn has_country(&self, country_code: &str) -> bool {
        let code = country_code.to_lowercase();
        self.countries.iter().any(|c| c.to_lowercase() == code)
    }
}

/// Product attributes carried by a variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: String,
    pub title: String,
    pub collection_id: Option<String>,
    pub type_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    pub profile_id: Option<String>,
    #[serde(default)]
    pub sales_channel_ids: Vec<String>,
    pub discountable: bool,
    pub is_giftcard: bool,
}

/// A purchasable variant as exposed by the product service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub title: String,
    pub product: ProductSnapshot,
    pub manage_inventory: bool,
    pub allow_backorder: bool,
    pub inventory_quantity: i64,
}

impl Variant {
    /// Checks whether `quantity` units can be sold.
    pub fn can_fulfill(&self, quantity: i64) -> bool {
        !self.manage_inventory || self.allow_backorder || self.inventory_quantity >= quantity
    }
}

/// A customer as exposed by the customer service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub has_account: bool,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Condition a cart has to meet for a shipping option to be offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "amount", rename_all = "snake_case")]
pub enum ShippingRequirement {
    MinSubtotal(i64),
    MaxSubtotal(i64),
}

/// A shipping option as exposed by the fulfillment service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingOption {
    pub id: String,
    pub name: String,
    pub region_id: String,
    /// `None` means the option can ship any profile.
    pub profile_id: Option<String>,
    /// Flat amount. `None` means the price is calculated by the provider.
    pub amount: Option<i64>,
    #[serde(default)]
    pub requirements: Vec<ShippingRequirement>,
    #[serde(default)]
    pub data: Metadata,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payment(amount: i64, refunded: i64, captured: bool) -> Payment {
        let now = Utc::now();
        Payment {
            id: new_id(),
            cart_id: None,
            provider_id: "system".into(),
            amount,
            currency_code: "usd".into(),
            amount_refunded: refunded,
            data: Metadata::new(),
            captured_at: captured.then_some(now),
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_refundable_only_for_captured() {
        assert_eq!(payment(1000, 200, true).refundable(), 800);
        assert_eq!(payment(1000, 0, false).refundable(), 0);
    }

    #[test]
    fn test_condition_operators() {
        let mut condition = DiscountCondition {
            id: new_id(),
            rule_id: "rule".into(),
            condition_type: DiscountConditionType::Products,
            operator: DiscountConditionOperator::In,
            resource_ids: vec!["prod_a".into()],
        };
        assert!(condition.matches(&["prod_a".to_string()]));
        assert!(!condition.matches(&["prod_b".to_string()]));

        condition.operator = DiscountConditionOperator::NotIn;
        assert!(!condition.matches(&["prod_a".to_string()]));
        assert!(condition.matches(&[]));
    }

    #[test]
    fn test_variant_can_fulfill() {
        let mut variant = Variant {
            id: "var".into(),
            title: "Shirt".into(),
            product: ProductSnapshot::default(),
            manage_inventory: true,
            allow_backorder: false,
            inventory_quantity: 2,
        };
        assert!(variant.can_fulfill(2));
        assert!(!variant.can_fulfill(3));

        variant.allow_backorder = true;
        assert!(variant.can_fulfill(3));
    }

    #[test]
    fn test_region_country_is_case_insensitive() {
        let region = Region {
            id: "reg".into(),
            name: "US".into(),
            currency_code: "usd".into(),
            tax_rate_bps: 0,
            countries: vec!["us".into()],
            payment_providers: vec![],
            gift_cards_taxable: true,
            automatic_taxes: true,
        };
        assert!(region.has_country("US"));
        assert!(!region.has_country("de"));
    }

    #[test]
    fn test_address_input_untagged() {
        let by_id: AddressInput = serde_json::from_str("\"addr_1\"").unwrap();
        assert_eq!(by_id, AddressInput::Id("addr_1".into()));

        let inline: AddressInput = serde_json::from_str(r#"{"country_code":"US"}"#).unwrap();
        match inline {
            AddressInput::Payload(p) => {
                assert_eq!(p.into_address().country_code.as_deref(), Some("us"))
            }
            AddressInput::Id(_) => panic!("expected payload"),
        }
    }

    #[test]
    fn test_cart_discount_slots() {
        let cart = Cart::new("reg");
        assert!(cart.regular_discount().is_none());
        assert!(!cart.has_free_shipping());
        assert!(!cart.is_completed());
    }
}
