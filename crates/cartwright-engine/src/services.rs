//! # External Collaborators
//!
//! Capabilities the engine consumes but does not own. Each is an object-safe
//! async trait held as `Arc<dyn Trait>`.
//!
//! ```text
//! ┌────────────────────────┬───────────────────────────────────────────────┐
//! │ Trait                  │ Used for                                      │
//! ├────────────────────────┼───────────────────────────────────────────────┤
//! │ RegionService          │ currency, countries, providers, tax rate      │
//! │ VariantService         │ product snapshot, inventory, sales channels   │
//! │ PriceSelectionStrategy │ unit price per region/customer/quantity       │
//! │ TaxProvider            │ tax lines for items and shipping methods      │
//! │ CustomerService        │ customer lookup, metadata merge               │
//! │ ShippingOptionService  │ option lookup and calculated prices           │
//! └────────────────────────┴───────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use cartwright_core::{
    new_id, Cart, Customer, Metadata, Region, ShippingOption, TaxLine, Variant,
};

use crate::error::CartResult;

#[async_trait]
pub trait RegionService: Send + Sync {
    async fn retrieve(&self, region_id: &str) -> CartResult<Region>;

    /// The region that serves a country. `NotFound` when none does.
    async fn retrieve_by_country(&self, country_code: &str) -> CartResult<Region>;
}

#[async_trait]
pub trait VariantService: Send + Sync {
    async fn retrieve(&self, variant_id: &str) -> CartResult<Variant>;
}

/// Inputs to unit price selection.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceContext {
    pub region_id: String,
    pub currency_code: String,
    pub customer_id: Option<String>,
    pub quantity: i64,
}

#[async_trait]
pub trait PriceSelectionStrategy: Send + Sync {
    /// Unit price in minor units of `context.currency_code`.
    async fn calculate_unit_price(&self, variant: &Variant, context: &PriceContext) -> CartResult<i64>;
}

/// Tax lines keyed by line item id and shipping method id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CartTaxLines {
    pub items: HashMap<String, Vec<TaxLine>>,
    pub shipping_methods: HashMap<String, Vec<TaxLine>>,
}

#[async_trait]
pub trait TaxProvider: Send + Sync {
    async fn tax_lines(&self, cart: &Cart, region: &Region) -> CartResult<CartTaxLines>;
}

/// Applies the region's flat rate to every item and shipping method.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTaxProvider;

#[async_trait]
impl TaxProvider for SystemTaxProvider {
    async fn tax_lines(&self, cart: &Cart, region: &Region) -> CartResult<CartTaxLines> {
        let line = || TaxLine {
            id: new_id(),
            name: "default".to_string(),
            code: Some("default".to_string()),
            rate_bps: region.tax_rate_bps,
        };

        Ok(CartTaxLines {
            items: cart.items.iter().map(|i| (i.id.clone(), vec![line()])).collect(),
            shipping_methods: cart
                .shipping_methods
                .iter()
                .map(|m| (m.id.clone(), vec![line()]))
                .collect(),
        })
    }
}

#[async_trait]
pub trait CustomerService: Send + Sync {
    async fn retrieve(&self, customer_id: &str) -> CartResult<Customer>;

    /// Finds the customer with this email, creating a guest customer if
    /// there is none.
    async fn retrieve_or_create_by_email(&self, email: &str) -> CartResult<Customer>;

    /// Merges `metadata` into the customer's metadata, key by key.
    async fn merge_metadata(&self, customer_id: &str, metadata: Metadata) -> CartResult<()>;
}

#[async_trait]
pub trait ShippingOptionService: Send + Sync {
    async fn retrieve(&self, option_id: &str) -> CartResult<ShippingOption>;

    /// Price of an option without a flat amount.
    async fn calculate_price(&self, option: &ShippingOption, cart: &Cart, data: &Metadata) -> CartResult<i64>;
}
