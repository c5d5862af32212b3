//! In-memory collaborators and fixtures shared by the engine tests.
//!
//! ```text
//! Catalog
//!   variant_shirt  prod_shirt  usd 1000 / eur  900  channel sc_web     stock 100
//!   variant_shoes  prod_shoes  usd 5000 / eur 4500  channel sc_web     collection pcol_shoes
//!   variant_mug    prod_mug    usd 1200 / eur 1100  channel sc_retail  stock 5
//!
//! Regions
//!   reg_us  usd  [us]      providers [system]
//!   reg_eu  eur  [de, fr]  providers [system]
//!
//! Shipping options
//!   so_standard 500 · so_express 1500 · so_calculated (calculated)
//!   so_overnight 2500, subtotal >= 5000 · so_eu 800 (reg_eu)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cartwright_core::{
    new_id, Cart, Customer, Discount, DiscountRuleType, LineItem, Metadata, PaymentSessionStatus,
    ProductSnapshot, Region, ShippingMethod, ShippingOption, ShippingRequirement, Variant,
};
use cartwright_db::{Database, DbConfig};
use chrono::Utc;

use crate::cart::{CartAggregate, Collaborators, CreateCartInput, LineItemInput};
use crate::config::EngineConfig;
use crate::discount::CreateDiscountInput;
use crate::error::{CartError, CartResult, ProviderError};
use crate::events::BroadcastEventBus;
use crate::payment::{AuthorizationResult, CreatedPayment, PaymentContext, PaymentProvider, PaymentProviderRegistry};
use crate::services::{
    CustomerService, PriceContext, PriceSelectionStrategy, RegionService, ShippingOptionService, SystemTaxProvider,
    VariantService,
};

/// Price returned for options without a flat amount.
pub const CALCULATED_SHIPPING_PRICE: i64 = 750;

pub async fn database() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

// =============================================================================
// Snapshots
// =============================================================================

pub fn us_region() -> Region {
    Region {
        id: "reg_us".into(),
        name: "United States".into(),
        currency_code: "usd".into(),
        tax_rate_bps: 0,
        countries: vec!["us".into()],
        payment_providers: vec!["system".into()],
        gift_cards_taxable: true,
        automatic_taxes: true,
    }
}

pub fn eu_region() -> Region {
    Region {
        id: "reg_eu".into(),
        name: "Europe".into(),
        currency_code: "eur".into(),
        tax_rate_bps: 0,
        countries: vec!["de".into(), "fr".into()],
        payment_providers: vec!["system".into()],
        gift_cards_taxable: true,
        automatic_taxes: true,
    }
}

pub fn line_item(cart_id: &str, variant_id: &str, unit_price: i64, quantity: i64) -> LineItem {
    let now = Utc::now();
    LineItem {
        id: new_id(),
        cart_id: cart_id.to_string(),
        variant_id: variant_id.to_string(),
        product_id: Some("prod_shirt".into()),
        product_collection_id: None,
        product_type_id: None,
        product_tag_ids: vec![],
        shipping_profile_id: Some("default".into()),
        title: "Shirt".into(),
        unit_price,
        quantity,
        should_merge: true,
        allow_discounts: true,
        has_shipping: false,
        metadata: Metadata::new(),
        tax_lines: vec![],
        adjustments: vec![],
        created_at: now,
        updated_at: now,
    }
}

pub fn shipping_method(cart_id: &str, price: i64) -> ShippingMethod {
    ShippingMethod {
        id: new_id(),
        cart_id: cart_id.to_string(),
        shipping_option_id: "so_standard".into(),
        name: "Standard".into(),
        profile_id: Some("default".into()),
        price,
        original_price: price,
        is_custom: false,
        data: Metadata::new(),
        tax_lines: vec![],
    }
}

fn variant(id: &str, product: &str, collection: Option<&str>, channel: &str, stock: i64) -> Variant {
    Variant {
        id: id.to_string(),
        title: "Default".into(),
        product: ProductSnapshot {
            id: format!("prod_{product}"),
            title: product[..1].to_uppercase() + &product[1..],
            collection_id: collection.map(str::to_string),
            type_id: None,
            tag_ids: vec![],
            profile_id: Some("default".into()),
            sales_channel_ids: vec![channel.to_string()],
            discountable: true,
            is_giftcard: false,
        },
        manage_inventory: true,
        allow_backorder: false,
        inventory_quantity: stock,
    }
}

// =============================================================================
// Collaborators
// =============================================================================

pub struct InMemoryRegions {
    regions: Vec<Region>,
}

impl Default for InMemoryRegions {
    fn default() -> Self {
        InMemoryRegions {
            regions: vec![us_region(), eu_region()],
        }
    }
}

#[async_trait]
impl RegionService for InMemoryRegions {
    async fn retrieve(&self, region_id: &str) -> CartResult<Region> {
        self.regions
            .iter()
            .find(|r| r.id == region_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("Region", region_id))
    }

    async fn retrieve_by_country(&self, country_code: &str) -> CartResult<Region> {
        self.regions
            .iter()
            .find(|r| r.has_country(country_code))
            .cloned()
            .ok_or_else(|| CartError::not_found("Region", country_code))
    }
}

pub struct InMemoryVariants {
    variants: Vec<Variant>,
}

impl Default for InMemoryVariants {
    fn default() -> Self {
        InMemoryVariants {
            variants: vec![
                variant("variant_shirt", "shirt", None, "sc_web", 100),
                variant("variant_shoes", "shoes", Some("pcol_shoes"), "sc_web", 100),
                variant("variant_mug", "mug", None, "sc_retail", 5),
            ],
        }
    }
}

#[async_trait]
impl VariantService for InMemoryVariants {
    async fn retrieve(&self, variant_id: &str) -> CartResult<Variant> {
        self.variants
            .iter()
            .find(|v| v.id == variant_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("Variant", variant_id))
    }
}

/// Fixed price list keyed by variant and currency.
pub struct InMemoryPrices {
    prices: HashMap<(String, String), i64>,
}

impl Default for InMemoryPrices {
    fn default() -> Self {
        let entries = [
            ("variant_shirt", "usd", 1000),
            ("variant_shirt", "eur", 900),
            ("variant_shoes", "usd", 5000),
            ("variant_shoes", "eur", 4500),
            ("variant_mug", "usd", 1200),
            ("variant_mug", "eur", 1100),
        ];
        InMemoryPrices {
            prices: entries
                .into_iter()
                .map(|(v, c, p)| ((v.to_string(), c.to_string()), p))
                .collect(),
        }
    }
}

#[async_trait]
impl PriceSelectionStrategy for InMemoryPrices {
    async fn calculate_unit_price(&self, variant: &Variant, context: &PriceContext) -> CartResult<i64> {
        self.prices
            .get(&(variant.id.clone(), context.currency_code.clone()))
            .copied()
            .ok_or_else(|| CartError::not_found("Price", format!("{}/{}", variant.id, context.currency_code)))
    }
}

#[derive(Default)]
pub struct InMemoryCustomers {
    customers: Mutex<HashMap<String, Customer>>,
}

impl InMemoryCustomers {
    pub fn with(self, customer: Customer) -> Self {
        self.customers.lock().unwrap().insert(customer.id.clone(), customer);
        self
    }
}

#[async_trait]
impl CustomerService for InMemoryCustomers {
    async fn retrieve(&self, customer_id: &str) -> CartResult<Customer> {
        self.customers
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("Customer", customer_id))
    }

    async fn retrieve_or_create_by_email(&self, email: &str) -> CartResult<Customer> {
        let mut customers = self.customers.lock().unwrap();
        if let Some(found) = customers.values().find(|c| c.email == email) {
            return Ok(found.clone());
        }
        let customer = Customer {
            id: new_id(),
            email: email.to_string(),
            has_account: false,
            group_ids: vec![],
            metadata: Metadata::new(),
        };
        customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn merge_metadata(&self, customer_id: &str, metadata: Metadata) -> CartResult<()> {
        let mut customers = self.customers.lock().unwrap();
        let customer = customers
            .get_mut(customer_id)
            .ok_or_else(|| CartError::not_found("Customer", customer_id))?;
        customer.metadata.extend(metadata);
        Ok(())
    }
}

pub struct InMemoryShippingOptions {
    options: Vec<ShippingOption>,
}

fn option(id: &str, region_id: &str, profile: Option<&str>, amount: Option<i64>) -> ShippingOption {
    ShippingOption {
        id: id.to_string(),
        name: id.trim_start_matches("so_").to_string(),
        region_id: region_id.to_string(),
        profile_id: profile.map(str::to_string),
        amount,
        requirements: vec![],
        data: Metadata::new(),
    }
}

impl Default for InMemoryShippingOptions {
    fn default() -> Self {
        let mut overnight = option("so_overnight", "reg_us", None, Some(2500));
        overnight.requirements.push(ShippingRequirement::MinSubtotal(5000));

        InMemoryShippingOptions {
            options: vec![
                option("so_standard", "reg_us", Some("default"), Some(500)),
                option("so_express", "reg_us", Some("default"), Some(1500)),
                option("so_calculated", "reg_us", Some("default"), None),
                overnight,
                option("so_eu", "reg_eu", None, Some(800)),
            ],
        }
    }
}

#[async_trait]
impl ShippingOptionService for InMemoryShippingOptions {
    async fn retrieve(&self, option_id: &str) -> CartResult<ShippingOption> {
        self.options
            .iter()
            .find(|o| o.id == option_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("ShippingOption", option_id))
    }

    async fn calculate_price(&self, _option: &ShippingOption, _cart: &Cart, _data: &Metadata) -> CartResult<i64> {
        Ok(CALCULATED_SHIPPING_PRICE)
    }
}

// =============================================================================
// Scripted payment provider
// =============================================================================

/// Provider that counts calls and fails on demand. Scripted failures fire
/// once.
pub struct ScriptedProvider {
    id: String,
    created: AtomicUsize,
    deleted: AtomicUsize,
    refunded: AtomicUsize,
    delete_failure: Mutex<Option<ProviderError>>,
    capture_failure: Mutex<Option<ProviderError>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        ScriptedProvider {
            id: id.to_string(),
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            refunded: AtomicUsize::new(0),
            delete_failure: Mutex::new(None),
            capture_failure: Mutex::new(None),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn refunded(&self) -> usize {
        self.refunded.load(Ordering::SeqCst)
    }

    pub fn fail_delete_with(&self, error: ProviderError) {
        *self.delete_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_capture_with(&self, error: ProviderError) {
        *self.capture_failure.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_payment(&self, context: &PaymentContext) -> Result<CreatedPayment, ProviderError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut session_data = Metadata::new();
        session_data.insert("reference".into(), new_id().into());
        session_data.insert("amount".into(), context.amount.into());
        Ok(CreatedPayment {
            session_data,
            collected_data: None,
        })
    }

    async fn update_payment(&self, session_data: &Metadata, context: &PaymentContext) -> Result<Metadata, ProviderError> {
        let mut data = session_data.clone();
        data.insert("amount".into(), context.amount.into());
        Ok(data)
    }

    async fn update_payment_data(&self, session_data: &Metadata, data: &Metadata) -> Result<Metadata, ProviderError> {
        let mut merged = session_data.clone();
        merged.extend(data.clone());
        Ok(merged)
    }

    async fn delete_payment(&self, _session_data: &Metadata) -> Result<(), ProviderError> {
        if let Some(error) = self.delete_failure.lock().unwrap().take() {
            return Err(error);
        }
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn authorize_payment(
        &self,
        session_data: &Metadata,
        _context: &Metadata,
    ) -> Result<AuthorizationResult, ProviderError> {
        Ok(AuthorizationResult {
            status: PaymentSessionStatus::Authorized,
            data: session_data.clone(),
        })
    }

    async fn capture_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError> {
        if let Some(error) = self.capture_failure.lock().unwrap().take() {
            return Err(error);
        }
        Ok(payment_data.clone())
    }

    async fn cancel_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError> {
        Ok(payment_data.clone())
    }

    async fn refund_payment(&self, payment_data: &Metadata, _amount: i64) -> Result<Metadata, ProviderError> {
        self.refunded.fetch_add(1, Ordering::SeqCst);
        Ok(payment_data.clone())
    }

    async fn get_payment_data(&self, session_data: &Metadata) -> Result<Metadata, ProviderError> {
        Ok(session_data.clone())
    }

    async fn get_status(&self, _session_data: &Metadata) -> Result<PaymentSessionStatus, ProviderError> {
        Ok(PaymentSessionStatus::Authorized)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A cart aggregate over a fresh in-memory database and the catalog above.
pub struct Harness {
    pub db: Database,
    pub cart: CartAggregate,
    pub events: BroadcastEventBus,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_database(database().await)
    }

    /// Harness over a database file, for tests that need several
    /// connections writing at once.
    pub async fn on_disk(dir: &tempfile::TempDir) -> Self {
        let config = DbConfig::new(dir.path().join("cartwright.db")).max_connections(4);
        Self::with_database(Database::new(config).await.unwrap())
    }

    pub fn with_database(db: Database) -> Self {
        let events = BroadcastEventBus::default();
        let services = Collaborators {
            regions: Arc::new(InMemoryRegions::default()),
            variants: Arc::new(InMemoryVariants::default()),
            prices: Arc::new(InMemoryPrices::default()),
            taxes: Arc::new(SystemTaxProvider),
            customers: Arc::new(InMemoryCustomers::default()),
            shipping_options: Arc::new(InMemoryShippingOptions::default()),
            events: Arc::new(events.clone()),
            payment_providers: Arc::new(PaymentProviderRegistry::new()),
        };
        let cart = CartAggregate::new(db.clone(), &EngineConfig::default(), services);
        Harness { db, cart, events }
    }

    pub async fn empty_cart(&self) -> Cart {
        self.cart
            .create(CreateCartInput {
                region_id: Some("reg_us".into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn cart_with_shirts(&self, quantity: i64) -> Cart {
        self.cart
            .create(CreateCartInput {
                region_id: Some("reg_us".into()),
                items: vec![LineItemInput::new("variant_shirt", quantity)],
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

/// Creates a discount valid in `reg_us`.
pub async fn discount(h: &Harness, code: &str, rule_type: DiscountRuleType, value: i64) -> Discount {
    h.cart
        .discount_engine()
        .create(CreateDiscountInput {
            code: code.to_string(),
            rule_type,
            value,
            allocation: Default::default(),
            description: None,
            regions: vec!["reg_us".into()],
            is_dynamic: false,
            is_disabled: false,
            starts_at: None,
            ends_at: None,
            usage_limit: None,
            conditions: vec![],
            metadata: Metadata::new(),
        })
        .await
        .unwrap()
}
