//! Addresses and region changes.
//!
//! ```text
//! set_region(cart, new_region)
//!   ├── shipping methods present ─────────────────► NotAllowed
//!   ├── items present and currency differs ───────► NotAllowed
//!   ├── a discount excludes the new region ───────► NotAllowed
//!   └── otherwise
//!         clear discounts, gift cards, payment sessions
//!         set or clear the shipping country
//!         reprice every item for the new region
//! ```

use cartwright_core::validation::normalize_country_code;
use cartwright_core::{Address, AddressInput, AddressPayload, Cart, Region};
use cartwright_db::{run_transactionally, AddressRepository, CartRepository};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::CartAggregate;
use crate::error::{CartError, CartResult};
use crate::events::CartEvent;

impl CartAggregate {
    // -------------------------------------------------------------------------
    // Addresses
    // -------------------------------------------------------------------------

    pub async fn update_billing_address(&self, cart_id: &str, address: AddressInput) -> CartResult<Cart> {
        let address = &address;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let address = self.resolve_address(&mut *tx, address).await?;
                cart.billing_address_id = Some(address.id.clone());
                cart.billing_address = Some(address);
                CartRepository::update(&mut *tx, &cart).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Sets the shipping address. A country outside the cart's region moves
    /// the cart to the region serving that country.
    pub async fn update_shipping_address(&self, cart_id: &str, address: AddressInput) -> CartResult<Cart> {
        let address = &address;
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                let mut region = self.services.regions.retrieve(&cart.region_id).await?;
                self.update_shipping_address_in(&mut *tx, &mut cart, &mut region, address).await?;
                CartRepository::update(&mut *tx, &cart).await?;
                self.refresh(&mut *tx, &mut cart, &region).await?;
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    /// Loads a stored address by id or stores an inline payload.
    pub(super) async fn resolve_address(&self, conn: &mut SqliteConnection, input: &AddressInput) -> CartResult<Address> {
        match input {
            AddressInput::Id(id) => AddressRepository::get(conn, id)
                .await?
                .ok_or_else(|| CartError::not_found("Address", id)),
            AddressInput::Payload(payload) => {
                let mut address = payload.clone().into_address();
                if let Some(code) = &address.country_code {
                    address.country_code = Some(normalize_country_code(code)?);
                }
                AddressRepository::upsert(conn, &address).await?;
                Ok(address)
            }
        }
    }

    pub(super) fn ensure_country_in_region(country_code: Option<&str>, region: &Region) -> CartResult<()> {
        match country_code {
            Some(code) if !region.has_country(code) => Err(CartError::InvalidData(format!(
                "Shipping country {code} is not in region {}",
                region.name
            ))),
            _ => Ok(()),
        }
    }

    /// Stores an address that only carries a country.
    pub(super) async fn country_only_address(
        &self,
        conn: &mut SqliteConnection,
        country_code: &str,
        region: &Region,
    ) -> CartResult<Address> {
        let code = normalize_country_code(country_code)?;
        Self::ensure_country_in_region(Some(&code), region)?;

        let address = AddressPayload {
            country_code: Some(code),
            ..Default::default()
        }
        .into_address();
        AddressRepository::upsert(conn, &address).await?;
        Ok(address)
    }

    pub(super) async fn update_shipping_address_in(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        region: &mut Region,
        input: &AddressInput,
    ) -> CartResult<()> {
        let address = self.resolve_address(conn, input).await?;
        let country_code = address.country_code.clone();
        cart.shipping_address_id = Some(address.id.clone());
        cart.shipping_address = Some(address);

        // set_region_in keeps a shipping address the serving region covers
        if let Some(code) = country_code.as_deref() {
            if !region.has_country(code) {
                let serving = self.services.regions.retrieve_by_country(code).await?;
                info!(cart_id = %cart.id, from = %region.id, to = %serving.id, "Shipping country moves cart to another region");
                self.set_region_in(conn, cart, region, &serving, None).await?;
                *region = serving;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Region
    // -------------------------------------------------------------------------

    /// Moves the cart to another region.
    pub async fn set_region(&self, cart_id: &str, region_id: &str, country_code: Option<String>) -> CartResult<Cart> {
        let new_region = self.services.regions.retrieve(region_id).await?;

        let new_region = &new_region;
        let country_code = country_code.as_deref();
        let cart = run_transactionally(self.db.pool(), &self.tx_options, |mut tx| async move {
            let result = async {
                let mut cart = Self::load_active(&mut *tx, cart_id).await?;
                if cart.region_id != new_region.id {
                    let current = self.services.regions.retrieve(&cart.region_id).await?;
                    self.set_region_in(&mut *tx, &mut cart, &current, new_region, country_code).await?;
                    self.refresh(&mut *tx, &mut cart, new_region).await?;
                }
                Ok::<_, CartError>(cart)
            }
            .await;
            (tx, result)
        })
        .await?;

        self.emit(CartEvent::Updated { cart_id: cart.id.clone() }).await;
        Ok(cart)
    }

    pub(super) async fn set_region_in(
        &self,
        conn: &mut SqliteConnection,
        cart: &mut Cart,
        current: &Region,
        new_region: &Region,
        country_code: Option<&str>,
    ) -> CartResult<()> {
        if !cart.shipping_methods.is_empty() {
            return Err(CartError::not_allowed(
                "Remove the shipping methods before changing the cart's region",
            ));
        }
        if !cart.items.is_empty() && current.currency_code != new_region.currency_code {
            return Err(CartError::not_allowed(format!(
                "Cannot move a cart with items from {} to {}",
                current.currency_code, new_region.currency_code
            )));
        }
        if let Some(discount) = cart.discounts.iter().find(|d| !d.regions.contains(&new_region.id)) {
            return Err(CartError::not_allowed(format!(
                "Discount {} is not valid in region {}",
                discount.code, new_region.name
            )));
        }

        cart.region_id = new_region.id.clone();

        if !cart.discounts.is_empty() {
            CartRepository::clear_discounts(conn, &cart.id).await?;
            cart.discounts.clear();
        }
        if !cart.gift_cards.is_empty() {
            CartRepository::clear_gift_cards(conn, &cart.id).await?;
            cart.gift_cards.clear();
        }
        for session in std::mem::take(&mut cart.payment_sessions) {
            self.payments.delete_session(conn, &session).await?;
        }

        match country_code {
            Some(code) => {
                let address = self.country_only_address(conn, code, new_region).await?;
                cart.shipping_address_id = Some(address.id.clone());
                cart.shipping_address = Some(address);
            }
            None => {
                let compatible = cart
                    .shipping_country()
                    .is_some_and(|code| new_region.has_country(&code));
                if !compatible {
                    debug!(cart_id = %cart.id, "Clearing shipping address outside the new region");
                    cart.shipping_address_id = None;
                    cart.shipping_address = None;
                    if let [only] = new_region.countries.as_slice() {
                        let address = self.country_only_address(conn, only, new_region).await?;
                        cart.shipping_address_id = Some(address.id.clone());
                        cart.shipping_address = Some(address);
                    }
                }
            }
        }

        self.reprice_items(conn, cart, new_region).await?;
        CartRepository::update(conn, cart).await?;

        info!(cart_id = %cart.id, region_id = %new_region.id, "Cart region changed");
        Ok(())
    }
}
