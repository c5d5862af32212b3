//! # Cart Repository
//!
//! Cart rows, relation loading and the cart ↔ discount / gift card links.
//!
//! ## Relation Loading
//! ```text
//! CartRepository::load(conn, id, &CartRelations { items: true, .. })
//!        │
//!        ├── carts row                       (always)
//!        ├── addresses                       relations.addresses
//!        ├── line_items + tax/adjustments    relations.items
//!        ├── shipping_methods + tax          relations.shipping_methods
//!        ├── payment_sessions                relations.payment_sessions
//!        ├── discounts (rule, conditions)    relations.discounts
//!        └── gift_cards                      relations.gift_cards
//! ```

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

use crate::error::DbResult;
use crate::repository::address::AddressRepository;
use crate::repository::discount::DiscountRepository;
use crate::repository::gift_card::GiftCardRepository;
use crate::repository::line_item::LineItemRepository;
use crate::repository::payment::PaymentSessionRepository;
use crate::repository::shipping::ShippingMethodRepository;
use crate::repository::{metadata_from_json, metadata_to_json};
use cartwright_core::{Cart, CartStatus};

/// Which relations `load` populates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartRelations {
    pub items: bool,
    pub shipping_methods: bool,
    pub payment_sessions: bool,
    pub discounts: bool,
    pub gift_cards: bool,
    pub addresses: bool,
}

impl CartRelations {
    pub fn all() -> Self {
        CartRelations {
            items: true,
            shipping_methods: true,
            payment_sessions: true,
            discounts: true,
            gift_cards: true,
            addresses: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct CartFilter {
    pub customer_id: Option<String>,
    pub region_id: Option<String>,
    pub status: Option<CartStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct CartRow {
    id: String,
    email: Option<String>,
    customer_id: Option<String>,
    region_id: String,
    sales_channel_id: Option<String>,
    billing_address_id: Option<String>,
    shipping_address_id: Option<String>,
    status: CartStatus,
    payment_authorized_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CartRow {
    fn into_cart(self) -> DbResult<Cart> {
        Ok(Cart {
            id: self.id,
            email: self.email,
            customer_id: self.customer_id,
            region_id: self.region_id,
            sales_channel_id: self.sales_channel_id,
            billing_address_id: self.billing_address_id,
            shipping_address_id: self.shipping_address_id,
            billing_address: None,
            shipping_address: None,
            items: Vec::new(),
            shipping_methods: Vec::new(),
            payment_sessions: Vec::new(),
            discounts: Vec::new(),
            gift_cards: Vec::new(),
            status: self.status,
            payment_authorized_at: self.payment_authorized_at,
            completed_at: self.completed_at,
            metadata: metadata_from_json(&self.metadata)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Cart persistence.
pub struct CartRepository;

impl CartRepository {
    /// Inserts the cart row. Relations are written by their own repositories.
    pub async fn insert(conn: &mut SqliteConnection, cart: &Cart) -> DbResult<()> {
        debug!(id = %cart.id, region_id = %cart.region_id, "Inserting cart");

        sqlx::query(
            r#"
            INSERT INTO carts (
                id, email, customer_id, region_id, sales_channel_id,
                billing_address_id, shipping_address_id, status,
                payment_authorized_at, completed_at, metadata, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&cart.id)
        .bind(&cart.email)
        .bind(&cart.customer_id)
        .bind(&cart.region_id)
        .bind(&cart.sales_channel_id)
        .bind(&cart.billing_address_id)
        .bind(&cart.shipping_address_id)
        .bind(cart.status)
        .bind(cart.payment_authorized_at)
        .bind(cart.completed_at)
        .bind(metadata_to_json(&cart.metadata)?)
        .bind(cart.created_at)
        .bind(cart.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// The bare cart row, without relations.
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Cart>> {
        let row = sqlx::query_as::<_, CartRow>("SELECT * FROM carts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(CartRow::into_cart).transpose()
    }

    /// The cart with the requested relations populated.
    pub async fn load(
        conn: &mut SqliteConnection,
        id: &str,
        relations: &CartRelations,
    ) -> DbResult<Option<Cart>> {
        let Some(mut cart) = Self::get(conn, id).await? else {
            return Ok(None);
        };

        if relations.addresses {
            if let Some(address_id) = cart.billing_address_id.clone() {
                cart.billing_address = AddressRepository::get(conn, &address_id).await?;
            }
            if let Some(address_id) = cart.shipping_address_id.clone() {
                cart.shipping_address = AddressRepository::get(conn, &address_id).await?;
            }
        }
        if relations.items {
            cart.items = LineItemRepository::list_for_cart(conn, id).await?;
        }
        if relations.shipping_methods {
            cart.shipping_methods = ShippingMethodRepository::list_for_cart(conn, id).await?;
        }
        if relations.payment_sessions {
            cart.payment_sessions = PaymentSessionRepository::list_for_cart(conn, id).await?;
        }
        if relations.discounts {
            cart.discounts = DiscountRepository::list_for_cart(conn, id).await?;
        }
        if relations.gift_cards {
            cart.gift_cards = GiftCardRepository::list_for_cart(conn, id).await?;
        }

        Ok(Some(cart))
    }

    /// Bare cart rows matching the filter, newest first.
    pub async fn list(conn: &mut SqliteConnection, filter: &CartFilter) -> DbResult<Vec<Cart>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM carts WHERE 1 = 1");

        if let Some(customer_id) = &filter.customer_id {
            query.push(" AND customer_id = ").push_bind(customer_id.clone());
        }
        if let Some(region_id) = &filter.region_id {
            query.push(" AND region_id = ").push_bind(region_id.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }

        query.push(" ORDER BY created_at DESC, rowid DESC");
        query.push(" LIMIT ").push_bind(filter.limit.unwrap_or(50));
        query.push(" OFFSET ").push_bind(filter.offset.unwrap_or(0));

        let rows = query.build_query_as::<CartRow>().fetch_all(&mut *conn).await?;
        rows.into_iter().map(CartRow::into_cart).collect()
    }

    /// Writes every scalar column of the cart row.
    pub async fn update(conn: &mut SqliteConnection, cart: &Cart) -> DbResult<()> {
        debug!(id = %cart.id, status = ?cart.status, "Updating cart");

        sqlx::query(
            r#"
            UPDATE carts SET
                email = ?2,
                customer_id = ?3,
                region_id = ?4,
                sales_channel_id = ?5,
                billing_address_id = ?6,
                shipping_address_id = ?7,
                status = ?8,
                payment_authorized_at = ?9,
                completed_at = ?10,
                metadata = ?11,
                updated_at = ?12
            WHERE id = ?1
            "#,
        )
        .bind(&cart.id)
        .bind(&cart.email)
        .bind(&cart.customer_id)
        .bind(&cart.region_id)
        .bind(&cart.sales_channel_id)
        .bind(&cart.billing_address_id)
        .bind(&cart.shipping_address_id)
        .bind(cart.status)
        .bind(cart.payment_authorized_at)
        .bind(cart.completed_at)
        .bind(metadata_to_json(&cart.metadata)?)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Deletes the cart; children cascade.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        debug!(id = %id, "Deleting cart");
        let result = sqlx::query("DELETE FROM carts WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Discount links
    // -------------------------------------------------------------------------

    pub async fn add_discount(conn: &mut SqliteConnection, cart_id: &str, discount_id: &str) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO cart_discounts (cart_id, discount_id) VALUES (?1, ?2)")
            .bind(cart_id)
            .bind(discount_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn remove_discount(conn: &mut SqliteConnection, cart_id: &str, discount_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM cart_discounts WHERE cart_id = ?1 AND discount_id = ?2")
            .bind(cart_id)
            .bind(discount_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_discounts(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM cart_discounts WHERE cart_id = ?1")
            .bind(cart_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Gift card links
    // -------------------------------------------------------------------------

    pub async fn add_gift_card(conn: &mut SqliteConnection, cart_id: &str, gift_card_id: &str) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO cart_gift_cards (cart_id, gift_card_id) VALUES (?1, ?2)")
            .bind(cart_id)
            .bind(gift_card_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn clear_gift_cards(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM cart_gift_cards WHERE cart_id = ?1")
            .bind(cart_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
