//! # Line Item Repository
//!
//! Line items plus their derived rows (tax lines, adjustments).
//!
//! ```text
//! line_items ──┬── line_item_tax_lines    (replaced wholesale on recompute)
//!              └── line_item_adjustments  (replaced wholesale on recompute)
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::{ids_from_json, ids_to_json, metadata_from_json, metadata_to_json, rate_from_db};
use cartwright_core::{LineItem, LineItemAdjustment, TaxLine};

#[derive(sqlx::FromRow)]
struct LineItemRow {
    id: String,
    cart_id: String,
    variant_id: String,
    product_id: Option<String>,
    product_collection_id: Option<String>,
    product_type_id: Option<String>,
    product_tag_ids: String,
    shipping_profile_id: Option<String>,
    title: String,
    unit_price: i64,
    quantity: i64,
    should_merge: bool,
    allow_discounts: bool,
    has_shipping: bool,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LineItemRow {
    fn into_item(self) -> DbResult<LineItem> {
        Ok(LineItem {
            id: self.id,
            cart_id: self.cart_id,
            variant_id: self.variant_id,
            product_id: self.product_id,
            product_collection_id: self.product_collection_id,
            product_type_id: self.product_type_id,
            product_tag_ids: ids_from_json(&self.product_tag_ids)?,
            shipping_profile_id: self.shipping_profile_id,
            title: self.title,
            unit_price: self.unit_price,
            quantity: self.quantity,
            should_merge: self.should_merge,
            allow_discounts: self.allow_discounts,
            has_shipping: self.has_shipping,
            metadata: metadata_from_json(&self.metadata)?,
            tax_lines: Vec::new(),
            adjustments: Vec::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaxLineRow {
    id: String,
    owner_id: String,
    name: String,
    code: Option<String>,
    rate_bps: i64,
}

impl TaxLineRow {
    fn into_parts(self) -> (String, TaxLine) {
        (
            self.owner_id,
            TaxLine {
                id: self.id,
                name: self.name,
                code: self.code,
                rate_bps: rate_from_db(self.rate_bps),
            },
        )
    }
}

#[derive(sqlx::FromRow)]
struct AdjustmentRow {
    id: String,
    item_id: String,
    discount_id: Option<String>,
    description: String,
    amount: i64,
}

/// Line item persistence.
pub struct LineItemRepository;

impl LineItemRepository {
    /// Loads one item with its tax lines and adjustments.
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<LineItem>> {
        let row = sqlx::query_as::<_, LineItemRow>("SELECT * FROM line_items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut items = vec![row.into_item()?];
        Self::attach_children(conn, &mut items).await?;
        Ok(items.pop())
    }

    /// Loads all items of a cart in insertion order.
    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<LineItem>> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            "SELECT * FROM line_items WHERE cart_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut items = rows
            .into_iter()
            .map(LineItemRow::into_item)
            .collect::<DbResult<Vec<_>>>()?;
        Self::attach_children(conn, &mut items).await?;
        Ok(items)
    }

    async fn attach_children(conn: &mut SqliteConnection, items: &mut [LineItem]) -> DbResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let cart_id = items[0].cart_id.clone();

        let tax_rows = sqlx::query_as::<_, TaxLineRow>(
            r#"
            SELECT t.id, t.item_id AS owner_id, t.name, t.code, t.rate_bps
            FROM line_item_tax_lines t
            JOIN line_items i ON i.id = t.item_id
            WHERE i.cart_id = ?1
            ORDER BY t.rowid
            "#,
        )
        .bind(&cart_id)
        .fetch_all(&mut *conn)
        .await?;

        let adjustment_rows = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT a.id, a.item_id, a.discount_id, a.description, a.amount
            FROM line_item_adjustments a
            JOIN line_items i ON i.id = a.item_id
            WHERE i.cart_id = ?1
            ORDER BY a.rowid
            "#,
        )
        .bind(&cart_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut tax_by_item: HashMap<String, Vec<TaxLine>> = HashMap::new();
        for row in tax_rows {
            let (owner, line) = row.into_parts();
            tax_by_item.entry(owner).or_default().push(line);
        }

        let mut adjustments_by_item: HashMap<String, Vec<LineItemAdjustment>> = HashMap::new();
        for row in adjustment_rows {
            adjustments_by_item
                .entry(row.item_id.clone())
                .or_default()
                .push(LineItemAdjustment {
                    id: row.id,
                    item_id: row.item_id,
                    discount_id: row.discount_id,
                    description: row.description,
                    amount: row.amount,
                });
        }

        for item in items.iter_mut() {
            item.tax_lines = tax_by_item.remove(&item.id).unwrap_or_default();
            item.adjustments = adjustments_by_item.remove(&item.id).unwrap_or_default();
        }
        Ok(())
    }

    pub async fn insert(conn: &mut SqliteConnection, item: &LineItem) -> DbResult<()> {
        debug!(id = %item.id, cart_id = %item.cart_id, variant_id = %item.variant_id, "Inserting line item");

        sqlx::query(
            r#"
            INSERT INTO line_items (
                id, cart_id, variant_id, product_id, product_collection_id,
                product_type_id, product_tag_ids, shipping_profile_id, title,
                unit_price, quantity, should_merge, allow_discounts, has_shipping,
                metadata, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(&item.id)
        .bind(&item.cart_id)
        .bind(&item.variant_id)
        .bind(&item.product_id)
        .bind(&item.product_collection_id)
        .bind(&item.product_type_id)
        .bind(ids_to_json(&item.product_tag_ids)?)
        .bind(&item.shipping_profile_id)
        .bind(&item.title)
        .bind(item.unit_price)
        .bind(item.quantity)
        .bind(item.should_merge)
        .bind(item.allow_discounts)
        .bind(item.has_shipping)
        .bind(metadata_to_json(&item.metadata)?)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Writes the mutable columns (price, quantity, flags, metadata).
    pub async fn update(conn: &mut SqliteConnection, item: &LineItem) -> DbResult<()> {
        debug!(id = %item.id, quantity = item.quantity, unit_price = item.unit_price, "Updating line item");

        sqlx::query(
            r#"
            UPDATE line_items SET
                unit_price = ?2,
                quantity = ?3,
                has_shipping = ?4,
                allow_discounts = ?5,
                metadata = ?6,
                updated_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(&item.id)
        .bind(item.unit_price)
        .bind(item.quantity)
        .bind(item.has_shipping)
        .bind(item.allow_discounts)
        .bind(metadata_to_json(&item.metadata)?)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Deletes an item; its tax lines and adjustments cascade.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        debug!(id = %id, "Deleting line item");
        let result = sqlx::query("DELETE FROM line_items WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Derived rows
    // -------------------------------------------------------------------------

    /// Replaces every adjustment of the cart's items.
    pub async fn replace_adjustments(
        conn: &mut SqliteConnection,
        cart_id: &str,
        adjustments: &[LineItemAdjustment],
    ) -> DbResult<()> {
        sqlx::query(
            "DELETE FROM line_item_adjustments WHERE item_id IN (SELECT id FROM line_items WHERE cart_id = ?1)",
        )
        .bind(cart_id)
        .execute(&mut *conn)
        .await?;

        for adjustment in adjustments {
            sqlx::query(
                r#"
                INSERT INTO line_item_adjustments (id, item_id, discount_id, description, amount)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&adjustment.id)
            .bind(&adjustment.item_id)
            .bind(&adjustment.discount_id)
            .bind(&adjustment.description)
            .bind(adjustment.amount)
            .execute(&mut *conn)
            .await?;
        }

        debug!(cart_id = %cart_id, count = adjustments.len(), "Replaced line item adjustments");
        Ok(())
    }

    /// Replaces the tax lines of one item.
    pub async fn replace_tax_lines(
        conn: &mut SqliteConnection,
        item_id: &str,
        lines: &[TaxLine],
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM line_item_tax_lines WHERE item_id = ?1")
            .bind(item_id)
            .execute(&mut *conn)
            .await?;

        for line in lines {
            sqlx::query(
                "INSERT INTO line_item_tax_lines (id, item_id, name, code, rate_bps) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&line.id)
            .bind(item_id)
            .bind(&line.name)
            .bind(&line.code)
            .bind(line.rate_bps as i64)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Clears the tax lines of every item in a cart.
    pub async fn delete_tax_lines_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
        sqlx::query(
            "DELETE FROM line_item_tax_lines WHERE item_id IN (SELECT id FROM line_items WHERE cart_id = ?1)",
        )
        .bind(cart_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
