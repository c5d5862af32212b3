//! # Shipping Repository
//!
//! Shipping methods (with tax lines) and per-cart custom shipping options.

use std::collections::HashMap;

use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::{metadata_from_json, metadata_to_json, rate_from_db};
use cartwright_core::{CustomShippingOption, ShippingMethod, TaxLine};

#[derive(sqlx::FromRow)]
struct ShippingMethodRow {
    id: String,
    cart_id: String,
    shipping_option_id: String,
    name: String,
    profile_id: Option<String>,
    price: i64,
    original_price: i64,
    is_custom: bool,
    data: String,
}

impl ShippingMethodRow {
    fn into_method(self) -> DbResult<ShippingMethod> {
        Ok(ShippingMethod {
            id: self.id,
            cart_id: self.cart_id,
            shipping_option_id: self.shipping_option_id,
            name: self.name,
            profile_id: self.profile_id,
            price: self.price,
            original_price: self.original_price,
            is_custom: self.is_custom,
            data: metadata_from_json(&self.data)?,
            tax_lines: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct MethodTaxLineRow {
    id: String,
    shipping_method_id: String,
    name: String,
    code: Option<String>,
    rate_bps: i64,
}

#[derive(sqlx::FromRow)]
struct CustomOptionRow {
    id: String,
    cart_id: String,
    shipping_option_id: String,
    price: i64,
    metadata: String,
}

/// Shipping method persistence.
pub struct ShippingMethodRepository;

impl ShippingMethodRepository {
    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<ShippingMethod>> {
        let rows = sqlx::query_as::<_, ShippingMethodRow>(
            "SELECT * FROM shipping_methods WHERE cart_id = ?1 ORDER BY rowid",
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;

        let tax_rows = sqlx::query_as::<_, MethodTaxLineRow>(
            r#"
            SELECT t.id, t.shipping_method_id, t.name, t.code, t.rate_bps
            FROM shipping_method_tax_lines t
            JOIN shipping_methods m ON m.id = t.shipping_method_id
            WHERE m.cart_id = ?1
            ORDER BY t.rowid
            "#,
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut tax_by_method: HashMap<String, Vec<TaxLine>> = HashMap::new();
        for row in tax_rows {
            tax_by_method
                .entry(row.shipping_method_id)
                .or_default()
                .push(TaxLine {
                    id: row.id,
                    name: row.name,
                    code: row.code,
                    rate_bps: rate_from_db(row.rate_bps),
                });
        }

        rows.into_iter()
            .map(|row| {
                let mut method = row.into_method()?;
                method.tax_lines = tax_by_method.remove(&method.id).unwrap_or_default();
                Ok(method)
            })
            .collect()
    }

    pub async fn insert(conn: &mut SqliteConnection, method: &ShippingMethod) -> DbResult<()> {
        debug!(
            id = %method.id,
            cart_id = %method.cart_id,
            option_id = %method.shipping_option_id,
            price = method.price,
            "Inserting shipping method"
        );

        sqlx::query(
            r#"
            INSERT INTO shipping_methods (
                id, cart_id, shipping_option_id, name, profile_id,
                price, original_price, is_custom, data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&method.id)
        .bind(&method.cart_id)
        .bind(&method.shipping_option_id)
        .bind(&method.name)
        .bind(&method.profile_id)
        .bind(method.price)
        .bind(method.original_price)
        .bind(method.is_custom)
        .bind(metadata_to_json(&method.data)?)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn update_price(conn: &mut SqliteConnection, id: &str, price: i64) -> DbResult<()> {
        sqlx::query("UPDATE shipping_methods SET price = ?2 WHERE id = ?1")
            .bind(id)
            .bind(price)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        debug!(id = %id, "Deleting shipping method");
        let result = sqlx::query("DELETE FROM shipping_methods WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM shipping_methods WHERE cart_id = ?1")
            .bind(cart_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Replaces the tax lines of one method.
    pub async fn replace_tax_lines(
        conn: &mut SqliteConnection,
        method_id: &str,
        lines: &[TaxLine],
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM shipping_method_tax_lines WHERE shipping_method_id = ?1")
            .bind(method_id)
            .execute(&mut *conn)
            .await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO shipping_method_tax_lines (id, shipping_method_id, name, code, rate_bps)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&line.id)
            .bind(method_id)
            .bind(&line.name)
            .bind(&line.code)
            .bind(line.rate_bps as i64)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_tax_lines_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            DELETE FROM shipping_method_tax_lines
            WHERE shipping_method_id IN (SELECT id FROM shipping_methods WHERE cart_id = ?1)
            "#,
        )
        .bind(cart_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Custom shipping options
    // -------------------------------------------------------------------------

    pub async fn list_custom_options(
        conn: &mut SqliteConnection,
        cart_id: &str,
    ) -> DbResult<Vec<CustomShippingOption>> {
        let rows = sqlx::query_as::<_, CustomOptionRow>(
            "SELECT * FROM custom_shipping_options WHERE cart_id = ?1 ORDER BY rowid",
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(CustomShippingOption {
                    id: row.id,
                    cart_id: row.cart_id,
                    shipping_option_id: row.shipping_option_id,
                    price: row.price,
                    metadata: metadata_from_json(&row.metadata)?,
                })
            })
            .collect()
    }

    pub async fn insert_custom_option(
        conn: &mut SqliteConnection,
        option: &CustomShippingOption,
    ) -> DbResult<()> {
        debug!(
            cart_id = %option.cart_id,
            option_id = %option.shipping_option_id,
            price = option.price,
            "Inserting custom shipping option"
        );

        sqlx::query(
            r#"
            INSERT INTO custom_shipping_options (id, cart_id, shipping_option_id, price, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&option.id)
        .bind(&option.cart_id)
        .bind(&option.shipping_option_id)
        .bind(option.price)
        .bind(metadata_to_json(&option.metadata)?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::repository::cart::CartRepository;
    use crate::repository::test_support;
    use cartwright_core::{new_id, Cart, Metadata};

    #[tokio::test]
    async fn test_methods_and_custom_options() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let cart = Cart::new("reg_us");
        CartRepository::insert(&mut conn, &cart).await.unwrap();

        let method = ShippingMethod {
            id: new_id(),
            cart_id: cart.id.clone(),
            shipping_option_id: "so_standard".into(),
            name: "Standard".into(),
            profile_id: None,
            price: 500,
            original_price: 500,
            is_custom: false,
            data: Metadata::new(),
            tax_lines: vec![],
        };
        ShippingMethodRepository::insert(&mut conn, &method).await.unwrap();
        ShippingMethodRepository::update_price(&mut conn, &method.id, 0).await.unwrap();
        ShippingMethodRepository::replace_tax_lines(
            &mut conn,
            &method.id,
            &[TaxLine { id: new_id(), name: "Tax".into(), code: None, rate_bps: 1000 }],
        )
        .await
        .unwrap();

        let methods = ShippingMethodRepository::list_for_cart(&mut conn, &cart.id).await.unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].price, 0);
        assert_eq!(methods[0].original_price, 500);
        assert_eq!(methods[0].tax_lines.len(), 1);

        let custom = CustomShippingOption {
            id: new_id(),
            cart_id: cart.id.clone(),
            shipping_option_id: "so_standard".into(),
            price: 250,
            metadata: Metadata::new(),
        };
        ShippingMethodRepository::insert_custom_option(&mut conn, &custom).await.unwrap();
        let duplicate = CustomShippingOption { id: new_id(), ..custom.clone() };
        let err = ShippingMethodRepository::insert_custom_option(&mut conn, &duplicate)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));

        let options = ShippingMethodRepository::list_custom_options(&mut conn, &cart.id).await.unwrap();
        assert_eq!(options, vec![custom]);

        assert_eq!(ShippingMethodRepository::delete_for_cart(&mut conn, &cart.id).await.unwrap(), 1);
    }
}
