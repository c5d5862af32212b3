//! # Gift Card Repository

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{DbError, DbResult};
use cartwright_core::GiftCard;

#[derive(sqlx::FromRow)]
struct GiftCardRow {
    id: String,
    code: String,
    value: i64,
    balance: i64,
    region_id: String,
    is_disabled: bool,
    ends_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<GiftCardRow> for GiftCard {
    fn from(row: GiftCardRow) -> Self {
        GiftCard {
            id: row.id,
            code: row.code,
            value: row.value,
            balance: row.balance,
            region_id: row.region_id,
            is_disabled: row.is_disabled,
            ends_at: row.ends_at,
            created_at: row.created_at,
        }
    }
}

/// Gift card persistence.
pub struct GiftCardRepository;

impl GiftCardRepository {
    pub async fn insert(conn: &mut SqliteConnection, card: &GiftCard) -> DbResult<()> {
        debug!(id = %card.id, code = %card.code, value = card.value, "Inserting gift card");

        sqlx::query(
            r#"
            INSERT INTO gift_cards (id, code, value, balance, region_id, is_disabled, ends_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&card.id)
        .bind(card.code.to_uppercase())
        .bind(card.value)
        .bind(card.balance)
        .bind(&card.region_id)
        .bind(card.is_disabled)
        .bind(card.ends_at)
        .bind(card.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<GiftCard>> {
        let row = sqlx::query_as::<_, GiftCardRow>("SELECT * FROM gift_cards WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Case-insensitive lookup by code.
    pub async fn get_by_code(conn: &mut SqliteConnection, code: &str) -> DbResult<Option<GiftCard>> {
        let row = sqlx::query_as::<_, GiftCardRow>("SELECT * FROM gift_cards WHERE code = ?1")
            .bind(code.trim().to_uppercase())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<GiftCard>> {
        let rows = sqlx::query_as::<_, GiftCardRow>(
            r#"
            SELECT g.*
            FROM gift_cards g
            JOIN cart_gift_cards cg ON cg.gift_card_id = g.id
            WHERE cg.cart_id = ?1
            ORDER BY cg.rowid
            "#,
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Sets the remaining balance. Balances never go negative.
    pub async fn update_balance(conn: &mut SqliteConnection, id: &str, balance: i64) -> DbResult<()> {
        debug!(id = %id, balance, "Updating gift card balance");
        let result = sqlx::query("UPDATE gift_cards SET balance = ?2 WHERE id = ?1")
            .bind(id)
            .bind(balance.max(0))
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("GiftCard", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support;
    use cartwright_core::new_id;

    #[tokio::test]
    async fn test_gift_card_lookup_and_balance() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let card = GiftCard {
            id: new_id(),
            code: "gift-100".into(),
            value: 10_000,
            balance: 10_000,
            region_id: "reg_us".into(),
            is_disabled: false,
            ends_at: None,
            created_at: Utc::now(),
        };
        GiftCardRepository::insert(&mut conn, &card).await.unwrap();

        let loaded = GiftCardRepository::get_by_code(&mut conn, "Gift-100").await.unwrap().unwrap();
        assert_eq!(loaded.code, "GIFT-100");

        GiftCardRepository::update_balance(&mut conn, &card.id, -5).await.unwrap();
        let loaded = GiftCardRepository::get(&mut conn, &card.id).await.unwrap().unwrap();
        assert_eq!(loaded.balance, 0);

        assert!(matches!(
            GiftCardRepository::update_balance(&mut conn, "missing", 1).await,
            Err(DbError::NotFound { .. })
        ));
    }
}
