//! # Address Repository

use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::{metadata_from_json, metadata_to_json};
use cartwright_core::Address;

#[derive(sqlx::FromRow)]
struct AddressRow {
    id: String,
    customer_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    company: Option<String>,
    address_1: Option<String>,
    address_2: Option<String>,
    city: Option<String>,
    province: Option<String>,
    postal_code: Option<String>,
    country_code: Option<String>,
    phone: Option<String>,
    metadata: String,
}

impl AddressRow {
    fn into_address(self) -> DbResult<Address> {
        Ok(Address {
            id: self.id,
            customer_id: self.customer_id,
            first_name: self.first_name,
            last_name: self.last_name,
            company: self.company,
            address_1: self.address_1,
            address_2: self.address_2,
            city: self.city,
            province: self.province,
            postal_code: self.postal_code,
            country_code: self.country_code,
            phone: self.phone,
            metadata: metadata_from_json(&self.metadata)?,
        })
    }
}

/// Address persistence.
pub struct AddressRepository;

impl AddressRepository {
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Address>> {
        let row = sqlx::query_as::<_, AddressRow>("SELECT * FROM addresses WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(AddressRow::into_address).transpose()
    }

    /// Inserts the address, or overwrites every column if the id exists.
    pub async fn upsert(conn: &mut SqliteConnection, address: &Address) -> DbResult<()> {
        debug!(id = %address.id, "Upserting address");

        sqlx::query(
            r#"
            INSERT INTO addresses (
                id, customer_id, first_name, last_name, company,
                address_1, address_2, city, province, postal_code,
                country_code, phone, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                customer_id = excluded.customer_id,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                company = excluded.company,
                address_1 = excluded.address_1,
                address_2 = excluded.address_2,
                city = excluded.city,
                province = excluded.province,
                postal_code = excluded.postal_code,
                country_code = excluded.country_code,
                phone = excluded.phone,
                metadata = excluded.metadata
            "#,
        )
        .bind(&address.id)
        .bind(&address.customer_id)
        .bind(&address.first_name)
        .bind(&address.last_name)
        .bind(&address.company)
        .bind(&address.address_1)
        .bind(&address.address_2)
        .bind(&address.city)
        .bind(&address.province)
        .bind(&address.postal_code)
        .bind(&address.country_code)
        .bind(&address.phone)
        .bind(metadata_to_json(&address.metadata)?)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support;
    use cartwright_core::AddressPayload;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let mut address = AddressPayload {
            city: Some("Austin".into()),
            country_code: Some("US".into()),
            ..Default::default()
        }
        .into_address();
        AddressRepository::upsert(&mut conn, &address).await.unwrap();

        address.city = Some("Dallas".into());
        AddressRepository::upsert(&mut conn, &address).await.unwrap();

        let loaded = AddressRepository::get(&mut conn, &address.id).await.unwrap().unwrap();
        assert_eq!(loaded.city.as_deref(), Some("Dallas"));
        assert_eq!(loaded.country_code.as_deref(), Some("us"));
        assert!(AddressRepository::get(&mut conn, "missing").await.unwrap().is_none());
    }
}
