//! # Discount Repository
//!
//! Discounts, their shared rules, allowed regions and conditions.
//!
//! ```text
//! discounts ──rule_id──► discount_rules ◄──rule_id── discount_conditions
//!    │                                                    │
//!    ├── discount_regions                                 └── discount_condition_resources
//!    └── parent_discount_id (dynamic codes share the parent's rule)
//! ```
//!
//! Codes are stored upper-case and looked up case-insensitively.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::{metadata_from_json, metadata_to_json};
use cartwright_core::{
    AllocationType, Discount, DiscountCondition, DiscountConditionOperator, DiscountConditionType,
    DiscountRule, DiscountRuleType,
};

const DISCOUNT_SELECT: &str = r#"
    SELECT
        d.id, d.code, d.is_dynamic, d.is_disabled, d.parent_discount_id,
        d.starts_at, d.ends_at, d.usage_limit, d.usage_count, d.metadata,
        d.created_at, d.updated_at,
        r.id AS rule_id, r.type AS rule_type, r.value AS rule_value,
        r.allocation AS rule_allocation, r.description AS rule_description
    FROM discounts d
    JOIN discount_rules r ON r.id = d.rule_id
"#;

#[derive(sqlx::FromRow)]
struct DiscountRow {
    id: String,
    code: String,
    is_dynamic: bool,
    is_disabled: bool,
    parent_discount_id: Option<String>,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
    usage_limit: Option<i64>,
    usage_count: i64,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    rule_id: String,
    rule_type: DiscountRuleType,
    rule_value: i64,
    rule_allocation: AllocationType,
    rule_description: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ConditionRow {
    id: String,
    rule_id: String,
    #[sqlx(rename = "type")]
    condition_type: DiscountConditionType,
    operator: DiscountConditionOperator,
}

/// Discount persistence.
pub struct DiscountRepository;

impl DiscountRepository {
    /// Inserts the rule, the discount, its regions and its conditions.
    ///
    /// A dynamic child (with `parent_discount_id`) reuses the parent's rule
    /// row and only inserts the discount and its regions.
    pub async fn insert(conn: &mut SqliteConnection, discount: &Discount) -> DbResult<()> {
        debug!(id = %discount.id, code = %discount.code, rule_type = ?discount.rule.rule_type, "Inserting discount");

        if discount.parent_discount_id.is_none() {
            sqlx::query(
                "INSERT INTO discount_rules (id, type, value, allocation, description) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&discount.rule.id)
            .bind(discount.rule.rule_type)
            .bind(discount.rule.value)
            .bind(discount.rule.allocation)
            .bind(&discount.rule.description)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO discounts (
                id, code, is_dynamic, is_disabled, parent_discount_id, rule_id,
                starts_at, ends_at, usage_limit, usage_count, metadata, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&discount.id)
        .bind(discount.code.to_uppercase())
        .bind(discount.is_dynamic)
        .bind(discount.is_disabled)
        .bind(&discount.parent_discount_id)
        .bind(&discount.rule.id)
        .bind(discount.starts_at)
        .bind(discount.ends_at)
        .bind(discount.usage_limit)
        .bind(discount.usage_count)
        .bind(metadata_to_json(&discount.metadata)?)
        .bind(discount.created_at)
        .bind(discount.updated_at)
        .execute(&mut *conn)
        .await?;

        for region_id in &discount.regions {
            sqlx::query("INSERT INTO discount_regions (discount_id, region_id) VALUES (?1, ?2)")
                .bind(&discount.id)
                .bind(region_id)
                .execute(&mut *conn)
                .await?;
        }

        if discount.parent_discount_id.is_none() {
            for condition in &discount.rule.conditions {
                Self::insert_condition(conn, condition).await?;
            }
        }

        Ok(())
    }

    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Discount>> {
        let sql = format!("{DISCOUNT_SELECT} WHERE d.id = ?1");
        let row = sqlx::query_as::<_, DiscountRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::hydrate(conn, row).await?)),
            None => Ok(None),
        }
    }

    /// Case-insensitive lookup by code.
    pub async fn get_by_code(conn: &mut SqliteConnection, code: &str) -> DbResult<Option<Discount>> {
        let sql = format!("{DISCOUNT_SELECT} WHERE d.code = ?1");
        let row = sqlx::query_as::<_, DiscountRow>(&sql)
            .bind(code.trim().to_uppercase())
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::hydrate(conn, row).await?)),
            None => Ok(None),
        }
    }

    /// Discounts linked to a cart, in link order.
    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<Discount>> {
        let sql = format!(
            "{DISCOUNT_SELECT} JOIN cart_discounts cd ON cd.discount_id = d.id WHERE cd.cart_id = ?1 ORDER BY cd.rowid"
        );
        let rows = sqlx::query_as::<_, DiscountRow>(&sql)
            .bind(cart_id)
            .fetch_all(&mut *conn)
            .await?;

        let mut discounts = Vec::with_capacity(rows.len());
        for row in rows {
            discounts.push(Self::hydrate(conn, row).await?);
        }
        Ok(discounts)
    }

    pub async fn increment_usage(conn: &mut SqliteConnection, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE discounts SET usage_count = usage_count + 1, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Discount", id));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Conditions
    // -------------------------------------------------------------------------

    /// Inserts a condition with its resources. A second condition with the
    /// same `(rule_id, type, operator)` fails with `UniqueViolation`.
    pub async fn insert_condition(conn: &mut SqliteConnection, condition: &DiscountCondition) -> DbResult<()> {
        debug!(
            id = %condition.id,
            rule_id = %condition.rule_id,
            condition_type = ?condition.condition_type,
            "Inserting discount condition"
        );

        sqlx::query("INSERT INTO discount_conditions (id, rule_id, type, operator) VALUES (?1, ?2, ?3, ?4)")
            .bind(&condition.id)
            .bind(&condition.rule_id)
            .bind(condition.condition_type)
            .bind(condition.operator)
            .execute(&mut *conn)
            .await?;

        Self::insert_resources(conn, &condition.id, &condition.resource_ids).await
    }

    /// Replaces the resource ids of an existing condition.
    pub async fn replace_condition_resources(
        conn: &mut SqliteConnection,
        condition_id: &str,
        resource_ids: &[String],
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM discount_condition_resources WHERE condition_id = ?1")
            .bind(condition_id)
            .execute(&mut *conn)
            .await?;
        Self::insert_resources(conn, condition_id, resource_ids).await
    }

    pub async fn get_condition(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<DiscountCondition>> {
        let row = sqlx::query_as::<_, ConditionRow>(
            "SELECT id, rule_id, type, operator FROM discount_conditions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let resource_ids = Self::resources(conn, &row.id).await?;
        Ok(Some(DiscountCondition {
            id: row.id,
            rule_id: row.rule_id,
            condition_type: row.condition_type,
            operator: row.operator,
            resource_ids,
        }))
    }

    pub async fn delete_condition(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        debug!(id = %id, "Deleting discount condition");
        let result = sqlx::query("DELETE FROM discount_conditions WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn insert_resources(
        conn: &mut SqliteConnection,
        condition_id: &str,
        resource_ids: &[String],
    ) -> DbResult<()> {
        for resource_id in resource_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO discount_condition_resources (condition_id, resource_id) VALUES (?1, ?2)",
            )
            .bind(condition_id)
            .bind(resource_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn resources(conn: &mut SqliteConnection, condition_id: &str) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT resource_id FROM discount_condition_resources WHERE condition_id = ?1 ORDER BY rowid",
        )
        .bind(condition_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    async fn hydrate(conn: &mut SqliteConnection, row: DiscountRow) -> DbResult<Discount> {
        let regions: Vec<String> = sqlx::query_scalar(
            "SELECT region_id FROM discount_regions WHERE discount_id = ?1 ORDER BY rowid",
        )
        .bind(&row.id)
        .fetch_all(&mut *conn)
        .await?;

        let condition_rows = sqlx::query_as::<_, ConditionRow>(
            "SELECT id, rule_id, type, operator FROM discount_conditions WHERE rule_id = ?1 ORDER BY rowid",
        )
        .bind(&row.rule_id)
        .fetch_all(&mut *conn)
        .await?;

        let resource_rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT r.condition_id, r.resource_id
            FROM discount_condition_resources r
            JOIN discount_conditions c ON c.id = r.condition_id
            WHERE c.rule_id = ?1
            ORDER BY r.rowid
            "#,
        )
        .bind(&row.rule_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut resources: HashMap<String, Vec<String>> = HashMap::new();
        for (condition_id, resource_id) in resource_rows {
            resources.entry(condition_id).or_default().push(resource_id);
        }

        let conditions = condition_rows
            .into_iter()
            .map(|c| DiscountCondition {
                resource_ids: resources.remove(&c.id).unwrap_or_default(),
                id: c.id,
                rule_id: c.rule_id,
                condition_type: c.condition_type,
                operator: c.operator,
            })
            .collect();

        Ok(Discount {
            id: row.id,
            code: row.code,
            is_dynamic: row.is_dynamic,
            is_disabled: row.is_disabled,
            parent_discount_id: row.parent_discount_id,
            rule: DiscountRule {
                id: row.rule_id,
                rule_type: row.rule_type,
                value: row.rule_value,
                allocation: row.rule_allocation,
                description: row.rule_description,
                conditions,
            },
            regions,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            usage_limit: row.usage_limit,
            usage_count: row.usage_count,
            metadata: metadata_from_json(&row.metadata)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support;
    use cartwright_core::{new_id, Metadata};
    use chrono::Duration;

    fn percentage(code: &str, value: i64) -> Discount {
        let now = Utc::now();
        Discount {
            id: new_id(),
            code: code.into(),
            is_dynamic: false,
            is_disabled: false,
            parent_discount_id: None,
            rule: DiscountRule {
                id: new_id(),
                rule_type: DiscountRuleType::Percentage,
                value,
                allocation: AllocationType::Total,
                description: None,
                conditions: vec![],
            },
            regions: vec!["reg_us".into()],
            starts_at: now - Duration::days(1),
            ends_at: None,
            usage_limit: None,
            usage_count: 0,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup_by_code() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let mut discount = percentage("ten", 1000);
        discount.rule.conditions.push(DiscountCondition {
            id: new_id(),
            rule_id: discount.rule.id.clone(),
            condition_type: DiscountConditionType::Products,
            operator: DiscountConditionOperator::In,
            resource_ids: vec!["prod_a".into(), "prod_b".into()],
        });
        DiscountRepository::insert(&mut conn, &discount).await.unwrap();

        let loaded = DiscountRepository::get_by_code(&mut conn, " Ten ").await.unwrap().unwrap();
        assert_eq!(loaded.code, "TEN");
        assert_eq!(loaded.rule.value, 1000);
        assert_eq!(loaded.regions, vec!["reg_us"]);
        assert_eq!(loaded.rule.conditions.len(), 1);
        assert_eq!(loaded.rule.conditions[0].resource_ids, vec!["prod_a", "prod_b"]);

        DiscountRepository::increment_usage(&mut conn, &discount.id).await.unwrap();
        let loaded = DiscountRepository::get(&mut conn, &discount.id).await.unwrap().unwrap();
        assert_eq!(loaded.usage_count, 1);

        assert!(DiscountRepository::get_by_code(&mut conn, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_condition_is_unique_violation() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let discount = percentage("dup", 500);
        DiscountRepository::insert(&mut conn, &discount).await.unwrap();

        let condition = DiscountCondition {
            id: new_id(),
            rule_id: discount.rule.id.clone(),
            condition_type: DiscountConditionType::ProductTags,
            operator: DiscountConditionOperator::NotIn,
            resource_ids: vec!["tag_sale".into()],
        };
        DiscountRepository::insert_condition(&mut conn, &condition).await.unwrap();

        let again = DiscountCondition { id: new_id(), ..condition.clone() };
        let err = DiscountRepository::insert_condition(&mut conn, &again).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));

        DiscountRepository::replace_condition_resources(&mut conn, &condition.id, &["tag_new".into()])
            .await
            .unwrap();
        let stored = DiscountRepository::get_condition(&mut conn, &condition.id).await.unwrap().unwrap();
        assert_eq!(stored.resource_ids, vec!["tag_new"]);

        assert!(DiscountRepository::delete_condition(&mut conn, &condition.id).await.unwrap());
        assert!(DiscountRepository::get_condition(&mut conn, &condition.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dynamic_child_shares_parent_rule() {
        let db = test_support::db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let parent = percentage("parent", 1500);
        DiscountRepository::insert(&mut conn, &parent).await.unwrap();

        let child = Discount {
            id: new_id(),
            code: "CHILD1".into(),
            is_dynamic: true,
            parent_discount_id: Some(parent.id.clone()),
            usage_limit: Some(1),
            ..parent.clone()
        };
        DiscountRepository::insert(&mut conn, &child).await.unwrap();

        let loaded = DiscountRepository::get_by_code(&mut conn, "child1").await.unwrap().unwrap();
        assert_eq!(loaded.rule.id, parent.rule.id);
        assert_eq!(loaded.rule.value, 1500);
        assert_eq!(loaded.usage_limit, Some(1));
    }
}
