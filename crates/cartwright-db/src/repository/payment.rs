//! # Payment Repository
//!
//! Payment sessions, payments and refunds.
//!
//! ```text
//! payment_sessions (cart_id, provider_id UNIQUE)
//!        │ authorize
//!        ▼
//! payments ── amount_refunded ≤ amount (CHECK)
//!        ▲
//!        │ refund_payments (refund_id, payment_id, amount)
//! refunds
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::{metadata_from_json, metadata_to_json};
use cartwright_core::refund::RefundAllocation;
use cartwright_core::{Payment, PaymentSession, PaymentSessionStatus, Refund, RefundReason};

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    cart_id: String,
    provider_id: String,
    status: PaymentSessionStatus,
    data: String,
    amount: i64,
    currency_code: String,
    is_selected: bool,
    is_initiated: bool,
    payment_authorized_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self) -> DbResult<PaymentSession> {
        Ok(PaymentSession {
            id: self.id,
            cart_id: self.cart_id,
            provider_id: self.provider_id,
            status: self.status,
            data: metadata_from_json(&self.data)?,
            amount: self.amount,
            currency_code: self.currency_code,
            is_selected: self.is_selected,
            is_initiated: self.is_initiated,
            payment_authorized_at: self.payment_authorized_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    cart_id: Option<String>,
    provider_id: String,
    amount: i64,
    currency_code: String,
    amount_refunded: i64,
    data: String,
    captured_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PaymentRow {
    fn into_payment(self) -> DbResult<Payment> {
        Ok(Payment {
            id: self.id,
            cart_id: self.cart_id,
            provider_id: self.provider_id,
            amount: self.amount,
            currency_code: self.currency_code,
            amount_refunded: self.amount_refunded,
            data: metadata_from_json(&self.data)?,
            captured_at: self.captured_at,
            canceled_at: self.canceled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: String,
    amount: i64,
    reason: RefundReason,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

// =============================================================================
// Payment Sessions
// =============================================================================

/// Payment session persistence.
pub struct PaymentSessionRepository;

impl PaymentSessionRepository {
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<PaymentSession>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM payment_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<PaymentSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM payment_sessions WHERE cart_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub async fn insert(conn: &mut SqliteConnection, session: &PaymentSession) -> DbResult<()> {
        debug!(
            id = %session.id,
            cart_id = %session.cart_id,
            provider_id = %session.provider_id,
            amount = session.amount,
            "Inserting payment session"
        );

        sqlx::query(
            r#"
            INSERT INTO payment_sessions (
                id, cart_id, provider_id, status, data, amount, currency_code,
                is_selected, is_initiated, payment_authorized_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&session.id)
        .bind(&session.cart_id)
        .bind(&session.provider_id)
        .bind(session.status)
        .bind(metadata_to_json(&session.data)?)
        .bind(session.amount)
        .bind(&session.currency_code)
        .bind(session.is_selected)
        .bind(session.is_initiated)
        .bind(session.payment_authorized_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Writes status, data, amount, selection and authorization stamp.
    pub async fn update(conn: &mut SqliteConnection, session: &PaymentSession) -> DbResult<()> {
        debug!(id = %session.id, status = ?session.status, "Updating payment session");

        sqlx::query(
            r#"
            UPDATE payment_sessions SET
                status = ?2,
                data = ?3,
                amount = ?4,
                currency_code = ?5,
                is_selected = ?6,
                is_initiated = ?7,
                payment_authorized_at = ?8,
                updated_at = ?9
            WHERE id = ?1
            "#,
        )
        .bind(&session.id)
        .bind(session.status)
        .bind(metadata_to_json(&session.data)?)
        .bind(session.amount)
        .bind(&session.currency_code)
        .bind(session.is_selected)
        .bind(session.is_initiated)
        .bind(session.payment_authorized_at)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Marks exactly one session of the cart as selected.
    pub async fn select(conn: &mut SqliteConnection, cart_id: &str, provider_id: &str) -> DbResult<()> {
        sqlx::query("UPDATE payment_sessions SET is_selected = (provider_id = ?2) WHERE cart_id = ?1")
            .bind(cart_id)
            .bind(provider_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        debug!(id = %id, "Deleting payment session");
        let result = sqlx::query("DELETE FROM payment_sessions WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Payments
// =============================================================================

/// Payment persistence.
pub struct PaymentRepository;

impl PaymentRepository {
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(PaymentRow::into_payment).transpose()
    }

    pub async fn list_for_cart(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM payments WHERE cart_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(cart_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(PaymentRow::into_payment).collect()
    }

    pub async fn insert(conn: &mut SqliteConnection, payment: &Payment) -> DbResult<()> {
        debug!(id = %payment.id, provider_id = %payment.provider_id, amount = payment.amount, "Inserting payment");

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, cart_id, provider_id, amount, currency_code, amount_refunded,
                data, captured_at, canceled_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.cart_id)
        .bind(&payment.provider_id)
        .bind(payment.amount)
        .bind(&payment.currency_code)
        .bind(payment.amount_refunded)
        .bind(metadata_to_json(&payment.data)?)
        .bind(payment.captured_at)
        .bind(payment.canceled_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Writes data, refunded amount and capture/cancel stamps.
    pub async fn update(conn: &mut SqliteConnection, payment: &Payment) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE payments SET
                amount_refunded = ?2,
                data = ?3,
                captured_at = ?4,
                canceled_at = ?5,
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(&payment.id)
        .bind(payment.amount_refunded)
        .bind(metadata_to_json(&payment.data)?)
        .bind(payment.captured_at)
        .bind(payment.canceled_at)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Refunds
// =============================================================================

/// Refund persistence.
pub struct RefundRepository;

impl RefundRepository {
    /// Inserts one refund row and its per-payment allocation links.
    pub async fn insert(
        conn: &mut SqliteConnection,
        refund: &Refund,
        allocations: &[RefundAllocation],
    ) -> DbResult<()> {
        debug!(id = %refund.id, amount = refund.amount, payments = allocations.len(), "Inserting refund");

        sqlx::query("INSERT INTO refunds (id, amount, reason, note, created_at) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(&refund.id)
            .bind(refund.amount)
            .bind(refund.reason)
            .bind(&refund.note)
            .bind(refund.created_at)
            .execute(&mut *conn)
            .await?;

        for allocation in allocations {
            sqlx::query("INSERT INTO refund_payments (refund_id, payment_id, amount) VALUES (?1, ?2, ?3)")
                .bind(&refund.id)
                .bind(&allocation.payment_id)
                .bind(allocation.amount)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub async fn get(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Refund>> {
        let row = sqlx::query_as::<_, RefundRow>("SELECT * FROM refunds WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payment_ids: Vec<String> = sqlx::query_scalar(
            "SELECT payment_id FROM refund_payments WHERE refund_id = ?1 ORDER BY rowid",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(Some(Refund {
            id: row.id,
            payment_ids,
            amount: row.amount,
            reason: row.reason,
            note: row.note,
            created_at: row.created_at,
        }))
    }

    /// Number of refunds touching a payment.
    pub async fn count_for_payment(conn: &mut SqliteConnection, payment_id: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM refund_payments WHERE payment_id = ?1")
            .bind(payment_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }
}
