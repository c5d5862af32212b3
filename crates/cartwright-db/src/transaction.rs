//! # Retryable Transactions
//!
//! Runs a unit of work inside one SQLite transaction and retries the whole
//! unit when the store reports a conflict.
//!
//! ## Attempt Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  attempt = 1                                                            │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  BEGIN ──► work(tx) ──► (tx, Ok)  ──► COMMIT ──► return Ok             │
//! │     │          │                        │                               │
//! │     │          └──► (tx, Err) ──► ROLLBACK                              │
//! │     │                                   │                               │
//! │     ▼                                   ▼                               │
//! │  error.is_transaction_conflict() && attempt < max_attempts ?            │
//! │     │ yes                               │ no                            │
//! │     ▼                                   ▼                               │
//! │  sleep(exponential backoff) ──► retry   return Err (first error)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The work closure owns the transaction for the duration of one attempt
//! and hands it back with its result. Each retry starts from scratch with
//! a fresh transaction; nothing from the failed attempt is visible.
//!
//! SQLite transactions are always serializable, so no isolation level
//! parameter exists.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::error::DbError;

/// Transaction handle passed to units of work.
pub type Tx = sqlx::Transaction<'static, Sqlite>;

// =============================================================================
// Options
// =============================================================================

/// Retry bounds for `run_transactionally`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Total attempts, including the first. Values below 1 act as 1.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl TransactionOptions {
    fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

// =============================================================================
// Error Classification
// =============================================================================

/// Errors that can come out of a unit of work.
///
/// The error type must absorb `DbError` (begin/commit failures) and say
/// whether it represents a retryable conflict.
pub trait TransactionError: From<DbError> + Display {
    fn is_transaction_conflict(&self) -> bool;
}

impl TransactionError for DbError {
    fn is_transaction_conflict(&self) -> bool {
        self.is_conflict()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Executes `work` transactionally, retrying on conflicts.
///
/// ## Example
/// ```rust,ignore
/// let cart = run_transactionally(db.pool(), &TransactionOptions::default(), |mut tx| async move {
///     let result = CartRepository::get(&mut *tx, &cart_id).await;
///     (tx, result)
/// })
/// .await?;
/// ```
pub async fn run_transactionally<T, E, F, Fut>(
    pool: &SqlitePool,
    options: &TransactionOptions,
    mut work: F,
) -> Result<T, E>
where
    F: FnMut(Tx) -> Fut,
    Fut: Future<Output = (Tx, Result<T, E>)>,
    E: TransactionError,
{
    let max_attempts = options.max_attempts.max(1);
    let mut backoff = options.create_backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match run_once(pool, &mut work).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transaction_conflict() && attempt < max_attempts => {
                let delay = backoff.next_backoff().unwrap_or(options.max_backoff);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transaction conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One attempt: begin, run, then commit or roll back.
async fn run_once<T, E, F, Fut>(pool: &SqlitePool, work: &mut F) -> Result<T, E>
where
    F: FnMut(Tx) -> Fut,
    Fut: Future<Output = (Tx, Result<T, E>)>,
    E: TransactionError,
{
    let tx = pool.begin().await.map_err(DbError::from)?;
    let (tx, result) = work(tx).await;

    match result {
        Ok(value) => {
            tx.commit().await.map_err(DbError::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
