//! # Refund Planning
//!
//! Splits a refund request across payments.
//!
//! ```text
//! payments (given order)   refundable     request 900
//! ─────────────────────    ──────────     ───────────
//! pay_1  captured 500/0       500    ──►  take 500
//! pay_2  not captured           0    ──►  skip
//! pay_3  captured 800/200     600    ──►  take 400
//! ```
//!
//! Only captured payments contribute. If the request exceeds the combined
//! balance nothing is planned and `RefundExceedsBalance` is returned.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::Payment;
use crate::validation::validate_positive_amount;

/// The share of a refund drawn from one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundAllocation {
    pub payment_id: String,
    pub amount: i64,
}

/// Sum of refundable balances across `payments`.
pub fn total_refundable(payments: &[Payment]) -> i64 {
    payments.iter().map(Payment::refundable).sum()
}

/// Plans how `amount` is drained from `payments`, in their given order.
pub fn plan_refund(payments: &[Payment], amount: i64) -> CoreResult<Vec<RefundAllocation>> {
    validate_positive_amount("amount", amount)?;

    let refundable = total_refundable(payments);
    if amount > refundable {
        return Err(CoreError::RefundExceedsBalance {
            requested: amount,
            refundable,
        });
    }

    let mut remaining = amount;
    let mut plan = Vec::new();
    for payment in payments {
        if remaining == 0 {
            break;
        }
        let available = payment.refundable();
        if available == 0 {
            continue;
        }
        let take = available.min(remaining);
        plan.push(RefundAllocation {
            payment_id: payment.id.clone(),
            amount: take,
        });
        remaining -= take;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use chrono::Utc;

    fn payment(id: &str, amount: i64, refunded: i64, captured: bool) -> Payment {
        let now = Utc::now();
        Payment {
            id: id.to_string(),
            cart_id: None,
            provider_id: "system".into(),
            amount,
            currency_code: "usd".into(),
            amount_refunded: refunded,
            data: Metadata::new(),
            captured_at: captured.then_some(now),
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_plan_drains_in_order() {
        let payments = vec![
            payment("pay_1", 500, 0, true),
            payment("pay_2", 1000, 0, false),
            payment("pay_3", 800, 200, true),
        ];
        assert_eq!(total_refundable(&payments), 1100);

        let plan = plan_refund(&payments, 900).unwrap();
        assert_eq!(
            plan,
            vec![
                RefundAllocation { payment_id: "pay_1".into(), amount: 500 },
                RefundAllocation { payment_id: "pay_3".into(), amount: 400 },
            ]
        );
    }

    #[test]
    fn test_plan_rejects_over_balance() {
        let payments = vec![payment("pay_1", 500, 100, true)];
        let err = plan_refund(&payments, 401).unwrap_err();
        assert!(matches!(
            err,
            CoreError::RefundExceedsBalance { requested: 401, refundable: 400 }
        ));
    }

    #[test]
    fn test_plan_requires_positive_amount() {
        let payments = vec![payment("pay_1", 500, 0, true)];
        assert!(matches!(plan_refund(&payments, 0), Err(CoreError::Validation(_))));
    }
}
