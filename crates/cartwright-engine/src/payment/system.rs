//! Manual payment provider registered as `"system"`.
//!
//! Nothing is charged; every session authorizes immediately.

use async_trait::async_trait;
use cartwright_core::{Metadata, PaymentSessionStatus, SYSTEM_PROVIDER_ID};

use super::{AuthorizationResult, CreatedPayment, PaymentContext, PaymentProvider};
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPaymentProvider;

#[async_trait]
impl PaymentProvider for SystemPaymentProvider {
    fn id(&self) -> &str {
        SYSTEM_PROVIDER_ID
    }

    async fn create_payment(&self, _context: &PaymentContext) -> Result<CreatedPayment, ProviderError> {
        Ok(CreatedPayment::default())
    }

    async fn update_payment(
        &self,
        session_data: &Metadata,
        _context: &PaymentContext,
    ) -> Result<Metadata, ProviderError> {
        Ok(session_data.clone())
    }

    async fn update_payment_data(
        &self,
        session_data: &Metadata,
        data: &Metadata,
    ) -> Result<Metadata, ProviderError> {
        let mut merged = session_data.clone();
        merged.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(merged)
    }

    async fn delete_payment(&self, _session_data: &Metadata) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn authorize_payment(
        &self,
        session_data: &Metadata,
        _context: &Metadata,
    ) -> Result<AuthorizationResult, ProviderError> {
        Ok(AuthorizationResult {
            status: PaymentSessionStatus::Authorized,
            data: session_data.clone(),
        })
    }

    async fn capture_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError> {
        Ok(payment_data.clone())
    }

    async fn cancel_payment(&self, payment_data: &Metadata) -> Result<Metadata, ProviderError> {
        Ok(payment_data.clone())
    }

    async fn refund_payment(&self, payment_data: &Metadata, _amount: i64) -> Result<Metadata, ProviderError> {
        Ok(payment_data.clone())
    }

    async fn get_payment_data(&self, session_data: &Metadata) -> Result<Metadata, ProviderError> {
        Ok(session_data.clone())
    }

    async fn get_status(&self, _session_data: &Metadata) -> Result<PaymentSessionStatus, ProviderError> {
        Ok(PaymentSessionStatus::Authorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_payment_data_merges() {
        let mut existing = Metadata::new();
        existing.insert("a".into(), serde_json::json!(1));
        let mut incoming = Metadata::new();
        incoming.insert("b".into(), serde_json::json!(2));

        let merged = SystemPaymentProvider.update_payment_data(&existing, &incoming).await.unwrap();
        assert_eq!(merged.len(), 2);

        let auth = SystemPaymentProvider.authorize_payment(&merged, &Metadata::new()).await.unwrap();
        assert_eq!(auth.status, PaymentSessionStatus::Authorized);
    }
}
