//! Provider id → adapter mapping.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{PaymentProvider, SystemPaymentProvider};
use crate::error::{CartError, CartResult};

/// Explicit registry of payment adapters. `"system"` is always present.
#[derive(Clone)]
pub struct PaymentProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentProvider>>,
}

impl PaymentProviderRegistry {
    pub fn new() -> Self {
        let mut registry = PaymentProviderRegistry {
            providers: HashMap::new(),
        };
        registry.register(Arc::new(SystemPaymentProvider));
        registry
    }

    /// Adds an adapter, replacing any adapter with the same id.
    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        info!(provider_id = provider.id(), "Registering payment provider");
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    /// The adapter for `provider_id`, or `NotFound`.
    pub fn get(&self, provider_id: &str) -> CartResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CartError::not_found("PaymentProvider", provider_id))
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for PaymentProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PaymentProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[test]
    fn test_system_is_preregistered() {
        let registry = PaymentProviderRegistry::new();
        assert!(registry.contains("system"));
        assert!(matches!(registry.get("stripe"), Err(CartError::NotFound { .. })));
    }

    #[test]
    fn test_register_additional_provider() {
        let registry = PaymentProviderRegistry::new().with(Arc::new(ScriptedProvider::new("manual-card")));
        assert_eq!(registry.ids(), vec!["manual-card", "system"]);
        assert_eq!(registry.get("manual-card").unwrap().id(), "manual-card");
    }
}
