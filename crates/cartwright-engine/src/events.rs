//! # Cart Events
//!
//! Named events fired after a unit of work commits. Delivery and ordering
//! are the bus's concern.
//!
//! ```text
//! run_transactionally(..) ──► COMMIT ──► EventBus::emit(CartEvent::Updated { .. })
//!                     │
//!                     └── ROLLBACK ──► nothing emitted
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CartEvent {
    Created { cart_id: String },
    Updated { cart_id: String },
    CustomerUpdated { cart_id: String, customer_id: Option<String> },
}

impl CartEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            CartEvent::Created { .. } => "cart.created",
            CartEvent::Updated { .. } => "cart.updated",
            CartEvent::CustomerUpdated { .. } => "cart.customer_updated",
        }
    }

    pub fn cart_id(&self) -> &str {
        match self {
            CartEvent::Created { cart_id }
            | CartEvent::Updated { cart_id }
            | CartEvent::CustomerUpdated { cart_id, .. } => cart_id,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: CartEvent);
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<CartEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        BroadcastEventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn emit(&self, event: CartEvent) {
        let name = event.name();
        let cart_id = event.cart_id().to_string();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = name, cart_id = %cart_id, receivers, "Event emitted"),
            Err(_) => debug!(event = name, cart_id = %cart_id, "Event dropped, no subscribers"),
        }
    }
}
