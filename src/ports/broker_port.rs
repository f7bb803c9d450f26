//! Brokerage execution port trait.
//!
//! All calls are remote and fallible. Callers wrap them in a timeout and
//! retry only [`BrokerError::is_transient`] failures.

use async_trait::async_trait;

use crate::domain::error::BrokerError;
use crate::domain::order::{Order, OrderAck};
use crate::domain::position::Position;

/// Account figures as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAccount {
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
}

#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Submit `order`; its `id` is sent as the client order id.
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    /// Look an order up by client order id. `None` when the broker never
    /// received it.
    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, BrokerError>;

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;
}
