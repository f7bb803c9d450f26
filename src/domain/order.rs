//! Orders, fills and broker acknowledgements.

use std::fmt;

use chrono::{DateTime, Utc};

use super::error::TradegateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }

    pub fn opposite(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<OrderSide> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderType {
    Market,
    Limit(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// What an order is for. Protective exits bypass the risk checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPurpose {
    Entry,
    SignalClose,
    StopLoss,
    TakeProfit,
    /// Flattening at shutdown when `close_on_shutdown` is set.
    Shutdown,
}

impl OrderPurpose {
    pub fn is_protective(self) -> bool {
        matches!(
            self,
            OrderPurpose::StopLoss | OrderPurpose::TakeProfit | OrderPurpose::Shutdown
        )
    }
}

impl fmt::Display for OrderPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderPurpose::Entry => "entry",
            OrderPurpose::SignalClose => "signal_close",
            OrderPurpose::StopLoss => "stop_loss",
            OrderPurpose::TakeProfit => "take_profit",
            OrderPurpose::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub order_type: OrderType,
    /// Reference price at submission; the paper venue fills against it.
    pub requested_price: f64,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub purpose: OrderPurpose,
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn market(
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        requested_price: f64,
        purpose: OrderPurpose,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Order {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            requested_price,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            purpose,
            submitted_at,
        }
    }

    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }

    /// Move a PENDING order to a terminal status.
    pub fn resolve(&mut self, status: OrderStatus) -> Result<(), TradegateError> {
        if self.status.is_terminal() || status == OrderStatus::Pending {
            return Err(TradegateError::InvalidOrderTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub commission: f64,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity
    }
}

/// Order state as reported by a broker.
#[derive(Debug, Clone, PartialEq)]
pub enum AckStatus {
    /// Accepted but nothing filled yet.
    Open,
    /// Cumulative fill so far; `filled_quantity < quantity` is a partial fill.
    Filled {
        filled_quantity: i64,
        average_price: f64,
    },
    Rejected(String),
    Cancelled {
        filled_quantity: i64,
        average_price: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub status: AckStatus,
    pub commission: f64,
}
