//! Domain error types.

use crate::domain::order::OrderStatus;

/// Failure reported by a brokerage port.
///
/// Only `Timeout` and `Network` are considered transient; everything else is
/// surfaced to the caller without a retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker call timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by broker: {0}")]
    Rejected(String),

    #[error("not found at broker: {0}")]
    NotFound(String),

    #[error("unexpected broker response: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Timeout | BrokerError::Network(_))
    }
}

/// Top-level error type for tradegate.
#[derive(Debug, thiserror::Error)]
pub enum TradegateError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("persistence failure: {reason}")]
    Persistence { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("insufficient data for {symbol}: have {have} bars, need {need}")]
    DataUnavailable {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("market data error for {symbol}: {reason}")]
    MarketData { symbol: String, reason: String },

    #[error("order for {symbol} rejected by risk check: {reason}")]
    RiskRejected { symbol: String, reason: String },

    #[error("order {order_id} timed out after {attempts} attempts")]
    ExecutionTimeout { order_id: String, attempts: u32 },

    #[error("order {order_id} rejected: {reason}")]
    ExecutionRejected { order_id: String, reason: String },

    #[error("order {order_id} accepted but not yet filled")]
    OrderPending { order_id: String },

    #[error("order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidOrderTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TradegateError {
    /// Only configuration problems stop the process; everything else is
    /// handled at the cycle boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradegateError::ConfigParse { .. }
                | TradegateError::ConfigMissing { .. }
                | TradegateError::ConfigInvalid { .. }
        )
    }

    pub fn invalid_config(section: &str, key: &str, reason: impl Into<String>) -> Self {
        TradegateError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn missing_config(section: &str, key: &str) -> Self {
        TradegateError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<&TradegateError> for std::process::ExitCode {
    fn from(err: &TradegateError) -> Self {
        let code: u8 = match err {
            TradegateError::Io(_) => 1,
            TradegateError::ConfigParse { .. }
            | TradegateError::ConfigMissing { .. }
            | TradegateError::ConfigInvalid { .. } => 2,
            TradegateError::Database { .. }
            | TradegateError::DatabaseQuery { .. }
            | TradegateError::Persistence { .. } => 3,
            TradegateError::Broker(_) | TradegateError::MarketData { .. } => 4,
            TradegateError::DataUnavailable { .. }
            | TradegateError::RiskRejected { .. }
            | TradegateError::ExecutionTimeout { .. }
            | TradegateError::ExecutionRejected { .. }
            | TradegateError::OrderPending { .. }
            | TradegateError::OrderNotFound { .. }
            | TradegateError::InvalidOrderTransition { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
