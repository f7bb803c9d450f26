//! Core domain types and logic.

pub mod config;
pub mod config_validation;
pub mod error;
pub mod execution;
pub mod indicator;
pub mod ledger;
pub mod ohlcv;
pub mod order;
pub mod position;
pub mod price_history;
pub mod risk;
pub mod signal;
pub mod trading_loop;
