//! Port traits implemented by the adapters.

pub mod broker_port;
pub mod config_port;
pub mod market_data_port;
pub mod persistence_port;
