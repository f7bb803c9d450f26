//! Durable storage port trait.

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::error::TradegateError;
use crate::domain::ledger::{AccountSnapshot, TradeRecord};
use crate::domain::ohlcv::Bar;

pub trait PersistencePort: Send + Sync {
    /// Insert bars, ignoring any (symbol, timestamp) already stored.
    /// Returns the number of rows actually inserted.
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, TradegateError>;

    fn insert_trade(&self, trade: &TradeRecord) -> Result<(), TradegateError>;

    fn insert_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), TradegateError>;

    /// Latest `n` bars for `symbol`, oldest first.
    fn query_latest_window(&self, symbol: &str, n: usize) -> Result<Vec<Bar>, TradegateError>;

    /// Trades since `day_start`. `None` selects every symbol.
    fn query_today_trades(
        &self,
        symbol: Option<&str>,
        day_start: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, TradegateError>;

    fn latest_account_snapshot(&self) -> Result<Option<AccountSnapshot>, TradegateError>;

    /// Store the realized P&L of a trading day, replacing any earlier value.
    fn upsert_daily_pnl(&self, day: NaiveDate, realized_pnl: f64) -> Result<(), TradegateError>;

    fn query_daily_pnl(&self, day: NaiveDate) -> Result<Option<f64>, TradegateError>;
}
