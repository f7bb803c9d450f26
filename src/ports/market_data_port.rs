//! Market data port trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::error::TradegateError;
use crate::domain::ohlcv::Bar;

#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Latest `count` bars for `symbol`, oldest first.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Bar>, TradegateError>;

    /// Lazy, possibly endless stream of new bars. Only used to feed the
    /// price history store.
    async fn subscribe_stream(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, Result<Bar, TradegateError>>, TradegateError>;
}
