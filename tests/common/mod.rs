#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use tradegate::adapters::file_config_adapter::FileConfigAdapter;
use tradegate::domain::config::TradingConfig;
use tradegate::domain::error::{BrokerError, TradegateError};
use tradegate::domain::ledger::{AccountSnapshot, TradeRecord};
pub use tradegate::domain::ohlcv::Bar;
use tradegate::domain::order::{AckStatus, Order, OrderAck};
use tradegate::domain::position::Position;
use tradegate::ports::broker_port::{BrokerAccount, BrokerPort};
use tradegate::ports::market_data_port::MarketDataPort;
use tradegate::ports::persistence_port::PersistencePort;

/// Cycle clock used across the integration tests.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, hour, minute, 0).unwrap()
}

/// Daily bars starting 2024-01-01, one per close.
pub fn bars_from_closes(symbol: &str, closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            symbol: symbol.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::days(i as i64),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1000.0,
        })
        .collect()
}

/// Config with periods small enough for hand-written close series:
/// short MA 2, long MA 3, RSI 2, volume MA 2 (four bars per snapshot).
pub fn test_config(extra_trading: &str, extra_sections: &str) -> TradingConfig {
    config_with_filter(false, extra_trading, extra_sections)
}

pub fn config_with_filter(rsi_filter: bool, extra_trading: &str, extra_sections: &str) -> TradingConfig {
    let ini = format!(
        "[trading]
symbols = SPY
order_quantity = 10
bar_count = 4
{extra_trading}

[risk]
max_position_size = 10
max_daily_loss = 500
margin_rate = 0.1
stop_loss_percent = 2.0
take_profit_percent = 4.0

[strategy]
short_ma_period = 2
long_ma_period = 3
rsi_period = 2
volume_ma_period = 2
rsi_filter = {rsi_filter}

[paper]
initial_balance = 100000
slippage_pct = 0

{extra_sections}
"
    );
    TradingConfig::from_port(&FileConfigAdapter::from_string(&ini).unwrap()).unwrap()
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Replays a close series: the first call returns the first `count` bars,
/// each later call reveals one more.
pub struct MockMarketData {
    series: Mutex<HashMap<String, (Vec<Bar>, usize)>>,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_closes(self, symbol: &str, closes: &[f64]) -> Self {
        self.series
            .lock()
            .unwrap()
            .insert(symbol.to_string(), (bars_from_closes(symbol, closes), 0));
        self
    }
}

#[async_trait]
impl MarketDataPort for MockMarketData {
    async fn get_bars(
        &self,
        symbol: &str,
        _timeframe: &str,
        count: usize,
    ) -> Result<Vec<Bar>, TradegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TradegateError::MarketData {
                symbol: symbol.to_string(),
                reason: "feed down".into(),
            });
        }
        let mut series = self.series.lock().unwrap();
        let Some((bars, cursor)) = series.get_mut(symbol) else {
            return Ok(Vec::new());
        };
        *cursor = if *cursor == 0 {
            count.min(bars.len())
        } else {
            (*cursor + 1).min(bars.len())
        };
        let start = cursor.saturating_sub(count);
        Ok(bars[start..*cursor].to_vec())
    }

    async fn subscribe_stream(
        &self,
        _symbol: &str,
    ) -> Result<BoxStream<'static, Result<Bar, TradegateError>>, TradegateError> {
        Ok(stream::empty().boxed())
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub enum PlaceResponse {
    Ack(AckStatus),
    Fail(BrokerError),
    /// Never answers; the caller's timeout fires.
    Hang,
}

/// Broker with scripted responses. Unscripted placements fill in full at
/// the requested price; unscripted status lookups return `None`.
pub struct MockBroker {
    place_script: Mutex<VecDeque<PlaceResponse>>,
    status_script: Mutex<VecDeque<Result<Option<AckStatus>, BrokerError>>>,
    pub placed: Mutex<Vec<Order>>,
    pub place_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub account: BrokerAccount,
    pub positions: Vec<Position>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            place_script: Mutex::new(VecDeque::new()),
            status_script: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            place_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            account: BrokerAccount {
                balance: 100_000.0,
                equity: 100_000.0,
                margin_used: 0.0,
                free_margin: 100_000.0,
            },
            positions: Vec::new(),
        }
    }

    pub fn on_place(self, response: PlaceResponse) -> Self {
        self.place_script.lock().unwrap().push_back(response);
        self
    }

    pub fn on_status(self, response: Result<Option<AckStatus>, BrokerError>) -> Self {
        self.status_script.lock().unwrap().push_back(response);
        self
    }

    pub fn with_account(mut self, balance: f64) -> Self {
        self.account = BrokerAccount {
            balance,
            equity: balance,
            margin_used: 0.0,
            free_margin: balance,
        };
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    fn ack(&self, client_order_id: &str, status: AckStatus) -> OrderAck {
        OrderAck {
            broker_order_id: format!("B-{client_order_id}"),
            client_order_id: client_order_id.to_string(),
            status,
            commission: 0.0,
        }
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn place_order(&self, order: &Order) -> Result<OrderAck, BrokerError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().unwrap().push(order.clone());
        let scripted = self.place_script.lock().unwrap().pop_front();
        match scripted {
            Some(PlaceResponse::Ack(status)) => Ok(self.ack(&order.id, status)),
            Some(PlaceResponse::Fail(err)) => Err(err),
            Some(PlaceResponse::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BrokerError::Timeout)
            }
            None => Ok(self.ack(
                &order.id,
                AckStatus::Filled {
                    filled_quantity: order.quantity,
                    average_price: order.requested_price,
                },
            )),
        }
    }

    async fn cancel_order(&self, _broker_order_id: &str) -> Result<(), BrokerError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, BrokerError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.status_script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(Some(status))) => Ok(Some(self.ack(client_order_id, status))),
            Some(Ok(None)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    async fn get_account(&self) -> Result<BrokerAccount, BrokerError> {
        Ok(self.account.clone())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.positions.clone())
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// In-memory store. While `failing` is set every write returns an error.
pub struct MockPersistence {
    pub failing: AtomicBool,
    pub bars: Mutex<Vec<Bar>>,
    pub trades: Mutex<Vec<TradeRecord>>,
    pub snapshots: Mutex<Vec<AccountSnapshot>>,
    pub daily_pnl: Mutex<HashMap<NaiveDate, f64>>,
    pub bar_inserts: AtomicUsize,
}

impl MockPersistence {
    pub fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            bars: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            daily_pnl: Mutex::new(HashMap::new()),
            bar_inserts: AtomicUsize::new(0),
        }
    }

    pub fn with_trades(self, trades: Vec<TradeRecord>) -> Self {
        self.trades.lock().unwrap().extend(trades);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TradegateError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TradegateError::Persistence {
                reason: "disk unavailable".into(),
            });
        }
        Ok(())
    }
}

impl PersistencePort for MockPersistence {
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, TradegateError> {
        self.check()?;
        self.bar_inserts.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.bars.lock().unwrap();
        let mut inserted = 0;
        for bar in bars {
            let exists = stored
                .iter()
                .any(|b| b.symbol == bar.symbol && b.timestamp == bar.timestamp);
            if !exists {
                stored.push(bar.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert_trade(&self, trade: &TradeRecord) -> Result<(), TradegateError> {
        self.check()?;
        self.trades.lock().unwrap().push(trade.clone());
        Ok(())
    }

    fn insert_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), TradegateError> {
        self.check()?;
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    fn query_latest_window(&self, symbol: &str, n: usize) -> Result<Vec<Bar>, TradegateError> {
        let stored = self.bars.lock().unwrap();
        let mut bars: Vec<Bar> = stored.iter().filter(|b| b.symbol == symbol).cloned().collect();
        bars.sort_by_key(|b| b.timestamp);
        let skip = bars.len().saturating_sub(n);
        Ok(bars.split_off(skip))
    }

    fn query_today_trades(
        &self,
        symbol: Option<&str>,
        day_start: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, TradegateError> {
        Ok(self
            .trades
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.timestamp >= day_start)
            .filter(|t| symbol.is_none_or(|s| t.symbol == s))
            .cloned()
            .collect())
    }

    fn latest_account_snapshot(&self) -> Result<Option<AccountSnapshot>, TradegateError> {
        Ok(self.snapshots.lock().unwrap().last().cloned())
    }

    fn upsert_daily_pnl(&self, day: NaiveDate, realized_pnl: f64) -> Result<(), TradegateError> {
        self.check()?;
        self.daily_pnl.lock().unwrap().insert(day, realized_pnl);
        Ok(())
    }

    fn query_daily_pnl(&self, day: NaiveDate) -> Result<Option<f64>, TradegateError> {
        self.check()?;
        Ok(self.daily_pnl.lock().unwrap().get(&day).copied())
    }
}
