//! Trading loop scheduler.
//!
//! One task per symbol ticks on the polling interval. Each cycle runs
//! fetch → indicators → signal → risk → execution → persist while holding
//! the symbol's lock, so two cycles for the same symbol never interleave.
//! Shutdown is signalled through a `watch` channel; a tick that already
//! started runs to completion before the task exits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use super::config::TradingConfig;
use super::error::TradegateError;
use super::execution::ExecutionCore;
use super::indicator::{IndicatorParams, IndicatorSnapshot};
use super::ledger::trading_day_start;
use super::ohlcv::Bar;
use super::order::{Fill, OrderPurpose, OrderSide};
use super::price_history::PriceHistoryStore;
use super::risk::{Decision, Intent, RiskManager};
use super::signal::{Signal, SignalGenerator, SignalKind};
use crate::ports::market_data_port::MarketDataPort;
use crate::ports::persistence_port::PersistencePort;

/// What one cycle did for one symbol.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub symbol: String,
    pub new_bars: usize,
    pub price: Option<f64>,
    pub snapshot: Option<IndicatorSnapshot>,
    pub signal: Option<Signal>,
    pub protective_exit: Option<OrderPurpose>,
    pub decisions: Vec<(Intent, Decision)>,
    pub fills: Vec<Fill>,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn new(symbol: &str) -> Self {
        CycleReport {
            symbol: symbol.to_string(),
            ..CycleReport::default()
        }
    }

    pub fn signal_kind(&self) -> SignalKind {
        self.signal
            .as_ref()
            .map(|s| s.kind)
            .unwrap_or(SignalKind::Hold)
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} signal={}", self.symbol, self.signal_kind())?;
        if let Some(price) = self.price {
            write!(f, " price={price:.2}")?;
        }
        if let Some(purpose) = self.protective_exit {
            write!(f, " exit={purpose}")?;
        }
        for (_, decision) in &self.decisions {
            write!(f, " {decision}")?;
        }
        if !self.fills.is_empty() {
            write!(f, " fills={}", self.fills.len())?;
        }
        Ok(())
    }
}

pub struct TradingLoop {
    symbols: Vec<String>,
    poll_interval: Duration,
    timeframe: String,
    bar_count: usize,
    fetch_timeout: Duration,
    streaming: bool,
    close_on_shutdown: bool,
    params: IndicatorParams,
    market_data: Arc<dyn MarketDataPort>,
    persistence: Option<Arc<dyn PersistencePort>>,
    store: PriceHistoryStore,
    risk: RiskManager,
    core: Arc<ExecutionCore>,
    generators: HashMap<String, Arc<Mutex<SignalGenerator>>>,
}

impl TradingLoop {
    pub fn new(
        config: &TradingConfig,
        market_data: Arc<dyn MarketDataPort>,
        persistence: Option<Arc<dyn PersistencePort>>,
        core: Arc<ExecutionCore>,
    ) -> Self {
        let generators = config
            .symbols
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    Arc::new(Mutex::new(SignalGenerator::new(config.filters.clone()))),
                )
            })
            .collect();
        TradingLoop {
            symbols: config.symbols.clone(),
            poll_interval: config.poll_interval,
            timeframe: config.timeframe.clone(),
            bar_count: config.bar_count,
            fetch_timeout: config.market_data.fetch_timeout,
            streaming: config.market_data.streaming,
            close_on_shutdown: config.close_on_shutdown,
            params: config.indicators.clone(),
            market_data,
            persistence,
            store: PriceHistoryStore::new(config.bar_count),
            risk: RiskManager::new(config.risk.clone()),
            core,
            generators,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn core(&self) -> &Arc<ExecutionCore> {
        &self.core
    }

    pub fn store(&self) -> &PriceHistoryStore {
        &self.store
    }

    /// Seed the price history from persistence.
    pub fn warm_up(&self) -> Result<usize, TradegateError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let mut loaded = 0;
        for symbol in &self.symbols {
            let bars = persistence.query_latest_window(symbol, self.bar_count)?;
            loaded += self.store.extend(bars).len();
        }
        info!(bars = loaded, symbols = self.symbols.len(), "price history warmed up");
        Ok(loaded)
    }

    fn store_bars(&self, symbol: &str, bars: Vec<Bar>) -> usize {
        let (good, bad): (Vec<Bar>, Vec<Bar>) = bars.into_iter().partition(|b| b.is_well_formed());
        if !bad.is_empty() {
            warn!(symbol, dropped = bad.len(), "dropping malformed bars");
        }
        let fresh = self.store.extend(good);
        if fresh.is_empty() {
            return 0;
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.insert_bars(&fresh) {
                warn!(symbol, error = %e, "failed to persist bars");
            }
        }
        fresh.len()
    }

    async fn fetch(&self, symbol: &str) -> Result<Vec<Bar>, TradegateError> {
        match timeout(
            self.fetch_timeout,
            self.market_data
                .get_bars(symbol, &self.timeframe, self.bar_count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TradegateError::MarketData {
                symbol: symbol.to_string(),
                reason: format!("fetch timed out after {:?}", self.fetch_timeout),
            }),
        }
    }

    /// Run one cycle for `symbol`. Errors are recorded in the report and
    /// logged, never propagated.
    pub async fn run_cycle(&self, symbol: &str, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::new(symbol);
        let Some(generator) = self.generators.get(symbol) else {
            report.errors.push(format!("{symbol} is not a configured symbol"));
            return report;
        };
        let mut generator = generator.lock().await;

        self.core.roll_day(now).await;
        self.core.flush_outbox().await;
        self.core.reconcile_pending(now).await;

        match self.fetch(symbol).await {
            Ok(bars) => report.new_bars = self.store_bars(symbol, bars),
            Err(e) => {
                warn!(symbol, error = %e, "market data unavailable; using stored bars");
                report.errors.push(e.to_string());
            }
        }

        let Some(latest) = self.store.latest(symbol) else {
            debug!(symbol, "no bars yet; holding");
            report.signal = Some(Signal::hold(symbol, now));
            return report;
        };
        let price = latest.close;
        report.price = Some(price);
        self.core.mark_price(symbol, price).await;

        if self.core.has_pending(symbol).await {
            warn!(symbol, price, "order still pending; skipping exits and signals this cycle");
            report.errors.push(format!("{symbol} has a pending order"));
            report.signal = Some(Signal::hold(symbol, now));
            return report;
        }

        if let Some(position) = self.core.position(symbol).await {
            if let Some(exit) = self.risk.check_protective_exit(&position, price) {
                warn!(
                    symbol,
                    purpose = %exit.purpose,
                    price,
                    quantity = exit.quantity,
                    stop_loss = ?position.stop_loss_price,
                    take_profit = ?position.take_profit_price,
                    "protective exit triggered"
                );
                report.protective_exit = Some(exit.purpose);
                report.decisions.push((exit.intent(), Decision::Approve(exit.quantity)));
                match self
                    .core
                    .execute(symbol, exit.side, exit.quantity, price, exit.purpose, now)
                    .await
                {
                    Ok(fill) => report.fills.push(fill),
                    Err(e) => {
                        error!(symbol, purpose = %exit.purpose, error = %e, "protective exit failed");
                        report.errors.push(e.to_string());
                        if matches!(
                            e,
                            TradegateError::ExecutionTimeout { .. } | TradegateError::OrderPending { .. }
                        ) {
                            report.signal = Some(Signal::hold(symbol, now));
                            return report;
                        }
                    }
                }
            }
        }

        let window = self
            .store
            .latest_window(symbol, self.params.required_bars());
        let (signal, snapshot) = generator.process_window(symbol, &window, &self.params, now);
        report.snapshot = snapshot;
        let kind = signal.kind;
        report.signal = Some(signal);

        let position = self.core.position(symbol).await;
        let intents = self.risk.intents_for(kind, position.as_ref());
        for intent in intents {
            let position = self.core.position(symbol).await;
            let account = self.core.account_state().await;
            let decision = self
                .risk
                .evaluate(&intent, position.as_ref(), &account, price);
            report.decisions.push((intent, decision));

            let quantity = match decision {
                Decision::Approve(quantity) => quantity,
                Decision::Reject(reason) => {
                    warn!(
                        symbol,
                        signal = %kind,
                        decision = %decision,
                        reason = %reason,
                        realized_daily_pnl = account.realized_daily_pnl,
                        free_margin = account.free_margin,
                        "order rejected by risk check"
                    );
                    report.errors.push(
                        TradegateError::RiskRejected {
                            symbol: symbol.to_string(),
                            reason: reason.to_string(),
                        }
                        .to_string(),
                    );
                    continue;
                }
            };

            info!(symbol, signal = %kind, decision = %decision, purpose = %intent.purpose(), "order approved");
            match self
                .core
                .execute(symbol, intent.side(), quantity, price, intent.purpose(), now)
                .await
            {
                Ok(fill) => report.fills.push(fill),
                Err(e) => {
                    warn!(symbol, signal = %kind, error = %e, "execution did not fill");
                    report.errors.push(e.to_string());
                    // never open the new leg when the close did not complete
                    break;
                }
            }
        }

        if report.fills.is_empty() && self.core.position(symbol).await.is_some() {
            self.core.record_snapshot(now).await;
        }

        info!(
            symbol,
            signal = %report.signal_kind(),
            price,
            new_bars = report.new_bars,
            fills = report.fills.len(),
            "cycle complete"
        );
        drop(generator);
        report
    }

    /// One cycle for every symbol, concurrently.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Vec<CycleReport> {
        let cycles = self.symbols.iter().map(|s| self.run_cycle(s, now));
        futures::future::join_all(cycles).await
    }

    async fn symbol_task(self: Arc<Self>, symbol: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(symbol = %symbol, interval = ?self.poll_interval, "symbol task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle(&symbol, Utc::now()).await;
                    debug!(report = %report, "cycle report");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!(symbol = %symbol, "symbol task stopped");
    }

    async fn stream_task(self: Arc<Self>, symbol: String, mut shutdown: watch::Receiver<bool>) {
        let mut stream = match self.market_data.subscribe_stream(&symbol).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "bar stream unavailable");
                return;
            }
        };
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(bar)) => {
                        self.store_bars(&symbol, vec![bar]);
                    }
                    Some(Err(e)) => warn!(symbol = %symbol, error = %e, "bar stream error"),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(symbol = %symbol, "bar stream closed");
    }

    /// Run until `shutdown` flips to true, then flush the outbox and write
    /// a final account snapshot.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for symbol in self.symbols.clone() {
            if self.streaming {
                handles.push(tokio::spawn(
                    Arc::clone(&self).stream_task(symbol.clone(), shutdown.clone()),
                ));
            }
            handles.push(tokio::spawn(
                Arc::clone(&self).symbol_task(symbol, shutdown.clone()),
            ));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "symbol task panicked");
            }
        }

        self.finish(Utc::now()).await;
    }

    /// Close every ledger position at its last price, bypassing the risk
    /// checks. Symbols with a pending order are left alone.
    pub async fn close_all_positions(&self, now: DateTime<Utc>) -> Vec<Fill> {
        let mut fills = Vec::new();
        for position in self.core.positions().await {
            let symbol = position.symbol.as_str();
            if self.core.has_pending(symbol).await {
                warn!(symbol, "order still pending; position left open at shutdown");
                continue;
            }
            let price = self
                .store
                .latest(symbol)
                .map(|bar| bar.close)
                .unwrap_or(position.average_entry_price);
            let side = if position.is_long() {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            warn!(symbol, quantity = position.quantity, price, "closing position at shutdown");
            match self
                .core
                .execute(symbol, side, position.quantity.abs(), price, OrderPurpose::Shutdown, now)
                .await
            {
                Ok(fill) => fills.push(fill),
                Err(e) => error!(symbol, error = %e, "shutdown close failed"),
            }
        }
        fills
    }

    /// Optionally flatten positions, flush queued writes, record a closing
    /// snapshot and log the day's summary. Returns the number of records
    /// still unpersisted.
    pub async fn finish(&self, now: DateTime<Utc>) -> usize {
        if self.close_on_shutdown {
            let closed = self.close_all_positions(now).await;
            info!(closed = closed.len(), "positions closed at shutdown");
        }
        self.core.flush_outbox().await;
        let snapshot = self.core.record_snapshot(now).await;
        let open_positions = self.core.positions().await.len();
        let day_start = trading_day_start(now, self.core.day_start().await);
        let trades_today = self
            .core
            .trades()
            .await
            .iter()
            .filter(|t| t.timestamp >= day_start)
            .count();
        info!(
            balance = snapshot.balance,
            equity = snapshot.equity,
            realized_daily_pnl = snapshot.realized_daily_pnl,
            trades_today,
            open_positions,
            "end of day summary"
        );
        let remaining = self.core.flush_outbox().await;
        if remaining > 0 {
            error!(remaining, "shutting down with unpersisted records");
        } else {
            info!("trading loop stopped");
        }
        remaining
    }
}
