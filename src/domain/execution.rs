//! Execution core.
//!
//! Submits and cancels orders against the paper venue or a live broker and
//! is the only writer of ledger state. Every fill goes through
//! [`Ledger::apply_fill`] under the ledger lock; the resulting trade record,
//! account snapshot and daily P&L are then written to persistence, or queued
//! in the outbox when the write fails.
//!
//! Lock order is always order book, then ledger, then outbox.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{BrokerError, TradegateError};
use super::ledger::{
    AccountSnapshot, AccountState, Ledger, TradeRecord, TradeStatus, trading_day_start,
};
use super::order::{AckStatus, Fill, Order, OrderAck, OrderPurpose, OrderSide, OrderStatus};
use super::position::{Position, ProtectiveLevels};
use crate::ports::broker_port::BrokerPort;
use crate::ports::persistence_port::PersistencePort;

/// Paper venue fill simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperSettings {
    pub slippage_pct: f64,
    pub commission_per_trade: f64,
    pub commission_pct: f64,
    pub fill_delay: Duration,
}

impl Default for PaperSettings {
    fn default() -> Self {
        PaperSettings {
            slippage_pct: 0.05,
            commission_per_trade: 0.0,
            commission_pct: 0.0,
            fill_delay: Duration::ZERO,
        }
    }
}

/// What happens to the unfilled remainder of a partially filled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialFillPolicy {
    Cancel,
    Rest,
}

impl PartialFillPolicy {
    pub fn parse(value: &str) -> Option<PartialFillPolicy> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cancel" => Some(PartialFillPolicy::Cancel),
            "rest" => Some(PartialFillPolicy::Rest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub submit_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub partial_fill_policy: PartialFillPolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        ExecutionSettings {
            submit_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            partial_fill_policy: PartialFillPolicy::Cancel,
        }
    }
}

/// Calculate commission: flat_fee + (notional * pct / 100).
pub fn calculate_commission(notional: f64, settings: &PaperSettings) -> f64 {
    settings.commission_per_trade + (notional * settings.commission_pct / 100.0)
}

/// Buys fill above the reference price, sells below.
pub fn apply_slippage(price: f64, side: OrderSide, slippage_pct: f64) -> f64 {
    match side {
        OrderSide::Buy => price * (1.0 + slippage_pct / 100.0),
        OrderSide::Sell => price * (1.0 - slippage_pct / 100.0),
    }
}

pub enum Venue {
    Paper(PaperSettings),
    Live(Arc<dyn BrokerPort>),
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    order: Order,
    broker_order_id: Option<String>,
    filled_notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum OutboxRecord {
    Trade(TradeRecord),
    Snapshot(AccountSnapshot),
    DailyPnl { day: NaiveDate, realized_pnl: f64 },
}

fn write_record(store: &dyn PersistencePort, record: &OutboxRecord) -> Result<(), TradegateError> {
    match record {
        OutboxRecord::Trade(trade) => store.insert_trade(trade),
        OutboxRecord::Snapshot(snapshot) => store.insert_account_snapshot(snapshot),
        OutboxRecord::DailyPnl { day, realized_pnl } => store.upsert_daily_pnl(*day, *realized_pnl),
    }
}

pub struct ExecutionCore {
    venue: Venue,
    settings: ExecutionSettings,
    levels: ProtectiveLevels,
    ledger: Mutex<Ledger>,
    orders: Mutex<HashMap<String, TrackedOrder>>,
    persistence: Option<Arc<dyn PersistencePort>>,
    outbox: Mutex<VecDeque<OutboxRecord>>,
}

impl ExecutionCore {
    pub fn new(
        venue: Venue,
        settings: ExecutionSettings,
        levels: ProtectiveLevels,
        ledger: Ledger,
        persistence: Option<Arc<dyn PersistencePort>>,
    ) -> Self {
        ExecutionCore {
            venue,
            settings,
            levels,
            ledger: Mutex::new(ledger),
            orders: Mutex::new(HashMap::new()),
            persistence,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.venue, Venue::Live(_))
    }

    pub async fn account_state(&self) -> AccountState {
        self.ledger.lock().await.account_state()
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.ledger.lock().await.position(symbol).cloned()
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.ledger.lock().await.positions().cloned().collect()
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.ledger.lock().await.trades().to_vec()
    }

    pub async fn snapshots(&self) -> Vec<AccountSnapshot> {
        self.ledger.lock().await.snapshots().to_vec()
    }

    pub async fn mark_price(&self, symbol: &str, price: f64) {
        self.ledger.lock().await.mark_price(symbol, price);
    }

    pub async fn day_start(&self) -> chrono::NaiveTime {
        self.ledger.lock().await.day_start()
    }

    pub async fn roll_day(&self, now: DateTime<Utc>) -> bool {
        let rolled = self.ledger.lock().await.roll_day(now);
        if rolled {
            info!(day = %now.date_naive(), "trading day rolled over; realized daily P&L reset");
        }
        rolled
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.orders
            .lock()
            .await
            .get(order_id)
            .map(|t| t.order.clone())
    }

    pub async fn pending_orders(&self) -> Vec<Order> {
        self.orders
            .lock()
            .await
            .values()
            .filter(|t| t.order.status == OrderStatus::Pending)
            .map(|t| t.order.clone())
            .collect()
    }

    /// True while an order for `symbol` is still PENDING. No new order for
    /// the symbol may be placed until it resolves.
    pub async fn has_pending(&self, symbol: &str) -> bool {
        self.orders
            .lock()
            .await
            .values()
            .any(|t| t.order.symbol == symbol && t.order.status == OrderStatus::Pending)
    }

    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Build a market order and submit it.
    pub async fn execute(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        price: f64,
        purpose: OrderPurpose,
        now: DateTime<Utc>,
    ) -> Result<Fill, TradegateError> {
        self.submit(Order::market(symbol, side, quantity, price, purpose, now))
            .await
    }

    /// Submit an order and wait for its first fill.
    ///
    /// On a live venue a timeout or network failure is retried with
    /// exponential backoff; once retries run out the order is left PENDING
    /// for [`ExecutionCore::reconcile_pending`].
    pub async fn submit(&self, order: Order) -> Result<Fill, TradegateError> {
        self.orders.lock().await.insert(
            order.id.clone(),
            TrackedOrder {
                order: order.clone(),
                broker_order_id: None,
                filled_notional: 0.0,
            },
        );
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            purpose = %order.purpose,
            "submitting order"
        );

        match &self.venue {
            Venue::Paper(paper) => self.fill_paper(&order, paper).await,
            Venue::Live(broker) => {
                let broker = Arc::clone(broker);
                self.submit_live(&order, broker.as_ref()).await
            }
        }
    }

    async fn fill_paper(&self, order: &Order, paper: &PaperSettings) -> Result<Fill, TradegateError> {
        if !paper.fill_delay.is_zero() {
            tokio::time::sleep(paper.fill_delay).await;
        }
        let price = apply_slippage(order.requested_price, order.side, paper.slippage_pct);
        let commission = calculate_commission(price * order.quantity as f64, paper);
        let delay = chrono::Duration::from_std(paper.fill_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.apply_order_fill(
            &order.id,
            order.quantity,
            price,
            commission,
            order.submitted_at + delay,
            Some(OrderStatus::Filled),
        )
        .await
    }

    async fn submit_live(&self, order: &Order, broker: &dyn BrokerPort) -> Result<Fill, TradegateError> {
        let allowed = self.settings.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout(self.settings.submit_timeout, broker.place_order(order)).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout),
            };

            match result {
                Ok(ack) => return self.handle_ack(&order.id, ack, order.submitted_at).await,
                Err(BrokerError::Rejected(reason)) => {
                    self.resolve(&order.id, OrderStatus::Rejected).await?;
                    warn!(order_id = %order.id, symbol = %order.symbol, reason = %reason, "order rejected by broker");
                    return Err(TradegateError::ExecutionRejected {
                        order_id: order.id.clone(),
                        reason,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(order_id = %order.id, attempt, error = %e, "order submission failed");
                    if attempt >= allowed {
                        break;
                    }
                    // the broker may have accepted the order before the failure
                    if let Ok(Ok(Some(ack))) =
                        timeout(self.settings.submit_timeout, broker.order_status(&order.id)).await
                    {
                        return self.handle_ack(&order.id, ack, order.submitted_at).await;
                    }
                    let backoff = self
                        .settings
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "order state unknown; left pending");
                    return Err(e.into());
                }
            }
        }

        warn!(
            order_id = %order.id,
            symbol = %order.symbol,
            attempts = attempt,
            "retries exhausted; order left pending for re-check"
        );
        Err(TradegateError::ExecutionTimeout {
            order_id: order.id.clone(),
            attempts: attempt,
        })
    }

    /// Apply what a broker acknowledgement reports for a tracked order.
    async fn handle_ack(
        &self,
        order_id: &str,
        ack: OrderAck,
        at: DateTime<Utc>,
    ) -> Result<Fill, TradegateError> {
        let (quantity, already, notional) = {
            let mut book = self.orders.lock().await;
            let tracked = book
                .get_mut(order_id)
                .ok_or_else(|| TradegateError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
            tracked.broker_order_id = Some(ack.broker_order_id.clone());
            (
                tracked.order.quantity,
                tracked.order.filled_quantity,
                tracked.filled_notional,
            )
        };
        let pending = || TradegateError::OrderPending {
            order_id: order_id.to_string(),
        };

        match ack.status {
            AckStatus::Open => Err(pending()),
            AckStatus::Rejected(reason) => {
                self.resolve(order_id, OrderStatus::Rejected).await?;
                warn!(order_id, reason = %reason, "order rejected by broker");
                Err(TradegateError::ExecutionRejected {
                    order_id: order_id.to_string(),
                    reason,
                })
            }
            AckStatus::Filled {
                filled_quantity,
                average_price,
            } => {
                let filled_quantity = filled_quantity.min(quantity);
                let partial = filled_quantity < quantity;
                let final_status = match (partial, self.settings.partial_fill_policy) {
                    (false, _) => Some(OrderStatus::Filled),
                    (true, PartialFillPolicy::Cancel) => Some(OrderStatus::Cancelled),
                    (true, PartialFillPolicy::Rest) => None,
                };
                if partial && self.settings.partial_fill_policy == PartialFillPolicy::Cancel {
                    self.cancel_remainder(order_id, &ack.broker_order_id).await;
                }

                let delta = filled_quantity - already;
                if delta <= 0 {
                    if let Some(status) = final_status {
                        self.resolve(order_id, status).await?;
                    }
                    return Err(pending());
                }
                let price = delta_price(notional, filled_quantity, average_price, delta);
                self.apply_order_fill(order_id, delta, price, ack.commission, at, final_status)
                    .await
            }
            AckStatus::Cancelled {
                filled_quantity,
                average_price,
            } => {
                let delta = filled_quantity.min(quantity) - already;
                if delta <= 0 {
                    self.resolve(order_id, OrderStatus::Cancelled).await?;
                    return Err(TradegateError::ExecutionRejected {
                        order_id: order_id.to_string(),
                        reason: "cancelled by broker".to_string(),
                    });
                }
                let price = delta_price(notional, filled_quantity, average_price, delta);
                self.apply_order_fill(
                    order_id,
                    delta,
                    price,
                    ack.commission,
                    at,
                    Some(OrderStatus::Cancelled),
                )
                .await
            }
        }
    }

    async fn cancel_remainder(&self, order_id: &str, broker_order_id: &str) {
        let Venue::Live(broker) = &self.venue else {
            return;
        };
        match timeout(self.settings.submit_timeout, broker.cancel_order(broker_order_id)).await {
            Ok(Ok(())) => info!(order_id, "partial fill; remainder cancelled"),
            Ok(Err(e)) => warn!(order_id, error = %e, "failed to cancel partial remainder"),
            Err(_) => warn!(order_id, "timed out cancelling partial remainder"),
        }
    }

    async fn resolve(&self, order_id: &str, status: OrderStatus) -> Result<(), TradegateError> {
        let mut book = self.orders.lock().await;
        let tracked = book
            .get_mut(order_id)
            .ok_or_else(|| TradegateError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        tracked.order.resolve(status)
    }

    /// Apply `delta` filled units of a tracked order to the ledger.
    async fn apply_order_fill(
        &self,
        order_id: &str,
        delta: i64,
        price: f64,
        commission: f64,
        filled_at: DateTime<Utc>,
        final_status: Option<OrderStatus>,
    ) -> Result<Fill, TradegateError> {
        let mut book = self.orders.lock().await;
        let (fill, outcome, day, daily_pnl) = {
            let tracked = book
                .get_mut(order_id)
                .ok_or_else(|| TradegateError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
            if tracked.order.status.is_terminal() {
                return Err(TradegateError::InvalidOrderTransition {
                    order_id: order_id.to_string(),
                    from: tracked.order.status,
                    to: final_status.unwrap_or(OrderStatus::Filled),
                });
            }

            let fill = Fill {
                order_id: order_id.to_string(),
                symbol: tracked.order.symbol.clone(),
                side: tracked.order.side,
                quantity: delta,
                price,
                commission,
                filled_at,
            };
            let status = if tracked.order.filled_quantity + delta >= tracked.order.quantity {
                TradeStatus::Filled
            } else {
                TradeStatus::Partial
            };

            let (outcome, day, daily_pnl) = {
                let mut ledger = self.ledger.lock().await;
                let outcome = ledger.apply_fill(&fill, self.levels, status);
                (outcome, ledger.trading_day(), ledger.realized_daily_pnl())
            };

            tracked.order.filled_quantity += delta;
            tracked.filled_notional += delta as f64 * price;
            if let Some(status) = final_status {
                tracked.order.resolve(status)?;
            }
            (fill, outcome, day, daily_pnl)
        };

        info!(
            order_id,
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = fill.quantity,
            price = fill.price,
            commission = fill.commission,
            status = %outcome.trade.status,
            position = outcome.position_after.as_ref().map(|p| p.quantity).unwrap_or(0),
            "fill applied"
        );

        let mut records = vec![
            OutboxRecord::Trade(outcome.trade),
            OutboxRecord::Snapshot(outcome.snapshot),
        ];
        if let Some(day) = day {
            records.push(OutboxRecord::DailyPnl {
                day,
                realized_pnl: daily_pnl,
            });
        }
        // queued under the book lock so concurrent fills keep ledger order
        self.persist(records).await;
        drop(book);
        Ok(fill)
    }

    /// Cancel a PENDING order, at the broker first when it has one.
    pub async fn cancel(&self, order_id: &str) -> Result<(), TradegateError> {
        let broker_order_id = {
            let book = self.orders.lock().await;
            let tracked = book
                .get(order_id)
                .ok_or_else(|| TradegateError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
            if tracked.order.status.is_terminal() {
                return Err(TradegateError::InvalidOrderTransition {
                    order_id: order_id.to_string(),
                    from: tracked.order.status,
                    to: OrderStatus::Cancelled,
                });
            }
            tracked.broker_order_id.clone()
        };

        if let (Venue::Live(broker), Some(broker_id)) = (&self.venue, broker_order_id) {
            match timeout(self.settings.submit_timeout, broker.cancel_order(&broker_id)).await {
                Ok(result) => result?,
                Err(_) => return Err(BrokerError::Timeout.into()),
            }
        }
        self.resolve(order_id, OrderStatus::Cancelled).await?;
        info!(order_id, "order cancelled");
        Ok(())
    }

    /// Look up every PENDING order at the broker by client order id and
    /// apply what it reports. Orders the broker never saw become CANCELLED.
    /// Returns the number of orders that reached a terminal status.
    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> usize {
        let Venue::Live(broker) = &self.venue else {
            return 0;
        };
        let broker = Arc::clone(broker);
        let pending: Vec<String> = self
            .pending_orders()
            .await
            .into_iter()
            .map(|o| o.id)
            .collect();

        let mut resolved = 0;
        for order_id in pending {
            let lookup = timeout(self.settings.submit_timeout, broker.order_status(&order_id)).await;
            match lookup {
                Err(_) => warn!(order_id = %order_id, "re-check timed out; still pending"),
                Ok(Err(e)) => warn!(order_id = %order_id, error = %e, "re-check failed; still pending"),
                Ok(Ok(None)) => {
                    if self.resolve(&order_id, OrderStatus::Cancelled).await.is_ok() {
                        warn!(order_id = %order_id, "order never reached broker; marked cancelled");
                    }
                }
                Ok(Ok(Some(ack))) => match self.handle_ack(&order_id, ack, now).await {
                    Ok(fill) => {
                        info!(order_id = %order_id, quantity = fill.quantity, "pending order reconciled")
                    }
                    Err(TradegateError::OrderPending { .. }) => {
                        debug!(order_id = %order_id, "order still open at broker")
                    }
                    Err(e) => warn!(order_id = %order_id, error = %e, "pending order resolved without fill"),
                },
            }
            if self
                .order(&order_id)
                .await
                .is_some_and(|o| o.status.is_terminal())
            {
                resolved += 1;
            }
        }
        resolved
    }

    async fn persist(&self, records: Vec<OutboxRecord>) {
        let Some(store) = &self.persistence else {
            return;
        };
        let mut outbox = self.outbox.lock().await;
        for record in records {
            // keep write order once anything is queued
            if !outbox.is_empty() {
                outbox.push_back(record);
                continue;
            }
            if let Err(e) = write_record(store.as_ref(), &record) {
                warn!(error = %e, "persistence write failed; queued for retry");
                outbox.push_back(record);
            }
        }
    }

    /// Retry queued writes in order. Returns how many are still queued.
    pub async fn flush_outbox(&self) -> usize {
        let Some(store) = &self.persistence else {
            return 0;
        };
        let mut outbox = self.outbox.lock().await;
        let queued = outbox.len();
        while let Some(record) = outbox.front() {
            match write_record(store.as_ref(), record) {
                Ok(()) => {
                    outbox.pop_front();
                }
                Err(e) => {
                    warn!(remaining = outbox.len(), error = %e, "outbox flush stopped");
                    break;
                }
            }
        }
        if queued > 0 && outbox.is_empty() {
            info!(flushed = queued, "outbox flushed");
        }
        outbox.len()
    }

    pub async fn record_snapshot(&self, now: DateTime<Utc>) -> AccountSnapshot {
        let book = self.orders.lock().await;
        let snapshot = self.ledger.lock().await.record_snapshot(now);
        self.persist(vec![OutboxRecord::Snapshot(snapshot.clone())])
            .await;
        drop(book);
        snapshot
    }

    /// Replace ledger balance and positions with the broker's view.
    pub async fn seed_from_broker(&self) -> Result<(), TradegateError> {
        let Venue::Live(broker) = &self.venue else {
            return Ok(());
        };
        let account = timeout(self.settings.submit_timeout, broker.get_account())
            .await
            .map_err(|_| BrokerError::Timeout)??;
        let positions = timeout(self.settings.submit_timeout, broker.get_positions())
            .await
            .map_err(|_| BrokerError::Timeout)??;

        let positions: Vec<Position> = positions
            .into_iter()
            .map(|p| {
                Position::open(
                    &p.symbol,
                    p.quantity,
                    p.average_entry_price,
                    p.opened_at,
                    self.levels,
                )
            })
            .collect();
        info!(
            balance = account.balance,
            equity = account.equity,
            positions = positions.len(),
            "ledger seeded from broker"
        );
        self.ledger.lock().await.seed(account.balance, positions);
        Ok(())
    }

    /// Seed realized daily P&L from today's persisted trades.
    pub async fn restore_daily_pnl(&self, now: DateTime<Utc>) -> Result<(), TradegateError> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        let mut ledger = self.ledger.lock().await;
        let since = trading_day_start(now, ledger.day_start());
        let trades = store.query_today_trades(None, since)?;
        ledger.restore_daily_pnl(now, &trades);
        info!(
            trades = trades.len(),
            realized_daily_pnl = ledger.realized_daily_pnl(),
            "restored realized daily P&L"
        );
        Ok(())
    }
}

/// Price of the newly filled units given the cumulative average.
fn delta_price(prior_notional: f64, filled_quantity: i64, average_price: f64, delta: i64) -> f64 {
    let price = (filled_quantity as f64 * average_price - prior_notional) / delta as f64;
    if price.is_finite() && price > 0.0 {
        price
    } else {
        average_price
    }
}
