//! Account and position ledger.
//!
//! The ledger is the process-owned record of balance, open positions,
//! realized daily P&L, trade records and account snapshots. It is mutated
//! only through [`Ledger::apply_fill`], which applies a fill as one unit:
//! the position change, the trade record and the account snapshot are all
//! computed before any field is written.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};

use super::order::{Fill, OrderSide};
use super::position::{Position, ProtectiveLevels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Filled,
    Partial,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Filled => "FILLED",
            TradeStatus::Partial => "PARTIAL",
        }
    }

    pub fn parse(value: &str) -> Option<TradeStatus> {
        match value {
            "FILLED" => Some(TradeStatus::Filled),
            "PARTIAL" => Some(TradeStatus::Partial),
            _ => None,
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    /// Units of an existing position this trade closed.
    pub closed_quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub status: TradeStatus,
}

impl TradeRecord {
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * self.quantity
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    pub realized_daily_pnl: f64,
}

/// Point-in-time view used by the risk checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountState {
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    pub realized_daily_pnl: f64,
}

/// Everything a single fill changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    pub trade: TradeRecord,
    pub snapshot: AccountSnapshot,
    pub position_before: Option<Position>,
    pub position_after: Option<Position>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    balance: f64,
    margin_rate: f64,
    positions: HashMap<String, Position>,
    last_prices: HashMap<String, f64>,
    realized_daily_pnl: f64,
    day_start: NaiveTime,
    trading_day: Option<NaiveDate>,
    trades: Vec<TradeRecord>,
    snapshots: Vec<AccountSnapshot>,
}

/// Trading day a timestamp belongs to, given the UTC time the day starts.
pub fn trading_day_of(at: DateTime<Utc>, day_start: NaiveTime) -> NaiveDate {
    let offset = Duration::seconds(day_start.num_seconds_from_midnight() as i64);
    (at - offset).date_naive()
}

/// Start of the trading day containing `at`.
pub fn trading_day_start(at: DateTime<Utc>, day_start: NaiveTime) -> DateTime<Utc> {
    trading_day_of(at, day_start).and_time(day_start).and_utc()
}

impl Ledger {
    pub fn new(balance: f64, margin_rate: f64, day_start: NaiveTime) -> Self {
        Ledger {
            balance,
            margin_rate,
            positions: HashMap::new(),
            last_prices: HashMap::new(),
            realized_daily_pnl: 0.0,
            day_start,
            trading_day: None,
            trades: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn realized_daily_pnl(&self) -> f64 {
        self.realized_daily_pnl
    }

    pub fn trading_day(&self) -> Option<NaiveDate> {
        self.trading_day
    }

    pub fn day_start(&self) -> NaiveTime {
        self.day_start
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn snapshots(&self) -> &[AccountSnapshot] {
        &self.snapshots
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    pub fn mark_price(&mut self, symbol: &str, price: f64) {
        self.last_prices.insert(symbol.to_string(), price);
    }

    /// Reset realized daily P&L when `now` falls in a later trading day.
    /// Returns true when a rollover happened.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let day = trading_day_of(now, self.day_start);
        match self.trading_day {
            Some(current) if day <= current => false,
            previous => {
                self.trading_day = Some(day);
                if previous.is_some() {
                    self.realized_daily_pnl = 0.0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Seed realized daily P&L from persisted trades of the current day.
    pub fn restore_daily_pnl(&mut self, now: DateTime<Utc>, trades: &[TradeRecord]) {
        self.roll_day(now);
        let day = trading_day_of(now, self.day_start);
        self.realized_daily_pnl = trades
            .iter()
            .filter(|t| trading_day_of(t.timestamp, self.day_start) == day)
            .filter(|t| t.closed_quantity > 0)
            .map(|t| t.realized_pnl - t.commission)
            .sum();
    }

    /// Replace balance and positions with the broker's view.
    pub fn seed(&mut self, balance: f64, positions: Vec<Position>) {
        self.balance = balance;
        self.positions = positions
            .into_iter()
            .filter(|p| p.quantity != 0)
            .map(|p| (p.symbol.clone(), p))
            .collect();
    }

    fn mark_of(&self, position: &Position) -> f64 {
        self.last_prices
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.average_entry_price)
    }

    fn state_with(
        &self,
        balance: f64,
        realized_daily_pnl: f64,
        positions: &HashMap<String, Position>,
        prices: &HashMap<String, f64>,
    ) -> AccountState {
        let mut unrealized = 0.0;
        let mut margin_used = 0.0;
        for position in positions.values() {
            let mark = prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.average_entry_price);
            unrealized += position.unrealized_pnl(mark);
            margin_used += position.market_value(mark) * self.margin_rate;
        }
        let equity = balance + unrealized;
        AccountState {
            balance,
            equity,
            margin_used,
            free_margin: equity - margin_used,
            realized_daily_pnl,
        }
    }

    pub fn account_state(&self) -> AccountState {
        self.state_with(
            self.balance,
            self.realized_daily_pnl,
            &self.positions,
            &self.last_prices,
        )
    }

    /// Unrealized P&L of the open position in `symbol` at the last mark.
    pub fn unrealized_pnl(&self, symbol: &str) -> Option<f64> {
        self.positions
            .get(symbol)
            .map(|p| p.unrealized_pnl(self.mark_of(p)))
    }

    pub fn record_snapshot(&mut self, now: DateTime<Utc>) -> AccountSnapshot {
        let state = self.account_state();
        let snapshot = snapshot_from(now, &state);
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    /// Apply one confirmed fill.
    pub fn apply_fill(
        &mut self,
        fill: &Fill,
        levels: ProtectiveLevels,
        status: TradeStatus,
    ) -> FillOutcome {
        self.roll_day(fill.filled_at);

        let position_before = self.positions.get(&fill.symbol).cloned();
        let change = Position::apply(
            position_before.as_ref(),
            &fill.symbol,
            fill.signed_quantity(),
            fill.price,
            fill.filled_at,
            levels,
        );

        let balance = self.balance + change.realized_pnl - fill.commission;
        let realized_daily_pnl = if change.closed_quantity > 0 {
            self.realized_daily_pnl + change.realized_pnl - fill.commission
        } else {
            self.realized_daily_pnl
        };

        let mut positions = self.positions.clone();
        match &change.position {
            Some(position) => {
                positions.insert(fill.symbol.clone(), position.clone());
            }
            None => {
                positions.remove(&fill.symbol);
            }
        }
        let mut prices = self.last_prices.clone();
        prices.insert(fill.symbol.clone(), fill.price);

        let state = self.state_with(balance, realized_daily_pnl, &positions, &prices);
        let trade = TradeRecord {
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.quantity,
            price: fill.price,
            commission: fill.commission,
            realized_pnl: change.realized_pnl,
            closed_quantity: change.closed_quantity,
            timestamp: fill.filled_at,
            order_id: fill.order_id.clone(),
            status,
        };
        let snapshot = snapshot_from(fill.filled_at, &state);

        self.balance = balance;
        self.realized_daily_pnl = realized_daily_pnl;
        self.positions = positions;
        self.last_prices = prices;
        self.trades.push(trade.clone());
        self.snapshots.push(snapshot.clone());

        FillOutcome {
            trade,
            snapshot,
            position_before,
            position_after: change.position,
        }
    }
}

fn snapshot_from(timestamp: DateTime<Utc>, state: &AccountState) -> AccountSnapshot {
    AccountSnapshot {
        timestamp,
        balance: state.balance,
        equity: state.equity,
        margin_used: state.margin_used,
        free_margin: state.free_margin,
        realized_daily_pnl: state.realized_daily_pnl,
    }
}
