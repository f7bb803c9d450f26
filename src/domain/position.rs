//! Position tracking.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: i64,
    pub average_entry_price: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

/// Percent distances used to derive stop-loss/take-profit prices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

/// Result of applying a signed quantity change to a position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub position: Option<Position>,
    pub closed_quantity: i64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.quantity > 0
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity.unsigned_abs() as f64 * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.quantity as f64 * (price - self.average_entry_price)
    }

    pub fn should_stop_loss(&self, price: f64) -> bool {
        match self.stop_loss_price {
            Some(stop) if self.is_long() => price <= stop,
            Some(stop) if self.is_short() => price >= stop,
            _ => false,
        }
    }

    pub fn should_take_profit(&self, price: f64) -> bool {
        match self.take_profit_price {
            Some(target) if self.is_long() => price >= target,
            Some(target) if self.is_short() => price <= target,
            _ => false,
        }
    }

    fn with_levels(mut self, levels: ProtectiveLevels) -> Self {
        let entry = self.average_entry_price;
        let (stop, target) = if self.is_long() {
            (
                entry * (1.0 - levels.stop_loss_pct / 100.0),
                entry * (1.0 + levels.take_profit_pct / 100.0),
            )
        } else {
            (
                entry * (1.0 + levels.stop_loss_pct / 100.0),
                entry * (1.0 - levels.take_profit_pct / 100.0),
            )
        };
        self.stop_loss_price = (levels.stop_loss_pct > 0.0).then_some(stop);
        self.take_profit_price = (levels.take_profit_pct > 0.0).then_some(target);
        self
    }

    /// Open a fresh position. `quantity` is signed.
    pub fn open(
        symbol: &str,
        quantity: i64,
        price: f64,
        opened_at: DateTime<Utc>,
        levels: ProtectiveLevels,
    ) -> Self {
        Position {
            symbol: symbol.to_string(),
            quantity,
            average_entry_price: price,
            stop_loss_price: None,
            take_profit_price: None,
            opened_at,
        }
        .with_levels(levels)
    }

    /// Apply a signed fill of `delta` units at `price` to an optional
    /// existing position.
    ///
    /// - same direction (or flat): weighted-average entry, levels recomputed
    /// - opposite direction: realizes P&L on the closed part; any excess
    ///   opens a new position on the other side at `price`
    pub fn apply(
        existing: Option<&Position>,
        symbol: &str,
        delta: i64,
        price: f64,
        at: DateTime<Utc>,
        levels: ProtectiveLevels,
    ) -> PositionChange {
        let Some(current) = existing.filter(|p| p.quantity != 0) else {
            return PositionChange {
                position: (delta != 0).then(|| Position::open(symbol, delta, price, at, levels)),
                closed_quantity: 0,
                realized_pnl: 0.0,
            };
        };

        if current.quantity.signum() == delta.signum() || delta == 0 {
            let old_abs = current.quantity.unsigned_abs() as f64;
            let add_abs = delta.unsigned_abs() as f64;
            let quantity = current.quantity + delta;
            let average = if delta == 0 {
                current.average_entry_price
            } else {
                (old_abs * current.average_entry_price + add_abs * price) / (old_abs + add_abs)
            };
            let position = Position {
                quantity,
                average_entry_price: average,
                ..current.clone()
            }
            .with_levels(levels);
            return PositionChange {
                position: Some(position),
                closed_quantity: 0,
                realized_pnl: 0.0,
            };
        }

        let closed = delta.unsigned_abs().min(current.quantity.unsigned_abs()) as i64;
        let realized_pnl =
            closed as f64 * (price - current.average_entry_price) * current.quantity.signum() as f64;
        let remaining = current.quantity + delta;

        let position = if remaining == 0 {
            None
        } else if remaining.signum() == current.quantity.signum() {
            Some(Position {
                quantity: remaining,
                ..current.clone()
            })
        } else {
            Some(Position::open(symbol, remaining, price, at, levels))
        };

        PositionChange {
            position,
            closed_quantity: closed,
            realized_pnl,
        }
    }
}
