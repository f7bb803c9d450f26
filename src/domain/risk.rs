//! Risk management.
//!
//! Signals are translated into intents ([`intents_for`]), then each opening
//! intent runs the checks in a fixed order, stopping at the first failure:
//! daily loss limit, shorting, position size, margin. Close intents are
//! always approved. Protective exits come from [`RiskManager::check_protective_exit`]
//! and never pass through [`RiskManager::evaluate`].

use std::collections::HashMap;
use std::fmt;

use super::ledger::AccountState;
use super::order::{OrderPurpose, OrderSide};
use super::position::{Position, ProtectiveLevels};
use super::signal::SignalKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingPolicy {
    Reject,
    Resize,
}

impl SizingPolicy {
    pub fn parse(value: &str) -> Option<SizingPolicy> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(SizingPolicy::Reject),
            "resize" => Some(SizingPolicy::Resize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_position_size: i64,
    pub max_daily_loss: f64,
    pub order_quantity: i64,
    pub margin_rate: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub sizing_policy: SizingPolicy,
    pub allow_shorting: bool,
}

impl RiskLimits {
    pub fn protective_levels(&self) -> ProtectiveLevels {
        ProtectiveLevels {
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
        }
    }
}

/// A step the execution core is asked to take for one signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intent {
    Open {
        side: OrderSide,
        quantity: i64,
    },
    Close {
        side: OrderSide,
        quantity: i64,
        purpose: OrderPurpose,
    },
}

impl Intent {
    pub fn side(&self) -> OrderSide {
        match self {
            Intent::Open { side, .. } | Intent::Close { side, .. } => *side,
        }
    }

    pub fn purpose(&self) -> OrderPurpose {
        match self {
            Intent::Open { .. } => OrderPurpose::Entry,
            Intent::Close { purpose, .. } => *purpose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskReject {
    DailyLossLimit,
    ShortingDisabled,
    PositionSizeLimit,
    InsufficientMargin,
}

impl RiskReject {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskReject::DailyLossLimit => "daily_loss_limit",
            RiskReject::ShortingDisabled => "shorting_disabled",
            RiskReject::PositionSizeLimit => "position_size_limit",
            RiskReject::InsufficientMargin => "insufficient_margin",
        }
    }
}

impl fmt::Display for RiskReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Approve(i64),
    Reject(RiskReject),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve(qty) => write!(f, "approve({qty})"),
            Decision::Reject(reason) => write!(f, "reject({reason})"),
        }
    }
}

/// Forced close produced by the stop-loss/take-profit scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveExit {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub purpose: OrderPurpose,
    pub trigger_price: f64,
}

impl ProtectiveExit {
    pub fn intent(&self) -> Intent {
        Intent::Close {
            side: self.side,
            quantity: self.quantity,
            purpose: self.purpose,
        }
    }
}

/// Translate a signal into intents given the current position.
///
/// Reversals are always two separate intents: close first, then open.
pub fn intents_for(
    signal: SignalKind,
    position: Option<&Position>,
    limits: &RiskLimits,
) -> Vec<Intent> {
    let held = position.map(|p| p.quantity).unwrap_or(0);
    let qty = limits.order_quantity;
    match signal {
        SignalKind::Hold => Vec::new(),
        SignalKind::Buy if held < 0 => vec![
            Intent::Close {
                side: OrderSide::Buy,
                quantity: -held,
                purpose: OrderPurpose::SignalClose,
            },
            Intent::Open {
                side: OrderSide::Buy,
                quantity: qty,
            },
        ],
        SignalKind::Buy => vec![Intent::Open {
            side: OrderSide::Buy,
            quantity: qty,
        }],
        SignalKind::Sell if held > 0 => {
            let mut intents = vec![Intent::Close {
                side: OrderSide::Sell,
                quantity: held,
                purpose: OrderPurpose::SignalClose,
            }];
            if limits.allow_shorting {
                intents.push(Intent::Open {
                    side: OrderSide::Sell,
                    quantity: qty,
                });
            }
            intents
        }
        SignalKind::Sell => vec![Intent::Open {
            side: OrderSide::Sell,
            quantity: qty,
        }],
    }
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        RiskManager { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn intents_for(&self, signal: SignalKind, position: Option<&Position>) -> Vec<Intent> {
        intents_for(signal, position, &self.limits)
    }

    /// Decide whether an intent may be submitted, and with what quantity.
    pub fn evaluate(
        &self,
        intent: &Intent,
        position: Option<&Position>,
        account: &AccountState,
        price: f64,
    ) -> Decision {
        let (side, quantity) = match *intent {
            Intent::Close { quantity, .. } => return Decision::Approve(quantity),
            Intent::Open { side, quantity } => (side, quantity),
        };

        if account.realized_daily_pnl <= -self.limits.max_daily_loss {
            return Decision::Reject(RiskReject::DailyLossLimit);
        }

        let held = position.map(|p| p.quantity).unwrap_or(0);
        if side == OrderSide::Sell && !self.limits.allow_shorting && held <= 0 {
            return Decision::Reject(RiskReject::ShortingDisabled);
        }

        let same_direction = if held.signum() == side.sign() {
            held.abs()
        } else {
            0
        };
        let headroom = self.limits.max_position_size - same_direction;
        let quantity = if quantity <= headroom {
            quantity
        } else {
            match self.limits.sizing_policy {
                SizingPolicy::Resize if headroom > 0 => headroom,
                _ => return Decision::Reject(RiskReject::PositionSizeLimit),
            }
        };

        let required_margin = quantity as f64 * price * self.limits.margin_rate;
        if required_margin > account.free_margin {
            return Decision::Reject(RiskReject::InsufficientMargin);
        }

        Decision::Approve(quantity)
    }

    /// Stop-loss is checked before take-profit.
    pub fn check_protective_exit(&self, position: &Position, price: f64) -> Option<ProtectiveExit> {
        if position.quantity == 0 {
            return None;
        }
        let purpose = if position.should_stop_loss(price) {
            OrderPurpose::StopLoss
        } else if position.should_take_profit(price) {
            OrderPurpose::TakeProfit
        } else {
            return None;
        };
        let side = if position.is_long() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        Some(ProtectiveExit {
            symbol: position.symbol.clone(),
            side,
            quantity: position.quantity.abs(),
            purpose,
            trigger_price: price,
        })
    }

    /// Scan every position that has a current price.
    pub fn scan_protective_exits<'a>(
        &self,
        positions: impl IntoIterator<Item = &'a Position>,
        prices: &HashMap<String, f64>,
    ) -> Vec<ProtectiveExit> {
        positions
            .into_iter()
            .filter_map(|p| {
                prices
                    .get(&p.symbol)
                    .and_then(|&price| self.check_protective_exit(p, price))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_size: 10,
            max_daily_loss: 500.0,
            order_quantity: 10,
            margin_rate: 0.1,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            sizing_policy: SizingPolicy::Reject,
            allow_shorting: false,
        }
    }

    fn account() -> AccountState {
        AccountState {
            balance: 100_000.0,
            equity: 100_000.0,
            margin_used: 0.0,
            free_margin: 100_000.0,
            realized_daily_pnl: 0.0,
        }
    }

    fn long(quantity: i64) -> Position {
        Position::open(
            "SPY",
            quantity,
            100.0,
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            limits().protective_levels(),
        )
    }

    fn open_buy(quantity: i64) -> Intent {
        Intent::Open {
            side: OrderSide::Buy,
            quantity,
        }
    }

    #[test]
    fn flat_buy_is_approved() {
        let rm = RiskManager::new(limits());
        let intents = rm.intents_for(SignalKind::Buy, None);
        assert_eq!(intents, vec![open_buy(10)]);
        assert_eq!(
            rm.evaluate(&intents[0], None, &account(), 100.0),
            Decision::Approve(10)
        );
    }

    #[test]
    fn buy_at_cap_is_rejected() {
        let rm = RiskManager::new(RiskLimits {
            max_position_size: 1,
            order_quantity: 1,
            ..limits()
        });
        let pos = long(1);
        let decision = rm.evaluate(&open_buy(1), Some(&pos), &account(), 100.0);
        assert_eq!(decision, Decision::Reject(RiskReject::PositionSizeLimit));
        assert_eq!(RiskReject::PositionSizeLimit.as_str(), "position_size_limit");
    }

    #[test]
    fn resize_policy_clamps_to_headroom() {
        let rm = RiskManager::new(RiskLimits {
            sizing_policy: SizingPolicy::Resize,
            ..limits()
        });
        let pos = long(7);
        assert_eq!(
            rm.evaluate(&open_buy(10), Some(&pos), &account(), 100.0),
            Decision::Approve(3)
        );
        let full = long(10);
        assert_eq!(
            rm.evaluate(&open_buy(10), Some(&full), &account(), 100.0),
            Decision::Reject(RiskReject::PositionSizeLimit)
        );
    }

    #[test]
    fn daily_loss_blocks_entries_not_closes() {
        let rm = RiskManager::new(limits());
        let mut acct = account();
        acct.realized_daily_pnl = -500.0;

        assert_eq!(
            rm.evaluate(&open_buy(1), None, &acct, 100.0),
            Decision::Reject(RiskReject::DailyLossLimit)
        );

        let pos = long(5);
        let close = Intent::Close {
            side: OrderSide::Sell,
            quantity: 5,
            purpose: OrderPurpose::SignalClose,
        };
        assert_eq!(rm.evaluate(&close, Some(&pos), &acct, 100.0), Decision::Approve(5));
    }

    #[test]
    fn daily_loss_checked_before_size() {
        let rm = RiskManager::new(limits());
        let mut acct = account();
        acct.realized_daily_pnl = -600.0;
        let pos = long(10);
        assert_eq!(
            rm.evaluate(&open_buy(10), Some(&pos), &acct, 100.0),
            Decision::Reject(RiskReject::DailyLossLimit)
        );
    }

    #[test]
    fn short_entry_needs_shorting_enabled() {
        let rm = RiskManager::new(limits());
        let intents = rm.intents_for(SignalKind::Sell, None);
        assert_eq!(
            rm.evaluate(&intents[0], None, &account(), 100.0),
            Decision::Reject(RiskReject::ShortingDisabled)
        );

        let rm = RiskManager::new(RiskLimits {
            allow_shorting: true,
            ..limits()
        });
        assert_eq!(
            rm.evaluate(&intents[0], None, &account(), 100.0),
            Decision::Approve(10)
        );
    }

    #[test]
    fn margin_check() {
        let rm = RiskManager::new(limits());
        let mut acct = account();
        acct.free_margin = 99.0;
        // 10 * 100 * 0.1 = 100 > 99
        assert_eq!(
            rm.evaluate(&open_buy(10), None, &acct, 100.0),
            Decision::Reject(RiskReject::InsufficientMargin)
        );
        acct.free_margin = 100.0;
        assert_eq!(rm.evaluate(&open_buy(10), None, &acct, 100.0), Decision::Approve(10));
    }

    #[test]
    fn sell_while_long_closes_first() {
        let pos = long(4);
        let intents = intents_for(SignalKind::Sell, Some(&pos), &limits());
        assert_eq!(
            intents,
            vec![Intent::Close {
                side: OrderSide::Sell,
                quantity: 4,
                purpose: OrderPurpose::SignalClose,
            }]
        );

        let shorting = RiskLimits {
            allow_shorting: true,
            ..limits()
        };
        let intents = intents_for(SignalKind::Sell, Some(&pos), &shorting);
        assert_eq!(intents.len(), 2);
        assert!(matches!(intents[1], Intent::Open { side: OrderSide::Sell, quantity: 10 }));
    }

    #[test]
    fn buy_while_short_closes_then_opens() {
        let short = Position::open(
            "SPY",
            -3,
            100.0,
            Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            limits().protective_levels(),
        );
        let intents = intents_for(SignalKind::Buy, Some(&short), &limits());
        assert_eq!(intents[0].side(), OrderSide::Buy);
        assert_eq!(intents[0].purpose(), OrderPurpose::SignalClose);
        assert_eq!(intents[1], open_buy(10));
    }

    #[test]
    fn hold_has_no_intents() {
        assert!(intents_for(SignalKind::Hold, Some(&long(3)), &limits()).is_empty());
    }

    #[test]
    fn stop_loss_forces_close() {
        let rm = RiskManager::new(limits());
        let pos = long(10);
        assert_eq!(pos.stop_loss_price, Some(98.0));

        let exit = rm.check_protective_exit(&pos, 97.0).unwrap();
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.quantity, 10);
        assert_eq!(exit.purpose, OrderPurpose::StopLoss);

        assert!(rm.check_protective_exit(&pos, 99.0).is_none());
        let tp = rm.check_protective_exit(&pos, 104.5).unwrap();
        assert_eq!(tp.purpose, OrderPurpose::TakeProfit);
    }

    #[test]
    fn scan_skips_symbols_without_price() {
        let rm = RiskManager::new(limits());
        let positions = [long(10)];
        let mut prices = HashMap::new();
        assert!(rm.scan_protective_exits(&positions, &prices).is_empty());
        prices.insert("SPY".to_string(), 90.0);
        assert_eq!(rm.scan_protective_exits(&positions, &prices).len(), 1);
    }

    #[test]
    fn sizing_policy_parse() {
        assert_eq!(SizingPolicy::parse("Resize"), Some(SizingPolicy::Resize));
        assert_eq!(SizingPolicy::parse("reject"), Some(SizingPolicy::Reject));
        assert_eq!(SizingPolicy::parse("clamp"), None);
    }
}
