//! Crossover signal generation.
//!
//! Signals are edge-triggered: a BUY or SELL is emitted only on the cycle in
//! which the short moving average crosses the long one. While the ordering
//! persists every later cycle yields HOLD.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::indicator::{IndicatorParams, IndicatorSnapshot, compute_snapshot};
use super::ohlcv::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Buy => write!(f, "BUY"),
            SignalKind::Sell => write!(f, "SELL"),
            SignalKind::Hold => write!(f, "HOLD"),
        }
    }
}

/// Why a crossover was downgraded to HOLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Overbought,
    Oversold,
    NoVolumeConfirmation,
}

impl fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressReason::Overbought => write!(f, "rsi_overbought"),
            SuppressReason::Oversold => write!(f, "rsi_oversold"),
            SuppressReason::NoVolumeConfirmation => write!(f, "no_volume_confirmation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub kind: SignalKind,
    pub generated_at: DateTime<Utc>,
    pub suppressed_by: Option<SuppressReason>,
}

impl Signal {
    pub fn hold(symbol: &str, generated_at: DateTime<Utc>) -> Self {
        Signal {
            symbol: symbol.to_string(),
            kind: SignalKind::Hold,
            generated_at,
            suppressed_by: None,
        }
    }
}

/// Relative ordering of the short MA against the long MA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaOrdering {
    Above,
    Below,
    Unknown,
}

impl MaOrdering {
    /// `None` when both averages are equal; equality is not a transition.
    fn of(snapshot: &IndicatorSnapshot) -> Option<MaOrdering> {
        if snapshot.short_ma > snapshot.long_ma {
            Some(MaOrdering::Above)
        } else if snapshot.short_ma < snapshot.long_ma {
            Some(MaOrdering::Below)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalFilters {
    pub rsi_filter: bool,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub volume_filter: bool,
}

impl Default for SignalFilters {
    fn default() -> Self {
        SignalFilters {
            rsi_filter: true,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            volume_filter: false,
        }
    }
}

impl SignalFilters {
    fn suppress(&self, kind: SignalKind, snapshot: &IndicatorSnapshot) -> Option<SuppressReason> {
        if self.rsi_filter {
            match kind {
                SignalKind::Buy if snapshot.rsi > self.rsi_overbought => {
                    return Some(SuppressReason::Overbought);
                }
                SignalKind::Sell if snapshot.rsi < self.rsi_oversold => {
                    return Some(SuppressReason::Oversold);
                }
                _ => {}
            }
        }
        if self.volume_filter && kind != SignalKind::Hold && !snapshot.volume_confirmed {
            return Some(SuppressReason::NoVolumeConfirmation);
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalGenerator {
    filters: SignalFilters,
    state: HashMap<String, MaOrdering>,
}

impl SignalGenerator {
    pub fn new(filters: SignalFilters) -> Self {
        SignalGenerator {
            filters,
            state: HashMap::new(),
        }
    }

    pub fn ordering(&self, symbol: &str) -> MaOrdering {
        self.state
            .get(symbol)
            .copied()
            .unwrap_or(MaOrdering::Unknown)
    }

    /// Feed one snapshot for `symbol` and return the resulting signal.
    pub fn update(
        &mut self,
        symbol: &str,
        snapshot: &IndicatorSnapshot,
        now: DateTime<Utc>,
    ) -> Signal {
        let previous = self.ordering(symbol);
        let Some(current) = MaOrdering::of(snapshot) else {
            return Signal::hold(symbol, now);
        };
        self.state.insert(symbol.to_string(), current);

        let kind = match (previous, current) {
            (MaOrdering::Below, MaOrdering::Above) => SignalKind::Buy,
            (MaOrdering::Above, MaOrdering::Below) => SignalKind::Sell,
            _ => SignalKind::Hold,
        };

        let suppressed_by = self.filters.suppress(kind, snapshot);
        if let Some(reason) = suppressed_by {
            debug!(
                symbol,
                signal = %kind,
                rsi = snapshot.rsi,
                reason = %reason,
                "crossover suppressed by filter"
            );
        }

        Signal {
            symbol: symbol.to_string(),
            kind: if suppressed_by.is_some() {
                SignalKind::Hold
            } else {
                kind
            },
            generated_at: now,
            suppressed_by,
        }
    }

    /// Compute indicators from `bars` and update. Insufficient data yields
    /// HOLD and leaves the crossover state untouched.
    pub fn process_window(
        &mut self,
        symbol: &str,
        bars: &[Bar],
        params: &IndicatorParams,
        now: DateTime<Utc>,
    ) -> (Signal, Option<IndicatorSnapshot>) {
        match compute_snapshot(symbol, bars, params) {
            Ok(snapshot) => (self.update(symbol, &snapshot, now), Some(snapshot)),
            Err(e) => {
                debug!(symbol, error = %e, "holding: indicators unavailable");
                (Signal::hold(symbol, now), None)
            }
        }
    }
}
