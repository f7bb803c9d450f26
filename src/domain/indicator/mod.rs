//! Indicator engine.
//!
//! Computes an [`IndicatorSnapshot`] from the latest window of bars:
//! - short and long simple moving averages of closes
//! - RSI with Wilder smoothing
//! - volume moving average and a volume-confirmation flag
//!
//! Snapshots are derived per cycle and never stored.

pub mod rsi;
pub mod sma;
pub mod volume;

use chrono::{DateTime, Utc};

use crate::domain::error::TradegateError;
use crate::domain::ohlcv::Bar;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    pub rsi_period: usize,
    pub volume_ma_period: usize,
    pub volume_multiplier: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        IndicatorParams {
            short_ma_period: 5,
            long_ma_period: 20,
            rsi_period: 14,
            volume_ma_period: 20,
            volume_multiplier: 1.5,
        }
    }
}

impl IndicatorParams {
    /// Longest lookback of any indicator, in bars. RSI needs one extra close
    /// to form its first price change.
    pub fn longest_lookback(&self) -> usize {
        self.short_ma_period
            .max(self.long_ma_period)
            .max(self.rsi_period + 1)
            .max(self.volume_ma_period)
    }

    /// Bars required for a snapshot: longest lookback + 1.
    pub fn required_bars(&self) -> usize {
        self.longest_lookback() + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub short_ma: f64,
    pub long_ma: f64,
    pub rsi: f64,
    pub volume_ma: f64,
    pub last_close: f64,
    pub last_volume: f64,
    pub volume_confirmed: bool,
    pub as_of: DateTime<Utc>,
}

/// Compute a snapshot from `bars` (oldest first). Only the last
/// `params.required_bars()` bars are used.
pub fn compute_snapshot(
    symbol: &str,
    bars: &[Bar],
    params: &IndicatorParams,
) -> Result<IndicatorSnapshot, TradegateError> {
    let need = params.required_bars();
    let insufficient = || TradegateError::DataUnavailable {
        symbol: symbol.to_string(),
        have: bars.len(),
        need,
    };

    if bars.len() < need {
        return Err(insufficient());
    }

    let window = &bars[bars.len() - need..];
    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = window.iter().map(|b| b.volume).collect();
    let last = window.last().ok_or_else(insufficient)?;

    let short_ma = sma::calculate_sma(&closes, params.short_ma_period).ok_or_else(insufficient)?;
    let long_ma = sma::calculate_sma(&closes, params.long_ma_period).ok_or_else(insufficient)?;
    let rsi = rsi::calculate_rsi(&closes, params.rsi_period).ok_or_else(insufficient)?;
    let volume_ma =
        volume::volume_ma(&volumes, params.volume_ma_period).ok_or_else(insufficient)?;

    Ok(IndicatorSnapshot {
        short_ma,
        long_ma,
        rsi,
        volume_ma,
        last_close: last.close,
        last_volume: last.volume,
        volume_confirmed: volume::is_volume_confirmed(
            last.volume,
            volume_ma,
            params.volume_multiplier,
        ),
        as_of: last.timestamp,
    })
}
