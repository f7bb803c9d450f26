//! Volume confirmation.

use super::sma::calculate_sma;

/// Moving average of the last `period` volumes.
pub fn volume_ma(volumes: &[f64], period: usize) -> Option<f64> {
    calculate_sma(volumes, period)
}

/// Current volume strictly exceeds the average scaled by `multiplier`.
pub fn is_volume_confirmed(current: f64, average: f64, multiplier: f64) -> bool {
    current > average * multiplier
}
