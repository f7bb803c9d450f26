//! In-memory price history store.
//!
//! Append-only per symbol: a bar whose timestamp is already present is
//! ignored rather than replacing the stored one. Each symbol keeps at most
//! `capacity` bars; the oldest are evicted first.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::ohlcv::Bar;

#[derive(Debug)]
pub struct PriceHistoryStore {
    capacity: usize,
    series: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, Bar>>>,
}

impl PriceHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Appends a bar. Returns `false` when the (symbol, timestamp) pair was
    /// already stored.
    pub fn append(&self, bar: Bar) -> bool {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        let bars = series.entry(bar.symbol.clone()).or_default();
        if bars.contains_key(&bar.timestamp) {
            return false;
        }
        bars.insert(bar.timestamp, bar);
        while bars.len() > self.capacity {
            bars.pop_first();
        }
        true
    }

    /// Appends every bar and returns the ones that were new.
    pub fn extend<I>(&self, bars: I) -> Vec<Bar>
    where
        I: IntoIterator<Item = Bar>,
    {
        bars.into_iter()
            .filter(|bar| self.append(bar.clone()))
            .collect()
    }

    /// The last `n` bars for a symbol, oldest first.
    pub fn latest_window(&self, symbol: &str, n: usize) -> Vec<Bar> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        match series.get(symbol) {
            Some(bars) => {
                let skip = bars.len().saturating_sub(n);
                bars.values().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<Bar> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .get(symbol)
            .and_then(|bars| bars.last_key_value())
            .map(|(_, bar)| bar.clone())
    }

    pub fn len(&self, symbol: &str) -> usize {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series.get(symbol).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }
}
