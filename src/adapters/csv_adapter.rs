//! CSV replay market data feed.
//!
//! Replays historical bars from `<dir>/<SYMBOL>_<EXCHANGE>.csv` (or
//! `<dir>/<SYMBOL>.csv` when no exchange is configured) as if they arrived
//! live. The first `get_bars` call for a symbol returns the first `count`
//! bars; every later call advances the replay cursor by one bar.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::domain::error::TradegateError;
use crate::domain::ohlcv::Bar;
use crate::ports::market_data_port::MarketDataPort;

struct Replay {
    bars: Vec<Bar>,
    cursor: usize,
}

pub struct CsvReplayFeed {
    base_path: PathBuf,
    exchange: Option<String>,
    replays: Mutex<HashMap<String, Replay>>,
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Parse `timestamp,open,high,low,close,volume` rows, sorted by timestamp.
pub fn parse_bars(symbol: &str, content: &str) -> Result<Vec<Bar>, TradegateError> {
    let err = |reason: String| TradegateError::MarketData {
        symbol: symbol.to_string(),
        reason,
    };

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for (line, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| err(format!("CSV parse error: {e}")))?;
        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .ok_or_else(|| err(format!("row {}: missing {name} column", line + 1)))
        };
        let number = |idx: usize, name: &str| -> Result<f64, TradegateError> {
            field(idx, name)?
                .trim()
                .parse::<f64>()
                .map_err(|e| err(format!("row {}: invalid {name} value: {e}", line + 1)))
        };

        let raw_ts = field(0, "timestamp")?;
        let timestamp = parse_timestamp(raw_ts)
            .ok_or_else(|| err(format!("row {}: invalid timestamp {raw_ts:?}", line + 1)))?;

        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp,
            open: number(1, "open")?,
            high: number(2, "high")?,
            low: number(3, "low")?,
            close: number(4, "close")?,
            volume: number(5, "volume")?,
        });
    }

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    Ok(bars)
}

impl CsvReplayFeed {
    pub fn new(base_path: PathBuf, exchange: Option<String>) -> Self {
        Self {
            base_path,
            exchange,
            replays: Mutex::new(HashMap::new()),
        }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        match &self.exchange {
            Some(exchange) => {
                let qualified = self.base_path.join(format!("{symbol}_{exchange}.csv"));
                if qualified.exists() {
                    qualified
                } else {
                    self.base_path.join(format!("{symbol}.csv"))
                }
            }
            None => self.base_path.join(format!("{symbol}.csv")),
        }
    }

    fn load(&self, symbol: &str, path: &Path) -> Result<Vec<Bar>, TradegateError> {
        let content = fs::read_to_string(path).map_err(|e| TradegateError::MarketData {
            symbol: symbol.to_string(),
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        parse_bars(symbol, &content)
    }

    /// Advance the replay and return the visible window.
    fn next_window(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, TradegateError> {
        let mut replays = self.replays.lock().unwrap_or_else(|e| e.into_inner());
        if !replays.contains_key(symbol) {
            let bars = self.load(symbol, &self.csv_path(symbol))?;
            let cursor = count.min(bars.len());
            replays.insert(symbol.to_string(), Replay { bars, cursor });
        } else if let Some(replay) = replays.get_mut(symbol) {
            replay.cursor = (replay.cursor + 1).min(replay.bars.len());
        }

        let Some(replay) = replays.get(symbol) else {
            return Ok(Vec::new());
        };
        let start = replay.cursor.saturating_sub(count);
        Ok(replay.bars[start..replay.cursor].to_vec())
    }

    /// Bars not yet replayed for `symbol`.
    pub fn remaining(&self, symbol: &str) -> usize {
        let replays = self.replays.lock().unwrap_or_else(|e| e.into_inner());
        replays
            .get(symbol)
            .map(|r| r.bars.len() - r.cursor)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarketDataPort for CsvReplayFeed {
    async fn get_bars(
        &self,
        symbol: &str,
        _timeframe: &str,
        count: usize,
    ) -> Result<Vec<Bar>, TradegateError> {
        self.next_window(symbol, count)
    }

    async fn subscribe_stream(
        &self,
        symbol: &str,
    ) -> Result<BoxStream<'static, Result<Bar, TradegateError>>, TradegateError> {
        let replayed = {
            let replays = self.replays.lock().unwrap_or_else(|e| e.into_inner());
            replays
                .get(symbol)
                .map(|replay| replay.bars[replay.cursor..].to_vec())
        };
        let pending = match replayed {
            Some(bars) => bars,
            None => self.load(symbol, &self.csv_path(symbol))?,
        };
        Ok(stream::iter(pending.into_iter().map(Ok)).boxed())
    }
}
