//! Validated trading configuration.
//!
//! Built once at start-up from a [`ConfigPort`]. Any missing or invalid
//! field fails the build, so the trading loop never sees a partial config.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;

use crate::domain::config_validation::validate_trading_config;
use crate::domain::error::TradegateError;
use crate::domain::execution::{ExecutionSettings, PaperSettings, PartialFillPolicy};
use crate::domain::indicator::IndicatorParams;
use crate::domain::risk::{RiskLimits, SizingPolicy};
use crate::domain::signal::SignalFilters;
use crate::ports::config_port::ConfigPort;

pub const ALPACA_PAPER_URL: &str = "https://paper-api.alpaca.markets";
pub const ALPACA_LIVE_URL: &str = "https://api.alpaca.markets";
pub const ALPACA_DATA_URL: &str = "https://data.alpaca.markets";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Csv,
    Alpaca,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataConfig {
    pub source: DataSource,
    pub csv_dir: PathBuf,
    pub exchange: Option<String>,
    pub fetch_timeout: Duration,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlpacaEndpoints {
    pub trading_url: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub paper_trading: bool,
    pub poll_interval: Duration,
    pub timeframe: String,
    pub bar_count: usize,
    pub trading_day_start: NaiveTime,
    pub indicators: IndicatorParams,
    pub filters: SignalFilters,
    pub risk: RiskLimits,
    pub initial_balance: f64,
    pub paper: PaperSettings,
    pub execution: ExecutionSettings,
    pub market_data: MarketDataConfig,
    pub sqlite_path: Option<PathBuf>,
    pub sqlite_pool_size: u32,
    pub alpaca: AlpacaEndpoints,
    pub log_directory: Option<PathBuf>,
    pub close_on_shutdown: bool,
}

/// Parse a comma-separated symbol list: trimmed, upper-cased, no empty
/// tokens, no duplicates.
pub fn parse_symbols(input: &str) -> Result<Vec<String>, TradegateError> {
    let mut symbols = Vec::new();
    let mut seen = HashSet::new();

    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(TradegateError::invalid_config(
                "trading",
                "symbols",
                "empty token in symbol list",
            ));
        }
        let symbol = trimmed.to_uppercase();
        if !seen.insert(symbol.clone()) {
            return Err(TradegateError::invalid_config(
                "trading",
                "symbols",
                format!("duplicate symbol: {symbol}"),
            ));
        }
        symbols.push(symbol);
    }

    Ok(symbols)
}

fn parse_day_start(value: Option<String>) -> Result<NaiveTime, TradegateError> {
    match value {
        None => Ok(NaiveTime::MIN),
        Some(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| {
            TradegateError::invalid_config(
                "trading",
                "trading_day_start",
                "expected HH:MM (UTC)",
            )
        }),
    }
}

fn non_empty(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl TradingConfig {
    pub fn from_port(config: &dyn ConfigPort) -> Result<Self, TradegateError> {
        validate_trading_config(config)?;

        let symbols = parse_symbols(&config.get_string("trading", "symbols").unwrap_or_default())?;
        let paper_trading = config.get_bool("trading", "paper_trading", true);

        let indicators = IndicatorParams {
            short_ma_period: config.get_int("strategy", "short_ma_period", 5) as usize,
            long_ma_period: config.get_int("strategy", "long_ma_period", 20) as usize,
            rsi_period: config.get_int("strategy", "rsi_period", 14) as usize,
            volume_ma_period: config.get_int("strategy", "volume_ma_period", 20) as usize,
            volume_multiplier: config.get_double("strategy", "volume_multiplier", 1.5),
        };
        let filters = SignalFilters {
            rsi_filter: config.get_bool("strategy", "rsi_filter", true),
            rsi_overbought: config.get_double("strategy", "rsi_overbought", 70.0),
            rsi_oversold: config.get_double("strategy", "rsi_oversold", 30.0),
            volume_filter: config.get_bool("strategy", "volume_filter", false),
        };

        let sizing_policy = match non_empty(config, "risk", "sizing_policy") {
            None => SizingPolicy::Reject,
            Some(s) => SizingPolicy::parse(&s).ok_or_else(|| {
                TradegateError::invalid_config("risk", "sizing_policy", "expected reject or resize")
            })?,
        };
        let risk = RiskLimits {
            max_position_size: config.get_int("risk", "max_position_size", 0),
            max_daily_loss: config.get_double("risk", "max_daily_loss", 0.0),
            order_quantity: config.get_int("trading", "order_quantity", 1),
            margin_rate: config.get_double("risk", "margin_rate", 0.1),
            stop_loss_pct: config.get_double("risk", "stop_loss_percent", 2.0),
            take_profit_pct: config.get_double("risk", "take_profit_percent", 4.0),
            sizing_policy,
            allow_shorting: config.get_bool("risk", "allow_shorting", false),
        };

        let paper = PaperSettings {
            slippage_pct: config.get_double("paper", "slippage_pct", 0.05),
            commission_per_trade: config.get_double("paper", "commission_per_trade", 0.0),
            commission_pct: config.get_double("paper", "commission_pct", 0.0),
            fill_delay: Duration::from_millis(config.get_int("paper", "fill_delay_ms", 0) as u64),
        };

        let partial_fill_policy = match non_empty(config, "execution", "partial_fill_policy") {
            None => PartialFillPolicy::Cancel,
            Some(s) => PartialFillPolicy::parse(&s).ok_or_else(|| {
                TradegateError::invalid_config(
                    "execution",
                    "partial_fill_policy",
                    "expected cancel or rest",
                )
            })?,
        };
        let execution = ExecutionSettings {
            submit_timeout: Duration::from_secs(
                config.get_int("execution", "submit_timeout_secs", 10) as u64,
            ),
            max_retries: config.get_int("execution", "max_retries", 3) as u32,
            retry_backoff: Duration::from_millis(
                config.get_int("execution", "retry_backoff_ms", 500) as u64,
            ),
            partial_fill_policy,
        };

        let source = match non_empty(config, "market_data", "source")
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("csv") => DataSource::Csv,
            Some("alpaca") => DataSource::Alpaca,
            Some(_) => {
                return Err(TradegateError::invalid_config(
                    "market_data",
                    "source",
                    "expected csv or alpaca",
                ));
            }
        };
        let market_data = MarketDataConfig {
            source,
            csv_dir: PathBuf::from(
                non_empty(config, "market_data", "csv_dir").unwrap_or_else(|| "data".to_string()),
            ),
            exchange: non_empty(config, "market_data", "exchange"),
            fetch_timeout: Duration::from_secs(
                config.get_int("market_data", "fetch_timeout_secs", 10) as u64,
            ),
            streaming: config.get_bool("market_data", "streaming", false),
        };

        let default_trading_url = if paper_trading {
            ALPACA_PAPER_URL
        } else {
            ALPACA_LIVE_URL
        };
        let alpaca = AlpacaEndpoints {
            trading_url: non_empty(config, "alpaca", "trading_url")
                .unwrap_or_else(|| default_trading_url.to_string()),
            data_url: non_empty(config, "alpaca", "data_url")
                .unwrap_or_else(|| ALPACA_DATA_URL.to_string()),
        };

        let default_bar_count = (indicators.required_bars() * 2) as i64;
        let bar_count = config.get_int("trading", "bar_count", default_bar_count);
        if bar_count < 1 || (bar_count as usize) < indicators.required_bars() {
            return Err(TradegateError::invalid_config(
                "trading",
                "bar_count",
                format!(
                    "bar_count must cover the indicator window of {} bars",
                    indicators.required_bars()
                ),
            ));
        }

        let pool_size = config.get_int("sqlite", "pool_size", 4);
        if pool_size < 1 {
            return Err(TradegateError::invalid_config(
                "sqlite",
                "pool_size",
                "pool_size must be at least 1",
            ));
        }

        Ok(TradingConfig {
            symbols,
            paper_trading,
            poll_interval: Duration::from_secs(config.get_int("trading", "poll_interval", 60) as u64),
            timeframe: non_empty(config, "trading", "timeframe").unwrap_or_else(|| "1Day".to_string()),
            bar_count: bar_count as usize,
            trading_day_start: parse_day_start(non_empty(config, "trading", "trading_day_start"))?,
            indicators,
            filters,
            risk,
            initial_balance: config.get_double("paper", "initial_balance", 100_000.0),
            paper,
            execution,
            market_data,
            sqlite_path: non_empty(config, "sqlite", "path").map(PathBuf::from),
            sqlite_pool_size: pool_size as u32,
            alpaca,
            log_directory: non_empty(config, "logging", "directory").map(PathBuf::from),
            close_on_shutdown: config.get_bool("trading", "close_on_shutdown", false),
        })
    }

    /// Keep only `symbols`, which must all be configured.
    pub fn restrict_symbols(&mut self, symbols: &str) -> Result<(), TradegateError> {
        let wanted = parse_symbols(symbols)?;
        if let Some(unknown) = wanted.iter().find(|s| !self.symbols.contains(s)) {
            return Err(TradegateError::invalid_config(
                "trading",
                "symbols",
                format!("{unknown} is not a configured symbol"),
            ));
        }
        self.symbols = wanted;
        Ok(())
    }
}
