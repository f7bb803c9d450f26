//! Configuration validation.
//!
//! Every check runs before the trading loop starts; the first failure is
//! returned and is fatal at boot.

use crate::domain::error::TradegateError;
use crate::ports::config_port::ConfigPort;

pub fn validate_trading_config(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    validate_symbols(config)?;
    validate_value_types(config)?;
    validate_poll_interval(config)?;
    validate_order_quantity(config)?;
    validate_risk_limits(config)?;
    validate_margin_rate(config)?;
    validate_percentages(config)?;
    validate_periods(config)?;
    validate_rsi_thresholds(config)?;
    validate_paper(config)?;
    validate_execution(config)?;
    Ok(())
}

fn validate_symbols(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    match config.get_string("trading", "symbols") {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(TradegateError::missing_config("trading", "symbols")),
    }
}

enum Kind {
    Int,
    Number,
    Bool,
}

const TYPED_KEYS: &[(&str, &str, Kind)] = &[
    ("trading", "paper_trading", Kind::Bool),
    ("trading", "poll_interval", Kind::Int),
    ("trading", "bar_count", Kind::Int),
    ("trading", "order_quantity", Kind::Int),
    ("trading", "close_on_shutdown", Kind::Bool),
    ("risk", "max_position_size", Kind::Int),
    ("risk", "max_daily_loss", Kind::Number),
    ("risk", "stop_loss_percent", Kind::Number),
    ("risk", "take_profit_percent", Kind::Number),
    ("risk", "margin_rate", Kind::Number),
    ("risk", "allow_shorting", Kind::Bool),
    ("strategy", "short_ma_period", Kind::Int),
    ("strategy", "long_ma_period", Kind::Int),
    ("strategy", "rsi_period", Kind::Int),
    ("strategy", "volume_ma_period", Kind::Int),
    ("strategy", "volume_multiplier", Kind::Number),
    ("strategy", "rsi_filter", Kind::Bool),
    ("strategy", "rsi_overbought", Kind::Number),
    ("strategy", "rsi_oversold", Kind::Number),
    ("strategy", "volume_filter", Kind::Bool),
    ("paper", "initial_balance", Kind::Number),
    ("paper", "slippage_pct", Kind::Number),
    ("paper", "commission_per_trade", Kind::Number),
    ("paper", "commission_pct", Kind::Number),
    ("paper", "fill_delay_ms", Kind::Int),
    ("execution", "submit_timeout_secs", Kind::Int),
    ("execution", "max_retries", Kind::Int),
    ("execution", "retry_backoff_ms", Kind::Int),
    ("market_data", "fetch_timeout_secs", Kind::Int),
    ("market_data", "streaming", Kind::Bool),
    ("sqlite", "pool_size", Kind::Int),
];

/// A present value that does not parse is an error, never a silent default.
fn validate_value_types(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    for (section, key, kind) in TYPED_KEYS {
        match kind {
            Kind::Int => config.get_int_checked(section, key).map(drop)?,
            Kind::Number => config.get_double_checked(section, key).map(drop)?,
            Kind::Bool => config.get_bool_checked(section, key).map(drop)?,
        }
    }
    Ok(())
}

fn validate_poll_interval(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    let value = config.get_int("trading", "poll_interval", 60);
    if value < 1 {
        return Err(TradegateError::invalid_config(
            "trading",
            "poll_interval",
            "poll_interval must be at least 1 second",
        ));
    }
    Ok(())
}

fn validate_order_quantity(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    let value = config.get_int("trading", "order_quantity", 1);
    if value < 1 {
        return Err(TradegateError::invalid_config(
            "trading",
            "order_quantity",
            "order_quantity must be positive",
        ));
    }
    Ok(())
}

fn validate_risk_limits(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    if !config.has_key("risk", "max_position_size") {
        return Err(TradegateError::missing_config("risk", "max_position_size"));
    }
    if config.get_int("risk", "max_position_size", 0) < 1 {
        return Err(TradegateError::invalid_config(
            "risk",
            "max_position_size",
            "max_position_size must be positive",
        ));
    }

    if !config.has_key("risk", "max_daily_loss") {
        return Err(TradegateError::missing_config("risk", "max_daily_loss"));
    }
    if config.get_double("risk", "max_daily_loss", 0.0) <= 0.0 {
        return Err(TradegateError::invalid_config(
            "risk",
            "max_daily_loss",
            "max_daily_loss must be positive",
        ));
    }
    Ok(())
}

fn validate_margin_rate(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    let value = config.get_double("risk", "margin_rate", 0.1);
    if value <= 0.0 || value > 1.0 {
        return Err(TradegateError::invalid_config(
            "risk",
            "margin_rate",
            "margin_rate must be in (0, 1]",
        ));
    }
    Ok(())
}

fn non_negative(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<(), TradegateError> {
    if config.get_double(section, key, default) < 0.0 {
        return Err(TradegateError::invalid_config(
            section,
            key,
            format!("{key} must be non-negative"),
        ));
    }
    Ok(())
}

fn validate_percentages(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    non_negative(config, "risk", "stop_loss_percent", 2.0)?;
    non_negative(config, "risk", "take_profit_percent", 4.0)?;
    Ok(())
}

fn validate_periods(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    for key in [
        "short_ma_period",
        "long_ma_period",
        "rsi_period",
        "volume_ma_period",
    ] {
        if config.get_int("strategy", key, 1) < 1 {
            return Err(TradegateError::invalid_config(
                "strategy",
                key,
                format!("{key} must be at least 1"),
            ));
        }
    }

    let short = config.get_int("strategy", "short_ma_period", 5);
    let long = config.get_int("strategy", "long_ma_period", 20);
    if short >= long {
        return Err(TradegateError::invalid_config(
            "strategy",
            "short_ma_period",
            "short_ma_period must be less than long_ma_period",
        ));
    }

    if config.get_double("strategy", "volume_multiplier", 1.5) <= 0.0 {
        return Err(TradegateError::invalid_config(
            "strategy",
            "volume_multiplier",
            "volume_multiplier must be positive",
        ));
    }
    Ok(())
}

fn validate_rsi_thresholds(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    let overbought = config.get_double("strategy", "rsi_overbought", 70.0);
    let oversold = config.get_double("strategy", "rsi_oversold", 30.0);
    if !(0.0..=100.0).contains(&overbought) {
        return Err(TradegateError::invalid_config(
            "strategy",
            "rsi_overbought",
            "rsi_overbought must be between 0 and 100",
        ));
    }
    if !(0.0..=100.0).contains(&oversold) || oversold >= overbought {
        return Err(TradegateError::invalid_config(
            "strategy",
            "rsi_oversold",
            "rsi_oversold must be between 0 and rsi_overbought",
        ));
    }
    Ok(())
}

fn validate_paper(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    if config.get_double("paper", "initial_balance", 100_000.0) <= 0.0 {
        return Err(TradegateError::invalid_config(
            "paper",
            "initial_balance",
            "initial_balance must be positive",
        ));
    }
    non_negative(config, "paper", "slippage_pct", 0.05)?;
    non_negative(config, "paper", "commission_per_trade", 0.0)?;
    non_negative(config, "paper", "commission_pct", 0.0)?;
    if config.get_int("paper", "fill_delay_ms", 0) < 0 {
        return Err(TradegateError::invalid_config(
            "paper",
            "fill_delay_ms",
            "fill_delay_ms must be non-negative",
        ));
    }
    Ok(())
}

fn validate_execution(config: &dyn ConfigPort) -> Result<(), TradegateError> {
    if config.get_int("execution", "submit_timeout_secs", 10) < 1 {
        return Err(TradegateError::invalid_config(
            "execution",
            "submit_timeout_secs",
            "submit_timeout_secs must be at least 1",
        ));
    }
    if config.get_int("execution", "max_retries", 3) < 0 {
        return Err(TradegateError::invalid_config(
            "execution",
            "max_retries",
            "max_retries must be non-negative",
        ));
    }
    if config.get_int("execution", "retry_backoff_ms", 500) < 0 {
        return Err(TradegateError::invalid_config(
            "execution",
            "retry_backoff_ms",
            "retry_backoff_ms must be non-negative",
        ));
    }
    if config.get_int("market_data", "fetch_timeout_secs", 10) < 1 {
        return Err(TradegateError::invalid_config(
            "market_data",
            "fetch_timeout_secs",
            "fetch_timeout_secs must be at least 1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    const BASE: &str = "[trading]\nsymbols = SPY\n[risk]\nmax_position_size = 10\nmax_daily_loss = 500\n";

    fn with(extra: &str) -> FileConfigAdapter {
        make_config(&format!("{BASE}{extra}"))
    }

    #[test]
    fn minimal_config_passes() {
        assert!(validate_trading_config(&make_config(BASE)).is_ok());
    }

    #[test]
    fn full_config_passes() {
        let config = make_config(
            r#"
[trading]
symbols = SPY, QQQ
paper_trading = true
poll_interval = 300
order_quantity = 5

[risk]
max_position_size = 20
max_daily_loss = 1000
stop_loss_percent = 2.0
take_profit_percent = 4.0
margin_rate = 0.25
sizing_policy = resize

[strategy]
short_ma_period = 10
long_ma_period = 30
rsi_period = 14
rsi_overbought = 75
rsi_oversold = 25

[paper]
initial_balance = 50000
slippage_pct = 0.1
"#,
        );
        assert!(validate_trading_config(&config).is_ok());
    }

    #[test]
    fn missing_symbols_fails() {
        let config = make_config("[risk]\nmax_position_size = 10\nmax_daily_loss = 500\n");
        let err = validate_trading_config(&config).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigMissing { key, .. } if key == "symbols"));
    }

    #[test]
    fn missing_max_daily_loss_fails() {
        let config = make_config("[trading]\nsymbols = SPY\n[risk]\nmax_position_size = 10\n");
        let err = validate_trading_config(&config).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigMissing { key, .. } if key == "max_daily_loss"));
    }

    #[test]
    fn zero_position_size_fails() {
        let config = make_config("[trading]\nsymbols = SPY\n[risk]\nmax_position_size = 0\nmax_daily_loss = 500\n");
        let err = validate_trading_config(&config).unwrap_err();
        assert!(
            matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "max_position_size")
        );
    }

    #[test]
    fn short_must_be_below_long() {
        let err =
            validate_trading_config(&with("[strategy]\nshort_ma_period = 20\nlong_ma_period = 20\n"))
                .unwrap_err();
        assert!(
            matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "short_ma_period")
        );
    }

    #[test]
    fn zero_rsi_period_fails() {
        let err = validate_trading_config(&with("[strategy]\nrsi_period = 0\n")).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "rsi_period"));
    }

    #[test]
    fn margin_rate_range() {
        let err = validate_trading_config(&with("margin_rate = 1.5\n")).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "margin_rate"));
        let err = validate_trading_config(&with("margin_rate = 0\n")).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "margin_rate"));
        assert!(validate_trading_config(&with("margin_rate = 1.0\n")).is_ok());
    }

    #[test]
    fn negative_stop_loss_fails() {
        let err = validate_trading_config(&with("stop_loss_percent = -1\n")).unwrap_err();
        assert!(
            matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "stop_loss_percent")
        );
    }

    #[test]
    fn rsi_thresholds_must_be_ordered() {
        let err = validate_trading_config(&with("[strategy]\nrsi_overbought = 40\nrsi_oversold = 60\n"))
            .unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "rsi_oversold"));
    }

    #[test]
    fn negative_slippage_fails() {
        let err = validate_trading_config(&with("[paper]\nslippage_pct = -0.5\n")).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "slippage_pct"));
    }

    #[test]
    fn zero_poll_interval_fails() {
        let config = make_config(
            "[trading]\nsymbols = SPY\npoll_interval = 0\n[risk]\nmax_position_size = 10\nmax_daily_loss = 500\n",
        );
        let err = validate_trading_config(&config).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "poll_interval"));
    }

    #[test]
    fn malformed_values_are_rejected_not_defaulted() {
        for (line, bad_key) in [
            ("order_quantity = ten\n", "order_quantity"),
            ("poll_interval = 5m\n", "poll_interval"),
        ] {
            let config = make_config(&BASE.replace("symbols = SPY\n", &format!("symbols = SPY\n{line}")));
            let err = validate_trading_config(&config).unwrap_err();
            assert!(
                matches!(err, TradegateError::ConfigInvalid { ref key, .. } if key == bad_key),
                "{line:?} gave {err}"
            );
        }

        for (extra, bad_key) in [
            ("stop_loss_percent = 2%\n", "stop_loss_percent"),
            ("allow_shorting = yess\n", "allow_shorting"),
            ("[paper]\ninitial_balance = lots\n", "initial_balance"),
            ("[sqlite]\npool_size = 2.5\n", "pool_size"),
        ] {
            let err = validate_trading_config(&with(extra)).unwrap_err();
            assert!(
                matches!(err, TradegateError::ConfigInvalid { ref key, .. } if key == bad_key),
                "{extra:?} gave {err}"
            );
        }
    }

    #[test]
    fn malformed_required_value_is_invalid() {
        let config = make_config("[trading]\nsymbols = SPY\n[risk]\nmax_position_size = many\nmax_daily_loss = 500\n");
        let err = validate_trading_config(&config).unwrap_err();
        assert!(
            matches!(err, TradegateError::ConfigInvalid { key, .. } if key == "max_position_size")
        );
    }

    #[test]
    fn errors_are_fatal() {
        let err = validate_trading_config(&make_config("")).unwrap_err();
        assert!(err.is_fatal());
    }
}
