//! CLI integration tests.
//!
//! Tests cover:
//! - Config loading and validation with real INI files on disk
//! - Argument parsing and exit codes
//! - Start-up reconciliation against mock ports
//! - A CSV replay run persisted to SQLite, read back by `status`

mod common;

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use common::*;
use tradegate::cli::{self, Cli, Command};
use tradegate::domain::error::TradegateError;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const VALID_INI: &str = r#"
[trading]
symbols = SPY, QQQ
paper_trading = true
poll_interval = 60
timeframe = 1Day
order_quantity = 5

[risk]
max_position_size = 20
max_daily_loss = 1000
stop_loss_percent = 2.0
take_profit_percent = 4.0

[strategy]
short_ma_period = 5
long_ma_period = 20
rsi_period = 14

[paper]
initial_balance = 50000
"#;

mod config_loading {
    use super::*;

    #[test]
    fn load_valid_config() {
        let file = write_temp_ini(VALID_INI);
        let config = cli::load_config(file.path()).unwrap();
        assert_eq!(config.symbols, vec!["SPY", "QQQ"]);
        assert!(config.paper_trading);
        assert_eq!(config.risk.order_quantity, 5);
        assert_eq!(config.initial_balance, 50000.0);
        assert!(config.sqlite_path.is_none());
    }

    #[test]
    fn missing_file_is_config_parse_error() {
        let err = cli::load_config(std::path::Path::new("/nonexistent/tradegate.ini")).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigParse { .. }));
        assert_eq!(ExitCode::from(&err), ExitCode::from(2));
    }

    #[test]
    fn invalid_value_is_fatal() {
        let file = write_temp_ini(&VALID_INI.replace("max_daily_loss = 1000", "max_daily_loss = -5"));
        let err = cli::load_config(file.path()).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { ref key, .. } if key == "max_daily_loss"));
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_numbers_are_not_defaulted() {
        let file = write_temp_ini(&VALID_INI.replace("order_quantity = 5", "order_quantity = ten"));
        let err = cli::load_config(file.path()).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { ref key, .. } if key == "order_quantity"));
        assert_eq!(ExitCode::from(&err), ExitCode::from(2));

        let file = write_temp_ini(&VALID_INI.replace("[paper]", "allow_shorting = yess\n\n[paper]"));
        let err = cli::load_config(file.path()).unwrap_err();
        assert!(matches!(err, TradegateError::ConfigInvalid { ref key, .. } if key == "allow_shorting"));
    }

    #[test]
    fn close_on_shutdown_defaults_off() {
        let file = write_temp_ini(VALID_INI);
        assert!(!cli::load_config(file.path()).unwrap().close_on_shutdown);
        let file = write_temp_ini(&VALID_INI.replace("order_quantity = 5", "order_quantity = 5\nclose_on_shutdown = yes"));
        assert!(cli::load_config(file.path()).unwrap().close_on_shutdown);
    }

    #[test]
    fn duplicate_symbols_rejected() {
        let file = write_temp_ini(&VALID_INI.replace("symbols = SPY, QQQ", "symbols = SPY, spy"));
        let err = cli::load_config(file.path()).unwrap_err();
        assert!(err.is_fatal());
    }
}

mod commands {
    use super::*;

    #[test]
    fn parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "tradegate",
            "run",
            "--config",
            "bot.ini",
            "--symbols",
            "SPY",
            "--once",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                config,
                symbols,
                once,
            } => {
                assert_eq!(config.to_str(), Some("bot.ini"));
                assert_eq!(symbols.as_deref(), Some("SPY"));
                assert!(once);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn run_requires_config() {
        assert!(Cli::try_parse_from(["tradegate", "run"]).is_err());
    }

    #[test]
    fn validate_exit_codes() {
        let good = write_temp_ini(VALID_INI);
        let cli = Cli::try_parse_from(["tradegate", "validate", "-c", good.path().to_str().unwrap()])
            .unwrap();
        assert_eq!(cli::run(cli), ExitCode::SUCCESS);

        let bad = write_temp_ini("[trading]\nsymbols = SPY\n");
        let cli = Cli::try_parse_from(["tradegate", "validate", "-c", bad.path().to_str().unwrap()])
            .unwrap();
        assert_eq!(cli::run(cli), ExitCode::from(2));
    }

    #[test]
    fn status_without_database_is_config_error() {
        let file = write_temp_ini(VALID_INI);
        let cli = Cli::try_parse_from(["tradegate", "status", "-c", file.path().to_str().unwrap()])
            .unwrap();
        assert_eq!(cli::run(cli), ExitCode::from(2));
    }

    #[test]
    fn unknown_symbol_filter_is_rejected() {
        let file = write_temp_ini(VALID_INI);
        let cli = Cli::try_parse_from([
            "tradegate",
            "run",
            "-c",
            file.path().to_str().unwrap(),
            "--symbols",
            "TSLA",
            "--once",
        ])
        .unwrap();
        assert_eq!(cli::run(cli), ExitCode::from(2));
    }
}

mod startup {
    use super::*;
    use std::sync::Arc;
    use tradegate::domain::ledger::{TradeRecord, TradeStatus};
    use tradegate::domain::order::OrderSide;
    use tradegate::domain::position::Position;

    #[tokio::test]
    async fn live_start_seeds_ledger_from_broker_and_store() {
        let config = test_config("", "");
        let broker = Arc::new(MockBroker::new().with_account(50_000.0).with_position(Position {
            symbol: "SPY".into(),
            quantity: 5,
            average_entry_price: 100.0,
            stop_loss_price: None,
            take_profit_price: None,
            opened_at: at(9, 30),
        }));
        let store = Arc::new(MockPersistence::new().with_trades(vec![TradeRecord {
            symbol: "QQQ".into(),
            side: OrderSide::Sell,
            quantity: 10,
            price: 380.0,
            commission: 1.0,
            realized_pnl: -200.0,
            closed_quantity: 10,
            timestamp: at(10, 0),
            order_id: "earlier".into(),
            status: TradeStatus::Filled,
        }]));

        let trading_loop = cli::start(
            &config,
            Arc::new(MockMarketData::new()),
            Some(broker),
            Some(store),
            at(12, 0),
        )
        .await
        .unwrap();

        let core = trading_loop.core();
        assert!(core.is_live());
        let account = core.account_state().await;
        assert_eq!(account.balance, 50_000.0);
        assert_eq!(account.realized_daily_pnl, -201.0);

        let position = core.position("SPY").await.unwrap();
        assert_eq!(position.quantity, 5);
        assert_eq!(position.stop_loss_price, Some(98.0));
        assert_eq!(position.take_profit_price, Some(104.0));
    }

    #[tokio::test]
    async fn paper_start_uses_configured_balance() {
        let config = test_config("", "");
        let trading_loop = cli::start(&config, Arc::new(MockMarketData::new()), None, None, at(12, 0))
            .await
            .unwrap();
        assert!(!trading_loop.core().is_live());
        assert_eq!(trading_loop.core().account_state().await.balance, 100_000.0);
    }
}

#[cfg(feature = "sqlite")]
mod csv_pipeline {
    use super::*;
    use std::sync::Arc;
    use tradegate::adapters::csv_adapter::CsvReplayFeed;
    use tradegate::domain::signal::SignalKind;
    use tradegate::ports::persistence_port::PersistencePort;

    const CSV: &str = "timestamp,open,high,low,close,volume
2024-01-01,10,10.5,9.5,10,1000
2024-01-02,9,9.5,8.5,9,1000
2024-01-03,8,8.5,7.5,8,1000
2024-01-04,7,7.5,6.5,7,1000
2024-01-05,12,12.5,11.5,12,1000
";

    fn setup() -> (tempfile::TempDir, tempfile::NamedTempFile) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("SPY.csv"), CSV).unwrap();
        let ini = format!(
            "[trading]
symbols = SPY
order_quantity = 10
bar_count = 4

[risk]
max_position_size = 10
max_daily_loss = 500

[strategy]
short_ma_period = 2
long_ma_period = 3
rsi_period = 2
volume_ma_period = 2
rsi_filter = false

[paper]
slippage_pct = 0

[market_data]
source = csv
csv_dir = {}

[sqlite]
path = {}
pool_size = 2
",
            dir.path().display(),
            dir.path().join("tradegate.db").display()
        );
        let file = write_temp_ini(&ini);
        (dir, file)
    }

    #[tokio::test]
    async fn replay_trades_and_status_reads_them_back() {
        let (_dir, ini) = setup();
        let config = cli::load_config(ini.path()).unwrap();
        let store = cli::open_persistence(&config).unwrap().unwrap();
        let feed = Arc::new(CsvReplayFeed::new(
            config.market_data.csv_dir.clone(),
            config.market_data.exchange.clone(),
        ));

        let trading_loop = cli::start(&config, feed, None, Some(store.clone()), at(15, 0))
            .await
            .unwrap();
        trading_loop.run_once(at(15, 0)).await;
        let reports = trading_loop.run_once(at(15, 1)).await;
        assert_eq!(reports[0].signal_kind(), SignalKind::Buy);
        assert_eq!(reports[0].fills.len(), 1);
        assert_eq!(trading_loop.finish(at(15, 2)).await, 0);

        assert_eq!(store.query_latest_window("SPY", 10).unwrap().len(), 5);
        let report = cli::status_report(&config, store.as_ref(), at(16, 0)).unwrap();
        assert!(report.contains("Balance:"));
        assert!(report.contains("SPY BUY 10 @ 12.00"));
        assert!(report.contains("Realized P&L for 2024-01-02: 0.00"));
    }

    #[test]
    fn run_once_command_succeeds() {
        let (_dir, ini) = setup();
        let cli = Cli::try_parse_from([
            "tradegate",
            "run",
            "-c",
            ini.path().to_str().unwrap(),
            "--once",
        ])
        .unwrap();
        assert_eq!(cli::run(cli), ExitCode::SUCCESS);

        let cli = Cli::try_parse_from(["tradegate", "status", "-c", ini.path().to_str().unwrap()])
            .unwrap();
        assert_eq!(cli::run(cli), ExitCode::SUCCESS);
    }
}
