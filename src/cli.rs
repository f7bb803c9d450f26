//! CLI definition and dispatch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::adapters::csv_adapter::CsvReplayFeed;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::config::{DataSource, TradingConfig};
use crate::domain::error::TradegateError;
use crate::domain::execution::{ExecutionCore, Venue};
use crate::domain::ledger::{Ledger, trading_day_of, trading_day_start};
use crate::domain::trading_loop::TradingLoop;
use crate::logging;
use crate::ports::broker_port::BrokerPort;
use crate::ports::market_data_port::MarketDataPort;
use crate::ports::persistence_port::PersistencePort;

#[derive(Parser, Debug)]
#[command(name = "tradegate", about = "Automated equity trading bot")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the trading loop
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated subset of the configured symbols
        #[arg(long)]
        symbols: Option<String>,
        /// Run a single cycle per symbol and exit
        #[arg(long)]
        once: bool,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the latest account snapshot and today's trades
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run {
            config,
            symbols,
            once,
        } => run_trading(&config, symbols.as_deref(), once),
        Command::Validate { config } => run_validate(&config),
        Command::Status { config } => run_status(&config),
    }
}

fn fail(err: &TradegateError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

/// Load, validate and build the trading configuration.
pub fn load_config(path: &Path) -> Result<TradingConfig, TradegateError> {
    let adapter = FileConfigAdapter::from_file(path)?;
    TradingConfig::from_port(&adapter)
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    eprintln!("  Symbols:        {}", config.symbols.join(", "));
    eprintln!(
        "  Mode:           {}",
        if config.paper_trading { "paper" } else { "live" }
    );
    eprintln!(
        "  Poll interval:  {}s ({} x {} bars)",
        config.poll_interval.as_secs(),
        config.bar_count,
        config.timeframe
    );
    eprintln!(
        "  Moving averages: {}/{}  RSI: {}",
        config.indicators.short_ma_period,
        config.indicators.long_ma_period,
        config.indicators.rsi_period
    );
    eprintln!(
        "  Risk:           max size {}, max daily loss {:.2}, stop {}%, target {}%",
        config.risk.max_position_size,
        config.risk.max_daily_loss,
        config.risk.stop_loss_pct,
        config.risk.take_profit_pct
    );
    eprintln!("\nConfiguration is valid.");
    ExitCode::SUCCESS
}

#[cfg(feature = "sqlite")]
pub fn open_persistence(
    config: &TradingConfig,
) -> Result<Option<Arc<dyn PersistencePort>>, TradegateError> {
    use crate::adapters::sqlite_adapter::SqliteAdapter;

    let Some(path) = &config.sqlite_path else {
        return Ok(None);
    };
    let adapter = SqliteAdapter::from_path(&path.display().to_string(), config.sqlite_pool_size)?;
    adapter.initialize_schema()?;
    Ok(Some(Arc::new(adapter)))
}

#[cfg(not(feature = "sqlite"))]
pub fn open_persistence(
    config: &TradingConfig,
) -> Result<Option<Arc<dyn PersistencePort>>, TradegateError> {
    if config.sqlite_path.is_some() {
        warn!("sqlite.path is set but tradegate was built without the sqlite feature");
    }
    Ok(None)
}

struct Connections {
    market_data: Arc<dyn MarketDataPort>,
    broker: Option<Arc<dyn BrokerPort>>,
}

#[cfg(feature = "alpaca")]
fn connect(config: &TradingConfig) -> Result<Connections, TradegateError> {
    use crate::adapters::alpaca_adapter::AlpacaAdapter;

    let needs_alpaca = config.market_data.source == DataSource::Alpaca || !config.paper_trading;
    let alpaca = if needs_alpaca {
        Some(Arc::new(AlpacaAdapter::from_env(
            &config.alpaca,
            &config.timeframe,
            config.execution.submit_timeout,
        )?))
    } else {
        None
    };

    let market_data: Arc<dyn MarketDataPort> = match (&config.market_data.source, &alpaca) {
        (DataSource::Alpaca, Some(adapter)) => Arc::clone(adapter) as Arc<dyn MarketDataPort>,
        _ => Arc::new(CsvReplayFeed::new(
            config.market_data.csv_dir.clone(),
            config.market_data.exchange.clone(),
        )),
    };
    let broker = if config.paper_trading {
        None
    } else {
        alpaca.map(|a| a as Arc<dyn BrokerPort>)
    };

    Ok(Connections {
        market_data,
        broker,
    })
}

#[cfg(not(feature = "alpaca"))]
fn connect(config: &TradingConfig) -> Result<Connections, TradegateError> {
    if config.market_data.source == DataSource::Alpaca {
        return Err(TradegateError::invalid_config(
            "market_data",
            "source",
            "tradegate was built without the alpaca feature",
        ));
    }
    if !config.paper_trading {
        return Err(TradegateError::invalid_config(
            "trading",
            "paper_trading",
            "live trading requires the alpaca feature",
        ));
    }
    Ok(Connections {
        market_data: Arc::new(CsvReplayFeed::new(
            config.market_data.csv_dir.clone(),
            config.market_data.exchange.clone(),
        )),
        broker: None,
    })
}

/// Build every component from `config` and run the start-up
/// reconciliation: broker seed (live only), realized P&L restore and
/// price history warm-up.
pub async fn start(
    config: &TradingConfig,
    market_data: Arc<dyn MarketDataPort>,
    broker: Option<Arc<dyn BrokerPort>>,
    persistence: Option<Arc<dyn PersistencePort>>,
    now: DateTime<Utc>,
) -> Result<Arc<TradingLoop>, TradegateError> {
    let venue = match broker {
        Some(broker) => Venue::Live(broker),
        None => Venue::Paper(config.paper.clone()),
    };
    let ledger = Ledger::new(
        config.initial_balance,
        config.risk.margin_rate,
        config.trading_day_start,
    );
    let core = Arc::new(ExecutionCore::new(
        venue,
        config.execution.clone(),
        config.risk.protective_levels(),
        ledger,
        persistence.clone(),
    ));

    core.seed_from_broker().await?;
    core.roll_day(now).await;
    core.restore_daily_pnl(now).await?;

    let trading_loop = TradingLoop::new(config, market_data, persistence, core);
    if let Err(e) = trading_loop.warm_up() {
        warn!(error = %e, "price history warm-up failed");
    }
    Ok(Arc::new(trading_loop))
}

async fn trade(config: TradingConfig, once: bool) -> Result<(), TradegateError> {
    let persistence = open_persistence(&config)?;
    let connections = connect(&config)?;
    info!(
        symbols = ?config.symbols,
        mode = if config.paper_trading { "paper" } else { "live" },
        persistence = persistence.is_some(),
        "starting tradegate"
    );

    let trading_loop = start(
        &config,
        connections.market_data,
        connections.broker,
        persistence,
        Utc::now(),
    )
    .await?;

    if once {
        for report in trading_loop.run_once(Utc::now()).await {
            println!("{report}");
            for err in &report.errors {
                eprintln!("  {err}");
            }
        }
        trading_loop.finish(Utc::now()).await;
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = tx.send(true);
    });

    trading_loop.run(rx).await;
    Ok(())
}

fn run_trading(config_path: &Path, symbols: Option<&str>, once: bool) -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    let mut config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    if let Some(symbols) = symbols {
        if let Err(e) = config.restrict_symbols(symbols) {
            return fail(&e);
        }
    }

    let _guard = match logging::init_tracing(config.log_directory.as_deref()) {
        Ok(guard) => guard,
        Err(e) => return fail(&TradegateError::Io(e)),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return fail(&TradegateError::Io(e)),
    };

    match runtime.block_on(trade(config, once)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tradegate stopped");
            fail(&e)
        }
    }
}

/// Human-readable account status from persisted state.
pub fn status_report(
    config: &TradingConfig,
    store: &dyn PersistencePort,
    now: DateTime<Utc>,
) -> Result<String, TradegateError> {
    let mut out = String::new();
    match store.latest_account_snapshot()? {
        Some(s) => {
            out.push_str(&format!("Account at {}\n", s.timestamp.to_rfc3339()));
            out.push_str(&format!("  Balance:            {:.2}\n", s.balance));
            out.push_str(&format!("  Equity:             {:.2}\n", s.equity));
            out.push_str(&format!("  Margin used:        {:.2}\n", s.margin_used));
            out.push_str(&format!("  Free margin:        {:.2}\n", s.free_margin));
            out.push_str(&format!("  Realized daily P&L: {:.2}\n", s.realized_daily_pnl));
        }
        None => out.push_str("No account snapshots recorded.\n"),
    }

    let day = trading_day_of(now, config.trading_day_start);
    match store.query_daily_pnl(day)? {
        Some(pnl) => out.push_str(&format!("Realized P&L for {day}: {pnl:.2}\n")),
        None => out.push_str(&format!("No realized P&L recorded for {day}.\n")),
    }

    let since = trading_day_start(now, config.trading_day_start);
    let trades = store.query_today_trades(None, since)?;
    out.push_str(&format!("\nTrades since {} ({}):\n", since.to_rfc3339(), trades.len()));
    for t in &trades {
        out.push_str(&format!(
            "  {} {} {} {} @ {:.2}  commission {:.2}  pnl {:.2}  [{}]\n",
            t.timestamp.format("%H:%M:%S"),
            t.symbol,
            t.side,
            t.quantity,
            t.price,
            t.commission,
            t.realized_pnl,
            t.status
        ));
    }
    Ok(out)
}

fn run_status(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let store = match open_persistence(&config) {
        Ok(Some(store)) => store,
        Ok(None) => return fail(&TradegateError::missing_config("sqlite", "path")),
        Err(e) => return fail(&e),
    };

    match status_report(&config, store.as_ref(), Utc::now()) {
        Ok(report) => {
            print!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}
