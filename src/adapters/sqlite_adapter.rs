//! SQLite persistence adapter.
//!
//! Stores price history, trades, account snapshots and the realized P&L of
//! each trading day. Timestamps are RFC 3339 strings in UTC so that text
//! ordering matches time ordering.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use rusqlite::types::Type;

use crate::domain::error::TradegateError;
use crate::domain::ledger::{AccountSnapshot, TradeRecord, TradeStatus};
use crate::domain::ohlcv::Bar;
use crate::domain::order::OrderSide;
use crate::ports::config_port::ConfigPort;
use crate::ports::persistence_port::PersistencePort;

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(idx: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(TradegateError::DatabaseQuery { reason }),
    )
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp {value:?}: {e}")))
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, TradegateError> {
        let db_path = config
            .get_string("sqlite", "path")
            .ok_or_else(|| TradegateError::missing_config("sqlite", "path"))?;
        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        Self::from_path(&db_path, pool_size)
    }

    pub fn from_path(db_path: &str, pool_size: u32) -> Result<Self, TradegateError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e: r2d2::Error| TradegateError::Database {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, TradegateError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| TradegateError::Database {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, TradegateError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| TradegateError::Database {
                reason: e.to_string(),
            })
    }

    pub fn initialize_schema(&self) -> Result<(), TradegateError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS price_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                UNIQUE (symbol, timestamp)
            );
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                commission REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                closed_quantity INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                order_id TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
            CREATE TABLE IF NOT EXISTS account_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                balance REAL NOT NULL,
                equity REAL NOT NULL,
                margin_used REAL NOT NULL,
                free_margin REAL NOT NULL,
                realized_daily_pnl REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS daily_pnl (
                day TEXT PRIMARY KEY,
                realized_pnl REAL NOT NULL
            );",
        )
        .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

impl PersistencePort for SqliteAdapter {
    fn insert_bars(&self, bars: &[Bar]) -> Result<usize, TradegateError> {
        let mut conn = self.conn()?;

        let tx = conn
            .transaction()
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let mut inserted = 0;
        for bar in bars {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO price_history
                        (symbol, timestamp, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        bar.symbol,
                        format_ts(bar.timestamp),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume
                    ],
                )
                .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                    reason: e.to_string(),
                })?;
        }

        tx.commit()
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        Ok(inserted)
    }

    fn insert_trade(&self, trade: &TradeRecord) -> Result<(), TradegateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades
                (symbol, side, quantity, price, commission, realized_pnl, closed_quantity,
                 timestamp, order_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.symbol,
                trade.side.as_str(),
                trade.quantity,
                trade.price,
                trade.commission,
                trade.realized_pnl,
                trade.closed_quantity,
                format_ts(trade.timestamp),
                trade.order_id,
                trade.status.as_str()
            ],
        )
        .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn insert_account_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), TradegateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO account_snapshots
                (timestamp, balance, equity, margin_used, free_margin, realized_daily_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format_ts(snapshot.timestamp),
                snapshot.balance,
                snapshot.equity,
                snapshot.margin_used,
                snapshot.free_margin,
                snapshot.realized_daily_pnl
            ],
        )
        .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn query_latest_window(&self, symbol: &str, n: usize) -> Result<Vec<Bar>, TradegateError> {
        let conn = self.conn()?;

        let query = "SELECT symbol, timestamp, open, high, low, close, volume
                     FROM price_history
                     WHERE symbol = ?1
                     ORDER BY timestamp DESC
                     LIMIT ?2";

        let mut stmt = conn
            .prepare(query)
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let rows = stmt
            .query_map(params![symbol, n as i64], |row| {
                let ts: String = row.get(1)?;
                Ok(Bar {
                    symbol: row.get(0)?,
                    timestamp: parse_ts(1, &ts)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(
                row.map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                    reason: e.to_string(),
                })?,
            );
        }

        bars.reverse();
        Ok(bars)
    }

    fn query_today_trades(
        &self,
        symbol: Option<&str>,
        day_start: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, TradegateError> {
        let conn = self.conn()?;

        let query = "SELECT symbol, side, quantity, price, commission, realized_pnl,
                            closed_quantity, timestamp, order_id, status
                     FROM trades
                     WHERE timestamp >= ?1 AND (?2 IS NULL OR symbol = ?2)
                     ORDER BY timestamp ASC, id ASC";

        let mut stmt = conn
            .prepare(query)
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let rows = stmt
            .query_map(params![format_ts(day_start), symbol], |row| {
                let side: String = row.get(1)?;
                let ts: String = row.get(7)?;
                let status: String = row.get(9)?;
                Ok(TradeRecord {
                    symbol: row.get(0)?,
                    side: OrderSide::parse(&side)
                        .ok_or_else(|| conversion_error(1, format!("invalid side {side:?}")))?,
                    quantity: row.get(2)?,
                    price: row.get(3)?,
                    commission: row.get(4)?,
                    realized_pnl: row.get(5)?,
                    closed_quantity: row.get(6)?,
                    timestamp: parse_ts(7, &ts)?,
                    order_id: row.get(8)?,
                    status: TradeStatus::parse(&status)
                        .ok_or_else(|| conversion_error(9, format!("invalid status {status:?}")))?,
                })
            })
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(
                row.map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                    reason: e.to_string(),
                })?,
            );
        }

        Ok(trades)
    }

    fn latest_account_snapshot(&self) -> Result<Option<AccountSnapshot>, TradegateError> {
        let conn = self.conn()?;

        let query = "SELECT timestamp, balance, equity, margin_used, free_margin, realized_daily_pnl
                     FROM account_snapshots
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1";

        let mut stmt = conn
            .prepare(query)
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        let mut rows = stmt
            .query_map([], |row| {
                let ts: String = row.get(0)?;
                Ok(AccountSnapshot {
                    timestamp: parse_ts(0, &ts)?,
                    balance: row.get(1)?,
                    equity: row.get(2)?,
                    margin_used: row.get(3)?,
                    free_margin: row.get(4)?,
                    realized_daily_pnl: row.get(5)?,
                })
            })
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e: rusqlite::Error| {
                TradegateError::DatabaseQuery {
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }

    fn upsert_daily_pnl(&self, day: NaiveDate, realized_pnl: f64) -> Result<(), TradegateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO daily_pnl (day, realized_pnl) VALUES (?1, ?2)
             ON CONFLICT(day) DO UPDATE SET realized_pnl = excluded.realized_pnl",
            params![day.format("%Y-%m-%d").to_string(), realized_pnl],
        )
        .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn query_daily_pnl(&self, day: NaiveDate) -> Result<Option<f64>, TradegateError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT realized_pnl FROM daily_pnl WHERE day = ?1")
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;
        let mut rows = stmt
            .query_map(params![day.format("%Y-%m-%d").to_string()], |row| {
                row.get::<_, f64>(0)
            })
            .map_err(|e: rusqlite::Error| TradegateError::DatabaseQuery {
                reason: e.to_string(),
            })?;

        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e: rusqlite::Error| {
                TradegateError::DatabaseQuery {
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }
}
