//! SQLite persistence for the trade book.
//!
//! Persists state to survive restarts:
//! - Balance and daily risk counters
//! - Open positions with their stop levels
//! - Closed trade history

use crate::risk::{ExitReason, Position};
use crate::trading::TradeRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Persisted bot state.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    /// Day the daily counters belong to
    pub daily_date: NaiveDate,
    pub daily_pnl: Decimal,
    pub daily_trades: u32,
    /// Highest equity seen, for drawdown after a restart
    pub peak_equity: Decimal,
    pub max_drawdown: Decimal,
    pub positions: Vec<Position>,
    pub last_saved: DateTime<Utc>,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {parent:?}"))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path:?}"))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!(path = ?path, "Persistence manager initialized");
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Bot state (singleton row)
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                initial_balance TEXT NOT NULL,
                balance TEXT NOT NULL,
                daily_date TEXT NOT NULL,
                daily_pnl TEXT NOT NULL,
                daily_trades INTEGER NOT NULL,
                last_saved TEXT NOT NULL,
                peak_equity TEXT,
                max_drawdown TEXT
            );

            CREATE TABLE IF NOT EXISTS positions (
                pair TEXT PRIMARY KEY,
                entry_price TEXT NOT NULL,
                usdt_size TEXT NOT NULL,
                fee_rate TEXT NOT NULL,
                entry_fee TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_cost TEXT NOT NULL,
                atr TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                current_stop TEXT,
                trailing_activation TEXT,
                opened_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                usdt_size TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades(closed_at);
            CREATE INDEX IF NOT EXISTS idx_trades_pair ON trades(pair);
            "#,
        )?;

        // Databases created before drawdown was persisted
        let columns: Vec<String> = self
            .conn
            .prepare("SELECT name FROM pragma_table_info('bot_state')")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for column in ["peak_equity", "max_drawdown"] {
            if !columns.iter().any(|c| c == column) {
                self.conn
                    .execute(&format!("ALTER TABLE bot_state ADD COLUMN {column} TEXT"), [])?;
                info!(column, "Added missing bot_state column");
            }
        }

        debug!("Database schema initialized");
        Ok(())
    }

    /// Replace the stored state and open positions.
    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO bot_state (id, initial_balance, balance, daily_date, daily_pnl,
                                   daily_trades, last_saved, peak_equity, max_drawdown)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                initial_balance = ?1,
                balance = ?2,
                daily_date = ?3,
                daily_pnl = ?4,
                daily_trades = ?5,
                last_saved = ?6,
                peak_equity = ?7,
                max_drawdown = ?8
            "#,
            params![
                state.initial_balance.to_string(),
                state.balance.to_string(),
                state.daily_date.to_string(),
                state.daily_pnl.to_string(),
                state.daily_trades,
                state.last_saved.to_rfc3339(),
                state.peak_equity.to_string(),
                state.max_drawdown.to_string(),
            ],
        )?;

        tx.execute("DELETE FROM positions", [])?;

        for pos in &state.positions {
            tx.execute(
                r#"
                INSERT INTO positions (pair, entry_price, usdt_size, fee_rate, entry_fee, quantity,
                                       entry_cost, atr, stop_loss, take_profit, current_stop,
                                       trailing_activation, opened_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    pos.pair,
                    pos.entry_price.to_string(),
                    pos.usdt_size.to_string(),
                    pos.fee_rate.to_string(),
                    pos.entry_fee.to_string(),
                    pos.quantity.to_string(),
                    pos.entry_cost.to_string(),
                    pos.atr.to_string(),
                    pos.stop_loss.map(|v| v.to_string()),
                    pos.take_profit.map(|v| v.to_string()),
                    pos.current_stop.map(|v| v.to_string()),
                    pos.trailing_activation.map(|v| v.to_string()),
                    pos.opened_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            balance = %state.balance,
            positions = state.positions.len(),
            "State saved to database"
        );
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<PersistedState>> {
        let state = self
            .conn
            .query_row(
                r#"
                SELECT initial_balance, balance, daily_date, daily_pnl, daily_trades, last_saved,
                       peak_equity, max_drawdown
                FROM bot_state WHERE id = 1
                "#,
                [],
                |row| {
                    let daily_date: String = row.get(2)?;
                    let initial_balance = decimal_at(row, 0)?;
                    Ok(PersistedState {
                        initial_balance,
                        balance: decimal_at(row, 1)?,
                        daily_date: NaiveDate::from_str(&daily_date)
                            .map_err(|e| conversion_error(2, e))?,
                        daily_pnl: decimal_at(row, 3)?,
                        daily_trades: row.get(4)?,
                        peak_equity: optional_decimal_at(row, 6)?.unwrap_or(initial_balance),
                        max_drawdown: optional_decimal_at(row, 7)?.unwrap_or_default(),
                        positions: Vec::new(),
                        last_saved: time_at(row, 5)?,
                    })
                },
            )
            .optional()
            .context("Failed to read bot state")?;

        let Some(mut state) = state else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT pair, entry_price, usdt_size, fee_rate, entry_fee, quantity, entry_cost, atr,
                   stop_loss, take_profit, current_stop, trailing_activation, opened_at
            FROM positions
            ORDER BY pair
            "#,
        )?;

        state.positions = stmt
            .query_map([], |row| {
                Ok(Position {
                    pair: row.get(0)?,
                    entry_price: decimal_at(row, 1)?,
                    usdt_size: decimal_at(row, 2)?,
                    fee_rate: decimal_at(row, 3)?,
                    entry_fee: decimal_at(row, 4)?,
                    quantity: decimal_at(row, 5)?,
                    entry_cost: decimal_at(row, 6)?,
                    atr: decimal_at(row, 7)?,
                    stop_loss: optional_decimal_at(row, 8)?,
                    take_profit: optional_decimal_at(row, 9)?,
                    current_stop: optional_decimal_at(row, 10)?,
                    trailing_activation: optional_decimal_at(row, 11)?,
                    opened_at: time_at(row, 12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read positions")?;

        info!(
            balance = %state.balance,
            positions = state.positions.len(),
            last_saved = %state.last_saved,
            "Loaded state from database"
        );

        Ok(Some(state))
    }

    /// Append a closed trade.
    pub fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO trades (pair, entry_price, exit_price, usdt_size, quantity, pnl, fees,
                                exit_reason, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                trade.pair,
                trade.entry_price.to_string(),
                trade.exit_price.to_string(),
                trade.usdt_size.to_string(),
                trade.quantity.to_string(),
                trade.pnl.to_string(),
                trade.fees.to_string(),
                trade.exit_reason.as_str(),
                trade.opened_at.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.query_trades("ORDER BY id DESC LIMIT ?1", limit as i64)
    }

    /// Every stored trade, oldest first.
    pub fn all_trades(&self) -> Result<Vec<TradeRecord>> {
        self.query_trades("ORDER BY id ASC LIMIT ?1", -1)
    }

    fn query_trades(&self, tail: &str, limit: i64) -> Result<Vec<TradeRecord>> {
        let sql = format!(
            "SELECT pair, entry_price, exit_price, usdt_size, quantity, pnl, fees, exit_reason, \
             opened_at, closed_at FROM trades {tail}"
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let trades = stmt
            .query_map([limit], |row| {
                let reason: String = row.get(7)?;
                let exit_reason = ExitReason::parse(&reason).ok_or_else(|| {
                    conversion_error(7, format!("unknown exit reason {reason:?}"))
                })?;
                Ok(TradeRecord {
                    pair: row.get(0)?,
                    entry_price: decimal_at(row, 1)?,
                    exit_price: decimal_at(row, 2)?,
                    usdt_size: decimal_at(row, 3)?,
                    quantity: decimal_at(row, 4)?,
                    pnl: decimal_at(row, 5)?,
                    fees: decimal_at(row, 6)?,
                    exit_reason,
                    opened_at: time_at(row, 8)?,
                    closed_at: time_at(row, 9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read trades")?;

        Ok(trades)
    }

    pub fn has_state(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bot_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Clear all data.
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.conn.execute_batch(
            r#"
            DELETE FROM bot_state;
            DELETE FROM positions;
            DELETE FROM trades;
            "#,
        )?;
        Ok(())
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn optional_decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
    }

    fn trade(pair: &str, pnl: Decimal, reason: ExitReason) -> TradeRecord {
        TradeRecord {
            pair: pair.to_string(),
            entry_price: dec!(100),
            exit_price: dec!(105),
            usdt_size: dec!(50),
            quantity: dec!(0.4995),
            pnl,
            fees: dec!(0.102),
            exit_reason: reason,
            opened_at: at(),
            closed_at: at(),
        }
    }

    #[test]
    fn test_save_and_load_state() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        assert!(manager.load_state().unwrap().is_none());

        let mut position = Position::open("SOL/USDT", dec!(100), dec!(50), dec!(0.001), at()).unwrap();
        position.stop_loss = Some(dec!(97));
        position.current_stop = Some(dec!(98.5));

        let state = PersistedState {
            initial_balance: dec!(100),
            balance: dec!(50),
            daily_date: at().date_naive(),
            daily_pnl: dec!(-0.5),
            daily_trades: 3,
            peak_equity: dec!(120),
            max_drawdown: dec!(0.0833),
            positions: vec![position.clone()],
            last_saved: at(),
        };
        manager.save_state(&state).unwrap();
        assert!(manager.has_state().unwrap());

        let loaded = manager.load_state().unwrap().unwrap();
        assert_eq!(loaded.balance, dec!(50));
        assert_eq!(loaded.daily_trades, 3);
        assert_eq!(loaded.daily_date, at().date_naive());
        assert_eq!(loaded.initial_balance, dec!(100));
        assert_eq!(loaded.peak_equity, dec!(120));
        assert_eq!(loaded.max_drawdown, dec!(0.0833));
        assert_eq!(loaded.positions, vec![position]);
        assert_eq!(loaded.positions[0].take_profit, None);

        // Saving again replaces positions
        manager
            .save_state(&PersistedState {
                positions: Vec::new(),
                ..state
            })
            .unwrap();
        assert!(manager.load_state().unwrap().unwrap().positions.is_empty());
    }

    #[test]
    fn test_old_state_table_gains_drawdown_columns() {
        let path = std::env::temp_dir().join(format!("altseason-legacy-{}.db", std::process::id()));
        std::fs::remove_file(&path).ok();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE bot_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    initial_balance TEXT NOT NULL,
                    balance TEXT NOT NULL,
                    daily_date TEXT NOT NULL,
                    daily_pnl TEXT NOT NULL,
                    daily_trades INTEGER NOT NULL,
                    last_saved TEXT NOT NULL
                );
                INSERT INTO bot_state VALUES (1, '100', '90', '2024-06-01', '0', 0, '2024-06-01T08:30:00+00:00');",
            )
            .unwrap();
        }

        let manager = PersistenceManager::new(&path).unwrap();
        let loaded = manager.load_state().unwrap().unwrap();
        assert_eq!(loaded.peak_equity, dec!(100));
        assert_eq!(loaded.max_drawdown, Decimal::ZERO);

        drop(manager);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_trade_history() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.record_trade(&trade("SOL/USDT", dec!(2.4), ExitReason::TakeProfit)).unwrap();
        manager.record_trade(&trade("ETH/USDT", dec!(-1.1), ExitReason::StopLoss)).unwrap();
        manager.record_trade(&trade("ADA/USDT", dec!(0.3), ExitReason::Signal)).unwrap();

        let recent = manager.recent_trades(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].pair, "ADA/USDT");
        assert_eq!(recent[1].exit_reason, ExitReason::StopLoss);

        let all = manager.all_trades().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], trade("SOL/USDT", dec!(2.4), ExitReason::TakeProfit));

        manager.clear_all().unwrap();
        assert!(manager.all_trades().unwrap().is_empty());
    }
}
