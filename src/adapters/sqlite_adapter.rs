//! SQLite intraday bar store and query executor.

use crate::domain::bar::{IntradayBar, RawRow, TIMESTAMP_FORMAT};
use crate::domain::config::ScannerConfig;
use crate::domain::error::{DataSourceError, RulescanError};
use crate::domain::query_builder::{ParameterizedQuery, SqlValue};
use crate::ports::data_port::{DataSession, DataSource};
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{ErrorCode, ToSql, params};
use std::time::{Duration, Instant};

/// Virtual machine steps between deadline checks.
const PROGRESS_STEPS: i32 = 1_000;

pub struct SqliteDataSource {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDataSource {
    pub fn from_config(config: &ScannerConfig) -> Result<Self, RulescanError> {
        let path = config
            .sqlite_path
            .as_deref()
            .ok_or_else(|| RulescanError::ConfigMissing {
                section: "sqlite".into(),
                key: "path".into(),
            })?;
        Self::open(path, config.sqlite_pool_size)
    }

    pub fn open(path: &str, pool_size: u32) -> Result<Self, RulescanError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e: r2d2::Error| DataSourceError::Connection {
                reason: format!("{path}: {e}"),
            })?;

        Ok(Self { pool })
    }

    /// A single shared in-memory database. Every session reuses the one
    /// connection, so sessions must not be held concurrently.
    pub fn in_memory() -> Result<Self, RulescanError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| DataSourceError::Connection {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), RulescanError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                date_partition TEXT NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_bars_partition ON bars(date_partition, symbol);
            CREATE INDEX IF NOT EXISTS idx_bars_symbol ON bars(symbol);",
        )
        .map_err(|e: rusqlite::Error| DataSourceError::Schema {
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// Insert or replace bars in one transaction.
    pub fn insert_bars(&self, bars: &[IntradayBar]) -> Result<usize, RulescanError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e: rusqlite::Error| classify(e, None))?;

        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO bars
                    (symbol, timestamp, open, high, low, close, volume, date_partition)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bar.symbol,
                    bar.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.date_partition().format("%Y-%m-%d").to_string(),
                ],
            )
            .map_err(|e: rusqlite::Error| classify(e, None))?;
        }

        tx.commit().map_err(|e: rusqlite::Error| classify(e, None))?;
        tracing::debug!(bars = bars.len(), "bars inserted");
        Ok(bars.len())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, DataSourceError> {
        self.pool
            .get()
            .map_err(|e: r2d2::Error| DataSourceError::Connection {
                reason: e.to_string(),
            })
    }
}

impl DataSource for SqliteDataSource {
    fn connect(&self) -> Result<Box<dyn DataSession>, DataSourceError> {
        Ok(Box::new(SqliteSession { conn: self.conn()? }))
    }

    fn max_sessions(&self) -> Option<usize> {
        Some(self.pool.max_size() as usize)
    }
}

struct SqliteSession {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl SqliteSession {
    fn run_query(&self, query: &ParameterizedQuery, started: Instant) -> Result<Vec<RawRow>, DataSourceError> {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .map_err(|e: rusqlite::Error| classify(e, Some(started)))?;

        let binds: Vec<(&str, Value)> = query
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), to_sql_value(value)))
            .collect();
        let named: Vec<(&str, &dyn ToSql)> = binds
            .iter()
            .map(|(name, value)| (*name, value as &dyn ToSql))
            .collect();

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt
            .query(named.as_slice())
            .map_err(|e: rusqlite::Error| classify(e, Some(started)))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e: rusqlite::Error| classify(e, Some(started)))?
        {
            let mut raw = RawRow::default();
            for (i, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e: rusqlite::Error| classify(e, Some(started)))?;
                match value {
                    ValueRef::Null | ValueRef::Blob(_) => {}
                    ValueRef::Integer(n) => {
                        raw.values.insert(column.clone(), n as f64);
                    }
                    ValueRef::Real(x) => {
                        raw.values.insert(column.clone(), x);
                    }
                    ValueRef::Text(bytes) => {
                        let text = String::from_utf8_lossy(bytes).into_owned();
                        if column == "symbol" {
                            raw.symbol = text;
                        } else {
                            raw.labels.insert(column.clone(), text);
                        }
                    }
                }
            }
            out.push(raw);
        }
        Ok(out)
    }
}

impl DataSession for SqliteSession {
    fn execute_query(
        &mut self,
        query: &ParameterizedQuery,
        timeout: Duration,
    ) -> Result<Vec<RawRow>, DataSourceError> {
        let started = Instant::now();
        let deadline = started + timeout;
        self.conn
            .progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));

        let result = self.run_query(query, started);
        self.conn.progress_handler(0, None::<fn() -> bool>);

        if let Ok(rows) = &result {
            tracing::debug!(
                rule_id = %query.rule_id,
                scan_date = %query.scan_date,
                rows = rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query executed"
            );
        }
        result
    }

    fn get_available_symbols(&mut self) -> Result<Vec<String>, DataSourceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT symbol FROM bars ORDER BY symbol")
            .map_err(|e: rusqlite::Error| classify(e, None))?;

        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e: rusqlite::Error| classify(e, None))?;

        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row.map_err(|e: rusqlite::Error| classify(e, None))?);
        }

        Ok(symbols)
    }

    fn get_trading_calendar(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, DataSourceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT date_partition FROM bars
                 WHERE date_partition >= ?1 AND date_partition <= ?2
                 ORDER BY date_partition",
            )
            .map_err(|e: rusqlite::Error| classify(e, None))?;

        let rows = stmt
            .query_map(
                params![
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string()
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e: rusqlite::Error| classify(e, None))?;

        let mut dates = Vec::new();
        for row in rows {
            let text = row.map_err(|e: rusqlite::Error| classify(e, None))?;
            let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(
                |e: chrono::ParseError| DataSourceError::Schema {
                    reason: format!("bad date_partition {text}: {e}"),
                },
            )?;
            dates.push(date);
        }

        Ok(dates)
    }
}

fn to_sql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Integer(n) => Value::Integer(*n),
        SqlValue::Real(x) => Value::Real(*x),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

/// Map a SQLite failure onto the data source error taxonomy. `started` is
/// set for rule queries, where an interrupt means the deadline passed.
fn classify(err: rusqlite::Error, started: Option<Instant>) -> DataSourceError {
    let reason = err.to_string();
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::OperationInterrupted => {
                return DataSourceError::Timeout {
                    elapsed_ms: started.map_or(0, |s| s.elapsed().as_millis() as u64),
                };
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return DataSourceError::LockContention { reason };
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
                return DataSourceError::Connection { reason };
            }
            _ => {}
        }
    }
    if reason.contains("no such table") || reason.contains("no such column") {
        DataSourceError::Schema { reason }
    } else {
        DataSourceError::Query { reason }
    }
}
