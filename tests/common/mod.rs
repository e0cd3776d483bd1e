#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use rulescan::domain::bar::{IntradayBar, RawRow, TIMESTAMP_FORMAT};
use rulescan::domain::error::DataSourceError;
use rulescan::domain::query_builder::ParameterizedQuery;
use rulescan::domain::rule::RuleDefinition;
use rulescan::domain::rule_document::rule_from_value;
use rulescan::ports::data_port::{DataSession, DataSource};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Data source serving canned rows per scan date.
#[derive(Clone)]
pub struct MockDataSource {
    pub dates: Vec<NaiveDate>,
    pub symbols: Vec<String>,
    pub rows: HashMap<NaiveDate, Vec<RawRow>>,
    pub errors: HashMap<NaiveDate, DataSourceError>,
    /// Remaining transient failures per date before queries succeed.
    pub flaky: Arc<Mutex<HashMap<NaiveDate, u32>>>,
    /// Upcoming `connect` calls that fail with a connection error.
    pub dropped_connections: Arc<Mutex<u32>>,
    pub connects: Arc<Mutex<u32>>,
    pub queries: Arc<Mutex<Vec<ParameterizedQuery>>>,
}

impl MockDataSource {
    pub fn new(dates: &[&str], symbols: &[&str]) -> Self {
        Self {
            dates: dates.iter().map(|d| date(d)).collect(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            rows: HashMap::new(),
            errors: HashMap::new(),
            flaky: Arc::new(Mutex::new(HashMap::new())),
            dropped_connections: Arc::new(Mutex::new(0)),
            connects: Arc::new(Mutex::new(0)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_rows(mut self, day: &str, rows: Vec<RawRow>) -> Self {
        self.rows.insert(date(day), rows);
        self
    }

    pub fn with_error(mut self, day: &str, err: DataSourceError) -> Self {
        self.errors.insert(date(day), err);
        self
    }

    pub fn with_lock_contention(self, day: &str, failures: u32) -> Self {
        self.flaky.lock().unwrap().insert(date(day), failures);
        self
    }

    /// Fail the next `n` connection attempts.
    pub fn drop_connections(&self, n: u32) {
        *self.dropped_connections.lock().unwrap() = n;
    }

    pub fn connect_calls(&self) -> u32 {
        *self.connects.lock().unwrap()
    }

    pub fn executed(&self) -> Vec<ParameterizedQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl DataSource for MockDataSource {
    fn connect(&self) -> Result<Box<dyn DataSession>, DataSourceError> {
        *self.connects.lock().unwrap() += 1;
        let mut dropped = self.dropped_connections.lock().unwrap();
        if *dropped > 0 {
            *dropped -= 1;
            return Err(DataSourceError::Connection {
                reason: "connection reset by peer".into(),
            });
        }
        Ok(Box::new(self.clone()))
    }
}

impl DataSession for MockDataSource {
    fn execute_query(
        &mut self,
        query: &ParameterizedQuery,
        _timeout: Duration,
    ) -> Result<Vec<RawRow>, DataSourceError> {
        self.queries.lock().unwrap().push(query.clone());
        if let Some(err) = self.errors.get(&query.scan_date) {
            return Err(err.clone());
        }
        if let Some(remaining) = self.flaky.lock().unwrap().get_mut(&query.scan_date) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DataSourceError::LockContention {
                    reason: "database is locked".into(),
                });
            }
        }
        Ok(self.rows.get(&query.scan_date).cloned().unwrap_or_default())
    }

    fn get_available_symbols(&mut self) -> Result<Vec<String>, DataSourceError> {
        let mut symbols = self.symbols.clone();
        symbols.sort();
        Ok(symbols)
    }

    fn get_trading_calendar(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, DataSourceError> {
        Ok(self
            .dates
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect())
    }
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn bar(symbol: &str, ts: &str, open: f64, high: f64, low: f64, close: f64, volume: i64) -> IntradayBar {
    IntradayBar {
        symbol: symbol.to_string(),
        timestamp: NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).unwrap(),
        open,
        high,
        low,
        close,
        volume,
    }
}

pub fn scored_row(symbol: &str, close: f64, score: f64) -> RawRow {
    RawRow::new(symbol)
        .with_value("close", close)
        .with_value("probability_score", score)
        .with_label("direction", "long")
}

pub fn breakout_doc(id: &str) -> Value {
    json!({
        "id": id,
        "name": "Morning breakout",
        "rule_type": "breakout",
        "author": "desk",
        "parameters": { "volume_multiplier_min": 1.5 },
        "time_window": {
            "signal_window_start": "09:30",
            "signal_window_end": "10:30",
            "cutoff_time": "10:30",
            "performance_start_time": "10:30",
            "performance_end_time": "16:00"
        },
        "universe_filter": { "min_price": 50.0, "max_price": 2000.0, "min_volume": 10000 }
    })
}

pub fn crp_doc(id: &str) -> Value {
    json!({
        "id": id,
        "name": "Close near range extreme",
        "rule_type": "crp",
        "author": "desk",
        "parameters": { "close_threshold_pct": 1.0, "range_threshold_pct": 5.0 },
        "time_window": {
            "signal_window_start": "09:30",
            "signal_window_end": "10:30",
            "cutoff_time": "10:30",
            "performance_start_time": "10:30",
            "performance_end_time": "16:00"
        },
        "universe_filter": { "min_price": 1.0, "min_volume": 1000 }
    })
}

pub fn rule(doc: Value) -> RuleDefinition {
    rule_from_value(&doc).unwrap()
}

const PRIOR_DAYS: [&str; 4] = ["2024-03-04", "2024-03-05", "2024-03-06", "2024-03-07"];

/// Bars for one symbol: one quiet bar on each prior day, two bars in the
/// signal window on 2024-03-08 and one late bar for the performance window.
/// Prices scale by `scale`; scan-day volume scales by `volume_scale`.
pub fn breakout_bars(symbol: &str, scale: f64, volume_scale: f64) -> Vec<IntradayBar> {
    let mut bars: Vec<IntradayBar> = PRIOR_DAYS
        .iter()
        .map(|d| {
            bar(
                symbol,
                &format!("{d} 09:45:00"),
                100.0 * scale,
                102.0 * scale,
                98.0 * scale,
                101.0 * scale,
                20_000,
            )
        })
        .collect();
    let v = |n: f64| (n * volume_scale) as i64;
    bars.push(bar(
        symbol,
        "2024-03-08 09:30:00",
        100.0 * scale,
        103.0 * scale,
        99.0 * scale,
        102.0 * scale,
        v(20_000.0),
    ));
    bars.push(bar(
        symbol,
        "2024-03-08 10:00:00",
        102.0 * scale,
        106.0 * scale,
        99.0 * scale,
        100.0 * scale,
        v(30_000.0),
    ));
    bars.push(bar(
        symbol,
        "2024-03-08 15:30:00",
        103.0 * scale,
        105.0 * scale,
        102.0 * scale,
        104.0 * scale,
        5_000,
    ));
    bars
}

/// One qualifying breakout (BRK) plus three symbols the filters reject:
/// price above the cap, price below the floor and a flat volume ratio.
pub fn breakout_universe() -> Vec<IntradayBar> {
    let mut bars = breakout_bars("BRK", 1.0, 1.0);
    bars.extend(breakout_bars("PRICEY", 30.0, 1.0));
    bars.extend(breakout_bars("PENNY", 0.1, 1.0));
    bars.extend(breakout_bars("QUIET", 1.0, 0.4));
    bars
}

pub fn write_temp_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
