//! Intraday bars and the raw rows a rule query returns.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct IntradayBar {
    pub symbol: String,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl IntradayBar {
    /// Trading date the bar belongs to.
    pub fn date_partition(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// Basic OHLC consistency: low <= open, close <= high and volume >= 0.
    pub fn check(&self) -> Result<(), String> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(format!("{} {}: prices must be positive", self.symbol, self.timestamp));
        }
        if self.low > self.high
            || self.open > self.high
            || self.open < self.low
            || self.close > self.high
            || self.close < self.low
        {
            return Err(format!(
                "{} {}: open/close must lie within [low, high]",
                self.symbol, self.timestamp
            ));
        }
        if self.volume < 0 {
            return Err(format!("{} {}: negative volume", self.symbol, self.timestamp));
        }
        Ok(())
    }
}

/// One result row of a rule query: numeric metrics and text labels keyed by
/// column name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRow {
    pub symbol: String,
    pub values: BTreeMap<String, f64>,
    pub labels: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn with_label(mut self, name: &str, label: &str) -> Self {
        self.labels.insert(name.to_string(), label.to_string());
        self
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}
