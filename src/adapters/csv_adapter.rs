//! CSV intraday bar loader.
//!
//! Expects a header row and the columns
//! `symbol,timestamp,open,high,low,close,volume`, with timestamps formatted as
//! `YYYY-MM-DD HH:MM:SS`.

use crate::domain::bar::{IntradayBar, TIMESTAMP_FORMAT};
use crate::domain::error::RulescanError;
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};

pub struct CsvBarLoader {
    path: PathBuf,
}

impl CsvBarLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read every bar in the file, sorted by symbol then timestamp.
    pub fn load(&self) -> Result<Vec<IntradayBar>, RulescanError> {
        let content = fs::read_to_string(&self.path).map_err(|e| self.error(format!("read failed: {e}")))?;
        let mut bars = parse_bars(&content).map_err(|reason| self.error(reason))?;
        bars.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.timestamp.cmp(&b.timestamp)));
        tracing::info!(file = %self.path.display(), bars = bars.len(), "bars loaded");
        Ok(bars)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, reason: String) -> RulescanError {
        RulescanError::BarImport {
            file: self.path.display().to_string(),
            reason,
        }
    }
}

fn parse_bars(content: &str) -> Result<Vec<IntradayBar>, String> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let record = result.map_err(|e| format!("CSV parse error: {e}"))?;

        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| format!("line {line}: missing {name} column"))
        };
        let number = |idx: usize, name: &str| -> Result<f64, String> {
            field(idx, name)?
                .parse()
                .map_err(|e| format!("line {line}: invalid {name} value: {e}"))
        };

        let symbol = field(0, "symbol")?.to_uppercase();
        let timestamp = NaiveDateTime::parse_from_str(field(1, "timestamp")?, TIMESTAMP_FORMAT)
            .map_err(|e| format!("line {line}: invalid timestamp: {e}"))?;
        let volume: i64 = field(6, "volume")?
            .parse()
            .map_err(|e| format!("line {line}: invalid volume value: {e}"))?;

        let bar = IntradayBar {
            symbol,
            timestamp,
            open: number(2, "open")?,
            high: number(3, "high")?,
            low: number(4, "low")?,
            close: number(5, "close")?,
            volume,
        };
        bar.check().map_err(|e| format!("line {line}: {e}"))?;
        bars.push(bar);
    }

    Ok(bars)
}
