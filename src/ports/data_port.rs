//! Time-series data source port.
//!
//! A [`DataSource`] hands out sessions; a scan context binds one session and
//! pooled workers open their own.

use crate::domain::bar::RawRow;
use crate::domain::error::DataSourceError;
use crate::domain::query_builder::ParameterizedQuery;
use chrono::NaiveDate;
use std::time::Duration;

pub trait DataSource: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DataSession>, DataSourceError>;

    /// Upper bound on concurrently open sessions; `None` when unbounded.
    fn max_sessions(&self) -> Option<usize> {
        None
    }
}

pub trait DataSession: Send {
    /// Run a rule query. Exceeding `timeout` fails with
    /// [`DataSourceError::Timeout`].
    fn execute_query(
        &mut self,
        query: &ParameterizedQuery,
        timeout: Duration,
    ) -> Result<Vec<RawRow>, DataSourceError>;

    /// Every symbol with at least one bar, sorted.
    fn get_available_symbols(&mut self) -> Result<Vec<String>, DataSourceError>;

    /// Dates in `[start, end]` that have bars, ascending.
    fn get_trading_calendar(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, DataSourceError>;
}
