//! Scan context: the resolved universe, trading dates and data source
//! session for one scan.
//!
//! A context is single-use. Once released, every accessor that would touch
//! the session fails with [`StaleContextError`].

use chrono::{NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::error::{ContextError, DataSourceError, StaleContextError};
use crate::domain::query_builder::QueryScope;
use crate::ports::data_port::{DataSession, DataSource};

static SCAN_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn default_end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDates {
    Single(NaiveDate),
    Range { start: NaiveDate, end: NaiveDate },
}

impl ScanDates {
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        match *self {
            ScanDates::Single(d) => (d, d),
            ScanDates::Range { start, end } => (start, end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniverseSpec {
    Explicit(Vec<String>),
    /// Every symbol the data source knows; per-rule price and volume
    /// filters are applied by the query itself.
    All,
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub rule_ids: Vec<String>,
    pub dates: ScanDates,
    pub cutoff_time: Option<NaiveTime>,
    pub end_of_day_time: NaiveTime,
    pub universe: UniverseSpec,
}

/// Per-rule tallies kept while a scan runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleCounters {
    pub units: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub signals: usize,
}

pub struct ScanContext {
    scan_id: String,
    rule_ids: Vec<String>,
    dates: Vec<NaiveDate>,
    cutoff_time: Option<NaiveTime>,
    end_of_day_time: NaiveTime,
    universe: Vec<String>,
    source: Arc<dyn DataSource>,
    session: Mutex<Option<Box<dyn DataSession>>>,
    released: AtomicBool,
    counters: Mutex<BTreeMap<String, RuleCounters>>,
}

impl ScanContext {
    /// Resolve the request against `source` and bind one session to it.
    pub fn create(request: ScanRequest, source: Arc<dyn DataSource>) -> Result<Self, ContextError> {
        let mut rule_ids = request.rule_ids;
        rule_ids.sort();
        rule_ids.dedup();
        if rule_ids.is_empty() {
            return Err(ContextError::NoRules);
        }

        let (start, end) = request.dates.bounds();
        if start > end {
            return Err(ContextError::InvalidDateRange { start, end });
        }

        let mut session = source.connect()?;

        let mut dates = session.get_trading_calendar(start, end)?;
        dates.sort();
        dates.dedup();
        dates.retain(|d| *d >= start && *d <= end);
        if dates.is_empty() {
            return Err(ContextError::NoTradingDates { start, end });
        }

        let available: BTreeSet<String> = session.get_available_symbols()?.into_iter().collect();
        let universe = match request.universe {
            UniverseSpec::All => available.into_iter().collect(),
            UniverseSpec::Explicit(symbols) => {
                let mut wanted: Vec<String> = symbols
                    .iter()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                wanted.sort();
                wanted.dedup();
                let (known, unknown): (Vec<String>, Vec<String>) =
                    wanted.into_iter().partition(|s| available.contains(s));
                if !unknown.is_empty() {
                    tracing::warn!(symbols = ?unknown, "symbols without data dropped from universe");
                }
                known
            }
        };

        let scan_id = format!(
            "scan-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            SCAN_SEQ.fetch_add(1, Ordering::Relaxed) + 1
        );
        tracing::info!(
            scan_id = %scan_id,
            rules = rule_ids.len(),
            dates = dates.len(),
            symbols = universe.len(),
            "scan context created"
        );

        Ok(Self {
            scan_id,
            rule_ids,
            dates,
            cutoff_time: request.cutoff_time,
            end_of_day_time: request.end_of_day_time,
            universe,
            source,
            session: Mutex::new(Some(session)),
            released: AtomicBool::new(false),
            counters: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn rule_ids(&self) -> &[String] {
        &self.rule_ids
    }

    /// Trading dates in scope, ascending.
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub fn cutoff_time(&self) -> Option<NaiveTime> {
        self.cutoff_time
    }

    pub fn end_of_day_time(&self) -> NaiveTime {
        self.end_of_day_time
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn ensure_live(&self) -> Result<(), StaleContextError> {
        if self.is_released() {
            return Err(self.stale());
        }
        Ok(())
    }

    pub fn scope(&self, scan_date: NaiveDate) -> Result<QueryScope<'_>, StaleContextError> {
        self.ensure_live()?;
        Ok(QueryScope {
            scan_date,
            cutoff_time: self.cutoff_time,
            end_of_day_time: self.end_of_day_time,
            universe: &self.universe,
        })
    }

    /// Run `f` on the bound session.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut dyn DataSession) -> T,
    ) -> Result<T, StaleContextError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(session) if !self.is_released() => Ok(f(session.as_mut())),
            _ => Err(self.stale()),
        }
    }

    /// A fresh session from the context's data source, for pooled workers.
    pub fn open_session(&self) -> Result<Result<Box<dyn DataSession>, DataSourceError>, StaleContextError> {
        self.ensure_live()?;
        Ok(self.source.connect())
    }

    /// How many sessions the data source can hold open at once, if limited.
    pub fn max_sessions(&self) -> Option<usize> {
        self.source.max_sessions()
    }

    pub fn record_unit(&self, rule_id: &str, success: bool, signals: usize) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counters.entry(rule_id.to_string()).or_default();
        entry.units += 1;
        if success {
            entry.succeeded += 1;
            entry.signals += signals;
        } else {
            entry.failed += 1;
        }
    }

    pub fn counters(&self) -> BTreeMap<String, RuleCounters> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the bound session. Releasing twice is a stale-context error.
    pub fn release(&self) -> Result<(), StaleContextError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(self.stale());
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!(scan_id = %self.scan_id, "scan context released");
        Ok(())
    }

    fn stale(&self) -> StaleContextError {
        StaleContextError {
            scan_id: self.scan_id.clone(),
        }
    }
}

/// Split a comma-separated symbol list, uppercased and deduplicated in
/// first-seen order. Empty tokens are ignored.
pub fn parse_symbols(input: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut symbols = Vec::new();
    for token in input.split(',') {
        let symbol = token.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        if seen.insert(symbol.clone()) {
            symbols.push(symbol);
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::RawRow;
    use crate::domain::query_builder::ParameterizedQuery;
    use std::time::Duration;

    struct FixedSource {
        symbols: Vec<String>,
        dates: Vec<NaiveDate>,
    }

    struct FixedSession {
        symbols: Vec<String>,
        dates: Vec<NaiveDate>,
    }

    impl DataSource for FixedSource {
        fn connect(&self) -> Result<Box<dyn DataSession>, DataSourceError> {
            Ok(Box::new(FixedSession {
                symbols: self.symbols.clone(),
                dates: self.dates.clone(),
            }))
        }
    }

    impl DataSession for FixedSession {
        fn execute_query(
            &mut self,
            _query: &ParameterizedQuery,
            _timeout: Duration,
        ) -> Result<Vec<RawRow>, DataSourceError> {
            Ok(Vec::new())
        }

        fn get_available_symbols(&mut self) -> Result<Vec<String>, DataSourceError> {
            Ok(self.symbols.clone())
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

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn source() -> Arc<dyn DataSource> {
        Arc::new(FixedSource {
            symbols: vec!["BHP".into(), "CBA".into(), "WES".into()],
            // 9th and 10th are a weekend
            dates: vec![d(7), d(8), d(11), d(12)],
        })
    }

    fn request(universe: UniverseSpec, dates: ScanDates) -> ScanRequest {
        ScanRequest {
            rule_ids: vec!["b".into(), "a".into(), "a".into()],
            dates,
            cutoff_time: None,
            end_of_day_time: default_end_of_day(),
            universe,
        }
    }

    #[test]
    fn range_skips_non_trading_days() {
        let ctx = ScanContext::create(
            request(UniverseSpec::All, ScanDates::Range { start: d(8), end: d(11) }),
            source(),
        )
        .unwrap();
        assert_eq!(ctx.dates(), &[d(8), d(11)]);
        assert_eq!(ctx.rule_ids(), &["a".to_string(), "b".to_string()]);
        assert_eq!(ctx.universe().len(), 3);
    }

    #[test]
    fn explicit_universe_drops_unknown_symbols() {
        let ctx = ScanContext::create(
            request(
                UniverseSpec::Explicit(vec!["cba".into(), "XYZ".into(), "CBA".into()]),
                ScanDates::Single(d(8)),
            ),
            source(),
        )
        .unwrap();
        assert_eq!(ctx.universe(), &["CBA".to_string()]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = ScanContext::create(
            request(UniverseSpec::All, ScanDates::Range { start: d(12), end: d(8) }),
            source(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ContextError::InvalidDateRange { .. }));
    }

    #[test]
    fn holiday_only_range_has_no_dates() {
        let err = ScanContext::create(request(UniverseSpec::All, ScanDates::Single(d(9))), source())
            .err()
            .unwrap();
        assert!(matches!(err, ContextError::NoTradingDates { .. }));
    }

    #[test]
    fn no_rules_is_rejected() {
        let mut req = request(UniverseSpec::All, ScanDates::Single(d(8)));
        req.rule_ids.clear();
        let err = ScanContext::create(req, source()).err().unwrap();
        assert_eq!(err, ContextError::NoRules);
    }

    #[test]
    fn released_context_is_stale() {
        let ctx = ScanContext::create(request(UniverseSpec::All, ScanDates::Single(d(8))), source())
            .unwrap();
        assert!(ctx.with_session(|s| s.get_available_symbols()).is_ok());
        ctx.release().unwrap();

        assert!(ctx.is_released());
        assert!(ctx.scope(d(8)).is_err());
        assert!(ctx.with_session(|_| ()).is_err());
        assert!(ctx.open_session().is_err());
        let err = ctx.release().unwrap_err();
        assert_eq!(err.scan_id, ctx.scan_id());
    }

    #[test]
    fn counters_accumulate_per_rule() {
        let ctx = ScanContext::create(request(UniverseSpec::All, ScanDates::Single(d(8))), source())
            .unwrap();
        ctx.record_unit("a", true, 3);
        ctx.record_unit("a", false, 0);
        ctx.record_unit("b", true, 1);
        let counters = ctx.counters();
        assert_eq!(
            counters["a"],
            RuleCounters {
                units: 2,
                succeeded: 1,
                failed: 1,
                signals: 3
            }
        );
        assert_eq!(counters["b"].signals, 1);
    }

    #[test]
    fn scan_ids_are_unique() {
        let a = ScanContext::create(request(UniverseSpec::All, ScanDates::Single(d(8))), source())
            .unwrap();
        let b = ScanContext::create(request(UniverseSpec::All, ScanDates::Single(d(8))), source())
            .unwrap();
        assert_ne!(a.scan_id(), b.scan_id());
    }

    #[test]
    fn symbol_lists_are_normalized() {
        assert_eq!(parse_symbols(" cba, BHP,,cba ,wes"), vec!["CBA", "BHP", "WES"]);
        assert!(parse_symbols("").is_empty());
    }
}
