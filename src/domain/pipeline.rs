//! Scan execution pipeline.
//!
//! A scan is split into independent (rule, scan date) units. Each unit
//! builds its query, runs it with bounded retries for transient errors and
//! turns the rows into signals. A failing unit is recorded and never aborts
//! its siblings. Units run sequentially on the context's session, or on a
//! bounded rayon pool where each unit opens its own session.

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::domain::config::{RetryPolicy, ScannerConfig, ScannerSettings};
use crate::domain::context::{RuleCounters, ScanContext};
use crate::domain::error::{QueryBuildError, StaleContextError};
use crate::domain::monitor::ExecutionMetric;
use crate::domain::query_builder::{ParameterizedQuery, QueryBuilder};
use crate::domain::repository::RuleRepository;
use crate::domain::rule::RuleDefinition;
use crate::domain::signal::{self, Signal};
use crate::ports::data_port::DataSession;
use crate::ports::monitor_port::ExecutionMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    Created,
    BuildingQueries,
    Running,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Cancelled
        )
    }

    pub fn can_transition(self, next: ScanState) -> bool {
        use ScanState::*;
        match (self, next) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Created, BuildingQueries)
            | (BuildingQueries, Running)
            | (Running, Aggregating)
            | (Aggregating, Completed) => true,
            _ => false,
        }
    }
}

/// Shared flag checked before each unit is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Failed,
    /// Never dispatched because the scan was cancelled first.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub rule_id: String,
    pub rule_version: u32,
    pub scan_date: NaiveDate,
    pub status: UnitStatus,
    pub attempts: u32,
    pub execution_ms: u64,
    pub signals_generated: usize,
    pub error: Option<String>,
    pub signals: Vec<Signal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub scan_id: String,
    pub state: ScanState,
    pub transitions: Vec<ScanState>,
    /// Ordered by scan date, then by rule id.
    pub units: Vec<UnitReport>,
    pub counters: BTreeMap<String, RuleCounters>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScanReport {
    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.units.iter().flat_map(|u| u.signals.iter())
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.status == UnitStatus::Failed)
    }
}

struct StateMachine {
    scan_id: String,
    current: ScanState,
    history: Vec<ScanState>,
}

impl StateMachine {
    fn new(scan_id: &str) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            current: ScanState::Created,
            history: vec![ScanState::Created],
        }
    }

    fn advance(&mut self, next: ScanState) {
        if !self.current.can_transition(next) {
            tracing::warn!(scan_id = %self.scan_id, from = ?self.current, to = ?next, "ignored invalid scan transition");
            return;
        }
        tracing::debug!(scan_id = %self.scan_id, from = ?self.current, to = ?next, "scan state");
        self.current = next;
        self.history.push(next);
    }
}

struct Unit<'a> {
    rule: &'a RuleDefinition,
    scan_date: NaiveDate,
    query: Result<ParameterizedQuery, QueryBuildError>,
}

pub struct ScanPipeline {
    builder: QueryBuilder,
    settings: ScannerSettings,
    retry: RetryPolicy,
    monitor: Arc<dyn ExecutionMonitor>,
}

impl ScanPipeline {
    pub fn new(config: &ScannerConfig, monitor: Arc<dyn ExecutionMonitor>) -> Self {
        Self {
            builder: QueryBuilder::from_config(config),
            settings: config.scanner.clone(),
            retry: config.retry.clone(),
            monitor,
        }
    }

    /// Run every rule over every trading date in `ctx`, then release it.
    ///
    /// Only a context that was already released is an error; everything that
    /// goes wrong inside a unit is reported in that unit's status.
    pub fn run(
        &self,
        ctx: &ScanContext,
        rules: &[RuleDefinition],
        cancel: &CancellationToken,
    ) -> Result<ScanReport, StaleContextError> {
        ctx.ensure_live()?;
        let started_at = Utc::now();
        let mut state = StateMachine::new(ctx.scan_id());

        state.advance(ScanState::BuildingQueries);
        let mut units = Vec::with_capacity(ctx.dates().len() * rules.len());
        let ordered = self.scoped_rules(ctx, rules);
        for &scan_date in ctx.dates() {
            let scope = ctx.scope(scan_date)?;
            for &rule in &ordered {
                let query = self.builder.build_query(rule, &scope);
                if let Err(e) = &query {
                    tracing::warn!(rule_id = %rule.id, scan_date = %scan_date, error = %e, "query build failed");
                }
                units.push(Unit {
                    rule,
                    scan_date,
                    query,
                });
            }
        }

        state.advance(ScanState::Running);
        let workers = self.worker_count(ctx);
        let reports = if workers <= 1 {
            self.run_sequential(ctx, &units, cancel)?
        } else {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    units
                        .par_iter()
                        .map(|unit| self.run_pooled(ctx, unit, cancel))
                        .collect::<Vec<_>>()
                }),
                Err(e) => {
                    tracing::error!(scan_id = %ctx.scan_id(), error = %e, "worker pool failed to start");
                    state.advance(ScanState::Failed);
                    let reason = format!("worker pool unavailable: {e}");
                    let reports = units
                        .iter()
                        .map(|unit| self.finish(ctx, unit, Err(reason.clone()), 0, Duration::ZERO))
                        .collect();
                    return Ok(self.conclude(ctx, state, reports, started_at));
                }
            }
        };

        let cancelled = cancel.is_cancelled();
        if cancelled {
            state.advance(ScanState::Cancelled);
        } else {
            state.advance(ScanState::Aggregating);
            let all_failed = !reports.is_empty()
                && reports.iter().all(|r| r.status == UnitStatus::Failed);
            if all_failed {
                state.advance(ScanState::Failed);
            } else {
                state.advance(ScanState::Completed);
            }
        }

        Ok(self.conclude(ctx, state, reports, started_at))
    }

    /// Rules in scope for `ctx`, by id then version, each `(id, version)` once.
    fn scoped_rules<'a>(&self, ctx: &ScanContext, rules: &'a [RuleDefinition]) -> Vec<&'a RuleDefinition> {
        let mut ordered: Vec<&RuleDefinition> = rules
            .iter()
            .filter(|r| {
                let in_scope = ctx.rule_ids().binary_search(&r.id).is_ok();
                if !in_scope {
                    tracing::warn!(scan_id = %ctx.scan_id(), rule_id = %r.id, "rule not in scan context, skipped");
                }
                in_scope
            })
            .collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
        ordered.dedup_by(|a, b| a.id == b.id && a.version == b.version);
        ordered
    }

    /// Pooled workers each hold a session next to the context's bound one,
    /// so the source's session limit caps the pool.
    fn worker_count(&self, ctx: &ScanContext) -> usize {
        let wanted = self.settings.worker_threads;
        match ctx.max_sessions() {
            Some(max) if max.saturating_sub(1) < wanted => {
                let workers = max.saturating_sub(1);
                tracing::warn!(
                    scan_id = %ctx.scan_id(),
                    requested = wanted,
                    workers,
                    "worker threads limited by data source sessions"
                );
                workers
            }
            _ => wanted,
        }
    }

    fn conclude(
        &self,
        ctx: &ScanContext,
        state: StateMachine,
        units: Vec<UnitReport>,
        started_at: DateTime<Utc>,
    ) -> ScanReport {
        if let Err(e) = ctx.release() {
            tracing::warn!(error = %e, "scan context was released early");
        }
        let signals: usize = units.iter().map(|u| u.signals_generated).sum();
        let failed = units.iter().filter(|u| u.status == UnitStatus::Failed).count();
        tracing::info!(
            scan_id = %ctx.scan_id(),
            state = ?state.current,
            units = units.len(),
            failed,
            signals,
            "scan finished"
        );
        ScanReport {
            scan_id: ctx.scan_id().to_string(),
            state: state.current,
            transitions: state.history,
            units,
            counters: ctx.counters(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn run_sequential(
        &self,
        ctx: &ScanContext,
        units: &[Unit<'_>],
        cancel: &CancellationToken,
    ) -> Result<Vec<UnitReport>, StaleContextError> {
        let mut reports = Vec::with_capacity(units.len());
        for unit in units {
            if cancel.is_cancelled() {
                reports.push(cancelled(unit));
                continue;
            }
            let report = ctx.with_session(|session| self.execute(ctx, unit, session))?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn run_pooled(&self, ctx: &ScanContext, unit: &Unit<'_>, cancel: &CancellationToken) -> UnitReport {
        if cancel.is_cancelled() {
            return cancelled(unit);
        }
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        let mut session = loop {
            attempt += 1;
            match ctx.open_session() {
                Ok(Ok(session)) => break session,
                Ok(Err(e)) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt - 1);
                    tracing::warn!(
                        rule_id = %unit.rule.id,
                        scan_date = %unit.scan_date,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "session unavailable, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Ok(Err(e)) => {
                    return self.finish(ctx, unit, Err(e.to_string()), attempt, started.elapsed());
                }
                Err(e) => return self.finish(ctx, unit, Err(e.to_string()), 0, started.elapsed()),
            }
        };
        self.execute(ctx, unit, session.as_mut())
    }

    fn execute(&self, ctx: &ScanContext, unit: &Unit<'_>, session: &mut dyn DataSession) -> UnitReport {
        let started = Instant::now();
        let query = match &unit.query {
            Ok(q) => q,
            Err(e) => return self.finish(ctx, unit, Err(e.to_string()), 0, started.elapsed()),
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match session.execute_query(query, self.settings.query_timeout) {
                Ok(rows) => {
                    let signals = signal::generate(
                        &rows,
                        unit.rule,
                        unit.scan_date,
                        Utc::now(),
                        self.settings.max_results_per_day,
                    );
                    return self.finish(ctx, unit, Ok(signals), attempt, started.elapsed());
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt - 1);
                    tracing::warn!(
                        rule_id = %unit.rule.id,
                        scan_date = %unit.scan_date,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient data source error, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    tracing::error!(
                        rule_id = %unit.rule.id,
                        scan_date = %unit.scan_date,
                        attempt,
                        error = %e,
                        "unit failed"
                    );
                    return self.finish(ctx, unit, Err(e.to_string()), attempt, started.elapsed());
                }
            }
        }
    }

    /// Record the unit's outcome with the monitor and the context counters.
    fn finish(
        &self,
        ctx: &ScanContext,
        unit: &Unit<'_>,
        outcome: Result<Vec<Signal>, String>,
        attempts: u32,
        elapsed: Duration,
    ) -> UnitReport {
        let (status, signals, error) = match outcome {
            Ok(signals) => (UnitStatus::Succeeded, signals, None),
            Err(e) => (UnitStatus::Failed, Vec::new(), Some(e)),
        };
        let success = status == UnitStatus::Succeeded;
        ctx.record_unit(&unit.rule.id, success, signals.len());
        self.monitor.record_execution(&ExecutionMetric {
            scan_id: ctx.scan_id().to_string(),
            rule_id: unit.rule.id.clone(),
            rule_version: unit.rule.version,
            scan_date: unit.scan_date,
            execution_time: elapsed,
            success,
            signals_generated: signals.len(),
            error_message: error.clone(),
            attempts,
            recorded_at: Utc::now(),
        });
        UnitReport {
            rule_id: unit.rule.id.clone(),
            rule_version: unit.rule.version,
            scan_date: unit.scan_date,
            status,
            attempts,
            execution_ms: elapsed.as_millis() as u64,
            signals_generated: signals.len(),
            error,
            signals,
        }
    }
}

fn cancelled(unit: &Unit<'_>) -> UnitReport {
    UnitReport {
        rule_id: unit.rule.id.clone(),
        rule_version: unit.rule.version,
        scan_date: unit.scan_date,
        status: UnitStatus::Cancelled,
        attempts: 0,
        execution_ms: 0,
        signals_generated: 0,
        error: None,
        signals: Vec::new(),
    }
}

/// The enabled version of each requested rule, plus the ids that have none.
pub fn resolve_enabled_rules(
    repository: &RuleRepository,
    ids: &[String],
) -> (Vec<RuleDefinition>, Vec<String>) {
    let enabled = repository.enabled_rules();
    let mut rules = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
        match enabled.iter().find(|r| &r.id == id) {
            Some(rule) => rules.push(rule.clone()),
            None => missing.push(id.clone()),
        }
    }
    (rules, missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        use ScanState::*;
        let path = [Created, BuildingQueries, Running, Aggregating, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_and_cancellation_from_any_live_state() {
        use ScanState::*;
        for from in [Created, BuildingQueries, Running, Aggregating] {
            assert!(from.can_transition(Failed));
            assert!(from.can_transition(Cancelled));
        }
        for from in [Completed, Failed, Cancelled] {
            assert!(!from.can_transition(Failed));
            assert!(!from.can_transition(Cancelled));
            assert!(!from.can_transition(Running));
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!ScanState::Created.can_transition(ScanState::Running));
        assert!(!ScanState::Running.can_transition(ScanState::Completed));
        assert!(!ScanState::Aggregating.can_transition(ScanState::Running));
    }

    #[test]
    fn state_machine_ignores_invalid_moves() {
        let mut sm = StateMachine::new("scan-test");
        sm.advance(ScanState::Completed);
        assert_eq!(sm.current, ScanState::Created);
        sm.advance(ScanState::BuildingQueries);
        sm.advance(ScanState::Cancelled);
        sm.advance(ScanState::Running);
        assert_eq!(
            sm.history,
            vec![ScanState::Created, ScanState::BuildingQueries, ScanState::Cancelled]
        );
    }

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
