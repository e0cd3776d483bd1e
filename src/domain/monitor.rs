//! Execution metrics emitted once per (rule, scan date) unit.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetric {
    pub scan_id: String,
    pub rule_id: String,
    pub rule_version: u32,
    pub scan_date: NaiveDate,
    pub execution_time: Duration,
    pub success: bool,
    pub signals_generated: usize,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub rule_id: String,
    pub days: u32,
    pub executions: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub mean_execution_ms: f64,
    pub signals_generated: usize,
    pub last_error: Option<String>,
}

/// Summarise `metrics` for one rule, counting those recorded within `days`
/// of `now`.
pub fn summarize<'a>(
    metrics: impl IntoIterator<Item = &'a ExecutionMetric>,
    rule_id: &str,
    days: u32,
    now: DateTime<Utc>,
) -> PerformanceSummary {
    let since = now - ChronoDuration::days(i64::from(days));
    let mut executions = 0;
    let mut successes = 0;
    let mut total_ms = 0.0;
    let mut signals_generated = 0;
    let mut last_error: Option<(DateTime<Utc>, String)> = None;

    for m in metrics
        .into_iter()
        .filter(|m| m.rule_id == rule_id && m.recorded_at >= since)
    {
        executions += 1;
        total_ms += m.execution_time.as_secs_f64() * 1000.0;
        signals_generated += m.signals_generated;
        if m.success {
            successes += 1;
        } else if let Some(msg) = &m.error_message {
            if last_error.as_ref().is_none_or(|(at, _)| m.recorded_at >= *at) {
                last_error = Some((m.recorded_at, msg.clone()));
            }
        }
    }

    let (success_rate, mean_execution_ms) = if executions == 0 {
        (0.0, 0.0)
    } else {
        (
            successes as f64 / executions as f64,
            total_ms / executions as f64,
        )
    };

    PerformanceSummary {
        rule_id: rule_id.to_string(),
        days,
        executions,
        successes,
        success_rate,
        mean_execution_ms,
        signals_generated,
        last_error: last_error.map(|(_, msg)| msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(rule_id: &str, success: bool, ms: u64, age_days: i64, now: DateTime<Utc>) -> ExecutionMetric {
        ExecutionMetric {
            scan_id: "scan-1".into(),
            rule_id: rule_id.into(),
            rule_version: 1,
            scan_date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            execution_time: Duration::from_millis(ms),
            success,
            signals_generated: if success { 3 } else { 0 },
            error_message: (!success).then(|| "query timed out".to_string()),
            attempts: 1,
            recorded_at: now - ChronoDuration::days(age_days),
        }
    }

    #[test]
    fn summary_counts_recent_executions_of_one_rule() {
        let now = Utc::now();
        let metrics = vec![
            metric("a", true, 100, 0, now),
            metric("a", false, 300, 1, now),
            metric("a", true, 200, 30, now),
            metric("b", true, 50, 0, now),
        ];
        let summary = summarize(&metrics, "a", 7, now);
        assert_eq!(summary.executions, 2);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.mean_execution_ms, 200.0);
        assert_eq!(summary.signals_generated, 3);
        assert_eq!(summary.last_error.as_deref(), Some("query timed out"));
    }

    #[test]
    fn empty_summary() {
        let summary = summarize(&Vec::<ExecutionMetric>::new(), "missing", 7, Utc::now());
        assert_eq!(summary.executions, 0);
        assert_eq!(summary.success_rate, 0.0);
    }
}
