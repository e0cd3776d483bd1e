//! Execution monitor that keeps metrics in memory and logs each one.

use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::domain::monitor::{ExecutionMetric, PerformanceSummary, summarize};
use crate::ports::monitor_port::ExecutionMonitor;

#[derive(Default)]
pub struct InMemoryMonitor {
    metrics: Mutex<Vec<ExecutionMetric>>,
}

impl InMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<ExecutionMetric> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecutionMonitor for InMemoryMonitor {
    fn record_execution(&self, metric: &ExecutionMetric) {
        tracing::info!(
            scan_id = %metric.scan_id,
            rule_id = %metric.rule_id,
            rule_version = metric.rule_version,
            scan_date = %metric.scan_date,
            success = metric.success,
            attempts = metric.attempts,
            signals = metric.signals_generated,
            execution_ms = metric.execution_time.as_millis() as u64,
            "rule execution recorded"
        );
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metric.clone());
    }

    fn get_rule_performance_summary(&self, rule_id: &str, days: u32) -> PerformanceSummary {
        let metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        summarize(metrics.iter(), rule_id, days, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    #[test]
    fn records_and_summarizes() {
        let monitor = InMemoryMonitor::new();
        for success in [true, true, false] {
            monitor.record_execution(&ExecutionMetric {
                scan_id: "scan-1".into(),
                rule_id: "breakout-1".into(),
                rule_version: 2,
                scan_date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
                execution_time: Duration::from_millis(40),
                success,
                signals_generated: usize::from(success),
                error_message: (!success).then(|| "schema mismatch".to_string()),
                attempts: 1,
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(monitor.metrics().len(), 3);
        let summary = monitor.get_rule_performance_summary("breakout-1", 1);
        assert_eq!(summary.executions, 3);
        assert_eq!(summary.successes, 2);
        assert_eq!(summary.signals_generated, 2);
        assert_eq!(summary.last_error.as_deref(), Some("schema mismatch"));
    }
}
