//! Monitoring collaborator port.

use crate::domain::monitor::{ExecutionMetric, PerformanceSummary};

pub trait ExecutionMonitor: Send + Sync {
    fn record_execution(&self, metric: &ExecutionMetric);

    /// Aggregate of the executions recorded for `rule_id` over the last `days` days.
    fn get_rule_performance_summary(&self, rule_id: &str, days: u32) -> PerformanceSummary;
}
