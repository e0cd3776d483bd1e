//! Turn raw query rows into ranked, scored signals.
//!
//! Generation is a pure function of the rows and the rule: the same input
//! always yields the same signals in the same order, with ties on
//! `probability_score` broken by symbol ascending.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::bar::RawRow;
use crate::domain::rule::RuleDefinition;

pub const ENTRY_COLUMN: &str = "close";
pub const SCORE_COLUMN: &str = "probability_score";
pub const DIRECTION_COLUMN: &str = "direction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub rule_id: String,
    pub rule_version: u32,
    pub scan_date: NaiveDate,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub raw_metric_values: BTreeMap<String, f64>,
    pub labels: BTreeMap<String, String>,
    pub probability_score: f64,
    pub rank: usize,
    pub generated_at: DateTime<Utc>,
}

/// Protective levels for an entry. Shorts mirror longs: the stop sits above
/// the entry and the target below.
pub fn exit_levels(
    entry: f64,
    direction: Direction,
    stop_loss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let sign = match direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
    };
    let stop = stop_loss_pct.map(|pct| entry * (1.0 - sign * pct / 100.0));
    let take = take_profit_pct.map(|pct| entry * (1.0 + sign * pct / 100.0));
    (stop, take)
}

/// Build signals for one (rule, scan date) unit.
///
/// Rows without a symbol, entry price or score are skipped, as are rows
/// scoring below the rule's `min_probability`. The result is truncated to
/// the rule's `max_results_per_day`, or `default_cap` when the rule sets none.
pub fn generate(
    rows: &[RawRow],
    rule: &RuleDefinition,
    scan_date: NaiveDate,
    generated_at: DateTime<Utc>,
    default_cap: usize,
) -> Vec<Signal> {
    let policy = &rule.policy;
    let cap = policy.max_results_per_day.unwrap_or(default_cap);

    let mut candidates: Vec<(&RawRow, f64, f64, Direction)> = Vec::new();
    for row in rows {
        if row.symbol.is_empty() {
            tracing::debug!(rule_id = %rule.id, "row without symbol skipped");
            continue;
        }
        let (Some(entry), Some(score)) = (row.value(ENTRY_COLUMN), row.value(SCORE_COLUMN)) else {
            tracing::debug!(rule_id = %rule.id, symbol = %row.symbol, "row missing entry or score");
            continue;
        };
        if !entry.is_finite() || entry <= 0.0 || !score.is_finite() {
            continue;
        }
        if score < policy.min_probability {
            continue;
        }
        let direction = row
            .label(DIRECTION_COLUMN)
            .and_then(|d| d.parse().ok())
            .unwrap_or(Direction::Long);
        candidates.push((row, entry, score.clamp(0.0, 100.0), direction));
    }

    candidates.sort_by(|a, b| match b.2.total_cmp(&a.2) {
        Ordering::Equal => a.0.symbol.cmp(&b.0.symbol),
        other => other,
    });
    candidates.truncate(cap);

    candidates
        .into_iter()
        .enumerate()
        .map(|(i, (row, entry, score, direction))| {
            let (stop_loss, take_profit) =
                exit_levels(entry, direction, policy.stop_loss_pct, policy.take_profit_pct);
            let mut labels = row.labels.clone();
            labels.remove(DIRECTION_COLUMN);
            Signal {
                symbol: row.symbol.clone(),
                rule_id: rule.id.clone(),
                rule_version: rule.version,
                scan_date,
                direction,
                entry_price: entry,
                stop_loss,
                take_profit,
                raw_metric_values: row.values.clone(),
                labels,
                probability_score: score,
                rank: i + 1,
                generated_at,
            }
        })
        .collect()
}
