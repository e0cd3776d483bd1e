//! End-to-end scans: context, query builder, pipeline and signal generator
//! against SQLite and against a scripted data source.

mod common;

use approx::assert_relative_eq;
use chrono::NaiveTime;
use common::*;
use rulescan::adapters::memory_monitor::InMemoryMonitor;
use rulescan::adapters::sqlite_adapter::SqliteDataSource;
use rulescan::domain::config::ScannerConfig;
use rulescan::domain::context::{ScanContext, ScanDates, ScanRequest, UniverseSpec, default_end_of_day};
use rulescan::domain::error::{ContextError, DataSourceError};
use rulescan::domain::pipeline::{CancellationToken, ScanPipeline, ScanReport, ScanState, UnitStatus};
use rulescan::domain::rule::RuleDefinition;
use rulescan::domain::signal::Direction;
use rulescan::ports::data_port::DataSource;
use std::sync::Arc;
use std::time::Duration;

fn request(rules: &[&RuleDefinition], dates: ScanDates, universe: UniverseSpec) -> ScanRequest {
    ScanRequest {
        rule_ids: rules.iter().map(|r| r.id.clone()).collect(),
        dates,
        cutoff_time: None,
        end_of_day_time: default_end_of_day(),
        universe,
    }
}

fn fast_retry_config(worker_threads: usize) -> ScannerConfig {
    let mut config = ScannerConfig::default();
    config.scanner.worker_threads = worker_threads;
    config.retry.max_attempts = 3;
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(2);
    config
}

fn scan(
    source: Arc<dyn DataSource>,
    config: &ScannerConfig,
    rules: &[RuleDefinition],
    req: ScanRequest,
) -> (ScanReport, Arc<InMemoryMonitor>) {
    let ctx = ScanContext::create(req, source).unwrap();
    let monitor = Arc::new(InMemoryMonitor::new());
    let pipeline = ScanPipeline::new(config, monitor.clone());
    let report = pipeline.run(&ctx, rules, &CancellationToken::new()).unwrap();
    assert!(ctx.is_released());
    (report, monitor)
}

/// On-disk database so pooled workers each get their own connection.
fn seeded_sqlite(dir: &tempfile::TempDir) -> Arc<SqliteDataSource> {
    let path = dir.path().join("bars.db");
    let source = SqliteDataSource::open(path.to_str().unwrap(), 8).unwrap();
    source.initialize_schema().unwrap();
    source.insert_bars(&breakout_universe()).unwrap();
    Arc::new(source)
}

mod breakout_on_sqlite {
    use super::*;

    #[test]
    fn only_the_qualifying_symbol_signals() {
        let dir = tempfile::tempdir().unwrap();
        let rule = rule(breakout_doc("breakout-am"));
        let (report, _) = scan(
            seeded_sqlite(&dir),
            &ScannerConfig::default(),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );

        assert_eq!(report.state, ScanState::Completed);
        assert_eq!(
            report.transitions,
            vec![
                ScanState::Created,
                ScanState::BuildingQueries,
                ScanState::Running,
                ScanState::Aggregating,
                ScanState::Completed
            ]
        );
        let signals: Vec<_> = report.signals().collect();
        assert_eq!(signals.len(), 1);
        let s = signals[0];
        assert_eq!(s.symbol, "BRK");
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.rank, 1);
        assert_eq!(s.rule_version, 1);
        assert_relative_eq!(s.entry_price, 100.0);
        // 0.4 * 83.33 + 0.3 * 60 + 0.2 * 100 + 0.1 * 14.29
        assert_relative_eq!(s.probability_score, 72.7619, epsilon = 1e-4);
        assert_relative_eq!(s.raw_metric_values["volume_ratio"], 2.5, epsilon = 1e-9);
        assert_relative_eq!(s.raw_metric_values["performance_return_pct"], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn counters_and_metrics_track_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let rule = rule(breakout_doc("breakout-am"));
        let (report, monitor) = scan(
            seeded_sqlite(&dir),
            &ScannerConfig::default(),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );

        let counters = &report.counters["breakout-am"];
        assert_eq!(counters.units, 1);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.signals, 1);
        let metrics = monitor.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success);
        assert_eq!(metrics[0].attempts, 1);
        assert_eq!(metrics[0].scan_id, report.scan_id);
    }

    #[test]
    fn explicit_universe_without_the_breakout_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rule = rule(breakout_doc("breakout-am"));
        let (report, _) = scan(
            seeded_sqlite(&dir),
            &ScannerConfig::default(),
            std::slice::from_ref(&rule),
            request(
                &[&rule],
                ScanDates::Single(date("2024-03-08")),
                UniverseSpec::Explicit(vec!["quiet".into(), "penny".into(), "NOPE".into()]),
            ),
        );
        assert_eq!(report.state, ScanState::Completed);
        assert_eq!(report.units[0].status, UnitStatus::Succeeded);
        assert_eq!(report.signals().count(), 0);
    }

    #[test]
    fn cutoff_drops_later_window_bars() {
        let dir = tempfile::tempdir().unwrap();
        let rule = rule(breakout_doc("breakout-am"));
        let mut req = request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All);
        req.cutoff_time = NaiveTime::from_hms_opt(9, 45, 0);
        // only the 09:30 bar remains, so the volume ratio falls to 1.0
        let (report, _) = scan(seeded_sqlite(&dir), &ScannerConfig::default(), std::slice::from_ref(&rule), req);
        assert_eq!(report.units[0].status, UnitStatus::Succeeded);
        assert_eq!(report.signals().count(), 0);
    }

    #[test]
    fn sequential_and_pooled_runs_agree() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded_sqlite(&dir);
        let rules = vec![rule(breakout_doc("breakout-am")), rule(crp_doc("crp-am"))];
        let refs: Vec<&RuleDefinition> = rules.iter().collect();
        let dates = ScanDates::Range {
            start: date("2024-03-05"),
            end: date("2024-03-08"),
        };

        let (pooled, _) = scan(
            source.clone(),
            &fast_retry_config(4),
            &rules,
            request(&refs, dates, UniverseSpec::All),
        );
        let (sequential, _) = scan(source, &fast_retry_config(1), &rules, request(&refs, dates, UniverseSpec::All));

        let key = |r: &ScanReport| -> Vec<(String, String, String, u64)> {
            r.signals()
                .map(|s| {
                    (
                        s.rule_id.clone(),
                        s.scan_date.to_string(),
                        s.symbol.clone(),
                        (s.probability_score * 10_000.0).round() as u64,
                    )
                })
                .collect()
        };
        assert_eq!(key(&pooled), key(&sequential));
        let order = |r: &ScanReport| -> Vec<(String, String)> {
            r.units
                .iter()
                .map(|u| (u.scan_date.to_string(), u.rule_id.clone()))
                .collect()
        };
        assert_eq!(order(&pooled), order(&sequential));
        assert_eq!(pooled.units.len(), 8);
    }
}

mod crp_on_sqlite {
    use super::*;

    #[test]
    fn close_at_the_high_is_a_long_near_high() {
        let source = SqliteDataSource::in_memory().unwrap();
        source.initialize_schema().unwrap();
        let mut bars: Vec<_> = ["2024-03-04", "2024-03-05", "2024-03-06", "2024-03-07"]
            .iter()
            .map(|d| bar("CRP", &format!("{d} 09:45:00"), 99.0, 100.0, 98.0, 99.0, 10_000))
            .collect();
        bars.push(bar("CRP", "2024-03-08 09:30:00", 99.0, 100.0, 98.0, 99.5, 20_000));
        source.insert_bars(&bars).unwrap();

        let rule = rule(crp_doc("crp-am"));
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );

        let signals: Vec<_> = report.signals().collect();
        assert_eq!(signals.len(), 1);
        let s = signals[0];
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.labels.get("close_position").map(String::as_str), Some("Near High"));
        assert_relative_eq!(s.raw_metric_values["close_position_score"], 100.0);
        assert_relative_eq!(s.raw_metric_values["volume_ratio"], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn close_within_one_percent_of_high_at_two_percent_threshold() {
        let source = SqliteDataSource::in_memory().unwrap();
        source.initialize_schema().unwrap();
        let mut bars: Vec<_> = ["2024-03-04", "2024-03-05", "2024-03-06", "2024-03-07"]
            .iter()
            .map(|d| bar("NH", &format!("{d} 09:45:00"), 99.0, 100.0, 98.0, 99.0, 10_000))
            .collect();
        bars.push(bar("NH", "2024-03-08 09:30:00", 99.0, 100.0, 98.0, 99.2, 20_000));
        source.insert_bars(&bars).unwrap();

        let mut doc = crp_doc("crp-2pct");
        doc["parameters"]["close_threshold_pct"] = serde_json::json!(2.0);
        let rule = rule(doc);
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );

        let signals: Vec<_> = report.signals().collect();
        assert_eq!(signals.len(), 1);
        let s = signals[0];
        assert_eq!(s.symbol, "NH");
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.labels.get("close_position").map(String::as_str), Some("Near High"));
        assert_relative_eq!(s.raw_metric_values["close_position_score"], 100.0);
        assert_relative_eq!(s.raw_metric_values["close_distance_pct"], 0.8, epsilon = 1e-9);
    }
}

mod rule_selection {
    use super::*;

    #[test]
    fn a_repeated_rule_runs_once_per_date() {
        let dir = tempfile::tempdir().unwrap();
        let rule = rule(breakout_doc("breakout-am"));
        let (report, monitor) = scan(
            seeded_sqlite(&dir),
            &ScannerConfig::default(),
            &[rule.clone(), rule.clone()],
            request(&[&rule, &rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.signals().count(), 1);
        assert_eq!(monitor.metrics().len(), 1);
        assert_eq!(report.counters["breakout-am"].units, 1);
    }

    #[test]
    fn rules_outside_the_context_are_skipped() {
        let source = MockDataSource::new(&["2024-03-08"], &["BHP"])
            .with_rows("2024-03-08", vec![scored_row("BHP", 45.0, 80.0)]);
        let in_scope = rule(breakout_doc("r1"));
        let stray = rule(breakout_doc("r2"));
        let (report, monitor) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            &[stray, in_scope.clone()],
            request(&[&in_scope], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );
        let ids: Vec<&str> = report.units.iter().map(|u| u.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
        assert!(monitor.metrics().iter().all(|m| m.rule_id == "r1"));
    }
}

mod session_limits {
    use super::*;

    #[test]
    fn single_connection_source_runs_with_many_workers() {
        let source = SqliteDataSource::in_memory().unwrap();
        source.initialize_schema().unwrap();
        source.insert_bars(&breakout_universe()).unwrap();
        let rule = rule(breakout_doc("breakout-am"));

        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(4),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );
        assert_eq!(report.state, ScanState::Completed);
        assert_eq!(report.units[0].status, UnitStatus::Succeeded);
        assert_eq!(report.signals().count(), 1);
    }

    #[test]
    fn dropped_worker_connections_are_retried() {
        let source = MockDataSource::new(&["2024-03-06", "2024-03-07", "2024-03-08"], &["BHP"])
            .with_rows("2024-03-08", vec![scored_row("BHP", 45.0, 80.0)]);
        let rule = rule(breakout_doc("r1"));
        let ctx = ScanContext::create(
            request(
                &[&rule],
                ScanDates::Range {
                    start: date("2024-03-06"),
                    end: date("2024-03-08"),
                },
                UniverseSpec::All,
            ),
            Arc::new(source.clone()),
        )
        .unwrap();
        source.drop_connections(2);

        let pipeline = ScanPipeline::new(&fast_retry_config(2), Arc::new(InMemoryMonitor::new()));
        let report = pipeline
            .run(&ctx, std::slice::from_ref(&rule), &CancellationToken::new())
            .unwrap();

        assert_eq!(report.state, ScanState::Completed);
        assert!(report.units.iter().all(|u| u.status == UnitStatus::Succeeded));
        // one bound session, one per unit, two dropped
        assert_eq!(source.connect_calls(), 1 + 3 + 2);
    }
}

mod range_scans {
    use super::*;

    fn three_days() -> MockDataSource {
        MockDataSource::new(&["2024-03-06", "2024-03-07", "2024-03-08"], &["BHP", "CBA"])
            .with_rows("2024-03-06", vec![scored_row("BHP", 45.0, 80.0)])
            .with_rows("2024-03-07", vec![scored_row("CBA", 110.0, 70.0)])
            .with_rows(
                "2024-03-08",
                vec![scored_row("BHP", 46.0, 90.0), scored_row("CBA", 111.0, 60.0)],
            )
    }

    fn range() -> ScanDates {
        ScanDates::Range {
            start: date("2024-03-06"),
            end: date("2024-03-08"),
        }
    }

    #[test]
    fn a_failing_date_does_not_stop_the_others() {
        let source = three_days().with_error(
            "2024-03-07",
            DataSourceError::Query {
                reason: "malformed".into(),
            },
        );
        let rule = rule(breakout_doc("r1"));
        let (report, monitor) = scan(
            Arc::new(source),
            &fast_retry_config(4),
            std::slice::from_ref(&rule),
            request(&[&rule], range(), UniverseSpec::All),
        );

        assert_eq!(report.state, ScanState::Completed);
        assert_eq!(report.units.len(), 3);
        let failed: Vec<_> = report.failed_units().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].scan_date, date("2024-03-07"));
        assert!(failed[0].error.as_deref().unwrap().contains("malformed"));
        assert_eq!(report.signals().count(), 3);
        assert_eq!(report.counters["r1"].failed, 1);
        assert_eq!(report.counters["r1"].succeeded, 2);
        assert_eq!(monitor.metrics().iter().filter(|m| !m.success).count(), 1);
    }

    #[test]
    fn every_unit_failing_fails_the_scan() {
        let err = DataSourceError::Schema {
            reason: "no such table: bars".into(),
        };
        let source = three_days()
            .with_error("2024-03-06", err.clone())
            .with_error("2024-03-07", err.clone())
            .with_error("2024-03-08", err);
        let rule = rule(breakout_doc("r1"));
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], range(), UniverseSpec::All),
        );
        assert_eq!(report.state, ScanState::Failed);
        assert!(report.units.iter().all(|u| u.attempts == 1));
    }

    #[test]
    fn transient_errors_are_retried() {
        let source = three_days().with_lock_contention("2024-03-08", 2);
        let rule = rule(breakout_doc("r1"));
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );
        assert_eq!(report.units[0].status, UnitStatus::Succeeded);
        assert_eq!(report.units[0].attempts, 3);
        assert_eq!(report.units[0].signals_generated, 2);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let source = three_days().with_lock_contention("2024-03-08", 5);
        let rule = rule(breakout_doc("r1"));
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], ScanDates::Single(date("2024-03-08")), UniverseSpec::All),
        );
        assert_eq!(report.units[0].status, UnitStatus::Failed);
        assert_eq!(report.units[0].attempts, 3);
        assert_eq!(report.state, ScanState::Failed);
    }

    #[test]
    fn units_are_ordered_date_then_rule() {
        let source = three_days();
        let rules = vec![rule(breakout_doc("zeta")), rule(breakout_doc("alpha"))];
        let refs: Vec<&RuleDefinition> = rules.iter().collect();
        let (report, _) = scan(
            Arc::new(source),
            &fast_retry_config(4),
            &rules,
            request(&refs, range(), UniverseSpec::All),
        );
        let order: Vec<(String, String)> = report
            .units
            .iter()
            .map(|u| (u.scan_date.to_string(), u.rule_id.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2024-03-06".to_string(), "alpha".to_string()),
                ("2024-03-06".to_string(), "zeta".to_string()),
                ("2024-03-07".to_string(), "alpha".to_string()),
                ("2024-03-07".to_string(), "zeta".to_string()),
                ("2024-03-08".to_string(), "alpha".to_string()),
                ("2024-03-08".to_string(), "zeta".to_string()),
            ]
        );
    }

    #[test]
    fn cancelled_scan_runs_nothing() {
        let source = three_days();
        let executed = source.queries.clone();
        let rule = rule(breakout_doc("r1"));
        let ctx = ScanContext::create(
            request(&[&rule], range(), UniverseSpec::All),
            Arc::new(source),
        )
        .unwrap();
        let pipeline = ScanPipeline::new(&fast_retry_config(1), Arc::new(InMemoryMonitor::new()));
        let token = CancellationToken::new();
        token.cancel();

        let report = pipeline.run(&ctx, std::slice::from_ref(&rule), &token).unwrap();
        assert_eq!(report.state, ScanState::Cancelled);
        assert!(report.units.iter().all(|u| u.status == UnitStatus::Cancelled));
        assert!(executed.lock().unwrap().is_empty());
    }

    #[test]
    fn released_context_cannot_run_again() {
        let rule = rule(breakout_doc("r1"));
        let ctx = ScanContext::create(
            request(&[&rule], range(), UniverseSpec::All),
            Arc::new(three_days()),
        )
        .unwrap();
        let pipeline = ScanPipeline::new(&fast_retry_config(1), Arc::new(InMemoryMonitor::new()));
        pipeline
            .run(&ctx, std::slice::from_ref(&rule), &CancellationToken::new())
            .unwrap();
        let again = pipeline.run(&ctx, std::slice::from_ref(&rule), &CancellationToken::new());
        assert!(again.is_err());
    }

    #[test]
    fn dates_without_bars_are_rejected() {
        let rule = rule(breakout_doc("r1"));
        let err = ScanContext::create(
            request(&[&rule], ScanDates::Single(date("2024-03-09")), UniverseSpec::All),
            Arc::new(three_days()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ContextError::NoTradingDates { .. }));
    }

    #[test]
    fn reversed_range_is_rejected() {
        let rule = rule(breakout_doc("r1"));
        let err = ScanContext::create(
            request(
                &[&rule],
                ScanDates::Range {
                    start: date("2024-03-08"),
                    end: date("2024-03-06"),
                },
                UniverseSpec::All,
            ),
            Arc::new(three_days()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ContextError::InvalidDateRange { .. }));
    }

    #[test]
    fn explicit_universe_binds_only_requested_symbols() {
        let source = three_days();
        let log = source.queries.clone();
        let rule = rule(breakout_doc("r1"));
        scan(
            Arc::new(source),
            &fast_retry_config(1),
            std::slice::from_ref(&rule),
            request(&[&rule], range(), UniverseSpec::Explicit(vec!["bhp".into()])),
        );
        let executed = log.lock().unwrap();
        assert_eq!(executed.len(), 3);
        assert!(executed.iter().all(|q| q.sql.contains(":sym_0")));
        assert!(executed.iter().all(|q| !q.sql.contains(":sym_1")));
    }
}
