//! Rule query compilation.
//!
//! A rule plus a scan scope compiles into one parameterized aggregation query
//! over the `bars` table. The query is a chain of CTEs:
//!
//! 1. `window_bars`: bars of the scan date inside the effective time window
//!    and the universe
//! 2. `window_agg` / `session`: per-symbol open (first), high (max), low (min),
//!    close (last at cutoff) and volume (sum), with price and volume bounds
//! 3. `lookback_dates` / `prior_days` / `trailing`: the same intraday window on
//!    the preceding trading days, giving the trailing average volume and the
//!    prior high/low
//! 4. rule-type metrics and component scores (`scored`)
//! 5. `performance`: last close inside the performance window
//! 6. `ranked`: weighted probability score, threshold, ordering and limit
//!
//! Identical inputs always render byte-identical SQL and parameters.

use chrono::{NaiveDate, NaiveTime};
use std::fmt::Write as _;

use crate::domain::config::ScannerConfig;
use crate::domain::error::QueryBuildError;
use crate::domain::rule::{
    BreakoutParams, CompositeParams, CrpParams, RuleDefinition, RuleParameters, RuleType,
    TechnicalParams, VolumeParams,
};

/// Price-move percentage that earns a full price-move score when the rule
/// sets no `price_move_pct_max`.
pub const DEFAULT_PRICE_MOVE_CEILING_PCT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

/// SQL text plus named parameters in first-use order. Names carry their
/// leading `:`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedQuery {
    pub rule_id: String,
    pub rule_version: u32,
    pub scan_date: NaiveDate,
    pub sql: String,
    pub params: Vec<(String, SqlValue)>,
}

impl ParameterizedQuery {
    pub fn param(&self, name: &str) -> Option<&SqlValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// The slice of a scan context one query needs.
#[derive(Debug, Clone, Copy)]
pub struct QueryScope<'a> {
    pub scan_date: NaiveDate,
    pub cutoff_time: Option<NaiveTime>,
    pub end_of_day_time: NaiveTime,
    pub universe: &'a [String],
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    supported: Vec<RuleType>,
    max_results_per_day: usize,
}

impl QueryBuilder {
    pub fn new(supported: Vec<RuleType>, max_results_per_day: usize) -> Self {
        Self {
            supported,
            max_results_per_day,
        }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(RuleType::ALL.to_vec(), config.scanner.max_results_per_day)
    }

    pub fn build_query(
        &self,
        rule: &RuleDefinition,
        scope: &QueryScope<'_>,
    ) -> Result<ParameterizedQuery, QueryBuildError> {
        let rule_type = rule.rule_type();
        if !self.supported.contains(&rule_type) {
            return Err(QueryBuildError::UnsupportedRuleType {
                rule_type: rule_type.to_string(),
            });
        }

        let invalid = |reason: String| QueryBuildError::InvalidWindow {
            rule_id: rule.id.clone(),
            reason,
        };

        let tw = &rule.time_window;
        let window_end = match scope.cutoff_time {
            Some(cutoff) => tw.signal_window_end.min(cutoff),
            None => tw.signal_window_end,
        };
        if window_end <= tw.signal_window_start {
            return Err(invalid(format!(
                "effective window {}..{} is empty",
                tw.signal_window_start, window_end
            )));
        }
        let performance_end = tw.performance_end_time.min(scope.end_of_day_time);
        if let (Some(lo), Some(hi)) = (rule.universe_filter.min_price, rule.universe_filter.max_price) {
            if lo > hi {
                return Err(invalid(format!("min_price {lo} exceeds max_price {hi}")));
            }
        }
        let mut universe: Vec<&str> = scope.universe.iter().map(String::as_str).collect();
        universe.sort_unstable();
        universe.dedup();
        if universe.is_empty() {
            return Err(invalid("symbol universe is empty".to_string()));
        }
        let max_results = rule
            .policy
            .max_results_per_day
            .unwrap_or(self.max_results_per_day);
        if max_results == 0 {
            return Err(invalid("max_results_per_day is zero".to_string()));
        }

        let mut w = QueryWriter::default();
        let window = WindowBinds {
            scan_date: w.text("scan_date", scope.scan_date.format("%Y-%m-%d").to_string()),
            start: w.text("window_start", time_text(tw.signal_window_start)),
            end: w.text("window_end", time_text(window_end)),
        };
        let symbols: Vec<String> = universe
            .iter()
            .enumerate()
            .map(|(i, s)| w.text(&format!("sym_{i}"), *s))
            .collect();
        let symbols = symbols.join(", ");

        let mut ctes = common_stages(&mut w, rule, &window, &symbols);
        match &rule.parameters {
            RuleParameters::Breakout(p) => ctes.extend(breakout_stages(&mut w, p)),
            RuleParameters::Crp(p) => ctes.extend(crp_stages(&mut w, p)),
            RuleParameters::Technical(p) => ctes.extend(technical_stages(&mut w, p, &window)),
            RuleParameters::Volume(p) => ctes.extend(volume_stages(&mut w, p)),
            RuleParameters::Composite(p) => ctes.extend(composite_stages(&mut w, p)),
        }

        let perf_start = w.text("perf_start", time_text(tw.performance_start_time));
        let perf_end = w.text("perf_end", time_text(performance_end));
        ctes.push(format!(
            "perf_last AS (
    SELECT symbol, MAX(timestamp) AS last_ts
    FROM bars
    WHERE date_partition = {scan_date}
      AND time(timestamp) >= {perf_start}
      AND time(timestamp) <= {perf_end}
      AND symbol IN (SELECT symbol FROM scored)
    GROUP BY symbol
)",
            scan_date = window.scan_date,
        ));
        ctes.push(
            "performance AS (
    SELECT pl.symbol, b.close AS performance_close
    FROM perf_last pl
    JOIN bars b ON b.symbol = pl.symbol AND b.timestamp = pl.last_ts
)"
            .to_string(),
        );

        let mut terms = Vec::new();
        for (component, weight) in &rule.scoring.weights {
            let bind = w.real(&format!("weight_{}", component.as_str()), *weight);
            terms.push(format!("{bind} * s.{}", component.column()));
        }
        let score = if terms.is_empty() {
            "0.0".to_string()
        } else {
            terms.join(" + ")
        };
        ctes.push(format!(
            "ranked AS (
    SELECT s.*,
           p.performance_close,
           CASE WHEN p.performance_close IS NOT NULL
                THEN (p.performance_close - s.close) * 100.0 / s.close END AS performance_return_pct,
           ROUND({score}, 4) AS probability_score
    FROM scored s
    LEFT JOIN performance p ON p.symbol = s.symbol
)"
        ));

        let min_probability = w.real("min_probability", rule.policy.min_probability);
        let limit = w.int("max_results", max_results as i64);

        let mut sql = String::from("WITH ");
        sql.push_str(&ctes.join(",\n"));
        let _ = write!(
            sql,
            "\nSELECT * FROM ranked
WHERE probability_score >= {min_probability}
ORDER BY probability_score DESC, symbol ASC
LIMIT {limit}"
        );

        Ok(ParameterizedQuery {
            rule_id: rule.id.clone(),
            rule_version: rule.version,
            scan_date: scope.scan_date,
            sql,
            params: w.params,
        })
    }
}

fn time_text(t: NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

#[derive(Default)]
struct QueryWriter {
    params: Vec<(String, SqlValue)>,
}

impl QueryWriter {
    /// Register a parameter on first use and return its placeholder.
    fn bind(&mut self, name: &str, value: SqlValue) -> String {
        let placeholder = format!(":{name}");
        if !self.params.iter().any(|(n, _)| *n == placeholder) {
            self.params.push((placeholder.clone(), value));
        }
        placeholder
    }

    fn real(&mut self, name: &str, value: f64) -> String {
        self.bind(name, SqlValue::Real(value))
    }

    fn int(&mut self, name: &str, value: i64) -> String {
        self.bind(name, SqlValue::Integer(value))
    }

    fn text(&mut self, name: &str, value: impl Into<String>) -> String {
        self.bind(name, SqlValue::Text(value.into()))
    }
}

struct WindowBinds {
    scan_date: String,
    start: String,
    end: String,
}

/// Window aggregation and trailing baseline, ending in `base`.
fn common_stages(
    w: &mut QueryWriter,
    rule: &RuleDefinition,
    window: &WindowBinds,
    symbols: &str,
) -> Vec<String> {
    let WindowBinds {
        scan_date,
        start,
        end,
    } = window;
    let filter = &rule.universe_filter;

    let mut ctes = vec![format!(
        "window_bars AS (
    SELECT symbol, timestamp, open, high, low, close, volume
    FROM bars
    WHERE date_partition = {scan_date}
      AND time(timestamp) >= {start}
      AND time(timestamp) <= {end}
      AND symbol IN ({symbols})
)"
    )];

    let having = match filter.min_volume {
        Some(v) => format!("\n    HAVING SUM(volume) >= {}", w.int("min_volume", v)),
        None => String::new(),
    };
    ctes.push(format!(
        "window_agg AS (
    SELECT symbol,
           MIN(timestamp) AS first_ts,
           MAX(timestamp) AS last_ts,
           MAX(high) AS high,
           MIN(low) AS low,
           SUM(volume) AS volume
    FROM window_bars
    GROUP BY symbol{having}
)"
    ));

    let mut price_bounds = Vec::new();
    if let Some(v) = filter.min_price {
        price_bounds.push(format!("l.close >= {}", w.real("min_price", v)));
    }
    if let Some(v) = filter.max_price {
        price_bounds.push(format!("l.close <= {}", w.real("max_price", v)));
    }
    let price_where = if price_bounds.is_empty() {
        String::new()
    } else {
        format!("\n    WHERE {}", price_bounds.join(" AND "))
    };
    ctes.push(format!(
        "session AS (
    SELECT a.symbol, f.open AS open, a.high, a.low, l.close AS close, a.volume
    FROM window_agg a
    JOIN window_bars f ON f.symbol = a.symbol AND f.timestamp = a.first_ts
    JOIN window_bars l ON l.symbol = a.symbol AND l.timestamp = a.last_ts{price_where}
)"
    ));

    let lookback = w.int("lookback_days", i64::from(rule.parameters.lookback_days()));
    ctes.push(format!(
        "lookback_dates AS (
    SELECT DISTINCT date_partition AS d
    FROM bars
    WHERE date_partition < {scan_date}
    ORDER BY d DESC
    LIMIT {lookback}
)"
    ));
    ctes.push(format!(
        "prior_days AS (
    SELECT b.symbol, b.date_partition AS d,
           SUM(b.volume) AS volume,
           MAX(b.high) AS high,
           MIN(b.low) AS low
    FROM bars b
    JOIN lookback_dates ld ON ld.d = b.date_partition
    WHERE b.symbol IN (SELECT symbol FROM session)
      AND time(b.timestamp) >= {start}
      AND time(b.timestamp) <= {end}
    GROUP BY b.symbol, b.date_partition
)"
    ));
    ctes.push(
        "trailing AS (
    SELECT symbol,
           AVG(volume) AS avg_volume,
           MAX(high) AS prior_high,
           MIN(low) AS prior_low,
           COUNT(*) AS trailing_days
    FROM prior_days
    GROUP BY symbol
)"
        .to_string(),
    );
    ctes.push(
        "base AS (
    SELECT s.symbol, s.open, s.high, s.low, s.close, s.volume,
           t.avg_volume, t.prior_high, t.prior_low, t.trailing_days,
           CAST(s.volume AS REAL) / t.avg_volume AS volume_ratio
    FROM session s
    JOIN trailing t ON t.symbol = s.symbol
    WHERE t.avg_volume > 0
)"
        .to_string(),
    );
    ctes
}

const CLOSE_STRENGTH: &str = "CASE WHEN b.high > b.low
                THEN (b.close - b.low) * 100.0 / (b.high - b.low)
                ELSE 50.0 END AS close_strength";

const TIERED_VOLUME_SCORE: &str = "CASE WHEN m.volume_ratio >= 3.0 THEN 100.0
                WHEN m.volume_ratio >= 2.0 THEN 75.0
                WHEN m.volume_ratio >= 1.5 THEN 50.0
                WHEN m.volume_ratio >= 1.0 THEN 25.0
                ELSE 0.0 END AS volume_score";

fn range_tightness_score(range: &str) -> String {
    format!(
        "CASE WHEN m.range_pct <= {range} / 2.0 THEN 100.0
                WHEN m.range_pct <= {range} THEN 70.0
                WHEN m.range_pct <= {range} * 2.0 THEN 30.0
                ELSE 0.0 END AS range_tightness_score"
    )
}

fn ratio_bounds(w: &mut QueryWriter, min: f64, max: Option<f64>) -> (String, Vec<String>) {
    let min = w.real("volume_multiplier_min", min);
    let mut conditions = vec![format!("m.volume_ratio >= {min}")];
    if let Some(max) = max {
        conditions.push(format!("m.volume_ratio <= {}", w.real("volume_multiplier_max", max)));
    }
    (min, conditions)
}

fn breakout_stages(w: &mut QueryWriter, p: &BreakoutParams) -> Vec<String> {
    let metrics = format!(
        "metrics AS (
    SELECT b.*,
           CASE WHEN b.high - b.open >= b.open - b.low THEN 'long' ELSE 'short' END AS direction,
           MAX(b.high - b.open, b.open - b.low) * 100.0 / b.open AS price_move_pct,
           CASE WHEN b.high - b.open >= b.open - b.low
                THEN (b.high - b.prior_high) * 100.0 / b.prior_high
                ELSE (b.prior_low - b.low) * 100.0 / b.prior_low END AS resistance_break_pct,
           {CLOSE_STRENGTH}
    FROM base b
)"
    );

    let (min, mut conditions) = ratio_bounds(w, p.volume_multiplier_min, p.volume_multiplier_max);
    if let Some(v) = p.price_move_pct_min {
        conditions.push(format!("m.price_move_pct >= {}", w.real("price_move_pct_min", v)));
    }
    let ceiling = match p.price_move_pct_max {
        Some(v) => {
            let bind = w.real("price_move_pct_max", v);
            conditions.push(format!("m.price_move_pct <= {bind}"));
            bind
        }
        None => w.real("price_move_ceiling", DEFAULT_PRICE_MOVE_CEILING_PCT),
    };

    let scored = format!(
        "scored AS (
    SELECT m.*,
           MIN(100.0, m.volume_ratio * 100.0 / (2.0 * {min})) AS volume_score,
           MIN(100.0, m.price_move_pct * 100.0 / {ceiling}) AS price_move_score,
           CASE WHEN m.resistance_break_pct > 0
                THEN MIN(100.0, 50.0 + 25.0 * m.resistance_break_pct)
                ELSE 0.0 END AS breakout_score,
           CASE WHEN m.direction = 'long' THEN m.close_strength
                ELSE 100.0 - m.close_strength END AS close_strength_score
    FROM metrics m
    WHERE {}
)",
        conditions.join("\n      AND ")
    );
    vec![metrics, scored]
}

fn crp_stages(w: &mut QueryWriter, p: &CrpParams) -> Vec<String> {
    let close = w.real("close_threshold_pct", p.close_threshold_pct);
    let range = w.real("range_threshold_pct", p.range_threshold_pct);

    let metrics = "metrics AS (
    SELECT b.*,
           (b.high - b.close) * 100.0 / b.high AS distance_from_high_pct,
           (b.close - b.low) * 100.0 / b.low AS distance_from_low_pct,
           (b.high - b.low) * 100.0 / b.close AS range_pct,
           (b.close - b.open) * 100.0 / b.open AS momentum_pct
    FROM base b
)"
    .to_string();
    let positioned = format!(
        "positioned AS (
    SELECT m.*,
           CASE WHEN m.distance_from_high_pct <= {close} THEN 'Near High'
                WHEN m.distance_from_low_pct <= {close} THEN 'Near Low'
                ELSE 'Middle' END AS close_position,
           CASE WHEN m.distance_from_high_pct <= m.distance_from_low_pct
                THEN m.distance_from_high_pct
                ELSE m.distance_from_low_pct END AS close_distance_pct
    FROM metrics m
)"
    );

    let mut conditions = vec!["m.close_position <> 'Middle'".to_string()];
    if let Some(v) = p.volume_multiplier_min {
        conditions.push(format!(
            "m.volume_ratio >= {}",
            w.real("volume_multiplier_min", v)
        ));
    }
    let scored = format!(
        "scored AS (
    SELECT m.*,
           CASE WHEN m.close_position = 'Near High' THEN 'long' ELSE 'short' END AS direction,
           CASE WHEN m.close_distance_pct <= {close} / 2.0 THEN 100.0
                ELSE 70.0 END AS close_position_score,
           {range_score},
           {TIERED_VOLUME_SCORE},
           CASE WHEN (m.close_position = 'Near High' AND m.momentum_pct >= 0)
                  OR (m.close_position = 'Near Low' AND m.momentum_pct <= 0)
                THEN MIN(100.0, 50.0 + ABS(m.momentum_pct) * 25.0)
                ELSE MAX(0.0, 50.0 - ABS(m.momentum_pct) * 25.0) END AS momentum_score
    FROM positioned m
    WHERE {}
)",
        conditions.join("\n      AND "),
        range_score = range_tightness_score(&range),
    );
    vec![metrics, positioned, scored]
}

fn technical_stages(w: &mut QueryWriter, p: &TechnicalParams, window: &WindowBinds) -> Vec<String> {
    let scan_date = &window.scan_date;
    let rsi_period = w.int("rsi_period", i64::from(p.rsi_period));
    let min_obs = w.int("min_observations", i64::from(p.rsi_period) + 1);
    let fast = w.int("macd_fast", i64::from(p.macd_fast));
    let slow = w.int("macd_slow", i64::from(p.macd_slow));
    let band_period = w.int("band_period", i64::from(p.band_period));
    let band_sq = w.real("band_std_dev_squared", p.band_std_dev * p.band_std_dev);
    let oversold = w.real("rsi_oversold", p.rsi_oversold);
    let overbought = w.real("rsi_overbought", p.rsi_overbought);

    vec![
        format!(
            "daily_closes AS (
    SELECT b.symbol, b.date_partition AS d, b.close
    FROM bars b
    JOIN (
        SELECT symbol, date_partition, MAX(timestamp) AS last_ts
        FROM bars
        WHERE date_partition IN (SELECT d FROM lookback_dates)
          AND symbol IN (SELECT symbol FROM base)
        GROUP BY symbol, date_partition
    ) x ON x.symbol = b.symbol AND x.last_ts = b.timestamp
    UNION ALL
    SELECT symbol, {scan_date} AS d, close FROM base
)"
        ),
        "series AS (
    SELECT symbol, d, close,
           close - LAG(close) OVER (PARTITION BY symbol ORDER BY d) AS delta,
           ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY d DESC) AS recency
    FROM daily_closes
)"
        .to_string(),
        format!(
            "indicators AS (
    SELECT symbol,
           AVG(CASE WHEN recency <= {rsi_period} AND delta IS NOT NULL
                    THEN MAX(delta, 0.0) END) AS avg_gain,
           AVG(CASE WHEN recency <= {rsi_period} AND delta IS NOT NULL
                    THEN MAX(-delta, 0.0) END) AS avg_loss,
           AVG(CASE WHEN recency <= {fast} THEN close END) AS sma_fast,
           AVG(CASE WHEN recency <= {slow} THEN close END) AS sma_slow,
           AVG(CASE WHEN recency <= {band_period} THEN close END) AS band_mean,
           AVG(CASE WHEN recency <= {band_period} THEN close * close END) AS band_mean_sq,
           COUNT(*) AS observations
    FROM series
    GROUP BY symbol
    HAVING COUNT(*) >= {min_obs}
)"
        ),
        "metrics AS (
    SELECT b.*,
           CASE WHEN i.avg_gain = 0 AND i.avg_loss = 0 THEN 50.0
                WHEN i.avg_loss = 0 THEN 100.0
                ELSE 100.0 - 100.0 / (1.0 + i.avg_gain / i.avg_loss) END AS rsi,
           (i.sma_fast - i.sma_slow) * 100.0 / i.sma_slow AS macd_pct,
           i.band_mean,
           i.band_mean_sq - i.band_mean * i.band_mean AS band_variance
    FROM base b
    JOIN indicators i ON i.symbol = b.symbol
)"
        .to_string(),
        format!(
            "banded AS (
    SELECT m.*,
           CASE WHEN m.band_variance > 0
                THEN (m.close - m.band_mean) * ABS(m.close - m.band_mean) / m.band_variance
                ELSE 0.0 END AS band_z_sq,
           CASE WHEN m.rsi <= {oversold}
                  OR (m.rsi < {overbought}
                      AND m.band_variance > 0 AND m.close < m.band_mean)
                THEN 'long' ELSE 'short' END AS direction
    FROM metrics m
)"
        ),
        format!(
            "scored AS (
    SELECT m.*,
           CASE WHEN m.rsi <= {oversold} THEN MIN(100.0, 70.0 + ({oversold} - m.rsi) * 3.0)
                WHEN m.rsi >= {overbought} THEN MIN(100.0, 70.0 + (m.rsi - {overbought}) * 3.0)
                ELSE 0.0 END AS rsi_score,
           MIN(100.0, ABS(m.band_z_sq) * 100.0 / {band_sq}) AS band_score,
           CASE WHEN (m.direction = 'long' AND m.macd_pct >= 0)
                  OR (m.direction = 'short' AND m.macd_pct <= 0)
                THEN MIN(100.0, 50.0 + ABS(m.macd_pct) * 10.0)
                ELSE MAX(0.0, 50.0 - ABS(m.macd_pct) * 10.0) END AS macd_score,
           MIN(100.0, m.volume_ratio * 50.0) AS volume_score
    FROM banded m
    WHERE m.rsi <= {oversold}
       OR m.rsi >= {overbought}
       OR ABS(m.band_z_sq) >= {band_sq}
)"
        ),
    ]
}

fn volume_stages(w: &mut QueryWriter, p: &VolumeParams) -> Vec<String> {
    let metrics = format!(
        "metrics AS (
    SELECT b.*,
           CASE WHEN b.close >= b.open THEN 'long' ELSE 'short' END AS direction,
           {CLOSE_STRENGTH}
    FROM base b
)"
    );
    let (min, conditions) = ratio_bounds(w, p.volume_multiplier_min, p.volume_multiplier_max);
    let scored = format!(
        "scored AS (
    SELECT m.*,
           MIN(100.0, m.volume_ratio * 100.0 / (2.0 * {min})) AS volume_score,
           CASE WHEN m.direction = 'long' THEN m.close_strength
                ELSE 100.0 - m.close_strength END AS close_strength_score
    FROM metrics m
    WHERE {}
)",
        conditions.join("\n      AND ")
    );
    vec![metrics, scored]
}

fn composite_stages(w: &mut QueryWriter, p: &CompositeParams) -> Vec<String> {
    let close = w.real("close_threshold_pct", p.close_threshold_pct);
    let range = w.real("range_threshold_pct", p.range_threshold_pct);
    let (min, conditions) = ratio_bounds(w, p.volume_multiplier_min, None);

    let metrics = "metrics AS (
    SELECT b.*,
           (b.high - b.close) * 100.0 / b.high AS distance_from_high_pct,
           (b.close - b.low) * 100.0 / b.low AS distance_from_low_pct,
           (b.high - b.low) * 100.0 / b.close AS range_pct,
           (b.close - b.open) * 100.0 / b.open AS momentum_pct,
           CASE WHEN b.close >= b.open THEN 'long' ELSE 'short' END AS direction,
           CASE WHEN b.close >= b.open
                THEN (b.high - b.prior_high) * 100.0 / b.prior_high
                ELSE (b.prior_low - b.low) * 100.0 / b.prior_low END AS resistance_break_pct
    FROM base b
)"
    .to_string();
    let positioned = format!(
        "positioned AS (
    SELECT m.*,
           CASE WHEN m.distance_from_high_pct <= {close} THEN 'Near High'
                WHEN m.distance_from_low_pct <= {close} THEN 'Near Low'
                ELSE 'Middle' END AS close_position,
           CASE WHEN m.distance_from_high_pct <= m.distance_from_low_pct
                THEN m.distance_from_high_pct
                ELSE m.distance_from_low_pct END AS close_distance_pct
    FROM metrics m
)"
    );
    let scored = format!(
        "scored AS (
    SELECT m.*,
           MIN(100.0, m.volume_ratio * 100.0 / (2.0 * {min})) AS volume_score,
           CASE WHEN m.close_position = 'Middle' THEN 0.0
                WHEN m.close_distance_pct <= {close} / 2.0 THEN 100.0
                ELSE 70.0 END AS close_position_score,
           {range_score},
           CASE WHEN m.resistance_break_pct > 0
                THEN MIN(100.0, 50.0 + 25.0 * m.resistance_break_pct)
                ELSE 0.0 END AS breakout_score,
           MIN(100.0, 50.0 + ABS(m.momentum_pct) * 25.0) AS momentum_score
    FROM positioned m
    WHERE {}
)",
        conditions.join("\n      AND "),
        range_score = range_tightness_score(&range),
    );
    vec![metrics, positioned, scored]
}
