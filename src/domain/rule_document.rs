//! Rule document codec.
//!
//! Converts the exchanged JSON representation into a typed [`RuleDefinition`]
//! and back. Parsing never stops at the first problem: every missing field,
//! wrong type and inconsistent range is collected so the validator can report
//! all of them at once.

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::{Map, Value, json};

use crate::domain::error::InputError;
use crate::domain::rule::{
    BreakoutParams, CompositeParams, CrpParams, DEFAULT_TRAILING_DAYS, RuleDefinition,
    RuleParameters, RuleStatus, RuleType, SCORING_MODEL_VERSION, ScoreComponent, ScoringModel,
    SignalPolicy, TechnicalParams, TimeWindow, UniverseFilter, VolumeParams,
};
use crate::domain::validation::ValidationIssue;

const TOP_LEVEL_KEYS: &[&str] = &[
    "id",
    "name",
    "rule_type",
    "version",
    "status",
    "author",
    "created_at",
    "updated_at",
    "parameters",
    "time_window",
    "universe_filter",
];

const POLICY_KEYS: &[&str] = &[
    "min_probability",
    "max_results_per_day",
    "stop_loss_pct",
    "take_profit_pct",
    "scoring",
];

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Outcome of reading a document: the typed rule when it is structurally
/// sound, plus every finding.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub id: Option<String>,
    pub version: Option<u32>,
    pub rule: Option<RuleDefinition>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Default)]
struct Findings {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Findings {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, message));
    }

    fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(field, message));
    }
}

/// Parse a JSON text. Only unparseable input is an error.
pub fn parse_str(text: &str) -> Result<ParsedDocument, InputError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| InputError::new(format!("not valid JSON: {e}")))?;
    parse_value(&value)
}

pub fn parse_value(value: &Value) -> Result<ParsedDocument, InputError> {
    let obj = value
        .as_object()
        .ok_or_else(|| InputError::new("rule document must be a JSON object"))?;

    let mut f = Findings::default();

    for key in obj.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            f.warn(key.clone(), "unknown field is ignored");
        }
    }

    let id = required_str(obj, "id", "id", &mut f);
    let name = required_str(obj, "name", "name", &mut f);
    let version = match obj.get("version") {
        None | Some(Value::Null) => Some(1),
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 && n <= u64::from(u32::MAX) => Some(n as u32),
            _ => {
                f.error("version", "must be a positive integer");
                None
            }
        },
    };
    let status = match obj.get("status") {
        None | Some(Value::Null) => Some(RuleStatus::Draft),
        Some(Value::String(s)) => match s.parse::<RuleStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                f.error("status", e);
                None
            }
        },
        Some(_) => {
            f.error("status", "must be a string");
            None
        }
    };
    let author = match obj.get("author") {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    let created_at = timestamp_field(obj, "created_at", &mut f);
    let updated_at = timestamp_field(obj, "updated_at", &mut f);

    let rule_type = match obj.get("rule_type") {
        None | Some(Value::Null) => {
            f.error("rule_type", "required field is missing");
            None
        }
        Some(Value::String(s)) => match s.parse::<RuleType>() {
            Ok(t) => Some(t),
            Err(e) => {
                f.error("rule_type", e);
                None
            }
        },
        Some(_) => {
            f.error("rule_type", "must be a string");
            None
        }
    };

    let params_obj = object_field(obj, "parameters", true, &mut f);
    let (parameters, policy, scoring) = match (rule_type, params_obj) {
        (Some(rule_type), Some(p)) => {
            let parameters = parse_parameters(rule_type, p, &mut f);
            let policy = parse_policy(p, &mut f);
            let scoring = parse_scoring(rule_type, p, &mut f);
            (parameters, policy, scoring)
        }
        _ => (None, None, None),
    };

    let time_window = object_field(obj, "time_window", true, &mut f)
        .and_then(|tw| parse_time_window(tw, &mut f));

    let universe_filter = match object_field(obj, "universe_filter", false, &mut f) {
        Some(u) => parse_universe_filter(u, &mut f),
        None => Some(UniverseFilter::default()),
    };

    let rule = if f.errors.is_empty() {
        match (
            id.clone(),
            name,
            version,
            status,
            parameters,
            policy,
            scoring,
            time_window,
            universe_filter,
        ) {
            (
                Some(id),
                Some(name),
                Some(version),
                Some(status),
                Some(parameters),
                Some(policy),
                Some(scoring),
                Some(time_window),
                Some(universe_filter),
            ) => {
                let now = Utc::now();
                let created_at = created_at.unwrap_or(now);
                Some(RuleDefinition {
                    id,
                    name,
                    version,
                    status,
                    parameters,
                    policy,
                    scoring,
                    time_window,
                    universe_filter,
                    author,
                    created_at,
                    updated_at: updated_at.unwrap_or(created_at),
                })
            }
            _ => None,
        }
    } else {
        None
    };

    Ok(ParsedDocument {
        id,
        version,
        rule,
        errors: f.errors,
        warnings: f.warnings,
    })
}

/// Strict conversion: any schema finding becomes an [`InputError`].
pub fn rule_from_value(value: &Value) -> Result<RuleDefinition, InputError> {
    let parsed = parse_value(value)?;
    match parsed.rule {
        Some(rule) => Ok(rule),
        None => {
            let reasons: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();
            Err(InputError::new(reasons.join("; ")))
        }
    }
}

pub fn rule_from_str(text: &str) -> Result<RuleDefinition, InputError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| InputError::new(format!("not valid JSON: {e}")))?;
    rule_from_value(&value)
}

/// Serialize a rule into its exchanged document form.
pub fn to_document(rule: &RuleDefinition) -> Value {
    let tw = &rule.time_window;
    let mut universe = Map::new();
    if let Some(v) = rule.universe_filter.min_price {
        universe.insert("min_price".into(), json!(v));
    }
    if let Some(v) = rule.universe_filter.max_price {
        universe.insert("max_price".into(), json!(v));
    }
    if let Some(v) = rule.universe_filter.min_volume {
        universe.insert("min_volume".into(), json!(v));
    }

    json!({
        "id": rule.id,
        "name": rule.name,
        "rule_type": rule.rule_type().as_str(),
        "version": rule.version,
        "status": rule.status.as_str(),
        "author": rule.author,
        "created_at": rule.created_at.to_rfc3339(),
        "updated_at": rule.updated_at.to_rfc3339(),
        "parameters": parameters_to_value(rule),
        "time_window": {
            "signal_window_start": format_time(tw.signal_window_start),
            "signal_window_end": format_time(tw.signal_window_end),
            "cutoff_time": format_time(tw.cutoff_time),
            "performance_start_time": format_time(tw.performance_start_time),
            "performance_end_time": format_time(tw.performance_end_time),
        },
        "universe_filter": Value::Object(universe),
    })
}

/// Type parameters, signal policy and scoring model as one JSON object.
/// Map keys are sorted, so the rendering is canonical.
pub fn parameters_to_value(rule: &RuleDefinition) -> Value {
    let mut m = Map::new();
    match &rule.parameters {
        RuleParameters::Breakout(p) => {
            m.insert("volume_multiplier_min".into(), json!(p.volume_multiplier_min));
            put_opt(&mut m, "volume_multiplier_max", p.volume_multiplier_max);
            put_opt(&mut m, "price_move_pct_min", p.price_move_pct_min);
            put_opt(&mut m, "price_move_pct_max", p.price_move_pct_max);
            m.insert("trailing_days".into(), json!(p.trailing_days));
        }
        RuleParameters::Crp(p) => {
            m.insert("close_threshold_pct".into(), json!(p.close_threshold_pct));
            m.insert("range_threshold_pct".into(), json!(p.range_threshold_pct));
            put_opt(&mut m, "volume_multiplier_min", p.volume_multiplier_min);
            m.insert("trailing_days".into(), json!(p.trailing_days));
        }
        RuleParameters::Technical(p) => {
            m.insert("rsi_period".into(), json!(p.rsi_period));
            m.insert("rsi_oversold".into(), json!(p.rsi_oversold));
            m.insert("rsi_overbought".into(), json!(p.rsi_overbought));
            m.insert("macd_fast".into(), json!(p.macd_fast));
            m.insert("macd_slow".into(), json!(p.macd_slow));
            m.insert("band_period".into(), json!(p.band_period));
            m.insert("band_std_dev".into(), json!(p.band_std_dev));
        }
        RuleParameters::Volume(p) => {
            m.insert("volume_multiplier_min".into(), json!(p.volume_multiplier_min));
            put_opt(&mut m, "volume_multiplier_max", p.volume_multiplier_max);
            m.insert("trailing_days".into(), json!(p.trailing_days));
        }
        RuleParameters::Composite(p) => {
            m.insert("volume_multiplier_min".into(), json!(p.volume_multiplier_min));
            m.insert("close_threshold_pct".into(), json!(p.close_threshold_pct));
            m.insert("range_threshold_pct".into(), json!(p.range_threshold_pct));
            m.insert("trailing_days".into(), json!(p.trailing_days));
        }
    }

    m.insert("min_probability".into(), json!(rule.policy.min_probability));
    if let Some(n) = rule.policy.max_results_per_day {
        m.insert("max_results_per_day".into(), json!(n));
    }
    put_opt(&mut m, "stop_loss_pct", rule.policy.stop_loss_pct);
    put_opt(&mut m, "take_profit_pct", rule.policy.take_profit_pct);

    let mut weights = Map::new();
    for (component, weight) in &rule.scoring.weights {
        weights.insert(component.as_str().into(), json!(weight));
    }
    m.insert(
        "scoring".into(),
        json!({ "version": rule.scoring.version, "weights": weights }),
    );

    Value::Object(m)
}

pub fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M:%S").to_string()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
        .ok()
}

fn put_opt(m: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        m.insert(key.into(), json!(v));
    }
}

fn required_str(obj: &Map<String, Value>, key: &str, path: &str, f: &mut Findings) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            f.error(path, "required field is missing");
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            f.error(path, "must not be empty");
            None
        }
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => {
            f.error(path, "must be a string");
            None
        }
    }
}

fn object_field<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    required: bool,
    f: &mut Findings,
) -> Option<&'a Map<String, Value>> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            if required {
                f.error(key, "required field is missing");
            }
            None
        }
        Some(Value::Object(m)) => Some(m),
        Some(_) => {
            f.error(key, "must be an object");
            None
        }
    }
}

fn timestamp_field(obj: &Map<String, Value>, key: &str, f: &mut Findings) -> Option<DateTime<Utc>> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(_) => {
                f.error(key, "must be an RFC 3339 timestamp");
                None
            }
        },
        Some(_) => {
            f.error(key, "must be an RFC 3339 timestamp");
            None
        }
    }
}

/// Outer `None`: absent. `Some(None)`: present but invalid (already reported).
fn number(obj: &Map<String, Value>, key: &str, path: &str, f: &mut Findings) -> Option<Option<f64>> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Some(Some(n)),
            _ => {
                f.error(format!("{path}.{key}"), "must be a number");
                Some(None)
            }
        },
    }
}

fn required_number(obj: &Map<String, Value>, key: &str, path: &str, f: &mut Findings) -> Option<f64> {
    match number(obj, key, path, f) {
        None => {
            f.error(format!("{path}.{key}"), "required field is missing");
            None
        }
        Some(v) => v,
    }
}

fn positive_number(obj: &Map<String, Value>, key: &str, path: &str, f: &mut Findings) -> Option<f64> {
    let value = number(obj, key, path, f).flatten();
    if let Some(v) = value {
        if v <= 0.0 {
            f.error(format!("{path}.{key}"), "must be positive");
        }
    }
    value
}

fn count(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    default: u32,
    f: &mut Findings,
) -> Option<u32> {
    match obj.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 && n <= 10_000 => Some(n as u32),
            _ => {
                f.error(format!("{path}.{key}"), "must be an integer between 1 and 10000");
                None
            }
        },
    }
}

fn check_range(
    min: Option<f64>,
    max: Option<f64>,
    min_key: &str,
    max_key: &str,
    path: &str,
    f: &mut Findings,
) {
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo >= hi {
            f.error(
                format!("{path}.{min_key}"),
                format!("{min_key} ({lo}) must be less than {max_key} ({hi})"),
            );
        }
    }
}

fn warn_unknown_keys(obj: &Map<String, Value>, known: &[&str], path: &str, f: &mut Findings) {
    for key in obj.keys() {
        if !known.contains(&key.as_str()) && !POLICY_KEYS.contains(&key.as_str()) {
            f.warn(format!("{path}.{key}"), "unknown parameter is ignored");
        }
    }
}

fn parse_parameters(
    rule_type: RuleType,
    p: &Map<String, Value>,
    f: &mut Findings,
) -> Option<RuleParameters> {
    const PATH: &str = "parameters";
    let errors_before = f.errors.len();

    let parameters = match rule_type {
        RuleType::Breakout => {
            warn_unknown_keys(
                p,
                &[
                    "volume_multiplier_min",
                    "volume_multiplier_max",
                    "price_move_pct_min",
                    "price_move_pct_max",
                    "trailing_days",
                ],
                PATH,
                f,
            );
            let vmin = required_number(p, "volume_multiplier_min", PATH, f);
            if matches!(vmin, Some(v) if v <= 0.0) {
                f.error("parameters.volume_multiplier_min", "must be positive");
            }
            let vmax = positive_number(p, "volume_multiplier_max", PATH, f);
            check_range(vmin, vmax, "volume_multiplier_min", "volume_multiplier_max", PATH, f);
            let pmin = number(p, "price_move_pct_min", PATH, f).flatten();
            if matches!(pmin, Some(v) if v < 0.0) {
                f.error("parameters.price_move_pct_min", "must be non-negative");
            }
            let pmax = positive_number(p, "price_move_pct_max", PATH, f);
            check_range(pmin, pmax, "price_move_pct_min", "price_move_pct_max", PATH, f);
            let trailing_days = count(p, "trailing_days", PATH, DEFAULT_TRAILING_DAYS, f);
            match (vmin, trailing_days) {
                (Some(volume_multiplier_min), Some(trailing_days)) => {
                    Some(RuleParameters::Breakout(BreakoutParams {
                        volume_multiplier_min,
                        volume_multiplier_max: vmax,
                        price_move_pct_min: pmin,
                        price_move_pct_max: pmax,
                        trailing_days,
                    }))
                }
                _ => None,
            }
        }
        RuleType::Crp => {
            warn_unknown_keys(
                p,
                &[
                    "close_threshold_pct",
                    "range_threshold_pct",
                    "volume_multiplier_min",
                    "trailing_days",
                ],
                PATH,
                f,
            );
            let close = required_number(p, "close_threshold_pct", PATH, f);
            let range = required_number(p, "range_threshold_pct", PATH, f);
            for (key, v) in [("close_threshold_pct", close), ("range_threshold_pct", range)] {
                if matches!(v, Some(x) if x <= 0.0 || x > 100.0) {
                    f.error(format!("{PATH}.{key}"), "must be in (0, 100]");
                }
            }
            let vmin = positive_number(p, "volume_multiplier_min", PATH, f);
            let trailing_days = count(p, "trailing_days", PATH, DEFAULT_TRAILING_DAYS, f);
            match (close, range, trailing_days) {
                (Some(close_threshold_pct), Some(range_threshold_pct), Some(trailing_days)) => {
                    Some(RuleParameters::Crp(CrpParams {
                        close_threshold_pct,
                        range_threshold_pct,
                        volume_multiplier_min: vmin,
                        trailing_days,
                    }))
                }
                _ => None,
            }
        }
        RuleType::Technical => {
            let d = TechnicalParams::default();
            warn_unknown_keys(
                p,
                &[
                    "rsi_period",
                    "rsi_oversold",
                    "rsi_overbought",
                    "macd_fast",
                    "macd_slow",
                    "band_period",
                    "band_std_dev",
                ],
                PATH,
                f,
            );
            let rsi_period = count(p, "rsi_period", PATH, d.rsi_period, f);
            let oversold = number(p, "rsi_oversold", PATH, f).unwrap_or(Some(d.rsi_oversold));
            let overbought = number(p, "rsi_overbought", PATH, f).unwrap_or(Some(d.rsi_overbought));
            for (key, v) in [("rsi_oversold", oversold), ("rsi_overbought", overbought)] {
                if matches!(v, Some(x) if !(0.0..=100.0).contains(&x)) {
                    f.error(format!("{PATH}.{key}"), "must be between 0 and 100");
                }
            }
            check_range(oversold, overbought, "rsi_oversold", "rsi_overbought", PATH, f);
            let fast = count(p, "macd_fast", PATH, d.macd_fast, f);
            let slow = count(p, "macd_slow", PATH, d.macd_slow, f);
            if let (Some(fast), Some(slow)) = (fast, slow) {
                if fast >= slow {
                    f.error(
                        "parameters.macd_fast",
                        format!("macd_fast ({fast}) must be less than macd_slow ({slow})"),
                    );
                }
            }
            let band_period = count(p, "band_period", PATH, d.band_period, f);
            let band_std_dev = match number(p, "band_std_dev", PATH, f) {
                None => Some(d.band_std_dev),
                Some(v) => v,
            };
            if matches!(band_std_dev, Some(x) if x <= 0.0) {
                f.error("parameters.band_std_dev", "must be positive");
            }
            match (rsi_period, oversold, overbought, fast, slow, band_period, band_std_dev) {
                (
                    Some(rsi_period),
                    Some(rsi_oversold),
                    Some(rsi_overbought),
                    Some(macd_fast),
                    Some(macd_slow),
                    Some(band_period),
                    Some(band_std_dev),
                ) => Some(RuleParameters::Technical(TechnicalParams {
                    rsi_period,
                    rsi_oversold,
                    rsi_overbought,
                    macd_fast,
                    macd_slow,
                    band_period,
                    band_std_dev,
                })),
                _ => None,
            }
        }
        RuleType::Volume => {
            warn_unknown_keys(
                p,
                &["volume_multiplier_min", "volume_multiplier_max", "trailing_days"],
                PATH,
                f,
            );
            let vmin = required_number(p, "volume_multiplier_min", PATH, f);
            if matches!(vmin, Some(v) if v <= 0.0) {
                f.error("parameters.volume_multiplier_min", "must be positive");
            }
            let vmax = positive_number(p, "volume_multiplier_max", PATH, f);
            check_range(vmin, vmax, "volume_multiplier_min", "volume_multiplier_max", PATH, f);
            let trailing_days = count(p, "trailing_days", PATH, DEFAULT_TRAILING_DAYS, f);
            match (vmin, trailing_days) {
                (Some(volume_multiplier_min), Some(trailing_days)) => {
                    Some(RuleParameters::Volume(VolumeParams {
                        volume_multiplier_min,
                        volume_multiplier_max: vmax,
                        trailing_days,
                    }))
                }
                _ => None,
            }
        }
        RuleType::Composite => {
            warn_unknown_keys(
                p,
                &[
                    "volume_multiplier_min",
                    "close_threshold_pct",
                    "range_threshold_pct",
                    "trailing_days",
                ],
                PATH,
                f,
            );
            let vmin = required_number(p, "volume_multiplier_min", PATH, f);
            if matches!(vmin, Some(v) if v <= 0.0) {
                f.error("parameters.volume_multiplier_min", "must be positive");
            }
            let close = required_number(p, "close_threshold_pct", PATH, f);
            let range = required_number(p, "range_threshold_pct", PATH, f);
            for (key, v) in [("close_threshold_pct", close), ("range_threshold_pct", range)] {
                if matches!(v, Some(x) if x <= 0.0 || x > 100.0) {
                    f.error(format!("{PATH}.{key}"), "must be in (0, 100]");
                }
            }
            let trailing_days = count(p, "trailing_days", PATH, DEFAULT_TRAILING_DAYS, f);
            match (vmin, close, range, trailing_days) {
                (
                    Some(volume_multiplier_min),
                    Some(close_threshold_pct),
                    Some(range_threshold_pct),
                    Some(trailing_days),
                ) => Some(RuleParameters::Composite(CompositeParams {
                    volume_multiplier_min,
                    close_threshold_pct,
                    range_threshold_pct,
                    trailing_days,
                })),
                _ => None,
            }
        }
    };

    if f.errors.len() > errors_before {
        None
    } else {
        parameters
    }
}

fn parse_policy(p: &Map<String, Value>, f: &mut Findings) -> Option<SignalPolicy> {
    const PATH: &str = "parameters";
    let errors_before = f.errors.len();
    let defaults = SignalPolicy::default();

    let min_probability = match number(p, "min_probability", PATH, f) {
        None => defaults.min_probability,
        Some(Some(v)) if (0.0..=100.0).contains(&v) => v,
        Some(Some(_)) => {
            f.error("parameters.min_probability", "must be between 0 and 100");
            defaults.min_probability
        }
        Some(None) => defaults.min_probability,
    };

    let max_results_per_day = match p.get("max_results_per_day") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => Some(n as usize),
            _ => {
                f.error("parameters.max_results_per_day", "must be a positive integer");
                None
            }
        },
    };

    let stop_loss_pct = number(p, "stop_loss_pct", PATH, f).flatten();
    if matches!(stop_loss_pct, Some(v) if v <= 0.0 || v >= 100.0) {
        f.error("parameters.stop_loss_pct", "must be in (0, 100)");
    }
    let take_profit_pct = positive_number(p, "take_profit_pct", PATH, f);

    if f.errors.len() > errors_before {
        None
    } else {
        Some(SignalPolicy {
            min_probability,
            max_results_per_day,
            stop_loss_pct,
            take_profit_pct,
        })
    }
}

fn parse_scoring(rule_type: RuleType, p: &Map<String, Value>, f: &mut Findings) -> Option<ScoringModel> {
    let scoring = match p.get("scoring") {
        None | Some(Value::Null) => return Some(ScoringModel::default_for(rule_type)),
        Some(Value::Object(m)) => m,
        Some(_) => {
            f.error("parameters.scoring", "must be an object");
            return None;
        }
    };

    let version = match scoring.get("version") {
        None | Some(Value::Null) => SCORING_MODEL_VERSION,
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 && n <= u64::from(u32::MAX) => n as u32,
            _ => {
                f.error("parameters.scoring.version", "must be a positive integer");
                return None;
            }
        },
    };

    let weights_obj = match scoring.get("weights") {
        None | Some(Value::Null) => {
            let mut model = ScoringModel::default_for(rule_type);
            model.version = version;
            return Some(model);
        }
        Some(Value::Object(m)) => m,
        Some(_) => {
            f.error("parameters.scoring.weights", "must be an object");
            return None;
        }
    };

    let allowed = ScoringModel::components_for(rule_type);
    let errors_before = f.errors.len();
    let mut weights = Vec::new();
    for (name, raw) in weights_obj {
        let path = format!("parameters.scoring.weights.{name}");
        let component = match name.parse::<ScoreComponent>() {
            Ok(c) if allowed.contains(&c) => c,
            Ok(_) => {
                f.error(path, format!("component is not scored for {rule_type} rules"));
                continue;
            }
            Err(e) => {
                f.error(path, e);
                continue;
            }
        };
        match raw.as_f64() {
            Some(w) if (0.0..=1.0).contains(&w) => weights.push((component, w)),
            _ => f.error(path, "weight must be a number between 0 and 1"),
        }
    }

    if f.errors.len() > errors_before {
        return None;
    }

    // keep the canonical component order of the rule type
    weights.sort_by_key(|(c, _)| allowed.iter().position(|a| a == c));
    let model = ScoringModel { version, weights };
    if (model.total_weight() - 1.0).abs() > WEIGHT_TOLERANCE {
        f.error(
            "parameters.scoring.weights",
            format!("weights must sum to 1.0, got {:.4}", model.total_weight()),
        );
        return None;
    }
    Some(model)
}

fn parse_time_window(tw: &Map<String, Value>, f: &mut Findings) -> Option<TimeWindow> {
    let mut read = |key: &str| -> Option<NaiveTime> {
        let path = format!("time_window.{key}");
        match tw.get(key) {
            None | Some(Value::Null) => {
                f.error(path, "required field is missing");
                None
            }
            Some(Value::String(s)) => match parse_time(s) {
                Some(t) => Some(t),
                None => {
                    f.error(path, format!("'{s}' is not a time (expected HH:MM or HH:MM:SS)"));
                    None
                }
            },
            Some(_) => {
                f.error(path, "must be a time string");
                None
            }
        }
    };

    let start = read("signal_window_start");
    let end = read("signal_window_end");
    let cutoff = read("cutoff_time");
    let perf_start = read("performance_start_time");
    let perf_end = read("performance_end_time");

    let errors_before = f.errors.len();
    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            f.error(
                "time_window.signal_window_start",
                "signal_window_start must be before signal_window_end",
            );
        }
    }
    if let (Some(e), Some(c)) = (end, cutoff) {
        if e > c {
            f.error(
                "time_window.signal_window_end",
                "signal_window_end must not be after cutoff_time",
            );
        }
    }
    if let (Some(c), Some(ps)) = (cutoff, perf_start) {
        if c > ps {
            f.error(
                "time_window.cutoff_time",
                "cutoff_time must not be after performance_start_time",
            );
        }
    }
    if let (Some(ps), Some(pe)) = (perf_start, perf_end) {
        if ps >= pe {
            f.error(
                "time_window.performance_start_time",
                "performance_start_time must be before performance_end_time",
            );
        }
    }

    match (start, end, cutoff, perf_start, perf_end) {
        (Some(s), Some(e), Some(c), Some(ps), Some(pe)) if f.errors.len() == errors_before => {
            Some(TimeWindow {
                signal_window_start: s,
                signal_window_end: e,
                cutoff_time: c,
                performance_start_time: ps,
                performance_end_time: pe,
            })
        }
        _ => None,
    }
}

fn parse_universe_filter(u: &Map<String, Value>, f: &mut Findings) -> Option<UniverseFilter> {
    const PATH: &str = "universe_filter";
    let errors_before = f.errors.len();
    for key in u.keys() {
        if !["min_price", "max_price", "min_volume"].contains(&key.as_str()) {
            f.warn(format!("{PATH}.{key}"), "unknown filter is ignored");
        }
    }

    let min_price = number(u, "min_price", PATH, f).flatten();
    let max_price = number(u, "max_price", PATH, f).flatten();
    for (key, v) in [("min_price", min_price), ("max_price", max_price)] {
        if matches!(v, Some(x) if x < 0.0) {
            f.error(format!("{PATH}.{key}"), "must be non-negative");
        }
    }
    check_range(min_price, max_price, "min_price", "max_price", PATH, f);

    let min_volume = match u.get("min_volume") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n),
            _ => {
                f.error("universe_filter.min_volume", "must be a non-negative integer");
                None
            }
        },
    };

    if f.errors.len() > errors_before {
        None
    } else {
        Some(UniverseFilter {
            min_price,
            max_price,
            min_volume,
        })
    }
}
