//! Rule validation.
//!
//! Four checks, each producing one [`ValidationReport`]: schema, cross-rule,
//! performance and environment. Findings are data; only a document that is
//! not a JSON object at all is rejected with [`InputError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::config::EnvironmentProfile;
use crate::domain::error::InputError;
use crate::domain::rule::{RuleDefinition, RuleStatus};
use crate::domain::rule_document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationType {
    Schema,
    CrossRule,
    Performance,
    Environment,
}

impl ValidationType {
    pub const ALL: [ValidationType; 4] = [
        ValidationType::Schema,
        ValidationType::CrossRule,
        ValidationType::Performance,
        ValidationType::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationType::Schema => "schema",
            ValidationType::CrossRule => "cross-rule",
            ValidationType::Performance => "performance",
            ValidationType::Environment => "environment",
        }
    }
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding. `field` is a dotted document path, empty for
/// findings about the rule as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    fn rule(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rule_id: String,
    pub version: u32,
    pub validation_type: ValidationType,
    pub passed: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationReport {
    fn new(
        rule_id: &str,
        version: u32,
        validation_type: ValidationType,
        errors: Vec<ValidationIssue>,
        warnings: Vec<ValidationIssue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            version,
            validation_type,
            passed: errors.is_empty(),
            errors,
            warnings,
            timestamp,
        }
    }
}

pub fn all_passed(reports: &[ValidationReport]) -> bool {
    ValidationType::ALL
        .iter()
        .all(|t| reports.iter().any(|r| r.validation_type == *t && r.passed))
}

/// Limits the cross-rule and performance checks are measured against.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSettings {
    pub max_parallel_rules: usize,
    pub max_query_cost: f64,
    pub estimated_universe_size: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_parallel_rules: 10,
            max_query_cost: 50_000_000.0,
            estimated_universe_size: 5_000,
        }
    }
}

/// Everything a validation run needs besides the document itself.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Rules already known to the system, excluding other versions of the
    /// rule under validation.
    pub peers: Vec<RuleDefinition>,
    pub settings: ValidationSettings,
    /// Target deployment; `None` skips the environment check with a warning.
    pub environment: Option<EnvironmentProfile>,
}

/// Validate a JSON rule document.
pub fn validate(document: &str, ctx: &ValidationContext) -> Result<Vec<ValidationReport>, InputError> {
    let value: Value = serde_json::from_str(document)
        .map_err(|e| InputError::new(format!("not valid JSON: {e}")))?;
    validate_value(&value, ctx)
}

pub fn validate_value(value: &Value, ctx: &ValidationContext) -> Result<Vec<ValidationReport>, InputError> {
    let parsed = rule_document::parse_value(value)?;
    let now = Utc::now();
    let rule_id = parsed.id.clone().unwrap_or_default();
    let version = parsed.version.unwrap_or(0);

    let schema = ValidationReport::new(
        &rule_id,
        version,
        ValidationType::Schema,
        parsed.errors,
        parsed.warnings,
        now,
    );

    let reports = match parsed.rule {
        Some(rule) => {
            let mut reports = vec![schema];
            reports.extend(semantic_checks(&rule, ctx, now));
            reports
        }
        None => {
            tracing::debug!(rule_id = %rule_id, errors = schema.errors.len(), "schema validation failed");
            let mut reports = vec![schema];
            for validation_type in &ValidationType::ALL[1..] {
                reports.push(ValidationReport::new(
                    &rule_id,
                    version,
                    *validation_type,
                    vec![ValidationIssue::rule("skipped: schema validation failed")],
                    Vec::new(),
                    now,
                ));
            }
            reports
        }
    };
    Ok(reports)
}

/// Validate a typed rule, typically a stored version.
pub fn validate_rule(rule: &RuleDefinition, ctx: &ValidationContext) -> Vec<ValidationReport> {
    let document = rule_document::to_document(rule);
    match validate_value(&document, ctx) {
        Ok(reports) => reports,
        // to_document always yields an object
        Err(e) => vec![ValidationReport::new(
            &rule.id,
            rule.version,
            ValidationType::Schema,
            vec![ValidationIssue::rule(e.reason)],
            Vec::new(),
            Utc::now(),
        )],
    }
}

fn semantic_checks(
    rule: &RuleDefinition,
    ctx: &ValidationContext,
    now: DateTime<Utc>,
) -> Vec<ValidationReport> {
    let (cross_errors, cross_warnings) = check_cross_rule(rule, ctx);
    let (perf_errors, perf_warnings) = check_performance(rule, &ctx.settings);
    let (env_errors, env_warnings) = check_environment(rule, ctx.environment.as_ref());

    vec![
        ValidationReport::new(
            &rule.id,
            rule.version,
            ValidationType::CrossRule,
            cross_errors,
            cross_warnings,
            now,
        ),
        ValidationReport::new(
            &rule.id,
            rule.version,
            ValidationType::Performance,
            perf_errors,
            perf_warnings,
            now,
        ),
        ValidationReport::new(
            &rule.id,
            rule.version,
            ValidationType::Environment,
            env_errors,
            env_warnings,
            now,
        ),
    ]
}

type Findings = (Vec<ValidationIssue>, Vec<ValidationIssue>);

fn check_cross_rule(rule: &RuleDefinition, ctx: &ValidationContext) -> Findings {
    let mut errors = Vec::new();
    let warnings = Vec::new();

    if ctx
        .peers
        .iter()
        .any(|p| p.id == rule.id && p.version == rule.version)
    {
        errors.push(ValidationIssue::new(
            "id",
            format!("rule {} version {} already exists", rule.id, rule.version),
        ));
    }

    let hash = rule.parameter_hash();
    let mut redundant: Vec<&str> = ctx
        .peers
        .iter()
        .filter(|p| p.id != rule.id && p.status != RuleStatus::Archived)
        .filter(|p| p.rule_type() == rule.rule_type() && p.parameter_hash() == hash)
        .map(|p| p.id.as_str())
        .collect();
    redundant.sort_unstable();
    redundant.dedup();
    if !redundant.is_empty() {
        errors.push(ValidationIssue::new(
            "parameters",
            format!(
                "same {} parameters as existing rule(s): {}",
                rule.rule_type(),
                redundant.join(", ")
            ),
        ));
    }

    let mut enabled: Vec<&str> = ctx
        .peers
        .iter()
        .filter(|p| p.id != rule.id && p.status == RuleStatus::Enabled)
        .map(|p| p.id.as_str())
        .collect();
    enabled.sort_unstable();
    enabled.dedup();
    let scheduled = enabled.len() + 1;
    if scheduled > ctx.settings.max_parallel_rules {
        errors.push(ValidationIssue::rule(format!(
            "{scheduled} enabled rules would run concurrently, max_parallel_rules is {}",
            ctx.settings.max_parallel_rules
        )));
    }

    (errors, warnings)
}

/// Relative cost of one scan date: rows touched in the window, times the
/// lookback the query re-reads, doubled for each missing selective filter.
pub fn estimate_query_cost(rule: &RuleDefinition, universe_size: u64) -> f64 {
    let window = rule.time_window.window_minutes().max(1) as f64;
    let lookback = f64::from(rule.parameters.lookback_days());
    let missing_filters = 2 - rule.universe_filter.selective_filter_count().min(2);
    universe_size as f64 * window * (1.0 + lookback) * f64::powi(2.0, missing_filters as i32)
}

fn check_performance(rule: &RuleDefinition, settings: &ValidationSettings) -> Findings {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let filter = &rule.universe_filter;
    if filter.min_price.is_none() && filter.max_price.is_none() {
        warnings.push(ValidationIssue::new(
            "universe_filter",
            "high risk: no price filter, every symbol is aggregated",
        ));
    }
    if filter.min_volume.is_none() {
        warnings.push(ValidationIssue::new(
            "universe_filter.min_volume",
            "high risk: no volume filter, illiquid symbols are aggregated",
        ));
    }

    let cost = estimate_query_cost(rule, settings.estimated_universe_size);
    if cost > settings.max_query_cost {
        errors.push(ValidationIssue::rule(format!(
            "estimated query cost {cost:.0} exceeds budget {:.0}",
            settings.max_query_cost
        )));
    }

    (errors, warnings)
}

fn check_environment(rule: &RuleDefinition, environment: Option<&EnvironmentProfile>) -> Findings {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(env) = environment else {
        warnings.push(ValidationIssue::rule(
            "no target environment given, compatibility not checked",
        ));
        return (errors, warnings);
    };

    if let Some(reason) = env.incompatibility(rule) {
        errors.push(ValidationIssue::new("rule_type", reason));
    }

    (errors, warnings)
}
