//! Scanner configuration.
//!
//! Built once from a [`ConfigPort`] and passed by reference to every
//! component. Every key is checked while it is read.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::error::RulescanError;
use crate::domain::rule::{RuleDefinition, RuleType};
use crate::domain::validation::ValidationSettings;
use crate::ports::config_port::ConfigPort;

const ENVIRONMENT_PREFIX: &str = "environment.";

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerSettings {
    pub max_results_per_day: usize,
    pub worker_threads: usize,
    pub query_timeout: Duration,
    pub max_parallel_rules: usize,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            max_results_per_day: 50,
            worker_threads: 4,
            query_timeout: Duration::from_millis(30_000),
            max_parallel_rules: 10,
        }
    }
}

/// Bounded exponential backoff for transient data-source errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// What a deployment target can run.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentProfile {
    pub name: String,
    pub supported_rule_types: Vec<RuleType>,
    pub available_fields: Vec<String>,
}

impl EnvironmentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supported_rule_types: RuleType::ALL.to_vec(),
            available_fields: Self::default_fields(),
        }
    }

    pub fn default_fields() -> Vec<String> {
        RuleType::Breakout
            .required_fields()
            .iter()
            .map(|f| f.to_string())
            .collect()
    }

    /// Why `rule` cannot run here, if it cannot.
    pub fn incompatibility(&self, rule: &RuleDefinition) -> Option<String> {
        let rule_type = rule.rule_type();
        if !self.supported_rule_types.contains(&rule_type) {
            return Some(format!(
                "rule type {rule_type} is not supported by environment {}",
                self.name
            ));
        }
        let missing: Vec<&str> = rule_type
            .required_fields()
            .iter()
            .copied()
            .filter(|f| !self.available_fields.iter().any(|a| a == f))
            .collect();
        if !missing.is_empty() {
            return Some(format!(
                "environment {} lacks data fields: {}",
                self.name,
                missing.join(", ")
            ));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub scanner: ScannerSettings,
    pub retry: RetryPolicy,
    pub validation: ValidationSettings,
    pub environments: BTreeMap<String, EnvironmentProfile>,
    pub repository_path: Option<String>,
    pub sqlite_path: Option<String>,
    pub sqlite_pool_size: u32,
    pub log_filter: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scanner: ScannerSettings::default(),
            retry: RetryPolicy::default(),
            validation: ValidationSettings::default(),
            environments: BTreeMap::new(),
            repository_path: None,
            sqlite_path: None,
            sqlite_pool_size: 4,
            log_filter: "info".to_string(),
        }
    }
}

impl ScannerConfig {
    pub fn from_port(config: &dyn ConfigPort) -> Result<Self, RulescanError> {
        let defaults = ScannerConfig::default();

        let scanner = ScannerSettings {
            max_results_per_day: read_count(
                config,
                "scanner",
                "max_results_per_day",
                defaults.scanner.max_results_per_day as i64,
            )?,
            worker_threads: read_count(
                config,
                "scanner",
                "worker_threads",
                defaults.scanner.worker_threads as i64,
            )?,
            query_timeout: Duration::from_millis(read_count(
                config,
                "scanner",
                "query_timeout_ms",
                defaults.scanner.query_timeout.as_millis() as i64,
            )?),
            max_parallel_rules: read_count(
                config,
                "scanner",
                "max_parallel_rules",
                defaults.scanner.max_parallel_rules as i64,
            )?,
        };

        let retry = RetryPolicy {
            max_attempts: read_count(
                config,
                "retry",
                "max_attempts",
                i64::from(defaults.retry.max_attempts),
            )?,
            initial_backoff: Duration::from_millis(read_count(
                config,
                "retry",
                "initial_backoff_ms",
                defaults.retry.initial_backoff.as_millis() as i64,
            )?),
            max_backoff: Duration::from_millis(read_count(
                config,
                "retry",
                "max_backoff_ms",
                defaults.retry.max_backoff.as_millis() as i64,
            )?),
        };
        if retry.max_backoff < retry.initial_backoff {
            return Err(RulescanError::ConfigInvalid {
                section: "retry".to_string(),
                key: "max_backoff_ms".to_string(),
                reason: "max_backoff_ms must not be less than initial_backoff_ms".to_string(),
            });
        }

        let max_query_cost = read_number(
            config,
            "validation",
            "max_query_cost",
            defaults.validation.max_query_cost,
        )?;
        if max_query_cost <= 0.0 {
            return Err(RulescanError::ConfigInvalid {
                section: "validation".to_string(),
                key: "max_query_cost".to_string(),
                reason: "max_query_cost must be positive".to_string(),
            });
        }
        let validation = ValidationSettings {
            max_parallel_rules: scanner.max_parallel_rules,
            max_query_cost,
            estimated_universe_size: read_count(
                config,
                "validation",
                "estimated_universe_size",
                defaults.validation.estimated_universe_size as i64,
            )?,
        };

        let mut environments = BTreeMap::new();
        for section in config.sections() {
            if let Some(name) = section.strip_prefix(ENVIRONMENT_PREFIX) {
                let profile = read_environment(config, &section, name)?;
                environments.insert(profile.name.clone(), profile);
            }
        }

        Ok(Self {
            scanner,
            retry,
            validation,
            environments,
            repository_path: non_empty(config.get_string("repository", "path")),
            sqlite_path: non_empty(config.get_string("sqlite", "path")),
            sqlite_pool_size: read_count(
                config,
                "sqlite",
                "pool_size",
                i64::from(defaults.sqlite_pool_size),
            )?,
            log_filter: non_empty(config.get_string("logging", "filter"))
                .unwrap_or(defaults.log_filter),
        })
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentProfile> {
        self.environments.get(name)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// A positive integer key. Present but unparseable is an error, not a default.
/// A positive integer that must also fit the target type.
fn read_count<T: TryFrom<i64>>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<T, RulescanError> {
    let value = match non_empty(config.get_string(section, key)) {
        None => default,
        Some(raw) => raw.parse::<i64>().map_err(|_| RulescanError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("'{raw}' is not an integer"),
        })?,
    };
    if value < 1 {
        return Err(RulescanError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("{key} must be at least 1"),
        });
    }
    T::try_from(value).map_err(|_| RulescanError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: format!("{value} is out of range"),
    })
}

fn read_number(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, RulescanError> {
    match non_empty(config.get_string(section, key)) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| RulescanError::ConfigInvalid {
                section: section.to_string(),
                key: key.to_string(),
                reason: format!("'{raw}' is not a number"),
            }),
    }
}

fn read_environment(
    config: &dyn ConfigPort,
    section: &str,
    name: &str,
) -> Result<EnvironmentProfile, RulescanError> {
    let mut profile = EnvironmentProfile::new(name.trim());
    if profile.name.is_empty() {
        return Err(RulescanError::ConfigInvalid {
            section: section.to_string(),
            key: "name".to_string(),
            reason: "environment name must not be empty".to_string(),
        });
    }

    if let Some(list) = non_empty(config.get_string(section, "supported_rule_types")) {
        let mut types = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let rule_type = item
                .parse::<RuleType>()
                .map_err(|reason| RulescanError::ConfigInvalid {
                    section: section.to_string(),
                    key: "supported_rule_types".to_string(),
                    reason,
                })?;
            if !types.contains(&rule_type) {
                types.push(rule_type);
            }
        }
        profile.supported_rule_types = types;
    }

    if let Some(list) = non_empty(config.get_string(section, "available_fields")) {
        profile.available_fields = list
            .split(',')
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
    }

    Ok(profile)
}
