//! Promotion of validated rule versions into deployment environments.
//!
//! Each environment keeps its own stack of deployments per rule id; the top
//! of the stack is the active version there. Rolling back pops the stack.
//! Global rule history and statuses in the repository are never touched.
//! Every check runs before the stack is modified, so a failed deploy or
//! rollback leaves the environment exactly as it was.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::domain::config::{EnvironmentProfile, ScannerConfig};
use crate::domain::error::DeploymentError;
use crate::domain::repository::RuleRepository;
use crate::domain::validation::{
    ValidationContext, ValidationReport, ValidationSettings, ValidationType, validate_rule,
};

/// Connectivity check against a deployment target.
pub trait EnvironmentProbe: Send + Sync {
    fn check(&self, environment: &str) -> Result<(), String>;
}

pub struct AlwaysReachable;

impl EnvironmentProbe for AlwaysReachable {
    fn check(&self, _environment: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub environment: String,
    pub rule_id: String,
    pub version: u32,
    /// Version that was active in the environment before this deployment.
    pub prior_version: Option<u32>,
    pub deployed_at: DateTime<Utc>,
}

type ReportKey = (String, u32);
type StackKey = (String, String);

pub struct DeploymentManager {
    repository: Arc<RuleRepository>,
    environments: BTreeMap<String, EnvironmentProfile>,
    validation: ValidationSettings,
    probe: Arc<dyn EnvironmentProbe>,
    reports: RwLock<HashMap<ReportKey, BTreeMap<ValidationType, ValidationReport>>>,
    stacks: Mutex<BTreeMap<StackKey, Vec<DeploymentRecord>>>,
}

impl DeploymentManager {
    pub fn new(
        repository: Arc<RuleRepository>,
        config: &ScannerConfig,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        Self {
            repository,
            environments: config.environments.clone(),
            validation: config.validation.clone(),
            probe,
            reports: RwLock::new(HashMap::new()),
            stacks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Keep the newest report of each validation type per rule version.
    pub fn record_validation(&self, reports: &[ValidationReport]) {
        let mut stored = match self.reports.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for report in reports {
            let by_type = stored
                .entry((report.rule_id.clone(), report.version))
                .or_default();
            let newer = by_type
                .get(&report.validation_type)
                .is_none_or(|existing| report.timestamp >= existing.timestamp);
            if newer {
                by_type.insert(report.validation_type, report.clone());
            }
        }
    }

    /// Validate a stored version against `environment` and record the reports.
    pub fn validate_and_record(
        &self,
        rule_id: &str,
        version: u32,
        environment: &str,
    ) -> Result<Vec<ValidationReport>, DeploymentError> {
        let profile = self.profile(environment)?;
        let rule = self.repository.get(rule_id, Some(version))?;
        let ctx = ValidationContext {
            peers: self.repository.validation_peers(rule_id),
            settings: self.validation.clone(),
            environment: Some(profile.clone()),
        };
        let reports = validate_rule(&rule, &ctx);
        self.record_validation(&reports);
        Ok(reports)
    }

    /// Latest recorded report of each type for a rule version.
    pub fn latest_reports(&self, rule_id: &str, version: u32) -> Vec<ValidationReport> {
        let stored = match self.reports.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stored
            .get(&(rule_id.to_string(), version))
            .map(|by_type| by_type.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn deploy(
        &self,
        rule_id: &str,
        version: u32,
        environment: &str,
    ) -> Result<DeploymentRecord, DeploymentError> {
        let profile = self.profile(environment)?;
        let rule = self.repository.get(rule_id, Some(version))?;

        let latest = self.latest_reports(rule_id, version);
        let missing: Vec<ValidationType> = ValidationType::ALL
            .iter()
            .copied()
            .filter(|t| {
                !latest
                    .iter()
                    .any(|r| r.validation_type == *t && r.passed)
            })
            .collect();
        if !missing.is_empty() {
            tracing::warn!(rule_id, version, environment, missing = ?missing, "deploy refused: unvalidated");
            return Err(DeploymentError::Unvalidated {
                rule_id: rule_id.to_string(),
                version,
                missing,
            });
        }

        if let Some(reason) = profile.incompatibility(&rule) {
            return Err(DeploymentError::Incompatible {
                rule_id: rule_id.to_string(),
                environment: environment.to_string(),
                reason,
            });
        }

        let mut stacks = self.lock_stacks();
        self.probe
            .check(environment)
            .map_err(|reason| DeploymentError::Unreachable {
                environment: environment.to_string(),
                reason,
            })?;

        let stack = stacks
            .entry((environment.to_string(), rule_id.to_string()))
            .or_default();
        let record = DeploymentRecord {
            environment: environment.to_string(),
            rule_id: rule_id.to_string(),
            version,
            prior_version: stack.last().map(|r| r.version),
            deployed_at: Utc::now(),
        };
        stack.push(record.clone());
        tracing::info!(rule_id, version, environment, prior = ?record.prior_version, "rule deployed");
        Ok(record)
    }

    /// Undo the latest deployment of `rule_id` in `environment`, returning
    /// the record that was removed. Its `prior_version` is active afterwards.
    pub fn rollback(&self, environment: &str, rule_id: &str) -> Result<DeploymentRecord, DeploymentError> {
        self.profile(environment)?;
        let mut stacks = self.lock_stacks();
        let key = (environment.to_string(), rule_id.to_string());
        let nothing = || DeploymentError::NothingToRollback {
            rule_id: rule_id.to_string(),
            environment: environment.to_string(),
        };
        if stacks.get(&key).is_none_or(|s| s.is_empty()) {
            return Err(nothing());
        }

        self.probe
            .check(environment)
            .map_err(|reason| DeploymentError::Unreachable {
                environment: environment.to_string(),
                reason,
            })?;

        let removed = stacks
            .get_mut(&key)
            .and_then(|stack| stack.pop())
            .ok_or_else(nothing)?;
        tracing::info!(
            rule_id,
            environment,
            removed = removed.version,
            restored = ?removed.prior_version,
            "deployment rolled back"
        );
        Ok(removed)
    }

    pub fn active_version(&self, environment: &str, rule_id: &str) -> Option<u32> {
        self.lock_stacks()
            .get(&(environment.to_string(), rule_id.to_string()))
            .and_then(|stack| stack.last())
            .map(|r| r.version)
    }

    /// Deployments still in effect in `environment`, oldest first per rule.
    pub fn deployments(&self, environment: &str) -> Vec<DeploymentRecord> {
        self.lock_stacks()
            .iter()
            .filter(|((env, _), _)| env == environment)
            .flat_map(|(_, stack)| stack.iter().cloned())
            .collect()
    }

    fn profile(&self, environment: &str) -> Result<&EnvironmentProfile, DeploymentError> {
        self.environments
            .get(environment)
            .ok_or_else(|| DeploymentError::UnknownEnvironment {
                name: environment.to_string(),
            })
    }

    fn lock_stacks(&self) -> std::sync::MutexGuard<'_, BTreeMap<StackKey, Vec<DeploymentRecord>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
