//! Domain error types.
//!
//! One enum per concern; [`RulescanError`] aggregates them for the binary and
//! maps each family onto a process exit code.

use chrono::NaiveDate;

use crate::domain::validation::ValidationType;

/// Input that cannot be used at all: an unparseable rule document or a bad argument.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid input: {reason}")]
pub struct InputError {
    pub reason: String,
}

impl InputError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Raised while compiling a rule into a query; fatal for that rule only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryBuildError {
    #[error("unsupported rule type: {rule_type}")]
    UnsupportedRuleType { rule_type: String },

    #[error("invalid window for rule {rule_id}: {reason}")]
    InvalidWindow { rule_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataSourceError {
    #[error("query timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("data source busy: {reason}")]
    LockContention { reason: String },

    #[error("data source connection error: {reason}")]
    Connection { reason: String },

    #[error("query error: {reason}")]
    Query { reason: String },

    #[error("schema mismatch: {reason}")]
    Schema { reason: String },
}

impl DataSourceError {
    /// Transient errors are retried with backoff; everything else fails the unit at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataSourceError::Timeout { .. }
                | DataSourceError::LockContention { .. }
                | DataSourceError::Connection { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("storage error: {reason}")]
pub struct StorageError {
    pub reason: String,
}

impl StorageError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::new(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::new(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::new(format!("serialization: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("scan context {scan_id} has already been released")]
pub struct StaleContextError {
    pub scan_id: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Stale(#[from] StaleContextError),

    #[error("invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("no trading dates between {start} and {end}")]
    NoTradingDates { start: NaiveDate, end: NaiveDate },

    #[error("no rules in scope")]
    NoRules,

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryError {
    #[error("rule {id} not found")]
    NotFound { id: String },

    #[error("rule {id} has no version {version}")]
    VersionNotFound { id: String, version: u32 },

    #[error("rule {id} already exists")]
    AlreadyExists { id: String },

    #[error("rule {id} v{version}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        version: u32,
        from: String,
        to: String,
    },

    #[error("backup {name} already exists")]
    BackupExists { name: String },

    #[error("backup {name} not found")]
    BackupNotFound { name: String },

    #[error("backup {name} failed its checksum")]
    BackupCorrupt { name: String },

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeploymentError {
    #[error("rule {rule_id} v{version} has not passed validation: {missing:?}")]
    Unvalidated {
        rule_id: String,
        version: u32,
        missing: Vec<ValidationType>,
    },

    #[error("unknown environment: {name}")]
    UnknownEnvironment { name: String },

    #[error("rule {rule_id} is incompatible with {environment}: {reason}")]
    Incompatible {
        rule_id: String,
        environment: String,
        reason: String,
    },

    #[error("environment {environment} is unreachable: {reason}")]
    Unreachable { environment: String, reason: String },

    #[error("nothing to roll back for rule {rule_id} in {environment}")]
    NothingToRollback {
        rule_id: String,
        environment: String,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Top-level error type for rulescan.
#[derive(Debug, thiserror::Error)]
pub enum RulescanError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("bar import from {file} failed: {reason}")]
    BarImport { file: String, reason: String },

    #[error(transparent)]
    QueryBuild(#[from] QueryBuildError),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StaleContextError> for RulescanError {
    fn from(err: StaleContextError) -> Self {
        RulescanError::Context(ContextError::Stale(err))
    }
}

impl From<&RulescanError> for std::process::ExitCode {
    fn from(err: &RulescanError) -> Self {
        let code: u8 = match err {
            RulescanError::Io(_) => 1,
            RulescanError::ConfigParse { .. }
            | RulescanError::ConfigMissing { .. }
            | RulescanError::ConfigInvalid { .. } => 2,
            RulescanError::DataSource(_) | RulescanError::Storage(_) => 3,
            RulescanError::Repository(RepositoryError::Storage(_)) => 3,
            RulescanError::Input(_)
            | RulescanError::BarImport { .. }
            | RulescanError::QueryBuild(_)
            | RulescanError::Repository(_) => 4,
            RulescanError::Deployment(_) => 5,
            RulescanError::Context(_) => 6,
        };
        std::process::ExitCode::from(code)
    }
}
