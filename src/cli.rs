//! CLI definition and dispatch.
//!
//! Command results are printed to stdout as JSON; diagnostics go to stderr.

use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::adapters::csv_adapter::CsvBarLoader;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_monitor::InMemoryMonitor;
use crate::adapters::sqlite_adapter::SqliteDataSource;
use crate::adapters::sqlite_rule_store::SqliteRuleStore;
use crate::domain::config::ScannerConfig;
use crate::domain::context::{ScanContext, ScanDates, ScanRequest, UniverseSpec, default_end_of_day, parse_symbols};
use crate::domain::error::{ContextError, DeploymentError, InputError, RulescanError};
use crate::domain::pipeline::{CancellationToken, ScanPipeline, ScanState, resolve_enabled_rules};
use crate::domain::repository::{RuleFilter, RuleRepository};
use crate::domain::rule::{RuleStatus, RuleType};
use crate::domain::rule_document;
use crate::domain::validation::{self, ValidationContext};

#[derive(Parser, Debug)]
#[command(name = "rulescan", about = "Pattern rule scanner for intraday market data")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a rule document without storing it
    Validate {
        document: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Environment to check compatibility against
        #[arg(short, long)]
        environment: Option<String>,
    },
    /// Store a new rule as version 1
    Create {
        document: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Store a new version of an existing rule
    Update {
        document: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List the latest version of each rule
    List {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        rule_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// Show every version of a rule
    History {
        id: String,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Change the status of one rule version
    Status {
        id: String,
        version: u32,
        status: String,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Append a new version copying an earlier one
    Rollback {
        id: String,
        version: u32,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Snapshot the whole rule set under a name
    Backup {
        name: String,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Restore a named snapshot
    Restore {
        name: String,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List stored backups
    Backups {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the repository audit log
    Audit {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load intraday bars from a CSV file into the market data store
    ImportBars {
        file: PathBuf,
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run enabled rules over one date or a date range
    Scan {
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated rule ids; defaults to every enabled rule
        #[arg(long)]
        rules: Option<String>,
        #[arg(long, conflicts_with_all = ["start", "end"])]
        date: Option<NaiveDate>,
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
        /// Latest time of day considered, HH:MM
        #[arg(long)]
        cutoff: Option<String>,
        /// End of the trading day, HH:MM
        #[arg(long)]
        end_of_day: Option<String>,
        /// Comma-separated symbols; defaults to every symbol with data
        #[arg(long)]
        symbols: Option<String>,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Validate {
            document,
            config,
            environment,
        } => run_validate(&document, config.as_deref(), environment.as_deref()),
        Command::Create { document, config } => run_create(&document, &config),
        Command::Update { document, config } => run_update(&document, &config),
        Command::List {
            config,
            rule_type,
            status,
            author,
        } => run_list(&config, rule_type.as_deref(), status.as_deref(), author),
        Command::History { id, config } => run_history(&id, &config),
        Command::Status {
            id,
            version,
            status,
            config,
        } => run_status(&id, version, &status, &config),
        Command::Rollback { id, version, config } => run_rollback(&id, version, &config),
        Command::Backup { name, config } => run_backup(&name, &config),
        Command::Restore { name, config } => run_restore(&name, &config),
        Command::Backups { config } => run_backups(&config),
        Command::Audit { config } => run_audit(&config),
        Command::ImportBars { file, config } => run_import_bars(&file, &config),
        Command::Scan {
            config,
            rules,
            date,
            start,
            end,
            cutoff,
            end_of_day,
            symbols,
        } => run_scan(ScanArgs {
            config,
            rules,
            date,
            start,
            end,
            cutoff,
            end_of_day,
            symbols,
        }),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn load_scanner_config(path: &Path) -> Result<ScannerConfig, RulescanError> {
    let adapter = FileConfigAdapter::from_file(path)?;
    let config = ScannerConfig::from_port(&adapter)?;
    init_logging(&config.log_filter);
    Ok(config)
}

pub fn open_repository(config: &ScannerConfig) -> Result<RuleRepository, RulescanError> {
    let path = config
        .repository_path
        .as_deref()
        .ok_or_else(|| RulescanError::ConfigMissing {
            section: "repository".into(),
            key: "path".into(),
        })?;
    let store = SqliteRuleStore::open(path)?;
    Ok(RuleRepository::open(Arc::new(store))?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), RulescanError> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{text}");
    Ok(())
}

fn read_document(path: &Path) -> Result<String, RulescanError> {
    Ok(fs::read_to_string(path)?)
}

fn run_validate(
    document: &Path,
    config_path: Option<&Path>,
    environment: Option<&str>,
) -> Result<ExitCode, RulescanError> {
    let text = read_document(document)?;
    let mut ctx = ValidationContext::default();

    if let Some(path) = config_path {
        let config = load_scanner_config(path)?;
        ctx.settings = config.validation.clone();
        if let Some(name) = environment {
            let profile = config
                .environment(name)
                .ok_or_else(|| DeploymentError::UnknownEnvironment { name: name.to_string() })?;
            ctx.environment = Some(profile.clone());
        }
        if config.repository_path.is_some() {
            let parsed = rule_document::parse_str(&text)?;
            if let Some(id) = parsed.id {
                ctx.peers = open_repository(&config)?.validation_peers(&id);
            }
        }
    } else if let Some(name) = environment {
        return Err(DeploymentError::UnknownEnvironment { name: name.to_string() }.into());
    }

    let reports = validation::validate(&text, &ctx)?;
    print_json(&reports)?;
    if validation::all_passed(&reports) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(4))
    }
}

fn run_create(document: &Path, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let rule = rule_document::rule_from_str(&read_document(document)?)?;
    let created = repo.create(rule)?;
    print_json(&rule_document::to_document(&created))?;
    Ok(ExitCode::SUCCESS)
}

fn run_update(document: &Path, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let rule = rule_document::rule_from_str(&read_document(document)?)?;
    let updated = repo.update(rule)?;
    print_json(&rule_document::to_document(&updated))?;
    Ok(ExitCode::SUCCESS)
}

fn run_list(
    config_path: &Path,
    rule_type: Option<&str>,
    status: Option<&str>,
    author: Option<String>,
) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let filter = RuleFilter {
        rule_type: rule_type
            .map(|t| t.parse::<RuleType>())
            .transpose()
            .map_err(InputError::new)?,
        status: status
            .map(|s| s.parse::<RuleStatus>())
            .transpose()
            .map_err(InputError::new)?,
        author,
    };
    let documents: Vec<_> = repo
        .list(&filter)
        .iter()
        .map(rule_document::to_document)
        .collect();
    print_json(&documents)?;
    Ok(ExitCode::SUCCESS)
}

fn run_history(id: &str, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let documents: Vec<_> = repo
        .history(id)?
        .iter()
        .map(rule_document::to_document)
        .collect();
    print_json(&documents)?;
    Ok(ExitCode::SUCCESS)
}

fn run_status(id: &str, version: u32, status: &str, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let status: RuleStatus = status.parse().map_err(InputError::new)?;
    let rule = repo.set_status(id, version, status)?;
    print_json(&rule_document::to_document(&rule))?;
    Ok(ExitCode::SUCCESS)
}

fn run_rollback(id: &str, version: u32, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let repo = open_repository(&config)?;
    let rule = repo.rollback(id, version)?;
    print_json(&rule_document::to_document(&rule))?;
    Ok(ExitCode::SUCCESS)
}

fn run_backup(name: &str, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let manifest = open_repository(&config)?.backup(name)?;
    print_json(&manifest)?;
    Ok(ExitCode::SUCCESS)
}

fn run_restore(name: &str, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let manifest = open_repository(&config)?.restore(name)?;
    print_json(&manifest)?;
    Ok(ExitCode::SUCCESS)
}

fn run_backups(config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    print_json(&open_repository(&config)?.list_backups()?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_audit(config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    print_json(&open_repository(&config)?.audit_log())?;
    Ok(ExitCode::SUCCESS)
}

fn run_import_bars(file: &Path, config_path: &Path) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(config_path)?;
    let source = SqliteDataSource::from_config(&config)?;
    source.initialize_schema()?;
    let bars = CsvBarLoader::new(file.to_path_buf()).load()?;
    let imported = source.insert_bars(&bars)?;
    print_json(&serde_json::json!({ "imported": imported }))?;
    Ok(ExitCode::SUCCESS)
}

struct ScanArgs {
    config: PathBuf,
    rules: Option<String>,
    date: Option<NaiveDate>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    cutoff: Option<String>,
    end_of_day: Option<String>,
    symbols: Option<String>,
}

/// A single date, or a range when both bounds are given.
pub fn resolve_scan_dates(
    date: Option<NaiveDate>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<ScanDates, InputError> {
    match (date, start, end) {
        (Some(d), None, None) => Ok(ScanDates::Single(d)),
        (None, Some(start), Some(end)) => Ok(ScanDates::Range { start, end }),
        _ => Err(InputError::new("give either --date or both --start and --end")),
    }
}

pub fn parse_time_arg(value: Option<&str>, name: &str) -> Result<Option<NaiveTime>, InputError> {
    value
        .map(|v| {
            rule_document::parse_time(v)
                .ok_or_else(|| InputError::new(format!("--{name} must be HH:MM or HH:MM:SS, got {v}")))
        })
        .transpose()
}

/// Comma-separated rule ids, trimmed, each kept once in first-seen order.
pub fn parse_rule_ids(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && seen.insert(*s))
        .map(str::to_string)
        .collect()
}

fn run_scan(args: ScanArgs) -> Result<ExitCode, RulescanError> {
    let config = load_scanner_config(&args.config)?;
    let repo = open_repository(&config)?;
    let source = SqliteDataSource::from_config(&config)?;
    source.initialize_schema()?;

    let ids = match args.rules.as_deref() {
        Some(list) => parse_rule_ids(list),
        None => repo.enabled_rules().into_iter().map(|r| r.id).collect(),
    };
    let (rules, missing) = resolve_enabled_rules(&repo, &ids);
    for id in &missing {
        tracing::warn!(rule_id = %id, "rule has no enabled version, skipped");
    }
    if rules.is_empty() {
        return Err(ContextError::NoRules.into());
    }

    let request = ScanRequest {
        rule_ids: rules.iter().map(|r| r.id.clone()).collect(),
        dates: resolve_scan_dates(args.date, args.start, args.end)?,
        cutoff_time: parse_time_arg(args.cutoff.as_deref(), "cutoff")?,
        end_of_day_time: parse_time_arg(args.end_of_day.as_deref(), "end-of-day")?
            .unwrap_or_else(default_end_of_day),
        universe: match args.symbols.as_deref() {
            Some(list) => UniverseSpec::Explicit(parse_symbols(list)),
            None => UniverseSpec::All,
        },
    };

    let ctx = ScanContext::create(request, Arc::new(source))?;
    let pipeline = ScanPipeline::new(&config, Arc::new(InMemoryMonitor::new()));
    let report = pipeline.run(&ctx, &rules, &CancellationToken::new())?;
    print_json(&report)?;

    Ok(match report.state {
        ScanState::Failed => ExitCode::from(3),
        _ => ExitCode::SUCCESS,
    })
}
