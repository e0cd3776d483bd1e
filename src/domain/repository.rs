//! Versioned rule repository.
//!
//! Versions are immutable and append-only, keyed by `(rule_id, version)`.
//! What is visible and which version is enabled live in a small separate
//! [`RuleIndex`]. Readers clone an `Arc` to the current snapshot and never
//! wait on writers. Writers serialize per rule id, persist the change through
//! the [`RuleStore`] and only then swap the snapshot, so a failed write
//! leaves both the store and the in-memory state untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::domain::error::{InputError, RepositoryError, StorageError};
use crate::domain::rule::{RuleDefinition, RuleStatus, RuleType};
use crate::domain::rule_document;
use crate::ports::rule_store_port::RuleStore;

/// Visible heads and per-version statuses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleIndex {
    pub heads: BTreeMap<String, u32>,
    pub statuses: BTreeMap<String, BTreeMap<u32, RuleStatus>>,
}

impl RuleIndex {
    pub fn enabled_version(&self, id: &str) -> Option<u32> {
        self.statuses.get(id).and_then(|versions| {
            versions
                .iter()
                .find(|(_, s)| **s == RuleStatus::Enabled)
                .map(|(v, _)| *v)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    SetStatus,
    Rollback,
    Backup,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub rule_id: Option<String>,
    pub version: Option<u32>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// One atomic write: new versions, the complete new index, one audit entry
/// and, for a backup, the named snapshot.
#[derive(Debug, Clone)]
pub struct Commit {
    pub appended: Vec<RuleDefinition>,
    pub index: RuleIndex,
    pub audit: AuditEntry,
    pub backup: Option<Backup>,
}

/// Everything a store holds, as loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub versions: Vec<RuleDefinition>,
    pub index: RuleIndex,
    pub audit: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub rule_count: usize,
    pub version_count: usize,
    pub checksum: String,
}

/// Visible rule versions as documents, plus the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub versions: Vec<Value>,
    pub index: RuleIndex,
}

impl Snapshot {
    pub fn checksum(&self) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub manifest: BackupManifest,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleFilter {
    pub rule_type: Option<RuleType>,
    pub status: Option<RuleStatus>,
    pub author: Option<String>,
}

type History = BTreeMap<String, BTreeMap<u32, Arc<RuleDefinition>>>;

#[derive(Debug, Clone, Default)]
struct RepoState {
    history: History,
    index: RuleIndex,
    audit: Vec<AuditEntry>,
}

impl RepoState {
    fn max_version(&self, id: &str) -> u32 {
        self.history
            .get(id)
            .and_then(|versions| versions.keys().next_back().copied())
            .unwrap_or(0)
    }

    /// Versions above the head or without an index status are hidden.
    fn visible(&self, id: &str, version: u32) -> Option<RuleDefinition> {
        let head = *self.index.heads.get(id)?;
        if version > head {
            return None;
        }
        let status = *self.index.statuses.get(id)?.get(&version)?;
        let stored = self.history.get(id)?.get(&version)?;
        let mut rule = RuleDefinition::clone(stored);
        rule.status = status;
        Some(rule)
    }

    fn visible_versions(&self, id: &str) -> Vec<RuleDefinition> {
        let Some(head) = self.index.heads.get(id).copied() else {
            return Vec::new();
        };
        self.history
            .get(id)
            .map(|versions| {
                versions
                    .range(..=head)
                    .filter_map(|(v, _)| self.visible(id, *v))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RuleRepository {
    store: Arc<dyn RuleStore>,
    state: RwLock<Arc<RepoState>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    commit_lock: Mutex<()>,
}

impl RuleRepository {
    /// Open a repository over `store`, loading everything it holds.
    pub fn open(store: Arc<dyn RuleStore>) -> Result<Self, RepositoryError> {
        let stored = store.load()?;
        let mut history = History::new();
        for rule in stored.versions {
            history
                .entry(rule.id.clone())
                .or_default()
                .insert(rule.version, Arc::new(rule));
        }
        tracing::debug!(rules = history.len(), "rule repository opened");
        Ok(Self {
            store,
            state: RwLock::new(Arc::new(RepoState {
                history,
                index: stored.index,
                audit: stored.audit,
            })),
            key_locks: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<RepoState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Per-rule writer lock. Entries nobody holds are dropped on the way in,
    /// so the map only tracks rules with a write in flight.
    fn key_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.key_locks);
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Apply `change` to the latest state, persist it, then publish it.
    fn commit<T>(
        &self,
        change: impl FnOnce(&RepoState) -> Result<(Commit, T), RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let _commit = lock(&self.commit_lock);
        let current = self.snapshot();
        let (commit, out) = change(&current)?;

        self.store.commit(&commit).map_err(|e| {
            tracing::error!(action = ?commit.audit.action, error = %e, "rule store write failed");
            e
        })?;

        let mut next = RepoState::clone(&current);
        for rule in &commit.appended {
            next.history
                .entry(rule.id.clone())
                .or_default()
                .insert(rule.version, Arc::new(rule.clone()));
        }
        next.index = commit.index;
        next.audit.push(commit.audit);

        match self.state.write() {
            Ok(mut guard) => *guard = Arc::new(next),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
        }
        Ok(out)
    }

    /// Store version 1 of a new rule as a draft.
    pub fn create(&self, rule: RuleDefinition) -> Result<RuleDefinition, RepositoryError> {
        let key = self.key_lock(&rule.id);
        let _guard = lock(&key);
        let now = Utc::now();

        self.commit(|state| {
            if state.index.heads.contains_key(&rule.id) {
                return Err(RepositoryError::AlreadyExists { id: rule.id.clone() });
            }
            // a hidden id (dropped by a restore) keeps its numbering
            let version = state.max_version(&rule.id) + 1;
            let stored = normalized(rule, version, now, now)?;
            let mut index = state.index.clone();
            index.heads.insert(stored.id.clone(), version);
            index
                .statuses
                .entry(stored.id.clone())
                .or_default()
                .insert(version, RuleStatus::Draft);
            let audit = audit(AuditAction::Create, Some(&stored.id), Some(version), "created", now);
            tracing::info!(rule_id = %stored.id, version, "rule created");
            Ok((
                Commit {
                    appended: vec![stored.clone()],
                    index,
                    audit,
                    backup: None,
                },
                stored,
            ))
        })
    }

    /// Append a new draft version. Earlier versions keep their status.
    pub fn update(&self, rule: RuleDefinition) -> Result<RuleDefinition, RepositoryError> {
        let key = self.key_lock(&rule.id);
        let _guard = lock(&key);
        let now = Utc::now();

        self.commit(|state| {
            let Some(first) = state.visible_versions(&rule.id).into_iter().next() else {
                return Err(RepositoryError::NotFound { id: rule.id.clone() });
            };
            let version = state.max_version(&rule.id) + 1;
            let stored = normalized(rule, version, first.created_at, now)?;
            let index = with_new_head(&state.index, &stored.id, version);
            let audit = audit(AuditAction::Update, Some(&stored.id), Some(version), "updated", now);
            tracing::info!(rule_id = %stored.id, version, "rule updated");
            Ok((
                Commit {
                    appended: vec![stored.clone()],
                    index,
                    audit,
                    backup: None,
                },
                stored,
            ))
        })
    }

    /// A specific version, or the latest visible one.
    pub fn get(&self, id: &str, version: Option<u32>) -> Result<RuleDefinition, RepositoryError> {
        let state = self.snapshot();
        let head = *state
            .index
            .heads
            .get(id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })?;
        let version = version.unwrap_or(head);
        state
            .visible(id, version)
            .ok_or_else(|| RepositoryError::VersionNotFound {
                id: id.to_string(),
                version,
            })
    }

    /// Latest version of each rule, sorted by id. A status filter matches
    /// any version holding that status instead.
    pub fn list(&self, filter: &RuleFilter) -> Vec<RuleDefinition> {
        let state = self.snapshot();
        let mut out = Vec::new();
        for id in state.index.heads.keys() {
            let candidates = match filter.status {
                Some(status) => state
                    .visible_versions(id)
                    .into_iter()
                    .filter(|r| r.status == status)
                    .collect(),
                None => state.visible(id, state.index.heads[id]).into_iter().collect::<Vec<_>>(),
            };
            out.extend(candidates.into_iter().filter(|r| {
                filter.rule_type.is_none_or(|t| r.rule_type() == t)
                    && filter.author.as_deref().is_none_or(|a| r.author == a)
            }));
        }
        out
    }

    pub fn history(&self, id: &str) -> Result<Vec<RuleDefinition>, RepositoryError> {
        let versions = self.snapshot().visible_versions(id);
        if versions.is_empty() {
            return Err(RepositoryError::NotFound { id: id.to_string() });
        }
        Ok(versions)
    }

    /// The enabled version of every rule, sorted by id.
    pub fn enabled_rules(&self) -> Vec<RuleDefinition> {
        self.list(&RuleFilter {
            status: Some(RuleStatus::Enabled),
            ..RuleFilter::default()
        })
    }

    /// Rules a new or stored version of `rule_id` is checked against:
    /// the head and the enabled version of every other rule.
    pub fn validation_peers(&self, rule_id: &str) -> Vec<RuleDefinition> {
        let state = self.snapshot();
        let mut peers = Vec::new();
        for (id, head) in &state.index.heads {
            if id == rule_id {
                continue;
            }
            peers.extend(state.visible(id, *head));
            if let Some(enabled) = state.index.enabled_version(id).filter(|v| v != head) {
                peers.extend(state.visible(id, enabled));
            }
        }
        peers
    }

    /// Change one version's status. Enabling demotes any other enabled
    /// version of the rule to disabled in the same write.
    pub fn set_status(
        &self,
        id: &str,
        version: u32,
        status: RuleStatus,
    ) -> Result<RuleDefinition, RepositoryError> {
        let key = self.key_lock(id);
        let _guard = lock(&key);
        let now = Utc::now();

        let current = self.get(id, Some(version))?;
        if current.status == status {
            return Ok(current);
        }

        self.commit(|state| {
            let current = state
                .visible(id, version)
                .ok_or_else(|| RepositoryError::VersionNotFound {
                    id: id.to_string(),
                    version,
                })?;
            if current.status == RuleStatus::Archived || status == RuleStatus::Draft {
                return Err(RepositoryError::InvalidTransition {
                    id: id.to_string(),
                    version,
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }
            let mut index = state.index.clone();
            let statuses = index.statuses.entry(id.to_string()).or_default();
            let mut demoted = Vec::new();
            if status == RuleStatus::Enabled {
                for (v, s) in statuses.iter_mut() {
                    if *v != version && *s == RuleStatus::Enabled {
                        *s = RuleStatus::Disabled;
                        demoted.push(*v);
                    }
                }
            }
            statuses.insert(version, status);

            let mut detail = format!("{} -> {}", current.status, status);
            if !demoted.is_empty() {
                let list: Vec<String> = demoted.iter().map(|v| format!("v{v}")).collect();
                detail.push_str(&format!(", disabled {}", list.join(", ")));
            }
            tracing::info!(rule_id = %id, version, status = %status, "rule status changed");
            let audit = audit(AuditAction::SetStatus, Some(id), Some(version), &detail, now);

            let mut updated = current;
            updated.status = status;
            Ok((
                Commit {
                    appended: Vec::new(),
                    index,
                    audit,
                    backup: None,
                },
                updated,
            ))
        })
    }

    /// Append a new draft version carrying `target_version`'s content.
    pub fn rollback(&self, id: &str, target_version: u32) -> Result<RuleDefinition, RepositoryError> {
        let key = self.key_lock(id);
        let _guard = lock(&key);
        let now = Utc::now();

        self.commit(|state| {
            if !state.index.heads.contains_key(id) {
                return Err(RepositoryError::NotFound { id: id.to_string() });
            }
            let target = state
                .visible(id, target_version)
                .ok_or_else(|| RepositoryError::VersionNotFound {
                    id: id.to_string(),
                    version: target_version,
                })?;
            let version = state.max_version(id) + 1;
            let created_at = target.created_at;
            let stored = normalized(target, version, created_at, now)?;
            let index = with_new_head(&state.index, id, version);
            let detail = format!("content of v{target_version}");
            let audit = audit(AuditAction::Rollback, Some(id), Some(version), &detail, now);
            tracing::info!(rule_id = %id, target_version, version, "rule rolled back");
            Ok((
                Commit {
                    appended: vec![stored.clone()],
                    index,
                    audit,
                    backup: None,
                },
                stored,
            ))
        })
    }

    /// Snapshot every visible rule version under an immutable name.
    pub fn backup(&self, name: &str) -> Result<BackupManifest, RepositoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(InputError::new("backup name must not be empty").into());
        }

        self.commit(|state| {
            if self.store.list_backups()?.iter().any(|m| m.name == name) {
                return Err(RepositoryError::BackupExists {
                    name: name.to_string(),
                });
            }

            let mut versions = Vec::new();
            for id in state.index.heads.keys() {
                for mut rule in state.visible_versions(id) {
                    // statuses travel in the index
                    rule.status = RuleStatus::Draft;
                    versions.push(rule_document::to_document(&rule));
                }
            }
            let snapshot = Snapshot {
                versions,
                index: visible_index(state),
            };
            let now = Utc::now();
            let manifest = BackupManifest {
                name: name.to_string(),
                created_at: now,
                rule_count: snapshot.index.heads.len(),
                version_count: snapshot.versions.len(),
                checksum: snapshot.checksum()?,
            };
            let detail = format!("backup {name}: {} rules", manifest.rule_count);
            Ok((
                Commit {
                    appended: Vec::new(),
                    index: state.index.clone(),
                    audit: audit(AuditAction::Backup, None, None, &detail, now),
                    backup: Some(Backup {
                        manifest: manifest.clone(),
                        snapshot,
                    }),
                },
                manifest,
            ))
        })
        .inspect(|manifest| {
            tracing::info!(backup = %manifest.name, rules = manifest.rule_count, "backup written");
        })
    }

    /// Make the backed-up rule set current again in one swap.
    pub fn restore(&self, name: &str) -> Result<BackupManifest, RepositoryError> {
        let backup = self
            .store
            .load_backup(name)?
            .ok_or_else(|| RepositoryError::BackupNotFound {
                name: name.to_string(),
            })?;
        if backup.snapshot.checksum()? != backup.manifest.checksum {
            tracing::error!(backup = %name, "backup checksum mismatch");
            return Err(RepositoryError::BackupCorrupt {
                name: name.to_string(),
            });
        }
        let mut restored = Vec::with_capacity(backup.snapshot.versions.len());
        for doc in &backup.snapshot.versions {
            let rule = rule_document::rule_from_value(doc).map_err(|e| {
                tracing::error!(backup = %name, error = %e, "backup holds an unreadable rule");
                RepositoryError::BackupCorrupt {
                    name: name.to_string(),
                }
            })?;
            restored.push(rule);
        }
        let now = Utc::now();

        self.commit(|state| {
            let appended: Vec<RuleDefinition> = restored
                .into_iter()
                .filter(|r| {
                    state
                        .history
                        .get(&r.id)
                        .is_none_or(|versions| !versions.contains_key(&r.version))
                })
                .collect();
            let audit = audit(
                AuditAction::Restore,
                None,
                None,
                &format!("restored backup {name}"),
                now,
            );
            tracing::info!(backup = %name, appended = appended.len(), "backup restored");
            Ok((
                Commit {
                    appended,
                    index: backup.snapshot.index.clone(),
                    audit,
                    backup: None,
                },
                backup.manifest.clone(),
            ))
        })
    }

    pub fn list_backups(&self) -> Result<Vec<BackupManifest>, RepositoryError> {
        Ok(self.store.list_backups()?)
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.snapshot().audit.clone()
    }
}

fn audit(
    action: AuditAction,
    rule_id: Option<&str>,
    version: Option<u32>,
    detail: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry {
        action,
        rule_id: rule_id.map(str::to_string),
        version,
        detail: detail.to_string(),
        at,
    }
}

/// Stamp version and timestamps, and make sure the rule survives a
/// document round trip so the store can always reload it.
fn normalized(
    mut rule: RuleDefinition,
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<RuleDefinition, RepositoryError> {
    rule.version = version;
    rule.status = RuleStatus::Draft;
    rule.created_at = created_at;
    rule.updated_at = updated_at;
    let checked = rule_document::rule_from_value(&rule_document::to_document(&rule))?;
    Ok(checked)
}

fn with_new_head(index: &RuleIndex, id: &str, version: u32) -> RuleIndex {
    let mut index = index.clone();
    index.heads.insert(id.to_string(), version);
    index
        .statuses
        .entry(id.to_string())
        .or_default()
        .insert(version, RuleStatus::Draft);
    index
}

/// The index restricted to visible versions.
fn visible_index(state: &RepoState) -> RuleIndex {
    let mut index = RuleIndex {
        heads: state.index.heads.clone(),
        statuses: BTreeMap::new(),
    };
    for (id, head) in &state.index.heads {
        if let Some(statuses) = state.index.statuses.get(id) {
            index.statuses.insert(
                id.clone(),
                statuses.range(..=*head).map(|(v, s)| (*v, *s)).collect(),
            );
        }
    }
    index
}
