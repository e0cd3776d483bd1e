//! In-memory rule store for tests and throwaway repositories.
//!
//! Writes can be made to fail on demand, and stored backups can be tampered
//! with, to exercise the repository's failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::error::StorageError;
use crate::domain::repository::{AuditEntry, Backup, BackupManifest, Commit, RuleIndex, StoredState};
use crate::domain::rule::RuleDefinition;
use crate::ports::rule_store_port::RuleStore;

#[derive(Default)]
struct Inner {
    versions: BTreeMap<(String, u32), RuleDefinition>,
    index: RuleIndex,
    audit: Vec<AuditEntry>,
    backups: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryRuleStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Rewrite a stored backup in place, bypassing its checksum.
    pub fn tamper_backup(&self, name: &str, edit: impl FnOnce(&mut Backup)) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let raw = inner
            .backups
            .get(name)
            .ok_or_else(|| StorageError::new(format!("no backup named {name}")))?;
        let mut backup: Backup = serde_json::from_str(raw)?;
        edit(&mut backup);
        let raw = serde_json::to_string(&backup)?;
        inner.backups.insert(name.to_string(), raw);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::new("injected write failure"));
        }
        Ok(())
    }
}

impl RuleStore for MemoryRuleStore {
    fn load(&self) -> Result<StoredState, StorageError> {
        let inner = self.lock();
        Ok(StoredState {
            versions: inner.versions.values().cloned().collect(),
            index: inner.index.clone(),
            audit: inner.audit.clone(),
        })
    }

    fn commit(&self, commit: &Commit) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.lock();
        for rule in &commit.appended {
            if inner.versions.contains_key(&(rule.id.clone(), rule.version)) {
                return Err(StorageError::new(format!(
                    "rule {} version {} is already stored",
                    rule.id, rule.version
                )));
            }
        }
        let backup = match &commit.backup {
            Some(backup) if inner.backups.contains_key(&backup.manifest.name) => {
                return Err(StorageError::new(format!(
                    "backup {} already stored",
                    backup.manifest.name
                )));
            }
            Some(backup) => Some((backup.manifest.name.clone(), serde_json::to_string(backup)?)),
            None => None,
        };

        for rule in &commit.appended {
            inner
                .versions
                .insert((rule.id.clone(), rule.version), rule.clone());
        }
        inner.index = commit.index.clone();
        inner.audit.push(commit.audit.clone());
        if let Some((name, raw)) = backup {
            inner.backups.insert(name, raw);
        }
        Ok(())
    }

    fn load_backup(&self, name: &str) -> Result<Option<Backup>, StorageError> {
        let inner = self.lock();
        match inner.backups.get(name) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn list_backups(&self) -> Result<Vec<BackupManifest>, StorageError> {
        let inner = self.lock();
        let mut manifests = Vec::new();
        for raw in inner.backups.values() {
            let backup: Backup = serde_json::from_str(raw)?;
            manifests.push(backup.manifest);
        }
        Ok(manifests)
    }
}
