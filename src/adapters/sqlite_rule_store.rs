//! SQLite-backed rule store.
//!
//! Rule versions are rows of JSON documents that are only ever inserted. The
//! index is a single JSON row replaced on each commit, and every commit runs
//! in one transaction.

use crate::domain::error::{RulescanError, StorageError};
use crate::domain::repository::{AuditEntry, Backup, BackupManifest, Commit, RuleIndex, StoredState};
use crate::domain::rule_document;
use crate::ports::rule_store_port::RuleStore;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};

pub struct SqliteRuleStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteRuleStore {
    /// Open (or create) a rule store at `path`.
    pub fn open(path: &str) -> Result<Self, RulescanError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(|e: r2d2::Error| StorageError::new(format!("opening {path}: {e}")))?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, RulescanError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(StorageError::from)?;
        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rule_versions (
                rule_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (rule_id, version)
            );
            CREATE TABLE IF NOT EXISTS rule_index (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backups (
                name TEXT PRIMARY KEY,
                manifest TEXT NOT NULL,
                snapshot TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }
}

impl RuleStore for SqliteRuleStore {
    fn load(&self) -> Result<StoredState, StorageError> {
        let conn = self.conn()?;

        let mut stmt =
            conn.prepare("SELECT rule_id, version, document FROM rule_versions ORDER BY rule_id, version")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut versions = Vec::new();
        for row in rows {
            let (rule_id, version, document) = row?;
            let rule = rule_document::rule_from_str(&document).map_err(|e| {
                StorageError::new(format!("stored rule {rule_id} v{version} is unreadable: {e}"))
            })?;
            versions.push(rule);
        }

        let index = match conn
            .query_row("SELECT payload FROM rule_index WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
        {
            Some(payload) => serde_json::from_str(&payload)?,
            None => RuleIndex::default(),
        };

        let mut stmt = conn.prepare("SELECT payload FROM audit_log ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut audit = Vec::new();
        for row in rows {
            let entry: AuditEntry = serde_json::from_str(&row?)?;
            audit.push(entry);
        }

        Ok(StoredState {
            versions,
            index,
            audit,
        })
    }

    fn commit(&self, commit: &Commit) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let index = serde_json::to_string(&commit.index)?;
        let audit = serde_json::to_string(&commit.audit)?;

        let tx = conn.transaction()?;
        for rule in &commit.appended {
            let document = rule_document::to_document(rule).to_string();
            tx.execute(
                "INSERT INTO rule_versions (rule_id, version, document) VALUES (?1, ?2, ?3)",
                params![rule.id, rule.version, document],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO rule_index (id, payload) VALUES (1, ?1)",
            params![index],
        )?;
        tx.execute("INSERT INTO audit_log (payload) VALUES (?1)", params![audit])?;
        if let Some(backup) = &commit.backup {
            let manifest = serde_json::to_string(&backup.manifest)?;
            let snapshot = serde_json::to_string(&backup.snapshot)?;
            tx.execute(
                "INSERT INTO backups (name, manifest, snapshot) VALUES (?1, ?2, ?3)",
                params![backup.manifest.name, manifest, snapshot],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_backup(&self, name: &str) -> Result<Option<Backup>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT manifest, snapshot FROM backups WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((manifest, snapshot)) => Ok(Some(Backup {
                manifest: serde_json::from_str(&manifest)?,
                snapshot: serde_json::from_str(&snapshot)?,
            })),
            None => Ok(None),
        }
    }

    fn list_backups(&self) -> Result<Vec<BackupManifest>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT manifest FROM backups ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut manifests = Vec::new();
        for row in rows {
            manifests.push(serde_json::from_str(&row?)?);
        }
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::{AuditAction, RuleRepository};
    use crate::domain::rule::RuleStatus;
    use std::sync::Arc;

    const DOC: &str = r#"{
        "id": "vol-breakout",
        "name": "Volume breakout",
        "rule_type": "breakout",
        "author": "desk",
        "parameters": {"volume_multiplier_min": 1.5, "price_move_pct_min": 1.0},
        "time_window": {
            "signal_window_start": "09:30",
            "signal_window_end": "10:30",
            "cutoff_time": "10:30",
            "performance_start_time": "10:30",
            "performance_end_time": "16:00"
        },
        "universe_filter": {"min_price": 1.0, "max_price": 500.0, "min_volume": 10000}
    }"#;

    #[test]
    fn in_memory_initialization() {
        let store = SqliteRuleStore::in_memory().unwrap();
        let state = store.load().unwrap();
        assert!(state.versions.is_empty());
        assert!(state.index.heads.is_empty());
    }

    #[test]
    fn repository_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.db");
        let path = path.to_str().unwrap();

        {
            let store = Arc::new(SqliteRuleStore::open(path).unwrap());
            let repo = RuleRepository::open(store).unwrap();
            let rule = rule_document::rule_from_str(DOC).unwrap();
            repo.create(rule.clone()).unwrap();
            repo.update(rule).unwrap();
            repo.set_status("vol-breakout", 2, RuleStatus::Enabled).unwrap();
            repo.backup("nightly").unwrap();
        }

        let store = Arc::new(SqliteRuleStore::open(path).unwrap());
        let repo = RuleRepository::open(store).unwrap();
        let history = repo.history("vol-breakout").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, RuleStatus::Enabled);
        assert_eq!(repo.list_backups().unwrap().len(), 1);
        assert_eq!(
            repo.audit_log().last().map(|e| e.action),
            Some(AuditAction::Backup)
        );
    }

    #[test]
    fn duplicate_version_insert_rolls_back_commit() {
        let store = SqliteRuleStore::in_memory().unwrap();
        let rule = rule_document::rule_from_str(DOC).unwrap();
        let entry = AuditEntry {
            action: AuditAction::Create,
            rule_id: Some(rule.id.clone()),
            version: Some(rule.version),
            detail: String::new(),
            at: chrono::Utc::now(),
        };
        let commit = Commit {
            appended: vec![rule.clone()],
            index: RuleIndex::default(),
            audit: entry,
            backup: None,
        };
        store.commit(&commit).unwrap();
        assert!(store.commit(&commit).is_err());

        let state = store.load().unwrap();
        assert_eq!(state.versions.len(), 1);
        assert_eq!(state.audit.len(), 1);
    }

    fn audit_entry(action: AuditAction) -> AuditEntry {
        AuditEntry {
            action,
            rule_id: None,
            version: None,
            detail: String::new(),
            at: chrono::Utc::now(),
        }
    }

    #[test]
    fn backup_is_written_with_its_audit_entry() {
        let store = SqliteRuleStore::in_memory().unwrap();
        let backup = Backup {
            manifest: BackupManifest {
                name: "b1".into(),
                created_at: chrono::Utc::now(),
                rule_count: 0,
                version_count: 0,
                checksum: "x".into(),
            },
            snapshot: crate::domain::repository::Snapshot {
                versions: Vec::new(),
                index: RuleIndex::default(),
            },
        };
        let commit = Commit {
            appended: Vec::new(),
            index: RuleIndex::default(),
            audit: audit_entry(AuditAction::Backup),
            backup: Some(backup.clone()),
        };
        store.commit(&commit).unwrap();

        // the duplicate name aborts the whole transaction, audit row included
        assert!(store.commit(&commit).is_err());
        assert_eq!(store.load().unwrap().audit.len(), 1);
        assert_eq!(store.list_backups().unwrap().len(), 1);
        assert_eq!(store.load_backup("b1").unwrap(), Some(backup));
        assert!(store.load_backup("b2").unwrap().is_none());
    }
}
