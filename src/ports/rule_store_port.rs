//! Rule repository persistence port.
//!
//! Implementations must apply a [`Commit`] all-or-nothing: either every
//! appended version, the new index, the audit entry and any backup are
//! stored, or none.

use crate::domain::error::StorageError;
use crate::domain::repository::{Backup, BackupManifest, Commit, StoredState};

pub trait RuleStore: Send + Sync {
    fn load(&self) -> Result<StoredState, StorageError>;

    /// Fails without writing anything if the commit carries a backup whose
    /// name is already taken.
    fn commit(&self, commit: &Commit) -> Result<(), StorageError>;

    fn load_backup(&self, name: &str) -> Result<Option<Backup>, StorageError>;

    fn list_backups(&self) -> Result<Vec<BackupManifest>, StorageError>;
}
