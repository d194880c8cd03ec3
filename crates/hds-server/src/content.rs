//! Content/backup collaborator interface.
//!
//! The archival engine itself lives outside this crate; the orchestration
//! core drives it through promise-style operations that resolve to a
//! success flag and an optional error string.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Resolution of a deferred backup operation.
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error description when it did not.
    pub error: Option<String>,
}

impl BackupOutcome {
    /// A successful outcome.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One stored backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    /// Backup identifier.
    pub id: String,
    /// Operator-supplied name.
    pub name: String,
    /// When the backup was created.
    pub created_at: DateTime<Utc>,
}

/// The backup/content surface the admin API drives.
#[async_trait]
pub trait ContentManager: Send + Sync {
    /// Create a backup with the given name.
    async fn create_backup(&self, name: &str) -> BackupOutcome;

    /// Restore the world from a backup.
    async fn recover_from_backup(&self, id: &str) -> BackupOutcome;

    /// Delete a backup.
    async fn delete_backup(&self, id: &str) -> BackupOutcome;

    /// Consolidate a backup into a downloadable archive.
    async fn consolidate_backup(&self, id: &str) -> BackupOutcome;

    /// List stored backups.
    async fn list_backups(&self) -> Vec<BackupInfo>;
}

/// In-memory content manager used in tests and unconfigured deployments.
#[derive(Debug, Default)]
pub struct InMemoryContentManager {
    backups: Mutex<Vec<BackupInfo>>,
}

impl InMemoryContentManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentManager for InMemoryContentManager {
    async fn create_backup(&self, name: &str) -> BackupOutcome {
        let mut backups = self.backups.lock();
        let id = format!("backup-{}", backups.len() + 1);
        backups.push(BackupInfo {
            id,
            name: name.to_owned(),
            created_at: Utc::now(),
        });
        BackupOutcome::ok()
    }

    async fn recover_from_backup(&self, id: &str) -> BackupOutcome {
        if self.backups.lock().iter().any(|backup| backup.id == id) {
            BackupOutcome::ok()
        } else {
            BackupOutcome::failed(format!("no backup with id {id}"))
        }
    }

    async fn delete_backup(&self, id: &str) -> BackupOutcome {
        let mut backups = self.backups.lock();
        let before = backups.len();
        backups.retain(|backup| backup.id != id);
        if backups.len() == before {
            BackupOutcome::failed(format!("no backup with id {id}"))
        } else {
            BackupOutcome::ok()
        }
    }

    async fn consolidate_backup(&self, id: &str) -> BackupOutcome {
        if self.backups.lock().iter().any(|backup| backup.id == id) {
            BackupOutcome::ok()
        } else {
            BackupOutcome::failed(format!("no backup with id {id}"))
        }
    }

    async fn list_backups(&self) -> Vec<BackupInfo> {
        self.backups.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_delete_round_trip() {
        let manager = InMemoryContentManager::new();

        assert!(manager.create_backup("before-event").await.success);
        let backups = manager.list_backups().await;
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].name, "before-event");

        assert!(manager.delete_backup(&backups[0].id).await.success);
        assert!(manager.list_backups().await.is_empty());
    }

    #[tokio::test]
    async fn operations_on_missing_backups_fail_with_an_error() {
        let manager = InMemoryContentManager::new();
        let outcome = manager.recover_from_backup("missing").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("missing"));
    }
}
