use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry};
use tablevault_core::{Backup, BackupItem, Rollback};
use tablevault_storage::{BlobStore, MetadataStore, TableRegistry};
use thiserror::Error;
use uuid::Uuid;

pub mod activity;
pub mod backup;
pub mod bundle;
pub mod integrity;
pub mod retention;
pub mod scheduler;

mod rollback;

pub use activity::ActivityPage;
pub use backup::CreateBackupRequest;
pub use bundle::ExportBundle;
pub use integrity::{CheckStatus, IntegrityCheck, IntegrityReport};
pub use retention::RetentionOutcome;
pub use rollback::{CreateRollbackRequest, RollbackOutcome};
pub use scheduler::{CronExpr, ScheduleConfig, ScheduleStatus, Scheduler, TickOutcome};

/// Typed refusals raised before an operation creates any record. Everything
/// past a precondition check is caught and persisted instead of raised.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("backup {0} not found")]
    BackupNotFound(Uuid),
    #[error("backup {id} cannot be restored from (status: {status})")]
    BackupNotRestorable { id: Uuid, status: &'static str },
    #[error("backup {id} cannot be exported (status: {status})")]
    BackupNotExportable { id: Uuid, status: &'static str },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("table catalog is empty")]
    EmptyCatalog,
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

/// Shared wiring for all orchestrators: the metadata store, the blob store,
/// and the closed table catalog.
pub struct Engine {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) registry: Arc<TableRegistry>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<TableRegistry>,
    ) -> Self {
        Self {
            store,
            blobs,
            registry,
        }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        self.store.get_backup(id).await
    }

    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.store.list_backups().await
    }

    pub async fn list_backup_items(&self, backup_id: Uuid) -> Result<Vec<BackupItem>> {
        self.store.list_backup_items(backup_id).await
    }

    pub async fn list_rollbacks(&self, backup_id: Uuid) -> Result<Vec<Rollback>> {
        self.store.list_rollbacks(backup_id).await
    }

    pub async fn list_backup_labels(&self, backup_id: Uuid) -> Result<Vec<String>> {
        self.store.list_backup_labels(backup_id).await
    }

    pub async fn add_backup_label(&self, backup_id: Uuid, label: &str, actor: &str) -> Result<()> {
        self.store.add_backup_label(backup_id, label).await?;
        self.log_activity(
            NewActivityLogEntry::new(ActivityType::LabelAdded, actor, ActivityStatus::Success)
                .with_backup(backup_id, String::new())
                .with_details(json!({ "label": label })),
        )
        .await;
        Ok(())
    }

    pub async fn remove_backup_label(
        &self,
        backup_id: Uuid,
        label: &str,
        actor: &str,
    ) -> Result<()> {
        self.store.remove_backup_label(backup_id, label).await?;
        self.log_activity(
            NewActivityLogEntry::new(ActivityType::LabelRemoved, actor, ActivityStatus::Success)
                .with_backup(backup_id, String::new())
                .with_details(json!({ "label": label })),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil;
