use anyhow::Result;
use chrono::{DateTime, Utc};
use tablevault_core::{
    ActivityFilter, ActivityLogEntry, ActivityStats, Backup, BackupCompletion, BackupItem,
    Rollback, RollbackCompletion,
};
use uuid::Uuid;

/// Pure metadata-database operations, implemented by both SQLite and Postgres backends.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a fresh in-progress backup row.
    async fn insert_backup(&self, backup: &Backup) -> Result<()>;

    /// Apply the single final update to a backup row once its run ends.
    async fn finish_backup(&self, completion: &BackupCompletion) -> Result<()>;

    /// Get a single backup by id.
    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>>;

    /// List all backups ordered by created_at DESC.
    async fn list_backups(&self) -> Result<Vec<Backup>>;

    /// Completed backups created strictly before `cutoff` (retention candidates).
    async fn list_expired_completed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>>;

    /// Soft-delete: completed -> deleted is the only transition this performs.
    /// Returns whether a row actually changed state.
    async fn mark_backup_deleted(&self, id: Uuid) -> Result<bool>;

    /// Record one table's export attempt. Insert-only.
    async fn insert_backup_item(&self, item: &BackupItem) -> Result<()>;

    /// Items belonging to one backup, in insertion order.
    async fn list_backup_items(&self, backup_id: Uuid) -> Result<Vec<BackupItem>>;

    async fn add_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()>;

    async fn remove_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()>;

    async fn list_backup_labels(&self, backup_id: Uuid) -> Result<Vec<String>>;

    /// Number of labels assigned to a backup (retention protection predicate).
    async fn backup_label_count(&self, backup_id: Uuid) -> Result<i64>;

    /// Insert a fresh in-progress rollback row.
    async fn insert_rollback(&self, rollback: &Rollback) -> Result<()>;

    /// Apply the final update to a rollback row once its run ends.
    async fn finish_rollback(&self, completion: &RollbackCompletion) -> Result<()>;

    async fn get_rollback(&self, id: Uuid) -> Result<Option<Rollback>>;

    /// Rollbacks against one source backup, newest first.
    async fn list_rollbacks(&self, backup_id: Uuid) -> Result<Vec<Rollback>>;

    /// Append one audit record.
    async fn insert_activity(&self, entry: &ActivityLogEntry) -> Result<()>;

    /// Filtered page of audit records plus the unpaginated total.
    async fn query_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<(Vec<ActivityLogEntry>, i64)>;

    /// Aggregate counters; `[day_start, day_end)` bounds the "today" bucket.
    async fn activity_stats(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<ActivityStats>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Upsert a settings key.
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}
