use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tablevault_core::model::{
    ActivityStatus, ActivityType, BackupStatus, BackupType, ItemStatus, RollbackStatus,
    RollbackType, TriggerType,
};
use tablevault_core::{
    ActivityFilter, ActivityLogEntry, ActivityStats, Backup, BackupCompletion, BackupItem,
    Rollback, RollbackCompletion,
};
use uuid::Uuid;

use crate::store::MetadataStore;

/// Postgres-backed metadata store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backups (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                backup_type TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                total_size BIGINT NOT NULL DEFAULT 0,
                table_count INT NOT NULL DEFAULT 0,
                file_count INT NOT NULL DEFAULT 0,
                storage_prefix TEXT NOT NULL,
                checksum TEXT,
                error_message TEXT,
                notes TEXT,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backups table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_items (
                id UUID PRIMARY KEY,
                backup_id UUID NOT NULL,
                item_type TEXT NOT NULL,
                item_name TEXT NOT NULL,
                item_size BIGINT NOT NULL DEFAULT 0,
                record_count BIGINT NOT NULL DEFAULT 0,
                storage_key TEXT NOT NULL,
                checksum TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_items table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_labels (
                backup_id UUID NOT NULL,
                label TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (backup_id, label)
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_labels table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rollbacks (
                id UUID PRIMARY KEY,
                backup_id UUID NOT NULL,
                rollback_type TEXT NOT NULL,
                status TEXT NOT NULL,
                items_restored INT NOT NULL DEFAULT 0,
                items_failed INT NOT NULL DEFAULT 0,
                initiated_by TEXT NOT NULL,
                notes TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await
        .context("create rollbacks table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS activity_log (
                id UUID PRIMARY KEY,
                activity_type TEXT NOT NULL,
                backup_id UUID,
                backup_name TEXT,
                actor TEXT NOT NULL,
                details_json TEXT NOT NULL,
                status TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create activity_log table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create settings table")?;

        Ok(())
    }
}

const BACKUP_COLUMNS: &str = "id, name, description, backup_type, trigger_type, status, total_size,
    table_count, file_count, storage_prefix, checksum, error_message, notes, created_by,
    created_at, completed_at";

#[async_trait::async_trait]
impl MetadataStore for PostgresStore {
    async fn insert_backup(&self, backup: &Backup) -> Result<()> {
        sqlx::query(
            "INSERT INTO backups (id, name, description, backup_type, trigger_type, status,
             total_size, table_count, file_count, storage_prefix, checksum, error_message,
             notes, created_by, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(backup.id)
        .bind(&backup.name)
        .bind(&backup.description)
        .bind(backup.backup_type.as_str())
        .bind(backup.trigger_type.as_str())
        .bind(backup.status.as_str())
        .bind(backup.total_size)
        .bind(backup.table_count)
        .bind(backup.file_count)
        .bind(&backup.storage_prefix)
        .bind(&backup.checksum)
        .bind(&backup.error_message)
        .bind(&backup.notes)
        .bind(&backup.created_by)
        .bind(backup.created_at)
        .bind(backup.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_backup(&self, completion: &BackupCompletion) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET status = $2, total_size = $3, table_count = $4, file_count = $5,
             checksum = $6, error_message = $7, completed_at = $8 WHERE id = $1",
        )
        .bind(completion.id)
        .bind(completion.status.as_str())
        .bind(completion.total_size)
        .bind(completion.table_count)
        .bind(completion.file_count)
        .bind(&completion.checksum)
        .bind(&completion.error_message)
        .bind(completion.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pg_row_to_backup).transpose()
    }

    async fn list_backups(&self) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn list_expired_completed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE status = 'completed' AND created_at < $1
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_backup).collect()
    }

    async fn mark_backup_deleted(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backups SET status = 'deleted' WHERE id = $1 AND status = 'completed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_backup_item(&self, item: &BackupItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_items (id, backup_id, item_type, item_name, item_size,
             record_count, storage_key, checksum, status, error_message, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(item.id)
        .bind(item.backup_id)
        .bind(&item.item_type)
        .bind(&item.item_name)
        .bind(item.item_size)
        .bind(item.record_count)
        .bind(&item.storage_key)
        .bind(&item.checksum)
        .bind(item.status.as_str())
        .bind(&item.error_message)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backup_items(&self, backup_id: Uuid) -> Result<Vec<BackupItem>> {
        let rows = sqlx::query(
            "SELECT id, backup_id, item_type, item_name, item_size, record_count, storage_key,
             checksum, status, error_message, created_at
             FROM backup_items WHERE backup_id = $1 ORDER BY created_at ASC, item_name ASC",
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_item).collect()
    }

    async fn add_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_labels (backup_id, label, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (backup_id, label) DO NOTHING",
        )
        .bind(backup_id)
        .bind(label)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()> {
        sqlx::query("DELETE FROM backup_labels WHERE backup_id = $1 AND label = $2")
            .bind(backup_id)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_backup_labels(&self, backup_id: Uuid) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT label FROM backup_labels WHERE backup_id = $1 ORDER BY label ASC")
                .bind(backup_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("label")).collect())
    }

    async fn backup_label_count(&self, backup_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM backup_labels WHERE backup_id = $1")
            .bind(backup_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn insert_rollback(&self, rollback: &Rollback) -> Result<()> {
        sqlx::query(
            "INSERT INTO rollbacks (id, backup_id, rollback_type, status, items_restored,
             items_failed, initiated_by, notes, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(rollback.id)
        .bind(rollback.backup_id)
        .bind(rollback.rollback_type.as_str())
        .bind(rollback.status.as_str())
        .bind(rollback.items_restored)
        .bind(rollback.items_failed)
        .bind(&rollback.initiated_by)
        .bind(&rollback.notes)
        .bind(rollback.created_at)
        .bind(rollback.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_rollback(&self, completion: &RollbackCompletion) -> Result<()> {
        sqlx::query(
            "UPDATE rollbacks SET status = $2, items_restored = $3, items_failed = $4,
             completed_at = $5 WHERE id = $1",
        )
        .bind(completion.id)
        .bind(completion.status.as_str())
        .bind(completion.items_restored)
        .bind(completion.items_failed)
        .bind(completion.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_rollback(&self, id: Uuid) -> Result<Option<Rollback>> {
        let row = sqlx::query(
            "SELECT id, backup_id, rollback_type, status, items_restored, items_failed,
             initiated_by, notes, created_at, completed_at FROM rollbacks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pg_row_to_rollback).transpose()
    }

    async fn list_rollbacks(&self, backup_id: Uuid) -> Result<Vec<Rollback>> {
        let rows = sqlx::query(
            "SELECT id, backup_id, rollback_type, status, items_restored, items_failed,
             initiated_by, notes, created_at, completed_at
             FROM rollbacks WHERE backup_id = $1 ORDER BY created_at DESC",
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pg_row_to_rollback).collect()
    }

    async fn insert_activity(&self, entry: &ActivityLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_log (id, activity_type, backup_id, backup_name, actor,
             details_json, status, ip_address, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id)
        .bind(entry.activity_type.as_str())
        .bind(entry.backup_id)
        .bind(&entry.backup_name)
        .bind(&entry.actor)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(entry.status.as_str())
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<(Vec<ActivityLogEntry>, i64)> {
        let activity_type = filter.activity_type.map(|t| t.as_str().to_owned());
        let status = filter.status.map(|s| s.as_str().to_owned());

        const WHERE: &str = "WHERE ($1::text IS NULL OR activity_type = $1)
            AND ($2::uuid IS NULL OR backup_id = $2)
            AND ($3::text IS NULL OR actor = $3)
            AND ($4::text IS NULL OR status = $4)
            AND ($5::timestamptz IS NULL OR created_at >= $5)
            AND ($6::timestamptz IS NULL OR created_at <= $6)";

        let total_row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM activity_log {WHERE}"))
            .bind(&activity_type)
            .bind(filter.backup_id)
            .bind(&filter.actor)
            .bind(&status)
            .bind(filter.from)
            .bind(filter.to)
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = total_row.get("n");

        let rows = sqlx::query(&format!(
            "SELECT id, activity_type, backup_id, backup_name, actor, details_json, status,
             ip_address, user_agent, created_at
             FROM activity_log {WHERE}
             ORDER BY created_at DESC LIMIT $7 OFFSET $8"
        ))
        .bind(&activity_type)
        .bind(filter.backup_id)
        .bind(&filter.actor)
        .bind(&status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.effective_limit())
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(pg_row_to_activity)
            .collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    async fn activity_stats(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<ActivityStats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM activity_log")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let today: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM activity_log WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(day_start)
        .bind(day_end)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let by_status = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM activity_log GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect();

        let by_type = sqlx::query(
            "SELECT activity_type, COUNT(*) AS n FROM activity_log
             GROUP BY activity_type ORDER BY activity_type",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| (r.get::<String, _>("activity_type"), r.get::<i64, _>("n")))
        .collect();

        Ok(ActivityStats {
            total,
            today,
            by_status,
            by_type,
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value,
             updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn pg_row_to_backup(row: &sqlx::postgres::PgRow) -> Result<Backup> {
    Ok(Backup {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        backup_type: BackupType::parse(row.get("backup_type")),
        trigger_type: TriggerType::parse(row.get("trigger_type")),
        status: BackupStatus::parse(row.get("status")),
        total_size: row.get("total_size"),
        table_count: row.get("table_count"),
        file_count: row.get("file_count"),
        storage_prefix: row.get("storage_prefix"),
        checksum: row.get("checksum"),
        error_message: row.get("error_message"),
        notes: row.get("notes"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn pg_row_to_item(row: &sqlx::postgres::PgRow) -> Result<BackupItem> {
    Ok(BackupItem {
        id: row.get("id"),
        backup_id: row.get("backup_id"),
        item_type: row.get("item_type"),
        item_name: row.get("item_name"),
        item_size: row.get("item_size"),
        record_count: row.get("record_count"),
        storage_key: row.get("storage_key"),
        checksum: row.get("checksum"),
        status: ItemStatus::parse(row.get("status")),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

fn pg_row_to_rollback(row: &sqlx::postgres::PgRow) -> Result<Rollback> {
    Ok(Rollback {
        id: row.get("id"),
        backup_id: row.get("backup_id"),
        rollback_type: RollbackType::parse(row.get("rollback_type")),
        status: RollbackStatus::parse(row.get("status")),
        items_restored: row.get("items_restored"),
        items_failed: row.get("items_failed"),
        initiated_by: row.get("initiated_by"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn pg_row_to_activity(row: &sqlx::postgres::PgRow) -> Result<ActivityLogEntry> {
    let details_json: String = row.get("details_json");
    Ok(ActivityLogEntry {
        id: row.get("id"),
        activity_type: ActivityType::parse(row.get("activity_type"))
            .unwrap_or(ActivityType::SettingsUpdated),
        backup_id: row.get("backup_id"),
        backup_name: row.get("backup_name"),
        actor: row.get("actor"),
        details: serde_json::from_str(&details_json).unwrap_or(serde_json::Value::Null),
        status: ActivityStatus::parse(row.get("status")),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        created_at: row.get("created_at"),
    })
}
