use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
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

/// SQLite-backed metadata store. Each method opens a fresh connection inside
/// `spawn_blocking`, keeping the async surface free of held file handles.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).context("open metadata db")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                backup_type TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                total_size INTEGER NOT NULL DEFAULT 0,
                table_count INTEGER NOT NULL DEFAULT 0,
                file_count INTEGER NOT NULL DEFAULT 0,
                storage_prefix TEXT NOT NULL,
                checksum TEXT,
                error_message TEXT,
                notes TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS backup_items (
                id TEXT PRIMARY KEY,
                backup_id TEXT NOT NULL,
                item_type TEXT NOT NULL,
                item_name TEXT NOT NULL,
                item_size INTEGER NOT NULL DEFAULT 0,
                record_count INTEGER NOT NULL DEFAULT 0,
                storage_key TEXT NOT NULL,
                checksum TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_labels (
                backup_id TEXT NOT NULL,
                label TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (backup_id, label)
            );
            CREATE TABLE IF NOT EXISTS rollbacks (
                id TEXT PRIMARY KEY,
                backup_id TEXT NOT NULL,
                rollback_type TEXT NOT NULL,
                status TEXT NOT NULL,
                items_restored INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                initiated_by TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                backup_id TEXT,
                backup_name TEXT,
                actor TEXT NOT NULL,
                details_json TEXT NOT NULL,
                status TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).context("open metadata db")?;
            f(&conn)
        })
        .await?
    }
}

const BACKUP_COLUMNS: &str = "id, name, description, backup_type, trigger_type, status, total_size,
    table_count, file_count, storage_prefix, checksum, error_message, notes, created_by,
    created_at, completed_at";

#[async_trait::async_trait]
impl MetadataStore for SqliteStore {
    async fn insert_backup(&self, backup: &Backup) -> Result<()> {
        let b = backup.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backups (id, name, description, backup_type, trigger_type, status,
                 total_size, table_count, file_count, storage_prefix, checksum, error_message,
                 notes, created_by, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    b.id.to_string(),
                    b.name,
                    b.description,
                    b.backup_type.as_str(),
                    b.trigger_type.as_str(),
                    b.status.as_str(),
                    b.total_size,
                    b.table_count,
                    b.file_count,
                    b.storage_prefix,
                    b.checksum,
                    b.error_message,
                    b.notes,
                    b.created_by,
                    b.created_at.to_rfc3339(),
                    b.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn finish_backup(&self, completion: &BackupCompletion) -> Result<()> {
        let c = completion.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backups SET status = ?2, total_size = ?3, table_count = ?4,
                 file_count = ?5, checksum = ?6, error_message = ?7, completed_at = ?8
                 WHERE id = ?1",
                params![
                    c.id.to_string(),
                    c.status.as_str(),
                    c.total_size,
                    c.table_count,
                    c.file_count,
                    c.checksum,
                    c.error_message,
                    c.completed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"
            ))?;
            let found = stmt
                .query_row([id.to_string()], row_to_backup)
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([], row_to_backup)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn list_expired_completed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Backup>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups
                 WHERE status = 'completed' AND created_at < ?1
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([cutoff.to_rfc3339()], row_to_backup)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn mark_backup_deleted(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE backups SET status = 'deleted' WHERE id = ?1 AND status = 'completed'",
                [id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_backup_item(&self, item: &BackupItem) -> Result<()> {
        let i = item.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_items (id, backup_id, item_type, item_name, item_size,
                 record_count, storage_key, checksum, status, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    i.id.to_string(),
                    i.backup_id.to_string(),
                    i.item_type,
                    i.item_name,
                    i.item_size,
                    i.record_count,
                    i.storage_key,
                    i.checksum,
                    i.status.as_str(),
                    i.error_message,
                    i.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_backup_items(&self, backup_id: Uuid) -> Result<Vec<BackupItem>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, backup_id, item_type, item_name, item_size, record_count,
                 storage_key, checksum, status, error_message, created_at
                 FROM backup_items WHERE backup_id = ?1 ORDER BY created_at ASC, item_name ASC",
            )?;
            let rows = stmt.query_map([backup_id.to_string()], row_to_item)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn add_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()> {
        let label = label.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO backup_labels (backup_id, label, created_at)
                 VALUES (?1, ?2, ?3)",
                params![backup_id.to_string(), label, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_backup_label(&self, backup_id: Uuid, label: &str) -> Result<()> {
        let label = label.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM backup_labels WHERE backup_id = ?1 AND label = ?2",
                params![backup_id.to_string(), label],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_backup_labels(&self, backup_id: Uuid) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT label FROM backup_labels WHERE backup_id = ?1 ORDER BY label ASC",
            )?;
            let rows = stmt.query_map([backup_id.to_string()], |r| r.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn backup_label_count(&self, backup_id: Uuid) -> Result<i64> {
        self.with_conn(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM backup_labels WHERE backup_id = ?1",
                [backup_id.to_string()],
                |r| r.get::<_, i64>(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn insert_rollback(&self, rollback: &Rollback) -> Result<()> {
        let r = rollback.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rollbacks (id, backup_id, rollback_type, status, items_restored,
                 items_failed, initiated_by, notes, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    r.id.to_string(),
                    r.backup_id.to_string(),
                    r.rollback_type.as_str(),
                    r.status.as_str(),
                    r.items_restored,
                    r.items_failed,
                    r.initiated_by,
                    r.notes,
                    r.created_at.to_rfc3339(),
                    r.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn finish_rollback(&self, completion: &RollbackCompletion) -> Result<()> {
        let c = completion.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE rollbacks SET status = ?2, items_restored = ?3, items_failed = ?4,
                 completed_at = ?5 WHERE id = ?1",
                params![
                    c.id.to_string(),
                    c.status.as_str(),
                    c.items_restored,
                    c.items_failed,
                    c.completed_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_rollback(&self, id: Uuid) -> Result<Option<Rollback>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, backup_id, rollback_type, status, items_restored, items_failed,
                 initiated_by, notes, created_at, completed_at
                 FROM rollbacks WHERE id = ?1",
            )?;
            let found = stmt
                .query_row([id.to_string()], row_to_rollback)
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn list_rollbacks(&self, backup_id: Uuid) -> Result<Vec<Rollback>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, backup_id, rollback_type, status, items_restored, items_failed,
                 initiated_by, notes, created_at, completed_at
                 FROM rollbacks WHERE backup_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([backup_id.to_string()], row_to_rollback)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn insert_activity(&self, entry: &ActivityLogEntry) -> Result<()> {
        let e = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO activity_log (id, activity_type, backup_id, backup_name, actor,
                 details_json, status, ip_address, user_agent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    e.id.to_string(),
                    e.activity_type.as_str(),
                    e.backup_id.map(|id| id.to_string()),
                    e.backup_name,
                    e.actor,
                    serde_json::to_string(&e.details)?,
                    e.status.as_str(),
                    e.ip_address,
                    e.user_agent,
                    e.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn query_activity(
        &self,
        filter: &ActivityFilter,
    ) -> Result<(Vec<ActivityLogEntry>, i64)> {
        let (where_sql, args) = activity_where(filter);
        let limit = filter.effective_limit();
        let offset = filter.offset.max(0);
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM activity_log {where_sql}"),
                rusqlite::params_from_iter(args.iter()),
                |r| r.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT id, activity_type, backup_id, backup_name, actor, details_json,
                 status, ip_address, user_agent, created_at
                 FROM activity_log {where_sql}
                 ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_activity)?;
            let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok((entries, total))
        })
        .await
    }

    async fn activity_stats(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<ActivityStats> {
        self.with_conn(move |conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM activity_log", [], |r| r.get(0))?;
            let today: i64 = conn.query_row(
                "SELECT COUNT(*) FROM activity_log WHERE created_at >= ?1 AND created_at < ?2",
                params![day_start.to_rfc3339(), day_end.to_rfc3339()],
                |r| r.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM activity_log GROUP BY status ORDER BY status",
            )?;
            let by_status = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT activity_type, COUNT(*) FROM activity_log
                 GROUP BY activity_type ORDER BY activity_type",
            )?;
            let by_type = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(ActivityStats {
                total,
                today,
                by_status,
                by_type,
            })
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_owned();
        self.with_conn(move |conn| {
            let value = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                    r.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

/// Builds the conjunctive WHERE clause for activity queries. All parameters
/// are TEXT, so they travel as one `Vec<String>`.
fn activity_where(filter: &ActivityFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(t) = filter.activity_type {
        args.push(t.as_str().to_owned());
        clauses.push(format!("activity_type = ?{}", args.len()));
    }
    if let Some(id) = filter.backup_id {
        args.push(id.to_string());
        clauses.push(format!("backup_id = ?{}", args.len()));
    }
    if let Some(actor) = &filter.actor {
        args.push(actor.clone());
        clauses.push(format!("actor = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(status.as_str().to_owned());
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(from) = filter.from {
        args.push(from.to_rfc3339());
        clauses.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(to) = filter.to {
        args.push(to.to_rfc3339());
        clauses.push(format!("created_at <= ?{}", args.len()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

fn row_to_backup(row: &rusqlite::Row) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        backup_type: BackupType::parse(&row.get::<_, String>(3)?),
        trigger_type: TriggerType::parse(&row.get::<_, String>(4)?),
        status: BackupStatus::parse(&row.get::<_, String>(5)?),
        total_size: row.get(6)?,
        table_count: row.get(7)?,
        file_count: row.get(8)?,
        storage_prefix: row.get(9)?,
        checksum: row.get(10)?,
        error_message: row.get(11)?,
        notes: row.get(12)?,
        created_by: row.get(13)?,
        created_at: parse_ts(row.get::<_, String>(14)?),
        completed_at: row.get::<_, Option<String>>(15)?.map(parse_ts),
    })
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<BackupItem> {
    Ok(BackupItem {
        id: parse_uuid(row.get::<_, String>(0)?),
        backup_id: parse_uuid(row.get::<_, String>(1)?),
        item_type: row.get(2)?,
        item_name: row.get(3)?,
        item_size: row.get(4)?,
        record_count: row.get(5)?,
        storage_key: row.get(6)?,
        checksum: row.get(7)?,
        status: ItemStatus::parse(&row.get::<_, String>(8)?),
        error_message: row.get(9)?,
        created_at: parse_ts(row.get::<_, String>(10)?),
    })
}

fn row_to_rollback(row: &rusqlite::Row) -> rusqlite::Result<Rollback> {
    Ok(Rollback {
        id: parse_uuid(row.get::<_, String>(0)?),
        backup_id: parse_uuid(row.get::<_, String>(1)?),
        rollback_type: RollbackType::parse(&row.get::<_, String>(2)?),
        status: RollbackStatus::parse(&row.get::<_, String>(3)?),
        items_restored: row.get(4)?,
        items_failed: row.get(5)?,
        initiated_by: row.get(6)?,
        notes: row.get(7)?,
        created_at: parse_ts(row.get::<_, String>(8)?),
        completed_at: row.get::<_, Option<String>>(9)?.map(parse_ts),
    })
}

fn row_to_activity(row: &rusqlite::Row) -> rusqlite::Result<ActivityLogEntry> {
    let details_json: String = row.get(5)?;
    Ok(ActivityLogEntry {
        id: parse_uuid(row.get::<_, String>(0)?),
        activity_type: ActivityType::parse(&row.get::<_, String>(1)?)
            .unwrap_or(ActivityType::SettingsUpdated),
        backup_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        backup_name: row.get(3)?,
        actor: row.get(4)?,
        details: serde_json::from_str(&details_json).unwrap_or(serde_json::Value::Null),
        status: ActivityStatus::parse(&row.get::<_, String>(6)?),
        ip_address: row.get(7)?,
        user_agent: row.get(8)?,
        created_at: parse_ts(row.get::<_, String>(9)?),
    })
}

fn parse_uuid(raw: String) -> Uuid {
    Uuid::parse_str(&raw).unwrap_or_else(|_| Uuid::nil())
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
