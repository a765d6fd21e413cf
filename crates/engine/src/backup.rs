use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry};
use tablevault_core::{
    keys, payload_checksum, Backup, BackupCompletion, BackupItem, BackupStatus, BackupType,
    Manifest, TriggerType,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct CreateBackupRequest {
    pub name: String,
    pub description: Option<String>,
    pub backup_type: BackupType,
    pub trigger_type: TriggerType,
    pub created_by: String,
    /// Subset of the catalog to capture; `None` means every registered table.
    pub tables: Option<Vec<String>>,
}

impl Engine {
    /// Drive a full or partial backup. The in-progress row is inserted before
    /// any export starts; per-table failures are recorded and skipped over;
    /// the row always leaves in_progress before this returns.
    pub async fn create_backup(&self, request: CreateBackupRequest) -> Result<Backup> {
        let tables = self.resolve_tables(request.tables.as_deref())?;

        let backup = Backup::begin(
            request.name,
            request.description,
            request.backup_type,
            request.trigger_type,
            request.created_by.clone(),
        );
        // Fail fast with no record when the data layer is unreachable.
        self.store
            .insert_backup(&backup)
            .await
            .context("create backup record")?;

        let completion = match self.run_backup(&backup, &tables).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(backup_id = %backup.id, error = %e, "backup run aborted");
                BackupCompletion {
                    id: backup.id,
                    status: BackupStatus::Failed,
                    total_size: 0,
                    table_count: 0,
                    file_count: 0,
                    checksum: None,
                    error_message: Some(format!("{e:#}")),
                    completed_at: Utc::now(),
                }
            }
        };
        self.store
            .finish_backup(&completion)
            .await
            .context("persist backup outcome")?;

        let final_state = self
            .store
            .get_backup(backup.id)
            .await?
            .ok_or(EngineError::BackupNotFound(backup.id))?;

        let log_status = match final_state.status {
            BackupStatus::Failed => ActivityStatus::Failed,
            _ if final_state.error_message.is_some() => ActivityStatus::Warning,
            _ => ActivityStatus::Success,
        };
        self.log_activity(
            NewActivityLogEntry::new(
                ActivityType::BackupCreated,
                request.created_by,
                log_status,
            )
            .with_backup(final_state.id, final_state.name.clone())
            .with_details(json!({
                "backup_type": final_state.backup_type,
                "trigger_type": final_state.trigger_type,
                "table_count": final_state.table_count,
                "total_size": final_state.total_size,
                "error_message": final_state.error_message,
            })),
        )
        .await;

        info!(
            backup_id = %final_state.id,
            status = final_state.status.as_str(),
            tables = final_state.table_count,
            "backup finished"
        );
        Ok(final_state)
    }

    fn resolve_tables(&self, requested: Option<&[String]>) -> Result<Vec<String>> {
        let tables = match requested {
            Some(list) => {
                for name in list {
                    if self.registry.get(name).is_none() {
                        return Err(EngineError::UnknownTable(name.clone()).into());
                    }
                }
                list.to_vec()
            }
            None => self.registry.table_names(),
        };
        if tables.is_empty() {
            return Err(EngineError::EmptyCatalog.into());
        }
        Ok(tables)
    }

    async fn run_backup(&self, backup: &Backup, tables: &[String]) -> Result<BackupCompletion> {
        let mut captured = Vec::new();
        let mut total_size = 0i64;
        let mut failures: Vec<(String, String)> = Vec::new();

        for table in tables {
            match self.export_table(backup.id, table).await {
                Ok(item) => {
                    total_size += item.item_size;
                    self.store
                        .insert_backup_item(&item)
                        .await
                        .context("record backup item")?;
                    captured.push(table.clone());
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!(backup_id = %backup.id, table, error = %message, "table export failed");
                    let item =
                        BackupItem::table_failed(backup.id, table.clone(), message.clone());
                    self.store
                        .insert_backup_item(&item)
                        .await
                        .context("record failed backup item")?;
                    failures.push((table.clone(), message));
                }
            }
        }

        let manifest = Manifest {
            backup_id: backup.id,
            created_at: backup.created_at,
            backup_type: backup.backup_type,
            tables: captured.clone(),
            total_size,
            table_count: captured.len() as i32,
            file_count: 0,
        };
        let manifest_bytes = manifest.to_bytes()?;
        let manifest_checksum = payload_checksum(&manifest_bytes);
        self.blobs
            .put(
                &keys::manifest_key(backup.id),
                &manifest_bytes,
                "application/json",
            )
            .await
            .context("write manifest")?;

        // Partial success is still success: failed only when every table failed.
        let status = if captured.is_empty() {
            BackupStatus::Failed
        } else {
            BackupStatus::Completed
        };
        let error_message = if failures.is_empty() {
            None
        } else {
            Some(
                failures
                    .iter()
                    .map(|(table, err)| format!("{table}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        Ok(BackupCompletion {
            id: backup.id,
            status,
            total_size,
            table_count: captured.len() as i32,
            file_count: 0,
            checksum: Some(manifest_checksum),
            error_message,
            completed_at: Utc::now(),
        })
    }

    async fn export_table(&self, backup_id: Uuid, table: &str) -> Result<BackupItem> {
        let handle = self
            .registry
            .get(table)
            .ok_or_else(|| EngineError::UnknownTable(table.to_owned()))?;
        let rows = handle
            .export_rows()
            .await
            .with_context(|| format!("export table {table}"))?;
        let payload = serde_json::to_vec(&rows).context("serialize exported rows")?;
        let checksum = payload_checksum(&payload);
        let key = keys::table_key(backup_id, table);
        self.blobs
            .put(&key, &payload, "application/json")
            .await
            .with_context(|| format!("store payload for table {table}"))?;

        Ok(BackupItem::table_completed(
            backup_id,
            table.to_owned(),
            payload.len() as i64,
            rows.len() as i64,
            key,
            checksum,
        ))
    }
}
