use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tablevault_core::keys::manifest_key;
use tablevault_core::model::{BackupStatus, ItemStatus};
use tablevault_core::Manifest;
use tracing::warn;
use uuid::Uuid;

use crate::{Engine, EngineError};

/// Version stamp inside every exported document, bumped when the layout
/// changes shape.
const EXPORT_VERSION: u32 = 1;

/// A fully assembled export: the suggested download filename and the JSON
/// document holding the backup record, its manifest, and every table payload.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub filename: String,
    pub document: Value,
}

impl Engine {
    /// Assemble the complete export document for a completed backup. Only
    /// successfully captured tables are included; a table payload that can no
    /// longer be fetched fails the whole export rather than shipping a
    /// silently incomplete bundle.
    pub async fn build_download_bundle(&self, id: Uuid) -> Result<ExportBundle> {
        let backup = self
            .store
            .get_backup(id)
            .await?
            .ok_or(EngineError::BackupNotFound(id))?;
        if backup.status != BackupStatus::Completed {
            return Err(EngineError::BackupNotExportable {
                id,
                status: backup.status.as_str(),
            }
            .into());
        }

        let mut tables = Map::new();
        for item in self.store.list_backup_items(id).await? {
            if item.status != ItemStatus::Completed || item.item_type != "table" {
                continue;
            }
            let payload = self
                .blobs
                .get(&item.storage_key)
                .await
                .with_context(|| format!("fetch table payload for {}", item.item_name))?;
            let rows: Value = serde_json::from_slice(&payload)
                .with_context(|| format!("decode table payload for {}", item.item_name))?;
            tables.insert(item.item_name, rows);
        }

        // The manifest is descriptive, not load-bearing; export proceeds
        // without one.
        let manifest = match self.blobs.get(&manifest_key(id)).await {
            Ok(raw) => match Manifest::from_bytes(&raw) {
                Ok(manifest) => serde_json::to_value(&manifest)?,
                Err(e) => {
                    warn!(backup_id = %id, error = %e, "manifest unreadable, exporting without it");
                    Value::Null
                }
            },
            Err(e) => {
                warn!(backup_id = %id, error = %e, "manifest missing, exporting without it");
                Value::Null
            }
        };

        let filename = format!(
            "backup_{}_{}_{}.json",
            backup.id,
            sanitize_name(&backup.name),
            Utc::now().format("%Y%m%d")
        );
        let document = json!({
            "export_version": EXPORT_VERSION,
            "backup": backup,
            "manifest": manifest,
            "tables": Value::Object(tables),
        });
        Ok(ExportBundle { filename, document })
    }
}

/// Filename-safe rendition of a backup name: alphanumerics, `-`, and `_`
/// pass through, everything else becomes `_`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::{
        completed_backup, engine_with, manual_backup_request, orders_rows, users_rows,
        FailingTable, MemTable,
    };

    #[test]
    fn sanitize_keeps_safe_characters_only() {
        assert_eq!(sanitize_name("nightly-run_3"), "nightly-run_3");
        assert_eq!(sanitize_name("before update 2.1"), "before_update_2_1");
        assert_eq!(sanitize_name("../../etc/passwd"), "_______etc_passwd");
    }

    #[tokio::test]
    async fn bundle_contains_every_captured_table() {
        let env = engine_with(vec![
            ("users", Arc::new(MemTable::new(users_rows())) as _),
            ("orders", Arc::new(MemTable::new(orders_rows())) as _),
        ]);
        let backup = completed_backup(&env.engine, "pre_migration").await;

        let bundle = env
            .engine
            .build_download_bundle(backup.id)
            .await
            .expect("bundle");

        assert!(bundle.filename.starts_with(&format!("backup_{}_pre_migration_", backup.id)));
        assert!(bundle.filename.ends_with(".json"));

        assert_eq!(bundle.document["export_version"], 1);
        assert_eq!(bundle.document["backup"]["name"], "pre_migration");
        assert_eq!(bundle.document["manifest"]["table_count"], 2);
        let tables = bundle.document["tables"].as_object().expect("tables");
        assert_eq!(tables.len(), 2);
        assert_eq!(tables["users"].as_array().expect("users rows").len(), 2);
        assert_eq!(tables["orders"].as_array().expect("orders rows").len(), 3);
    }

    #[tokio::test]
    async fn failed_tables_are_left_out_of_the_bundle() {
        let env = engine_with(vec![
            ("users", Arc::new(MemTable::new(users_rows())) as _),
            (
                "orders",
                Arc::new(FailingTable {
                    message: "export refused".into(),
                }) as _,
            ),
        ]);
        let backup = env
            .engine
            .create_backup(manual_backup_request("partial"))
            .await
            .expect("create backup");
        assert_eq!(backup.status, BackupStatus::Completed);

        let bundle = env
            .engine
            .build_download_bundle(backup.id)
            .await
            .expect("bundle");
        let tables = bundle.document["tables"].as_object().expect("tables");
        assert_eq!(tables.len(), 1);
        assert!(tables.contains_key("users"));
    }

    #[tokio::test]
    async fn only_completed_backups_are_exportable() {
        let env = engine_with(vec![(
            "users",
            Arc::new(MemTable::new(users_rows())) as _,
        )]);

        let missing = env.engine.build_download_bundle(Uuid::new_v4()).await;
        let err = missing.expect_err("missing backup");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::BackupNotFound(_))
        ));

        let mut in_progress = tablevault_core::Backup::begin(
            "running".into(),
            None,
            tablevault_core::BackupType::Full,
            tablevault_core::TriggerType::Manual,
            "tester".into(),
        );
        in_progress.status = BackupStatus::InProgress;
        env.engine
            .store
            .insert_backup(&in_progress)
            .await
            .expect("insert");

        let refused = env.engine.build_download_bundle(in_progress.id).await;
        let err = refused.expect_err("in-progress backup");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::BackupNotExportable { .. })
        ));
    }
}
