use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry};
use tablevault_core::{
    payload_checksum, BackupItem, BackupStatus, ItemStatus, Rollback, RollbackCompletion,
    RollbackStatus, RollbackType,
};
use tablevault_storage::TableHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Engine, EngineError};

/// Rows are reinserted in fixed-size batches to bound memory and
/// per-statement size during the destructive load.
const RESTORE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct CreateRollbackRequest {
    pub backup_id: Uuid,
    pub rollback_type: RollbackType,
    pub initiated_by: String,
    /// Restore only these tables; `None` restores every completed item.
    pub tables: Option<Vec<String>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub rollback_id: Uuid,
    pub status: RollbackStatus,
    pub items_restored: i32,
    pub items_failed: i32,
    pub message: String,
}

impl Engine {
    /// Drive a full or partial restore from a completed backup. Preconditions
    /// refuse before any Rollback row exists; after that the row always
    /// leaves in_progress before this returns.
    pub async fn create_rollback(
        &self,
        request: CreateRollbackRequest,
    ) -> Result<RollbackOutcome> {
        let backup = self
            .store
            .get_backup(request.backup_id)
            .await?
            .ok_or(EngineError::BackupNotFound(request.backup_id))?;
        if backup.status != BackupStatus::Completed {
            return Err(EngineError::BackupNotRestorable {
                id: backup.id,
                status: backup.status.as_str(),
            }
            .into());
        }

        let items = self.store.list_backup_items(backup.id).await?;
        let selected: Vec<BackupItem> = items
            .into_iter()
            .filter(|item| item.item_type == "table" && item.status == ItemStatus::Completed)
            .filter(|item| match &request.tables {
                Some(names) => names.iter().any(|n| n == &item.item_name),
                None => true,
            })
            .collect();

        let rollback = Rollback::begin(
            backup.id,
            request.rollback_type,
            request.initiated_by.clone(),
            request.notes,
        );
        self.store
            .insert_rollback(&rollback)
            .await
            .context("create rollback record")?;

        let mut items_restored = 0i32;
        let mut items_failed = 0i32;
        let mut failures: Vec<String> = Vec::new();
        for item in &selected {
            match self.restore_item(item).await {
                Ok(()) => items_restored += 1,
                Err(e) => {
                    items_failed += 1;
                    let message = format!("{}: {e:#}", item.item_name);
                    warn!(rollback_id = %rollback.id, table = %item.item_name, error = %message, "item restore failed");
                    failures.push(message);
                }
            }
        }

        // Partially restored still counts as completed; only a run that
        // restored nothing is failed.
        let status = if items_restored > 0 {
            RollbackStatus::Completed
        } else {
            RollbackStatus::Failed
        };
        self.store
            .finish_rollback(&RollbackCompletion {
                id: rollback.id,
                status,
                items_restored,
                items_failed,
                completed_at: Utc::now(),
            })
            .await
            .context("persist rollback outcome")?;

        let message = match (status, items_failed) {
            (RollbackStatus::Completed, 0) => {
                format!("restored {items_restored} table(s) from backup {}", backup.name)
            }
            (RollbackStatus::Completed, _) => format!(
                "restored {items_restored} table(s), {items_failed} failed: {}",
                failures.join("; ")
            ),
            _ => format!(
                "rollback failed, no tables restored: {}",
                if failures.is_empty() {
                    "no restorable items selected".to_owned()
                } else {
                    failures.join("; ")
                }
            ),
        };

        let log_status = match (status, items_failed) {
            (RollbackStatus::Failed, _) => ActivityStatus::Failed,
            (_, n) if n > 0 => ActivityStatus::Warning,
            _ => ActivityStatus::Success,
        };
        self.log_activity(
            NewActivityLogEntry::new(
                ActivityType::RollbackExecuted,
                request.initiated_by,
                log_status,
            )
            .with_backup(backup.id, backup.name.clone())
            .with_details(json!({
                "rollback_id": rollback.id,
                "rollback_type": request.rollback_type,
                "items_restored": items_restored,
                "items_failed": items_failed,
            })),
        )
        .await;

        info!(
            rollback_id = %rollback.id,
            status = status.as_str(),
            items_restored,
            items_failed,
            "rollback finished"
        );
        Ok(RollbackOutcome {
            rollback_id: rollback.id,
            status,
            items_restored,
            items_failed,
            message,
        })
    }

    /// Verify then destructively replace one table. The constraint toggle
    /// brackets the whole load; re-enabling is attempted even when the load
    /// itself fails.
    async fn restore_item(&self, item: &BackupItem) -> Result<()> {
        let handle = self
            .registry
            .get(&item.item_name)
            .ok_or_else(|| EngineError::UnknownTable(item.item_name.clone()))?;

        let payload = self
            .blobs
            .get(&item.storage_key)
            .await
            .context("fetch stored payload")?;
        let recomputed = payload_checksum(&payload);
        if recomputed != item.checksum {
            bail!(
                "checksum mismatch (recorded {}, recomputed {recomputed}): data corruption",
                item.checksum
            );
        }
        let rows: Vec<serde_json::Value> =
            serde_json::from_slice(&payload).context("parse stored payload")?;

        handle
            .set_constraints_enforced(false)
            .await
            .context("disable constraint enforcement")?;
        let load = self.load_rows(handle.as_ref(), &rows).await;
        let reenable = handle
            .set_constraints_enforced(true)
            .await
            .context("re-enable constraint enforcement");
        load?;
        reenable
    }

    async fn load_rows(&self, handle: &dyn TableHandle, rows: &[serde_json::Value]) -> Result<()> {
        handle.truncate().await.context("clear existing rows")?;
        for chunk in rows.chunks(RESTORE_BATCH_SIZE) {
            handle.insert_rows(chunk).await.context("insert restored batch")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tablevault_core::model::{BackupType, TriggerType};
    use tablevault_core::{keys, Backup, BackupStatus, RollbackStatus, RollbackType};
    use tablevault_storage::TableHandle;

    use crate::testutil::{
        completed_backup, engine_with, orders_rows, users_rows, BrittleTable, MemTable,
    };
    use crate::CreateRollbackRequest;

    fn rollback_request(backup_id: uuid::Uuid) -> CreateRollbackRequest {
        CreateRollbackRequest {
            backup_id,
            rollback_type: RollbackType::Full,
            initiated_by: "operator".to_owned(),
            tables: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn restores_all_tables_from_completed_backup() {
        let users = Arc::new(MemTable::new(users_rows()));
        let orders = Arc::new(MemTable::new(orders_rows()));
        let env = engine_with(vec![
            ("users", users.clone() as _),
            ("orders", orders.clone() as _),
        ]);

        let backup = completed_backup(&env.engine, "restore-me").await;

        // Mutate live data after the snapshot.
        users.truncate().await.expect("truncate");
        users
            .insert_rows(&[serde_json::json!({"id": 99, "email": "drift@example.com"})])
            .await
            .expect("insert");

        let outcome = env
            .engine
            .create_rollback(rollback_request(backup.id))
            .await
            .expect("rollback");

        assert_eq!(outcome.status, RollbackStatus::Completed);
        assert_eq!(outcome.items_restored, 2);
        assert_eq!(outcome.items_failed, 0);
        assert_eq!(users.rows().await, users_rows());
        assert_eq!(orders.rows().await, orders_rows());
        // Constraint enforcement was re-enabled after the load.
        assert!(*users.constraints_enforced.lock().await);
    }

    #[tokio::test]
    async fn refuses_backup_that_is_not_completed() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);

        let in_progress = Backup::begin(
            "pending".into(),
            None,
            BackupType::Full,
            TriggerType::Manual,
            "tester".into(),
        );
        env.engine
            .store
            .insert_backup(&in_progress)
            .await
            .expect("insert");
        assert!(env
            .engine
            .create_rollback(rollback_request(in_progress.id))
            .await
            .is_err());

        // A failed backup is just as unrestorable.
        let mut failed = Backup::begin(
            "broken".into(),
            None,
            BackupType::Full,
            TriggerType::Manual,
            "tester".into(),
        );
        failed.status = BackupStatus::Failed;
        env.engine
            .store
            .insert_backup(&failed)
            .await
            .expect("insert");
        assert!(env
            .engine
            .create_rollback(rollback_request(failed.id))
            .await
            .is_err());

        // No rollback row was created by either refusal.
        assert!(env
            .engine
            .list_rollbacks(failed.id)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn missing_backup_is_refused() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        assert!(env
            .engine
            .create_rollback(rollback_request(uuid::Uuid::new_v4()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_a_hard_item_failure() {
        let users = Arc::new(MemTable::new(users_rows()));
        let env = engine_with(vec![("users", users.clone() as _)]);
        let backup = completed_backup(&env.engine, "tampered").await;

        // Corrupt the stored payload after the fact.
        env.engine
            .blobs
            .put(
                &keys::table_key(backup.id, "users"),
                b"[{\"id\":666}]",
                "application/json",
            )
            .await
            .expect("tamper");

        let outcome = env
            .engine
            .create_rollback(rollback_request(backup.id))
            .await
            .expect("rollback runs");

        assert_eq!(outcome.status, RollbackStatus::Failed);
        assert_eq!(outcome.items_restored, 0);
        assert_eq!(outcome.items_failed, 1);
        assert!(outcome.message.contains("checksum mismatch"));
        // Live data untouched by the refused load.
        assert_eq!(users.rows().await, users_rows());
    }

    #[tokio::test]
    async fn partial_restore_is_completed_with_failures_counted() {
        let users = Arc::new(MemTable::new(users_rows()));
        let orders = Arc::new(MemTable::new(orders_rows()));
        let env = engine_with(vec![
            ("users", users.clone() as _),
            ("orders", orders as _),
        ]);
        let backup = completed_backup(&env.engine, "partial-restore").await;

        // Corrupt only the orders payload.
        env.engine
            .blobs
            .put(
                &keys::table_key(backup.id, "orders"),
                b"[]",
                "application/json",
            )
            .await
            .expect("tamper");

        let outcome = env
            .engine
            .create_rollback(rollback_request(backup.id))
            .await
            .expect("rollback");

        assert_eq!(outcome.status, RollbackStatus::Completed);
        assert_eq!(outcome.items_restored, 1);
        assert_eq!(outcome.items_failed, 1);
        assert!(outcome.message.contains("orders"));
    }

    #[tokio::test]
    async fn table_filter_restores_only_selected_items() {
        let users = Arc::new(MemTable::new(users_rows()));
        let orders = Arc::new(MemTable::new(orders_rows()));
        let env = engine_with(vec![
            ("users", users.clone() as _),
            ("orders", orders.clone() as _),
        ]);
        let backup = completed_backup(&env.engine, "selective").await;

        orders.truncate().await.expect("truncate");
        users.truncate().await.expect("truncate");

        let mut request = rollback_request(backup.id);
        request.rollback_type = RollbackType::Partial;
        request.tables = Some(vec!["orders".into()]);
        let outcome = env.engine.create_rollback(request).await.expect("rollback");

        assert_eq!(outcome.items_restored, 1);
        assert_eq!(orders.rows().await, orders_rows());
        assert!(users.rows().await.is_empty());
    }

    #[tokio::test]
    async fn constraints_reenabled_even_when_load_fails() {
        let brittle = Arc::new(BrittleTable::new(users_rows()));
        let env = engine_with(vec![("users", brittle.clone() as _)]);
        let backup = completed_backup(&env.engine, "brittle").await;
        assert_eq!(backup.status, BackupStatus::Completed);

        let outcome = env
            .engine
            .create_rollback(rollback_request(backup.id))
            .await
            .expect("rollback runs");

        assert_eq!(outcome.status, RollbackStatus::Failed);
        assert_eq!(outcome.items_failed, 1);
        assert!(outcome.message.contains("table locked"));
        // The bracket re-enabled enforcement despite the failed load.
        assert!(*brittle.constraints_enforced.lock().await);
    }
}
