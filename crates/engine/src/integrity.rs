use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry};
use tablevault_core::{keys, payload_checksum, BackupStatus, ItemStatus, Manifest};
use tracing::info;
use uuid::Uuid;

use crate::Engine;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

/// One named verification step and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

/// Structured result of a backup verification run. Read-only: producing a
/// report never mutates the backup, its items, or any rollback record.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub backup_id: Uuid,
    pub status: CheckStatus,
    pub checks_performed: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub checks_warning: usize,
    pub checks: Vec<IntegrityCheck>,
    pub summary: String,
}

struct ReportBuilder {
    backup_id: Uuid,
    checks: Vec<IntegrityCheck>,
}

impl ReportBuilder {
    fn new(backup_id: Uuid) -> Self {
        Self {
            backup_id,
            checks: Vec::new(),
        }
    }

    fn push(&mut self, name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) {
        self.checks.push(IntegrityCheck {
            name: name.into(),
            status,
            detail: detail.into(),
        });
    }

    fn passed(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        self.push(name, CheckStatus::Passed, detail);
    }

    fn warning(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        self.push(name, CheckStatus::Warning, detail);
    }

    fn failed(&mut self, name: impl Into<String>, detail: impl Into<String>) {
        self.push(name, CheckStatus::Failed, detail);
    }

    fn finish(self) -> IntegrityReport {
        let checks_passed = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Passed)
            .count();
        let checks_failed = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Failed)
            .count();
        let checks_warning = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warning)
            .count();

        // Precedence: any failure wins, then any warning.
        let status = if checks_failed > 0 {
            CheckStatus::Failed
        } else if checks_warning > 0 {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };
        let summary = format!(
            "{} of {} checks passed ({checks_failed} failed, {checks_warning} warnings)",
            checks_passed,
            self.checks.len(),
        );

        IntegrityReport {
            backup_id: self.backup_id,
            status,
            checks_performed: self.checks.len(),
            checks_passed,
            checks_failed,
            checks_warning,
            checks: self.checks,
            summary,
        }
    }
}

impl Engine {
    /// Multi-level verification of a stored backup: structure, per-item
    /// checksums, payload format, record counts, manifest identity.
    pub async fn verify_backup_integrity(&self, backup_id: Uuid) -> Result<IntegrityReport> {
        let mut report = ReportBuilder::new(backup_id);

        // 1. Backup record exists. Fatal: nothing else can be checked.
        let Some(backup) = self.store.get_backup(backup_id).await? else {
            report.failed("backup_record", format!("no backup with id {backup_id}"));
            let report = report.finish();
            self.log_verification(&report, "verify").await;
            return Ok(report);
        };
        report.passed("backup_record", "backup record found");

        // 2. Status. Not being completed is suspicious but not corruption.
        if backup.status == BackupStatus::Completed {
            report.passed("backup_status", "status is completed");
        } else {
            report.warning(
                "backup_status",
                format!("status is {}, expected completed", backup.status.as_str()),
            );
        }

        // 3. At least one item.
        let items = self.store.list_backup_items(backup_id).await?;
        if items.is_empty() {
            report.failed("backup_items", "backup has no items");
        } else {
            report.passed("backup_items", format!("{} item(s) recorded", items.len()));
        }

        // 4. Per-item ladder.
        for item in &items {
            let name = &item.item_name;
            if item.status != ItemStatus::Completed {
                report.failed(
                    format!("item:{name}:status"),
                    format!(
                        "item status is {}{}",
                        item.status.as_str(),
                        item.error_message
                            .as_deref()
                            .map(|m| format!(" ({m})"))
                            .unwrap_or_default()
                    ),
                );
                continue;
            }
            report.passed(format!("item:{name}:status"), "item completed");

            let payload = match self.blobs.get(&item.storage_key).await {
                Ok(payload) => payload,
                Err(e) => {
                    report.failed(
                        format!("item:{name}:checksum"),
                        format!("payload fetch failed: {e:#}"),
                    );
                    continue;
                }
            };
            let recomputed = payload_checksum(&payload);
            if recomputed == item.checksum {
                report.passed(format!("item:{name}:checksum"), "checksum matches");
            } else {
                report.failed(
                    format!("item:{name}:checksum"),
                    format!("recorded {} but recomputed {recomputed}", item.checksum),
                );
                continue;
            }

            // Format: unparsable is corruption; parseable-but-wrong-shape is
            // only a warning.
            match serde_json::from_slice::<serde_json::Value>(&payload) {
                Err(e) => {
                    report.failed(
                        format!("item:{name}:format"),
                        format!("payload is not valid JSON: {e}"),
                    );
                    continue;
                }
                Ok(serde_json::Value::Array(rows)) => {
                    report.passed(format!("item:{name}:format"), "payload is a row array");
                    if rows.len() as i64 == item.record_count {
                        report.passed(
                            format!("item:{name}:record_count"),
                            format!("{} record(s)", rows.len()),
                        );
                    } else {
                        report.warning(
                            format!("item:{name}:record_count"),
                            format!(
                                "recorded {} but payload holds {}",
                                item.record_count,
                                rows.len()
                            ),
                        );
                    }
                }
                Ok(_) => {
                    report.warning(
                        format!("item:{name}:format"),
                        "payload parses but is not a row array",
                    );
                }
            }
        }

        // 5. Manifest is advisory; a missing or unreadable one only warns,
        // but an identity mismatch means the artifacts belong elsewhere.
        match self.blobs.get(&keys::manifest_key(backup_id)).await {
            Err(e) => report.warning("manifest", format!("manifest unreadable: {e:#}")),
            Ok(raw) => match Manifest::from_bytes(&raw) {
                Err(e) => report.warning("manifest", format!("manifest unparsable: {e:#}")),
                Ok(manifest) => {
                    report.passed("manifest", "manifest present and parseable");
                    if manifest.backup_id == backup_id {
                        report.passed("manifest_backup_id", "manifest identity matches");
                    } else {
                        report.failed(
                            "manifest_backup_id",
                            format!("manifest claims backup {}", manifest.backup_id),
                        );
                    }
                }
            },
        }

        let report = report.finish();
        self.log_verification(&report, "verify").await;
        info!(
            backup_id = %backup_id,
            status = ?report.status,
            summary = %report.summary,
            "integrity verification finished"
        );
        Ok(report)
    }

    /// Cheap polling variant: record and status checks plus a status-only
    /// scan of items. No blob reads.
    pub async fn quick_integrity_check(&self, backup_id: Uuid) -> Result<IntegrityReport> {
        let mut report = ReportBuilder::new(backup_id);

        let Some(backup) = self.store.get_backup(backup_id).await? else {
            report.failed("backup_record", format!("no backup with id {backup_id}"));
            return Ok(report.finish());
        };
        report.passed("backup_record", "backup record found");

        if backup.status == BackupStatus::Completed {
            report.passed("backup_status", "status is completed");
        } else {
            report.warning(
                "backup_status",
                format!("status is {}, expected completed", backup.status.as_str()),
            );
        }

        let items = self.store.list_backup_items(backup_id).await?;
        if items.is_empty() {
            report.failed("backup_items", "backup has no items");
        } else {
            let failed = items
                .iter()
                .filter(|i| i.status != ItemStatus::Completed)
                .count();
            if failed == 0 {
                report.passed(
                    "items_status",
                    format!("all {} item(s) completed", items.len()),
                );
            } else {
                report.failed(
                    "items_status",
                    format!("{failed} of {} item(s) not completed", items.len()),
                );
            }
        }

        Ok(report.finish())
    }

    async fn log_verification(&self, report: &IntegrityReport, kind: &str) {
        let status = match report.status {
            CheckStatus::Passed => ActivityStatus::Success,
            CheckStatus::Warning => ActivityStatus::Warning,
            CheckStatus::Failed => ActivityStatus::Failed,
        };
        self.log_activity(
            NewActivityLogEntry::new(ActivityType::IntegrityCheck, "system", status)
                .with_backup(report.backup_id, String::new())
                .with_details(json!({
                    "kind": kind,
                    "checks_performed": report.checks_performed,
                    "checks_failed": report.checks_failed,
                    "checks_warning": report.checks_warning,
                    "summary": report.summary,
                })),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tablevault_core::model::ItemStatus;
    use tablevault_core::{keys, payload_checksum, BackupItem, BackupStatus};

    use crate::integrity::CheckStatus;
    use crate::testutil::{
        completed_backup, engine_with, orders_rows, users_rows, FailingTable, MemTable,
    };

    #[tokio::test]
    async fn clean_backup_passes_all_checks() {
        let env = engine_with(vec![
            ("users", Arc::new(MemTable::new(users_rows())) as _),
            ("orders", Arc::new(MemTable::new(orders_rows())) as _),
        ]);
        let backup = completed_backup(&env.engine, "pristine").await;

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Passed);
        assert_eq!(report.checks_failed, 0);
        assert_eq!(report.checks_warning, 0);
        assert_eq!(report.checks_performed, report.checks_passed);
        // Verification never mutates the backup.
        let reloaded = env
            .engine
            .get_backup(backup.id)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(reloaded.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn missing_backup_short_circuits_as_failed() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let report = env
            .engine
            .verify_backup_integrity(uuid::Uuid::new_v4())
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Failed);
        assert_eq!(report.checks_performed, 1);
        assert_eq!(report.checks[0].name, "backup_record");
    }

    #[tokio::test]
    async fn corrupted_payload_fails_checksum_check() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "corrupted").await;

        env.engine
            .blobs
            .put(
                &keys::table_key(backup.id, "users"),
                b"[{\"id\":\"evil\"}]",
                "application/json",
            )
            .await
            .expect("tamper");

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Failed);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "item:users:checksum" && c.status == CheckStatus::Failed));
    }

    #[tokio::test]
    async fn untouched_payload_never_fails_checksum_check() {
        // Round-trip law: C = C' unless the payload changed after write.
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "stable").await;

        for _ in 0..3 {
            let report = env
                .engine
                .verify_backup_integrity(backup.id)
                .await
                .expect("verify");
            assert!(!report
                .checks
                .iter()
                .any(|c| c.name.ends_with(":checksum") && c.status == CheckStatus::Failed));
        }
    }

    #[tokio::test]
    async fn record_count_drift_is_a_warning_not_a_failure() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "drift").await;

        // An item whose recorded count disagrees with its (uncorrupted) payload.
        let payload = serde_json::to_vec(&users_rows()).expect("payload");
        let key = keys::table_key(backup.id, "audit");
        env.engine
            .blobs
            .put(&key, &payload, "application/json")
            .await
            .expect("put");
        let item = BackupItem::table_completed(
            backup.id,
            "audit".into(),
            payload.len() as i64,
            99,
            key,
            payload_checksum(&payload),
        );
        env.engine
            .store
            .insert_backup_item(&item)
            .await
            .expect("item");

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Warning);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "item:audit:record_count" && c.status == CheckStatus::Warning));
    }

    #[tokio::test]
    async fn wrong_shape_payload_is_a_warning() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "shape").await;

        let payload = br#"{"not":"an array"}"#.to_vec();
        let key = keys::table_key(backup.id, "odd");
        env.engine
            .blobs
            .put(&key, &payload, "application/json")
            .await
            .expect("put");
        let item = BackupItem::table_completed(
            backup.id,
            "odd".into(),
            payload.len() as i64,
            0,
            key,
            payload_checksum(&payload),
        );
        env.engine
            .store
            .insert_backup_item(&item)
            .await
            .expect("item");

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Warning);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "item:odd:format" && c.status == CheckStatus::Warning));
    }

    #[tokio::test]
    async fn failed_item_skips_further_item_checks() {
        let env = engine_with(vec![
            ("users", Arc::new(MemTable::new(users_rows())) as _),
            (
                "broken",
                Arc::new(FailingTable {
                    message: "export died".into(),
                }) as _,
            ),
        ]);
        let backup = completed_backup(&env.engine, "half").await;

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Failed);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "item:broken:status" && c.status == CheckStatus::Failed));
        // No checksum check was attempted for the failed item.
        assert!(!report.checks.iter().any(|c| c.name == "item:broken:checksum"));
        // The healthy item still gets its full ladder.
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "item:users:checksum" && c.status == CheckStatus::Passed));
    }

    #[tokio::test]
    async fn non_completed_backup_is_a_warning() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "to-delete").await;
        env.engine
            .store
            .mark_backup_deleted(backup.id)
            .await
            .expect("delete");

        let report = env
            .engine
            .verify_backup_integrity(backup.id)
            .await
            .expect("verify");

        assert_eq!(report.status, CheckStatus::Warning);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "backup_status" && c.status == CheckStatus::Warning));
    }

    #[tokio::test]
    async fn quick_check_reads_no_blobs() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        let backup = completed_backup(&env.engine, "quick").await;

        // Destroy every blob; the quick check must not notice.
        env.engine
            .blobs
            .put(
                &keys::table_key(backup.id, "users"),
                b"garbage",
                "application/json",
            )
            .await
            .expect("tamper");

        let report = env
            .engine
            .quick_integrity_check(backup.id)
            .await
            .expect("quick");
        assert_eq!(report.status, CheckStatus::Passed);

        let items = env
            .engine
            .list_backup_items(backup.id)
            .await
            .expect("items");
        assert!(items.iter().all(|i| i.status == ItemStatus::Completed));
    }
}
