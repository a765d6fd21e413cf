use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry, TriggerType};
use tablevault_core::{RetentionPolicy, RetentionPolicyUpdate};
use tracing::{debug, info};
use uuid::Uuid;

use crate::Engine;

/// Settings key holding the serialized singleton policy.
pub const RETENTION_POLICY_KEY: &str = "retention.policy";

/// Selection result: which completed-and-expired backups would be (or were)
/// soft-deleted, and which were protected.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RetentionOutcome {
    pub deleted: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

impl RetentionOutcome {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

impl Engine {
    pub async fn retention_policy(&self) -> Result<RetentionPolicy> {
        match self.store.get_setting(RETENTION_POLICY_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).context("parse stored retention policy"),
            None => Ok(RetentionPolicy::default()),
        }
    }

    /// Read-modify-write with unspecified-field inheritance.
    pub async fn update_retention_policy(
        &self,
        update: RetentionPolicyUpdate,
        actor: &str,
    ) -> Result<RetentionPolicy> {
        let mut policy = self.retention_policy().await?;
        policy.apply_update(&update);
        self.save_policy(&policy).await?;

        self.log_activity(
            NewActivityLogEntry::new(
                ActivityType::SettingsUpdated,
                actor,
                ActivityStatus::Success,
            )
            .with_details(json!({
                "setting": RETENTION_POLICY_KEY,
                "enabled": policy.enabled,
                "retention_days": policy.retention_days,
                "protect_labeled": policy.protect_labeled,
                "protect_manual": policy.protect_manual,
            })),
        )
        .await;
        Ok(policy)
    }

    /// Identical selection to `apply_retention_policy`, zero mutation.
    pub async fn preview_retention_policy(&self) -> Result<RetentionOutcome> {
        let policy = self.retention_policy().await?;
        if !policy.enabled {
            return Ok(RetentionOutcome::default());
        }
        self.select_candidates(&policy).await
    }

    /// Age-based soft deletion of completed backups, honoring the protection
    /// predicates. Blobs are left in place; only status changes.
    pub async fn apply_retention_policy(&self) -> Result<RetentionOutcome> {
        let mut policy = self.retention_policy().await?;
        if !policy.enabled {
            debug!("retention policy disabled, nothing to do");
            return Ok(RetentionOutcome::default());
        }

        let selection = self.select_candidates(&policy).await?;
        let mut deleted = Vec::new();
        for id in &selection.deleted {
            // The guarded transition ignores anything no longer completed.
            if self.store.mark_backup_deleted(*id).await? {
                deleted.push(*id);
                self.log_activity(
                    NewActivityLogEntry::new(
                        ActivityType::BackupDeleted,
                        "system",
                        ActivityStatus::Success,
                    )
                    .with_backup(*id, String::new())
                    .with_details(json!({ "reason": "retention" })),
                )
                .await;
            }
        }

        policy.last_cleanup = Some(Utc::now());
        policy.deleted_count += deleted.len() as i64;
        self.save_policy(&policy).await?;

        info!(
            deleted = deleted.len(),
            skipped = selection.skipped.len(),
            retention_days = policy.retention_days,
            "retention policy applied"
        );
        self.log_activity(
            NewActivityLogEntry::new(
                ActivityType::RetentionApplied,
                "system",
                ActivityStatus::Success,
            )
            .with_details(json!({
                "deleted": deleted.len(),
                "skipped": selection.skipped.len(),
                "retention_days": policy.retention_days,
            })),
        )
        .await;

        Ok(RetentionOutcome {
            deleted,
            skipped: selection.skipped,
        })
    }

    async fn select_candidates(&self, policy: &RetentionPolicy) -> Result<RetentionOutcome> {
        let cutoff = Utc::now() - Duration::days(policy.retention_days);
        let candidates = self.store.list_expired_completed(cutoff).await?;

        let mut outcome = RetentionOutcome::default();
        for backup in candidates {
            // Predicates are independent: either one protects on its own.
            if policy.protect_labeled && self.store.backup_label_count(backup.id).await? > 0 {
                outcome.skipped.push(backup.id);
                continue;
            }
            if policy.protect_manual && backup.trigger_type == TriggerType::Manual {
                outcome.skipped.push(backup.id);
                continue;
            }
            outcome.deleted.push(backup.id);
        }
        Ok(outcome)
    }

    async fn save_policy(&self, policy: &RetentionPolicy) -> Result<()> {
        let raw = serde_json::to_string(policy).context("serialize retention policy")?;
        self.store.set_setting(RETENTION_POLICY_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tablevault_core::model::{BackupStatus, BackupType, TriggerType};
    use tablevault_core::{Backup, RetentionPolicyUpdate};
    use uuid::Uuid;

    use crate::testutil::{engine_with, users_rows, MemTable};
    use crate::Engine;

    async fn aged_backup(
        engine: &Engine,
        days_old: i64,
        trigger: TriggerType,
        status: BackupStatus,
    ) -> Uuid {
        let mut backup = Backup::begin(
            format!("aged-{days_old}"),
            None,
            BackupType::Full,
            trigger,
            "tester".into(),
        );
        backup.status = status;
        backup.created_at = Utc::now() - Duration::days(days_old);
        engine.store.insert_backup(&backup).await.expect("insert");
        backup.id
    }

    async fn enable_policy(engine: &Engine, protect_labeled: bool, protect_manual: bool) {
        engine
            .update_retention_policy(
                RetentionPolicyUpdate {
                    enabled: Some(true),
                    retention_days: Some(30),
                    protect_labeled: Some(protect_labeled),
                    protect_manual: Some(protect_manual),
                },
                "tester",
            )
            .await
            .expect("policy");
    }

    #[tokio::test]
    async fn disabled_policy_is_a_no_op() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert!(outcome.deleted.is_empty());
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test]
    async fn age_and_label_protection_decide_candidates() {
        // enabled, 30 days, protect_labeled on, protect_manual off.
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        enable_policy(&env.engine, true, false).await;

        let old_unlabeled = aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;
        let young = aged_backup(
            &env.engine,
            10,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;
        let old_labeled = aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;
        env.engine
            .store
            .add_backup_label(old_labeled, "keep")
            .await
            .expect("label");

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert_eq!(outcome.deleted, vec![old_unlabeled]);
        assert_eq!(outcome.skipped, vec![old_labeled]);

        let deleted = env
            .engine
            .get_backup(old_unlabeled)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(deleted.status, BackupStatus::Deleted);
        let kept = env
            .engine
            .get_backup(young)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(kept.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn either_predicate_protects_on_its_own() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        // Only manual protection enabled; the backup is both manual and labeled.
        enable_policy(&env.engine, false, true).await;

        let both = aged_backup(
            &env.engine,
            45,
            TriggerType::Manual,
            BackupStatus::Completed,
        )
        .await;
        env.engine
            .store
            .add_backup_label(both, "keep")
            .await
            .expect("label");

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert_eq!(outcome.skipped, vec![both]);
        assert!(outcome.deleted.is_empty());
    }

    #[tokio::test]
    async fn manual_backups_deleted_when_protection_disabled() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        enable_policy(&env.engine, false, false).await;

        let manual = aged_backup(
            &env.engine,
            45,
            TriggerType::Manual,
            BackupStatus::Completed,
        )
        .await;

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert_eq!(outcome.deleted, vec![manual]);
    }

    #[tokio::test]
    async fn preview_is_idempotent_and_mutates_nothing() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        enable_policy(&env.engine, true, true).await;

        let expired = aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;

        let first = env.engine.preview_retention_policy().await.expect("preview");
        let second = env.engine.preview_retention_policy().await.expect("preview");
        let third = env.engine.preview_retention_policy().await.expect("preview");
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(first.deleted, vec![expired]);

        let untouched = env
            .engine
            .get_backup(expired)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(untouched.status, BackupStatus::Completed);
        // Bookkeeping untouched too.
        let policy = env.engine.retention_policy().await.expect("policy");
        assert!(policy.last_cleanup.is_none());
        assert_eq!(policy.deleted_count, 0);
    }

    #[tokio::test]
    async fn apply_updates_policy_bookkeeping() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        enable_policy(&env.engine, false, false).await;

        aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;
        aged_backup(
            &env.engine,
            60,
            TriggerType::Automatic,
            BackupStatus::Completed,
        )
        .await;

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert_eq!(outcome.deleted_count(), 2);

        let policy = env.engine.retention_policy().await.expect("policy");
        assert!(policy.last_cleanup.is_some());
        assert_eq!(policy.deleted_count, 2);

        // Nothing left to delete on a second pass; counter accumulates.
        let again = env.engine.apply_retention_policy().await.expect("apply");
        assert!(again.deleted.is_empty());
        let policy = env.engine.retention_policy().await.expect("policy");
        assert_eq!(policy.deleted_count, 2);
    }

    #[tokio::test]
    async fn failed_and_in_progress_backups_are_never_candidates() {
        let env = engine_with(vec![("users", Arc::new(MemTable::new(users_rows())) as _)]);
        enable_policy(&env.engine, false, false).await;

        aged_backup(&env.engine, 45, TriggerType::Automatic, BackupStatus::Failed).await;
        aged_backup(
            &env.engine,
            45,
            TriggerType::Automatic,
            BackupStatus::InProgress,
        )
        .await;

        let outcome = env.engine.apply_retention_policy().await.expect("apply");
        assert!(outcome.deleted.is_empty());
        assert!(outcome.skipped.is_empty());
    }
}
