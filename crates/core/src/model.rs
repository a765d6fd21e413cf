use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Database,
    Files,
    Incremental,
    PreUpdate,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Database => "database",
            BackupType::Files => "files",
            BackupType::Incremental => "incremental",
            BackupType::PreUpdate => "pre_update",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "database" => BackupType::Database,
            "files" => BackupType::Files,
            "incremental" => BackupType::Incremental,
            "pre_update" => BackupType::PreUpdate,
            _ => BackupType::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Automatic,
    PreUpdate,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Automatic => "automatic",
            TriggerType::PreUpdate => "pre_update",
            TriggerType::Scheduled => "scheduled",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "automatic" => TriggerType::Automatic,
            "pre_update" => TriggerType::PreUpdate,
            "scheduled" => TriggerType::Scheduled,
            _ => TriggerType::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => BackupStatus::Completed,
            "failed" => BackupStatus::Failed,
            "deleted" => BackupStatus::Deleted,
            _ => BackupStatus::InProgress,
        }
    }

    /// Legal edges: in_progress -> {completed, failed}, completed -> deleted.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (BackupStatus::InProgress, BackupStatus::Completed)
                | (BackupStatus::InProgress, BackupStatus::Failed)
                | (BackupStatus::Completed, BackupStatus::Deleted)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub backup_type: BackupType,
    pub trigger_type: TriggerType,
    pub status: BackupStatus,
    pub total_size: i64,
    /// Number of tables successfully captured in this backup.
    pub table_count: i32,
    pub file_count: i32,
    pub storage_prefix: String,
    /// Digest of the manifest document, set when the run finishes.
    pub checksum: Option<String>,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Backup {
    /// A fresh in-progress record, inserted before any table export starts so
    /// a crash mid-run still leaves a discoverable row.
    pub fn begin(
        name: String,
        description: Option<String>,
        backup_type: BackupType,
        trigger_type: TriggerType,
        created_by: String,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name,
            description,
            backup_type,
            trigger_type,
            status: BackupStatus::InProgress,
            total_size: 0,
            table_count: 0,
            file_count: 0,
            storage_prefix: crate::keys::storage_prefix(id),
            checksum: None,
            error_message: None,
            notes: None,
            created_by,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// The single atomic final update applied to a backup row once every table
/// has been attempted (or the run aborted).
#[derive(Debug, Clone)]
pub struct BackupCompletion {
    pub id: Uuid,
    pub status: BackupStatus,
    pub total_size: i64,
    pub table_count: i32,
    pub file_count: i32,
    pub checksum: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("failed") {
            ItemStatus::Failed
        } else {
            ItemStatus::Completed
        }
    }
}

/// One table's export attempt within a backup. Insert-only: a failure is a
/// separate failed row, never an update of an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupItem {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub item_type: String,
    pub item_name: String,
    pub item_size: i64,
    pub record_count: i64,
    pub storage_key: String,
    pub checksum: String,
    pub status: ItemStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BackupItem {
    pub fn table_completed(
        backup_id: Uuid,
        item_name: String,
        item_size: i64,
        record_count: i64,
        storage_key: String,
        checksum: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            item_type: "table".to_owned(),
            item_name,
            item_size,
            record_count,
            storage_key,
            checksum,
            status: ItemStatus::Completed,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn table_failed(backup_id: Uuid, item_name: String, error_message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            item_type: "table".to_owned(),
            item_name,
            item_size: 0,
            record_count: 0,
            storage_key: String::new(),
            checksum: String::new(),
            status: ItemStatus::Failed,
            error_message: Some(error_message),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    Full,
    Database,
    Files,
    Partial,
}

impl RollbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackType::Full => "full",
            RollbackType::Database => "database",
            RollbackType::Files => "files",
            RollbackType::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "database" => RollbackType::Database,
            "files" => RollbackType::Files,
            "partial" => RollbackType::Partial,
            _ => RollbackType::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    InProgress,
    Completed,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::InProgress => "in_progress",
            RollbackStatus::Completed => "completed",
            RollbackStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => RollbackStatus::Completed,
            "failed" => RollbackStatus::Failed,
            _ => RollbackStatus::InProgress,
        }
    }
}

/// A restore run against one source backup. `status = completed` with
/// `items_failed > 0` is a valid terminal state: partially restored runs
/// count as completed as long as at least one item was restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollback {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub rollback_type: RollbackType,
    pub status: RollbackStatus,
    pub items_restored: i32,
    pub items_failed: i32,
    pub initiated_by: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Rollback {
    pub fn begin(
        backup_id: Uuid,
        rollback_type: RollbackType,
        initiated_by: String,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            rollback_type,
            status: RollbackStatus::InProgress,
            items_restored: 0,
            items_failed: 0,
            initiated_by,
            notes,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackCompletion {
    pub id: Uuid,
    pub status: RollbackStatus,
    pub items_restored: i32,
    pub items_failed: i32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    BackupCreated,
    BackupDeleted,
    BackupDownloaded,
    RollbackExecuted,
    IntegrityCheck,
    RetentionApplied,
    ScheduleUpdated,
    SettingsUpdated,
    LabelAdded,
    LabelRemoved,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::BackupCreated => "backup_created",
            ActivityType::BackupDeleted => "backup_deleted",
            ActivityType::BackupDownloaded => "backup_downloaded",
            ActivityType::RollbackExecuted => "rollback_executed",
            ActivityType::IntegrityCheck => "integrity_check",
            ActivityType::RetentionApplied => "retention_applied",
            ActivityType::ScheduleUpdated => "schedule_updated",
            ActivityType::SettingsUpdated => "settings_updated",
            ActivityType::LabelAdded => "label_added",
            ActivityType::LabelRemoved => "label_removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "backup_created" => ActivityType::BackupCreated,
            "backup_deleted" => ActivityType::BackupDeleted,
            "backup_downloaded" => ActivityType::BackupDownloaded,
            "rollback_executed" => ActivityType::RollbackExecuted,
            "integrity_check" => ActivityType::IntegrityCheck,
            "retention_applied" => ActivityType::RetentionApplied,
            "schedule_updated" => ActivityType::ScheduleUpdated,
            "settings_updated" => ActivityType::SettingsUpdated,
            "label_added" => ActivityType::LabelAdded,
            "label_removed" => ActivityType::LabelRemoved,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Failed,
    Warning,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Failed => "failed",
            ActivityStatus::Warning => "warning",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "failed" => ActivityStatus::Failed,
            "warning" => ActivityStatus::Warning,
            _ => ActivityStatus::Success,
        }
    }
}

/// Append-only audit record; never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub activity_type: ActivityType,
    pub backup_id: Option<Uuid>,
    pub backup_name: Option<String>,
    pub actor: String,
    pub details: serde_json::Value,
    pub status: ActivityStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payload for appending one audit record.
#[derive(Debug, Clone)]
pub struct NewActivityLogEntry {
    pub activity_type: ActivityType,
    pub backup_id: Option<Uuid>,
    pub backup_name: Option<String>,
    pub actor: String,
    pub details: serde_json::Value,
    pub status: ActivityStatus,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewActivityLogEntry {
    pub fn new(activity_type: ActivityType, actor: impl Into<String>, status: ActivityStatus) -> Self {
        Self {
            activity_type,
            backup_id: None,
            backup_name: None,
            actor: actor.into(),
            details: serde_json::Value::Null,
            status,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_backup(mut self, id: Uuid, name: impl Into<String>) -> Self {
        self.backup_id = Some(id);
        self.backup_name = Some(name.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_provenance(mut self, ip: Option<String>, agent: Option<String>) -> Self {
        self.ip_address = ip;
        self.user_agent = agent;
        self
    }

    pub fn into_entry(self) -> ActivityLogEntry {
        ActivityLogEntry {
            id: Uuid::new_v4(),
            activity_type: self.activity_type,
            backup_id: self.backup_id,
            backup_name: self.backup_name,
            actor: self.actor,
            details: self.details,
            status: self.status,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: Utc::now(),
        }
    }
}

/// Conjunctive activity-log filter with offset/limit pagination.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub activity_type: Option<ActivityType>,
    pub backup_id: Option<Uuid>,
    pub actor: Option<String>,
    pub status: Option<ActivityStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: i64,
    pub limit: i64,
}

impl ActivityFilter {
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ActivityStats {
    pub total: i64,
    pub today: i64,
    pub by_status: Vec<(String, i64)>,
    pub by_type: Vec<(String, i64)>,
}

/// Singleton retention configuration, stored read-modify-write under a
/// well-known settings key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub retention_days: i64,
    pub protect_labeled: bool,
    pub protect_manual: bool,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub deleted_count: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_days: 30,
            protect_labeled: true,
            protect_manual: true,
            last_cleanup: None,
            deleted_count: 0,
        }
    }
}

/// Partial update: only provided fields overwrite the stored policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionPolicyUpdate {
    pub enabled: Option<bool>,
    pub retention_days: Option<i64>,
    pub protect_labeled: Option<bool>,
    pub protect_manual: Option<bool>,
}

impl RetentionPolicy {
    pub fn apply_update(&mut self, update: &RetentionPolicyUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(days) = update.retention_days {
            self.retention_days = days;
        }
        if let Some(protect) = update.protect_labeled {
            self.protect_labeled = protect;
        }
        if let Some(protect) = update.protect_manual {
            self.protect_manual = protect;
        }
    }
}
