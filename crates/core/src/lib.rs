pub mod checksum;
pub mod keys;
pub mod manifest;
pub mod model;

pub use checksum::payload_checksum;
pub use manifest::Manifest;
pub use model::{
    ActivityFilter, ActivityLogEntry, ActivityStats, ActivityStatus, ActivityType, Backup,
    BackupCompletion, BackupItem, BackupStatus, BackupType, ItemStatus, NewActivityLogEntry,
    RetentionPolicy, RetentionPolicyUpdate, Rollback, RollbackCompletion, RollbackStatus,
    RollbackType, TriggerType,
};
