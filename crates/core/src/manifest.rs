use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::BackupType;

/// Summary document written once per backup, next to the table artifacts.
/// Checksummed as a whole so post-hoc verification can detect a swapped or
/// edited manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub backup_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub backup_type: BackupType,
    pub tables: Vec<String>,
    pub total_size: i64,
    pub table_count: i32,
    pub file_count: i32,
}

impl Manifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serialize backup manifest")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("parse backup manifest")
    }
}
