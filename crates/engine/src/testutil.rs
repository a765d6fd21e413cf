use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tablevault_core::model::{BackupType, TriggerType};
use tablevault_core::Backup;
use tablevault_storage::{FsBlobStore, SqliteStore, TableHandle, TableRegistry};
use tokio::sync::Mutex;

use crate::{CreateBackupRequest, Engine};

/// In-memory table for orchestrator tests.
pub struct MemTable {
    rows: Mutex<Vec<Value>>,
    pub constraints_enforced: Mutex<bool>,
}

impl MemTable {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows: Mutex::new(rows),
            constraints_enforced: Mutex::new(true),
        }
    }

    pub async fn rows(&self) -> Vec<Value> {
        self.rows.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl TableHandle for MemTable {
    async fn export_rows(&self) -> Result<Vec<Value>> {
        Ok(self.rows.lock().await.clone())
    }

    async fn truncate(&self) -> Result<()> {
        self.rows.lock().await.clear();
        Ok(())
    }

    async fn insert_rows(&self, rows: &[Value]) -> Result<()> {
        self.rows.lock().await.extend_from_slice(rows);
        Ok(())
    }

    async fn set_constraints_enforced(&self, enforced: bool) -> Result<()> {
        *self.constraints_enforced.lock().await = enforced;
        Ok(())
    }
}

/// Table whose export always fails, for partial-failure scenarios.
pub struct FailingTable {
    pub message: String,
}

#[async_trait::async_trait]
impl TableHandle for FailingTable {
    async fn export_rows(&self) -> Result<Vec<Value>> {
        bail!("{}", self.message)
    }

    async fn truncate(&self) -> Result<()> {
        bail!("{}", self.message)
    }

    async fn insert_rows(&self, _rows: &[Value]) -> Result<()> {
        bail!("{}", self.message)
    }

    async fn set_constraints_enforced(&self, _enforced: bool) -> Result<()> {
        Ok(())
    }
}

/// Exports cleanly but refuses destructive writes; tracks the constraint
/// toggle so tests can assert the restore bracket re-enabled enforcement.
pub struct BrittleTable {
    rows: Vec<Value>,
    pub constraints_enforced: Mutex<bool>,
}

impl BrittleTable {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows,
            constraints_enforced: Mutex::new(true),
        }
    }
}

#[async_trait::async_trait]
impl TableHandle for BrittleTable {
    async fn export_rows(&self) -> Result<Vec<Value>> {
        Ok(self.rows.clone())
    }

    async fn truncate(&self) -> Result<()> {
        bail!("table locked")
    }

    async fn insert_rows(&self, _rows: &[Value]) -> Result<()> {
        bail!("table locked")
    }

    async fn set_constraints_enforced(&self, enforced: bool) -> Result<()> {
        *self.constraints_enforced.lock().await = enforced;
        Ok(())
    }
}

pub struct TestEnv {
    pub engine: Engine,
    _tmp: tempfile::TempDir,
}

impl TestEnv {
    /// Split the engine from the backing tempdir; the caller keeps the
    /// tempdir alive for as long as the engine is used.
    pub fn into_parts(self) -> (Engine, tempfile::TempDir) {
        (self.engine, self._tmp)
    }
}

/// Engine wired against a throwaway SQLite metadata store and filesystem
/// blob store.
pub fn engine_with(tables: Vec<(&str, Arc<dyn TableHandle>)>) -> TestEnv {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(tmp.path().join("meta.db")).expect("metadata store");
    let blobs = FsBlobStore::new(tmp.path().join("blobs")).expect("blob store");

    let mut registry = TableRegistry::new();
    for (name, handle) in tables {
        registry.register(name, handle);
    }

    TestEnv {
        engine: Engine::new(Arc::new(store), Arc::new(blobs), Arc::new(registry)),
        _tmp: tmp,
    }
}

pub fn users_rows() -> Vec<Value> {
    vec![
        serde_json::json!({"id": 1, "email": "a@example.com"}),
        serde_json::json!({"id": 2, "email": "b@example.com"}),
    ]
}

pub fn orders_rows() -> Vec<Value> {
    vec![
        serde_json::json!({"id": 10, "user_id": 1, "total": 99.5}),
        serde_json::json!({"id": 11, "user_id": 2, "total": 12.0}),
        serde_json::json!({"id": 12, "user_id": 2, "total": 7.25}),
    ]
}

pub fn manual_backup_request(name: &str) -> CreateBackupRequest {
    CreateBackupRequest {
        name: name.to_owned(),
        description: None,
        backup_type: BackupType::Full,
        trigger_type: TriggerType::Manual,
        created_by: "tester".to_owned(),
        tables: None,
    }
}

/// Run a full backup of every registered table and return the final record.
pub async fn completed_backup(engine: &Engine, name: &str) -> Backup {
    engine
        .create_backup(manual_backup_request(name))
        .await
        .expect("create backup")
}
