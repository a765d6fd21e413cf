use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;

/// Capability pair for one logical table: bulk read for export, plus the
/// destructive-load primitives the restore path sequences itself
/// (constraints off, truncate, batched insert, constraints on).
#[async_trait::async_trait]
pub trait TableHandle: Send + Sync {
    /// Export every row as a JSON object keyed by column name.
    async fn export_rows(&self) -> Result<Vec<Value>>;

    /// Remove all existing rows.
    async fn truncate(&self) -> Result<()>;

    /// Insert the given rows. Callers batch; one call is one statement group.
    async fn insert_rows(&self, rows: &[Value]) -> Result<()>;

    /// Toggle referential-integrity enforcement for this table's connection.
    async fn set_constraints_enforced(&self, enforced: bool) -> Result<()>;
}

/// Closed catalog mapping table names to their handles. Populated at startup
/// and immutable during operation, so orchestration never hard-codes names.
#[derive(Default, Clone)]
pub struct TableRegistry {
    tables: BTreeMap<String, Arc<dyn TableHandle>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handle: Arc<dyn TableHandle>) {
        self.tables.insert(name.into(), handle);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TableHandle>> {
        self.tables.get(name).cloned()
    }

    /// All registered table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

/// SQLite-backed table handle. Each call opens a fresh connection inside
/// `spawn_blocking`, same as the metadata store.
pub struct SqliteTableHandle {
    db_path: PathBuf,
    table: String,
}

impl SqliteTableHandle {
    pub fn new(db_path: PathBuf, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("invalid table name: {table:?}");
        }
        Ok(Self { db_path, table })
    }
}

#[async_trait::async_trait]
impl TableHandle for SqliteTableHandle {
    async fn export_rows(&self) -> Result<Vec<Value>> {
        let db_path = self.db_path.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Value>> {
            let conn = Connection::open(&db_path).context("open source db")?;
            let mut stmt = conn
                .prepare(&format!("SELECT * FROM \"{table}\""))
                .with_context(|| format!("prepare export for table {table}"))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([])?;
            let mut exported = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::with_capacity(columns.len());
                for (idx, name) in columns.iter().enumerate() {
                    obj.insert(name.clone(), sql_to_json(row.get_ref(idx)?));
                }
                exported.push(Value::Object(obj));
            }
            Ok(exported)
        })
        .await?
    }

    async fn truncate(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&db_path).context("open source db")?;
            conn.execute(&format!("DELETE FROM \"{table}\""), [])
                .with_context(|| format!("truncate table {table}"))?;
            Ok(())
        })
        .await?
    }

    async fn insert_rows(&self, rows: &[Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let db_path = self.db_path.clone();
        let table = self.table.clone();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = Connection::open(&db_path).context("open source db")?;
            let tx = conn.transaction()?;
            for row in &rows {
                let obj = row
                    .as_object()
                    .ok_or_else(|| anyhow!("restored row is not an object: {row}"))?;
                let columns: Vec<&str> = obj.keys().map(String::as_str).collect();
                let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "INSERT INTO \"{table}\" ({}) VALUES ({})",
                    quoted.join(", "),
                    placeholders.join(", ")
                );
                let params: Vec<rusqlite::types::Value> =
                    obj.values().map(json_to_sql).collect::<Result<_>>()?;
                tx.execute(&sql, rusqlite::params_from_iter(params))
                    .with_context(|| format!("insert row into {table}"))?;
            }
            tx.commit().context("commit restored batch")?;
            Ok(())
        })
        .await?
    }

    async fn set_constraints_enforced(&self, enforced: bool) -> Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&db_path).context("open source db")?;
            conn.pragma_update(None, "foreign_keys", enforced)
                .context("toggle foreign_keys pragma")?;
            Ok(())
        })
        .await?
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn json_to_sql(value: &Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    Ok(match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().ok_or_else(|| anyhow!("unrepresentable number: {n}"))?)
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db(tmp: &tempfile::TempDir) -> PathBuf {
        let path = tmp.path().join("source.db");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, score REAL);
             INSERT INTO users (id, email, score) VALUES
               (1, 'a@example.com', 1.5),
               (2, 'b@example.com', NULL);",
        )
        .expect("seed");
        path
    }

    #[tokio::test]
    async fn export_produces_one_object_per_row() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let handle = SqliteTableHandle::new(seeded_db(&tmp), "users").expect("handle");

        let rows = handle.export_rows().await.expect("export");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["email"], "a@example.com");
        assert_eq!(rows[1]["score"], Value::Null);
    }

    #[tokio::test]
    async fn truncate_then_insert_restores_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let handle = SqliteTableHandle::new(seeded_db(&tmp), "users").expect("handle");

        let original = handle.export_rows().await.expect("export");
        handle.truncate().await.expect("truncate");
        assert!(handle.export_rows().await.expect("export").is_empty());

        handle.insert_rows(&original).await.expect("insert");
        let restored = handle.export_rows().await.expect("export");
        assert_eq!(restored, original);
    }

    #[tokio::test]
    async fn registry_is_sorted_and_closed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let db = seeded_db(&tmp);
        let mut registry = TableRegistry::new();
        registry.register(
            "users",
            Arc::new(SqliteTableHandle::new(db.clone(), "users").expect("handle")),
        );
        registry.register(
            "accounts",
            Arc::new(SqliteTableHandle::new(db, "accounts").expect("handle")),
        );

        assert_eq!(registry.table_names(), vec!["accounts", "users"]);
        assert!(registry.get("users").is_some());
        assert!(registry.get("orders").is_none());
    }

    #[test]
    fn suspicious_table_names_are_rejected() {
        assert!(SqliteTableHandle::new(PathBuf::from("x.db"), "users; DROP TABLE users").is_err());
        assert!(SqliteTableHandle::new(PathBuf::from("x.db"), "").is_err());
    }
}
