use uuid::Uuid;

/// Prefix under which every artifact of one backup lives.
pub fn storage_prefix(backup_id: Uuid) -> String {
    format!("backups/{backup_id}")
}

/// Deterministic blob key for one table's exported rows.
pub fn table_key(backup_id: Uuid, table_name: &str) -> String {
    format!("backups/{backup_id}/{table_name}.json")
}

/// Well-known blob key for a backup's manifest document.
pub fn manifest_key(backup_id: Uuid) -> String {
    format!("backups/{backup_id}/manifest.json")
}
