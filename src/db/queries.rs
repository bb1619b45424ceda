use rusqlite::params;

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Key/value queries
// ---------------------------------------------------------------------------

pub fn upsert_entry(
    db: &Database,
    key: &str,
    value_json: &str,
    updated_at: &str,
) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO kv_entries (key, value_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key)
         DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![key, value_json, updated_at],
    )?;
    Ok(())
}

pub fn get_entry(db: &Database, key: &str) -> Result<Option<String>, DbError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare("SELECT value_json FROM kv_entries WHERE key = ?1")?;
    let mut rows = stmt.query_map(params![key], |row| row.get(0))?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn delete_entry(db: &Database, key: &str) -> Result<bool, DbError> {
    let conn = db.conn()?;
    let changed = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
    Ok(changed > 0)
}

/// Keys starting with `prefix`, in key order.
pub fn list_keys_with_prefix(db: &Database, prefix: &str) -> Result<Vec<String>, DbError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        "SELECT key FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let rows = stmt
        .query_map(params![prefix], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}
