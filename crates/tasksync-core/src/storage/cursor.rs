//! Change cursor store
//!
//! Per-user watermark of the last server change applied locally, plus the
//! time of the last finished sync run. Both live in the `settings`
//! key-value table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::error::StorageResult;
use super::{from_millis, to_millis};

/// Watermark for incremental pull
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChangeCursor {
    pub user_id: String,
    /// Last applied server change id; 0 before the first pull
    pub last_change_id: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

fn change_id_key(user_id: &str) -> String {
    format!("sync.last_change_id:{user_id}")
}

fn last_sync_key(user_id: &str) -> String {
    format!("sync.last_sync_at:{user_id}")
}

fn get_setting(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_setting(conn: &Connection, key: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        r#"INSERT INTO settings(key, value) VALUES (?1, ?2)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        params![key, value],
    )?;
    Ok(())
}

/// Read the cursor for a user
pub fn load(conn: &Connection, user_id: &str) -> StorageResult<ChangeCursor> {
    let last_change_id = get_setting(conn, &change_id_key(user_id))?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last_sync_at = get_setting(conn, &last_sync_key(user_id))?
        .and_then(|v| v.parse().ok())
        .map(from_millis);

    Ok(ChangeCursor {
        user_id: user_id.to_string(),
        last_change_id,
        last_sync_at,
    })
}

/// Move the watermark forward
///
/// Never moves backwards: a lower `change_id` than the stored one is
/// ignored. Returns the watermark now in effect.
pub fn advance(conn: &Connection, user_id: &str, change_id: i64) -> StorageResult<i64> {
    let current = load(conn, user_id)?.last_change_id;
    if change_id <= current {
        return Ok(current);
    }
    set_setting(conn, &change_id_key(user_id), &change_id.to_string())?;
    Ok(change_id)
}

/// Record when the last sync run finished
pub fn set_last_sync(conn: &Connection, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
    set_setting(conn, &last_sync_key(user_id), &to_millis(at).to_string())
}

/// Forget the watermark so the next pull starts from scratch
pub fn reset(conn: &Connection, user_id: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM settings WHERE key = ?1",
        params![change_id_key(user_id)],
    )?;
    Ok(())
}
