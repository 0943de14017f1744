//! Pending-operation ledger
//!
//! Durable, ordered queue of local mutations that the server has not yet
//! confirmed. Every function takes a `&Connection` so callers can compose
//! it inside their own transaction (a `Transaction` derefs to `Connection`).
//! `Database::transaction` provides the implicit transaction for standalone
//! calls.
//!
//! ## Selection rules
//!
//! `select_next` only hands out the head of an entity's queue: an entry is
//! eligible when it is `pending`, its backoff has elapsed, and the same
//! user has no other entry for that entity id that is older (in any
//! status) or is `processing` or `failed`. This keeps per-entity pushes in
//! enqueue order and stops a failed entry from being overtaken. Ledgers of
//! different users never block each other.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::error::StorageResult;
use super::{from_millis, to_millis};
use crate::config::RetryConfig;
use crate::models::{EntityPayload, EntityType, OperationType, ParseKindError};

/// Processing state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Failed => "failed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(ParseKindError {
                kind: "operation status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseKindError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(OperationStatus);
text_column!(EntityType);
text_column!(OperationType);

/// A ledger entry
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PendingOperation {
    /// Monotonic id assigned at enqueue time; defines processing order
    pub id: i64,
    pub user_id: String,
    pub operation_type: OperationType,
    pub entity_type: EntityType,
    /// Client-assigned until remapped to a canonical id
    pub entity_id: String,
    /// Opaque JSON snapshot of the entity at enqueue time
    pub payload: String,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Decode the stored snapshot into its typed entity
    pub fn decode_payload(&self) -> serde_json::Result<EntityPayload> {
        EntityPayload::decode(self.entity_type, &self.payload)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            operation_type: row.get(2)?,
            entity_type: row.get(3)?,
            entity_id: row.get(4)?,
            payload: row.get(5)?,
            status: row.get(6)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            next_attempt_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
            created_at: from_millis(row.get(10)?),
        })
    }
}

const COLUMNS: &str = "id, user_id, operation_type, entity_type, entity_id, payload, \
                       status, attempts, last_error, next_attempt_at, created_at";

/// An entry about to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub user_id: String,
    pub operation_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: String,
}

impl NewOperation {
    /// Build an entry that snapshots `entity`
    pub fn for_entity(
        user_id: impl Into<String>,
        operation_type: OperationType,
        entity: &EntityPayload,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            user_id: user_id.into(),
            operation_type,
            entity_type: entity.entity_type(),
            entity_id: entity.id().to_string(),
            payload: entity.encode()?,
        })
    }
}

/// Backoff and ceiling for transient push failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which an entry is marked failed; 0 disables the ceiling
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }
}

impl RetryPolicy {
    /// Retry on the next run with no delay and no ceiling
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Delay before the next try, given the attempts recorded so far
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// What `record_failed_attempt` did with the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back to `pending`, selectable again at `next_attempt_at`
    Rescheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Ceiling reached; the entry is now `failed`
    Exhausted { attempts: u32 },
}

/// Entry counts per status for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LedgerCounts {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

impl LedgerCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed
    }
}

/// Append an entry with `pending` status; returns its id
pub fn enqueue(conn: &Connection, op: &NewOperation) -> StorageResult<i64> {
    conn.execute(
        r#"INSERT INTO pending_operations
               (user_id, operation_type, entity_type, entity_id, payload, status, attempts, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)"#,
        params![
            op.user_id,
            op.operation_type,
            op.entity_type,
            op.entity_id,
            op.payload,
            to_millis(Utc::now()),
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        id,
        entity_type = %op.entity_type,
        entity_id = %op.entity_id,
        operation = %op.operation_type,
        "Enqueued pending operation"
    );
    Ok(id)
}

/// Oldest eligible entry for `user_id` whose id is not in `exclude_ids`
pub fn select_next(
    conn: &Connection,
    user_id: &str,
    exclude_ids: &[i64],
    now: DateTime<Utc>,
) -> StorageResult<Option<PendingOperation>> {
    let excluded = serde_json::to_string(exclude_ids)?;
    let sql = format!(
        r#"SELECT {COLUMNS}
           FROM pending_operations p
           WHERE p.user_id = ?1
             AND p.status = 'pending'
             AND (p.next_attempt_at IS NULL OR p.next_attempt_at <= ?2)
             AND p.id NOT IN (SELECT value FROM json_each(?3))
             AND NOT EXISTS (
                 SELECT 1 FROM pending_operations o
                 WHERE o.user_id = p.user_id
                   AND o.entity_id = p.entity_id
                   AND o.id != p.id
                   AND (o.status IN ('processing', 'failed') OR o.id < p.id)
             )
           ORDER BY p.id ASC
           LIMIT 1"#
    );
    let op = conn
        .query_row(&sql, params![user_id, to_millis(now), excluded], |row| {
            PendingOperation::from_row(row)
        })
        .optional()?;
    Ok(op)
}

/// Fetch a single entry
pub fn get(conn: &Connection, id: i64) -> StorageResult<Option<PendingOperation>> {
    let sql = format!("SELECT {COLUMNS} FROM pending_operations WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], |row| PendingOperation::from_row(row))
        .optional()?)
}

/// All entries for a user, oldest first
pub fn list(conn: &Connection, user_id: &str) -> StorageResult<Vec<PendingOperation>> {
    let sql = format!("SELECT {COLUMNS} FROM pending_operations WHERE user_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![user_id], |row| PendingOperation::from_row(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Entry counts per status
pub fn counts(conn: &Connection, user_id: &str) -> StorageResult<LedgerCounts> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM pending_operations WHERE user_id = ?1 GROUP BY status",
    )?;
    let mut rows = stmt.query(params![user_id])?;
    let mut counts = LedgerCounts::default();
    while let Some(row) = rows.next()? {
        let status: OperationStatus = row.get(0)?;
        let n: i64 = row.get(1)?;
        let n = u64::try_from(n).unwrap_or(0);
        match status {
            OperationStatus::Pending => counts.pending = n,
            OperationStatus::Processing => counts.processing = n,
            OperationStatus::Failed => counts.failed = n,
        }
    }
    Ok(counts)
}

/// `pending` -> `processing`
pub fn mark_processing(conn: &Connection, id: i64) -> StorageResult<()> {
    set_status(conn, id, OperationStatus::Processing)
}

/// Any status -> `failed`
pub fn mark_failed(conn: &Connection, id: i64) -> StorageResult<()> {
    set_status(conn, id, OperationStatus::Failed)
}

fn set_status(conn: &Connection, id: i64, status: OperationStatus) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE pending_operations SET status = ?1 WHERE id = ?2",
        params![status, id],
    )?;
    if changed == 0 {
        return Err(super::StorageError::OperationNotFound(id));
    }
    Ok(())
}

/// Count a transient failure and put the entry back in the queue
///
/// Once the policy's ceiling is reached the entry is marked `failed`
/// instead of rescheduled.
pub fn record_failed_attempt(
    conn: &Connection,
    id: i64,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> StorageResult<AttemptOutcome> {
    let attempts: Option<u32> = conn
        .query_row(
            "SELECT attempts FROM pending_operations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let attempts = attempts
        .ok_or(super::StorageError::OperationNotFound(id))?
        .saturating_add(1);

    if policy.is_exhausted(attempts) {
        conn.execute(
            r#"UPDATE pending_operations
               SET status = 'failed', attempts = ?1, last_error = ?2, next_attempt_at = NULL
               WHERE id = ?3"#,
            params![attempts, error, id],
        )?;
        return Ok(AttemptOutcome::Exhausted { attempts });
    }

    let delay = chrono::Duration::from_std(policy.delay_for(attempts))
        .unwrap_or_else(|_| chrono::Duration::zero());
    let next_attempt_at = now + delay;
    conn.execute(
        r#"UPDATE pending_operations
           SET status = 'pending', attempts = ?1, last_error = ?2, next_attempt_at = ?3
           WHERE id = ?4"#,
        params![attempts, error, to_millis(next_attempt_at), id],
    )?;
    Ok(AttemptOutcome::Rescheduled {
        attempts,
        next_attempt_at,
    })
}

/// Attach a diagnostic message to an entry
pub fn set_last_error(conn: &Connection, id: i64, error: &str) -> StorageResult<()> {
    conn.execute(
        "UPDATE pending_operations SET last_error = ?1 WHERE id = ?2",
        params![error, id],
    )?;
    Ok(())
}

/// Rewrite `entity_id` on every entry of `user_id` that references `old_id`
pub fn remap_entity_id(
    conn: &Connection,
    user_id: &str,
    old_id: &str,
    new_id: &str,
) -> StorageResult<usize> {
    let changed = conn.execute(
        "UPDATE pending_operations SET entity_id = ?1 WHERE entity_id = ?2 AND user_id = ?3",
        params![new_id, old_id, user_id],
    )?;
    debug!(user_id, old_id, new_id, changed, "Remapped pending operations");
    Ok(changed)
}

/// Rewrite parent references (`spaceId`, `templateId`) inside queued payloads
pub fn remap_payload_references(
    conn: &Connection,
    user_id: &str,
    old_id: &str,
    new_id: &str,
) -> StorageResult<usize> {
    let mut changed = 0;
    for field in ["$.spaceId", "$.templateId"] {
        changed += conn.execute(
            r#"UPDATE pending_operations
               SET payload = json_set(payload, ?1, ?2)
               WHERE user_id = ?4 AND json_valid(payload) AND json_extract(payload, ?1) = ?3"#,
            params![field, new_id, old_id, user_id],
        )?;
    }
    Ok(changed)
}

/// Remove an entry; returns whether it existed
pub fn delete(conn: &Connection, id: i64) -> StorageResult<bool> {
    let changed = conn.execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Operator override: put a `failed` entry back in the queue with a clean slate
pub fn retry(conn: &Connection, id: i64) -> StorageResult<bool> {
    let changed = conn.execute(
        r#"UPDATE pending_operations
           SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = NULL
           WHERE id = ?1"#,
        params![id],
    )?;
    Ok(changed > 0)
}

/// Return entries stranded in `processing` by an interrupted run to `pending`
///
/// Only one run exists at a time, so any `processing` row seen at run start
/// belongs to a run that never finished.
pub fn release_in_flight(conn: &Connection, user_id: &str) -> StorageResult<usize> {
    let changed = conn.execute(
        "UPDATE pending_operations SET status = 'pending' WHERE user_id = ?1 AND status = 'processing'",
        params![user_id],
    )?;
    Ok(changed)
}
