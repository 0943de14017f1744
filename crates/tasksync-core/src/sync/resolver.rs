//! Conflict resolution for rejected pushes
//!
//! Every failed push is classified into one [`Resolution`] and applied to
//! the ledger. Conflicts are settled here and never reach the caller.
//!
//! | Response                                   | Resolution |
//! |--------------------------------------------|------------|
//! | 409 `DUPLICATE_ENTITY` with `canonical_id` | remap      |
//! | 409 `DUPLICATE_ENTITY` without id          | fail       |
//! | 409 `STALE_DATA`                           | discard    |
//! | 409 other                                  | fail       |
//! | 404                                        | discard    |
//! | 401, 5xx, no response                      | retry      |
//! | other 4xx                                  | fail       |

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::api::ApiError;
use crate::storage::ledger::{self, AttemptOutcome, PendingOperation, RetryPolicy};
use crate::storage::{entities, StorageResult};

pub const DUPLICATE_ENTITY: &str = "DUPLICATE_ENTITY";
pub const STALE_DATA: &str = "STALE_DATA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The server already holds this entity under `canonical_id`
    Remap { canonical_id: String },
    /// Drop the entry; the server state wins
    Discard,
    /// Keep the entry as `failed` for an operator to inspect
    Fail,
    /// Transient; count an attempt and try again later
    Retry,
}

pub fn classify(error: &ApiError) -> Resolution {
    let (status, code, canonical_id) = match error {
        ApiError::Transport(_) => return Resolution::Retry,
        ApiError::Http {
            status,
            code,
            canonical_id,
        } => (*status, code.as_deref(), canonical_id),
    };

    match status {
        409 => match code {
            Some(DUPLICATE_ENTITY) => match canonical_id {
                Some(id) => Resolution::Remap {
                    canonical_id: id.clone(),
                },
                None => Resolution::Fail,
            },
            Some(STALE_DATA) => Resolution::Discard,
            _ => Resolution::Fail,
        },
        404 => Resolution::Discard,
        401 => Resolution::Retry,
        s if s >= 500 => Resolution::Retry,
        _ => Resolution::Fail,
    }
}

/// What happened to the entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Remapped { canonical_id: String },
    Discarded,
    Failed,
    Retrying { next_attempt_at: DateTime<Utc> },
    /// Retry ceiling reached; the entry is now `failed`
    Exhausted,
    /// The entry was removed locally while its request was in flight
    Gone,
}

/// Apply `resolution` to `op`
///
/// Callers run this inside one transaction so a remap never leaves the
/// ledger half rewritten. An entry that no longer exists is already
/// settled and is left alone.
pub fn apply(
    conn: &Connection,
    op: &PendingOperation,
    resolution: &Resolution,
    reason: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> StorageResult<Resolved> {
    if ledger::get(conn, op.id)?.is_none() {
        debug!(op_id = op.id, ?resolution, "Operation removed while in flight");
        return Ok(Resolved::Gone);
    }

    match resolution {
        Resolution::Remap { canonical_id } => {
            let old_id = op.entity_id.as_str();
            if canonical_id != old_id {
                let user_id = op.user_id.as_str();
                let entries = ledger::remap_entity_id(conn, user_id, old_id, canonical_id)?;
                let references =
                    ledger::remap_payload_references(conn, user_id, old_id, canonical_id)?
                    + entities::remap_references(conn, old_id, canonical_id)?;
                entities::delete(conn, op.entity_type, old_id)?;
                info!(
                    op_id = op.id,
                    old_id,
                    canonical_id = %canonical_id,
                    entries,
                    references,
                    "Remapped duplicate entity"
                );
            }
            ledger::delete(conn, op.id)?;
            Ok(Resolved::Remapped {
                canonical_id: canonical_id.clone(),
            })
        }
        Resolution::Discard => {
            ledger::delete(conn, op.id)?;
            info!(op_id = op.id, entity_id = %op.entity_id, reason, "Discarded pending operation");
            Ok(Resolved::Discarded)
        }
        Resolution::Fail => {
            ledger::mark_failed(conn, op.id)?;
            ledger::set_last_error(conn, op.id, reason)?;
            warn!(op_id = op.id, entity_id = %op.entity_id, reason, "Pending operation failed");
            Ok(Resolved::Failed)
        }
        Resolution::Retry => match ledger::record_failed_attempt(conn, op.id, reason, policy, now)? {
            AttemptOutcome::Rescheduled {
                attempts,
                next_attempt_at,
            } => {
                info!(op_id = op.id, attempts, %next_attempt_at, reason, "Push will be retried");
                Ok(Resolved::Retrying { next_attempt_at })
            }
            AttemptOutcome::Exhausted { attempts } => {
                warn!(op_id = op.id, attempts, reason, "Retry limit reached");
                Ok(Resolved::Exhausted)
            }
        },
    }
}
