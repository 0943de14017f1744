//! Storage layer
//!
//! The local SQLite store shared by the application and the sync engine.
//!
//! ## Layout
//!
//! - `ledger`: pending-operation queue (outbound mutations)
//! - `cursor`: per-user change watermark and last sync time
//! - `entities`: domain rows with last-write-wins upserts
//! - `persistence`: token pair file
//!
//! Row-level modules expose free functions over `&Connection` so they
//! compose inside one transaction.

pub mod cursor;
pub mod database;
pub mod entities;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod schema;

use chrono::{DateTime, Utc};

pub use database::{Database, SharedDatabase};
pub use error::{StorageError, StorageResult};
pub use ledger::{
    AttemptOutcome, LedgerCounts, NewOperation, OperationStatus, PendingOperation, RetryPolicy,
};
pub use persistence::FileTokenStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
