//! SQLite connection handling
//!
//! Opens the local store, initializes the schema and hands out
//! transactions. All multi-row mutations in the sync engine run through
//! [`Database::transaction`] so partial application is never observable.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, Transaction};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::config::Config;

/// Handle shared by the application and the sync engine
///
/// Holders lock only around synchronous storage calls, never across a
/// network request.
pub type SharedDatabase = Arc<tokio::sync::Mutex<Database>>;

/// The local transactional store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database at the configured location
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_path(&config.sqlite_path())
    }

    /// Open or create the database at a specific path
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        // WAL lets readers (UI) proceed while a sync transaction is open
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        if needs_init(&conn) {
            debug!("Initializing local schema");
            init_schema(&conn)?;
        }
        Ok(Self { conn })
    }

    /// Wrap in a [`SharedDatabase`]
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction, committing only if it succeeds
    ///
    /// On error the transaction is dropped, which rolls it back.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
