//! Local store facade
//!
//! `Store` is what the application writes through. Every mutation updates
//! the domain row and enqueues the matching pending operation in the same
//! transaction, so the ledger never misses a local change and never holds
//! one that was rolled back.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open(&config, "user-1")?;
//!
//! let mut task = Task::new("Water plants");
//! store.create(task.clone()).await?;
//!
//! task.complete();
//! store.update(task).await?;
//! ```

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::models::{EntityPayload, EntityType, OperationType, Task};
use crate::storage::cursor::{self, ChangeCursor};
use crate::storage::ledger::{self, LedgerCounts, NewOperation, PendingOperation};
use crate::storage::{entities, Database, SharedDatabase, StorageError, StorageResult};

/// Local-first access to one user's data
#[derive(Clone)]
pub struct Store {
    db: SharedDatabase,
    user_id: String,
}

impl Store {
    /// Open the configured database for `user_id`
    pub fn open(config: &Config, user_id: impl Into<String>) -> Result<Self> {
        config
            .ensure_data_dir()
            .context("Failed to create data directory")?;
        let db = Database::open(config).context("Failed to open local database")?;
        Ok(Self::new(db.into_shared(), user_id))
    }

    pub fn new(db: SharedDatabase, user_id: impl Into<String>) -> Self {
        Self {
            db,
            user_id: user_id.into(),
        }
    }

    /// The database handle, for wiring up a sync engine
    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Insert a new entity; returns the pending operation id
    pub async fn create(&self, entity: impl Into<EntityPayload>) -> StorageResult<i64> {
        self.write(OperationType::Create, entity.into()).await
    }

    /// Store a modified entity; returns the pending operation id
    ///
    /// Tags are immutable on the server, so updating one is refused with
    /// [`StorageError::UnsupportedOperation`]. Delete it and create a new one.
    pub async fn update(&self, entity: impl Into<EntityPayload>) -> StorageResult<i64> {
        let entity = entity.into();
        if let EntityPayload::Tag(_) = entity {
            return Err(StorageError::UnsupportedOperation {
                entity_type: EntityType::Tag,
                operation: OperationType::Update,
            });
        }
        self.write(OperationType::Update, entity).await
    }

    /// Remove an entity locally and queue its deletion
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> StorageResult<i64> {
        let mut db = self.db.lock().await;
        db.transaction(|tx| -> StorageResult<i64> {
            let snapshot =
                entities::get(tx, entity_type, id)?.ok_or_else(|| StorageError::EntityNotFound {
                    entity_type,
                    id: id.to_string(),
                })?;
            entities::delete(tx, entity_type, id)?;
            let op = NewOperation::for_entity(&self.user_id, OperationType::Delete, &snapshot)?;
            ledger::enqueue(tx, &op)
        })
    }

    async fn write(&self, operation_type: OperationType, entity: EntityPayload) -> StorageResult<i64> {
        let mut db = self.db.lock().await;
        db.transaction(|tx| -> StorageResult<i64> {
            let snapshot = if entities::upsert(tx, &entity)? {
                entity
            } else {
                debug!(entity_id = entity.id(), "Local row is newer; queueing it instead");
                entities::get(tx, entity.entity_type(), entity.id())?.unwrap_or(entity)
            };
            let op = NewOperation::for_entity(&self.user_id, operation_type, &snapshot)?;
            ledger::enqueue(tx, &op)
        })
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> StorageResult<Option<EntityPayload>> {
        let db = self.db.lock().await;
        entities::get(db.connection(), entity_type, id)
    }

    pub async fn tasks(&self) -> StorageResult<Vec<Task>> {
        let db = self.db.lock().await;
        entities::list_tasks(db.connection())
    }

    /// Number of local rows per entity type
    pub async fn entity_counts(&self) -> StorageResult<Vec<(EntityType, u64)>> {
        let db = self.db.lock().await;
        EntityType::ALL
            .iter()
            .map(|&t| entities::count(db.connection(), t).map(|n| (t, n)))
            .collect()
    }

    /// All pending operations, oldest first
    pub async fn pending(&self) -> StorageResult<Vec<PendingOperation>> {
        let db = self.db.lock().await;
        ledger::list(db.connection(), &self.user_id)
    }

    pub async fn counts(&self) -> StorageResult<LedgerCounts> {
        let db = self.db.lock().await;
        ledger::counts(db.connection(), &self.user_id)
    }

    /// Put a failed operation back in the queue
    pub async fn retry(&self, op_id: i64) -> StorageResult<bool> {
        let db = self.db.lock().await;
        self.ensure_owned(&db, op_id)?;
        ledger::retry(db.connection(), op_id)
    }

    /// Drop an operation without sending it
    pub async fn discard(&self, op_id: i64) -> StorageResult<bool> {
        let db = self.db.lock().await;
        self.ensure_owned(&db, op_id)?;
        ledger::delete(db.connection(), op_id)
    }

    pub async fn cursor(&self) -> StorageResult<ChangeCursor> {
        let db = self.db.lock().await;
        cursor::load(db.connection(), &self.user_id)
    }

    /// Forget the pull watermark so the next sync fetches everything
    pub async fn reset_cursor(&self) -> StorageResult<()> {
        let db = self.db.lock().await;
        cursor::reset(db.connection(), &self.user_id)
    }

    fn ensure_owned(&self, db: &Database, op_id: i64) -> StorageResult<()> {
        match ledger::get(db.connection(), op_id)? {
            Some(op) if op.user_id == self.user_id => Ok(()),
            _ => Err(StorageError::OperationNotFound(op_id)),
        }
    }
}
