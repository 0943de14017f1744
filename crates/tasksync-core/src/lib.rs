//! tasksync core library
//!
//! Offline-first synchronization for a task manager. The application writes
//! to a local SQLite store; every write also lands in a durable ledger of
//! pending operations. The sync engine pushes that ledger to the task API,
//! settles conflicts, and pulls remote changes back with last-write-wins.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = Store::open(&config, "user-1")?;
//! store.create(Task::new("Water plants")).await?;
//!
//! let (signals, rx) = SignalBus::channel();
//! let engine = SyncEngine::connect(&config, store.database().clone(), signals)?;
//! engine.sync("user-1").await;
//! ```
//!
//! # Modules
//!
//! - `store`: local writes with transactional enqueue (main entry point)
//! - `models`: tasks, spaces, repetitive task templates, tags
//! - `storage`: SQLite schema, ledger, change cursor, token file
//! - `sync`: transport, conflict resolver, orchestrator
//! - `config`: application configuration

pub mod config;
pub mod models;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::Config;
pub use models::{EntityPayload, EntityType, OperationType, RepetitiveTaskTemplate, Space, Tag, Task};
pub use storage::{Database, SharedDatabase, StorageError};
pub use store::Store;
pub use sync::{SignalBus, SyncEngine, SyncOutcome, SyncReport, SyncSignal};
