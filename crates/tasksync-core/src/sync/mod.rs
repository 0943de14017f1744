//! Synchronization with the task API
//!
//! Pushes the pending-operation ledger to the server and pulls remote
//! changes into the local store.
//!
//! ## Layers
//!
//! - `http`: `HttpClient` seam and the `reqwest` implementation
//! - `transport`: bearer auth with single-flight token refresh
//! - `api`: typed calls (`send_operation`, `fetch_changes`)
//! - `resolver`: classification of rejected pushes
//! - `engine`: the push/pull orchestrator
//!
//! ## Usage
//!
//! ```ignore
//! let (signals, mut rx) = SignalBus::channel();
//! let engine = SyncEngine::connect(&config, store.database().clone(), signals)?;
//! match engine.sync("user-1").await {
//!     SyncOutcome::Completed(report) => println!("pushed {}", report.pushed),
//!     other => eprintln!("{other:?}"),
//! }
//! ```

pub mod api;
pub mod auth;
pub mod endpoint;
pub mod engine;
pub mod http;
pub mod resolver;
pub mod signal;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use api::{ApiError, SyncApi, SyncDelta};
pub use auth::{AuthError, AuthTokens, MemoryTokenStore, TokenStore};
pub use engine::{SyncEngine, SyncError, SyncOptions, SyncOutcome, SyncPhase, SyncReport};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestClient, TransportError};
pub use signal::{SignalBus, SyncSignal};
pub use transport::AuthenticatedTransport;

use crate::config::Config;
use crate::storage::{FileTokenStore, SharedDatabase};

impl SyncEngine {
    /// Build an engine talking to the configured API with file-backed tokens
    pub fn connect(config: &Config, db: SharedDatabase, signals: SignalBus) -> Result<Self> {
        let api_url = config
            .api_url
            .as_deref()
            .context("No API URL configured. Set api_url or TASKSYNC_API_URL.")?;
        let http = ReqwestClient::new(api_url, config.request_timeout())
            .context("Failed to build HTTP client")?;
        let tokens = FileTokenStore::new(config.tokens_path());
        let transport = AuthenticatedTransport::new(Arc::new(http), Arc::new(tokens), signals.clone())
            .context("Failed to load stored tokens")?;

        Ok(SyncEngine::new(
            db,
            SyncApi::new(Arc::new(transport)),
            signals,
            SyncOptions::from(config),
        ))
    }
}
