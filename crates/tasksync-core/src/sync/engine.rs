//! Sync orchestrator
//!
//! A run pushes every eligible pending operation, pulls remote changes, and
//! repeats while operations that have not been attempted in this run are
//! still eligible (for example ones enqueued while the run was in flight).
//!
//! ## Phases
//!
//! ```text
//! Idle -> Pushing -> Pulling -> (Pushing | Idle)
//! ```
//!
//! Only one run is active at a time. A second trigger returns
//! [`SyncOutcome::AlreadyRunning`] without touching anything.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::api::{SyncApi, SyncDelta};
use super::endpoint::endpoint_for;
use super::resolver::{self, Resolved};
use super::signal::{SignalBus, SyncSignal};
use crate::config::Config;
use crate::storage::cursor;
use crate::storage::ledger::{self, PendingOperation, RetryPolicy};
use crate::storage::{entities, SharedDatabase, StorageError, StorageResult};

/// Errors that abort a sync run
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store failed during sync: {0}")]
    Storage(#[from] StorageError),
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Storage(StorageError::Serialization(error))
    }
}

/// Tunables for a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub retry: RetryPolicy,
    /// Upper bound on delta pages fetched in one pull phase
    pub max_pull_pages: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            max_pull_pages: config.max_pull_pages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Operations accepted by the server
    pub pushed: usize,
    /// Operations dropped after 404 or stale data
    pub discarded: usize,
    /// Operations settled by adopting a canonical id
    pub remapped: usize,
    /// Operations newly marked failed
    pub failed: usize,
    /// Operations rescheduled after a transient error
    pub retried: usize,
    /// Remote entities received
    pub pulled: usize,
    /// Push/pull cycles executed
    pub cycles: usize,
    /// Set when a pull stopped on a transport or HTTP error
    pub pull_error: Option<String>,
}

impl SyncReport {
    fn record(&mut self, resolved: &Resolved) {
        match resolved {
            Resolved::Remapped { .. } => self.remapped += 1,
            Resolved::Discarded => self.discarded += 1,
            Resolved::Failed | Resolved::Exhausted => self.failed += 1,
            Resolved::Retrying { .. } => self.retried += 1,
            Resolved::Gone => {}
        }
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Another run holds the gate; nothing was done
    AlreadyRunning,
    Completed(SyncReport),
    /// A local storage failure stopped the run early
    Aborted { report: SyncReport, error: SyncError },
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::AlreadyRunning => None,
            SyncOutcome::Completed(report) | SyncOutcome::Aborted { report, .. } => Some(report),
        }
    }
}

/// Single-run gate
#[derive(Debug, Default)]
struct RunGate {
    active: AtomicBool,
}

impl RunGate {
    fn try_acquire(&self) -> Option<RunGuard<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { gate: self })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Clears the gate when dropped, on every exit path
struct RunGuard<'a> {
    gate: &'a RunGate,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    db: SharedDatabase,
    api: SyncApi,
    signals: SignalBus,
    options: SyncOptions,
    gate: RunGate,
    phase: watch::Sender<SyncPhase>,
}

impl SyncEngine {
    pub fn new(db: SharedDatabase, api: SyncApi, signals: SignalBus, options: SyncOptions) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            db,
            api,
            signals,
            options,
            gate: RunGate::default(),
            phase,
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_active()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Run one sync for `user_id`
    pub async fn sync(&self, user_id: &str) -> SyncOutcome {
        let Some(guard) = self.gate.try_acquire() else {
            debug!(user_id, "Sync already running");
            return SyncOutcome::AlreadyRunning;
        };

        self.signals.emit(SyncSignal::SyncStarted);
        info!(user_id, "Sync started");

        let mut report = SyncReport::default();
        let result = self.run(user_id, &mut report).await;

        self.phase.send_replace(SyncPhase::Idle);
        drop(guard);
        self.signals.emit(SyncSignal::SyncEnded);
        {
            let db = self.db.lock().await;
            if let Err(error) = cursor::set_last_sync(db.connection(), user_id, Utc::now()) {
                warn!(%error, "Could not record last sync time");
            }
        }

        match result {
            Ok(()) => {
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    failed = report.failed,
                    retried = report.retried,
                    cycles = report.cycles,
                    "Sync finished"
                );
                SyncOutcome::Completed(report)
            }
            Err(error) => {
                error!(%error, "Sync aborted");
                SyncOutcome::Aborted { report, error }
            }
        }
    }

    async fn run(&self, user_id: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        {
            let db = self.db.lock().await;
            let released = ledger::release_in_flight(db.connection(), user_id)?;
            if released > 0 {
                warn!(released, "Released operations left in processing by an earlier run");
            }
        }

        let mut attempted: Vec<i64> = Vec::new();
        loop {
            report.cycles += 1;

            self.phase.send_replace(SyncPhase::Pushing);
            self.push(user_id, &mut attempted, report).await?;

            self.phase.send_replace(SyncPhase::Pulling);
            self.pull(user_id, report).await?;

            let more = {
                let db = self.db.lock().await;
                ledger::select_next(db.connection(), user_id, &attempted, Utc::now())?.is_some()
            };
            if !more {
                return Ok(());
            }
            debug!(cycle = report.cycles, "Operations arrived during sync; pushing again");
        }
    }

    async fn push(
        &self,
        user_id: &str,
        attempted: &mut Vec<i64>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        loop {
            let next = {
                let db = self.db.lock().await;
                ledger::select_next(db.connection(), user_id, attempted, Utc::now())?
            };
            let Some(op) = next else {
                return Ok(());
            };
            attempted.push(op.id);
            self.process(op, report).await?;
        }
    }

    async fn process(&self, op: PendingOperation, report: &mut SyncReport) -> Result<(), SyncError> {
        let Some(endpoint) = endpoint_for(op.entity_type, op.operation_type) else {
            let reason = format!("no endpoint for {} {}", op.operation_type, op.entity_type);
            self.fail(&op, &reason).await?;
            report.failed += 1;
            return Ok(());
        };

        let body = if op.operation_type.has_body() {
            match op.decode_payload() {
                Ok(mut entity) => {
                    // The entry's id wins over the snapshot; it may have been remapped
                    entity.set_id(op.entity_id.clone());
                    Some(entity.to_json()?)
                }
                Err(error) => {
                    self.fail(&op, &format!("corrupt payload: {error}")).await?;
                    report.failed += 1;
                    return Ok(());
                }
            }
        } else {
            None
        };

        {
            let db = self.db.lock().await;
            if ledger::get(db.connection(), op.id)?.is_none() {
                debug!(op_id = op.id, "Operation removed before push");
                return Ok(());
            }
            ledger::mark_processing(db.connection(), op.id)?;
        }

        let path = endpoint.path(&op.entity_id);
        debug!(op_id = op.id, method = ?endpoint.method, %path, "Pushing operation");
        match self.api.send_operation(endpoint.method, path, body).await {
            Ok(()) => {
                let db = self.db.lock().await;
                ledger::delete(db.connection(), op.id)?;
                report.pushed += 1;
            }
            Err(api_error) => {
                let resolution = resolver::classify(&api_error);
                let reason = api_error.to_string();
                let policy = self.options.retry;
                let resolved = {
                    let mut db = self.db.lock().await;
                    db.transaction(|tx| {
                        resolver::apply(tx, &op, &resolution, &reason, &policy, Utc::now())
                    })?
                };
                report.record(&resolved);
            }
        }
        Ok(())
    }

    async fn fail(&self, op: &PendingOperation, reason: &str) -> StorageResult<()> {
        warn!(op_id = op.id, entity_id = %op.entity_id, reason, "Pending operation failed");
        let mut db = self.db.lock().await;
        db.transaction(|tx| -> StorageResult<()> {
            if ledger::get(tx, op.id)?.is_none() {
                return Ok(());
            }
            ledger::mark_failed(tx, op.id)?;
            ledger::set_last_error(tx, op.id, reason)
        })
    }

    async fn pull(&self, user_id: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        for _ in 0..self.options.max_pull_pages {
            let since = {
                let db = self.db.lock().await;
                cursor::load(db.connection(), user_id)?.last_change_id
            };

            let delta = match self.api.fetch_changes(since).await {
                Ok(delta) => delta,
                Err(error) => {
                    warn!(%error, since, "Pull failed; cursor not advanced");
                    report.pull_error = Some(error.to_string());
                    return Ok(());
                }
            };

            if delta.is_empty() {
                let db = self.db.lock().await;
                cursor::advance(db.connection(), user_id, delta.latest_change_id)?;
                return Ok(());
            }

            let written = {
                let mut db = self.db.lock().await;
                db.transaction(|tx| apply_delta(tx, user_id, &delta))?
            };
            report.pulled += delta.len();
            debug!(since, latest = delta.latest_change_id, received = delta.len(), written, "Applied remote changes");
            if written > 0 {
                self.signals.emit(SyncSignal::TaskListChanged);
            }

            if delta.latest_change_id <= since {
                warn!(since, latest = delta.latest_change_id, "Server did not advance the change id; stopping pull");
                return Ok(());
            }
        }
        warn!(pages = self.options.max_pull_pages, "Pull page limit reached");
        Ok(())
    }
}

/// Upsert one page parent-first and advance the cursor; returns rows written
fn apply_delta(conn: &rusqlite::Connection, user_id: &str, delta: &SyncDelta) -> StorageResult<usize> {
    let mut written = 0;
    for space in &delta.spaces {
        written += usize::from(entities::upsert_space(conn, space)?);
    }
    for template in &delta.repetitive_task_templates {
        written += usize::from(entities::upsert_template(conn, template)?);
    }
    for task in &delta.tasks {
        written += usize::from(entities::upsert_task(conn, task)?);
    }
    cursor::advance(conn, user_id, delta.latest_change_id)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::models::{EntityPayload, EntityType, OperationType, Space, Tag, Task};
    use crate::storage::{Database, OperationStatus};
    use crate::store::Store;
    use crate::sync::auth::{AuthTokens, MemoryTokenStore};
    use crate::sync::fake::FakeHttp;
    use crate::sync::http::{HttpResponse, Method, TransportError};
    use crate::sync::resolver::DUPLICATE_ENTITY;
    use crate::sync::transport::AuthenticatedTransport;

    struct Harness {
        engine: Arc<SyncEngine>,
        store: Store,
        http: Arc<FakeHttp>,
        signals: tokio::sync::mpsc::UnboundedReceiver<SyncSignal>,
    }

    fn harness_with(http: FakeHttp, options: SyncOptions) -> Harness {
        let http = Arc::new(http);
        let db = Database::open_in_memory().unwrap().into_shared();
        let tokens = Arc::new(MemoryTokenStore::new(Some(AuthTokens {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
        })));
        let (bus, signals) = SignalBus::channel();
        let transport =
            AuthenticatedTransport::new(http.clone(), tokens, bus.clone()).unwrap();
        let api = SyncApi::new(Arc::new(transport));
        Harness {
            engine: Arc::new(SyncEngine::new(db.clone(), api, bus, options)),
            store: Store::new(db, "u1"),
            http,
            signals,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeHttp::new(), SyncOptions::default())
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SyncSignal>) -> Vec<SyncSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected completed run, got {other:?}"),
        }
    }

    fn at(ms: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[tokio::test]
    async fn test_push_sends_and_clears_ledger() {
        let mut h = harness();
        let task = Task::new("Buy milk");
        h.store.create(task.clone()).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.cycles, 1);
        assert_eq!(h.store.counts().await.unwrap().total(), 0);

        let seen = h.http.seen();
        assert_eq!(seen[0].method, Method::Post);
        assert_eq!(seen[0].path, "/tasks");
        assert_eq!(seen[0].body.as_ref().unwrap()["id"], json!(task.id));
        assert_eq!(seen[0].body.as_ref().unwrap()["title"], json!("Buy milk"));
        assert_eq!(seen[1].path, "/sync");

        assert_eq!(
            drain(&mut h.signals),
            vec![SyncSignal::SyncStarted, SyncSignal::SyncEnded]
        );
        assert!(h.store.cursor().await.unwrap().last_sync_at.is_some());
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_per_entity_order_is_enqueue_order() {
        let h = harness();
        let mut a = Task::new("a");
        let b = Task::new("b");
        h.store.create(a.clone()).await.unwrap();
        h.store.create(b.clone()).await.unwrap();
        a.set_title("a2");
        h.store.update(a.clone()).await.unwrap();
        h.store.delete(EntityType::Task, &a.id).await.unwrap();

        completed(h.engine.sync("u1").await);

        let a_requests: Vec<_> = h
            .http
            .seen()
            .into_iter()
            .filter(|s| s.path.starts_with("/tasks"))
            .filter(|s| s.path.ends_with(&a.id) || s.body.as_ref().is_some_and(|b| b["id"] == json!(a.id)))
            .map(|s| s.method)
            .collect();
        assert_eq!(a_requests, vec![Method::Post, Method::Put, Method::Delete]);
    }

    #[tokio::test]
    async fn test_failed_head_blocks_entity_but_not_others() {
        let http = FakeHttp::new();
        http.respond("/tasks", 400, "");
        let h = harness_with(http, SyncOptions::default());

        let mut a = Task::new("a");
        let first = h.store.create(a.clone()).await.unwrap();
        a.set_title("a2");
        let second = h.store.update(a.clone()).await.unwrap();
        h.store.create(Space::new("Home")).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);

        let pending = h.store.pending().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|op| (op.id, op.status)).collect();
        assert_eq!(
            ids,
            vec![(first, OperationStatus::Failed), (second, OperationStatus::Pending)]
        );
        assert_eq!(pending[0].last_error.as_deref(), Some("server returned HTTP 400 (no code)"));
        assert_eq!(h.http.count("/tasks"), 1);
    }

    #[tokio::test]
    async fn test_conflict_resolution_outcomes() {
        let http = FakeHttp::new();
        http.respond(
            "/spaces",
            409,
            &json!({"result": {"code": DUPLICATE_ENTITY, "data": {"canonical_id": "srv-s"}}})
                .to_string(),
        );
        http.respond("/tasks", 404, "");
        http.respond("/tags", 503, "");
        let h = harness_with(http, SyncOptions::default());

        let mut space = Space::new("Inbox");
        h.store.create(space.clone()).await.unwrap();
        space.set_name("Inbox!");
        h.store.update(space.clone()).await.unwrap();

        let task = Task::new("gone");
        h.store.create(task.clone()).await.unwrap();
        h.http.respond("/tasks", 404, "");
        h.store.delete(EntityType::Task, &task.id).await.unwrap();

        let tag_op = h.store.create(Tag::new("later")).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.remapped, 1);
        assert_eq!(report.discarded, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.pushed, 1);

        // The update followed the space to its canonical id
        let put = h
            .http
            .seen()
            .into_iter()
            .find(|s| s.method == Method::Put)
            .unwrap();
        assert_eq!(put.path, "/spaces/srv-s");
        assert_eq!(put.body.unwrap()["id"], json!("srv-s"));
        assert!(h.store.get(EntityType::Space, &space.id).await.unwrap().is_none());

        let pending = h.store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, tag_op);
        assert_eq!(pending[0].status, OperationStatus::Pending);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_missing_endpoint_marks_failed() {
        let h = harness();
        let mut tag = Tag::new("old");
        h.store.create(tag.clone()).await.unwrap();
        // Written by an older client; the store no longer accepts tag updates
        tag.name = "new".to_string();
        let update = {
            let db = h.store.database().lock().await;
            let op = ledger::NewOperation::for_entity("u1", OperationType::Update, &EntityPayload::Tag(tag))
                .unwrap();
            ledger::enqueue(db.connection(), &op).unwrap()
        };

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 1);

        let pending = h.store.pending().await.unwrap();
        assert_eq!(pending[0].id, update);
        assert_eq!(pending[0].status, OperationStatus::Failed);
        assert_eq!(pending[0].last_error.as_deref(), Some("no endpoint for update tag"));
    }

    #[tokio::test]
    async fn test_corrupt_payload_marks_failed() {
        let h = harness();
        {
            let db = h.store.database().lock().await;
            ledger::enqueue(
                db.connection(),
                &ledger::NewOperation {
                    user_id: "u1".to_string(),
                    operation_type: OperationType::Create,
                    entity_type: EntityType::Task,
                    entity_id: "t1".to_string(),
                    payload: "{not json".to_string(),
                },
            )
            .unwrap();
        }

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.failed, 1);
        assert_eq!(h.http.count("/tasks"), 0);
        let op = &h.store.pending().await.unwrap()[0];
        assert!(op.last_error.as_deref().unwrap().starts_with("corrupt payload"));
    }

    #[tokio::test]
    async fn test_pull_applies_parents_first_and_advances_cursor() {
        let http = FakeHttp::new();
        http.respond(
            "/sync",
            200,
            &json!({
                "tasks": [{"id": "t1", "title": "Remote", "spaceId": "s1", "templateId": "r1",
                           "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-02T00:00:00Z"}],
                "spaces": [{"id": "s1", "name": "Work",
                            "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-01T00:00:00Z"}],
                "repetitiveTaskTemplates": [{"id": "r1", "title": "Standup", "spaceId": "s1", "recurrence": "daily",
                            "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-01T00:00:00Z"}],
                "latestChangeId": 3
            })
            .to_string(),
        );
        http.respond("/sync", 200, r#"{"latestChangeId":3}"#);
        let mut h = harness_with(http, SyncOptions::default());

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pulled, 3);

        let tasks = h.store.tasks().await.unwrap();
        assert_eq!(tasks[0].title, "Remote");
        assert_eq!(tasks[0].space_id.as_deref(), Some("s1"));
        assert!(h.store.get(EntityType::RepetitiveTaskTemplate, "r1").await.unwrap().is_some());
        assert_eq!(h.store.cursor().await.unwrap().last_change_id, 3);

        let queries: Vec<_> = h
            .http
            .seen()
            .into_iter()
            .filter(|s| s.path == "/sync")
            .map(|s| s.query[0].1.clone())
            .collect();
        assert_eq!(queries, vec!["0", "3"]);
        assert_eq!(
            drain(&mut h.signals),
            vec![
                SyncSignal::SyncStarted,
                SyncSignal::TaskListChanged,
                SyncSignal::SyncEnded
            ]
        );
    }

    #[tokio::test]
    async fn test_pull_is_last_write_wins() {
        let http = FakeHttp::new();
        let h = harness_with(http, SyncOptions::default());

        let mut local = Task::new("local edit");
        local.id = "t1".to_string();
        local.modified_at = at(2_000);
        {
            let db = h.store.database().lock().await;
            entities::upsert_task(db.connection(), &local).unwrap();
        }

        let page = |title: &str, modified: &str, change: i64| {
            json!({"tasks": [{"id": "t1", "title": title,
                              "createdAt": "1970-01-01T00:00:00Z", "modifiedAt": modified}],
                   "latestChangeId": change})
            .to_string()
        };
        h.http.respond("/sync", 200, &page("stale", "1970-01-01T00:00:01Z", 1));
        h.http.respond("/sync", 200, &page("tie", "1970-01-01T00:00:02Z", 2));
        h.http.respond("/sync", 200, r#"{"latestChangeId":2}"#);

        completed(h.engine.sync("u1").await);
        assert_eq!(h.store.tasks().await.unwrap()[0].title, "tie");
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_cursor_and_resumes() {
        let page = json!({
            "spaces": [{"id": "s1", "name": "Work",
                        "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-01T00:00:00Z"}],
            "latestChangeId": 2
        })
        .to_string();
        let second_page = json!({
            "spaces": [{"id": "s2", "name": "Home",
                        "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-01T00:00:00Z"}],
            "latestChangeId": 4
        })
        .to_string();

        let http = FakeHttp::new();
        http.respond("/sync", 200, &page);
        http.enqueue("/sync", Err(TransportError::Timeout));
        let h = harness_with(http, SyncOptions::default());

        let report = completed(h.engine.sync("u1").await);
        assert!(report.pull_error.is_some());
        assert_eq!(h.store.cursor().await.unwrap().last_change_id, 2);

        // The next run resumes from the cursor the failed pull left behind
        h.http.respond("/sync", 200, &second_page);
        h.http.respond("/sync", 200, r#"{"latestChangeId":4}"#);
        let report = completed(h.engine.sync("u1").await);
        assert!(report.pull_error.is_none());
        assert_eq!(h.store.cursor().await.unwrap().last_change_id, 4);

        let queries: Vec<_> = h
            .http
            .seen()
            .into_iter()
            .filter(|s| s.path == "/sync")
            .map(|s| s.query[0].1.clone())
            .collect();
        assert_eq!(queries, vec!["0", "2", "2", "4"]);
        let counts = h.store.entity_counts().await.unwrap();
        assert!(counts.contains(&(EntityType::Space, 2)));
    }

    #[tokio::test]
    async fn test_pull_stops_when_server_does_not_advance() {
        let http = FakeHttp::with_fallback(|_, _| {
            Ok(HttpResponse::new(
                200,
                json!({"spaces": [{"id": "s1", "name": "Loop",
                                   "createdAt": "2024-01-01T00:00:00Z", "modifiedAt": "2024-01-01T00:00:00Z"}],
                       "latestChangeId": 0})
                .to_string(),
            ))
        });
        let h = harness_with(http, SyncOptions::default());

        completed(h.engine.sync("u1").await);
        assert_eq!(h.http.count("/sync"), 1);
    }

    #[tokio::test]
    async fn test_second_trigger_while_running_is_a_no_op() {
        let h = harness();
        h.store.create(Task::new("slow")).await.unwrap();
        let release = h.http.hold_next_request();

        let engine = h.engine.clone();
        let (first, second) = tokio::join!(engine.sync("u1"), async {
            // The first run is parked on its push request
            tokio::task::yield_now().await;
            assert!(h.engine.is_running());
            let second = h.engine.sync("u1").await;
            release.notify_one();
            second
        });

        assert!(matches!(second, SyncOutcome::AlreadyRunning));
        assert_eq!(completed(first).pushed, 1);
        assert!(!h.engine.is_running());
        assert_eq!(h.http.count("/tasks"), 1);

        // The gate was released
        assert!(matches!(h.engine.sync("u1").await, SyncOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_operation_discarded_mid_push_does_not_abort_run() {
        let http = FakeHttp::new();
        http.respond("/tasks", 503, "");
        let h = harness_with(http, SyncOptions::default());
        let store = h.store.clone();

        let first = h.store.create(Task::new("dropped")).await.unwrap();
        h.store.create(Task::new("kept")).await.unwrap();

        let engine = h.engine.clone();
        let release = h.http.hold_next_request();
        let (outcome, _) = tokio::join!(engine.sync("u1"), async {
            // The first push is parked; the operator drops it meanwhile
            tokio::task::yield_now().await;
            assert!(store.discard(first).await.unwrap());
            release.notify_one();
        });

        let report = completed(outcome);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(h.store.counts().await.unwrap().total(), 0);

        let paths: Vec<_> = h.http.seen().into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["/tasks", "/tasks", "/sync"]);
    }

    #[tokio::test]
    async fn test_operation_enqueued_mid_run_triggers_another_cycle() {
        let h = harness();
        let store = h.store.clone();

        // A user edit lands while the pull request is in flight
        let late = Task::new("late");
        let late_id = late.id.clone();
        let engine = h.engine.clone();
        let release = h.http.hold_next_request();
        let (outcome, _) = tokio::join!(engine.sync("u1"), async {
            tokio::task::yield_now().await;
            store.create(late).await.unwrap();
            release.notify_one();
        });

        let report = completed(outcome);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.cycles, 2);

        let paths: Vec<_> = h.http.seen().into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["/sync", "/tasks", "/sync"]);
        assert_eq!(h.http.seen()[1].body.as_ref().unwrap()["id"], json!(late_id));
    }

    #[tokio::test]
    async fn test_retried_operation_waits_for_backoff() {
        let http = FakeHttp::with_fallback(|request, _| {
            if request.path.starts_with("/tasks") {
                Ok(HttpResponse::new(500, ""))
            } else {
                Ok(crate::sync::fake::default_response(request))
            }
        });
        let h = harness_with(http, SyncOptions::default());
        h.store.create(Task::new("flaky")).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.retried, 1);
        assert_eq!(report.cycles, 1);

        // Backoff has not elapsed, so a second run leaves it alone
        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.retried, 0);
        assert_eq!(h.http.count("/tasks"), 1);
    }

    #[tokio::test]
    async fn test_unbounded_retry_policy_allows_immediate_retry_next_run() {
        let http = FakeHttp::new();
        http.enqueue("/tasks", Err(TransportError::Network("offline".to_string())));
        let options = SyncOptions {
            retry: RetryPolicy::unbounded(),
            ..SyncOptions::default()
        };
        let h = harness_with(http, options);
        h.store.create(Task::new("offline")).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.retried, 1);
        assert_eq!(h.store.counts().await.unwrap().pending, 1);

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pushed, 1);
        assert_eq!(h.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_stale_processing_rows_are_released() {
        let h = harness();
        let op_id = h.store.create(Task::new("stranded")).await.unwrap();
        {
            let db = h.store.database().lock().await;
            ledger::mark_processing(db.connection(), op_id).unwrap();
        }

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pushed, 1);
        assert_eq!(h.store.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_other_users_operations_are_untouched() {
        let h = harness();
        let other = Store::new(h.store.database().clone(), "u2");
        other.create(Task::new("not mine")).await.unwrap();

        let report = completed(h.engine.sync("u1").await);
        assert_eq!(report.pushed, 0);
        assert_eq!(other.counts().await.unwrap().pending, 1);
        assert_eq!(h.http.count("/tasks"), 0);
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_request() {
        let h = harness();
        let mut task = Task::new("with space");
        task.space_id = Some("s1".to_string());
        h.store.create(task.clone()).await.unwrap();

        completed(h.engine.sync("u1").await);
        let body = h.http.seen()[0].body.clone().unwrap();
        let sent: Task = serde_json::from_value(body).unwrap();
        assert_eq!(EntityPayload::Task(sent), EntityPayload::Task(task));
    }
}
