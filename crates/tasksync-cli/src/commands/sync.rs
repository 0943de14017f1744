//! Sync command handler

use anyhow::{anyhow, Result};

use tasksync_core::{Config, SignalBus, Store, SyncEngine, SyncOutcome, SyncSignal};

use crate::output::Output;

/// Push pending operations and pull remote changes
pub async fn sync(store: &Store, config: &Config, output: &Output) -> Result<()> {
    let (signals, mut rx) = SignalBus::channel();
    let engine = SyncEngine::connect(config, store.database().clone(), signals)?;

    output.message("Syncing...");
    let outcome = engine.sync(store.user_id()).await;

    while let Ok(signal) = rx.try_recv() {
        match signal {
            SyncSignal::AuthenticationFailed => output.warn(
                "Authentication failed. Store new tokens with:\n  \
                 tasksync auth set --access-token <token> --refresh-token <token>",
            ),
            SyncSignal::TaskListChanged => output.message("Local tasks updated from server"),
            SyncSignal::SyncStarted | SyncSignal::SyncEnded => {}
        }
    }

    match outcome {
        SyncOutcome::AlreadyRunning => {
            output.message("A sync is already running");
            Ok(())
        }
        SyncOutcome::Completed(report) => {
            output.print_report(&report);
            if report.failed > 0 {
                output.warn("Some operations failed; see `tasksync pending list`");
            }
            output.success("Sync complete");
            Ok(())
        }
        SyncOutcome::Aborted { report, error } => {
            output.print_report(&report);
            Err(anyhow!(error).context("Sync aborted"))
        }
    }
}
