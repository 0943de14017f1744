//! Pending operation command handlers

use anyhow::{bail, Result};

use tasksync_core::Store;

use crate::output::Output;

/// List the ledger, oldest first
pub async fn list(store: &Store, output: &Output) -> Result<()> {
    let ops = store.pending().await?;
    output.print_operations(&ops);
    Ok(())
}

/// Put a failed operation back in the queue
pub async fn retry(store: &Store, id: i64, output: &Output) -> Result<()> {
    if !store.retry(id).await? {
        bail!("Pending operation {} not found", id);
    }
    output.success(&format!("Operation {} will be retried on the next sync", id));
    Ok(())
}

/// Drop an operation without sending it
pub async fn discard(store: &Store, id: i64, output: &Output) -> Result<()> {
    if !store.discard(id).await? {
        bail!("Pending operation {} not found", id);
    }
    output.success(&format!("Discarded operation {}", id));
    Ok(())
}
