//! Status command handler

use anyhow::Result;

use tasksync_core::storage::FileTokenStore;
use tasksync_core::sync::TokenStore;
use tasksync_core::{Config, Store};

use crate::output::{Output, OutputFormat};

/// Show ledger, cursor and local store status
pub async fn show(store: &Store, config: &Config, output: &Output) -> Result<()> {
    let counts = store.counts().await?;
    let cursor = store.cursor().await?;
    let entities = store.entity_counts().await?;
    let signed_in = matches!(FileTokenStore::new(config.tokens_path()).load(), Ok(Some(_)));

    match output.format {
        OutputFormat::Json => {
            let entity_counts: serde_json::Map<String, serde_json::Value> = entities
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), (*n).into()))
                .collect();
            output.json(&serde_json::json!({
                "user_id": store.user_id(),
                "api_url": config.api_url,
                "signed_in": signed_in,
                "pending": counts,
                "cursor": cursor,
                "entities": entity_counts
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", counts.total());
        }
        OutputFormat::Human => {
            println!("tasksync Status");
            println!("===============");
            println!();
            println!("Account:");
            println!("  User:      {}", store.user_id());
            println!(
                "  Server:    {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!("  Tokens:    {}", if signed_in { "stored" } else { "missing" });
            println!();
            println!("Sync:");
            println!(
                "  Last sync: {}",
                cursor
                    .last_sync_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("  Change id: {}", cursor.last_change_id);
            println!();
            println!("Pending operations:");
            println!("  Pending:    {}", counts.pending);
            println!("  Processing: {}", counts.processing);
            println!("  Failed:     {}", counts.failed);
            println!();
            println!("Local store ({}):", config.sqlite_path().display());
            for (entity_type, n) in &entities {
                println!("  {:<26} {}", entity_type.table(), n);
            }
        }
    }

    Ok(())
}
