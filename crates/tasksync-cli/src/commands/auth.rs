//! Auth command handlers
//!
//! Sign-in happens elsewhere; these commands only store or forget the token
//! pair the sync engine uses.

use anyhow::{Context, Result};

use tasksync_core::storage::FileTokenStore;
use tasksync_core::sync::{AuthTokens, TokenStore};
use tasksync_core::Config;

use crate::output::Output;

pub fn set(config: &Config, access_token: String, refresh_token: String, output: &Output) -> Result<()> {
    let store = FileTokenStore::new(config.tokens_path());
    store
        .save(&AuthTokens {
            access_token,
            refresh_token,
        })
        .context("Failed to save tokens")?;
    output.success(&format!("Tokens saved to {}", store.path().display()));
    Ok(())
}

pub fn clear(config: &Config, output: &Output) -> Result<()> {
    FileTokenStore::new(config.tokens_path())
        .clear()
        .context("Failed to remove tokens")?;
    output.success("Tokens removed");
    Ok(())
}
