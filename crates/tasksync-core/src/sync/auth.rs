//! Authentication tokens
//!
//! The engine only needs a bearer token and the ability to rotate it.
//! Acquiring the first pair (sign-in) happens outside this crate.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageResult;

/// Access/refresh token pair as exchanged with `/auth/refresh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Where the current token pair is kept between runs
pub trait TokenStore: Send + Sync {
    fn load(&self) -> StorageResult<Option<AuthTokens>>;
    fn save(&self, tokens: &AuthTokens) -> StorageResult<()>;
}

/// Process-local token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<AuthTokens>>,
}

impl MemoryTokenStore {
    pub fn new(tokens: Option<AuthTokens>) -> Self {
        Self {
            tokens: Mutex::new(tokens),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> StorageResult<Option<AuthTokens>> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, tokens: &AuthTokens) -> StorageResult<()> {
        *self.tokens.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokens.clone());
        Ok(())
    }
}

/// Why a token refresh did not produce a new access token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("refresh request failed: {0}")]
    Transport(String),

    #[error("refresh response could not be read: {0}")]
    InvalidResponse(String),

    #[error("refresh was abandoned before completing")]
    Abandoned,
}
