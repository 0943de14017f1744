//! Task API calls used by the sync engine

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::http::{HttpRequest, HttpResponse, Method, TransportError};
use super::transport::AuthenticatedTransport;
use crate::models::{RepetitiveTaskTemplate, Space, Task};

/// A failed API call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The server answered with a non-success status
    #[error("server returned HTTP {status} ({})", .code.as_deref().unwrap_or("no code"))]
    Http {
        status: u16,
        code: Option<String>,
        canonical_id: Option<String>,
    },

    /// No usable response
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ApiError {
    /// Build from an error response, reading the `{result: {code, data}}` envelope
    pub fn from_response(response: &HttpResponse) -> Self {
        let result = serde_json::from_str::<Value>(&response.body)
            .ok()
            .and_then(|body| body.get("result").cloned());
        let code = result
            .as_ref()
            .and_then(|r| r.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let canonical_id = result
            .as_ref()
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("canonical_id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        ApiError::Http {
            status: response.status,
            code,
            canonical_id,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport(_) => None,
        }
    }
}

/// One page of remote changes
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncDelta {
    pub tasks: Vec<Task>,
    pub spaces: Vec<Space>,
    pub repetitive_task_templates: Vec<RepetitiveTaskTemplate>,
    pub latest_change_id: i64,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entities on the page
    pub fn len(&self) -> usize {
        self.tasks.len() + self.spaces.len() + self.repetitive_task_templates.len()
    }
}

/// Typed access to the task API over an authenticated transport
#[derive(Clone)]
pub struct SyncApi {
    transport: Arc<AuthenticatedTransport>,
}

impl SyncApi {
    pub fn new(transport: Arc<AuthenticatedTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<AuthenticatedTransport> {
        &self.transport
    }

    /// Push one mutation; any 2xx counts as accepted
    pub async fn send_operation(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
    ) -> Result<(), ApiError> {
        let mut request = HttpRequest::new(method, path);
        request.body = body;
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(ApiError::from_response(&response))
        }
    }

    /// Changes recorded after `last_change_id`
    pub async fn fetch_changes(&self, last_change_id: i64) -> Result<SyncDelta, ApiError> {
        let request = HttpRequest::get("/sync").with_query("last_change_id", last_change_id);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_response(&response));
        }
        Ok(response.json()?)
    }
}
