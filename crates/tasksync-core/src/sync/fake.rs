//! Scripted HTTP client for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::http::{HttpClient, HttpRequest, HttpResponse, Method, TransportError};

type Responder =
    Box<dyn Fn(&HttpRequest, Option<&str>) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// A request as the fake saw it
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
    pub retried: bool,
}

/// HTTP client answering from queued responses or a fallback closure
pub struct FakeHttp {
    queued: Mutex<VecDeque<(String, Result<HttpResponse, TransportError>)>>,
    fallback: Responder,
    seen: Mutex<Vec<Seen>>,
    gate: Mutex<Option<Arc<Notify>>>,
    /// Yield once before answering `/auth/refresh`
    pub slow_refresh: bool,
}

impl FakeHttp {
    /// Unscripted requests get 200 with an empty delta body
    pub fn new() -> Self {
        Self::with_fallback(|request, _| Ok(default_response(request)))
    }

    pub fn with_fallback<F>(fallback: F) -> Self
    where
        F: Fn(&HttpRequest, Option<&str>) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            seen: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            slow_refresh: false,
        }
    }

    /// Answer the next request whose path starts with `prefix`
    pub fn enqueue(&self, prefix: &str, response: Result<HttpResponse, TransportError>) {
        self.queued
            .lock()
            .unwrap()
            .push_back((prefix.to_string(), response));
    }

    pub fn respond(&self, prefix: &str, status: u16, body: &str) {
        self.enqueue(prefix, Ok(HttpResponse::new(status, body)));
    }

    /// Make the next request wait until the returned handle is notified
    pub fn hold_next_request(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.seen()
            .iter()
            .filter(|s| s.path.starts_with(prefix))
            .count()
    }
}

pub fn default_response(request: &HttpRequest) -> HttpResponse {
    if request.path.starts_with("/sync") {
        HttpResponse::new(
            200,
            r#"{"tasks":[],"spaces":[],"repetitiveTaskTemplates":[],"latestChangeId":0}"#,
        )
    } else {
        HttpResponse::new(200, "{}")
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn execute(
        &self,
        request: &HttpRequest,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(Seen {
            method: request.method,
            path: request.path.clone(),
            query: request.query.clone(),
            bearer: bearer.map(str::to_string),
            body: request.body.clone(),
            retried: request.retried,
        });

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.slow_refresh && request.path == "/auth/refresh" {
            tokio::task::yield_now().await;
        }

        let scripted = {
            let mut queued = self.queued.lock().unwrap();
            let position = queued
                .iter()
                .position(|(prefix, _)| request.path.starts_with(prefix.as_str()));
            position.and_then(|i| queued.remove(i))
        };
        match scripted {
            Some((_, response)) => response,
            None => (self.fallback)(request, bearer),
        }
    }
}
