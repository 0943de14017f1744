//! Authenticated transport
//!
//! Wraps an [`HttpClient`] with bearer authentication and a single-flight
//! token refresh. When several requests hit an expired token at once, the
//! first one performs the refresh and the others wait for its result.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::auth::{AuthError, AuthTokens, TokenStore};
use super::http::{HttpClient, HttpRequest, HttpResponse, TransportError};
use super::signal::{SignalBus, SyncSignal};
use crate::storage::StorageResult;

const REFRESH_PATH: &str = "/auth/refresh";

type Waiter = oneshot::Sender<Result<String, AuthError>>;

enum RefreshState {
    Idle,
    InFlight(Vec<Waiter>),
}

pub struct AuthenticatedTransport {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn TokenStore>,
    current: RwLock<Option<AuthTokens>>,
    refresh: Mutex<RefreshState>,
    signals: SignalBus,
}

impl AuthenticatedTransport {
    /// Create a transport seeded with whatever pair `store` holds
    pub fn new(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn TokenStore>,
        signals: SignalBus,
    ) -> StorageResult<Self> {
        let current = store.load()?;
        Ok(Self {
            http,
            store,
            current: RwLock::new(current),
            refresh: Mutex::new(RefreshState::Idle),
            signals,
        })
    }

    /// Replace the token pair and persist it
    pub async fn set_tokens(&self, tokens: AuthTokens) -> StorageResult<()> {
        self.store.save(&tokens)?;
        *self.current.write().await = Some(tokens);
        Ok(())
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|t| t.access_token.clone())
    }

    /// Send a request, refreshing the token and replaying once on 401
    ///
    /// A 401 that survives the refresh (or a failed refresh) is returned
    /// as the response so callers can classify it like any other status.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let token = self.access_token().await;
        let response = self.http.execute(&request, token.as_deref()).await?;
        if !response.is_unauthorized() || request.retried {
            return Ok(response);
        }

        debug!(path = %request.path, "Access token rejected");
        match self.refreshed_token(token.as_deref()).await {
            Ok(fresh) => {
                let retry = request.into_retry();
                self.http.execute(&retry, Some(&fresh)).await
            }
            Err(error) => {
                warn!(path = %request.path, %error, "Token refresh failed");
                Ok(response)
            }
        }
    }

    /// A token newer than `stale`, refreshing at most once across callers
    async fn refreshed_token(&self, stale: Option<&str>) -> Result<String, AuthError> {
        if let Some(current) = self.current.read().await.as_ref() {
            if Some(current.access_token.as_str()) != stale {
                return Ok(current.access_token.clone());
            }
        }

        let waiter = {
            let mut state = self.refresh.lock().await;
            match &mut *state {
                RefreshState::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::InFlight(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(AuthError::Abandoned));
        }

        let result = self.perform_refresh().await;

        let waiters = {
            let mut state = self.refresh.lock().await;
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::InFlight(waiters) => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };
        if result.is_err() {
            self.signals.emit(SyncSignal::AuthenticationFailed);
        }
        debug!(waiters = waiters.len(), ok = result.is_ok(), "Broadcasting refresh result");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn perform_refresh(&self) -> Result<String, AuthError> {
        let pair = self
            .current
            .read()
            .await
            .clone()
            .ok_or(AuthError::MissingRefreshToken)?;

        let request = HttpRequest::post(
            REFRESH_PATH,
            json!({
                "accessToken": pair.access_token,
                "refreshToken": pair.refresh_token,
            }),
        );
        let response = self
            .http
            .execute(&request, None)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status,
            });
        }
        let fresh: AuthTokens = response
            .json()
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if let Err(error) = self.store.save(&fresh) {
            warn!(%error, "Could not persist refreshed tokens");
        }
        let access = fresh.access_token.clone();
        *self.current.write().await = Some(fresh);
        info!("Access token refreshed");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::auth::MemoryTokenStore;
    use crate::sync::fake::FakeHttp;

    fn pair(access: &str, refresh: &str) -> AuthTokens {
        AuthTokens {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
        }
    }

    /// 401 for anything but the "new" token; refresh yields the new pair
    fn expiring_server() -> FakeHttp {
        let mut http = FakeHttp::with_fallback(|request, bearer| {
            if request.path == REFRESH_PATH {
                return Ok(HttpResponse::new(
                    200,
                    r#"{"accessToken":"new","refreshToken":"r2"}"#,
                ));
            }
            match bearer {
                Some("new") => Ok(HttpResponse::new(200, "{}")),
                _ => Ok(HttpResponse::new(401, "")),
            }
        });
        http.slow_refresh = true;
        http
    }

    fn transport(http: Arc<FakeHttp>, store: Arc<MemoryTokenStore>) -> AuthenticatedTransport {
        AuthenticatedTransport::new(http, store, SignalBus::disconnected()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_is_sent_as_bearer() {
        let http = Arc::new(expiring_server());
        let store = Arc::new(MemoryTokenStore::new(Some(pair("new", "r2"))));
        let transport = transport(http.clone(), store);

        let response = transport.send(HttpRequest::get("/tasks")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(http.count(REFRESH_PATH), 0);
        assert_eq!(http.seen()[0].bearer.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let http = Arc::new(expiring_server());
        let store = Arc::new(MemoryTokenStore::new(Some(pair("old", "r1"))));
        let transport = transport(http.clone(), store.clone());

        let (a, b, c) = tokio::join!(
            transport.send(HttpRequest::get("/tasks/a")),
            transport.send(HttpRequest::get("/tasks/b")),
            transport.send(HttpRequest::get("/tasks/c")),
        );
        for response in [a, b, c] {
            assert_eq!(response.unwrap().status, 200);
        }

        let seen = http.seen();
        assert_eq!(http.count(REFRESH_PATH), 1);
        let refresh = seen.iter().find(|s| s.path == REFRESH_PATH).unwrap();
        assert_eq!(
            refresh.body.as_ref().unwrap(),
            &json!({"accessToken": "old", "refreshToken": "r1"})
        );

        let retries: Vec<_> = seen.iter().filter(|s| s.retried).collect();
        assert_eq!(retries.len(), 3);
        assert!(retries.iter().all(|s| s.bearer.as_deref() == Some("new")));

        assert_eq!(store.load().unwrap(), Some(pair("new", "r2")));
        assert_eq!(transport.access_token().await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_retried_request_is_not_retried_again() {
        // Refresh succeeds but the server keeps rejecting
        let http = Arc::new(FakeHttp::with_fallback(|request, _| {
            if request.path == REFRESH_PATH {
                Ok(HttpResponse::new(
                    200,
                    r#"{"accessToken":"new","refreshToken":"r2"}"#,
                ))
            } else {
                Ok(HttpResponse::new(401, ""))
            }
        }));
        let store = Arc::new(MemoryTokenStore::new(Some(pair("old", "r1"))));
        let transport = transport(http.clone(), store);

        let response = transport.send(HttpRequest::get("/tasks")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(http.count("/tasks"), 2);
        assert_eq!(http.count(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_emits_authentication_failed() {
        let http = Arc::new(FakeHttp::with_fallback(|request, _| {
            if request.path == REFRESH_PATH {
                Ok(HttpResponse::new(403, ""))
            } else {
                Ok(HttpResponse::new(401, ""))
            }
        }));
        let store = Arc::new(MemoryTokenStore::new(Some(pair("old", "r1"))));
        let (signals, mut rx) = SignalBus::channel();
        let transport = AuthenticatedTransport::new(http.clone(), store.clone(), signals).unwrap();

        let response = transport.send(HttpRequest::get("/tasks")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(rx.try_recv().unwrap(), SyncSignal::AuthenticationFailed);
        assert_eq!(store.load().unwrap(), Some(pair("old", "r1")));
        assert!(http.seen().iter().all(|s| !s.retried));
    }

    #[tokio::test]
    async fn test_missing_tokens_fail_refresh_without_request() {
        let http = Arc::new(FakeHttp::with_fallback(|_, _| Ok(HttpResponse::new(401, ""))));
        let transport = transport(http.clone(), Arc::new(MemoryTokenStore::default()));

        let response = transport.send(HttpRequest::get("/sync")).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(http.count(REFRESH_PATH), 0);
        assert!(http.seen()[0].bearer.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_is_passed_through() {
        let http = Arc::new(FakeHttp::with_fallback(|_, _| Err(TransportError::Timeout)));
        let store = Arc::new(MemoryTokenStore::new(Some(pair("a", "r"))));
        let transport = transport(http, store);

        let result = transport.send(HttpRequest::get("/sync")).await;
        assert_eq!(result.unwrap_err(), TransportError::Timeout);
    }

    #[tokio::test]
    async fn test_set_tokens_persists() {
        let http = Arc::new(FakeHttp::new());
        let store = Arc::new(MemoryTokenStore::default());
        let transport = transport(http, store.clone());

        transport.set_tokens(pair("a", "r")).await.unwrap();
        assert_eq!(store.load().unwrap(), Some(pair("a", "r")));
        assert_eq!(transport.access_token().await.as_deref(), Some("a"));
    }
}
