// Session refresh with an at-most-one-in-flight guarantee

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::credentials::CredentialStore;
use super::types::{RefreshRequest, RefreshResponse};
use crate::error::RefreshError;
use crate::runtime::Runtime;
use crate::session::SessionTerminator;
use crate::transport::{ApiRequest, Transport};

type SharedRefresh = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

#[derive(Default)]
struct RefreshSlot {
    inflight: Option<SharedRefresh>,
    /// Outcome of the most recent settlement
    last: Option<Result<(), RefreshError>>,
}

/// Performs the renewal call
///
/// The first caller starts the network call and parks it in the lock; every
/// caller arriving while it is unsettled awaits the same shared future. The
/// lock is cleared at settlement so a later expiry starts a fresh refresh.
/// Failure runs the terminal session cleanup inside the shared future, so it
/// happens once no matter how many callers were waiting.
///
/// Each settlement bumps an epoch. A caller whose request went out before the
/// latest settlement gets that outcome from [`SessionRefresher::refresh_after`]
/// instead of starting another refresh.
pub struct SessionRefresher {
    runtime: Runtime,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    terminator: Arc<SessionTerminator>,
    endpoint: String,
    lock: Arc<Mutex<RefreshSlot>>,
    epoch: Arc<AtomicU64>,
    refreshes: Arc<AtomicUsize>,
}

impl SessionRefresher {
    pub fn new(
        runtime: Runtime,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        terminator: Arc<SessionTerminator>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            transport,
            credentials,
            terminator,
            endpoint: endpoint.into(),
            lock: Arc::new(Mutex::new(RefreshSlot::default())),
            epoch: Arc::new(AtomicU64::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of settled refreshes
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Renew the session, joining any refresh already in flight
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let inflight = {
            let mut slot = self.lock.lock().await;
            self.join_or_start(&mut slot)
        };

        inflight.await
    }

    /// Renew the session on behalf of a request sent at `observed` epoch
    ///
    /// If a refresh settled after the request went out, its outcome is
    /// returned without another network call.
    pub async fn refresh_after(&self, observed: u64) -> Result<(), RefreshError> {
        let inflight = {
            let mut slot = self.lock.lock().await;
            if slot.inflight.is_none() && self.epoch() > observed {
                if let Some(last) = &slot.last {
                    tracing::debug!("Session refreshed since request was sent, reusing outcome");
                    return last.clone();
                }
            }
            self.join_or_start(&mut slot)
        };

        inflight.await
    }

    fn join_or_start(&self, slot: &mut RefreshSlot) -> SharedRefresh {
        match &slot.inflight {
            Some(inflight) => {
                tracing::debug!("Joining in-flight session refresh");
                inflight.clone()
            }
            None => {
                let inflight = self.start().boxed().shared();
                slot.inflight = Some(inflight.clone());
                inflight
            }
        }
    }

    /// Whether a refresh is currently outstanding
    pub async fn is_refreshing(&self) -> bool {
        self.lock.lock().await.inflight.is_some()
    }

    /// Number of refresh network calls issued so far
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn start(&self) -> impl std::future::Future<Output = Result<(), RefreshError>> + Send + 'static {
        let runtime = self.runtime;
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        let terminator = self.terminator.clone();
        let endpoint = self.endpoint.clone();
        let lock = self.lock.clone();
        let epoch = self.epoch.clone();
        let refreshes = self.refreshes.clone();

        async move {
            tracing::info!(runtime = %runtime, "Refreshing session...");

            let result = match runtime {
                Runtime::Web => refresh_web(transport.as_ref(), &endpoint, &refreshes).await,
                Runtime::Embedded => {
                    refresh_embedded(transport.as_ref(), &credentials, &endpoint, &refreshes).await
                }
            };

            {
                let mut slot = lock.lock().await;
                slot.inflight = None;
                slot.last = Some(result.clone());
                epoch.fetch_add(1, Ordering::SeqCst);
            }

            match &result {
                Ok(()) => tracing::info!("Session refreshed"),
                Err(e) => {
                    tracing::error!("Session refresh failed: {}", e);
                    terminator.terminate(&e.to_string());
                }
            }

            result
        }
    }
}

/// Web: the server rotates the HTTP-only cookies, nothing to read back
async fn refresh_web(
    transport: &dyn Transport,
    endpoint: &str,
    refreshes: &AtomicUsize,
) -> Result<(), RefreshError> {
    let request = ApiRequest::post(endpoint).header("Accept", "application/json");

    refreshes.fetch_add(1, Ordering::SeqCst);
    let response = transport
        .send(&request)
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.status.is_success() {
        return Err(RefreshError::Rejected {
            status: response.status.as_u16(),
            message: response.text(),
        });
    }

    Ok(())
}

/// Embedded: exchange the refresh token for a new pair and persist it
async fn refresh_embedded(
    transport: &dyn Transport,
    credentials: &CredentialStore,
    endpoint: &str,
    refreshes: &AtomicUsize,
) -> Result<(), RefreshError> {
    let current = credentials
        .get()
        .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;
    let previous_refresh = current
        .and_then(|c| c.refresh_token)
        .ok_or(RefreshError::MissingRefreshToken)?;

    let request = ApiRequest::post(endpoint)
        .header("Accept", "application/json")
        .json(&RefreshRequest {
            refresh_token: &previous_refresh,
        })
        .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;

    refreshes.fetch_add(1, Ordering::SeqCst);
    let response = transport
        .send(&request)
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status;
    if !status.is_success() {
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: response.text(),
        });
    }

    let tokens = response
        .json::<RefreshResponse>()
        .map(RefreshResponse::into_tokens)
        .unwrap_or_default();
    let access_token = tokens
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or(RefreshError::MissingAccessToken)?;

    // Servers that do not rotate the refresh token omit it
    let refresh_token = tokens
        .refresh_token
        .filter(|t| !t.is_empty())
        .unwrap_or(previous_refresh);

    credentials
        .set(&access_token, Some(&refresh_token))
        .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{HistoryNavigator, Navigator};
    use crate::storage::MemoryStore;
    use crate::testing::{json_response, ScriptedTransport};
    use crate::transport::TransportError;
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        refresher: Arc<SessionRefresher>,
        credentials: Arc<CredentialStore>,
        terminator: Arc<SessionTerminator>,
        navigator: Arc<HistoryNavigator>,
    }

    fn fixture(runtime: Runtime, transport: Arc<ScriptedTransport>) -> Fixture {
        let credentials =
            Arc::new(CredentialStore::new(runtime, Arc::new(MemoryStore::new())).unwrap());
        let navigator = Arc::new(HistoryNavigator::at("/notice"));
        let terminator = Arc::new(SessionTerminator::new(
            runtime,
            credentials.clone(),
            navigator.clone(),
            None,
            "/login",
        ));
        let refresher = Arc::new(SessionRefresher::new(
            runtime,
            transport,
            credentials.clone(),
            terminator.clone(),
            "/auth/refresh",
        ));
        Fixture {
            refresher,
            credentials,
            terminator,
            navigator,
        }
    }

    #[tokio::test]
    async fn test_embedded_refresh_rotates_tokens() {
        let transport = ScriptedTransport::new(|req| {
            let body: serde_json::Value = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
            assert_eq!(body["refreshToken"], "r1");
            Ok(json_response(
                200,
                json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }),
            ))
        })
        .into_arc();
        let fx = fixture(Runtime::Embedded, transport.clone());
        fx.credentials.set("a1", Some("r1")).unwrap();

        fx.refresher.refresh().await.unwrap();

        let creds = fx.credentials.get().unwrap().unwrap();
        assert_eq!(creds.access_token, "a2");
        assert_eq!(creds.refresh_token.as_deref(), Some("r2"));
        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 1);
        assert!(!fx.refresher.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_embedded_refresh_keeps_previous_refresh_token() {
        let transport =
            ScriptedTransport::new(|_| Ok(json_response(200, json!({ "accessToken": "a2" }))))
                .into_arc();
        let fx = fixture(Runtime::Embedded, transport);
        fx.credentials.set("a1", Some("r1")).unwrap();

        fx.refresher.refresh().await.unwrap();

        let creds = fx.credentials.get().unwrap().unwrap();
        assert_eq!(creds.access_token, "a2");
        assert_eq!(creds.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_missing_access_token_terminates_session() {
        let transport =
            ScriptedTransport::new(|_| Ok(json_response(200, json!({ "status": "success" }))))
                .into_arc();
        let fx = fixture(Runtime::Embedded, transport);
        fx.credentials.set("a1", Some("r1")).unwrap();

        let err = fx.refresher.refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::MissingAccessToken);
        assert_eq!(fx.credentials.get().unwrap(), None);
        assert_eq!(fx.terminator.terminations(), 1);
        assert_eq!(fx.navigator.current_location().pathname, "/login");
    }

    #[tokio::test]
    async fn test_missing_refresh_token_skips_network() {
        let transport =
            ScriptedTransport::new(|_| Ok(json_response(200, json!({ "accessToken": "x" }))))
                .into_arc();
        let fx = fixture(Runtime::Embedded, transport.clone());

        let err = fx.refresher.refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::MissingRefreshToken);
        assert_eq!(transport.calls().len(), 0);
        assert_eq!(fx.refresher.refresh_count(), 0);
        assert_eq!(fx.terminator.terminations(), 1);
    }

    #[tokio::test]
    async fn test_web_refresh_only_checks_status() {
        let transport = ScriptedTransport::new(|_| Ok(json_response(204, json!(null)))).into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        fx.refresher.refresh().await.unwrap();
        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 1);
        assert_eq!(fx.terminator.terminations(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))))
            .with_delay("/auth/refresh", Duration::from_millis(40))
            .into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        let results = futures::future::join_all((0..12).map(|_| fx.refresher.refresh())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 1);
        assert_eq!(fx.refresher.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failure_terminates_once() {
        let transport = ScriptedTransport::new(|_| {
            Err(TransportError::new("connection_failed", "refused"))
        })
        .with_delay("/auth/refresh", Duration::from_millis(40))
        .into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        let results = futures::future::join_all((0..12).map(|_| fx.refresher.refresh())).await;

        let first = results[0].clone().unwrap_err();
        assert!(matches!(first, RefreshError::Transport(_)));
        assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &first));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(fx.terminator.terminations(), 1);
        assert_eq!(fx.navigator.records().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_cleared_after_settlement() {
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({})))).into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        fx.refresher.refresh().await.unwrap();
        fx.refresher.refresh().await.unwrap();

        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 2);
    }

    #[tokio::test]
    async fn test_refresh_after_reuses_newer_settlement() {
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({})))).into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        let observed = fx.refresher.epoch();
        fx.refresher.refresh().await.unwrap();
        assert_eq!(fx.refresher.epoch(), observed + 1);

        // A request sent before that refresh settled does not trigger another
        fx.refresher.refresh_after(observed).await.unwrap();
        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 1);

        // One sent afterwards does
        fx.refresher.refresh_after(fx.refresher.epoch()).await.unwrap();
        assert_eq!(transport.count(Method::POST, "/auth/refresh"), 2);
    }

    #[tokio::test]
    async fn test_refresh_after_reuses_failure_without_terminating_again() {
        let transport =
            ScriptedTransport::new(|_| Ok(json_response(401, json!({ "message": "expired" }))))
                .into_arc();
        let fx = fixture(Runtime::Web, transport.clone());

        let observed = fx.refresher.epoch();
        let first = fx.refresher.refresh().await.unwrap_err();
        let late = fx.refresher.refresh_after(observed).await.unwrap_err();

        assert_eq!(first, late);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(fx.terminator.terminations(), 1);
    }
}
