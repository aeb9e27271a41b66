// Anti-CSRF token provider for the Web runtime

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::CsrfError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

type SharedBootstrap = Shared<BoxFuture<'static, Result<String, CsrfError>>>;

/// Where the token comes from and where it goes
#[derive(Debug, Clone)]
pub struct CsrfSettings {
    /// Bootstrap endpoint, relative to the base URL
    pub endpoint: String,
    /// Header read from the bootstrap response and sent on mutating requests
    pub header_name: String,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            endpoint: "/auth/csrf".to_string(),
            header_name: "X-CSRF-TOKEN".to_string(),
        }
    }
}

#[derive(Default)]
struct CsrfState {
    token: Option<String>,
    inflight: Option<SharedBootstrap>,
}

/// Fetches and caches the per-session CSRF token
///
/// Concurrent callers arriving before the first bootstrap completes share the
/// one in-flight call.
pub struct CsrfProvider {
    transport: Arc<dyn Transport>,
    settings: CsrfSettings,
    state: Arc<Mutex<CsrfState>>,
    bootstraps: Arc<AtomicUsize>,
}

impl CsrfProvider {
    pub fn new(transport: Arc<dyn Transport>, settings: CsrfSettings) -> Self {
        Self {
            transport,
            settings,
            state: Arc::new(Mutex::new(CsrfState::default())),
            bootstraps: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.settings.header_name
    }

    /// Cached token, or the result of the (shared) bootstrap call
    pub async fn ensure_token(&self) -> Result<String, CsrfError> {
        let bootstrap = {
            let mut state = self.state.lock().await;
            if let Some(token) = &state.token {
                return Ok(token.clone());
            }
            match &state.inflight {
                Some(inflight) => {
                    tracing::debug!("Joining in-flight CSRF bootstrap");
                    inflight.clone()
                }
                None => {
                    let inflight = self.bootstrap().boxed().shared();
                    state.inflight = Some(inflight.clone());
                    inflight
                }
            }
        };

        bootstrap.await
    }

    /// Drop the cached token so the next call re-bootstraps
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.token.take().is_some() {
            tracing::info!("CSRF token invalidated");
        }
    }

    pub async fn cached(&self) -> Option<String> {
        self.state.lock().await.token.clone()
    }

    /// Seed the cache, e.g. with a token delivered alongside the page
    pub async fn prime(&self, token: impl Into<String>) {
        self.state.lock().await.token = Some(token.into());
    }

    /// Number of bootstrap network calls issued so far
    pub fn bootstrap_count(&self) -> usize {
        self.bootstraps.load(Ordering::SeqCst)
    }

    fn bootstrap(&self) -> impl std::future::Future<Output = Result<String, CsrfError>> + Send + 'static {
        let transport = self.transport.clone();
        let settings = self.settings.clone();
        let state = self.state.clone();
        let bootstraps = self.bootstraps.clone();

        async move {
            bootstraps.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(endpoint = %settings.endpoint, "Bootstrapping CSRF token");

            let request = ApiRequest::get(settings.endpoint.clone())
                .header("Accept", "application/json");
            let result = match transport.send(&request).await {
                Ok(response) if response.status.is_success() => {
                    extract_token(&response, &settings.header_name).ok_or(CsrfError::MissingToken)
                }
                Ok(response) => Err(CsrfError::Rejected {
                    status: response.status.as_u16(),
                    message: response.text(),
                }),
                Err(e) => Err(CsrfError::Transport(e.to_string())),
            };

            let mut guard = state.lock().await;
            guard.inflight = None;
            match &result {
                Ok(token) => {
                    guard.token = Some(token.clone());
                    tracing::info!("CSRF token bootstrapped");
                }
                Err(e) => tracing::error!("CSRF bootstrap failed: {}", e),
            }

            result
        }
    }
}

/// Header first, then the body fields the API is known to use
fn extract_token(response: &ApiResponse, header_name: &str) -> Option<String> {
    if let Some(token) = response.header_str(header_name).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    let body: serde_json::Value = serde_json::from_slice(&response.body).ok()?;
    let candidates = [
        body.get("csrfToken"),
        body.get("token"),
        body.get("data").and_then(|d| d.get("csrfToken")),
        body.get("data").and_then(|d| d.get("token")),
    ];
    let token = candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .find(|t| !t.is_empty())
        .map(str::to_string);
    token
}
