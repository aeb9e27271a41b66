use reqwest::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{CredentialStore, CsrfProvider, SessionRefresher};
use crate::error::{GatewayError, Result};
use crate::navigation::{NavigateOptions, Navigator};
use crate::runtime::Runtime;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Paths and routes the gateway needs to know about
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Requests to these path prefixes never trigger a session refresh
    pub auth_endpoints: Vec<String>,
    pub logout_endpoint: String,
    pub login_path: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auth_endpoints: vec![
                "/auth/login".to_string(),
                "/auth/refresh".to_string(),
                "/auth/logout".to_string(),
                "/auth/csrf".to_string(),
                "/oauth2/".to_string(),
            ],
            logout_endpoint: "/auth/logout".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

/// How a non-2xx response is handled
#[derive(Debug, Clone, Copy, PartialEq)]
enum Failure {
    /// Refresh the session and replay once
    AuthExpired,
    /// Re-bootstrap the CSRF token and replay once
    CsrfRejected,
    /// Pass through to the caller
    Other,
}

/// The API's standard response envelope
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Request/response pipeline every outbound call goes through
///
/// Decorates requests with the runtime's credentials, recovers from expired
/// sessions with one shared refresh and a single replay, and recovers from a
/// stale CSRF token with one re-bootstrap and a single replay.
pub struct ApiGateway {
    runtime: Runtime,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    csrf: Arc<CsrfProvider>,
    refresher: Arc<SessionRefresher>,
    navigator: Arc<dyn Navigator>,
    settings: GatewaySettings,
}

impl ApiGateway {
    pub fn new(
        runtime: Runtime,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        csrf: Arc<CsrfProvider>,
        refresher: Arc<SessionRefresher>,
        navigator: Arc<dyn Navigator>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            runtime,
            transport,
            credentials,
            csrf,
            refresher,
            navigator,
            settings,
        }
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn csrf(&self) -> &Arc<CsrfProvider> {
        &self.csrf
    }

    pub fn refresher(&self) -> &Arc<SessionRefresher> {
        &self.refresher
    }

    /// Send a request through the pipeline
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let mut request = request;

        loop {
            let epoch = self.refresher.epoch();
            let outbound = self.decorate(&request).await?;

            tracing::debug!(
                request_id = %request_id,
                method = %request.method,
                path = %request.path,
                auth_retried = request.auth_retried,
                csrf_retried = request.csrf_retried,
                "Sending request"
            );

            let response = match self.transport.send(&outbound).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error_kind = e.kind,
                        error = %e,
                        path = %request.path,
                        "Request failed without a response"
                    );
                    return Err(GatewayError::Transport(e.to_string()));
                }
            };

            let status = response.status;
            if status.is_success() {
                tracing::debug!(request_id = %request_id, status = %status, "Request successful");
                return Ok(response);
            }

            match self.classify(&request, &response) {
                Failure::AuthExpired => {
                    tracing::warn!(
                        request_id = %request_id,
                        status = %status,
                        path = %request.path,
                        "Authentication expired, refreshing session and replaying"
                    );
                    request.auth_retried = true;

                    if let Err(cause) = self.refresher.refresh_after(epoch).await {
                        return Err(GatewayError::SessionTerminated {
                            status: status.as_u16(),
                            cause,
                        });
                    }
                }
                Failure::CsrfRejected if !request.csrf_retried => {
                    tracing::warn!(
                        request_id = %request_id,
                        path = %request.path,
                        "CSRF token rejected, re-bootstrapping and replaying"
                    );
                    request.csrf_retried = true;
                    self.csrf.invalidate().await;
                }
                Failure::CsrfRejected => {
                    tracing::error!(
                        request_id = %request_id,
                        path = %request.path,
                        "CSRF token rejected again after re-bootstrap"
                    );
                    return Err(GatewayError::CsrfRejected {
                        status: status.as_u16(),
                        message: response.text(),
                    });
                }
                Failure::Other => {
                    tracing::debug!(
                        request_id = %request_id,
                        status = status.as_u16(),
                        path = %request.path,
                        "Passing error response through"
                    );
                    return Err(GatewayError::Api {
                        status: status.as_u16(),
                        message: response.text(),
                    });
                }
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::post(path)).await
    }

    pub async fn put(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::put(path)).await
    }

    pub async fn patch(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::patch(path)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::delete(path)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn patch_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.send_json(Method::PATCH, path, body).await
    }

    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse> {
        let request = ApiRequest::new(method, path).json(body)?;
        self.request(request).await
    }

    /// GET and deserialize the whole body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        Ok(response.json()?)
    }

    /// GET an enveloped endpoint and unwrap `data`
    ///
    /// A 2xx response whose envelope status is not `success` is reported as an
    /// API error with the envelope's message.
    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        let envelope: ApiEnvelope<T> = response.json()?;

        if envelope.status != "success" {
            return Err(GatewayError::Api {
                status: envelope.code.unwrap_or(response.status.as_u16()),
                message: envelope
                    .message
                    .unwrap_or_else(|| format!("{} returned status {}", path, envelope.status)),
            });
        }

        envelope.data.ok_or_else(|| GatewayError::Api {
            status: response.status.as_u16(),
            message: format!("{} returned no data", path),
        })
    }

    /// Sign out: tell the server, drop local credentials, go to login
    ///
    /// The server call is best effort; local state is cleared either way.
    pub async fn logout(&self) -> Result<()> {
        let endpoint = self.settings.logout_endpoint.clone();
        if let Err(e) = self.post(&endpoint).await {
            tracing::warn!("Logout call failed, clearing local session anyway: {}", e);
        }

        self.credentials.clear()?;
        self.csrf.invalidate().await;
        self.navigator
            .navigate(&self.settings.login_path, NavigateOptions::replace());

        tracing::info!("Signed out");
        Ok(())
    }

    fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.settings
            .auth_endpoints
            .iter()
            .any(|endpoint| matches_endpoint(path, endpoint))
    }

    fn classify(&self, request: &ApiRequest, response: &ApiResponse) -> Failure {
        let status = response.status.as_u16();

        if matches!(status, 401 | 403)
            && !request.auth_retried
            && !self.is_auth_endpoint(&request.path)
        {
            return Failure::AuthExpired;
        }

        if status == 403
            && self.runtime == Runtime::Web
            && request.is_mutating()
            && looks_like_csrf_rejection(response)
        {
            return Failure::CsrfRejected;
        }

        Failure::Other
    }

    /// Build the outbound copy of `request` for this attempt
    ///
    /// Runs on every attempt so a replay picks up refreshed credentials.
    async fn decorate(&self, request: &ApiRequest) -> Result<ApiRequest> {
        let mut outbound = request.clone();

        if !outbound.headers.contains_key(ACCEPT) {
            outbound
                .headers
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        if outbound.is_mutating() && !outbound.headers.contains_key(CONTENT_TYPE) {
            outbound
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        match self.runtime {
            Runtime::Embedded => {
                if let Some(creds) = self.credentials.get()? {
                    let value = HeaderValue::from_str(&format!("Bearer {}", creds.access_token))
                        .map_err(|_| anyhow::anyhow!("Access token is not a valid header value"))?;
                    outbound.headers.insert(AUTHORIZATION, value);
                }
            }
            Runtime::Web => {
                if outbound.is_mutating() {
                    let token = self.csrf.ensure_token().await?;
                    let name = HeaderName::from_bytes(self.csrf.header_name().as_bytes())
                        .map_err(|_| {
                            GatewayError::Config(format!(
                                "Invalid CSRF header name: {}",
                                self.csrf.header_name()
                            ))
                        })?;
                    let value = HeaderValue::from_str(&token)
                        .map_err(|_| anyhow::anyhow!("CSRF token is not a valid header value"))?;
                    outbound.headers.insert(name, value);
                }
            }
        }

        Ok(outbound)
    }
}

/// Segment-boundary match; an endpoint ending in `/` covers its whole subtree
fn matches_endpoint(path: &str, endpoint: &str) -> bool {
    if endpoint.ends_with('/') {
        return path.starts_with(endpoint);
    }
    match path.strip_prefix(endpoint) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A 403 whose body names the CSRF check
fn looks_like_csrf_rejection(response: &ApiResponse) -> bool {
    let body = response.text().to_lowercase();
    body.contains("csrf") || body.contains("xsrf")
}
