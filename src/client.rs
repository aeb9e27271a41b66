// Wires the session layer together from a Config

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;

use crate::auth::{CredentialStore, CsrfProvider, SessionRefresher};
use crate::callback::AuthCallback;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::ApiGateway;
use crate::navigation::{HostBridge, NavigateOptions, Navigator};
use crate::onboarding::{DepartmentCompletion, OnboardingGate};
use crate::runtime::{self, Runtime};
use crate::session::SessionTerminator;
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};
use crate::transport::{ReqwestTransport, Transport};

/// Storage backends: one that survives restarts, one scoped to this session
pub struct SessionStores {
    pub persistent: Arc<dyn KeyValueStore>,
    pub session: Arc<dyn KeyValueStore>,
}

impl SessionStores {
    pub fn in_memory() -> Self {
        Self {
            persistent: Arc::new(MemoryStore::new()),
            session: Arc::new(MemoryStore::new()),
        }
    }
}

pub struct SessionClient {
    runtime: Runtime,
    config: Config,
    navigator: Arc<dyn Navigator>,
    credentials: Arc<CredentialStore>,
    csrf: Arc<CsrfProvider>,
    refresher: Arc<SessionRefresher>,
    terminator: Arc<SessionTerminator>,
    gateway: Arc<ApiGateway>,
    gate: OnboardingGate,
}

impl SessionClient {
    /// Production wiring: detected runtime, reqwest transport, SQLite credentials
    pub fn connect(
        config: &Config,
        navigator: Arc<dyn Navigator>,
        host: Option<Arc<dyn HostBridge>>,
    ) -> Result<Self> {
        let runtime = runtime::detect_once(&config.environment_signals());
        let transport = Arc::new(ReqwestTransport::new(
            &config.api_base_url,
            &config.transport_settings(),
        )?);
        let persistent = SqliteStore::open(&config.credentials_db_file).with_context(|| {
            format!(
                "Failed to open credentials database {}",
                config.credentials_db_file.display()
            )
        })?;
        let stores = SessionStores {
            persistent: Arc::new(persistent),
            session: Arc::new(MemoryStore::new()),
        };

        Self::new(config, runtime, transport, stores, navigator, host)
    }

    pub fn new(
        config: &Config,
        runtime: Runtime,
        transport: Arc<dyn Transport>,
        stores: SessionStores,
        navigator: Arc<dyn Navigator>,
        host: Option<Arc<dyn HostBridge>>,
    ) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::new(runtime, stores.persistent)?);
        let csrf = Arc::new(CsrfProvider::new(transport.clone(), config.csrf_settings()));
        let terminator = Arc::new(SessionTerminator::new(
            runtime,
            credentials.clone(),
            navigator.clone(),
            host,
            config.login_path.clone(),
        ));
        let refresher = Arc::new(SessionRefresher::new(
            runtime,
            transport.clone(),
            credentials.clone(),
            terminator.clone(),
            config.refresh_endpoint.clone(),
        ));
        let gateway = Arc::new(ApiGateway::new(
            runtime,
            transport,
            credentials.clone(),
            csrf.clone(),
            refresher.clone(),
            navigator.clone(),
            config.gateway_settings(),
        ));
        let gate = OnboardingGate::new(navigator.clone(), stores.session, config.gate_settings())
            .with_completion_check(Arc::new(DepartmentCompletion::new(
                gateway.clone(),
                config.departments_endpoint.clone(),
            )));

        tracing::info!(runtime = %runtime, base_url = %config.api_base_url, "Session client ready");

        Ok(Self {
            runtime,
            config: config.clone(),
            navigator,
            credentials,
            csrf,
            refresher,
            terminator,
            gateway,
            gate,
        })
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.gateway
    }

    pub fn gate(&self) -> &OnboardingGate {
        &self.gate
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

    pub fn terminator(&self) -> &Arc<SessionTerminator> {
        &self.terminator
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }

    /// Finish a sign-in from the landing location
    ///
    /// Stores the tokens (Embedded), arms the one-shot onboarding flag for new
    /// accounts, and replaces the landing entry with the onboarding or home
    /// route. Returns the route navigated to.
    pub fn complete_sign_in(&self, callback: &AuthCallback) -> Result<String> {
        if self.runtime.is_embedded() {
            let access = match &callback.access_token {
                Some(token) => token,
                None => {
                    tracing::warn!("Sign-in callback carried no access token");
                    self.navigator
                        .navigate(&self.config.login_path, NavigateOptions::replace());
                    return Err(GatewayError::Internal(anyhow::anyhow!(
                        "Sign-in callback carried no access token"
                    )));
                }
            };
            self.credentials
                .set(access, callback.refresh_token.as_deref())?;
        } else if callback.has_tokens() {
            tracing::debug!("Ignoring callback tokens, Web session lives in cookies");
        }

        let target = if callback.sign_up {
            self.gate.set_session_flag()?;
            self.navigator.navigate(
                &self.config.onboarding_path,
                NavigateOptions::replace().with_state(json!({ "signUp": true })),
            );
            self.config.onboarding_path.clone()
        } else {
            self.navigator
                .navigate(&self.config.home_path, NavigateOptions::replace());
            self.config.home_path.clone()
        };

        tracing::info!(sign_up = callback.sign_up, target = %target, "Sign-in completed");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{HistoryNavigator, Location};
    use crate::testing::{json_response, ScriptedTransport};
    use reqwest::Method;

    fn client(runtime: Runtime, start: &str) -> (SessionClient, Arc<HistoryNavigator>, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new(|req| match req.path.as_str() {
            "/user/departments" => Ok(json_response(200, json!({ "status": "success", "data": [] }))),
            _ => Ok(json_response(200, json!({ "status": "success" }))),
        })
        .into_arc();
        let nav = Arc::new(HistoryNavigator::at(start));
        let client = SessionClient::new(
            &Config::with_base_url("http://localhost"),
            runtime,
            transport.clone(),
            SessionStores::in_memory(),
            nav.clone(),
            None,
        )
        .unwrap();
        (client, nav, transport)
    }

    #[test]
    fn test_embedded_sign_up_stores_tokens_and_arms_flag() {
        let (client, nav, _) = client(Runtime::Embedded, "/oauth/callback");
        let callback = AuthCallback::from_location(&Location::parse(
            "/oauth/callback?accessToken=a1&refreshToken=r1&signUp=true",
        ));

        let target = client.complete_sign_in(&callback).unwrap();
        assert_eq!(target, "/select-department");

        let creds = client.credentials().get().unwrap().unwrap();
        assert_eq!(creds.access_token, "a1");
        assert_eq!(creds.refresh_token.as_deref(), Some("r1"));
        assert!(client.gate().has_session_flag().unwrap());

        let current = nav.current_location();
        assert_eq!(current.pathname, "/select-department");
        assert!(current.state_flag("signUp"));
        assert_eq!(nav.depth(), 1);
    }

    #[test]
    fn test_embedded_sign_in_without_token_goes_to_login() {
        let (client, nav, _) = client(Runtime::Embedded, "/oauth/callback");
        let callback = AuthCallback::from_location(&Location::parse("/oauth/callback?signUp=false"));

        assert!(client.complete_sign_in(&callback).is_err());
        assert_eq!(nav.current_location().pathname, "/login");
    }

    #[test]
    fn test_web_sign_in_goes_home() {
        let (client, nav, _) = client(Runtime::Web, "/oauth/callback?signUp=false");
        let callback = AuthCallback::from_location(&nav.current_location());

        assert_eq!(client.complete_sign_in(&callback).unwrap(), "/notice");
        assert_eq!(nav.current_location().pathname, "/notice");
        assert!(!client.gate().has_session_flag().unwrap());
    }

    #[tokio::test]
    async fn test_gate_uses_department_completion() {
        let (client, nav, transport) = client(Runtime::Embedded, "/notice");
        client.credentials().set("a1", Some("r1")).unwrap();

        // No departments registered yet
        let decision = client.gate().guard().await.unwrap();
        assert!(decision.redirect);
        assert_eq!(decision.completion, Some(false));
        assert_eq!(nav.current_location().pathname, "/select-department");
        assert_eq!(transport.count(Method::GET, "/user/departments"), 1);
    }
}
