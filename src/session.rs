// Terminal session cleanup
// Runs once per failed refresh: drop credentials, tell the host shell, go to login

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::auth::CredentialStore;
use crate::navigation::{HostBridge, NavigateOptions, Navigator};
use crate::runtime::Runtime;

pub struct SessionTerminator {
    runtime: Runtime,
    credentials: Arc<CredentialStore>,
    navigator: Arc<dyn Navigator>,
    host: Option<Arc<dyn HostBridge>>,
    login_path: String,
    terminations: AtomicUsize,
}

impl SessionTerminator {
    pub fn new(
        runtime: Runtime,
        credentials: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
        host: Option<Arc<dyn HostBridge>>,
        login_path: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            credentials,
            navigator,
            host,
            login_path: login_path.into(),
            terminations: AtomicUsize::new(0),
        }
    }

    /// End the session
    ///
    /// The redirect is skipped when the navigator is already on the login
    /// route, so repeated terminations never stack history entries.
    pub fn terminate(&self, reason: &str) {
        let count = self.terminations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(reason = reason, count = count, "Session terminated");

        if let Err(e) = self.credentials.clear() {
            tracing::error!("Failed to clear credentials on termination: {:#}", e);
        }

        if self.runtime.is_embedded() {
            if let Some(host) = &self.host {
                host.session_ended(reason);
            }
        }

        if self.navigator.current_location().pathname != self.login_path {
            self.navigator
                .navigate(&self.login_path, NavigateOptions::replace());
        }
    }

    /// How many times the session has been terminated
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.navigator
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }
}
