//! Post-authentication onboarding gate.
//!
//! Evaluated on every route change. Three client-side signals say "this user
//! just signed up": an explicit query flag, a flag on the navigation state, and
//! a one-shot flag in session storage (set when the sign-up bounced through an
//! external redirect that could not carry navigation state). Any of them
//! routes the user to the onboarding screen instead of the requested one.
//!
//! The optional [`CompletionCheck`] asks the API whether onboarding is already
//! done and overrides the client-side signals when it answers.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;

use crate::error::Result;
use crate::gateway::ApiGateway;
use crate::navigation::{Location, NavigateOptions, Navigator};
use crate::storage::{KeyValueStore, ScopedStore};

/// Namespace of the session-scoped flag store
pub const FLAGS_NAMESPACE: &str = "session.flags:";

#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Route of the onboarding screen
    pub onboarding_path: String,
    /// Query keys that carry the sign-up flag (case-sensitive)
    pub query_keys: Vec<String>,
    /// Navigation state field that carries the sign-up flag
    pub state_key: String,
    /// Session storage key of the one-shot flag
    pub flag_key: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            onboarding_path: "/select-department".to_string(),
            query_keys: vec!["signUp".to_string(), "signup".to_string()],
            state_key: "signUp".to_string(),
            flag_key: "justSignedUp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Render the requested route
    Gated,
    /// Navigate to onboarding
    Redirecting,
}

/// Client-side signal sources, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Query,
    NavigationState,
    SessionFlag,
}

const SIGNAL_ORDER: [SignalSource; 3] = [
    SignalSource::Query,
    SignalSource::NavigationState,
    SignalSource::SessionFlag,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnboardingSignals {
    pub from_query: bool,
    pub from_navigation_state: bool,
    pub from_session_flag: bool,
}

impl OnboardingSignals {
    pub fn any(&self) -> bool {
        self.from_query || self.from_navigation_state || self.from_session_flag
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub state: GateState,
    pub redirect: bool,
    /// Where the user ends up: the onboarding route or the requested location
    pub target: String,
    pub signals: OnboardingSignals,
    /// Answer of the completion check, when one ran
    pub completion: Option<bool>,
}

/// Authoritative "has the user finished onboarding" source
pub trait CompletionCheck: Send + Sync {
    fn is_complete(&self) -> BoxFuture<'_, Result<bool>>;
}

/// Onboarding is complete once the user has registered a department
pub struct DepartmentCompletion {
    gateway: Arc<ApiGateway>,
    path: String,
}

impl DepartmentCompletion {
    pub fn new(gateway: Arc<ApiGateway>, path: impl Into<String>) -> Self {
        Self {
            gateway,
            path: path.into(),
        }
    }
}

impl CompletionCheck for DepartmentCompletion {
    fn is_complete(&self) -> BoxFuture<'_, Result<bool>> {
        async move {
            let departments: Vec<serde_json::Value> = self.gateway.get_data(&self.path).await?;
            Ok(!departments.is_empty())
        }
        .boxed()
    }
}

pub struct OnboardingGate {
    navigator: Arc<dyn Navigator>,
    flags: ScopedStore,
    settings: GateSettings,
    completion: Option<Arc<dyn CompletionCheck>>,
}

impl OnboardingGate {
    pub fn new(
        navigator: Arc<dyn Navigator>,
        session_store: Arc<dyn KeyValueStore>,
        settings: GateSettings,
    ) -> Self {
        Self {
            navigator,
            flags: ScopedStore::new(session_store, FLAGS_NAMESPACE),
            settings,
            completion: None,
        }
    }

    pub fn with_completion_check(mut self, check: Arc<dyn CompletionCheck>) -> Self {
        self.completion = Some(check);
        self
    }

    pub fn onboarding_path(&self) -> &str {
        &self.settings.onboarding_path
    }

    /// Arm the one-shot flag for the next gate pass
    pub fn set_session_flag(&self) -> Result<()> {
        self.flags.set(&self.settings.flag_key, "1")?;
        tracing::debug!("Onboarding session flag set");
        Ok(())
    }

    pub fn has_session_flag(&self) -> Result<bool> {
        Ok(self.flags.get(&self.settings.flag_key)?.as_deref() == Some("1"))
    }

    /// Read every signal source in order
    ///
    /// The session flag is read with `take`, so reading it as true and
    /// clearing it are one step; a true flag always ends up consumed by this
    /// pass, whichever branch the decision takes.
    fn read_signals(&self, location: &Location) -> Result<OnboardingSignals> {
        let mut signals = OnboardingSignals::default();

        for source in SIGNAL_ORDER {
            match source {
                SignalSource::Query => {
                    signals.from_query = self
                        .settings
                        .query_keys
                        .iter()
                        .any(|key| location.query_param(key).as_deref() == Some("true"));
                }
                SignalSource::NavigationState => {
                    signals.from_navigation_state = location.state_flag(&self.settings.state_key);
                }
                SignalSource::SessionFlag => {
                    signals.from_session_flag =
                        self.flags.take(&self.settings.flag_key)?.as_deref() == Some("1");
                    if signals.from_session_flag {
                        tracing::debug!("Consumed onboarding session flag");
                    }
                }
            }
        }

        Ok(signals)
    }

    fn pass(&self, location: &Location, signals: OnboardingSignals, completion: Option<bool>) -> GateDecision {
        GateDecision {
            state: GateState::Gated,
            redirect: false,
            target: location.href(),
            signals,
            completion,
        }
    }

    fn redirect(&self, signals: OnboardingSignals, completion: Option<bool>) -> GateDecision {
        GateDecision {
            state: GateState::Redirecting,
            redirect: true,
            target: self.settings.onboarding_path.clone(),
            signals,
            completion,
        }
    }

    /// Decide from the client-side signals only
    pub fn evaluate(&self, location: &Location) -> Result<GateDecision> {
        let signals = self.read_signals(location)?;

        let decision = if location.pathname == self.settings.onboarding_path {
            self.pass(location, signals, None)
        } else if signals.any() {
            self.redirect(signals, None)
        } else {
            self.pass(location, signals, None)
        };

        tracing::debug!(
            pathname = %location.pathname,
            by_query = signals.from_query,
            by_state = signals.from_navigation_state,
            by_session = signals.from_session_flag,
            redirect = decision.redirect,
            "Onboarding gate evaluated"
        );
        Ok(decision)
    }

    /// Decide with the completion check when one is configured
    ///
    /// Precedence: already on the onboarding route > completion check answer >
    /// client-side signals. A failing check falls back to the signals, except
    /// when the session ended during the check: the login redirect stands.
    pub async fn evaluate_with_completion(&self, location: &Location) -> Result<GateDecision> {
        let check = match &self.completion {
            Some(check) => check.clone(),
            None => return self.evaluate(location),
        };

        // Signals (and flag consumption) are settled before the first await
        let signals = self.read_signals(location)?;
        if location.pathname == self.settings.onboarding_path {
            return Ok(self.pass(location, signals, None));
        }

        let decision = match check.is_complete().await {
            Ok(true) => {
                if signals.any() {
                    tracing::info!("Ignoring stale sign-up signal, onboarding already complete");
                }
                self.pass(location, signals, Some(true))
            }
            Ok(false) => self.redirect(signals, Some(false)),
            Err(e) if e.is_session_terminated() => {
                tracing::info!("Session ended during completion check, leaving navigation to sign-in");
                self.pass(location, signals, None)
            }
            Err(e) => {
                tracing::warn!("Onboarding completion check failed, using client signals: {}", e);
                if signals.any() {
                    self.redirect(signals, None)
                } else {
                    self.pass(location, signals, None)
                }
            }
        };

        tracing::debug!(
            pathname = %location.pathname,
            completion = ?decision.completion,
            redirect = decision.redirect,
            "Onboarding gate evaluated"
        );
        Ok(decision)
    }

    /// Evaluate the current location and navigate if needed
    ///
    /// The redirect replaces the history entry and carries the originating
    /// location for a post-onboarding return.
    pub async fn guard(&self) -> Result<GateDecision> {
        let location = self.navigator.current_location();
        let decision = self.evaluate_with_completion(&location).await?;

        // The route may have moved while the check was in flight
        let current = self.navigator.current_location();
        if current.href() != location.href() {
            tracing::debug!(from = %location.href(), now = %current.href(), "Route changed during gate pass");
            return Ok(GateDecision {
                state: GateState::Gated,
                redirect: false,
                target: current.href(),
                ..decision
            });
        }

        if decision.redirect {
            tracing::info!(from = %location.href(), to = %decision.target, "Redirecting to onboarding");
            self.navigator.navigate(
                &decision.target,
                NavigateOptions::replace().with_state(json!({
                    (self.settings.state_key.clone()): true,
                    "from": location.href(),
                })),
            );
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::navigation::HistoryNavigator;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(start: &str) -> (OnboardingGate, Arc<HistoryNavigator>, Arc<MemoryStore>) {
        let nav = Arc::new(HistoryNavigator::at(start));
        let store = Arc::new(MemoryStore::new());
        let gate = OnboardingGate::new(nav.clone(), store.clone(), GateSettings::default());
        (gate, nav, store)
    }

    struct FixedCompletion {
        answer: Option<bool>,
        calls: AtomicUsize,
    }

    impl FixedCompletion {
        fn new(answer: Option<bool>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl CompletionCheck for FixedCompletion {
        fn is_complete(&self) -> BoxFuture<'_, Result<bool>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer;
            async move {
                answer.ok_or_else(|| GatewayError::Transport("unreachable".to_string()))
            }
            .boxed()
        }
    }

    #[test]
    fn test_no_signals_passes_through() {
        let (gate, _, _) = setup("/notice");
        let decision = gate.evaluate(&Location::parse("/notice?q=ai")).unwrap();
        assert_eq!(decision.state, GateState::Gated);
        assert!(!decision.redirect);
        assert_eq!(decision.target, "/notice?q=ai");
    }

    #[test]
    fn test_query_signal_is_case_sensitive() {
        let (gate, _, _) = setup("/");
        assert!(gate.evaluate(&Location::parse("/notice?signUp=true")).unwrap().redirect);
        assert!(gate.evaluate(&Location::parse("/notice?signup=true")).unwrap().redirect);
        assert!(!gate.evaluate(&Location::parse("/notice?SIGNUP=true")).unwrap().redirect);
        assert!(!gate.evaluate(&Location::parse("/notice?signUp=1")).unwrap().redirect);
    }

    #[test]
    fn test_navigation_state_signal() {
        let (gate, _, _) = setup("/");
        let location = Location::new("/bookmark").with_state(json!({ "signUp": true }));
        let decision = gate.evaluate(&location).unwrap();
        assert!(decision.redirect);
        assert!(decision.signals.from_navigation_state);
        assert_eq!(decision.target, "/select-department");
    }

    #[test]
    fn test_session_flag_is_one_shot() {
        let (gate, _, _) = setup("/");
        gate.set_session_flag().unwrap();

        let first = gate.evaluate(&Location::new("/notice")).unwrap();
        assert!(first.redirect);
        assert!(first.signals.from_session_flag);
        assert!(!gate.has_session_flag().unwrap());

        let again = gate.evaluate(&Location::new("/notice")).unwrap();
        assert!(!again.redirect);
        let other = gate.evaluate(&Location::new("/settings")).unwrap();
        assert!(!other.redirect);
    }

    #[test]
    fn test_no_loop_on_onboarding_route() {
        let (gate, _, _) = setup("/");
        gate.set_session_flag().unwrap();
        let location = Location::parse("/select-department?signUp=true")
            .with_state(json!({ "signUp": true }));

        let decision = gate.evaluate(&location).unwrap();
        assert!(!decision.redirect);
        assert_eq!(decision.state, GateState::Gated);
        assert!(decision.signals.any());
        // Arriving on the onboarding route serves the flag
        assert!(!gate.has_session_flag().unwrap());
    }

    #[test]
    fn test_flag_lives_in_namespaced_session_store() {
        let (gate, _, store) = setup("/");
        gate.set_session_flag().unwrap();
        assert_eq!(
            store.get("session.flags:justSignedUp").unwrap().as_deref(),
            Some("1")
        );
    }

    struct TerminatingCompletion {
        navigator: Arc<HistoryNavigator>,
    }

    impl CompletionCheck for TerminatingCompletion {
        fn is_complete(&self) -> BoxFuture<'_, Result<bool>> {
            async move {
                self.navigator.navigate("/login", NavigateOptions::replace());
                Err(GatewayError::SessionTerminated {
                    status: 401,
                    cause: crate::error::RefreshError::MissingRefreshToken,
                })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_session_end_during_check_keeps_login_redirect() {
        let (gate, nav, _) = setup("/notice?signUp=true");
        let gate = gate.with_completion_check(Arc::new(TerminatingCompletion {
            navigator: nav.clone(),
        }));

        let decision = gate.guard().await.unwrap();
        assert!(!decision.redirect);
        assert_eq!(nav.current_location().pathname, "/login");
        assert_eq!(nav.records().len(), 1);
    }

    #[tokio::test]
    async fn test_route_change_during_check_skips_redirect() {
        struct MovingCompletion {
            navigator: Arc<HistoryNavigator>,
        }

        impl CompletionCheck for MovingCompletion {
            fn is_complete(&self) -> BoxFuture<'_, Result<bool>> {
                async move {
                    self.navigator.navigate("/settings", NavigateOptions::default());
                    Ok(false)
                }
                .boxed()
            }
        }

        let (gate, nav, _) = setup("/notice");
        let gate = gate.with_completion_check(Arc::new(MovingCompletion {
            navigator: nav.clone(),
        }));

        let decision = gate.guard().await.unwrap();
        assert!(!decision.redirect);
        assert_eq!(decision.target, "/settings");
        assert_eq!(nav.current_location().pathname, "/settings");
    }

    #[test]
    fn test_without_completion_check_signals_decide() {
        let (gate, _, _) = setup("/");
        let location = Location::parse("/bookmark?signup=true");

        let decision = tokio_test::block_on(gate.evaluate_with_completion(&location)).unwrap();
        assert!(decision.redirect);
        assert_eq!(decision.completion, None);
    }

    #[tokio::test]
    async fn test_guard_redirects_with_replace_and_origin() {
        let (gate, nav, _) = setup("/notice?signUp=true");

        let decision = gate.guard().await.unwrap();
        assert!(decision.redirect);

        let records = nav.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "/select-department");
        assert!(records[0].options.replace);
        let state = records[0].options.state.clone().unwrap();
        assert_eq!(state["from"], "/notice?signUp=true");
        assert_eq!(state["signUp"], true);

        // Landing on onboarding does not bounce again
        let decision = gate.guard().await.unwrap();
        assert!(!decision.redirect);
        assert_eq!(nav.records().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_overrides_stale_flag() {
        let (gate, nav, _) = setup("/notice");
        let check = FixedCompletion::new(Some(true));
        let gate = gate.with_completion_check(check.clone());
        gate.set_session_flag().unwrap();

        let decision = gate.guard().await.unwrap();
        assert!(!decision.redirect);
        assert_eq!(decision.completion, Some(true));
        assert!(nav.records().is_empty());
        // The stale flag was still consumed
        assert!(!gate.has_session_flag().unwrap());
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incomplete_onboarding_redirects_without_signals() {
        let (gate, nav, _) = setup("/bookmark");
        let gate = gate.with_completion_check(FixedCompletion::new(Some(false)));

        let decision = gate.guard().await.unwrap();
        assert!(decision.redirect);
        assert_eq!(nav.current_location().pathname, "/select-department");
    }

    #[tokio::test]
    async fn test_completion_not_consulted_on_onboarding_route() {
        let (gate, _, _) = setup("/select-department");
        let check = FixedCompletion::new(Some(false));
        let gate = gate.with_completion_check(check.clone());

        let decision = gate.guard().await.unwrap();
        assert!(!decision.redirect);
        assert_eq!(check.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_completion_falls_back_to_signals() {
        let (gate, _, _) = setup("/notice?signUp=true");
        let gate = gate.with_completion_check(FixedCompletion::new(None));
        assert!(gate.guard().await.unwrap().redirect);

        let (gate, _, _) = setup("/notice");
        let gate = gate.with_completion_check(FixedCompletion::new(None));
        assert!(!gate.guard().await.unwrap().redirect);
    }
}
