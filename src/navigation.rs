// Navigation and host-shell capabilities
// Injected into the gateway and the onboarding gate instead of a global navigate function

use serde_json::Value;
use std::sync::Mutex;
use url::form_urlencoded;

/// A route location: path, query string and transition state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub pathname: String,
    /// Query string including the leading `?`, or empty
    pub search: String,
    /// State attached to the transition, not visible in the URL
    pub state: Option<Value>,
}

impl Location {
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            pathname: pathname.into(),
            ..Default::default()
        }
    }

    /// Split a `path?query` string into a location
    pub fn parse(href: &str) -> Self {
        let href = href.split('#').next().unwrap_or_default();
        let (pathname, search) = match href.find('?') {
            Some(idx) => (&href[..idx], &href[idx..]),
            None => (href, ""),
        };
        let pathname = if pathname.is_empty() { "/" } else { pathname };
        Self {
            pathname: pathname.to_string(),
            search: if search == "?" { String::new() } else { search.to_string() },
            state: None,
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    /// First value of a query parameter (case-sensitive key)
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.search.strip_prefix('?').unwrap_or(&self.search);
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Boolean field of the transition state
    pub fn state_flag(&self, key: &str) -> bool {
        self.state
            .as_ref()
            .and_then(|state| state.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn href(&self) -> String {
        format!("{}{}", self.pathname, self.search)
    }
}

/// Options passed along with a navigation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigateOptions {
    /// Replace the current history entry instead of pushing
    pub replace: bool,
    pub state: Option<Value>,
}

impl NavigateOptions {
    pub fn replace() -> Self {
        Self {
            replace: true,
            state: None,
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// Navigation host capability
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str, options: NavigateOptions);
    fn current_location(&self) -> Location;
}

/// Native shell capability, Embedded runtime only
pub trait HostBridge: Send + Sync {
    /// The session is gone; the shell re-authenticates and hands back fresh credentials
    fn session_ended(&self, reason: &str);
}

/// One recorded navigation
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationRecord {
    pub path: String,
    pub options: NavigateOptions,
}

/// In-memory history stack
///
/// Used by the CLI and by tests; a UI host provides its own [`Navigator`].
pub struct HistoryNavigator {
    entries: Mutex<Vec<Location>>,
    log: Mutex<Vec<NavigationRecord>>,
}

impl HistoryNavigator {
    pub fn new(initial: Location) -> Self {
        Self {
            entries: Mutex::new(vec![initial]),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn at(href: &str) -> Self {
        Self::new(Location::parse(href))
    }

    /// Navigations performed so far, oldest first
    pub fn records(&self) -> Vec<NavigationRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of history entries
    pub fn depth(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Pop the current entry, like a browser back button
    pub fn back(&self) -> Option<Location> {
        let mut entries = self.entries.lock().ok()?;
        if entries.len() > 1 {
            entries.pop();
        }
        entries.last().cloned()
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, path: &str, options: NavigateOptions) {
        tracing::debug!(path = path, replace = options.replace, "Navigating");

        let mut location = Location::parse(path);
        location.state = options.state.clone();

        if let Ok(mut entries) = self.entries.lock() {
            if options.replace {
                entries.pop();
            }
            entries.push(location);
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(NavigationRecord {
                path: path.to_string(),
                options,
            });
        }
    }

    fn current_location(&self) -> Location {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.last().cloned())
            .unwrap_or_else(|| Location::new("/"))
    }
}
