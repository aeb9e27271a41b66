// Runtime detection
// Decides once per process whether we run in a plain browser context or inside a native shell

use once_cell::sync::OnceCell;
use url::form_urlencoded;

/// Query parameter that explicitly overrides the runtime
pub const RUNTIME_QUERY_KEY: &str = "runtime";

/// User-agent marker appended by the native shell's WebView
pub const DEFAULT_USER_AGENT_MARKER: &str = "AuraWebView";

/// Build-time flag baked into the binary, if any
pub const BUILD_RUNTIME_FLAG: Option<&str> = option_env!("SESSION_GATEWAY_RUNTIME");

static DETECTED: OnceCell<Runtime> = OnceCell::new();

/// Execution context of the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    /// Ordinary browser context, cookie session + CSRF token
    Web,
    /// Hosted inside a native shell, bearer tokens held by this process
    Embedded,
}

impl Runtime {
    pub fn is_embedded(self) -> bool {
        self == Runtime::Embedded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Web => "web",
            Runtime::Embedded => "embedded",
        }
    }

    /// Parse an explicit runtime name (query override, env, build flag)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "embedded" | "app" | "native" => Some(Runtime::Embedded),
            "web" | "browser" => Some(Runtime::Web),
            _ => None,
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment signals the detector looks at
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSignals {
    /// Raw query string of the landing URL, with or without the leading `?`
    pub query: Option<String>,
    /// Whether the native bridge object is present
    pub native_bridge_present: bool,
    pub user_agent: Option<String>,
    /// Build-time environment flag
    pub build_flag: Option<String>,
    /// Marker searched for in the user agent
    pub user_agent_marker: Option<String>,
}

impl EnvironmentSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_native_bridge(mut self, present: bool) -> Self {
        self.native_bridge_present = present;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_user_agent_marker(mut self, marker: impl Into<String>) -> Self {
        self.user_agent_marker = Some(marker.into());
        self
    }

    /// Fill the build flag from the value compiled into this binary
    pub fn with_build_flag(mut self) -> Self {
        self.build_flag = BUILD_RUNTIME_FLAG.map(str::to_string);
        self
    }

    pub fn with_build_flag_value(mut self, flag: impl Into<String>) -> Self {
        self.build_flag = Some(flag.into());
        self
    }

    fn query_override(&self) -> Option<Runtime> {
        let query = self.query.as_deref()?;
        let query = query.strip_prefix('?').unwrap_or(query);
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == RUNTIME_QUERY_KEY)
            .and_then(|(_, value)| Runtime::parse(&value))
    }

    fn user_agent_matches(&self) -> bool {
        let marker = self
            .user_agent_marker
            .as_deref()
            .unwrap_or(DEFAULT_USER_AGENT_MARKER);
        match self.user_agent.as_deref() {
            Some(ua) if !marker.is_empty() => ua.contains(marker),
            _ => false,
        }
    }
}

/// Decide the runtime from environment signals
///
/// Precedence: explicit query override, native bridge object, user-agent
/// marker, build flag. First match wins; default is [`Runtime::Web`].
pub fn detect(signals: &EnvironmentSignals) -> Runtime {
    if let Some(runtime) = signals.query_override() {
        return runtime;
    }
    if signals.native_bridge_present {
        return Runtime::Embedded;
    }
    if signals.user_agent_matches() {
        return Runtime::Embedded;
    }
    signals
        .build_flag
        .as_deref()
        .and_then(Runtime::parse)
        .unwrap_or(Runtime::Web)
}

/// Detect once per process; later calls return the first answer
pub fn detect_once(signals: &EnvironmentSignals) -> Runtime {
    *DETECTED.get_or_init(|| {
        let runtime = detect(signals);
        tracing::info!(runtime = %runtime, "Runtime detected");
        runtime
    })
}
