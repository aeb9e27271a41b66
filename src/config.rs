use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

use crate::auth::CsrfSettings;
use crate::gateway::GatewaySettings;
use crate::onboarding::GateSettings;
use crate::runtime::{EnvironmentSignals, Runtime};
use crate::transport::TransportSettings;

/// Session Gateway - command-line client for the session layer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the remote API
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:8080/api")]
    pub base_url: String,

    /// Force the runtime (web, embedded) instead of detecting it
    #[arg(short = 'r', long, env = "SESSION_RUNTIME")]
    pub runtime: Option<String>,

    /// User agent reported to runtime detection
    #[arg(long, env = "SESSION_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Path to the credentials SQLite database
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the detected runtime
    Detect {
        /// Landing URL query string, e.g. "runtime=embedded"
        #[arg(long)]
        query: Option<String>,
        /// Pretend the native bridge object is present
        #[arg(long)]
        native_bridge: bool,
    },
    /// Send one request through the gateway
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Show stored credentials
    Status,
    /// Complete a sign-in from the landing location
    SignIn {
        /// Landing href, e.g. "/oauth/callback?accessToken=...&refreshToken=...&signUp=true"
        callback: String,
    },
    /// Evaluate the onboarding gate for a location
    Gate { href: String },
    /// End the session
    Logout,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Remote API
    pub api_base_url: String,

    // Runtime detection
    pub runtime_override: Option<Runtime>,
    pub user_agent: Option<String>,

    // Storage
    pub credentials_db_file: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Auth endpoints
    pub refresh_endpoint: String,
    pub csrf_endpoint: String,
    pub csrf_header_name: String,
    pub logout_endpoint: String,
    pub departments_endpoint: String,

    // Routes
    pub login_path: String,
    pub home_path: String,
    pub onboarding_path: String,

    // Debug
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let runtime_override = match args.runtime.as_deref() {
            Some(value) => Some(
                Runtime::parse(value)
                    .with_context(|| format!("Unknown runtime '{}' (use web or embedded)", value))?,
            ),
            None => None,
        };

        let credentials_db_file = match &args.db_file {
            Some(path) => expand_tilde(path),
            None => default_db_path().context(
                "Cannot determine a data directory (use -d or set CREDENTIALS_DB_FILE env var)",
            )?,
        };

        Ok(Config {
            api_base_url: args.base_url.trim_end_matches('/').to_string(),
            runtime_override,
            user_agent: args.user_agent.clone(),
            credentials_db_file,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level.clone(),
            ..Self::with_base_url(&args.base_url)
        })
    }

    /// Defaults for everything but the base URL, ENV overrides applied
    pub fn with_base_url(base_url: &str) -> Self {
        Config {
            api_base_url: base_url.trim_end_matches('/').to_string(),
            runtime_override: None,
            user_agent: None,
            credentials_db_file: default_db_path()
                .unwrap_or_else(|| PathBuf::from("credentials.sqlite3")),

            http_max_connections: env_parse("HTTP_MAX_CONNECTIONS").unwrap_or(20),
            http_connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT").unwrap_or(30),
            http_request_timeout: env_parse("HTTP_REQUEST_TIMEOUT").unwrap_or(60),

            refresh_endpoint: env_or("REFRESH_ENDPOINT", "/auth/refresh"),
            csrf_endpoint: env_or("CSRF_ENDPOINT", "/auth/csrf"),
            csrf_header_name: env_or("CSRF_HEADER_NAME", "X-CSRF-TOKEN"),
            logout_endpoint: env_or("LOGOUT_ENDPOINT", "/auth/logout"),
            departments_endpoint: env_or("DEPARTMENTS_ENDPOINT", "/user/departments"),

            login_path: env_or("LOGIN_PATH", "/login"),
            home_path: env_or("HOME_PATH", "/notice"),
            onboarding_path: env_or("ONBOARDING_PATH", "/select-department"),

            log_level: "info".to_string(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        for (name, path) in [
            ("REFRESH_ENDPOINT", &self.refresh_endpoint),
            ("CSRF_ENDPOINT", &self.csrf_endpoint),
            ("LOGOUT_ENDPOINT", &self.logout_endpoint),
            ("DEPARTMENTS_ENDPOINT", &self.departments_endpoint),
            ("LOGIN_PATH", &self.login_path),
            ("HOME_PATH", &self.home_path),
            ("ONBOARDING_PATH", &self.onboarding_path),
        ] {
            if !path.starts_with('/') {
                anyhow::bail!("{} must start with '/': {}", name, path);
            }
        }

        Ok(())
    }

    /// Signals for runtime detection; an explicit runtime acts as the query override
    pub fn environment_signals(&self) -> EnvironmentSignals {
        let mut signals = EnvironmentSignals::new().with_build_flag();
        if let Some(runtime) = self.runtime_override {
            signals = signals.with_query(format!("runtime={}", runtime));
        }
        if let Some(ua) = &self.user_agent {
            signals = signals.with_user_agent(ua.clone());
        }
        signals
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            max_idle_connections: self.http_max_connections,
            connect_timeout: self.http_connect_timeout,
            request_timeout: self.http_request_timeout,
        }
    }

    pub fn csrf_settings(&self) -> CsrfSettings {
        CsrfSettings {
            endpoint: self.csrf_endpoint.clone(),
            header_name: self.csrf_header_name.clone(),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        let mut settings = GatewaySettings {
            logout_endpoint: self.logout_endpoint.clone(),
            login_path: self.login_path.clone(),
            ..GatewaySettings::default()
        };
        for endpoint in [&self.refresh_endpoint, &self.csrf_endpoint, &self.logout_endpoint] {
            if !settings.auth_endpoints.contains(endpoint) {
                settings.auth_endpoints.push(endpoint.clone());
            }
        }
        settings
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            onboarding_path: self.onboarding_path.clone(),
            ..GateSettings::default()
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Per-user data directory, e.g. ~/.local/share/session-gateway/credentials.sqlite3
fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("session-gateway").join("credentials.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["session-gateway", "--base-url", "https://api.example.com/api/"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_from_args() {
        let args = args(&["--runtime", "embedded", "-d", "/tmp/creds.db", "status"]);
        let config = Config::from_args(&args).unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com/api");
        assert_eq!(config.runtime_override, Some(Runtime::Embedded));
        assert_eq!(config.credentials_db_file, PathBuf::from("/tmp/creds.db"));
        assert_eq!(args.command, Command::Status);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_runtime_is_rejected() {
        let args = args(&["--runtime", "desktop", "status"]);
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn test_request_subcommand() {
        let args = args(&["request", "POST", "/bookmarks", "--body", r#"{"id":1}"#]);
        assert_eq!(
            args.command,
            Command::Request {
                method: "POST".to_string(),
                path: "/bookmarks".to_string(),
                body: Some(r#"{"id":1}"#.to_string()),
            }
        );
    }

    #[test]
    fn test_validate() {
        let mut config = Config::with_base_url("ftp://example.com");
        assert!(config.validate().is_err());

        config.api_base_url = "http://localhost:8080".to_string();
        config.validate().unwrap();

        config.login_path = "login".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_runtime_wins_detection() {
        let mut config = Config::with_base_url("http://localhost");
        config.runtime_override = Some(Runtime::Web);
        config.user_agent = Some("Mozilla/5.0 AuraWebView/2.1".to_string());
        assert_eq!(crate::runtime::detect(&config.environment_signals()), Runtime::Web);

        config.runtime_override = None;
        assert_eq!(
            crate::runtime::detect(&config.environment_signals()),
            Runtime::Embedded
        );
    }

    #[test]
    fn test_gateway_settings_exempt_configured_endpoints() {
        let mut config = Config::with_base_url("http://localhost");
        config.refresh_endpoint = "/v2/token/refresh".to_string();
        let settings = config.gateway_settings();
        assert!(settings.auth_endpoints.contains(&"/v2/token/refresh".to_string()));
        assert!(settings.auth_endpoints.contains(&"/auth/refresh".to_string()));
    }
}
