use anyhow::{Context, Result};
use reqwest::Method;
use std::sync::Arc;

use session_gateway::callback::AuthCallback;
use session_gateway::client::SessionClient;
use session_gateway::config::{Command, Config};
use session_gateway::navigation::{HistoryNavigator, HostBridge, Location, Navigator};
use session_gateway::runtime;
use session_gateway::transport::ApiRequest;

/// Host shell stand-in for the command line
struct ConsoleHost;

impl HostBridge for ConsoleHost {
    fn session_ended(&self, reason: &str) {
        tracing::warn!("Host notified: session ended ({})", reason);
        eprintln!("Session ended: {}. Sign in again to continue.", reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    if let Command::Detect {
        query,
        native_bridge,
    } = &command
    {
        let mut signals = config.environment_signals().with_native_bridge(*native_bridge);
        if let Some(query) = query {
            signals = signals.with_query(query.clone());
        }
        println!("{}", runtime::detect(&signals));
        return Ok(());
    }

    let start = match &command {
        Command::Gate { href } => href.clone(),
        Command::SignIn { callback } => callback.clone(),
        _ => "/".to_string(),
    };
    let navigator = Arc::new(HistoryNavigator::at(&start));
    let client = SessionClient::connect(&config, navigator.clone(), Some(Arc::new(ConsoleHost)))?;
    tracing::info!("✅ Session client initialized ({})", client.runtime());

    match command {
        Command::Detect { .. } => {}
        Command::Request { method, path, body } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                let value: serde_json::Value =
                    serde_json::from_str(&body).context("--body is not valid JSON")?;
                request = request.json(&value)?;
            }

            let response = client.gateway().request(request).await?;
            println!("{}", response.status);
            match response.json::<serde_json::Value>() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.text()),
            }
        }
        Command::Status => {
            println!("runtime: {}", client.runtime());
            match client.credentials().get()? {
                Some(creds) => {
                    println!("access token: {}", mask(&creds.access_token));
                    println!(
                        "refresh token: {}",
                        creds.refresh_token.as_deref().map(mask).unwrap_or_else(|| "-".to_string())
                    );
                    if let Some(updated) = creds.updated_at {
                        println!("updated at: {}", updated.to_rfc3339());
                    }
                }
                None if client.runtime().is_embedded() => println!("not signed in"),
                None => println!("session held in cookies"),
            }
        }
        Command::SignIn { callback } => {
            let callback = AuthCallback::from_location(&Location::parse(&callback));
            let target = client.complete_sign_in(&callback)?;
            println!("{}", target);
        }
        Command::Gate { .. } => {
            let decision = client.gate().guard().await?;
            println!(
                "{:?} -> {}",
                decision.state,
                navigator.current_location().href()
            );
        }
        Command::Logout => {
            client.gateway().logout().await?;
            println!("signed out");
        }
    }

    Ok(())
}

/// Show only the first characters of a token
fn mask(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{}...", visible)
}
