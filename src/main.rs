use anyhow::{Context, Result};
use reqwest::Method;
use std::sync::Arc;

use refresh_gate::auth::{
    BroadcastEventBus, HttpRefreshInvoker, RefreshArbiter, RefreshToken, SessionEvent,
    SqliteCredentialStore, TokenPair,
};
use refresh_gate::config::{Command, Config};
use refresh_gate::transport::{ApiRequest, ReqwestTransport};
use refresh_gate::AuthenticatedClient;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    let events = BroadcastEventBus::default();
    let client = build_client(&config, &events)?;

    match command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            client.sign_in(&TokenPair::new(
                access_token,
                refresh_token.map(RefreshToken::new),
            ))?;
            tracing::info!("Credentials stored in {}", config.credentials_db.display());
        }
        Command::Logout => {
            client.sign_out()?;
            tracing::info!("Credentials cleared");
        }
        Command::Request { method, path, body } => {
            let mut logged_out = events.subscribe();
            let request = build_request(&method, &path, body.as_deref())?;

            let result = client.execute(request).await;

            if let Ok(SessionEvent::LoggedOut) = logged_out.try_recv() {
                tracing::error!("Session expired, run `refresh-gate login` again");
            }

            let response = result?;
            tracing::info!(status = %response.status, "Request completed");
            println!("{}", response.text());
        }
    }

    Ok(())
}

/// Wire the client from configuration
fn build_client(config: &Config, events: &BroadcastEventBus) -> Result<AuthenticatedClient> {
    if let Some(parent) = config.credentials_db.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create credentials directory: {}", parent.display())
        })?;
    }

    let store = Arc::new(
        SqliteCredentialStore::open(&config.credentials_db, &config.credentials_scope)
            .context("Failed to open credential database")?,
    );
    let invoker = Arc::new(HttpRefreshInvoker::new(
        config.refresh_url.clone(),
        config.http_connect_timeout,
    )?);
    let arbiter = RefreshArbiter::new(
        store,
        invoker,
        Arc::new(events.clone()),
        config.refresh_timeout(),
    )
    .context("Failed to load stored credentials")?;

    let transport = Arc::new(ReqwestTransport::new(
        &config.api_base_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    Ok(AuthenticatedClient::new(
        transport,
        arbiter,
        config.timezone.as_deref(),
    ))
}

fn build_request(method: &str, path: &str, body: Option<&str>) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        let json = serde_json::from_str(body).context("Request body must be valid JSON")?;
        request = request.with_body(json);
    }
    Ok(request)
}
