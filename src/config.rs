use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Refresh Gate - authenticated API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the backend API
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Refresh endpoint (defaults to <base-url>/auth/refresh)
    #[arg(long, env = "REFRESH_URL")]
    pub refresh_url: Option<String>,

    /// Path to the credential database
    #[arg(
        short = 'd',
        long,
        env = "CREDENTIALS_DB",
        default_value = "~/.local/share/refresh-gate/credentials.db"
    )]
    pub credentials_db: String,

    /// Namespace for credentials inside the database
    #[arg(long, env = "CREDENTIALS_SCOPE", default_value = "default")]
    pub credentials_scope: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub request_timeout: u64,

    /// Deadline for a single refresh exchange in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// Timezone reported to the API (detected when unset)
    #[arg(long, env = "CLIENT_TIMEZONE")]
    pub timezone: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send one authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the base URL
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Store credentials obtained from the login flow
    Login {
        #[arg(long, env = "ACCESS_TOKEN")]
        access_token: String,
        #[arg(long, env = "REFRESH_TOKEN")]
        refresh_token: Option<String>,
    },
    /// Forget stored credentials
    Logout,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,
    pub refresh_url: String,

    // Credential storage
    pub credentials_db: PathBuf,
    pub credentials_scope: String,

    // Timeouts
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub refresh_timeout: u64,

    // Request headers
    pub timezone: Option<String>,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<(Self, Command)> {
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let api_base_url = args
            .base_url
            .clone()
            .map(|s| s.trim_end_matches('/').to_string())
            .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?;

        let refresh_url = args
            .refresh_url
            .clone()
            .unwrap_or_else(|| format!("{}/auth/refresh", api_base_url));

        Ok(Config {
            api_base_url,
            refresh_url,
            credentials_db: expand_tilde(&args.credentials_db),
            credentials_scope: args.credentials_scope.clone(),
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.request_timeout,
            refresh_timeout: args.refresh_timeout,
            timezone: args.timezone.clone().filter(|tz| !tz.trim().is_empty()),
            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("API_BASE_URL", &self.api_base_url),
            ("REFRESH_URL", &self.refresh_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL: {}", name, url);
            }
        }

        if self.credentials_scope.is_empty() {
            anyhow::bail!("CREDENTIALS_SCOPE must not be empty");
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be greater than zero");
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout)
    }
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
