// Token refresh exchange

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{AccessToken, RefreshRequest, RefreshResponse, RefreshToken, TokenPair};
use crate::error::RefreshError;

/// Exchanges a refresh token for a new access token.
///
/// Called at most once per arbitration cycle. Implementations must not retry
/// internally; a failed exchange ends the session.
#[async_trait]
pub trait RefreshInvoker: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, RefreshError>;
}

/// User-Agent sent to the auth service: crate version, OS and host name
fn client_user_agent() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string());

    format!(
        "refresh-gate/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        host
    )
}

/// Refresh invoker backed by a JSON `POST` to the auth service
pub struct HttpRefreshInvoker {
    client: Client,
    url: String,
    user_agent: String,
}

impl HttpRefreshInvoker {
    pub fn new(url: impl Into<String>, connect_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .build()
            .context("Failed to create refresh HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            user_agent: client_user_agent(),
        })
    }
}

#[async_trait]
impl RefreshInvoker for HttpRefreshInvoker {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, RefreshError> {
        tracing::info!(url = %self.url, "Refreshing access token...");

        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", &self.user_agent)
            .json(&RefreshRequest {
                refresh_token: refresh_token.as_str(),
            })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Refresh endpoint rejected the refresh token"
            );
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "response does not contain accessToken".to_string(),
            ));
        }

        let rotated = data
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(RefreshToken::new);

        tracing::info!(rotated = rotated.is_some(), "Access token refreshed");

        Ok(TokenPair {
            access_token: AccessToken::new(data.access_token),
            refresh_token: rotated,
        })
    }
}
