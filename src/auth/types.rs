// Authentication types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque bearer credential attached to ordinary requests
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

/// Long-lived credential, only ever sent to the refresh endpoint
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RefreshToken(String);

macro_rules! opaque_token {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// Short prefix for log lines
            pub fn preview(&self) -> &str {
                let end = self
                    .0
                    .char_indices()
                    .nth(8)
                    .map(|(i, _)| i)
                    .unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}...)", stringify!($name), self.preview())
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_token!(AccessToken);
opaque_token!(RefreshToken);

impl AccessToken {
    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

/// Credentials issued at sign-in or by a refresh exchange
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: AccessToken,
    /// Present when the server rotated (or issued) the refresh token
    pub refresh_token: Option<RefreshToken>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<AccessToken>, refresh_token: Option<RefreshToken>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

/// Refresh endpoint request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh endpoint response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Notifications published on the session event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Refresh token is no longer usable, the app must show its login flow
    LoggedOut,
}

impl SessionEvent {
    pub const LOGGED_OUT: &'static str = "session.logged_out";

    /// Well-known event name consumed by the surrounding application
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::LoggedOut => Self::LOGGED_OUT,
        }
    }
}
