// Error handling module
// Defines the error taxonomy surfaced by the authenticated client

use thiserror::Error;

/// Errors raised by a credential store backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// SQLite backend failure
    #[error("Credential database error: {0}")]
    Sqlite(String),

    /// Store could not be reached (locked, closed, missing)
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

/// Failure of a single refresh-token exchange.
///
/// Cloneable so one failure can be handed to every request queued behind
/// the refresh.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// No refresh token stored, nothing to exchange
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Transport failure while talking to the refresh endpoint
    #[error("Refresh request failed: {0}")]
    Network(String),

    /// Refresh endpoint answered with a non-success status
    #[error("Refresh rejected: {status} - {body}")]
    Rejected { status: u16, body: String },

    /// Refresh endpoint answered 2xx but the payload is unusable
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Refresh call exceeded its deadline
    #[error("Refresh timed out after {0}s")]
    Timeout(u64),

    /// Credentials could not be read or persisted
    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    /// Refresh task ended without reporting an outcome
    #[error("Refresh aborted: {0}")]
    Aborted(String),
}

/// Errors returned by [`crate::http_client::AuthenticatedClient::execute`]
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure, never triggers a refresh
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Success status carrying an error payload
    #[error("Application error: {status} - {message}")]
    Application { status: u16, message: String },

    /// 401 after a retry, or the refresh that would have fixed it failed
    #[error("Authorization failed: {status}{}", refresh_suffix(.refresh))]
    Authorization {
        status: u16,
        refresh: Option<RefreshError>,
    },

    /// Any other non-success status
    #[error("API error: {status} - {body}")]
    Status { status: u16, body: String },

    /// Credential store read/write failed outside of a refresh
    #[error("Credentials error: {0}")]
    Credentials(#[from] StoreError),

    /// Request could not be built (bad header, bad URL)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

fn refresh_suffix(refresh: &Option<RefreshError>) -> String {
    match refresh {
        Some(cause) => format!(" (refresh failed: {})", cause),
        None => String::new(),
    }
}

impl ClientError {
    /// True when the caller should send the user back to the login flow
    pub fn is_authorization(&self) -> bool {
        matches!(self, ClientError::Authorization { .. })
    }

    /// Refresh failure behind an authorization error, if any
    pub fn refresh_cause(&self) -> Option<&RefreshError> {
        match self {
            ClientError::Authorization { refresh, .. } => refresh.as_ref(),
            _ => None,
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
