// Refresh Gate - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod transport;

pub use auth::{RefreshArbiter, SessionEvent, TokenPair};
pub use error::{ClientError, RefreshError};
pub use http_client::AuthenticatedClient;
pub use transport::{ApiRequest, ApiResponse};
