// Authentication module
// Session credentials, the refresh exchange and single-flight refresh arbitration

mod arbiter;
mod events;
mod refresh;
mod store;
mod types;

pub use arbiter::RefreshArbiter;
pub use events::{BroadcastEventBus, SessionEventBus};
pub use refresh::{HttpRefreshInvoker, RefreshInvoker};
pub use store::{
    CredentialStore, MemoryCredentialStore, SqliteCredentialStore, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
pub use types::{AccessToken, RefreshToken, SessionEvent, TokenPair};
