// Refresh arbitration
// Single-flight coordination of access token refreshes across concurrent requests

use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use super::events::SessionEventBus;
use super::refresh::RefreshInvoker;
use super::store::{CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use super::types::{AccessToken, RefreshToken, SessionEvent, TokenPair};
use crate::error::{RefreshError, StoreError};

type RefreshOutcome = Result<AccessToken, RefreshError>;

/// A caller suspended until the in-flight refresh resolves
struct PendingRequest {
    id: u64,
    completion: oneshot::Sender<RefreshOutcome>,
}

/// Arbitration phase. `Idle` is both the initial and the resting state.
enum ArbitrationState {
    Idle,
    Refreshing {
        waiters: VecDeque<PendingRequest>,
        /// Session the cycle was started for
        session: u64,
    },
}

struct Inner {
    phase: ArbitrationState,
    /// In-memory copy of the stored access token
    access_token: Option<AccessToken>,
    /// Set while the current session may still emit a forced logout
    logout_armed: bool,
    /// Bumped by every explicit sign-in and sign-out
    session: u64,
    cycles: u64,
}

struct Shared {
    state: Mutex<Inner>,
    store: Arc<dyn CredentialStore>,
    invoker: Arc<dyn RefreshInvoker>,
    events: Arc<dyn SessionEventBus>,
    refresh_timeout: Duration,
    next_waiter_id: AtomicU64,
}

/// Coordinates access token refreshes so that at most one exchange is in
/// flight at any time.
///
/// The first caller reporting an authorization failure starts the exchange;
/// everyone arriving while it runs is queued and resolved with the same
/// outcome, in arrival order. The exchange runs on its own task so that a
/// cancelled caller can never leave the arbiter stuck in `Refreshing`.
#[derive(Clone)]
pub struct RefreshArbiter {
    shared: Arc<Shared>,
}

impl RefreshArbiter {
    /// Create an arbiter, loading the cached access token from `store`
    pub fn new(
        store: Arc<dyn CredentialStore>,
        invoker: Arc<dyn RefreshInvoker>,
        events: Arc<dyn SessionEventBus>,
        refresh_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let access_token = store.get(ACCESS_TOKEN_KEY)?.map(AccessToken::new);

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    phase: ArbitrationState::Idle,
                    access_token,
                    logout_armed: true,
                    session: 0,
                    cycles: 0,
                }),
                store,
                invoker,
                events,
                refresh_timeout,
                next_waiter_id: AtomicU64::new(0),
            }),
        })
    }

    /// Access token to attach to the next dispatch
    pub fn access_token(&self) -> Option<AccessToken> {
        self.shared.lock().access_token.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.shared.lock().phase, ArbitrationState::Refreshing { .. })
    }

    /// Number of callers waiting on the in-flight refresh
    pub fn pending(&self) -> usize {
        match &self.shared.lock().phase {
            ArbitrationState::Refreshing { waiters, .. } => waiters.len(),
            ArbitrationState::Idle => 0,
        }
    }

    /// Number of refresh cycles started so far
    pub fn cycles(&self) -> u64 {
        self.shared.lock().cycles
    }

    /// Wait for a usable access token after `failed` was rejected with 401.
    ///
    /// Starts a refresh if none is running, otherwise joins the queue of the
    /// running one. If the cached token already differs from `failed`, a
    /// refresh finished while the request was in flight and the cached token
    /// is returned straight away.
    pub async fn await_refresh(&self, failed: Option<&AccessToken>) -> RefreshOutcome {
        let (id, receiver) = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            let id = self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (completion, receiver) = oneshot::channel();
            let pending = PendingRequest { id, completion };

            if let ArbitrationState::Refreshing { waiters, .. } = &mut inner.phase {
                waiters.push_back(pending);
                tracing::debug!(
                    waiter = id,
                    queued = waiters.len(),
                    "Refresh in flight, queueing request"
                );
            } else {
                if let Some(current) = &inner.access_token {
                    if failed != Some(current) {
                        tracing::debug!(
                            token = current.preview(),
                            "Access token already replaced, skipping refresh"
                        );
                        return Ok(current.clone());
                    }
                }

                inner.cycles += 1;
                inner.phase = ArbitrationState::Refreshing {
                    waiters: VecDeque::from([pending]),
                    session: inner.session,
                };
                tracing::info!(cycle = inner.cycles, driver = id, "Starting token refresh");

                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.drive().await });
            }

            (id, receiver)
        };

        let guard = WaiterGuard {
            shared: &self.shared,
            id,
            armed: true,
        };
        let outcome = receiver.await;
        guard.disarm();

        outcome.unwrap_or_else(|_| {
            Err(RefreshError::Aborted(
                "refresh finished without resolving request".to_string(),
            ))
        })
    }

    /// Install credentials from an explicit sign-in.
    ///
    /// Starts a new session: a refresh still running for the previous one
    /// no longer touches the stored credentials. Re-arms the forced-logout
    /// latch.
    pub fn sign_in(&self, tokens: &TokenPair) -> Result<(), StoreError> {
        let mut inner = self.shared.lock();
        self.shared
            .store
            .set(ACCESS_TOKEN_KEY, tokens.access_token.as_str())?;
        match &tokens.refresh_token {
            Some(refresh_token) => self
                .shared
                .store
                .set(REFRESH_TOKEN_KEY, refresh_token.as_str())?,
            None => self.shared.store.clear(REFRESH_TOKEN_KEY)?,
        }

        inner.session += 1;
        inner.access_token = Some(tokens.access_token.clone());
        inner.logout_armed = true;
        tracing::info!(
            session = inner.session,
            token = tokens.access_token.preview(),
            "Signed in"
        );
        Ok(())
    }

    /// User-initiated logout. Clears credentials and disarms the
    /// forced-logout latch, the user is already on their way out.
    pub fn sign_out(&self) -> Result<(), StoreError> {
        let mut inner = self.shared.lock();
        self.shared.clear_credentials()?;
        inner.session += 1;
        inner.access_token = None;
        inner.logout_armed = false;
        tracing::info!(session = inner.session, "Signed out");
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of the refresh task: one exchange, then resolve the cycle
    async fn drive(&self) {
        let exchanged = match AssertUnwindSafe(self.exchange()).catch_unwind().await {
            Ok(exchanged) => exchanged,
            Err(_) => Err(RefreshError::Aborted("refresh task panicked".to_string())),
        };
        self.complete(exchanged);
    }

    async fn exchange(&self) -> Result<TokenPair, RefreshError> {
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)?
            .filter(|t| !t.is_empty())
            .map(RefreshToken::new)
            .ok_or(RefreshError::MissingRefreshToken)?;

        tokio::time::timeout(self.refresh_timeout, self.invoker.refresh(&refresh_token))
            .await
            .map_err(|_| RefreshError::Timeout(self.refresh_timeout.as_secs()))?
    }

    /// Return to `Idle`, handing the cycle's outcome to every queued caller.
    ///
    /// Credentials are written or cleared here, under the lock, and only when
    /// no sign-in or sign-out happened while the exchange ran.
    fn complete(&self, exchanged: Result<TokenPair, RefreshError>) {
        let emit_logout = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let (waiters, started_in) =
                match std::mem::replace(&mut inner.phase, ArbitrationState::Idle) {
                    ArbitrationState::Refreshing { waiters, session } => (waiters, session),
                    ArbitrationState::Idle => (VecDeque::new(), inner.session),
                };
            let same_session = started_in == inner.session;

            let outcome = if same_session {
                self.settle(inner, exchanged)
            } else {
                // Hand out whatever the new session installed
                tracing::warn!(
                    cycle = inner.cycles,
                    session = inner.session,
                    "Session changed during refresh, discarding its result"
                );
                inner.access_token.clone().ok_or_else(|| {
                    RefreshError::Aborted("session ended during refresh".to_string())
                })
            };

            if let Ok(token) = &outcome {
                tracing::info!(
                    cycle = inner.cycles,
                    waiters = waiters.len(),
                    token = token.preview(),
                    "Token refresh resolved, replaying queued requests"
                );
            }

            for waiter in waiters {
                // Receiver gone means the caller was cancelled mid-resolution
                if waiter.completion.send(outcome.clone()).is_err() {
                    tracing::debug!(waiter = waiter.id, "Queued request went away");
                }
            }

            same_session
                && outcome.is_err()
                && std::mem::replace(&mut inner.logout_armed, false)
        };

        if emit_logout {
            self.events.emit(SessionEvent::LoggedOut);
        }
    }

    /// Persist a finished exchange for the session that started it
    fn settle(
        &self,
        inner: &mut Inner,
        exchanged: Result<TokenPair, RefreshError>,
    ) -> RefreshOutcome {
        let persisted = exchanged.and_then(|tokens| {
            self.store
                .set(ACCESS_TOKEN_KEY, tokens.access_token.as_str())?;
            if let Some(rotated) = &tokens.refresh_token {
                self.store.set(REFRESH_TOKEN_KEY, rotated.as_str())?;
            }
            Ok(tokens.access_token)
        });

        match &persisted {
            Ok(token) => {
                inner.access_token = Some(token.clone());
                inner.logout_armed = true;
            }
            Err(cause) => {
                tracing::error!(error = %cause, "Token refresh failed, ending session");
                if let Err(e) = self.clear_credentials() {
                    tracing::warn!(error = %e, "Failed to clear credentials after refresh failure");
                }
                inner.access_token = None;
            }
        }

        persisted
    }

    fn clear_credentials(&self) -> Result<(), StoreError> {
        self.store.clear(ACCESS_TOKEN_KEY)?;
        self.store.clear(REFRESH_TOKEN_KEY)
    }
}

/// Removes a cancelled caller from the queue
struct WaiterGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl WaiterGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.lock();
        if let ArbitrationState::Refreshing { waiters, .. } = &mut inner.phase {
            waiters.retain(|w| w.id != self.id);
            tracing::debug!(waiter = self.id, queued = waiters.len(), "Queued request cancelled");
        }
    }
}
