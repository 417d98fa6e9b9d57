use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{AccessToken, RefreshArbiter, TokenPair};
use crate::error::{ClientError, Result};
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Header carrying the caller's timezone
pub const TIMEZONE_HEADER: &str = "x-timezone";

/// Header carrying a per-dispatch correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// API client that attaches the session's access token to every request
/// and recovers from expired tokens through the shared [`RefreshArbiter`]
pub struct AuthenticatedClient {
    transport: Arc<dyn Transport>,
    arbiter: RefreshArbiter,
    timezone: Option<HeaderValue>,
}

impl AuthenticatedClient {
    /// Create a client. `timezone` overrides the one detected from the environment.
    pub fn new(
        transport: Arc<dyn Transport>,
        arbiter: RefreshArbiter,
        timezone: Option<&str>,
    ) -> Self {
        let timezone = client_timezone(timezone).and_then(|tz| match HeaderValue::from_str(&tz) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(timezone = %tz, "Timezone is not a valid header value, omitting");
                None
            }
        });

        Self {
            transport,
            arbiter,
            timezone,
        }
    }

    pub fn arbiter(&self) -> &RefreshArbiter {
        &self.arbiter
    }

    /// Execute a request with the current access token.
    ///
    /// A 401 sends the request through refresh arbitration and replays it
    /// once with the new token. A second 401 is final.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        tracing::debug!(
            method = %request.method,
            path = %request.path,
            "Sending API request"
        );

        let mut token = self.arbiter.access_token();
        loop {
            let prepared = self.prepare(&request, token.as_ref())?;
            let response = self.transport.send(&prepared).await?;

            if response.status != StatusCode::UNAUTHORIZED {
                return check_response(response);
            }

            if request.already_retried {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    "Received 401 after token refresh, giving up"
                );
                return Err(ClientError::Authorization {
                    status: response.status.as_u16(),
                    refresh: None,
                });
            }

            tracing::warn!(
                method = %request.method,
                path = %request.path,
                "Received 401, waiting for token refresh"
            );

            match self.arbiter.await_refresh(token.as_ref()).await {
                Ok(refreshed) => {
                    // Replay with the token this arbitration produced
                    request.already_retried = true;
                    token = Some(refreshed);
                }
                Err(cause) => {
                    return Err(ClientError::Authorization {
                        status: response.status.as_u16(),
                        refresh: Some(cause),
                    })
                }
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// Start a session with credentials obtained from the login flow
    pub fn sign_in(&self, tokens: &TokenPair) -> Result<()> {
        Ok(self.arbiter.sign_in(tokens)?)
    }

    /// End the session at the user's request
    pub fn sign_out(&self) -> Result<()> {
        Ok(self.arbiter.sign_out()?)
    }

    /// Copy of `request` with credential, timezone and request id headers
    fn prepare(&self, request: &ApiRequest, token: Option<&AccessToken>) -> Result<ApiRequest> {
        let mut prepared = request.clone();
        prepared.headers.remove(AUTHORIZATION);

        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&token.bearer())
                .map_err(|e| ClientError::InvalidRequest(format!("access token: {}", e)))?;
            value.set_sensitive(true);
            prepared.headers.insert(AUTHORIZATION, value);
        }

        if let Some(timezone) = &self.timezone {
            prepared
                .headers
                .insert(HeaderName::from_static(TIMEZONE_HEADER), timezone.clone());
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            prepared
                .headers
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }

        Ok(prepared)
    }
}

/// Map a non-401 response onto the caller-facing result
fn check_response(response: ApiResponse) -> Result<ApiResponse> {
    let status = response.status;

    if !status.is_success() {
        let body = response.text();
        tracing::error!(status = status.as_u16(), body = %body, "API request failed");
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }

    if let Some(message) = application_error(&response.body) {
        tracing::warn!(status = status.as_u16(), message = %message, "API returned an error payload");
        return Err(ClientError::Application {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

/// Error message from a success body carrying a top-level `error` field
fn application_error(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) => Some(message.clone()),
        Value::Object(details) => Some(
            details
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(details.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Timezone reported to the API.
///
/// Prefers the explicit override, then `TZ`, then the local UTC offset.
pub fn client_timezone(override_tz: Option<&str>) -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };

    override_tz
        .and_then(non_empty)
        .or_else(|| std::env::var("TZ").ok().as_deref().and_then(non_empty))
        .or_else(|| Some(chrono::Local::now().offset().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        CredentialStore, MemoryCredentialStore, RefreshInvoker, RefreshToken, SessionEvent,
        SessionEventBus, ACCESS_TOKEN_KEY,
    };
    use crate::error::RefreshError;
    use crate::transport::ReqwestTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    struct StaticInvoker {
        calls: AtomicUsize,
        result: std::result::Result<&'static str, RefreshError>,
    }

    #[async_trait]
    impl RefreshInvoker for StaticInvoker {
        async fn refresh(
            &self,
            _refresh_token: &RefreshToken,
        ) -> std::result::Result<TokenPair, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .map(|token| TokenPair::new(token, None))
        }
    }

    #[derive(Default)]
    struct CountingBus(AtomicUsize);

    impl SessionEventBus for CountingBus {
        fn emit(&self, _event: SessionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        client: AuthenticatedClient,
        invoker: Arc<StaticInvoker>,
        bus: Arc<CountingBus>,
        store: Arc<MemoryCredentialStore>,
    }

    fn harness(base_url: &str, refresh: std::result::Result<&'static str, RefreshError>) -> Harness {
        let store = Arc::new(MemoryCredentialStore::with_tokens("T1", "R1"));
        let invoker = Arc::new(StaticInvoker {
            calls: AtomicUsize::new(0),
            result: refresh,
        });
        let bus = Arc::new(CountingBus::default());
        let arbiter = RefreshArbiter::new(
            store.clone(),
            invoker.clone(),
            bus.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        let transport = Arc::new(ReqwestTransport::new(base_url, 5, 5).unwrap());

        Harness {
            client: AuthenticatedClient::new(transport, arbiter, Some("Europe/Brussels")),
            invoker,
            bus,
            store,
        }
    }

    #[tokio::test]
    async fn test_attaches_token_and_timezone() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/profile")
            .match_header("authorization", "Bearer T1")
            .match_header("x-timezone", "Europe/Brussels")
            .match_header("x-request-id", mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"name":"ada"}"#)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let response = h.client.get("/profile").await.unwrap();

        assert_eq!(response.json::<Value>().unwrap()["name"], "ada");
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_caller_authorization_header_is_replaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/profile")
            .match_header("authorization", "Bearer T1")
            .with_status(200)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let request = ApiRequest::get("/profile")
            .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        h.client.execute(request).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refreshes_and_replays_on_401() {
        let mut server = mockito::Server::new_async().await;
        let expired = server
            .mock("GET", "/tasks")
            .match_header("authorization", "Bearer T1")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/tasks")
            .match_header("authorization", "Bearer T2")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let response = h.client.get("/tasks").await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T2"));
        assert_eq!(h.bus.0.load(Ordering::SeqCst), 0);
        expired.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_final() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tasks")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let err = h.client.get("/tasks").await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::Authorization {
                status: 401,
                refresh: None
            }
        ));
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_authorization_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/tasks")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            Err(RefreshError::Rejected {
                status: 401,
                body: "expired".to_string(),
            }),
        );
        let err = h.client.get("/tasks").await.unwrap_err();

        assert!(err.is_authorization());
        assert!(matches!(
            err.refresh_cause(),
            Some(RefreshError::Rejected { status: 401, .. })
        ));
        assert_eq!(h.bus.0.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_application_error_does_not_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks")
            .with_status(200)
            .with_body(r#"{"error":{"message":"Title is required"}}"#)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let err = h.client.post("/tasks", json!({})).await.unwrap_err();

        match err {
            ClientError::Application { status, message } => {
                assert_eq!(status, 200);
                assert_eq!(message, "Title is required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_statuses_surface_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/tasks/9")
            .with_status(503)
            .with_body("maintenance")
            .expect(1)
            .create_async()
            .await;

        let h = harness(&server.url(), Ok("T2"));
        let err = h.client.delete("/tasks/9").await.unwrap_err();

        assert!(matches!(err, ClientError::Status { status: 503, .. }));
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_error_does_not_refresh() {
        let h = harness("http://127.0.0.1:9", Ok("T2"));
        let err = h.client.get("/tasks").await.unwrap_err();

        assert!(matches!(err, ClientError::Network { .. }));
        assert_eq!(h.invoker.calls.load(Ordering::SeqCst), 0);
    }

    /// Transport that answers the first dispatch with 401 and the rest with 200
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(
                request
                    .headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            );
            let status = if seen.len() == 1 {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::OK
            };
            Ok(ApiResponse::new(status, ""))
        }
    }

    #[tokio::test]
    async fn test_replay_uses_token_from_its_own_refresh() {
        let store = Arc::new(MemoryCredentialStore::with_tokens("T1", "R1"));
        let invoker = Arc::new(StaticInvoker {
            calls: AtomicUsize::new(0),
            result: Ok("T2"),
        });
        let arbiter = RefreshArbiter::new(
            store,
            invoker,
            Arc::new(CountingBus::default()),
            Duration::from_secs(5),
        )
        .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let client = AuthenticatedClient::new(transport.clone(), arbiter.clone(), Some("UTC"));

        let mut request = tokio_test::task::spawn(client.get("/tasks"));
        assert_pending!(request.poll());

        // Refresh resolves, then a new session lands before the replay goes out
        tokio::time::timeout(Duration::from_secs(5), async {
            while arbiter.is_refreshing() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("refresh never completed");
        arbiter
            .sign_in(&TokenPair::new("S1", Some(RefreshToken::new("SR1"))))
            .unwrap();

        let response = assert_ready!(request.poll()).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            *transport.seen.lock().unwrap(),
            vec![Some("Bearer T1".to_string()), Some("Bearer T2".to_string())]
        );
    }

    #[test]
    fn test_application_error_extraction() {
        assert_eq!(application_error(br#"{"error":"boom"}"#).as_deref(), Some("boom"));
        assert_eq!(
            application_error(br#"{"error":{"message":"bad input","code":3}}"#).as_deref(),
            Some("bad input")
        );
        assert_eq!(
            application_error(br#"{"error":{"code":3}}"#).as_deref(),
            Some(r#"{"code":3}"#)
        );
        assert_eq!(application_error(br#"{"error":42}"#).as_deref(), Some("42"));
        assert_eq!(application_error(br#"{"error":null,"data":1}"#), None);
        assert_eq!(application_error(br#"{"error":false}"#), None);
        assert_eq!(application_error(br#"{"data":1}"#), None);
        assert_eq!(application_error(br#"[1,2]"#), None);
        assert_eq!(application_error(b"plain text"), None);
        assert_eq!(application_error(b""), None);
    }

    #[test]
    fn test_client_timezone_prefers_override() {
        assert_eq!(
            client_timezone(Some("Asia/Tokyo")).as_deref(),
            Some("Asia/Tokyo")
        );
        // Blank override falls through to detection, which always yields something
        assert!(client_timezone(Some("  ")).is_some());
        assert!(client_timezone(None).is_some());
    }
}
