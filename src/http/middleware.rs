//! Rate limiting middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::FailurePolicy;
use crate::ratelimit::{Identifier, RateLimiter};

/// Header carrying the client's API token.
pub const API_KEY_HEADER: &str = "api_key";

/// Body message of a rejected request.
pub const REJECTION_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// State shared by every request passing through the middleware.
#[derive(Clone)]
pub struct AppState {
    /// The rate limiter instance
    pub limiter: Arc<RateLimiter>,
    /// What to do when the counter store fails
    pub failure_policy: FailurePolicy,
}

impl AppState {
    /// Create the shared state.
    pub fn new(limiter: Arc<RateLimiter>, failure_policy: FailurePolicy) -> Self {
        Self {
            limiter,
            failure_policy,
        }
    }
}

/// Admit or reject a request according to its identifier's quota.
///
/// The identifier is the `API_KEY` header when present and non-blank,
/// otherwise the peer IP address. Rejections are `429 Too Many Requests`
/// with a `Retry-After` header in whole seconds.
#[instrument(
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identifier = request_identifier(&request);

    match state.limiter.allow(&identifier).await {
        Ok(decision) if decision.admitted => next.run(request).await,
        Ok(decision) => {
            debug!(
                identifier = %identifier,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rejecting request"
            );
            too_many_requests(Some(decision.retry_after))
        }
        Err(e) => match state.failure_policy {
            FailurePolicy::Open => {
                warn!(identifier = %identifier, error = %e, "Counter store failed, admitting request");
                next.run(request).await
            }
            FailurePolicy::Closed => {
                warn!(identifier = %identifier, error = %e, "Counter store failed, rejecting request");
                too_many_requests(None)
            }
        },
    }
}

fn request_identifier(request: &Request) -> Identifier {
    let token = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    Identifier::resolve(token, addr)
}

fn too_many_requests(retry_after: Option<Duration>) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "message": REJECTION_MESSAGE })),
    )
        .into_response();

    if let Some(retry_after) = retry_after.filter(|d| !d.is_zero()) {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after_secs(retry_after)),
        );
    }

    response
}

/// Whole seconds, rounded up so clients never retry too early.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::error::{Result, TurnstileError};
    use crate::http::router;
    use crate::ratelimit::{CounterStore, Decision, MemoryStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::Router;
    use tower::ServiceExt;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn decide(
            &self,
            _identifier: &Identifier,
            _limit: u64,
            _window: Duration,
            _block_duration: Duration,
        ) -> Result<Decision> {
            Err(TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn app(store: Arc<dyn CounterStore>, config: &RateLimitingConfig) -> Router {
        let limiter = Arc::new(RateLimiter::new(store, config));
        router(AppState::new(limiter, config.failure_policy))
    }

    fn memory_app(default_limit: u64, token_limits: &[(&str, u64)]) -> Router {
        let mut config = RateLimitingConfig {
            default_limit,
            block_duration_secs: 5,
            window_ms: 60_000,
            ..RateLimitingConfig::default()
        };
        for (token, limit) in token_limits {
            config.token_limits.insert(token.to_string(), *limit);
        }
        app(Arc::new(MemoryStore::new()), &config)
    }

    fn request_from(ip: [u8; 4], token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/");
        if let Some(token) = token {
            builder = builder.header(API_KEY_HEADER, token);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_ip_rate_limiting() {
        let app = memory_app(3, &[]);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request_from([127, 0, 0, 1], None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request_from([127, 0, 0, 1], None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
        assert!(body_string(response).await.contains("you have reached the maximum"));

        // Another address still has its own quota.
        let response = app.oneshot(request_from([10, 0, 0, 2], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_rate_limiting() {
        let app = memory_app(1, &[("testtoken", 5)]);

        for i in 1..=5 {
            let response = app
                .clone()
                .oneshot(request_from([127, 0, 0, 1], Some("testtoken")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {} should pass", i);
        }

        let response = app
            .clone()
            .oneshot(request_from([127, 0, 0, 1], Some("testtoken")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // The token's usage does not count against the address.
        let response = app.oneshot(request_from([127, 0, 0, 1], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_peer_address_uses_unknown() {
        let app = memory_app(1, &[]);

        let request = || HttpRequest::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_store_failure_closed_rejects() {
        let config = RateLimitingConfig::default();
        let app = app(Arc::new(FailingStore), &config);

        let response = app.oneshot(request_from([127, 0, 0, 1], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_store_failure_open_admits() {
        let config = RateLimitingConfig {
            failure_policy: FailurePolicy::Open,
            ..RateLimitingConfig::default()
        };
        let app = app(Arc::new(FailingStore), &config);

        let response = app.oneshot(request_from([127, 0, 0, 1], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failure_warns_once() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = app(Arc::new(FailingStore), &RateLimitingConfig::default());
        let response = app.oneshot(request_from([127, 0, 0, 1], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warnings = output.lines().filter(|line| line.contains("WARN")).count();
        assert_eq!(warnings, 1, "unexpected log output:\n{}", output);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(10)), 10);
        assert_eq!(retry_after_secs(Duration::from_millis(4200)), 5);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
    }
}
