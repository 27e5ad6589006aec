//! HTTP Surface of the Relay
//!
//! Routes, CORS headers and the mapping from relay outcomes to HTTP
//! responses. All request semantics live in `relay_core::RelayService`; this
//! module only translates.
//!
//! # Routes
//!
//! ```text
//! POST    /api/chat     relay a chat request (SSE or JSON)
//! POST    /api/openai   same handler, legacy path
//! OPTIONS /api/chat     CORS preflight, 204
//! GET     /health       liveness
//! ```

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use relay_core::relay::{CONFIGURATION_MESSAGE, RATE_LIMIT_MESSAGE};
use relay_core::{client_identifier, RelayError, RelayRequest, RelayResponse, RelayService};

/// Header carrying the rate-limit key (first entry wins)
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Header echoing the request id used in logs
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// The relay pipeline
    pub relay: RelayService,
}

impl AppState {
    /// Wrap a relay service
    #[must_use]
    pub fn new(relay: RelayService) -> Self {
        Self { relay }
    }
}

/// Build the daemon's router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat).options(preflight))
        .route("/api/openai", post(chat).options(preflight))
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let forwarded = headers.get(FORWARDED_FOR).and_then(|v| v.to_str().ok());
    let request = RelayRequest::new(client_identifier(forwarded), body);
    let request_id = request.request_id;

    let mut response = match state.relay.handle(request).await {
        Ok(RelayResponse::Stream(frames)) => sse_response(frames.map(Ok::<_, Infallible>)),
        Ok(RelayResponse::Complete { result }) => Json(json!({ "result": result })).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.relay.backend_name(),
    }))
}

/// Streaming response with SSE headers
fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}

// ============================================================================
// Errors
// ============================================================================

/// HTTP rendering of a [`RelayError`]
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match self.0 {
            RelayError::Validation { message, details } => {
                let mut body = json!({ "error": message });
                if let Some(details) = details {
                    body["details"] = serde_json::to_value(details).unwrap_or_default();
                }
                (status, Json(body)).into_response()
            }
            RelayError::Configuration { .. } => {
                (status, Json(json!({ "error": CONFIGURATION_MESSAGE }))).into_response()
            }
            RelayError::RateLimited(limited) => {
                let mut response =
                    (status, Json(json!({ "error": RATE_LIMIT_MESSAGE }))).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(limited.retry_after.as_secs()),
                );
                headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limited.limit));
                headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
                response
            }
            RelayError::Upstream(reason) => (status, Json(json!({ "error": reason }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    use relay_core::backend::{BackendError, CompletionRequest, EventStream};
    use relay_core::{
        CompletionBackend, CooldownLimiter, RateLimitConfig, RequestPolicy, StreamEvent,
    };

    struct ScriptedBackend {
        events: Vec<StreamEvent>,
        credentials_ok: bool,
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn check_credentials(&self) -> Result<(), BackendError> {
            if self.credentials_ok {
                Ok(())
            } else {
                Err(BackendError::MissingCredential {
                    var: "OPENAI_API_KEY".into(),
                })
            }
        }

        async fn start_completion(&self, _request: &CompletionRequest) -> EventStream {
            Box::pin(futures::stream::iter(self.events.clone()))
        }
    }

    fn hello() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Delta("Hel".into()),
            StreamEvent::Delta("lo!".into()),
            StreamEvent::Done,
        ]
    }

    fn app_with(events: Vec<StreamEvent>, credentials_ok: bool, max_requests: u32) -> Router {
        let relay = RelayService::new(
            Arc::new(ScriptedBackend {
                events,
                credentials_ok,
            }),
            RequestPolicy::default(),
            CooldownLimiter::new(RateLimitConfig {
                enabled: true,
                max_requests,
                cooldown: Duration::from_secs(60),
            }),
        );
        router(AppState::new(relay))
    }

    fn app(events: Vec<StreamEvent>) -> Router {
        app_with(events, true, 15)
    }

    fn chat_request(path: &str, body: &str, client: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(client) = client {
            builder = builder.header(FORWARDED_FOR, client);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    const HI: &str = r#"{"messages":[{"role":"user","content":"Hi"}]}"#;

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn assert_cors(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-methods"], "POST, OPTIONS");
        assert_eq!(
            headers["access-control-allow-headers"],
            "Content-Type, Authorization"
        );
    }

    #[tokio::test]
    async fn test_streaming_hello() {
        let response = app(hello())
            .oneshot(chat_request("/api/chat", HI, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream; charset=utf-8"
        );
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert!(response.headers().contains_key("x-request-id"));
        assert_cors(&response);

        let body = body_bytes(response).await;
        assert_eq!(
            &body[..],
            b"data: \"Hel\"\n\ndata: \"lo!\"\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_legacy_path_and_non_streaming() {
        let body = r#"{"messages":[{"role":"user","content":"Hi"}],"stream":false}"#;
        let response = app(hello())
            .oneshot(chat_request("/api/openai", body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "result": "Hello!" }));
    }

    #[tokio::test]
    async fn test_preflight() {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/chat")
            .body(Body::empty())
            .unwrap();
        let response = app(hello()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_cors(&response);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_body() {
        let response = app(hello())
            .oneshot(chat_request("/api/chat", r#"{"messages":[]}"#, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_cors(&response);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid request format");
        assert_eq!(
            json["details"]["fieldErrors"]["messages"][0],
            "Array must contain at least 1 element(s)"
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let response = app(hello())
            .oneshot(chat_request("/api/chat", "{not json", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request format"));
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn test_missing_credentials_generic_500() {
        let response = app_with(hello(), false, 15)
            .oneshot(chat_request("/api/chat", HI, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Server configuration error" })
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_before_stream() {
        let response = app(vec![StreamEvent::Error("Upstream returned 503: busy".into())])
            .oneshot(chat_request("/api/chat", HI, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Upstream returned 503: busy" })
        );
    }

    #[tokio::test]
    async fn test_rate_limit_per_forwarded_client() {
        let app = app_with(hello(), true, 2);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(chat_request("/api/chat", HI, Some("203.0.113.9, 10.0.0.1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            body_bytes(response).await;
        }

        let response = app
            .clone()
            .oneshot(chat_request("/api/chat", HI, Some("203.0.113.9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_cors(&response);
        let headers = response.headers();
        assert_eq!(headers["retry-after"], "60");
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Rate limit exceeded" })
        );

        // Requests without the header share the fallback identity
        let response = app
            .oneshot(chat_request("/api/chat", HI, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = assert_ok!(app(hello()).oneshot(request).await);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "status": "ok", "backend": "Scripted" })
        );
    }
}
