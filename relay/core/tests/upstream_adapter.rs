//! Upstream adapter tests against a local mock provider
//!
//! Each test starts a throwaway axum server on an ephemeral port that speaks
//! the provider's wire format, then drives a real backend against it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use relay_core::backend::{
    build_backend, BackendConfig, CompletionBackend, CompletionRequest, Credential,
};
use relay_core::{ChatMessage, StreamEvent};

// ============================================================================
// Helpers
// ============================================================================

async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Body written as the given chunks, one write each
fn bytes_body(chunks: Vec<Bytes>) -> Body {
    Body::from_stream(futures::stream::iter(
        chunks.into_iter().map(Ok::<_, Infallible>),
    ))
}

fn chunked(chunks: Vec<&'static str>) -> Body {
    bytes_body(
        chunks
            .into_iter()
            .map(|c| Bytes::from_static(c.as_bytes()))
            .collect(),
    )
}

fn sse_response(chunks: Vec<&'static str>) -> Response {
    ([("content-type", "text/event-stream")], chunked(chunks)).into_response()
}

fn openai_backend(addr: SocketAddr) -> Arc<dyn CompletionBackend> {
    let config = BackendConfig::openai()
        .with_base_url(format!("http://{addr}/v1"))
        .with_credential(Credential::Static("sk-test".into()));
    build_backend(&config, Duration::from_secs(5)).unwrap()
}

fn request() -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::user("Say hello")], "gpt-4-turbo")
}

async fn run(backend: &dyn CompletionBackend) -> Vec<StreamEvent> {
    let events = async {
        let request = request();
        backend.start_completion(&request).await.collect::<Vec<_>>().await
    };
    tokio::time::timeout(Duration::from_secs(10), events)
        .await
        .expect("adapter stream did not finish")
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

#[tokio::test]
async fn test_openai_chunks_split_across_reads() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|headers: HeaderMap, body: Bytes| async move {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            if auth != "Bearer sk-test" || json["stream"] != true {
                return StatusCode::BAD_REQUEST.into_response();
            }

            sse_response(vec![
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
                "\ndata: {\"choices\":[{\"delta\":{\"cont",
                "ent\":\"lo!\"}}]}\n\n: keep-alive\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DO",
                "NE]\n\n",
            ])
        }),
    );
    let addr = spawn_upstream(router).await;

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("Hel".into()),
            StreamEvent::Delta("lo!".into()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_openai_multibyte_split_and_malformed_chunk() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\n".as_bytes();
            // Split inside the two-byte 'é'
            let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;
            let body = bytes_body(vec![
                Bytes::from_static(b"data: {oops\n\n"),
                Bytes::copy_from_slice(&frame[..split]),
                Bytes::copy_from_slice(&frame[split..]),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ]);
            ([("content-type", "text/event-stream")], body).into_response()
        }),
    );
    let addr = spawn_upstream(router).await;

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(
        events,
        vec![StreamEvent::Delta("café".into()), StreamEvent::Done]
    );
}

#[tokio::test]
async fn test_openai_non_success_status_is_single_error() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                r#"{"error":{"message":"Incorrect API key provided"}}"#,
            )
        }),
    );
    let addr = spawn_upstream(router).await;

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(reason) => assert!(reason.contains("401"), "{reason}"),
        other => panic!("Expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_openai_error_object_mid_stream() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse_response(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n",
                "data: {\"error\":{\"message\":\"server overloaded\"}}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
            ])
        }),
    );
    let addr = spawn_upstream(router).await;

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("par".into()),
            StreamEvent::Error("server overloaded".into()),
        ]
    );
}

#[tokio::test]
async fn test_openai_missing_done_still_terminates() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            sse_response(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n"])
        }),
    );
    let addr = spawn_upstream(router).await;

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(
        events,
        vec![StreamEvent::Delta("x".into()), StreamEvent::Done]
    );
}

#[tokio::test]
async fn test_connection_refused_is_single_error() {
    // Reserve a port, then close it so nothing listens there
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let events = run(openai_backend(addr).as_ref()).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error(_)));
}

/// Fires its notify when the response body is dropped by the server
struct DropSignal(Arc<Notify>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

#[tokio::test]
async fn test_dropping_stream_closes_upstream() {
    let dropped = Arc::new(Notify::new());
    let signal = dropped.clone();

    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let guard = DropSignal(signal.clone());
            async move {
                let first = futures::stream::once(async {
                    Ok::<_, Infallible>(Bytes::from_static(
                        b"data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n",
                    ))
                });
                let body = first.chain(futures::stream::pending()).map(move |item| {
                    let _alive = &guard;
                    item
                });
                ([("content-type", "text/event-stream")], Body::from_stream(body)).into_response()
            }
        }),
    );
    let addr = spawn_upstream(router).await;

    let backend = openai_backend(addr);
    let mut events = backend.start_completion(&request()).await;
    assert_eq!(events.next().await, Some(StreamEvent::Delta("first".into())));
    drop(events);

    tokio::time::timeout(Duration::from_secs(5), dropped.notified())
        .await
        .expect("upstream response was not closed after the consumer went away");
}

// ============================================================================
// Ollama
// ============================================================================

#[tokio::test]
async fn test_ollama_ndjson_stream() {
    let router = Router::new().route(
        "/api/chat",
        post(|body: Bytes| async move {
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["messages"][0]["content"], "Say hello");
            chunked(vec![
                "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n{\"mess",
                "age\":{\"role\":\"assistant\",\"content\":\"lo!\"},\"done\":false}\n",
                "not json\n",
                "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
            ])
        }),
    );
    let addr = spawn_upstream(router).await;

    let backend = build_backend(
        &BackendConfig::ollama("127.0.0.1", addr.port()),
        Duration::from_secs(5),
    )
    .unwrap();
    let events = run(backend.as_ref()).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("Hel".into()),
            StreamEvent::Delta("lo!".into()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_ollama_model_error() {
    let router = Router::new().route(
        "/api/chat",
        post(|| async {
            (
                StatusCode::NOT_FOUND,
                r#"{"error":"model 'llama9' not found"}"#,
            )
        }),
    );
    let addr = spawn_upstream(router).await;

    let backend = build_backend(
        &BackendConfig::ollama("127.0.0.1", addr.port()),
        Duration::from_secs(5),
    )
    .unwrap();
    let events = run(backend.as_ref()).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(r) if r.contains("404")));
}
