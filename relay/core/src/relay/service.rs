//! Relay Service
//!
//! Drives one chat request from raw body to response: admission, credential
//! check, validation, upstream call, and either a frame stream or a single
//! collected answer.
//!
//! # Processing Order
//!
//! 1. Rate-limit admission (rejections take no slot)
//! 2. Credential check
//! 3. Body validation
//! 4. Upstream call
//!
//! Steps 2-4 run under an admitted [`RatePermit`], so a misconfigured relay or
//! a bad body still costs the client a slot.
//!
//! # Streaming
//!
//! The first upstream event is awaited before anything is committed. An
//! immediate `Error` is still reported as a plain 500; after that, failures
//! travel in-band as an error frame.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use super::error::RelayError;
use super::rate_limit::{CooldownLimiter, RatePermit};
use super::validation::RequestPolicy;
use crate::backend::{CompletionBackend, EventStream};
use crate::messages::StreamEvent;
use crate::transport::encode;

/// Answer used in non-streaming mode when the provider produced no text
pub const FALLBACK_RESULT: &str = "No response was generated. Please try again.";

/// Client identifier used when no forwarding header is present
pub const FALLBACK_CLIENT: &str = "127.0.0.1";

/// Written instead of a frame that could not be encoded
const ENCODE_FAILURE_FRAME: &[u8] =
    b"event: error\ndata: \"Response frame could not be encoded\"\n\n";

/// Derive the rate-limit key from an `X-Forwarded-For` value
///
/// The first (client-most) address wins.
#[must_use]
pub fn client_identifier(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .unwrap_or(FALLBACK_CLIENT)
        .to_string()
}

/// One incoming relay request
#[derive(Clone, Debug)]
pub struct RelayRequest {
    /// Correlates log lines of this request
    pub request_id: Uuid,
    /// Rate-limit key
    pub client: String,
    /// Raw request body
    pub body: Bytes,
}

impl RelayRequest {
    /// Create a request with a fresh id
    pub fn new(client: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: client.into(),
            body: body.into(),
        }
    }
}

/// Successful outcome of a relay request
pub enum RelayResponse {
    /// Stream frames to the client
    Stream(FrameStream),
    /// Complete answer (`stream: false`)
    Complete {
        /// Concatenated response text
        result: String,
    },
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("RelayResponse::Stream"),
            Self::Complete { result } => f
                .debug_struct("RelayResponse::Complete")
                .field("result", result)
                .finish(),
        }
    }
}

/// The relay: one backend, one policy, one limiter
#[derive(Clone)]
pub struct RelayService {
    backend: Arc<dyn CompletionBackend>,
    policy: RequestPolicy,
    limiter: CooldownLimiter,
}

impl RelayService {
    /// Create a relay service
    #[must_use]
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        policy: RequestPolicy,
        limiter: CooldownLimiter,
    ) -> Self {
        Self {
            backend,
            policy,
            limiter,
        }
    }

    /// The rate limiter (shared with the sweep task)
    #[must_use]
    pub fn limiter(&self) -> &CooldownLimiter {
        &self.limiter
    }

    /// Validation rules in force
    #[must_use]
    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    /// Name of the upstream backend
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Handle one request
    ///
    /// # Errors
    ///
    /// Returns the single [`RelayError`] that ended the request.
    pub async fn handle(&self, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        let span = tracing::info_span!(
            "relay_request",
            request_id = %request.request_id,
            client = %request.client,
        );
        self.process(request).instrument(span).await
    }

    async fn process(&self, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        let permit = self.limiter.try_acquire(&request.client).map_err(|limited| {
            info!(
                retry_after_secs = limited.retry_after.as_secs(),
                "Rate limit exceeded"
            );
            RelayError::from(limited)
        })?;

        if let Err(e) = self.backend.check_credentials() {
            error!(backend = self.backend.name(), error = %e, "Upstream credentials unavailable");
            return Err(RelayError::Configuration {
                cause: e.to_string(),
            });
        }

        let validated = self.policy.validate(&request.body).map_err(|e| {
            debug!(error = %e, "Rejected request body");
            e
        })?;

        info!(
            backend = self.backend.name(),
            model = %validated.completion.model,
            messages = validated.completion.messages.len(),
            stream = validated.stream,
            "Relaying completion"
        );

        let events = self.backend.start_completion(&validated.completion).await;
        if validated.stream {
            Self::open_stream(events, permit).await
        } else {
            Self::collect(events, permit).await
        }
    }

    async fn open_stream(
        mut events: EventStream,
        permit: RatePermit,
    ) -> Result<RelayResponse, RelayError> {
        match events.next().await {
            Some(StreamEvent::Error(reason)) => {
                warn!(%reason, "Upstream failed before streaming started");
                Err(RelayError::Upstream(reason))
            }
            first => Ok(RelayResponse::Stream(FrameStream::new(
                first,
                events,
                permit,
                Span::current(),
            ))),
        }
    }

    async fn collect(
        mut events: EventStream,
        permit: RatePermit,
    ) -> Result<RelayResponse, RelayError> {
        let mut result = String::new();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Delta(text) => result.push_str(&text),
                StreamEvent::Done => break,
                StreamEvent::Error(reason) => {
                    warn!(%reason, "Upstream failed");
                    return Err(RelayError::Upstream(reason));
                }
            }
        }
        permit.complete();

        if result.is_empty() {
            debug!("Upstream produced no text, using fallback");
            result = FALLBACK_RESULT.to_string();
        }
        Ok(RelayResponse::Complete { result })
    }
}

// ============================================================================
// Frame Stream
// ============================================================================

struct WriterState {
    /// Event received before the stream was handed out
    pending: Option<StreamEvent>,
    events: EventStream,
    /// Released when the terminal frame is written or the stream is dropped
    permit: Option<RatePermit>,
    finished: bool,
    deltas: usize,
    span: Span,
}

/// Encoded SSE frames of one response, one chunk per event
///
/// Events are pulled from the backend only as frames are consumed. Dropping
/// the stream drops the backend stream (closing the upstream call) and the
/// rate permit.
pub struct FrameStream {
    inner: BoxStream<'static, Bytes>,
}

impl FrameStream {
    fn new(
        first: Option<StreamEvent>,
        events: EventStream,
        permit: RatePermit,
        span: Span,
    ) -> Self {
        let state = WriterState {
            pending: first,
            events,
            permit: Some(permit),
            finished: false,
            deltas: 0,
            span,
        };

        let inner = futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }

            let event = match state.pending.take() {
                Some(event) => event,
                None => state.events.next().await.unwrap_or_else(|| {
                    state.span.in_scope(|| debug!("Upstream ended without terminal event"));
                    StreamEvent::Done
                }),
            };

            let frame = match encode(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    state.span.in_scope(|| warn!(error = %e, "Dropping unencodable event"));
                    state.finished = true;
                    Bytes::from_static(ENCODE_FAILURE_FRAME)
                }
            };

            match &event {
                StreamEvent::Delta(_) => state.deltas += 1,
                StreamEvent::Done => {
                    state.span.in_scope(|| info!(deltas = state.deltas, "Stream complete"));
                }
                StreamEvent::Error(reason) => {
                    state.span.in_scope(|| {
                        warn!(deltas = state.deltas, %reason, "Stream ended with upstream error");
                    });
                }
            }

            if event.is_terminal() || state.finished {
                state.finished = true;
                if let Some(permit) = state.permit.take() {
                    permit.complete();
                }
            }

            Some((frame, state))
        });

        Self {
            inner: inner.boxed(),
        }
    }
}

impl Stream for FrameStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
