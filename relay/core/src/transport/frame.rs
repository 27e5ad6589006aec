//! SSE Frame Protocol
//!
//! Wire format between the relay and the chat widget: a minimal subset of
//! Server-Sent Events where every frame carries exactly one [`StreamEvent`].
//!
//! # Frame Format
//!
//! ```text
//! data: "Hel"\n\n                  Delta("Hel")  (payload is a JSON string)
//! data: [DONE]\n\n                 Done
//! event: error\ndata: "..."\n\n    Error(reason)
//! ```
//!
//! Frames are separated by a blank line (`\n\n`; `\r\n\r\n` is accepted on
//! input). Comment lines (`:` prefix) and unknown fields are ignored, so
//! keep-alive pings decode to nothing.
//!
//! # Layers
//!
//! - [`SseDecoder`] splits a byte stream into raw [`SseFrame`]s. The upstream
//!   OpenAI-compatible adapter uses it directly, since provider payloads are
//!   JSON objects rather than JSON strings.
//! - [`FrameDecoder`] turns raw frames into [`StreamEvent`]s and stops after the
//!   first terminal event.
//! - [`decode`] is the stateless form: decode every complete frame of a buffer
//!   and hand back the undecoded remainder.
//!
//! # Security
//!
//! - Encoded payloads are capped at [`MAX_FRAME_SIZE`]
//! - A partial frame growing past [`MAX_PENDING_FRAME`] without a delimiter
//!   is reported as [`FrameError::Overflow`] instead of buffering forever

use bytes::Bytes;
use thiserror::Error;

use crate::messages::StreamEvent;

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest undelimited frame a decoder holds back
///
/// The biggest frame [`encode`] writes (an error frame with a
/// `MAX_FRAME_SIZE` payload) plus a partially received CRLF delimiter.
pub const MAX_PENDING_FRAME: usize =
    MAX_FRAME_SIZE + "event: error\ndata: ".len() + "\r\n\r\n".len();

/// Minimum buffer capacity for decoders
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Payload marking the end of a successful stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Event name of error frames
pub const ERROR_EVENT: &str = "error";

/// Errors produced while encoding or decoding frames
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame payload is not a JSON string
    #[error("Malformed frame payload: {0}")]
    Malformed(String),

    /// The frame bytes are not valid UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// The payload to encode exceeds the frame limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Encoded payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Buffered bytes exceed the frame limit with no delimiter in sight
    #[error("Unterminated frame exceeds {max} bytes")]
    Overflow {
        /// Configured maximum
        max: usize,
    },

    /// JSON serialization failed
    #[error("Failed to serialize frame payload: {0}")]
    Serialization(String),
}

impl FrameError {
    /// Whether the stream cannot continue after this error
    ///
    /// Per-frame errors only cost the offending frame; an overflow means the
    /// delimiter structure is lost.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode one event as a complete SSE frame
///
/// # Errors
///
/// Returns `FrameError::TooLarge` if the JSON payload exceeds `MAX_FRAME_SIZE`.
pub fn encode(event: &StreamEvent) -> Result<Bytes, FrameError> {
    let frame = match event {
        StreamEvent::Delta(text) => format!("data: {}\n\n", json_payload(text)?),
        StreamEvent::Done => format!("data: {DONE_SENTINEL}\n\n"),
        StreamEvent::Error(reason) => {
            format!("event: {ERROR_EVENT}\ndata: {}\n\n", json_payload(reason)?)
        }
    };
    Ok(Bytes::from(frame))
}

fn json_payload(text: &str) -> Result<String, FrameError> {
    let json =
        serde_json::to_string(text).map_err(|e| FrameError::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(json)
}

// =============================================================================
// Raw SSE frames
// =============================================================================

/// A decoded SSE frame before payload interpretation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any
    pub event: Option<String>,
    /// Concatenated `data:` lines
    pub data: String,
}

impl SseFrame {
    /// Interpret the frame as a relay [`StreamEvent`]
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Malformed` when a data frame does not carry a JSON
    /// string.
    pub fn into_event(self) -> Result<StreamEvent, FrameError> {
        if self.event.as_deref() == Some(ERROR_EVENT) {
            let reason = serde_json::from_str::<String>(&self.data).unwrap_or(self.data);
            return Ok(StreamEvent::Error(reason));
        }

        if self.data.trim() == DONE_SENTINEL {
            return Ok(StreamEvent::Done);
        }

        serde_json::from_str::<String>(&self.data)
            .map(StreamEvent::Delta)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    }
}

/// Find the end of the first complete frame in `buf`
///
/// Returns `(frame_len, consumed)` where `consumed` includes the delimiter.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &byte) in buf.iter().enumerate() {
        if byte != b'\n' {
            continue;
        }
        match buf.get(i + 1) {
            Some(b'\n') => return Some((i, i + 2)),
            Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
            _ => {}
        }
    }
    None
}

/// Parse the lines of one frame; `Ok(None)` for frames without data lines
fn parse_frame(bytes: &[u8]) -> Result<Option<SseFrame>, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)?;

    let mut event = None;
    let mut data: Option<String> = None;

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "event" => event = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(data.map(|data| SseFrame { event, data }))
}

/// Incremental splitter for raw SSE frames
///
/// Buffers incoming bytes and yields complete frames; bytes of a frame that
/// has not seen its delimiter yet stay buffered across calls.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes past `read_pos` already known not to start a delimiter
    scanned: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scanned: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos == self.buffer.len() {
            self.buffer.clear();
            self.read_pos = 0;
        } else if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            // Compact buffer if we've consumed a lot
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Some(Ok(frame))` for a complete frame
    /// - `Some(Err(..))` for a frame that could not be parsed (it is consumed)
    /// - `None` if more data is needed
    pub fn next_frame(&mut self) -> Option<Result<SseFrame, FrameError>> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            // Re-check the tail: a delimiter may straddle the previous push
            let start = self.scanned.saturating_sub(2);

            let Some((end, consumed)) = find_frame_end(&pending[start..]) else {
                let pending_len = pending.len();
                self.scanned = pending_len;
                if pending_len > MAX_PENDING_FRAME {
                    self.clear();
                    return Some(Err(FrameError::Overflow {
                        max: MAX_PENDING_FRAME,
                    }));
                }
                return None;
            };

            let result = parse_frame(&pending[..start + end]);
            self.read_pos += start + consumed;
            self.scanned = 0;

            match result {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scanned = 0;
    }
}

// =============================================================================
// StreamEvent decoding
// =============================================================================

/// Resumable decoder from SSE bytes to [`StreamEvent`]s
///
/// Once a terminal event has been decoded the decoder is finished: further
/// input is ignored and no more events are produced.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    frames: SseDecoder,
    finished: bool,
}

impl FrameDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if !self.finished {
            self.frames.push(data);
        }
    }

    /// Try to decode the next event
    ///
    /// Returns `None` when more data is needed or the stream is finished.
    /// A `Some(Err(..))` that is not [`FrameError::is_fatal`] only skips that
    /// frame; keep calling to get the following events.
    pub fn next_event(&mut self) -> Option<Result<StreamEvent, FrameError>> {
        if self.finished {
            return None;
        }

        let result = self.frames.next_frame()?.and_then(SseFrame::into_event);

        let stop = match &result {
            Ok(event) => event.is_terminal(),
            Err(e) => e.is_fatal(),
        };
        if stop {
            self.finished = true;
            self.frames.clear();
        }

        Some(result)
    }

    /// Whether a terminal event (or fatal error) has been decoded
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of buffered bytes not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.frames.available()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Result of stateless decoding
#[derive(Debug)]
pub struct Decoded<'a> {
    /// Events of every complete frame, in order
    pub events: Vec<StreamEvent>,
    /// Frames that were skipped because they could not be decoded
    pub skipped: Vec<FrameError>,
    /// Bytes not yet forming a complete frame
    pub remainder: &'a [u8],
    /// Whether a terminal event was reached (decoding stopped there)
    pub done: bool,
}

/// Decode every complete frame in `buffer`
///
/// Stops at the first terminal event; `remainder` then holds whatever
/// followed it.
#[must_use]
pub fn decode(buffer: &[u8]) -> Decoded<'_> {
    let mut events = Vec::new();
    let mut skipped = Vec::new();
    let mut pos = 0;
    let mut done = false;

    while let Some((end, consumed)) = find_frame_end(&buffer[pos..]) {
        let frame = &buffer[pos..pos + end];
        pos += consumed;

        match parse_frame(frame).and_then(|f| f.map(SseFrame::into_event).transpose()) {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    done = true;
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => skipped.push(e),
        }
    }

    Decoded {
        events,
        skipped,
        remainder: &buffer[pos..],
        done,
    }
}
