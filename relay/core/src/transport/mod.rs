//! Transport Layer
//!
//! Wire framing shared by the relay (encoding side) and the chat widget
//! (decoding side). The HTTP plumbing itself lives in the daemon and the
//! widget client; this module is pure and does no I/O.

pub mod frame;

// Re-exports for convenience
pub use frame::{
    decode, encode, Decoded, FrameDecoder, FrameError, SseDecoder, SseFrame, DONE_SENTINEL,
    MAX_FRAME_SIZE, MAX_PENDING_FRAME,
};
