//! Relay Integration
//!
//! HTTP client for the relay daemon and the reader for its SSE replies.

mod client;
mod reader;

pub use client::{ByteStream, ClientError, RelayClient, DEFAULT_RELAY_URL};
pub use reader::StreamReader;
