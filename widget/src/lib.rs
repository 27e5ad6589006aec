//! Chat Widget - Client side of the chat relay
//!
//! Everything a chat front end needs to talk to the relay daemon: the HTTP
//! client, the incremental SSE reader and the transcript that turns stream
//! events into a conversation. The `chat-widget` binary is a line-oriented
//! terminal front end built on top.
//!
//! # Architecture
//!
//! - **Backend**: [`RelayClient`] posts the conversation, [`StreamReader`]
//!   decodes the reply
//! - **Transcript**: ordered entries with at most one loading reply
//! - **Chat**: [`ChatSession`] wires the two together and publishes
//!   [`WidgetUpdate`]s
//! - **Display**: `textwrap` rendering for terminals

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod chat;
pub mod display;
pub mod transcript;

pub use backend::{ClientError, RelayClient, StreamReader, DEFAULT_RELAY_URL};
pub use chat::{ChatSession, WidgetUpdate};
pub use transcript::{
    EntryId, EntryStatus, Outcome, Phase, Sender, Submitted, Transcript, TranscriptEntry,
    TranscriptError, CANCELLED_NOTICE, FAILURE_MESSAGE, GREETING,
};
