//! Relay Messages
//!
//! The two value types that flow through the relay: the chat history sent
//! upstream ([`ChatMessage`]) and the incremental events coming back
//! ([`StreamEvent`]).
//!
//! # Ordering
//!
//! A conversation is an ordered `Vec<ChatMessage>`; the relay never reorders
//! it. A response is an ordered sequence of [`StreamEvent`]s where every
//! `Delta` precedes exactly one terminal event (`Done` or `Error`).

use serde::{Deserialize, Serialize};

/// Who authored a chat message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user input
    User,
    /// Model output
    Assistant,
    /// Instructions for the model
    System,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of the conversation history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message with an explicit role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

/// One logical event of a streamed completion
///
/// Produced by an upstream adapter, carried one-per-frame on the wire and
/// consumed by the client reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of the assistant's response text
    Delta(String),
    /// The response completed successfully
    Done,
    /// The response failed; no further events follow
    Error(String),
}

impl StreamEvent {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Text carried by a `Delta`
    #[must_use]
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::Delta(text) => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let result = serde_json::from_str::<ChatMessage>(r#"{"role":"tool","content":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_terminal_events() {
        assert!(!StreamEvent::Delta("a".into()).is_terminal());
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error("boom".into()).is_terminal());
        assert_eq!(StreamEvent::Delta("a".into()).as_delta(), Some("a"));
        assert_eq!(StreamEvent::Done.as_delta(), None);
    }
}
