//! Chat Session
//!
//! Drives one request at a time from submit to resolved entry:
//! [`Transcript::submit`] → [`RelayClient::stream_chat`] → [`StreamReader`]
//! → [`Transcript::apply`]. Renderers follow along through
//! [`WidgetUpdate`]s.
//!
//! [`StreamReader`]: crate::backend::StreamReader

use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::{ChatMessage, StreamEvent};

use crate::backend::RelayClient;
use crate::transcript::{EntryId, Outcome, Sender, Transcript, TranscriptError};

/// Progress notifications for a renderer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WidgetUpdate {
    /// An entry was appended (the bot entry starts empty and loading)
    EntryAdded {
        /// New entry
        id: EntryId,
        /// Author
        sender: Sender,
        /// Initial text
        text: String,
    },
    /// Text appended to the loading entry
    Token {
        /// Loading entry
        id: EntryId,
        /// Appended text
        text: String,
    },
    /// The loading entry was resolved
    StreamEnd {
        /// Resolved entry
        id: EntryId,
        /// Final text of the entry
        text: String,
        /// How it was resolved
        outcome: Outcome,
    },
    /// The request or stream failed; a `StreamEnd` follows
    StreamError {
        /// Affected entry
        id: EntryId,
        /// Failure detail (not shown in the transcript)
        message: String,
    },
}

/// A conversation bound to one relay
pub struct ChatSession {
    client: RelayClient,
    transcript: Transcript,
    updates: Option<mpsc::Sender<WidgetUpdate>>,
}

impl ChatSession {
    /// New session starting from the greeting
    #[must_use]
    pub fn new(client: RelayClient) -> Self {
        Self {
            client,
            transcript: Transcript::new(),
            updates: None,
        }
    }

    /// Publish progress to a renderer
    #[must_use]
    pub fn with_updates(mut self, updates: mpsc::Sender<WidgetUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// The conversation so far
    #[must_use]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    async fn publish(&self, update: WidgetUpdate) {
        if let Some(tx) = &self.updates {
            // Renderer gone: keep the transcript going regardless
            let _ = tx.send(update).await;
        }
    }

    /// Send a message and wait until its reply entry is resolved
    ///
    /// `cancel` resolving first stops the request; the partial reply is kept.
    ///
    /// # Errors
    ///
    /// Only the transcript's own rejections ([`TranscriptError::Busy`],
    /// [`TranscriptError::EmptyInput`]). Relay failures resolve the entry
    /// with [`Outcome::Failed`] instead.
    pub async fn send<C>(&mut self, text: &str, cancel: C) -> Result<Outcome, TranscriptError>
    where
        C: Future<Output = ()>,
    {
        let ids = self.transcript.submit(text)?;
        for id in [ids.user, ids.reply] {
            if let Some(entry) = self.transcript.get(id) {
                let update = WidgetUpdate::EntryAdded {
                    id,
                    sender: entry.sender(),
                    text: entry.text().to_string(),
                };
                self.publish(update).await;
            }
        }

        let history = self.transcript.history();
        tokio::pin!(cancel);

        let finished = tokio::select! {
            outcome = self.stream_reply(ids.reply, &history) => Some(outcome),
            () = &mut cancel => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                debug!(entry = %ids.reply, "Reply cancelled");
                self.transcript.cancel();
                Outcome::Cancelled
            }
        };

        let text = self
            .transcript
            .get(ids.reply)
            .map(|e| e.text().to_string())
            .unwrap_or_default();
        self.publish(WidgetUpdate::StreamEnd {
            id: ids.reply,
            text,
            outcome,
        })
        .await;

        Ok(outcome)
    }

    async fn stream_reply(&mut self, id: EntryId, history: &[ChatMessage]) -> Outcome {
        let mut reader = match self.client.stream_chat(history).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "Chat request failed");
                self.publish(WidgetUpdate::StreamError {
                    id,
                    message: e.to_string(),
                })
                .await;
                let _ = self.transcript.fail(id);
                return Outcome::Failed;
            }
        };

        while let Some(event) = reader.next_event().await {
            match &event {
                StreamEvent::Delta(text) => {
                    self.publish(WidgetUpdate::Token {
                        id,
                        text: text.clone(),
                    })
                    .await;
                }
                StreamEvent::Error(reason) => {
                    warn!(reason = %reason, "Relay reported a stream error");
                    self.publish(WidgetUpdate::StreamError {
                        id,
                        message: reason.clone(),
                    })
                    .await;
                }
                StreamEvent::Done => {}
            }

            if let Err(e) = self.transcript.apply(id, event) {
                warn!(error = %e, "Dropping event for resolved entry");
                break;
            }
        }

        if self.transcript.loading().is_some_and(|e| e.id() == id) {
            debug!(entry = %id, "Stream ended without a terminal event");
            return self
                .transcript
                .finish_interrupted(id)
                .unwrap_or(Outcome::Failed);
        }

        self.transcript
            .get(id)
            .and_then(|e| e.outcome())
            .unwrap_or(Outcome::Failed)
    }
}
