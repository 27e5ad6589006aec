//! Transcript Reconciler
//!
//! The conversation as the user sees it. A submitted message appends a
//! completed user entry plus an empty loading bot entry; stream events then
//! grow that entry until a terminal event (or a cancel) freezes it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──submit──► AwaitingFirstDelta ──Delta──► Streaming ──Delta──► Streaming
//!  ▲                      │                          │
//!  └──── Done / Error / cancel / finish_interrupted ─┘
//! ```
//!
//! At most one entry is loading at a time and it is always the last one.
//! Entries are never removed or reordered.

use std::fmt;

use thiserror::Error;

use relay_core::{ChatMessage, StreamEvent};

/// First entry of every transcript
pub const GREETING: &str = "Hello! How can I assist you today?";

/// Text shown when a reply could not be produced
pub const FAILURE_MESSAGE: &str = "Oops! Something went wrong. Please try again later.";

/// Text shown when the user cancelled before any text arrived
pub const CANCELLED_NOTICE: &str = "(Response cancelled)";

/// Identity of a transcript entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry_{}", self.0)
    }
}

/// Who wrote an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sender {
    /// The person typing
    User,
    /// The assistant
    Bot,
}

/// Whether an entry can still change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    /// Waiting for (more) stream events
    Loading,
    /// Frozen
    Complete,
}

/// How a bot entry was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The reply arrived (possibly cut short by the transport)
    Answered,
    /// Nothing usable arrived, or the relay reported an error
    Failed,
    /// The user cancelled the request
    Cancelled,
}

/// Where the transcript is in the request lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No request outstanding
    Idle,
    /// Loading entry exists but is still empty
    AwaitingFirstDelta,
    /// Loading entry has received text
    Streaming,
}

/// Rejected transcript operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    /// A reply is still loading
    #[error("A reply is still loading")]
    Busy,

    /// Submitted text was blank
    #[error("Message is empty")]
    EmptyInput,

    /// Event addressed to an entry that is not loading
    #[error("Entry {id} is not loading")]
    StaleEntry {
        /// The addressed entry
        id: EntryId,
    },
}

/// One line of the conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptEntry {
    id: EntryId,
    sender: Sender,
    text: String,
    status: EntryStatus,
    outcome: Option<Outcome>,
}

impl TranscriptEntry {
    /// Entry identity
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Author
    #[must_use]
    pub fn sender(&self) -> Sender {
        self.sender
    }

    /// Current text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Loading or complete
    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// Resolution of a completed bot entry; `None` for user entries and
    /// while loading
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Whether the entry is still loading
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.status == EntryStatus::Loading
    }
}

/// The submitted pair returned by [`Transcript::submit`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submitted {
    /// The completed user entry
    pub user: EntryId,
    /// The loading bot entry stream events must target
    pub reply: EntryId,
}

/// Ordered conversation with a single-loading-entry invariant
#[derive(Clone, Debug)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// New transcript holding only the greeting
    #[must_use]
    pub fn new() -> Self {
        let mut transcript = Self {
            entries: Vec::new(),
            next_id: 0,
        };
        let id = transcript.allocate_id();
        transcript.entries.push(TranscriptEntry {
            id,
            sender: Sender::Bot,
            text: GREETING.to_string(),
            status: EntryStatus::Complete,
            outcome: Some(Outcome::Answered),
        });
        transcript
    }

    fn allocate_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    /// All entries in send order
    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// The loading entry, if a request is outstanding
    #[must_use]
    pub fn loading(&self) -> Option<&TranscriptEntry> {
        self.entries.last().filter(|e| e.is_loading())
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self.loading() {
            None => Phase::Idle,
            Some(entry) if entry.text.is_empty() => Phase::AwaitingFirstDelta,
            Some(_) => Phase::Streaming,
        }
    }

    /// Append the user's message and an empty loading reply
    ///
    /// # Errors
    ///
    /// [`TranscriptError::Busy`] while a reply is loading,
    /// [`TranscriptError::EmptyInput`] for blank text. Nothing is appended
    /// in either case.
    pub fn submit(&mut self, text: &str) -> Result<Submitted, TranscriptError> {
        if self.loading().is_some() {
            return Err(TranscriptError::Busy);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(TranscriptError::EmptyInput);
        }

        let user = self.allocate_id();
        self.entries.push(TranscriptEntry {
            id: user,
            sender: Sender::User,
            text: text.to_string(),
            status: EntryStatus::Complete,
            outcome: None,
        });

        let reply = self.allocate_id();
        self.entries.push(TranscriptEntry {
            id: reply,
            sender: Sender::Bot,
            text: String::new(),
            status: EntryStatus::Loading,
            outcome: None,
        });

        Ok(Submitted { user, reply })
    }

    fn loading_mut(&mut self, id: EntryId) -> Result<&mut TranscriptEntry, TranscriptError> {
        match self.entries.last_mut() {
            Some(entry) if entry.id == id && entry.is_loading() => Ok(entry),
            _ => Err(TranscriptError::StaleEntry { id }),
        }
    }

    /// Apply one stream event to the loading entry `id`
    ///
    /// Returns the phase after the event.
    ///
    /// # Errors
    ///
    /// [`TranscriptError::StaleEntry`] when `id` is not the loading entry;
    /// the transcript is left untouched.
    pub fn apply(&mut self, id: EntryId, event: StreamEvent) -> Result<Phase, TranscriptError> {
        let entry = self.loading_mut(id)?;
        match event {
            StreamEvent::Delta(text) => entry.text.push_str(&text),
            StreamEvent::Done => {
                if entry.text.is_empty() {
                    resolve(entry, FAILURE_MESSAGE.to_string(), Outcome::Failed);
                } else {
                    let text = std::mem::take(&mut entry.text);
                    resolve(entry, text, Outcome::Answered);
                }
            }
            StreamEvent::Error(_) => {
                let text = if entry.text.is_empty() {
                    FAILURE_MESSAGE.to_string()
                } else {
                    format!("{}\n\n{FAILURE_MESSAGE}", entry.text)
                };
                resolve(entry, text, Outcome::Failed);
            }
        }
        Ok(self.phase())
    }

    /// Resolve the loading entry as a failure without a stream
    ///
    /// Used when the request itself was rejected (HTTP error, rate limit,
    /// connection refused).
    ///
    /// # Errors
    ///
    /// [`TranscriptError::StaleEntry`] when `id` is not the loading entry.
    pub fn fail(&mut self, id: EntryId) -> Result<(), TranscriptError> {
        self.apply(id, StreamEvent::Error(String::new())).map(|_| ())
    }

    /// Stop the outstanding request, keeping whatever text arrived
    ///
    /// Returns the cancelled entry, or `None` when idle.
    pub fn cancel(&mut self) -> Option<EntryId> {
        let entry = self.entries.last_mut().filter(|e| e.is_loading())?;
        let text = if entry.text.is_empty() {
            CANCELLED_NOTICE.to_string()
        } else {
            std::mem::take(&mut entry.text)
        };
        resolve(entry, text, Outcome::Cancelled);
        Some(entry.id)
    }

    /// Resolve an entry whose stream ended without a terminal event
    ///
    /// Partial text is kept as the answer.
    ///
    /// # Errors
    ///
    /// [`TranscriptError::StaleEntry`] when `id` is not the loading entry.
    pub fn finish_interrupted(&mut self, id: EntryId) -> Result<Outcome, TranscriptError> {
        let entry = self.loading_mut(id)?;
        let outcome = if entry.text.is_empty() {
            resolve(entry, FAILURE_MESSAGE.to_string(), Outcome::Failed);
            Outcome::Failed
        } else {
            let text = std::mem::take(&mut entry.text);
            resolve(entry, text, Outcome::Answered);
            Outcome::Answered
        };
        Ok(outcome)
    }

    /// Messages to replay upstream, in order
    ///
    /// Failed, cancelled and loading bot entries are left out.
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .filter_map(|entry| match (entry.sender, entry.status, entry.outcome) {
                (Sender::User, EntryStatus::Complete, _) => Some(ChatMessage::user(&entry.text)),
                (Sender::Bot, EntryStatus::Complete, Some(Outcome::Answered))
                    if !entry.text.is_empty() =>
                {
                    Some(ChatMessage::assistant(&entry.text))
                }
                _ => None,
            })
            .collect()
    }
}

fn resolve(entry: &mut TranscriptEntry, text: String, outcome: Outcome) {
    entry.text = text;
    entry.status = EntryStatus::Complete;
    entry.outcome = Some(outcome);
}
