//! Display Helpers
//!
//! Plain-text rendering of transcript entries for the terminal widget.

use crate::transcript::{Sender, Transcript, TranscriptEntry};

/// Wrap width when the terminal size is unknown
pub const DEFAULT_WIDTH: usize = 80;

const MIN_WIDTH: usize = 20;

/// Label printed before an entry
#[must_use]
pub fn sender_label(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "You",
        Sender::Bot => "Bot",
    }
}

/// Width from `COLUMNS`, falling back to [`DEFAULT_WIDTH`]
#[must_use]
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(DEFAULT_WIDTH)
}

/// Render one entry wrapped to `width`, continuation lines aligned under
/// the text
#[must_use]
pub fn render_entry(entry: &TranscriptEntry, width: usize) -> String {
    let label = format!("{}: ", sender_label(entry.sender()));
    let indent = " ".repeat(label.len());
    let options = textwrap::Options::new(width.max(MIN_WIDTH))
        .initial_indent(&label)
        .subsequent_indent(&indent);
    textwrap::fill(entry.text(), options)
}

/// Render every entry, separated by blank lines
#[must_use]
pub fn render_transcript(transcript: &Transcript, width: usize) -> String {
    transcript
        .entries()
        .iter()
        .map(|e| render_entry(e, width))
        .collect::<Vec<_>>()
        .join("\n\n")
}
