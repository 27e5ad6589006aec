//! Chat Widget - line-oriented terminal chat
//!
//! Reads messages from stdin and streams replies from the relay as they
//! arrive.
//!
//! # Usage
//!
//! ```bash
//! chat-widget
//! CHAT_RELAY_URL=http://relay.example:3000/api/chat chat-widget
//! CHAT_RELAY_MODEL=gpt-4 chat-widget
//! ```
//!
//! `Ctrl-C` while a reply streams cancels it; `Ctrl-C` at the prompt exits.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chat_widget::display::{render_transcript, sender_label, terminal_width};
use chat_widget::{
    ChatSession, EntryId, RelayClient, Sender, TranscriptError, WidgetUpdate, DEFAULT_RELAY_URL,
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_widget=warn,relay_core=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn prompt() {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{}: ", sender_label(Sender::User));
    let _ = out.flush();
}

/// Print replies as they stream; owns stdout while a reply is loading
fn spawn_renderer(mut updates: mpsc::Receiver<WidgetUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut streamed: HashMap<EntryId, String> = HashMap::new();

        while let Some(update) = updates.recv().await {
            let mut out = std::io::stdout().lock();
            match update {
                WidgetUpdate::EntryAdded {
                    id,
                    sender: Sender::Bot,
                    ..
                } => {
                    let _ = write!(out, "{}: ", sender_label(Sender::Bot));
                    streamed.insert(id, String::new());
                }
                WidgetUpdate::EntryAdded { .. } | WidgetUpdate::StreamError { .. } => {}
                WidgetUpdate::Token { id, text } => {
                    let _ = write!(out, "{text}");
                    streamed.entry(id).or_default().push_str(&text);
                }
                WidgetUpdate::StreamEnd { id, text, .. } => {
                    // Print whatever the resolution added beyond the streamed text
                    let shown = streamed.remove(&id).unwrap_or_default();
                    let rest = text.strip_prefix(shown.as_str()).unwrap_or(&text);
                    let _ = write!(out, "{rest}\n\n{}: ", sender_label(Sender::User));
                }
            }
            let _ = out.flush();
        }
    })
}

/// Blocking stdin reader on its own thread
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let endpoint =
        std::env::var("CHAT_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
    let mut client = RelayClient::new(endpoint).context("Failed to create HTTP client")?;
    if let Ok(model) = std::env::var("CHAT_RELAY_MODEL") {
        client = client.with_model(model);
    }

    let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let mut session = ChatSession::new(client).with_updates(tx);
    let renderer = spawn_renderer(rx);

    println!("{}\n", render_transcript(session.transcript(), terminal_width()));
    prompt();

    let mut lines = spawn_stdin_reader();
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            () = ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match session.send(&line, ctrl_c()).await {
            Ok(_) => {}
            Err(TranscriptError::EmptyInput) => prompt(),
            Err(e) => {
                eprintln!("{e}");
                prompt();
            }
        }
    }

    drop(session);
    let _ = renderer.await;
    println!();
    Ok(())
}
