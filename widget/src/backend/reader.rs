//! Client Stream Reader
//!
//! Turns the relay's response body, an arbitrary sequence of byte chunks,
//! into [`StreamEvent`]s. Chunk boundaries carry no meaning: a frame may be
//! split anywhere, including inside a multi-byte character.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use relay_core::{FrameDecoder, StreamEvent};

/// Incremental event reader over a response body
///
/// Reading stops at the first terminal event; the body is dropped at that
/// point so the connection can be released.
pub struct StreamReader<S> {
    body: Option<S>,
    decoder: FrameDecoder,
    terminated: bool,
}

impl<S, B, E> StreamReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    /// Wrap a body stream
    #[must_use]
    pub fn new(body: S) -> Self {
        Self {
            body: Some(body),
            decoder: FrameDecoder::new(),
            terminated: false,
        }
    }

    /// Whether a `Done` or `Error` event has been returned
    ///
    /// A reader that returned `None` without this being set saw the body
    /// end early.
    #[must_use]
    pub fn saw_terminal(&self) -> bool {
        self.terminated
    }

    /// Next decoded event, or `None` when the sequence is over
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            while let Some(result) = self.decoder.next_event() {
                match result {
                    Ok(event) => {
                        if event.is_terminal() {
                            self.finish(true);
                        }
                        return Some(event);
                    }
                    Err(e) if e.is_fatal() => {
                        warn!(error = %e, "Relay stream unreadable");
                        self.finish(true);
                        return Some(StreamEvent::Error(e.to_string()));
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed frame"),
                }
            }

            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    let bytes = chunk.as_ref();
                    if !bytes.is_empty() {
                        self.decoder.push(bytes);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Relay stream read failed");
                    self.finish(true);
                    return Some(StreamEvent::Error(format!("Stream read failed: {e}")));
                }
                None => {
                    let leftover = self.decoder.available();
                    if leftover > 0 {
                        debug!(bytes = leftover, "Discarding incomplete trailing frame");
                    }
                    self.finish(false);
                    return None;
                }
            }
        }
    }

    fn finish(&mut self, terminated: bool) {
        self.terminated = terminated;
        self.body = None;
        self.decoder.clear();
    }

    /// Consume the reader as a stream of events
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut reader| async move {
            let event = reader.next_event().await?;
            Some((event, reader))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use relay_core::encode;
    use relay_core::transport::MAX_PENDING_FRAME;

    type Chunk = Result<Vec<u8>, String>;
    type ChunkStream = futures::stream::Iter<std::vec::IntoIter<Chunk>>;

    fn reader(chunks: Vec<Chunk>) -> StreamReader<ChunkStream> {
        StreamReader::new(futures::stream::iter(chunks))
    }

    async fn drain(chunks: Vec<Chunk>) -> Vec<StreamEvent> {
        reader(chunks).into_stream().collect().await
    }

    fn frames(events: &[StreamEvent]) -> Vec<u8> {
        events
            .iter()
            .flat_map(|e| encode(e).unwrap().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_every_split_offset_decodes_identically() {
        let events = vec![
            StreamEvent::Delta("Hel".into()),
            StreamEvent::Delta("lö 🦀".into()),
            StreamEvent::Done,
        ];
        let bytes = frames(&events);

        for split in 0..=bytes.len() {
            let chunks = vec![Ok(bytes[..split].to_vec()), Ok(bytes[split..].to_vec())];
            assert_eq!(drain(chunks).await, events, "split at {split}");
        }
    }

    #[tokio::test]
    async fn test_stops_at_done() {
        let mut bytes = frames(&[StreamEvent::Delta("a".into()), StreamEvent::Done]);
        bytes.extend(frames(&[StreamEvent::Delta("ignored".into())]));

        let mut reader = reader(vec![Ok(bytes)]);
        assert_eq!(reader.next_event().await, Some(StreamEvent::Delta("a".into())));
        assert_eq!(reader.next_event().await, Some(StreamEvent::Done));
        assert!(reader.saw_terminal());
        assert_eq!(reader.next_event().await, None);
        assert_eq!(reader.next_event().await, None);
    }

    #[tokio::test]
    async fn test_body_end_without_terminal() {
        let mut bytes = frames(&[StreamEvent::Delta("partial".into())]);
        bytes.extend_from_slice(b"data: \"never finish");

        let mut reader = reader(vec![Ok(Vec::new()), Ok(bytes), Ok(Vec::new())]);
        assert_eq!(
            reader.next_event().await,
            Some(StreamEvent::Delta("partial".into()))
        );
        assert_eq!(reader.next_event().await, None);
        assert!(!reader.saw_terminal());
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let mut bytes = b"data: not-json\n\n: keep-alive\n\n".to_vec();
        bytes.extend(frames(&[StreamEvent::Delta("ok".into()), StreamEvent::Done]));

        assert_eq!(
            drain(vec![Ok(bytes)]).await,
            vec![StreamEvent::Delta("ok".into()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_transport_error_ends_sequence() {
        let events = drain(vec![
            Ok(frames(&[StreamEvent::Delta("a".into())])),
            Err("connection reset".into()),
            Ok(frames(&[StreamEvent::Delta("b".into())])),
        ])
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Delta("a".into()));
        assert!(matches!(&events[1], StreamEvent::Error(r) if r.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_error_frame_is_terminal() {
        let bytes = frames(&[
            StreamEvent::Delta("a".into()),
            StreamEvent::Error("upstream failed".into()),
            StreamEvent::Delta("b".into()),
        ]);
        assert_eq!(
            drain(vec![Ok(bytes)]).await,
            vec![
                StreamEvent::Delta("a".into()),
                StreamEvent::Error("upstream failed".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_overflow_is_single_error() {
        let mut huge = b"data: \"".to_vec();
        huge.resize(MAX_PENDING_FRAME + 1, b'x');

        let events = drain(vec![Ok(huge)]).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
    }
}
