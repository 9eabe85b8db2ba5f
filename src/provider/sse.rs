//! Server-sent-event plumbing shared by the vendor stream parsers.
//!
//! ```text
//! bytes ──▶ SseDecoder ──▶ SseFrame{event, data} ──▶ StreamParser ──▶ StreamEvent ──▶ mpsc
//! ```
//!
//! The decoder buffers raw bytes and only decodes complete lines, so a
//! multi-byte character split across network chunks is never mangled.
//! [`drive`] runs until the parser yields `Done`, the body ends, the
//! transport fails or stalls, or the receiver is dropped. Returning drops
//! the response body, which closes the connection. A body that ends
//! before the vendor's terminal event is reported as a decode error.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ProviderError, StreamEvent};

/// One `data:` payload, tagged with the most recent `event:` name.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.line(line.trim_end_matches(['\r', '\n'])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a final line that arrived without a trailing newline.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        self.line(line.trim_end_matches(['\r', '\n']))
            .into_iter()
            .collect()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            // blank line ends the event block
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = field(line, "event") {
            self.event = Some(name.to_string());
            return None;
        }
        field(line, "data").map(|data| SseFrame {
            event: self.event.clone(),
            data: data.to_string(),
        })
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Vendor-specific translation from SSE frames to stream events.
pub trait StreamParser: Send {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError>;

    /// Called once when the body ends. Parsers that never saw their
    /// terminal event return an error here.
    fn on_end(&mut self) -> Result<Vec<StreamEvent>, ProviderError>;
}

/// Forward events; `false` means stop (receiver gone or terminal event sent).
async fn emit(
    tx: &mpsc::Sender<Result<StreamEvent, ProviderError>>,
    events: Vec<StreamEvent>,
) -> bool {
    for event in events {
        let done = matches!(event, StreamEvent::Done);
        if tx.send(Ok(event)).await.is_err() {
            debug!("stream receiver dropped; closing transport");
            return false;
        }
        if done {
            return false;
        }
    }
    true
}

async fn emit_frames<P: StreamParser>(
    parser: &mut P,
    frames: Vec<SseFrame>,
    tx: &mpsc::Sender<Result<StreamEvent, ProviderError>>,
) -> bool {
    for frame in frames {
        match parser.on_frame(&frame) {
            Ok(events) => {
                if !emit(tx, events).await {
                    return false;
                }
            }
            Err(e) => {
                warn!("stream aborted by vendor error: {e}");
                let _ = tx.send(Err(e)).await;
                return false;
            }
        }
    }
    true
}

/// Pump a byte stream through `parser` into `tx`. Meant to be spawned.
///
/// `idle` bounds the wait for each chunk; a vendor that goes quiet for
/// longer ends the stream with [`ProviderError::Timeout`].
pub async fn drive<S, P>(
    mut body: S,
    mut parser: P,
    idle: Duration,
    tx: mpsc::Sender<Result<StreamEvent, ProviderError>>,
) where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
    P: StreamParser,
{
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => {
                warn!("stream idle for {:?}; giving up", idle);
                let _ = tx.send(Err(ProviderError::Timeout)).await;
                return;
            }
        };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!("stream read error: {e}");
                let _ = tx.send(Err(ProviderError::from_transport(e))).await;
                return;
            }
        };
        let frames = decoder.push(&bytes);
        if !emit_frames(&mut parser, frames, &tx).await {
            return;
        }
    }

    let frames = decoder.finish();
    if !emit_frames(&mut parser, frames, &tx).await {
        return;
    }
    match parser.on_end() {
        Ok(events) => {
            emit(&tx, events).await;
        }
        Err(e) => {
            warn!("{e}");
            let _ = tx.send(Err(e)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ends with `Done` on a `data: end` frame; errors if it never saw one.
    #[derive(Default)]
    struct EchoParser {
        finished: bool,
    }

    impl StreamParser for EchoParser {
        fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError> {
            if frame.data == "end" {
                self.finished = true;
                return Ok(vec![StreamEvent::Done]);
            }
            Ok(vec![StreamEvent::TextDelta(frame.data.clone())])
        }

        fn on_end(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
            if self.finished {
                Ok(Vec::new())
            } else {
                Err(ProviderError::Decode("stream ended early".into()))
            }
        }
    }

    async fn collect(
        mut rx: mpsc::Receiver<Result<StreamEvent, ProviderError>>,
    ) -> Vec<Result<StreamEvent, ProviderError>> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_drive_stops_at_done() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from_static(
            b"data: hi\n\ndata: end\n\ndata: ignored\n\n",
        ))];
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(drive(
            futures::stream::iter(chunks),
            EchoParser::default(),
            Duration::from_secs(5),
            tx,
        ));
        let items = collect(rx).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(StreamEvent::TextDelta(t)) if t == "hi"));
        assert!(matches!(&items[1], Ok(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn test_drive_truncated_body_is_decode_error() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b"data: partial\n\n"))];
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(drive(
            futures::stream::iter(chunks),
            EchoParser::default(),
            Duration::from_secs(5),
            tx,
        ));
        let items = collect(rx).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(StreamEvent::TextDelta(_))));
        match &items[1] {
            Err(ProviderError::Decode(msg)) => assert_eq!(msg, "stream ended early"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drive_idle_body_times_out() {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(drive(
            futures::stream::pending::<Result<Bytes, reqwest::Error>>(),
            EchoParser::default(),
            Duration::from_millis(50),
            tx,
        ));
        let items = collect(rx).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ProviderError::Timeout)));
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: {\"a\"").is_empty());
        let frames = d.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn test_event_name_applies_until_blank_line() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"event: message_stop\ndata: {}\n\ndata: {}\n");
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
        assert_eq!(frames[1].event, None);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "data: caf\u{e9}\n".as_bytes();
        let split = text.len() - 2; // inside the two-byte é
        let mut d = SseDecoder::new();
        assert!(d.push(&text[..split]).is_empty());
        let frames = d.push(&text[split..]);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut d = SseDecoder::new();
        let frames = d.push(b": keep-alive\r\ndata:x\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: tail").is_empty());
        assert_eq!(d.finish()[0].data, "tail");
    }
}
