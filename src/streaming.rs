//! Incremental decoding of streamed inference responses.
//!
//! The service answers a streaming request with newline-delimited JSON,
//! optionally framed as server-sent events:
//!
//! ```text
//! data: {"text": "Hel", "tokens": 1}
//! data: {"text": "lo", "tokens": 2}
//! data: [DONE]
//! ```
//!
//! Lines may be split across body chunks. [`FragmentDecoder`] buffers
//! partial lines and [`InferenceStream`] exposes the decoded fragments as a
//! [`Stream`].

use crate::error::{FreeseekError, Result};
use crate::transport::ByteStream;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// One piece of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    /// Newly generated text.
    pub text: String,
    /// Tokens generated so far, when the service reports it.
    pub cumulative_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct WireFragment {
    #[serde(default, alias = "output")]
    text: String,
    #[serde(default)]
    tokens: Option<u64>,
    #[serde(default)]
    done: bool,
}

/// Longest line accepted by default, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into lines and decodes each one.
#[derive(Debug)]
pub struct FragmentDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    finished: bool,
}

impl Default for FragmentDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FragmentDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder that buffers at most `max_line` bytes of an
    /// unterminated line before failing.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            finished: false,
        }
    }

    /// Whether the end marker or a malformed line has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one chunk and decode every complete line in it.
    ///
    /// Decoding stops at the first malformed line, which is returned as the
    /// last element.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamFragment>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let line = &self.buffer[start..end];
            start = end + 1;

            match decode_line(line) {
                Line::Skip => {}
                Line::Fragment(fragment) => out.push(Ok(fragment)),
                Line::Last(fragment) => {
                    out.extend(fragment.map(Ok));
                    self.finished = true;
                    break;
                }
                Line::Malformed(err) => {
                    out.push(Err(err));
                    self.finished = true;
                    break;
                }
            }
        }

        if self.finished {
            self.buffer.clear();
        } else {
            self.buffer.drain(..start);
            if self.buffer.len() > self.max_line {
                out.push(Err(FreeseekError::Stream {
                    message: format!("stream line exceeds {} bytes", self.max_line),
                }));
                self.finished = true;
                self.buffer.clear();
            }
        }
        out
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Result<StreamFragment>> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let rest = std::mem::take(&mut self.buffer);
        match decode_line(&rest) {
            Line::Skip => None,
            Line::Fragment(fragment) => Some(Ok(fragment)),
            Line::Last(fragment) => fragment.map(Ok),
            Line::Malformed(err) => Some(Err(err)),
        }
    }
}

enum Line {
    Skip,
    Fragment(StreamFragment),
    Last(Option<StreamFragment>),
    Malformed(FreeseekError),
}

fn decode_line(raw: &[u8]) -> Line {
    let Ok(line) = std::str::from_utf8(raw) else {
        return Line::Malformed(FreeseekError::Stream {
            message: "stream line is not valid UTF-8".into(),
        });
    };
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return Line::Skip;
    }
    let payload = line.strip_prefix("data:").map_or(line, str::trim_start);
    if payload == "[DONE]" {
        return Line::Last(None);
    }

    let wire: WireFragment = match serde_json::from_str(payload) {
        Ok(wire) => wire,
        Err(e) => {
            let preview: String = payload.chars().take(80).collect();
            return Line::Malformed(FreeseekError::Stream {
                message: format!("malformed stream line '{preview}': {e}"),
            });
        }
    };

    let fragment = (!wire.text.is_empty() || wire.tokens.is_some()).then(|| StreamFragment {
        text: wire.text,
        cumulative_tokens: wire.tokens,
    });
    match (wire.done, fragment) {
        (true, fragment) => Line::Last(fragment),
        (false, Some(fragment)) => Line::Fragment(fragment),
        (false, None) => Line::Skip,
    }
}

struct DecodeState {
    body: ByteStream,
    decoder: FragmentDecoder,
    pending: VecDeque<Result<StreamFragment>>,
    ended: bool,
}

/// Decode a response body into fragments.
///
/// The body is dropped as soon as the end marker or an error is seen.
pub fn decode_stream(body: ByteStream) -> impl Stream<Item = Result<StreamFragment>> + Send {
    let state = DecodeState {
        body,
        decoder: FragmentDecoder::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(item) = state.pending.pop_front() {
                let next = if item.is_err() { None } else { Some(state) };
                return Some((item, next));
            }
            if state.ended || state.decoder.is_finished() {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let decoded = state.decoder.feed(&chunk);
                    state.pending.extend(decoded);
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    state.ended = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
}

type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamFragment>> + Send>>;

/// A lazy, finite sequence of generated fragments.
///
/// Dropping the stream drops the response body and closes the connection.
pub struct InferenceStream {
    inner: FragmentStream,
}

impl InferenceStream {
    /// Wrap any fragment stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<StreamFragment>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Decode a raw response body.
    pub fn from_body(body: ByteStream) -> Self {
        Self::new(decode_stream(body))
    }

    /// Drain the stream and concatenate every fragment.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.inner.next().await {
            text.push_str(&fragment?.text);
        }
        Ok(text)
    }

    /// Fail with [`FreeseekError::Timeout`] if no fragment arrives within
    /// `idle` of the previous one.
    #[must_use]
    pub fn with_idle_timeout(self, idle: Duration) -> Self {
        let timed = Box::pin(tokio_stream::StreamExt::timeout(self.inner, idle));
        Self::new(stream::unfold(Some(timed), move |timed| async move {
            let mut timed = timed?;
            match timed.next().await? {
                Ok(item) => Some((item, Some(timed))),
                Err(_elapsed) => Some((Err(FreeseekError::Timeout { timeout: idle }), None)),
            }
        }))
    }

    /// Fail with [`FreeseekError::Timeout`] once `deadline` passes.
    #[must_use]
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let budget = deadline.saturating_duration_since(Instant::now());
        Self::new(stream::unfold(Some(self.inner), move |inner| async move {
            let mut inner = inner?;
            match tokio::time::timeout_at(deadline, inner.next()).await {
                Ok(Some(item)) => Some((item, Some(inner))),
                Ok(None) => None,
                Err(_elapsed) => Some((Err(FreeseekError::Timeout { timeout: budget }), None)),
            }
        }))
    }
}

impl Stream for InferenceStream {
    type Item = Result<StreamFragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for InferenceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn body(chunks: &[&str]) -> ByteStream {
        let chunks: Vec<Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    async fn collect(chunks: &[&str]) -> Vec<Result<StreamFragment>> {
        InferenceStream::from_body(body(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_fragments_concatenate_in_order() {
        let items = collect(&[
            "{\"text\":\"Hel\"}\n",
            "{\"text\":\"lo \"}\n",
            "{\"text\":\" world\"}\n",
        ])
        .await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap().text).collect();
        assert_eq!(texts, ["Hel", "lo ", " world"]);
        assert_eq!(texts.concat(), "Hello world");
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let text = InferenceStream::from_body(body(&[
            "data: {\"te",
            "xt\":\"a\",\"tokens\":1}\n\ndata: {\"text\":",
            "\"b\",\"tokens\":2}\n",
            "data: [DONE]\n",
        ]))
        .collect_text()
        .await
        .unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn test_cumulative_tokens_and_comments() {
        let items = collect(&[": keep-alive\n{\"text\":\"x\",\"tokens\":7}\n"]).await;
        assert_eq!(
            items[0].as_ref().unwrap(),
            &StreamFragment {
                text: "x".into(),
                cumulative_tokens: Some(7)
            }
        );
    }

    #[tokio::test]
    async fn test_done_flag_ends_stream() {
        let items = collect(&[
            "{\"text\":\"last\",\"done\":true}\n{\"text\":\"ignored\"}\n",
        ])
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().text, "last");
    }

    #[tokio::test]
    async fn test_final_token_count_without_text_is_kept() {
        let items = collect(&[
            "{\"text\":\"hi\",\"tokens\":1}\n{\"text\":\"\",\"tokens\":42,\"done\":true}\n",
        ])
        .await;
        assert_eq!(items.len(), 2);
        let last = items[1].as_ref().unwrap();
        assert_eq!(last.text, "");
        assert_eq!(last.cumulative_tokens, Some(42));
    }

    #[test]
    fn test_unterminated_line_is_bounded() {
        let mut decoder = FragmentDecoder::with_max_line(16);
        assert!(decoder.feed(b"{\"text\":\"ab").is_empty());

        let out = decoder.feed(b"cdefghijklmnop");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(FreeseekError::Stream { .. })));
        assert!(decoder.is_finished());
        assert!(decoder.feed(b"\n").is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_long_complete_lines_within_limit() {
        let mut decoder = FragmentDecoder::with_max_line(16);
        let out = decoder.feed(b"{\"text\":\"abcdefghijklmnop\"}\n");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let text = InferenceStream::from_body(body(&["{\"text\":\"a\"}\n{\"text\":\"b\"}"]))
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn test_malformed_line_terminates() {
        let items = collect(&["{\"text\":\"ok\"}\nnot json\n{\"text\":\"never\"}\n"]).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(FreeseekError::Stream { .. })));
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let line = "{\"text\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|&b| b >= 0x80).unwrap() + 1;
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&line[..split])),
            Ok(Bytes::copy_from_slice(&line[split..])),
        ];
        let text = InferenceStream::from_body(Box::pin(stream::iter(chunks)))
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "héllo");
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"text\":\"a\"}\n")),
            Err(FreeseekError::Connection {
                message: "reset".into(),
            }),
        ];
        let err = InferenceStream::from_body(Box::pin(stream::iter(chunks)))
            .collect_text()
            .await
            .unwrap_err();
        assert!(matches!(err, FreeseekError::Connection { .. }));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_drops_body() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"{\"text\":\"a\"}\n"))])
                .chain(stream::pending::<Result<Bytes>>())
                .map(move |item| {
                    let _keep = &flag;
                    item
                }),
        );

        let mut stream = InferenceStream::from_body(body);
        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_yields_single_error() {
        let inner = stream::iter(vec![Ok(StreamFragment {
            text: "a".into(),
            cumulative_tokens: None,
        })])
        .chain(stream::pending::<Result<StreamFragment>>());
        let items: Vec<_> = InferenceStream::new(inner)
            .with_idle_timeout(Duration::from_millis(100))
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(FreeseekError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let items: Vec<_> = InferenceStream::new(stream::pending::<Result<StreamFragment>>())
            .with_deadline(deadline)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        let Err(FreeseekError::Timeout { timeout }) = &items[0] else {
            panic!("expected timeout, got {:?}", items[0]);
        };
        assert_eq!(*timeout, Duration::from_secs(1));
    }
}
