//! The completion orchestrator: one round-trip to a model backend.
//!
//! Streaming responses are pulled through framer → SSE decoder → vendor
//! parser, accumulating text and invoking the streaming callback at a
//! growing length threshold. Non-streaming responses are a single JSON
//! body run through the vendor codec's extractors.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_stream::{LineFramer, ParseOutcome, SseDecoder, SseParser};

use crate::codec::VendorCodec;
use crate::error::CompletionError;

/// Async streaming callback: receives the accumulated text (with a `...`
/// continuation cue appended) on every flush. Must not fail — delivery
/// errors are the callback's own problem.
pub type StreamSink = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async result callback for non-streaming responses, invoked with the raw
/// body before text extraction (e.g. to persist vendor metadata).
pub type ResultSink = Box<dyn Fn(Value) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Streaming flush tuning. The first flush fires once `flush_start`
/// unflushed characters accumulate; each flush then raises the threshold
/// by `flush_grow`, so later edits get progressively less frequent.
#[derive(Debug, Clone)]
pub struct StreamTuning {
    pub flush_start: usize,
    pub flush_grow: usize,
    /// Minimum wall-clock spacing between flushes. Zero disables the check.
    pub min_interval: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            flush_start: 50,
            flush_grow: 20,
            min_interval: Duration::ZERO,
        }
    }
}

fn is_event_stream(content_type: &str) -> bool {
    content_type.contains("text/event-stream") || content_type.contains("application/stream+json")
}

fn is_json(content_type: &str) -> bool {
    content_type.contains("json")
}

/// Drive one completion request.
///
/// With a streaming callback and an event-stream response, returns the
/// accumulated text (transport failures mid-stream are captured inline as
/// a `\nERROR: ...` suffix, never raised). Otherwise expects a JSON body:
/// vendor-reported errors raise `Upstream`, and the extracted full text is
/// returned after the optional result callback runs.
///
/// A configured timeout cancels the request; `timeout = None` (or zero)
/// leaves the call bounded only by the transport.
#[allow(clippy::too_many_arguments)]
pub async fn request_chat_completions(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    codec: &dyn VendorCodec,
    tuning: &StreamTuning,
    timeout: Option<Duration>,
    on_stream: Option<&StreamSink>,
    on_result: Option<&ResultSink>,
) -> Result<String, CompletionError> {
    let cancel = CancellationToken::new();
    let timeout = timeout.filter(|t| !t.is_zero());
    if let Some(t) = timeout {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(t).await;
            deadline.cancel();
        });
    }

    debug!(url, streaming = on_stream.is_some(), "requesting completion");

    let request = client.post(url).headers(headers).json(body).send();
    let resp = tokio::select! {
        r = request => r?,
        _ = cancel.cancelled() => {
            return Err(CompletionError::Timeout {
                ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            });
        }
    };

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if let Some(sink) = on_stream {
        if resp.status().is_success() && is_event_stream(&content_type) {
            let stream = resp.bytes_stream();
            return Ok(consume_stream(stream, codec, tuning, sink, &cancel).await);
        }
    }

    if !is_json(&content_type) {
        let status = resp.status();
        return Err(CompletionError::Api {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected content type")
                .to_string(),
        });
    }

    let result: Value = resp
        .json()
        .await
        .map_err(|e| CompletionError::Parse(e.to_string()))?;
    if result.is_null() {
        return Err(CompletionError::Parse("empty response".into()));
    }

    if let Some(message) = codec.extract_error(&result) {
        return Err(CompletionError::Upstream(message));
    }

    if let Some(sink) = on_result {
        if let Err(e) = sink(result.clone()).await {
            warn!(error = %e, "result callback failed");
            return Err(CompletionError::Malformed {
                raw: result.to_string(),
            });
        }
    }

    codec
        .extract_full_text(&result)
        .ok_or_else(|| CompletionError::Malformed {
            raw: result.to_string(),
        })
}

/// Accumulate a streamed body into full text, flushing to the callback at
/// the growing threshold. Generic over the chunk stream so tests can feed
/// synthetic chunk splits.
///
/// Never returns an error: a cancelled token ends iteration quietly and a
/// transport failure is recorded inline, preserving partial output.
pub async fn consume_stream<S, C, E>(
    mut stream: S,
    codec: &dyn VendorCodec,
    tuning: &StreamTuning,
    on_stream: &StreamSink,
    cancel: &CancellationToken,
) -> String
where
    S: Stream<Item = Result<C, E>> + Unpin,
    C: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut framer = LineFramer::new();
    let mut acc = Accumulator::new(codec, tuning);

    loop {
        let chunk = tokio::select! {
            biased;
            // Caller-initiated cancel mid-stream is a normal end-of-stream,
            // not an error.
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                None => break,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    acc.content.push_str(&format!("\nERROR: {e}"));
                    return acc.content;
                }
            },
        };

        for line in framer.decode(chunk.as_ref()) {
            acc.feed(&line, on_stream).await;
        }
    }

    for line in framer.flush() {
        acc.feed(&line, on_stream).await;
    }

    acc.content
}

/// Per-stream decode state: SSE record assembly, accumulated text and the
/// flush threshold bookkeeping.
struct Accumulator<'a> {
    decoder: SseDecoder,
    parser: SseParser,
    codec: &'a dyn VendorCodec,
    tuning: &'a StreamTuning,
    content: String,
    unflushed: usize,
    step: usize,
    last_flush: Instant,
    finished: bool,
}

impl<'a> Accumulator<'a> {
    fn new(codec: &'a dyn VendorCodec, tuning: &'a StreamTuning) -> Self {
        Self {
            decoder: SseDecoder::new(),
            parser: codec.parser(),
            codec,
            tuning,
            content: String::new(),
            unflushed: 0,
            step: tuning.flush_start,
            last_flush: Instant::now(),
            finished: false,
        }
    }

    async fn feed(&mut self, line: &str, sink: &StreamSink) {
        let Some(record) = self.decoder.decode(line) else {
            return;
        };
        match self.parser.parse(&record) {
            ParseOutcome::Finish => self.finished = true,
            ParseOutcome::Ignore => {}
            ParseOutcome::Fragment(fragment) => {
                if self.finished {
                    return;
                }
                let Some(delta) = self.codec.extract_delta(&fragment) else {
                    return;
                };
                if delta.is_empty() {
                    return;
                }
                self.unflushed += delta.chars().count();
                self.content.push_str(delta);

                if self.unflushed > self.step {
                    if !self.tuning.min_interval.is_zero() {
                        if self.last_flush.elapsed() < self.tuning.min_interval {
                            // Too soon: keep the counters so the next
                            // fragment retries the flush.
                            return;
                        }
                        self.last_flush = Instant::now();
                    }
                    self.unflushed = 0;
                    self.step += self.tuning.flush_grow;
                    sink(format!("{}\n...", self.content)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::OpenAiCodec;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    fn sse_chunk(text: &str) -> Vec<u8> {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
        .into_bytes()
    }

    fn done_chunk() -> Vec<u8> {
        b"data: [DONE]\n\n".to_vec()
    }

    fn collecting_sink() -> (StreamSink, Arc<Mutex<Vec<String>>>) {
        let flushes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&flushes);
        let sink: StreamSink = Box::new(move |text| {
            let collected = Arc::clone(&collected);
            Box::pin(async move {
                collected.lock().unwrap().push(text);
            })
        });
        (sink, flushes)
    }

    #[tokio::test]
    async fn flush_thresholds_grow_deterministically() {
        // 20 fragments of 10 chars = 200 chars total. Thresholds: flush
        // once unflushed > 50 (at 60), then > 70 (at 140 cumulative),
        // then > 90 (never reached with the remaining 60).
        let chunks: Vec<Result<Vec<u8>, Infallible>> = (0..20)
            .map(|_| Ok(sse_chunk("xxxxxxxxxx")))
            .chain(std::iter::once(Ok(done_chunk())))
            .collect();
        let (sink, flushes) = collecting_sink();
        let codec = OpenAiCodec;
        let tuning = StreamTuning::default();
        let cancel = CancellationToken::new();

        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &tuning,
            &sink,
            &cancel,
        )
        .await;

        assert_eq!(content.len(), 200);
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0], format!("{}\n...", "x".repeat(60)));
        assert_eq!(flushes[1], format!("{}\n...", "x".repeat(140)));
    }

    #[tokio::test]
    async fn fragments_after_done_are_discarded() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![
            Ok(sse_chunk("before")),
            Ok(done_chunk()),
            Ok(sse_chunk("after")),
        ];
        let (sink, _) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &StreamTuning::default(),
            &sink,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(content, "before");
    }

    #[tokio::test]
    async fn malformed_fragment_does_not_abort_stream() {
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![
            Ok(sse_chunk("good ")),
            Ok(b"data: {broken json\n\n".to_vec()),
            Ok(sse_chunk("still good")),
            Ok(done_chunk()),
        ];
        let (sink, _) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &StreamTuning::default(),
            &sink,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(content, "good still good");
    }

    #[tokio::test]
    async fn transport_error_is_captured_inline() {
        #[derive(Debug)]
        struct Boom;
        impl std::fmt::Display for Boom {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "connection reset")
            }
        }
        let chunks: Vec<Result<Vec<u8>, Boom>> =
            vec![Ok(sse_chunk("partial")), Err(Boom)];
        let (sink, _) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &StreamTuning::default(),
            &sink,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(content, "partial\nERROR: connection reset");
    }

    #[tokio::test]
    async fn cancel_ends_stream_quietly() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            vec![Ok(sse_chunk("never seen")), Ok(done_chunk())];
        let (sink, flushes) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &StreamTuning::default(),
            &sink,
            &cancel,
        )
        .await;
        assert_eq!(content, "");
        assert!(flushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_matter() {
        // One SSE record split into 1-byte chunks decodes identically.
        let record = sse_chunk("hello world across chunks");
        let chunks: Vec<Result<Vec<u8>, Infallible>> = record
            .iter()
            .map(|b| Ok(vec![*b]))
            .chain(std::iter::once(Ok(done_chunk())))
            .collect();
        let (sink, _) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &StreamTuning::default(),
            &sink,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(content, "hello world across chunks");
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_defers_flush_but_keeps_counters() {
        let tuning = StreamTuning {
            flush_start: 5,
            flush_grow: 5,
            min_interval: Duration::from_secs(3600),
        };
        // Both fragments cross the threshold, but the interval gate
        // (armed at stream start) defers every flush.
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![
            Ok(sse_chunk("aaaaaaaaaa")),
            Ok(sse_chunk("bbbbbbbbbb")),
            Ok(done_chunk()),
        ];
        let (sink, flushes) = collecting_sink();
        let codec = OpenAiCodec;
        let content = consume_stream(
            stream::iter(chunks),
            &codec,
            &tuning,
            &sink,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(content.len(), 20);
        // last_flush was set at stream start, so even the first crossing
        // is deferred within the interval window.
        assert!(flushes.lock().unwrap().is_empty());
    }
}
