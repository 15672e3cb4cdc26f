//! Vendor-specific interpretation of SSE records.
//!
//! Each upstream speaks its own event vocabulary on top of the same wire
//! format. A parser maps one record to "emit this JSON fragment", "the
//! stream is finished", or "nothing to do". Malformed JSON in a
//! data-bearing record is logged and swallowed — one bad fragment must not
//! abort an otherwise-healthy stream.

use tracing::warn;

use crate::sse::SseRecord;

/// What one SSE record means to the stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The record carries a decoded JSON fragment.
    Fragment(serde_json::Value),
    /// End-of-stream marker.
    Finish,
    /// Start markers, keep-alives, unknown events.
    Ignore,
}

/// Which upstream event vocabulary to interpret. Selected once at
/// configuration time alongside the vendor's codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseParser {
    /// OpenAI-compatible: unnamed data records, `[DONE]` sentinel.
    OpenAiCompatible,
    /// Cohere: named events, `text-generation` carries the payload.
    Cohere,
    /// Anthropic: named events, `content_block_delta` carries the payload.
    Anthropic,
}

impl SseParser {
    pub fn parse(&self, record: &SseRecord) -> ParseOutcome {
        match self {
            SseParser::OpenAiCompatible => parse_openai(record),
            SseParser::Cohere => parse_cohere(record),
            SseParser::Anthropic => parse_anthropic(record),
        }
    }
}

fn parse_openai(record: &SseRecord) -> ParseOutcome {
    if record.data.starts_with("[DONE]") {
        return ParseOutcome::Finish;
    }
    if record.event.is_none() {
        return parse_fragment(&record.data);
    }
    ParseOutcome::Ignore
}

fn parse_cohere(record: &SseRecord) -> ParseOutcome {
    match record.event.as_deref() {
        Some("text-generation") => parse_fragment(&record.data),
        Some("stream-end") => ParseOutcome::Finish,
        // stream-start and any future event names.
        _ => ParseOutcome::Ignore,
    }
}

fn parse_anthropic(record: &SseRecord) -> ParseOutcome {
    match record.event.as_deref() {
        Some("content_block_delta") => parse_fragment(&record.data),
        Some("message_stop") => ParseOutcome::Finish,
        // message_start, content_block_start, content_block_stop, ping, ...
        _ => ParseOutcome::Ignore,
    }
}

fn parse_fragment(data: &str) -> ParseOutcome {
    match serde_json::from_str(data) {
        Ok(value) => ParseOutcome::Fragment(value),
        Err(e) => {
            warn!(error = %e, data, "discarding malformed stream fragment");
            ParseOutcome::Ignore
        }
    }
}
