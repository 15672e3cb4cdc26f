//! Closed extractor capability set, one implementation per vendor.
//!
//! The orchestrator never guesses at response shapes: the codec selected at
//! configuration time knows how to pull the incremental delta out of a
//! stream fragment, the full text out of a single JSON body, and the error
//! message out of a vendor error payload.

use serde_json::Value;

use courier_stream::SseParser;

pub trait VendorCodec: Send + Sync {
    /// Which SSE event vocabulary this vendor speaks.
    fn parser(&self) -> SseParser;

    /// Incremental text carried by one decoded stream fragment, if any.
    fn extract_delta<'a>(&self, fragment: &'a Value) -> Option<&'a str>;

    /// Complete text of a non-streaming response body.
    fn extract_full_text(&self, result: &Value) -> Option<String>;

    /// Vendor-reported error message, if the body carries one.
    fn extract_error(&self, result: &Value) -> Option<String>;
}
