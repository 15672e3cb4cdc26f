use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Error payload reported by the vendor; surfaced to the user verbatim
    /// (truncated) by the outermost handler.
    #[error("{0}")]
    Upstream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Result extraction or the result callback failed; carries the raw
    /// response body for diagnosis.
    #[error("unexpected response body: {raw}")]
    Malformed { raw: String },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },
}
