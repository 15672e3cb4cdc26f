//! Common interface for model backends (OpenAI-compatible, Cohere,
//! Anthropic). Exactly one backend is selected at configuration time.

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::config::{BackendConfig, Vendor};
use courier_history::{HistoryEntry, Role};

use crate::error::CompletionError;
use crate::request::{StreamSink, StreamTuning};

/// Input contract for one conversational turn. `history` is the caller's
/// working copy, not the canonical store-backed list.
#[derive(Debug, Clone, Default)]
pub struct ChatTurnParams {
    pub message: String,
    pub images: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub prompt: Option<String>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logging and error messages.
    fn name(&self) -> &str;

    /// Run one completion round-trip. Streaming kicks in when `on_stream`
    /// is supplied and the upstream answers with an event-stream body.
    async fn request(
        &self,
        params: &ChatTurnParams,
        tuning: &StreamTuning,
        on_stream: Option<&StreamSink>,
    ) -> Result<String, CompletionError>;
}

/// Build the configured backend.
pub fn build_backend(cfg: &BackendConfig) -> Arc<dyn ChatBackend> {
    match cfg.vendor {
        Vendor::Openai => Arc::new(crate::openai::OpenAiBackend::new(cfg.clone())),
        Vendor::Cohere => Arc::new(crate::cohere::CohereBackend::new(cfg.clone())),
        Vendor::Anthropic => Arc::new(crate::anthropic::AnthropicBackend::new(cfg.clone())),
    }
}

pub(crate) fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

pub(crate) fn request_timeout(cfg: &BackendConfig) -> Option<std::time::Duration> {
    (cfg.timeout_ms > 0).then(|| std::time::Duration::from_millis(cfg.timeout_ms))
}

pub(crate) fn bearer_headers(api_key: &str) -> Result<reqwest::header::HeaderMap, CompletionError> {
    let mut headers = reqwest::header::HeaderMap::new();
    let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|e| CompletionError::Parse(format!("invalid api key: {e}")))?;
    headers.insert(reqwest::header::AUTHORIZATION, value);
    Ok(headers)
}
