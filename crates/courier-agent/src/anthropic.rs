//! Anthropic messages backend.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_core::config::BackendConfig;
use courier_history::Role;
use courier_stream::SseParser;

use crate::backend::{request_timeout, ChatBackend, ChatTurnParams};
use crate::codec::VendorCodec;
use crate::error::CompletionError;
use crate::request::{request_chat_completions, StreamSink, StreamTuning};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicCodec;

impl VendorCodec for AnthropicCodec {
    fn parser(&self) -> SseParser {
        SseParser::Anthropic
    }

    fn extract_delta<'a>(&self, fragment: &'a Value) -> Option<&'a str> {
        fragment["delta"]["text"].as_str()
    }

    fn extract_full_text(&self, result: &Value) -> Option<String> {
        result["content"][0]["text"].as_str().map(str::to_string)
    }

    fn extract_error(&self, result: &Value) -> Option<String> {
        result["error"]["message"].as_str().map(str::to_string)
    }
}

pub struct AnthropicBackend {
    client: reqwest::Client,
    cfg: BackendConfig,
}

impl AnthropicBackend {
    pub fn new(cfg: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    /// Messages must alternate user/assistant; system-role history entries
    /// are folded into the top-level system text instead. Images are not
    /// forwarded (the messages API wants base64 source blocks, which the
    /// relay does not produce).
    fn build_body(&self, params: &ChatTurnParams, stream: bool) -> Value {
        let mut system = params.prompt.clone().unwrap_or_default();
        let mut messages = Vec::new();

        for entry in &params.history {
            match entry.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&entry.content);
                }
                Role::User => messages.push(json!({"role": "user", "content": entry.content})),
                Role::Assistant => {
                    messages.push(json!({"role": "assistant", "content": entry.content}))
                }
            }
        }
        messages.push(json!({"role": "user", "content": params.message}));

        let mut body = json!({
            "model": self.cfg.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": messages,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        for (key, value) in &self.cfg.extra_params {
            body[key] = value.clone();
        }
        body
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap, CompletionError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            reqwest::header::HeaderValue::from_str(&self.cfg.api_key)
                .map_err(|e| CompletionError::Parse(format!("invalid api key: {e}")))?,
        );
        headers.insert(
            "anthropic-version",
            reqwest::header::HeaderValue::from_static(API_VERSION),
        );
        Ok(headers)
    }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn request(
        &self,
        params: &ChatTurnParams,
        tuning: &StreamTuning,
        on_stream: Option<&StreamSink>,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/v1/messages", self.cfg.base_url.trim_end_matches('/'));
        let body = self.build_body(params, on_stream.is_some());

        debug!(model = %self.cfg.model, "sending request to Anthropic");

        request_chat_completions(
            &self.client,
            &url,
            self.headers()?,
            &body,
            &AnthropicCodec,
            tuning,
            request_timeout(&self.cfg),
            on_stream,
            None,
        )
        .await
    }
}
