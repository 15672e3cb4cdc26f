//! Cohere chat backend.
//!
//! Cohere's v1 chat API takes the current message separately from the
//! prior history and names its stream events (`stream-start`,
//! `text-generation`, `stream-end`). Images are not supported and are
//! silently dropped.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_core::config::BackendConfig;
use courier_history::Role;
use courier_stream::SseParser;

use crate::backend::{bearer_headers, request_timeout, ChatBackend, ChatTurnParams};
use crate::codec::VendorCodec;
use crate::error::CompletionError;
use crate::request::{request_chat_completions, StreamSink, StreamTuning};

pub struct CohereCodec;

impl VendorCodec for CohereCodec {
    fn parser(&self) -> SseParser {
        SseParser::Cohere
    }

    fn extract_delta<'a>(&self, fragment: &'a Value) -> Option<&'a str> {
        fragment["text"].as_str()
    }

    fn extract_full_text(&self, result: &Value) -> Option<String> {
        result["text"].as_str().map(str::to_string)
    }

    fn extract_error(&self, result: &Value) -> Option<String> {
        result["message"].as_str().map(str::to_string)
    }
}

pub struct CohereBackend {
    client: reqwest::Client,
    cfg: BackendConfig,
}

impl CohereBackend {
    pub fn new(cfg: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    fn build_body(&self, params: &ChatTurnParams, stream: bool) -> Value {
        let chat_history: Vec<Value> = params
            .history
            .iter()
            .map(|entry| {
                let role = match entry.role {
                    Role::User => "USER",
                    Role::Assistant => "CHATBOT",
                    Role::System => "SYSTEM",
                };
                json!({"role": role, "message": entry.content})
            })
            .collect();

        let mut body = json!({
            "model": self.cfg.model,
            "message": params.message,
            "chat_history": chat_history,
            "stream": stream,
        });
        if let Some(prompt) = &params.prompt {
            body["preamble"] = json!(prompt);
        }
        for (key, value) in &self.cfg.extra_params {
            body[key] = value.clone();
        }
        body
    }
}

#[async_trait]
impl ChatBackend for CohereBackend {
    fn name(&self) -> &str {
        "cohere"
    }

    async fn request(
        &self,
        params: &ChatTurnParams,
        tuning: &StreamTuning,
        on_stream: Option<&StreamSink>,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/chat", self.cfg.base_url.trim_end_matches('/'));
        let body = self.build_body(params, on_stream.is_some());

        debug!(model = %self.cfg.model, "sending request to Cohere");

        request_chat_completions(
            &self.client,
            &url,
            bearer_headers(&self.cfg.api_key)?,
            &body,
            &CohereCodec,
            tuning,
            request_timeout(&self.cfg),
            on_stream,
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::config::Vendor;
    use courier_history::HistoryEntry;

    fn config() -> BackendConfig {
        BackendConfig {
            vendor: Vendor::Cohere,
            api_key: "co-test".into(),
            base_url: "https://api.cohere.com/v1".into(),
            model: "command-r".into(),
            system_prompt: None,
            system_role: "system".into(),
            timeout_ms: 0,
            flush_start: 50,
            flush_grow: 20,
            image_transfer_mode: "url".into(),
            extra_params: serde_json::Map::new(),
        }
    }

    #[test]
    fn history_maps_to_cohere_roles() {
        let backend = CohereBackend::new(config());
        let params = ChatTurnParams {
            message: "now".into(),
            history: vec![HistoryEntry::user("q"), HistoryEntry::assistant("a")],
            prompt: Some("sys".into()),
            ..Default::default()
        };
        let body = backend.build_body(&params, true);
        assert_eq!(body["message"], "now");
        assert_eq!(body["preamble"], "sys");
        let history = body["chat_history"].as_array().unwrap();
        assert_eq!(history[0]["role"], "USER");
        assert_eq!(history[1]["role"], "CHATBOT");
        assert_eq!(history[1]["message"], "a");
    }

    #[test]
    fn codec_extracts_text_fields() {
        let codec = CohereCodec;
        let fragment = serde_json::json!({"event_type": "text-generation", "text": "hi"});
        assert_eq!(codec.extract_delta(&fragment), Some("hi"));
        let result = serde_json::json!({"text": "full answer"});
        assert_eq!(codec.extract_full_text(&result).as_deref(), Some("full answer"));
        let error = serde_json::json!({"message": "invalid request"});
        assert_eq!(codec.extract_error(&error).as_deref(), Some("invalid request"));
    }
}
