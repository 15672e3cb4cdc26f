//! OpenAI-compatible chat completions backend.
//!
//! Also serves every /chat/completions-shaped aggregator; point `base_url`
//! at the provider and keep the rest.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_core::config::BackendConfig;
use courier_stream::SseParser;

use crate::backend::{bearer_headers, request_timeout, role_str, ChatBackend, ChatTurnParams};
use crate::codec::VendorCodec;
use crate::error::CompletionError;
use crate::request::{request_chat_completions, StreamSink, StreamTuning};

pub struct OpenAiCodec;

impl VendorCodec for OpenAiCodec {
    fn parser(&self) -> SseParser {
        SseParser::OpenAiCompatible
    }

    fn extract_delta<'a>(&self, fragment: &'a Value) -> Option<&'a str> {
        fragment["choices"][0]["delta"]["content"].as_str()
    }

    fn extract_full_text(&self, result: &Value) -> Option<String> {
        result["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
    }

    fn extract_error(&self, result: &Value) -> Option<String> {
        result["error"]["message"].as_str().map(str::to_string)
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    cfg: BackendConfig,
}

impl OpenAiBackend {
    pub fn new(cfg: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    /// Render one message, expanding images into content parts. Data URIs
    /// and plain URLs both travel as `image_url` — base64 mode expects the
    /// caller to have produced a data URI already.
    fn render_message(role: &str, content: &str, images: &[String]) -> Value {
        if images.is_empty() {
            return json!({"role": role, "content": content});
        }
        let mut parts = Vec::new();
        if !content.is_empty() {
            parts.push(json!({"type": "text", "text": content}));
        }
        for image in images {
            parts.push(json!({"type": "image_url", "image_url": {"url": image}}));
        }
        json!({"role": role, "content": parts})
    }

    fn build_body(&self, params: &ChatTurnParams, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(prompt) = &params.prompt {
            messages.push(json!({"role": self.cfg.system_role, "content": prompt}));
        }
        for entry in &params.history {
            let images = entry.images.as_deref().unwrap_or(&[]);
            messages.push(Self::render_message(
                role_str(entry.role),
                &entry.content,
                images,
            ));
        }
        messages.push(Self::render_message("user", &params.message, &params.images));

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "stream": stream,
        });
        for (key, value) in &self.cfg.extra_params {
            body[key] = value.clone();
        }
        body
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn request(
        &self,
        params: &ChatTurnParams,
        tuning: &StreamTuning,
        on_stream: Option<&StreamSink>,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let body = self.build_body(params, on_stream.is_some());

        debug!(model = %self.cfg.model, "sending request to OpenAI-compatible endpoint");

        request_chat_completions(
            &self.client,
            &url,
            bearer_headers(&self.cfg.api_key)?,
            &body,
            &OpenAiCodec,
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
    use courier_history::HistoryEntry;
    use serde_json::json;

    fn config() -> BackendConfig {
        BackendConfig {
            vendor: courier_core::config::Vendor::Openai,
            api_key: "sk-test".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
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
    fn body_has_system_history_and_user() {
        let backend = OpenAiBackend::new(config());
        let params = ChatTurnParams {
            message: "hello".into(),
            images: vec![],
            history: vec![HistoryEntry::user("hi"), HistoryEntry::assistant("yo")],
            prompt: Some("be terse".into()),
        };
        let body = backend.build_body(&params, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "hello");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn no_prompt_means_no_system_message() {
        let backend = OpenAiBackend::new(config());
        let params = ChatTurnParams {
            message: "hello".into(),
            ..Default::default()
        };
        let body = backend.build_body(&params, false);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn images_expand_to_content_parts() {
        let backend = OpenAiBackend::new(config());
        let params = ChatTurnParams {
            message: "what is this".into(),
            images: vec!["https://example.com/a.jpg".into()],
            ..Default::default()
        };
        let body = backend.build_body(&params, false);
        let content = &body["messages"][0]["content"];
        assert!(content.is_array());
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "https://example.com/a.jpg");
    }

    #[test]
    fn extra_params_merge_into_body() {
        let mut cfg = config();
        cfg.extra_params
            .insert("temperature".into(), json!(0.2));
        let backend = OpenAiBackend::new(cfg);
        let body = backend.build_body(&ChatTurnParams::default(), false);
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn codec_extracts_delta_full_and_error() {
        let codec = OpenAiCodec;
        let fragment = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(codec.extract_delta(&fragment), Some("hi"));

        let result = json!({"choices": [{"message": {"content": "full"}}]});
        assert_eq!(codec.extract_full_text(&result).as_deref(), Some("full"));

        let error = json!({"error": {"message": "bad key"}});
        assert_eq!(codec.extract_error(&error).as_deref(), Some("bad key"));
        assert_eq!(codec.extract_error(&result), None);
    }

    #[test]
    fn codec_missing_shapes_are_none() {
        let codec = OpenAiCodec;
        assert_eq!(codec.extract_delta(&json!({"choices": []})), None);
        assert_eq!(codec.extract_full_text(&json!({})), None);
    }
}
