//! Outbound send/edit primitive and Telegram Bot API client.
//!
//! Telegram's message limit is 4096 characters. We use 4090 for safety.
//! Tries MarkdownV2 first; falls back to plain text if Telegram rejects the
//! parse mode. Rate-limit responses (429 + Retry-After) are surfaced in the
//! returned `SendOutcome`, never raised — the delivery controller turns
//! them into a backoff window.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use courier_core::cache::TtlCache;
use courier_core::config::TelegramConfig;

use crate::error::RelayError;

/// Maximum characters per outbound message (limit is 4096; we use 4090 for
/// safety).
const CHUNK_MAX: usize = courier_core::config::MESSAGE_CHAR_LIMIT - 6;

/// Parameters for one outbound send or edit. Doubles as the mutable
/// per-turn "current chat context": the delivery controller flips
/// `parse_mode`, `message_id` and `reply_markup` on it as the turn
/// progresses.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub chat_id: i64,
    /// Edit this message instead of sending a new one.
    pub message_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub parse_mode: Option<String>,
    pub reply_markup: Option<Value>,
    pub disable_web_page_preview: bool,
    pub allow_sending_without_reply: bool,
}

/// What the platform said about one send attempt.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub status: u16,
    /// Identifier of the sent/edited message, when the call succeeded.
    pub message_id: Option<i64>,
    /// Seconds to back off, present on a rate-limit response.
    pub retry_after: Option<u64>,
}

impl SendOutcome {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// A chat administrator, as far as role resolution cares.
#[derive(Debug, Clone)]
pub struct ChatAdmin {
    pub user_id: i64,
    pub status: String,
}

/// The platform seam the delivery controller and middleware depend on.
/// `TelegramApi` is the real implementation; tests substitute stubs.
#[async_trait]
pub trait MessagePort: Send + Sync {
    /// Send or edit a message. Non-2xx platform responses (including 429)
    /// come back as an `Ok(SendOutcome)`; only transport failures error.
    async fn send(&self, text: &str, opts: &SendOptions) -> Result<SendOutcome, RelayError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), RelayError>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), RelayError>;

    async fn answer_callback_query(&self, callback_id: &str) -> Result<(), RelayError>;

    async fn get_bot_username(&self) -> Result<String, RelayError>;

    async fn get_chat_administrators(&self, chat_id: i64) -> Result<Vec<ChatAdmin>, RelayError>;

    /// Resolve a file id to a downloadable URL.
    async fn get_file_url(&self, file_id: &str) -> Result<Option<String>, RelayError>;
}

pub struct TelegramApi {
    client: reqwest::Client,
    token: String,
    api_domain: String,
    /// Bot identity cache, constructed by the embedder.
    bot_cache: Arc<TtlCache<String>>,
}

impl TelegramApi {
    pub fn new(cfg: &TelegramConfig, bot_cache: Arc<TtlCache<String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: cfg.bot_token.clone(),
            api_domain: cfg.api_domain.trim_end_matches('/').to_string(),
            bot_cache,
        }
    }

    async fn call(&self, method: &str, body: &Value) -> Result<reqwest::Response, RelayError> {
        let url = format!("{}/bot{}/{}", self.api_domain, self.token, method);
        Ok(self.client.post(&url).json(body).send().await?)
    }

    /// Call a method and fail on a non-ok platform response.
    async fn call_expect_ok(&self, method: &str, body: &Value) -> Result<Value, RelayError> {
        let resp = self.call(method, body).await?;
        let status = resp.status().as_u16();
        let json: Value = resp.json().await.unwrap_or(Value::Null);
        if json["ok"].as_bool() != Some(true) {
            return Err(RelayError::Api {
                status,
                description: json["description"].as_str().unwrap_or("unknown").to_string(),
            });
        }
        Ok(json)
    }

    /// One raw sendMessage/editMessageText round-trip, no splitting or
    /// fallback.
    async fn send_raw(
        &self,
        text: &str,
        opts: &SendOptions,
        parse_mode: Option<&str>,
        message_id: Option<i64>,
    ) -> Result<SendOutcome, RelayError> {
        let mut body = json!({
            "chat_id": opts.chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        if let Some(id) = opts.reply_to_message_id {
            body["reply_to_message_id"] = json!(id);
        }
        if opts.allow_sending_without_reply {
            body["allow_sending_without_reply"] = json!(true);
        }
        if opts.disable_web_page_preview {
            body["disable_web_page_preview"] = json!(true);
        }
        if let Some(markup) = &opts.reply_markup {
            body["reply_markup"] = markup.clone();
        }

        let method = match message_id {
            Some(id) => {
                body["message_id"] = json!(id);
                "editMessageText"
            }
            None => "sendMessage",
        };

        let resp = self.call(method, &body).await?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let json: Value = resp.json().await.unwrap_or(Value::Null);

        Ok(SendOutcome {
            status,
            message_id: json["result"]["message_id"].as_i64(),
            retry_after,
        })
    }
}

#[async_trait]
impl MessagePort for TelegramApi {
    async fn send(&self, text: &str, opts: &SendOptions) -> Result<SendOutcome, RelayError> {
        if text.len() <= CHUNK_MAX {
            if let Some(mode) = opts.parse_mode.as_deref() {
                let escaped = if mode == "MarkdownV2" {
                    escape_markdown_v2(text)
                } else {
                    text.to_string()
                };
                let outcome = self
                    .send_raw(&escaped, opts, Some(mode), opts.message_id)
                    .await?;
                if outcome.ok() || outcome.rate_limited() {
                    return Ok(outcome);
                }
                // Parse mode rejected — resend the original text plain.
                debug!(status = outcome.status, "parse mode rejected, falling back to plain text");
            }
            return self.send_raw(text, opts, None, opts.message_id).await;
        }

        // Over the limit: plain text, split into chunks. Only the first
        // chunk may edit an existing message; the rest are new sends.
        let chunks = split_chunks_smart(text);
        let mut last = SendOutcome {
            status: 0,
            message_id: None,
            retry_after: None,
        };
        for (i, chunk) in chunks.iter().enumerate() {
            let message_id = if i == 0 { opts.message_id } else { None };
            last = self.send_raw(chunk, opts, None, message_id).await?;
        }
        Ok(last)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), RelayError> {
        self.call_expect_ok(
            "deleteMessage",
            &json!({"chat_id": chat_id, "message_id": message_id}),
        )
        .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), RelayError> {
        self.call_expect_ok(
            "sendChatAction",
            &json!({"chat_id": chat_id, "action": action}),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str) -> Result<(), RelayError> {
        self.call_expect_ok(
            "answerCallbackQuery",
            &json!({"callback_query_id": callback_id}),
        )
        .await?;
        Ok(())
    }

    async fn get_bot_username(&self) -> Result<String, RelayError> {
        if let Some(name) = self.bot_cache.get("bot_username") {
            return Ok(name);
        }
        let json = self.call_expect_ok("getMe", &json!({})).await?;
        let name = json["result"]["username"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.bot_cache.put("bot_username", name.clone());
        Ok(name)
    }

    async fn get_chat_administrators(&self, chat_id: i64) -> Result<Vec<ChatAdmin>, RelayError> {
        let json = self
            .call_expect_ok("getChatAdministrators", &json!({"chat_id": chat_id}))
            .await?;
        let admins = json["result"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|entry| {
                        Some(ChatAdmin {
                            user_id: entry["user"]["id"].as_i64()?,
                            status: entry["status"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(admins)
    }

    async fn get_file_url(&self, file_id: &str) -> Result<Option<String>, RelayError> {
        let json = self
            .call_expect_ok("getFile", &json!({"file_id": file_id}))
            .await?;
        Ok(json["result"]["file_path"].as_str().map(|path| {
            format!("{}/file/bot{}/{}", self.api_domain, self.token, path)
        }))
    }
}

/// Escape special characters for Telegram MarkdownV2.
///
/// MarkdownV2 requires escaping: `_ * [ ] ( ) ~ ` # + - = | { } . !`
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Code-fence-aware message splitter.
///
/// When a split falls inside a fenced code block, the fence is closed
/// before the chunk boundary and re-opened at the start of the next chunk.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in &lines {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                if lang.is_empty() {
                    current.push_str("```\n");
                } else {
                    current.push_str("```");
                    current.push_str(lang);
                    current.push('\n');
                }
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after_fence) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None; // closing fence
            } else {
                fence_lang = Some(after_fence.trim().to_string()); // opening fence
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk that still exceeds CHUNK_MAX (e.g. a single
    // line longer than the limit).
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
        } else {
            let mut remaining = chunk.as_str();
            while remaining.len() > CHUNK_MAX {
                let split_at = remaining[..CHUNK_MAX]
                    .rfind('\n')
                    .or_else(|| remaining[..CHUNK_MAX].rfind(' '))
                    .unwrap_or(CHUNK_MAX);
                result.push(remaining[..split_at].to_string());
                remaining = remaining[split_at..].trim_start();
            }
            if !remaining.is_empty() {
                result.push(remaining.to_string());
            }
        }
    }

    result
}
