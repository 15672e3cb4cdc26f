//! Per-update context: storage keys, outbound parameters, user settings.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use courier_agent::ChatBackend;
use courier_core::cache::TtlCache;
use courier_core::types::TurnMessage;
use courier_core::CourierConfig;
use courier_history::KvStore;

use crate::api::{ChatAdmin, MessagePort, SendOptions, SendOutcome};
use crate::error::RelayError;

/// Identity-derived keys and facts shared by every stage of one update.
///
/// Key formats (bot id appended when known, user id appended in
/// non-shared groups, thread id appended in forum topics):
///
/// | Key | Format |
/// |---|---|
/// | history | `history:{chat_id}[:{bot_id}][:{user_id}][:{thread_id}]` |
/// | recent ids | `last_message_id:{history_key}` |
/// | settings | `user_config:{chat_id}[:{bot_id}][:{user_id}][:{thread_id}]` |
/// | usage | `usage:{bot_id}` |
#[derive(Debug, Clone)]
pub struct ShareContext {
    pub bot_id: String,
    pub chat_id: i64,
    pub speaker_id: i64,
    pub history_key: String,
    pub last_message_id_key: String,
    pub settings_key: String,
    pub group_admin_key: Option<String>,
    pub usage_key: String,
    /// Text of a replied-to message, prepended to the model input when
    /// reply-context enrichment is enabled.
    pub extra_context: Option<String>,
}

impl ShareContext {
    pub fn derive(msg: &TurnMessage, cfg: &CourierConfig) -> Self {
        let bot_id = cfg.bot_id();
        let mut history_key = format!("history:{}", msg.chat_id);
        let mut settings_key = format!("user_config:{}", msg.chat_id);
        if !bot_id.is_empty() {
            history_key.push_str(&format!(":{bot_id}"));
            settings_key.push_str(&format!(":{bot_id}"));
        }

        let mut group_admin_key = None;
        if msg.chat_kind.is_group() {
            if !cfg.telegram.group_share_history {
                if let Some(from) = &msg.from {
                    history_key.push_str(&format!(":{}", from.id));
                    settings_key.push_str(&format!(":{}", from.id));
                }
            }
            group_admin_key = Some(format!("group_admin:{}", msg.chat_id));
        }

        if msg.is_forum && msg.is_topic_message {
            if let Some(thread_id) = msg.thread_id {
                history_key.push_str(&format!(":{thread_id}"));
                settings_key.push_str(&format!(":{thread_id}"));
            }
        }

        ShareContext {
            chat_id: msg.chat_id,
            speaker_id: msg.from.as_ref().map(|u| u.id).unwrap_or(msg.chat_id),
            last_message_id_key: format!("last_message_id:{history_key}"),
            usage_key: format!("usage:{bot_id}"),
            history_key,
            settings_key,
            group_admin_key,
            bot_id,
            extra_context: None,
        }
    }
}

/// Per-chat overrides merged over the config defaults. Anything the
/// settings blob does not carry falls back to the global value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserSettings {
    pub system_prompt: Option<String>,
    pub stream_mode: Option<bool>,
}

impl UserSettings {
    /// Load the overrides blob for a chat. Any failure degrades to
    /// defaults.
    pub async fn load(store: &dyn KvStore, key: &str) -> Self {
        match store.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                debug!(key, error = %e, "user settings blob is malformed, using defaults");
                Self::default()
            }),
            _ => Self::default(),
        }
    }
}

/// Request-scoped aggregate handed to every middleware stage. Constructed
/// once per update and discarded at the end of handling.
pub struct TurnContext {
    pub config: Arc<CourierConfig>,
    pub api: Arc<dyn MessagePort>,
    pub store: Arc<dyn KvStore>,
    pub backend: Arc<dyn ChatBackend>,
    pub admin_cache: Arc<TtlCache<Vec<ChatAdmin>>>,
    /// Pre-rendered /help text.
    pub command_help: Arc<String>,
    pub share: ShareContext,
    /// Mutable parameters for the turn's outbound sends.
    pub outbound: SendOptions,
    pub settings: UserSettings,
}

impl TurnContext {
    /// Send `text` with the turn's current outbound parameters.
    pub async fn reply(&self, text: &str) -> Result<SendOutcome, RelayError> {
        self.api.send(text, &self.outbound).await
    }

    /// Resolve the speaker's role in the current chat: the administrator
    /// list is fetched once and cached; everyone not on it is a "member".
    pub async fn resolve_chat_role(&self, user_id: i64) -> Result<String, RelayError> {
        let Some(key) = self.share.group_admin_key.clone() else {
            return Ok("member".to_string());
        };
        let admins = match self.admin_cache.get(&key) {
            Some(admins) => admins,
            None => {
                let admins = self.api.get_chat_administrators(self.share.chat_id).await?;
                self.admin_cache.put(&key, admins.clone());
                admins
            }
        };
        Ok(admins
            .iter()
            .find(|a| a.user_id == user_id)
            .map(|a| a.status.clone())
            .unwrap_or_else(|| "member".to_string()))
    }
}
