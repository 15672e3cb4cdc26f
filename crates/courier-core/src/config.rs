use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Telegram's hard message limit is 4096 characters.
pub const MESSAGE_CHAR_LIMIT: usize = 4096;
/// Error replies are truncated to this many characters before sending.
pub const ERROR_REPLY_MAX_CHARS: usize = 2048;
/// Recent message-id window kept per chat for replay suppression.
pub const RECENT_ID_WINDOW: usize = 100;

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    pub telegram: TelegramConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub intents: Vec<IntentRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Bot username, used for mention stripping in groups. When empty it is
    /// resolved once via getMe and cached.
    #[serde(default)]
    pub bot_name: String,
    #[serde(default = "default_api_domain")]
    pub api_domain: String,
    /// When true, the allow-lists below are bypassed entirely.
    #[serde(default)]
    pub open_access: bool,
    /// Private chat ids allowed to talk to the bot.
    #[serde(default)]
    pub chat_white_list: Vec<String>,
    /// Group chat ids allowed to talk to the bot.
    #[serde(default)]
    pub group_white_list: Vec<String>,
    #[serde(default = "bool_true")]
    pub group_bot_enable: bool,
    /// When false, every group member gets their own history/config keys.
    #[serde(default = "bool_true")]
    pub group_share_history: bool,
    /// Prepend the text of a replied-to message to the model input.
    #[serde(default)]
    pub extra_message_context: bool,
    /// Reject replayed message ids (bounded per-chat window).
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default = "bool_true")]
    pub stream_mode: bool,
    /// Replace the placeholder with a /new + /redo quick-reply keyboard
    /// after a successful turn.
    #[serde(default)]
    pub show_reply_button: bool,
    /// Parse mode for outbound messages; streaming edits always go plain.
    #[serde(default = "default_parse_mode")]
    pub default_parse_mode: Option<String>,
    /// Minimum interval between streaming edits. Zero or less disables the
    /// check and leaves throttling to the flush threshold alone.
    #[serde(default)]
    pub min_stream_interval_ms: i64,
    /// Which photo size to pick from a multi-size photo message: >= 0 counts
    /// from the smallest, negative counts back from the largest.
    #[serde(default = "default_photo_size_offset")]
    pub photo_size_offset: i64,
}

/// Upstream model vendor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Openai,
    Cohere,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_vendor")]
    pub vendor: Vendor,
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// System prompt prepended to every conversation. `None` sends no
    /// system message at all.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_system_role")]
    pub system_role: String,
    /// Completion request timeout. Zero or less disables the timeout.
    #[serde(default)]
    pub timeout_ms: u64,
    /// First streaming flush happens once this many unflushed characters
    /// accumulate; the threshold then grows by `flush_grow` per flush.
    #[serde(default = "default_flush_start")]
    pub flush_start: usize,
    #[serde(default = "default_flush_grow")]
    pub flush_grow: usize,
    /// How images are handed to the model: "url" or "base64".
    #[serde(default = "default_image_mode")]
    pub image_transfer_mode: String,
    /// Extra JSON fields merged into the request body verbatim.
    #[serde(default)]
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "bool_true")]
    pub auto_trim: bool,
    /// Keep at most this many entries. Negative keeps everything; zero
    /// disables history persistence entirely.
    #[serde(default = "default_max_entries")]
    pub max_entries: i64,
    /// Character budget across kept entries. Zero or less disables the
    /// budget phase.
    #[serde(default = "default_max_budget")]
    pub max_budget: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            auto_trim: true,
            max_entries: default_max_entries(),
            max_budget: default_max_budget(),
        }
    }
}

/// A passive intent rule: free text matching any keyword is redirected to
/// `command` instead of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRule {
    pub keywords: Vec<String>,
    pub command: String,
    /// Candidate argument values searched for in the text (e.g. place
    /// names). First hit wins; `fallback_arg` applies when none match.
    #[serde(default)]
    pub arg_candidates: Vec<String>,
    #[serde(default)]
    pub fallback_arg: Option<String>,
    /// Pass the whole message text as the command argument instead.
    #[serde(default)]
    pub full_text_arg: bool,
}

fn bool_true() -> bool {
    true
}
fn default_api_domain() -> String {
    "https://api.telegram.org".to_string()
}
fn default_parse_mode() -> Option<String> {
    Some("MarkdownV2".to_string())
}
fn default_photo_size_offset() -> i64 {
    1
}
fn default_vendor() -> Vendor {
    Vendor::Openai
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_system_role() -> String {
    "system".to_string()
}
fn default_flush_start() -> usize {
    50
}
fn default_flush_grow() -> usize {
    20
}
fn default_image_mode() -> String {
    "url".to_string()
}
fn default_max_entries() -> i64 {
    20
}
fn default_max_budget() -> i64 {
    -1
}

impl CourierConfig {
    /// Load config from a TOML file with COURIER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.courier/courier.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CourierConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COURIER_").split("_"))
            .extract()
            .map_err(|e| crate::error::CourierError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The numeric bot id embedded in a `123456:ABC-...` bot token.
    pub fn bot_id(&self) -> String {
        self.telegram
            .bot_token
            .split(':')
            .next()
            .unwrap_or("")
            .to_string()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.courier/courier.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> CourierConfig {
        let toml = r#"
            [telegram]
            bot_token = "42:token"

            [backend]
            api_key = "sk-test"
        "#;
        Figment::new()
            .merge(figment::providers::Toml::string(toml))
            .extract()
            .expect("minimal config parses")
    }

    #[test]
    fn defaults_fill_in() {
        let cfg = minimal_config();
        assert_eq!(cfg.backend.vendor, Vendor::Openai);
        assert_eq!(cfg.backend.flush_start, 50);
        assert_eq!(cfg.backend.flush_grow, 20);
        assert_eq!(cfg.history.max_entries, 20);
        assert_eq!(cfg.history.max_budget, -1);
        assert!(cfg.telegram.stream_mode);
        assert!(!cfg.telegram.safe_mode);
        assert_eq!(cfg.telegram.default_parse_mode.as_deref(), Some("MarkdownV2"));
    }

    #[test]
    fn bot_id_from_token() {
        let cfg = minimal_config();
        assert_eq!(cfg.bot_id(), "42");
    }

    #[test]
    fn vendor_parses_lowercase() {
        let toml = r#"
            [telegram]
            bot_token = "1:t"

            [backend]
            api_key = "k"
            vendor = "anthropic"
        "#;
        let cfg: CourierConfig = Figment::new()
            .merge(figment::providers::Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(cfg.backend.vendor, Vendor::Anthropic);
    }

    #[test]
    fn intent_rules_parse() {
        let toml = r#"
            [telegram]
            bot_token = "1:t"

            [backend]
            api_key = "k"

            [[intents]]
            keywords = ["weather", "forecast"]
            command = "/wt"
            arg_candidates = ["Taipei", "Kaohsiung"]
            fallback_arg = "Taipei"
        "#;
        let cfg: CourierConfig = Figment::new()
            .merge(figment::providers::Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(cfg.intents.len(), 1);
        assert_eq!(cfg.intents[0].command, "/wt");
        assert!(!cfg.intents[0].full_text_arg);
    }
}
