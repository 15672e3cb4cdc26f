//! The per-update middleware chain.
//!
//! Ordered stages run strictly in sequence; the first stage that does not
//! return `Skip` ends the turn. Stages signal outcomes structurally —
//! `Dropped` produces no visible output, `Denied` stops with a message —
//! and never throw to mean "no response". A stage `Err` is caught exactly
//! once, here, and becomes a bounded plain-text error reply.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use courier_agent::ChatBackend;
use courier_core::cache::TtlCache;
use courier_core::config::{CourierConfig, ERROR_REPLY_MAX_CHARS, RECENT_ID_WINDOW};
use courier_core::types::{MessageEntity, TurnMessage, Update};
use courier_history::KvStore;

use crate::api::{ChatAdmin, MessagePort, SendOptions};
use crate::chat;
use crate::commands::{CallbackTable, CommandHandler, CommandTable};
use crate::context::{ShareContext, TurnContext, UserSettings};
use crate::error::RelayError;
use crate::intent;
use crate::stats;

/// What one middleware stage decided about the update.
pub enum StageResult {
    /// Not this stage's business — continue the chain.
    Skip,
    /// The stage produced the turn's outbound action.
    Handled,
    /// Stop silently: the user sees nothing (duplicate, no mention,
    /// unsupported content).
    Dropped(&'static str),
    /// Stop and tell the user why.
    Denied(String),
}

/// Final disposition of one update, for the host's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Handled,
    Dropped,
    Denied,
    Failed,
}

#[async_trait]
trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError>;
}

/// The top-level update handler. Built once at startup with the immutable
/// command/callback tables; one `handle_update` call per webhook delivery.
pub struct Dispatcher {
    config: Arc<CourierConfig>,
    api: Arc<dyn MessagePort>,
    store: Arc<dyn KvStore>,
    backend: Arc<dyn ChatBackend>,
    admin_cache: Arc<TtlCache<Vec<ChatAdmin>>>,
    command_help: Arc<String>,
    stages: Vec<Box<dyn Stage>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CourierConfig>,
        api: Arc<dyn MessagePort>,
        store: Arc<dyn KvStore>,
        backend: Arc<dyn ChatBackend>,
        commands: CommandTable,
        callbacks: CallbackTable,
        location_handler: Option<Arc<dyn CommandHandler>>,
        admin_cache: Arc<TtlCache<Vec<ChatAdmin>>>,
    ) -> Self {
        let command_help = Arc::new(commands.render_help());
        let commands = Arc::new(commands);
        let callbacks = Arc::new(callbacks);

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(InitContext),
            Box::new(RecordStats),
            Box::new(EnvReady),
            Box::new(CallbackDispatch {
                callbacks: Arc::clone(&callbacks),
            }),
            Box::new(AccessControl),
            Box::new(UnsupportedContent),
            Box::new(GroupMention),
            Box::new(DedupRecent),
            Box::new(CommandDispatch {
                commands: Arc::clone(&commands),
            }),
            Box::new(IntentDetect {
                commands: Arc::clone(&commands),
            }),
            Box::new(LocationRoute {
                handler: location_handler,
            }),
            Box::new(ChatFallback),
        ];

        Self {
            config,
            api,
            store,
            backend,
            admin_cache,
            command_help,
            stages,
        }
    }

    /// Process one inbound update to exactly one outbound action (or
    /// none).
    pub async fn handle_update(&self, update: Update) -> TurnOutcome {
        let mut msg = match TurnMessage::normalize(update) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "update dropped at normalization");
                return TurnOutcome::Dropped;
            }
        };

        // Never talk to other bots.
        if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
            return TurnOutcome::Dropped;
        }

        let mut ctx = self.build_context(&msg);

        for stage in &self.stages {
            match stage.run(&mut msg, &mut ctx).await {
                Ok(StageResult::Skip) => continue,
                Ok(StageResult::Handled) => return TurnOutcome::Handled,
                Ok(StageResult::Dropped(reason)) => {
                    debug!(stage = stage.name(), reason, "update dropped");
                    return TurnOutcome::Dropped;
                }
                Ok(StageResult::Denied(text)) => {
                    if let Err(e) = ctx.reply(&text).await {
                        warn!(error = %e, "denial reply failed");
                    }
                    return TurnOutcome::Denied;
                }
                Err(e) => {
                    warn!(stage = stage.name(), error = %e, "turn failed");
                    send_error_reply(&mut ctx, &e).await;
                    return TurnOutcome::Failed;
                }
            }
        }

        TurnOutcome::Dropped
    }

    fn build_context(&self, msg: &TurnMessage) -> TurnContext {
        let is_group = msg.chat_kind.is_group();
        TurnContext {
            config: Arc::clone(&self.config),
            api: Arc::clone(&self.api),
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
            admin_cache: Arc::clone(&self.admin_cache),
            command_help: Arc::clone(&self.command_help),
            share: ShareContext::derive(msg, &self.config),
            outbound: SendOptions {
                chat_id: msg.chat_id,
                reply_to_message_id: is_group.then_some(msg.message_id),
                allow_sending_without_reply: is_group,
                parse_mode: self.config.telegram.default_parse_mode.clone(),
                ..Default::default()
            },
            settings: UserSettings::default(),
        }
    }
}

/// The single outermost error handler: bounded length, formatting and
/// link previews disabled so a formatting error cannot compound the
/// original one.
async fn send_error_reply(ctx: &mut TurnContext, error: &RelayError) {
    let mut text = format!("ERROR: {error}");
    if text.chars().count() > ERROR_REPLY_MAX_CHARS {
        text = text.chars().take(ERROR_REPLY_MAX_CHARS).collect();
    }
    ctx.outbound.parse_mode = None;
    ctx.outbound.disable_web_page_preview = true;
    if let Err(e) = ctx.reply(&text).await {
        warn!(error = %e, "error reply failed");
    }
}

// ── Stages, in chain order ────────────────────────────────────────────────────

/// Storage keys were derived when the context was built; this stage loads
/// the per-chat settings overlay.
struct InitContext;

#[async_trait]
impl Stage for InitContext {
    fn name(&self) -> &'static str {
        "init_context"
    }

    async fn run(
        &self,
        _msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        ctx.settings = UserSettings::load(ctx.store.as_ref(), &ctx.share.settings_key).await;
        Ok(StageResult::Skip)
    }
}

/// Best-effort usage recording, detached from the turn.
struct RecordStats;

#[async_trait]
impl Stage for RecordStats {
    fn name(&self) -> &'static str {
        "record_stats"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        stats::record_usage(Arc::clone(&ctx.store), &ctx.share, msg.chat_kind);
        Ok(StageResult::Skip)
    }
}

struct EnvReady;

#[async_trait]
impl Stage for EnvReady {
    fn name(&self) -> &'static str {
        "env_ready"
    }

    async fn run(
        &self,
        _msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        if ctx.config.backend.api_key.is_empty() {
            return Ok(StageResult::Denied(
                "Model backend is not configured.".to_string(),
            ));
        }
        Ok(StageResult::Skip)
    }
}

/// Inline-keyboard callbacks: acknowledge the query, then route by data
/// prefix. Unrecognized callback data falls through the chain with the
/// data as the working text.
struct CallbackDispatch {
    callbacks: Arc<CallbackTable>,
}

#[async_trait]
impl Stage for CallbackDispatch {
    fn name(&self) -> &'static str {
        "callback_dispatch"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let Some(callback) = msg.callback.clone() else {
            return Ok(StageResult::Skip);
        };

        // Clear the button's loading state; failure is cosmetic.
        if let Err(e) = ctx.api.answer_callback_query(&callback.id).await {
            debug!(error = %e, "answerCallbackQuery failed");
        }

        match self.callbacks.dispatch(&callback.data) {
            Some((prefix, handler, rest)) => {
                let handler = Arc::clone(handler);
                let prefix = prefix.to_string();
                let rest = rest.to_string();
                handler.run(msg, &prefix, &rest, ctx).await
            }
            None => Ok(StageResult::Skip),
        }
    }
}

/// Allow-list enforcement. Denials are deterministic messages, never
/// errors.
struct AccessControl;

#[async_trait]
impl Stage for AccessControl {
    fn name(&self) -> &'static str {
        "access_control"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let cfg = &ctx.config.telegram;
        if cfg.open_access {
            return Ok(StageResult::Skip);
        }
        let chat_id = msg.chat_id.to_string();

        if msg.chat_kind == courier_core::types::ChatKind::Private {
            if !cfg.chat_white_list.contains(&chat_id) {
                return Ok(StageResult::Denied(format!(
                    "You are not in the allow list, please contact the administrator \
                     to add you. Your chat_id: {chat_id}"
                )));
            }
            return Ok(StageResult::Skip);
        }

        if msg.chat_kind.is_group() {
            if !cfg.group_bot_enable {
                return Ok(StageResult::Dropped("group bot disabled"));
            }
            if !cfg.group_white_list.contains(&chat_id) {
                return Ok(StageResult::Denied(format!(
                    "Your group is not in the allow list, please contact the \
                     administrator to add it. Your chat_id: {chat_id}"
                )));
            }
            return Ok(StageResult::Skip);
        }

        Ok(StageResult::Denied(format!(
            "Chat type not supported: {}",
            msg.chat_kind.as_str()
        )))
    }
}

struct UnsupportedContent;

#[async_trait]
impl Stage for UnsupportedContent {
    fn name(&self) -> &'static str {
        "unsupported_content"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        _ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let supported = msg.text.is_some()
            || msg.caption.is_some()
            || !msg.photo.is_empty()
            || msg.location.is_some();
        if supported {
            Ok(StageResult::Skip)
        } else {
            Ok(StageResult::Dropped("unsupported message type"))
        }
    }
}

/// In groups, only proceed when the bot is mentioned, the message replies
/// to the bot, or the message is a direct command. Strips the mention from
/// the working text.
struct GroupMention;

#[async_trait]
impl Stage for GroupMention {
    fn name(&self) -> &'static str {
        "group_mention"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        if !msg.chat_kind.is_group() {
            return Ok(StageResult::Skip);
        }

        if let Some(reply) = &msg.reply_to {
            // A reply to the bot's own message needs no mention.
            if reply.from_id.map(|id| id.to_string()).as_deref()
                == Some(ctx.share.bot_id.as_str())
            {
                return Ok(StageResult::Skip);
            }
            if ctx.config.telegram.extra_message_context {
                ctx.share.extra_context = reply.text.clone();
            }
        }

        let bot_name = if !ctx.config.telegram.bot_name.is_empty() {
            ctx.config.telegram.bot_name.clone()
        } else {
            match ctx.api.get_bot_username().await {
                Ok(name) if !name.is_empty() => name,
                Ok(_) | Err(_) => return Ok(StageResult::Dropped("bot username unavailable")),
            }
        };

        let original = msg.text_or_caption().unwrap_or_default().to_string();
        if original.is_empty() {
            return Ok(StageResult::Dropped("empty group message"));
        }
        let is_command = original.trim_start().starts_with('/');

        if msg.entities.is_empty() {
            if is_command {
                return Ok(StageResult::Skip);
            }
            return Ok(StageResult::Dropped("no mention entities"));
        }

        let (stripped, mentioned) = strip_mention(&original, &msg.entities, &bot_name);
        if !mentioned && !is_command {
            return Ok(StageResult::Dropped("bot not mentioned"));
        }
        msg.text = Some(stripped);
        Ok(StageResult::Skip)
    }
}

/// Replay suppression: a bounded window of recently seen message ids per
/// chat.
struct DedupRecent;

#[async_trait]
impl Stage for DedupRecent {
    fn name(&self) -> &'static str {
        "dedup_recent"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        if !ctx.config.telegram.safe_mode {
            return Ok(StageResult::Skip);
        }
        let key = ctx.share.last_message_id_key.clone();
        let mut ids: Vec<i64> = match ctx.store.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "recent-id window load failed");
                Vec::new()
            }
        };

        if ids.contains(&msg.message_id) {
            return Ok(StageResult::Dropped("duplicate message"));
        }
        ids.push(msg.message_id);
        if ids.len() > RECENT_ID_WINDOW {
            let excess = ids.len() - RECENT_ID_WINDOW;
            ids.drain(..excess);
        }
        if let Err(e) = ctx
            .store
            .put(&key, &serde_json::to_string(&ids).unwrap_or_default())
            .await
        {
            warn!(error = %e, "recent-id window persist failed");
        }
        Ok(StageResult::Skip)
    }
}

/// Exact or prefix match against the command table, with per-command
/// authorization.
struct CommandDispatch {
    commands: Arc<CommandTable>,
}

#[async_trait]
impl Stage for CommandDispatch {
    fn name(&self) -> &'static str {
        "command_dispatch"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let text = msg.text_or_caption().unwrap_or_default().to_string();
        if !text.starts_with('/') {
            return Ok(StageResult::Skip);
        }
        let Some((name, spec, args)) = self.commands.dispatch(&text) else {
            return Ok(StageResult::Skip);
        };

        if let Some(predicate) = spec.need_auth {
            if let Some(roles) = predicate(msg.chat_kind) {
                let role = match ctx.resolve_chat_role(ctx.share.speaker_id).await {
                    Ok(role) => role,
                    Err(e) => {
                        warn!(error = %e, "chat role resolution failed");
                        return Ok(StageResult::Denied(
                            "Failed to resolve chat role.".to_string(),
                        ));
                    }
                };
                if !roles.contains(&role.as_str()) {
                    return Ok(StageResult::Denied(format!(
                        "Permission denied, need {}",
                        roles.join(" or ")
                    )));
                }
            }
        }

        let handler = Arc::clone(&spec.handler);
        let name = name.to_string();
        let args = args.to_string();
        handler.run(msg, &name, &args, ctx).await
    }
}

/// Keyword heuristics that redirect free text to a command.
struct IntentDetect {
    commands: Arc<CommandTable>,
}

#[async_trait]
impl Stage for IntentDetect {
    fn name(&self) -> &'static str {
        "intent_detect"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let Some(text) = msg.text.clone() else {
            return Ok(StageResult::Skip);
        };
        if text.starts_with('/') {
            return Ok(StageResult::Skip);
        }
        let Some((command, args)) = intent::detect(&ctx.config.intents, &text) else {
            return Ok(StageResult::Skip);
        };
        let Some(spec) = self.commands.get(&command) else {
            warn!(command, "intent rule targets an unregistered command");
            return Ok(StageResult::Skip);
        };
        info!(command, "passive intent matched");
        let handler = Arc::clone(&spec.handler);
        handler.run(msg, &command, &args, ctx).await
    }
}

struct LocationRoute {
    handler: Option<Arc<dyn CommandHandler>>,
}

#[async_trait]
impl Stage for LocationRoute {
    fn name(&self) -> &'static str {
        "location_route"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        if msg.location.is_none() {
            return Ok(StageResult::Skip);
        }
        match &self.handler {
            Some(handler) => Arc::clone(handler).run(msg, "location", "", ctx).await,
            None => Ok(StageResult::Skip),
        }
    }
}

/// Everything that reached the end of the chain is a model turn.
struct ChatFallback;

#[async_trait]
impl Stage for ChatFallback {
    fn name(&self) -> &'static str {
        "chat_fallback"
    }

    async fn run(
        &self,
        msg: &mut TurnMessage,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        chat::chat_with_backend(msg, ctx, None, None).await
    }
}

/// Remove the bot mention from a group message, reporting whether the bot
/// was addressed at all. Entity offsets are UTF-16 code units, per the
/// Bot API.
fn strip_mention(text: &str, entities: &[MessageEntity], bot_name: &str) -> (String, bool) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let slice = |a: usize, b: usize| -> String {
        let a = a.min(units.len());
        let b = b.min(units.len());
        if a >= b {
            String::new()
        } else {
            String::from_utf16_lossy(&units[a..b])
        }
    };

    let at_name = format!("@{bot_name}");
    let mut content = String::new();
    let mut offset = 0usize;
    let mut mentioned = false;

    for entity in entities {
        let start = entity.offset;
        let end = entity.offset + entity.length;
        match entity.kind.as_str() {
            "bot_command" => {
                if !mentioned {
                    let mention = slice(start, end);
                    if mention.ends_with(bot_name) {
                        mentioned = true;
                    }
                    let command = mention.replace(&at_name, "").replace(bot_name, "");
                    content.push_str(command.trim());
                    offset = end;
                }
            }
            "mention" | "text_mention" => {
                if !mentioned {
                    let mention = slice(start, end);
                    if mention == bot_name || mention == at_name {
                        mentioned = true;
                    }
                }
                content.push_str(&slice(offset, start));
                offset = end;
            }
            _ => {}
        }
    }
    content.push_str(&slice(offset, units.len()));
    (content.trim().to_string(), mentioned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, offset: usize, length: usize) -> MessageEntity {
        MessageEntity {
            kind: kind.to_string(),
            offset,
            length,
        }
    }

    #[test]
    fn mention_is_stripped_and_detected() {
        let (content, mentioned) = strip_mention(
            "@mybot what is rust",
            &[entity("mention", 0, 6)],
            "mybot",
        );
        assert!(mentioned);
        assert_eq!(content, "what is rust");
    }

    #[test]
    fn other_mention_does_not_count() {
        let (content, mentioned) = strip_mention(
            "hey @otherbot hello",
            &[entity("mention", 4, 9)],
            "mybot",
        );
        assert!(!mentioned);
        // The foreign mention is still cut out of the text.
        assert_eq!(content, "hey  hello".trim());
    }

    #[test]
    fn command_with_bot_suffix_counts_as_mention() {
        let (content, mentioned) = strip_mention(
            "/chat@mybot tell me a joke",
            &[entity("bot_command", 0, 11)],
            "mybot",
        );
        assert!(mentioned);
        assert_eq!(content, "/chat tell me a joke");
    }

    #[test]
    fn mention_mid_text_preserves_both_sides() {
        let (content, mentioned) = strip_mention(
            "hello @mybot world",
            &[entity("mention", 6, 6)],
            "mybot",
        );
        assert!(mentioned);
        assert_eq!(content, "hello  world".trim());
    }

    #[test]
    fn utf16_offsets_with_wide_chars() {
        // "你好 @mybot hi" — the two CJK chars are one UTF-16 unit each,
        // so the mention starts at unit 3.
        let text = "你好 @mybot hi";
        let (content, mentioned) =
            strip_mention(text, &[entity("mention", 3, 6)], "mybot");
        assert!(mentioned);
        assert_eq!(content, "你好  hi".trim());
    }

    #[test]
    fn out_of_range_entity_is_harmless() {
        let (content, mentioned) =
            strip_mention("short", &[entity("mention", 10, 5)], "mybot");
        assert!(!mentioned);
        assert_eq!(content, "short");
    }
}
