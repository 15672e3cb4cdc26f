//! Immutable command and callback tables.
//!
//! Tables are built once at startup via the builders and passed into the
//! dispatcher; there is no runtime registration. Each command entry
//! carries its menu scopes, an optional authorization predicate and a
//! description used for /help and menu registration.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use courier_core::types::{ChatKind, TurnMessage};
use courier_history::{HistoryEntry, Role};

use crate::chat;
use crate::context::TurnContext;
use crate::error::RelayError;
use crate::middleware::StageResult;

/// Chat contexts a command is advertised in (Telegram menu scopes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    AllPrivateChats,
    AllGroupChats,
    AllChatAdministrators,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::AllPrivateChats => "all_private_chats",
            Scope::AllGroupChats => "all_group_chats",
            Scope::AllChatAdministrators => "all_chat_administrators",
        }
    }
}

/// Given the chat type, the set of roles allowed to run the command.
/// `None` means no role check applies in that chat type.
pub type AuthPredicate = fn(ChatKind) -> Option<&'static [&'static str]>;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(
        &self,
        msg: &TurnMessage,
        command: &str,
        args: &str,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError>;
}

pub struct CommandSpec {
    pub scopes: Vec<Scope>,
    pub handler: Arc<dyn CommandHandler>,
    pub need_auth: Option<AuthPredicate>,
    pub description: String,
}

impl CommandSpec {
    pub fn new(scopes: Vec<Scope>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            scopes,
            handler,
            need_auth: None,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn auth(mut self, predicate: AuthPredicate) -> Self {
        self.need_auth = Some(predicate);
        self
    }
}

#[derive(Default)]
pub struct CommandTableBuilder {
    entries: BTreeMap<String, CommandSpec>,
}

impl CommandTableBuilder {
    pub fn command(mut self, name: &str, spec: CommandSpec) -> Self {
        self.entries.insert(name.to_string(), spec);
        self
    }

    pub fn build(self) -> CommandTable {
        CommandTable {
            entries: self.entries,
        }
    }
}

pub struct CommandTable {
    entries: BTreeMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn builder() -> CommandTableBuilder {
        CommandTableBuilder::default()
    }

    /// Builder pre-loaded with the system commands every deployment gets.
    pub fn with_builtins() -> CommandTableBuilder {
        let all = vec![
            Scope::AllPrivateChats,
            Scope::AllGroupChats,
            Scope::AllChatAdministrators,
        ];
        CommandTableBuilder::default()
            .command(
                "/new",
                CommandSpec::new(all.clone(), Arc::new(NewChat))
                    .describe("Start a new conversation"),
            )
            .command(
                "/start",
                CommandSpec::new(Vec::new(), Arc::new(NewChat)).describe("Start using the bot"),
            )
            .command(
                "/help",
                CommandSpec::new(
                    vec![Scope::AllPrivateChats, Scope::AllChatAdministrators],
                    Arc::new(Help),
                )
                .describe("Show available commands"),
            )
            .command(
                "/redo",
                CommandSpec::new(all, Arc::new(Redo))
                    .describe("Regenerate the last reply - usage: /redo [new text]"),
            )
    }

    /// Match `text` against the table: exact command or command followed
    /// by a space. Returns the entry and the argument remainder.
    pub fn dispatch<'a, 'b>(&'a self, text: &'b str) -> Option<(&'a str, &'a CommandSpec, &'b str)> {
        for (name, spec) in &self.entries {
            if text == name || text.starts_with(&format!("{name} ")) {
                let args = text[name.len()..].trim();
                return Some((name.as_str(), spec, args));
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.entries.get(name)
    }

    /// Menu registration data: scope → command names advertised there.
    pub fn scope_map(&self) -> HashMap<Scope, Vec<String>> {
        let mut map: HashMap<Scope, Vec<String>> = HashMap::new();
        for (name, spec) in &self.entries {
            for scope in &spec.scopes {
                map.entry(*scope).or_default().push(name.clone());
            }
        }
        map
    }

    /// Render the /help text from the table's descriptions.
    pub fn render_help(&self) -> String {
        let mut out = String::from("Available commands:\n");
        for (name, spec) in &self.entries {
            if spec.description.is_empty() {
                out.push_str(&format!("{name}\n"));
            } else {
                out.push_str(&format!("{name} - {}\n", spec.description));
            }
        }
        out.trim_end().to_string()
    }
}

/// Callback-query routing: longest registered prefix of the callback data
/// wins.
#[derive(Default)]
pub struct CallbackTableBuilder {
    entries: Vec<(String, Arc<dyn CommandHandler>)>,
}

impl CallbackTableBuilder {
    pub fn prefix(mut self, prefix: &str, handler: Arc<dyn CommandHandler>) -> Self {
        self.entries.push((prefix.to_string(), handler));
        self
    }

    pub fn build(mut self) -> CallbackTable {
        // Longest prefix first so "/stock2:" beats "/stock".
        self.entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        CallbackTable {
            entries: self.entries,
        }
    }
}

#[derive(Default)]
pub struct CallbackTable {
    entries: Vec<(String, Arc<dyn CommandHandler>)>,
}

impl CallbackTable {
    pub fn builder() -> CallbackTableBuilder {
        CallbackTableBuilder::default()
    }

    pub fn dispatch<'a, 'b>(
        &'a self,
        data: &'b str,
    ) -> Option<(&'a str, &'a Arc<dyn CommandHandler>, &'b str)> {
        self.entries
            .iter()
            .find(|(prefix, _)| data.starts_with(prefix.as_str()))
            .map(|(prefix, handler)| (prefix.as_str(), handler, &data[prefix.len()..]))
    }
}

// ── Built-in system commands ──────────────────────────────────────────────────

/// /new and /start: wipe the chat's history and confirm.
struct NewChat;

#[async_trait]
impl CommandHandler for NewChat {
    async fn run(
        &self,
        _msg: &TurnMessage,
        command: &str,
        _args: &str,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        ctx.store.delete(&ctx.share.history_key).await?;
        ctx.outbound.reply_markup = Some(json!({"remove_keyboard": true, "selective": true}));
        let text = if command == "/start" {
            // First contact: echo the chat id so operators can fill the
            // allow-list.
            format!("New conversation started. (chat id: {})", ctx.share.chat_id)
        } else {
            "New conversation started.".to_string()
        };
        ctx.reply(&text).await?;
        Ok(StageResult::Handled)
    }
}

/// /help: the table's descriptions, pre-rendered at dispatcher build time.
struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn run(
        &self,
        _msg: &TurnMessage,
        _command: &str,
        _args: &str,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let help = ctx.command_help.as_str().to_string();
        ctx.reply(&help).await?;
        Ok(StageResult::Handled)
    }
}

/// /redo: rewind the history to just before the last user turn and run it
/// again. An argument replaces the original text.
struct Redo;

#[async_trait]
impl CommandHandler for Redo {
    async fn run(
        &self,
        msg: &TurnMessage,
        _command: &str,
        args: &str,
        ctx: &mut TurnContext,
    ) -> Result<StageResult, RelayError> {
        let args = args.trim().to_string();
        let modifier = move |mut history: Vec<HistoryEntry>,
                             text: &str|
              -> Result<(Vec<HistoryEntry>, String), RelayError> {
            if history.is_empty() {
                return Err(RelayError::Other("History not found".into()));
            }
            let mut next_text = text.to_string();
            while let Some(entry) = history.pop() {
                if entry.role == Role::User {
                    if next_text.is_empty() {
                        next_text = entry.content;
                    }
                    break;
                }
            }
            if !args.is_empty() {
                next_text = args.clone();
            }
            Ok((history, next_text))
        };
        let modifier: &crate::chat::HistoryModifier = &modifier;
        chat::chat_with_backend(msg, ctx, Some(String::new()), Some(modifier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl CommandHandler for Nop {
        async fn run(
            &self,
            _msg: &TurnMessage,
            _command: &str,
            _args: &str,
            _ctx: &mut TurnContext,
        ) -> Result<StageResult, RelayError> {
            Ok(StageResult::Handled)
        }
    }

    #[test]
    fn dispatch_exact_and_with_args() {
        let table = CommandTable::builder()
            .command("/wt", CommandSpec::new(vec![], Arc::new(Nop)))
            .build();
        let (name, _, args) = table.dispatch("/wt").unwrap();
        assert_eq!(name, "/wt");
        assert_eq!(args, "");
        let (_, _, args) = table.dispatch("/wt Taipei").unwrap();
        assert_eq!(args, "Taipei");
    }

    #[test]
    fn dispatch_does_not_match_prefix_without_space() {
        let table = CommandTable::builder()
            .command("/stock", CommandSpec::new(vec![], Arc::new(Nop)))
            .build();
        assert!(table.dispatch("/stock2 AAPL").is_none());
        assert!(table.dispatch("/stocks").is_none());
    }

    #[test]
    fn builtins_include_system_commands() {
        let table = CommandTable::with_builtins().build();
        assert!(table.get("/new").is_some());
        assert!(table.get("/start").is_some());
        assert!(table.get("/help").is_some());
        assert!(table.get("/redo").is_some());
    }

    #[test]
    fn help_renders_descriptions() {
        let table = CommandTable::with_builtins().build();
        let help = table.render_help();
        assert!(help.contains("/new - Start a new conversation"));
        assert!(help.contains("/redo"));
    }

    #[test]
    fn scope_map_groups_commands() {
        let table = CommandTable::with_builtins().build();
        let map = table.scope_map();
        assert!(map[&Scope::AllPrivateChats].contains(&"/new".to_string()));
        // /start advertises nowhere.
        assert!(!map
            .values()
            .any(|commands| commands.contains(&"/start".to_string())));
    }

    #[test]
    fn callback_longest_prefix_wins() {
        let table = CallbackTable::builder()
            .prefix("/stock:", Arc::new(Nop))
            .prefix("/stock2:", Arc::new(Nop))
            .build();
        let (prefix, _, rest) = table.dispatch("/stock2:AAPL").unwrap();
        assert_eq!(prefix, "/stock2:");
        assert_eq!(rest, "AAPL");
        let (prefix, _, _) = table.dispatch("/stock:2330").unwrap();
        assert_eq!(prefix, "/stock:");
        assert!(table.dispatch("/unknown:x").is_none());
    }
}
