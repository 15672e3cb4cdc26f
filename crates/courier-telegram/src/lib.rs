pub mod api;
pub mod chat;
pub mod commands;
pub mod context;
pub mod error;
pub mod intent;
pub mod middleware;
pub mod stats;
pub mod typing;

pub use api::{ChatAdmin, MessagePort, SendOptions, SendOutcome, TelegramApi};
pub use commands::{CallbackTable, CommandHandler, CommandSpec, CommandTable, Scope};
pub use context::{ShareContext, TurnContext, UserSettings};
pub use error::RelayError;
pub use middleware::{Dispatcher, StageResult, TurnOutcome};
