//! Inbound Telegram update payload model.
//!
//! Only the fields the relay actually consumes are modeled; everything else
//! in the webhook JSON is ignored by serde. `TurnMessage::normalize` folds
//! the four supported update shapes (message, caption/photo, location,
//! callback query) into one working message for the middleware chain.

use serde::Deserialize;

use crate::error::CourierError;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub from: Option<TgUser>,
    pub chat: TgChat,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    pub location: Option<Location>,
    pub reply_to_message: Option<Box<TgMessage>>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub is_topic_message: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default)]
    pub is_forum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Unknown,
}

impl ChatKind {
    pub fn is_group(&self) -> bool {
        matches!(self, ChatKind::Group | ChatKind::Supergroup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
            ChatKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<Box<TgMessage>>,
    pub data: Option<String>,
}

/// A replied-to message, kept only when group reply-context is enabled.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub from_id: Option<i64>,
    pub text: Option<String>,
    pub photo: Vec<PhotoSize>,
}

/// Callback-query details carried alongside the synthesized message.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    pub id: String,
    pub data: String,
}

/// The uniform working message the middleware chain operates on.
///
/// `text` is mutable state: the group-mention stage strips the mention in
/// place before command dispatch and the model fallback see it.
#[derive(Debug, Clone)]
pub struct TurnMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub is_forum: bool,
    pub thread_id: Option<i64>,
    pub is_topic_message: bool,
    pub from: Option<TgUser>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Vec<PhotoSize>,
    pub location: Option<Location>,
    pub entities: Vec<MessageEntity>,
    pub reply_to: Option<ReplyContext>,
    pub callback: Option<CallbackInfo>,
}

impl TurnMessage {
    /// Fold an inbound update into a working message.
    ///
    /// Edited messages and payloads carrying neither a message nor a
    /// callback query are rejected; the chain driver treats both as a
    /// silent drop.
    pub fn normalize(update: Update) -> Result<Self, CourierError> {
        if update.edited_message.is_some() {
            return Err(CourierError::InvalidUpdate("edited message".into()));
        }

        if let Some(cb) = update.callback_query {
            // A callback query rides on the message its keyboard belongs
            // to; the button data becomes the working text.
            let base = cb
                .message
                .ok_or_else(|| CourierError::InvalidUpdate("callback without message".into()))?;
            let data = cb.data.unwrap_or_default();
            let mut msg = Self::from_message(*base);
            msg.from = Some(cb.from);
            msg.text = Some(data.clone());
            msg.callback = Some(CallbackInfo { id: cb.id, data });
            return Ok(msg);
        }

        match update.message {
            Some(m) => Ok(Self::from_message(m)),
            None => Err(CourierError::InvalidUpdate("no message".into())),
        }
    }

    fn from_message(m: TgMessage) -> Self {
        let reply_to = m.reply_to_message.map(|r| ReplyContext {
            from_id: r.from.as_ref().map(|u| u.id),
            text: r.text.clone().or(r.caption.clone()),
            photo: r.photo,
        });
        TurnMessage {
            message_id: m.message_id,
            chat_id: m.chat.id,
            chat_kind: m.chat.kind,
            is_forum: m.chat.is_forum,
            thread_id: m.message_thread_id,
            is_topic_message: m.is_topic_message,
            from: m.from,
            text: m.text,
            caption: m.caption,
            photo: m.photo,
            location: m.location,
            entities: m.entities,
            reply_to,
            callback: None,
        }
    }

    /// Text or caption, whichever is present.
    pub fn text_or_caption(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// Pick a photo size by configured offset: `>= 0` counts from the
    /// smallest size, negative counts back from the largest. The result is
    /// always clamped into range.
    pub fn pick_photo(&self, offset: i64) -> Option<&PhotoSize> {
        if self.photo.is_empty() {
            return None;
        }
        let len = self.photo.len() as i64;
        let idx = if offset >= 0 {
            offset.min(len - 1)
        } else {
            (len + offset).max(0)
        };
        self.photo.get(idx.max(0).min(len - 1) as usize)
    }
}
