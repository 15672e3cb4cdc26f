//! The delivery controller: one model turn delivered as a placeholder,
//! throttled streaming edits, and an authoritative final send.
//!
//! Turn shape: placeholder → streaming edits (optional) → finalize. The
//! placeholder send is best-effort; the typing indicator is detached; a
//! rate-limit response suppresses further edits until its window elapses;
//! the final send always carries the complete text because streaming edits
//! may have been suppressed and gone stale. History is committed (two
//! entries, whole-list overwrite) only after the model call succeeds.
//! Errors propagate to the chain driver's single outermost catch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::warn;

use courier_agent::{ChatTurnParams, StreamSink, StreamTuning};
use courier_core::types::TurnMessage;
use courier_history::{load_history, persist_history, trim_history, HistoryEntry};

use crate::context::TurnContext;
use crate::error::RelayError;
use crate::middleware::StageResult;
use crate::typing::TypingHandle;

/// Rewrites the (history, message) pair between load and request. Used by
/// /redo to rewind to the previous user turn.
pub type HistoryModifier =
    dyn Fn(Vec<HistoryEntry>, &str) -> Result<(Vec<HistoryEntry>, String), RelayError> + Send + Sync;

/// Turn-local delivery state shared with the streaming callback. Never
/// persisted, never shared across turns.
#[derive(Debug, Default)]
struct DeliveryState {
    /// The outbound message currently being edited.
    message_id: Option<i64>,
    /// Rate-limit backoff window; edits are suppressed until it elapses.
    next_allowed: Option<Instant>,
}

/// Run one conversational turn against the model backend.
///
/// `override_text` replaces the inbound text (commands reuse the turn
/// machinery with their own input); `modifier` rewrites history + message
/// after the store load.
pub async fn chat_with_backend(
    msg: &TurnMessage,
    ctx: &mut TurnContext,
    override_text: Option<String>,
    modifier: Option<&HistoryModifier>,
) -> Result<StageResult, RelayError> {
    let cfg = Arc::clone(&ctx.config);

    // Assemble the turn input: text or caption, reply-context prefix,
    // resolved photo link.
    let base_text = override_text
        .unwrap_or_else(|| msg.text_or_caption().unwrap_or_default().to_string());
    let mut text = match &ctx.share.extra_context {
        Some(extra) if !base_text.is_empty() => format!("{extra}\n{base_text}"),
        Some(extra) => extra.clone(),
        None => base_text,
    };

    let mut images = Vec::new();
    if let Some(photo) = msg.pick_photo(cfg.telegram.photo_size_offset) {
        match ctx.api.get_file_url(&photo.file_id).await {
            Ok(Some(url)) => images.push(url),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "photo link resolution failed"),
        }
    }

    if text.trim().is_empty() {
        if !images.is_empty() {
            text = "Describe this image and tell a short story about it.".to_string();
        } else if modifier.is_none() {
            return Ok(StageResult::Dropped("empty chat message"));
        }
    }

    // Placeholder: obtain a message id for later edits. Failure is logged
    // and swallowed — the turn continues without an editable placeholder.
    match ctx.reply("...").await {
        Ok(outcome) if outcome.ok() => {
            ctx.outbound.message_id = outcome.message_id;
            ctx.outbound.reply_markup = None;
        }
        Ok(outcome) => warn!(status = outcome.status, "placeholder send rejected"),
        Err(e) => warn!(error = %e, "placeholder send failed"),
    }

    // Detached activity indicator; failures are ignored inside the task.
    let typing = TypingHandle::start(Arc::clone(&ctx.api), msg.chat_id);

    // Streaming callback, when enabled for this chat: honors the backoff
    // window, follows the platform's message id on success, converts a
    // rate-limit response into a new window instead of raising.
    let stream_enabled = ctx
        .settings
        .stream_mode
        .unwrap_or(cfg.telegram.stream_mode);
    let saved_parse_mode = ctx.outbound.parse_mode.clone();
    let state = Arc::new(Mutex::new(DeliveryState {
        message_id: ctx.outbound.message_id,
        next_allowed: None,
    }));

    let on_stream: Option<StreamSink> = if stream_enabled {
        // Streaming edits always go plain: partial markdown would fail to
        // parse more often than not.
        ctx.outbound.parse_mode = None;
        let api = Arc::clone(&ctx.api);
        let base_opts = ctx.outbound.clone();
        let state = Arc::clone(&state);
        Some(Box::new(move |partial: String| {
            let api = Arc::clone(&api);
            let state = Arc::clone(&state);
            let mut opts = base_opts.clone();
            Box::pin(async move {
                {
                    let st = state.lock().unwrap();
                    if let Some(until) = st.next_allowed {
                        if Instant::now() < until {
                            return;
                        }
                    }
                    opts.message_id = st.message_id;
                }
                opts.parse_mode = None;
                match api.send(&partial, &opts).await {
                    Ok(outcome) => {
                        let mut st = state.lock().unwrap();
                        if outcome.rate_limited() {
                            if let Some(secs) = outcome.retry_after {
                                st.next_allowed =
                                    Some(Instant::now() + Duration::from_secs(secs));
                                return;
                            }
                        }
                        st.next_allowed = None;
                        if outcome.ok() {
                            if let Some(id) = outcome.message_id {
                                st.message_id = Some(id);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "streaming edit failed"),
                }
            })
        }))
    } else {
        None
    };

    // Load and bound the history, then apply the modifier.
    let history_disabled = cfg.history.auto_trim && cfg.history.max_entries <= 0;
    let mut history = load_history(ctx.store.as_ref(), &ctx.share.history_key).await;
    if cfg.history.auto_trim && cfg.history.max_entries > 0 {
        history = trim_history(history, 0, cfg.history.max_entries, cfg.history.max_budget);
    }
    let mut message = text;
    if let Some(modify) = modifier {
        let (modified_history, modified_message) = modify(history, &message)?;
        history = modified_history;
        message = modified_message;
    }

    let prompt = ctx
        .settings
        .system_prompt
        .clone()
        .or_else(|| cfg.backend.system_prompt.clone());
    let params = ChatTurnParams {
        message: message.clone(),
        images: images.clone(),
        history: history.clone(),
        prompt,
    };
    let tuning = StreamTuning {
        flush_start: cfg.backend.flush_start,
        flush_grow: cfg.backend.flush_grow,
        min_interval: Duration::from_millis(cfg.telegram.min_stream_interval_ms.max(0) as u64),
    };

    let result = ctx.backend.request(&params, &tuning, on_stream.as_ref()).await;
    typing.stop();
    // A failed call leaves the stored history untouched.
    let answer = result?;

    // Commit exactly one user and one assistant entry, whole-list
    // overwrite (last write wins under concurrent turns on this key).
    if !history_disabled {
        history.push(HistoryEntry {
            role: courier_history::Role::User,
            content: message,
            images: (!images.is_empty()).then(|| images.clone()),
        });
        history.push(HistoryEntry::assistant(answer.clone()));
        if let Err(e) = persist_history(ctx.store.as_ref(), &ctx.share.history_key, &history).await
        {
            warn!(error = %e, key = %ctx.share.history_key, "history persist failed");
        }
    }

    // Finalize: restore formatting, optionally swap the placeholder for a
    // quick-reply keyboard, wait out any pending backoff, then send the
    // complete text as the authoritative last message.
    ctx.outbound.parse_mode = saved_parse_mode;
    let (live_message_id, next_allowed) = {
        let st = state.lock().unwrap();
        (st.message_id, st.next_allowed)
    };
    ctx.outbound.message_id = live_message_id;

    if cfg.telegram.show_reply_button {
        if let Some(id) = ctx.outbound.message_id {
            match ctx.api.delete_message(msg.chat_id, id).await {
                Ok(()) => {
                    ctx.outbound.message_id = None;
                    ctx.outbound.reply_markup = Some(json!({
                        "keyboard": [[{"text": "/new"}, {"text": "/redo"}]],
                        "selective": true,
                        "resize_keyboard": true,
                        "one_time_keyboard": true,
                    }));
                }
                Err(e) => warn!(error = %e, "placeholder delete failed"),
            }
        }
    }

    if let Some(until) = next_allowed {
        tokio::time::sleep_until(until).await;
    }

    ctx.reply(&answer).await?;
    Ok(StageResult::Handled)
}
