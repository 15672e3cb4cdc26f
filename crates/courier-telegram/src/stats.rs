//! Best-effort usage statistics.
//!
//! Recording is fire-and-forget: it runs in a detached task and never
//! blocks or fails the turn. Unique users and groups are JSON-array sets;
//! totals are plain counters; the daily key embeds the calendar date.

use std::sync::Arc;

use tracing::debug;

use courier_core::types::ChatKind;
use courier_history::{KvStore, StoreError};

use crate::context::ShareContext;

/// Spawn the recording task for one update.
pub fn record_usage(store: Arc<dyn KvStore>, share: &ShareContext, chat_kind: ChatKind) {
    let bot_id = share.bot_id.clone();
    let chat_id = share.chat_id;
    let speaker_id = share.speaker_id;
    tokio::spawn(async move {
        if let Err(e) = record(store.as_ref(), &bot_id, chat_id, speaker_id, chat_kind).await {
            debug!(error = %e, "usage recording failed");
        }
    });
}

async fn record(
    store: &dyn KvStore,
    bot_id: &str,
    chat_id: i64,
    speaker_id: i64,
    chat_kind: ChatKind,
) -> Result<(), StoreError> {
    add_to_set(store, &format!("stats:users:{bot_id}"), &speaker_id.to_string()).await?;
    if chat_kind.is_group() {
        add_to_set(store, &format!("stats:groups:{bot_id}"), &chat_id.to_string()).await?;
    }
    increment(store, &format!("stats:total_messages:{bot_id}")).await?;

    let today = chrono::Utc::now().format("%Y-%m-%d");
    increment(store, &format!("stats:daily:{bot_id}:{today}")).await?;
    Ok(())
}

async fn add_to_set(store: &dyn KvStore, key: &str, value: &str) -> Result<(), StoreError> {
    let mut set: Vec<String> = match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        None => Vec::new(),
    };
    if !set.iter().any(|v| v == value) {
        set.push(value.to_string());
        store.put(key, &serde_json::to_string(&set)?).await?;
    }
    Ok(())
}

async fn increment(store: &dyn KvStore, key: &str) -> Result<(), StoreError> {
    let count = store
        .get(key)
        .await?
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    store.put(key, &count.to_string()).await
}
