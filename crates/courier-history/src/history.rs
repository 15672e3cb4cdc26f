//! Rolling conversation history: load, bound, persist.
//!
//! History is stored as one JSON array per chat key and rewritten
//! wholesale after each turn. Trimming is pure so the bounds can be tested
//! without a store.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation turn half. Order in the list is chronological and is
/// exactly the context order sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: None,
        }
    }
}

/// Entries with `"content": null` are coerced to an empty string rather
/// than failing the whole list.
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// Load the history list for a key. Missing keys, malformed JSON and
/// non-array values all degrade to an empty history.
pub async fn load_history(store: &dyn KvStore, key: &str) -> Vec<HistoryEntry> {
    let raw = match store.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "history load failed");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(key, error = %e, "history is not a valid entry list");
            Vec::new()
        }
    }
}

/// Persist the whole list for a key.
///
/// This is a blind overwrite: two concurrent turns on the same key can
/// both load the pre-turn list and each write their own transcript, and
/// the later write wins. The store contract offers no compare-and-swap,
/// so this race is accepted rather than hidden.
pub async fn persist_history(
    store: &dyn KvStore,
    key: &str,
    entries: &[HistoryEntry],
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(entries)?;
    store.put(key, &raw).await
}

/// Bound a history list by entry count, then by character budget.
///
/// Count phase: `max_entries >= 0` keeps only the most recent
/// `max_entries` entries.
///
/// Budget phase (`max_budget > 0`): walk backward from the newest entry
/// accumulating character counts on top of `reserved`; the entry that
/// pushes the running total past the budget is dropped along with
/// everything older, keeping the maximal trailing suffix that fits.
pub fn trim_history(
    mut entries: Vec<HistoryEntry>,
    reserved: usize,
    max_entries: i64,
    max_budget: i64,
) -> Vec<HistoryEntry> {
    if max_entries >= 0 && entries.len() as i64 > max_entries {
        entries = entries.split_off(entries.len() - max_entries as usize);
    }

    if max_budget > 0 {
        let mut total = reserved as i64;
        let mut keep_from = 0usize;
        for i in (0..entries.len()).rev() {
            total += entries[i].content.chars().count() as i64;
            if total > max_budget {
                keep_from = i + 1;
                break;
            }
        }
        if keep_from > 0 {
            entries = entries.split_off(keep_from);
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entries(n: usize) -> Vec<HistoryEntry> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    HistoryEntry::user(format!("u{i}"))
                } else {
                    HistoryEntry::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    #[test]
    fn count_trim_keeps_most_recent() {
        let trimmed = trim_history(entries(25), 0, 20, -1);
        assert_eq!(trimmed.len(), 20);
        assert_eq!(trimmed[0].content, "a5");
        assert_eq!(trimmed[19].content, "u24");
    }

    #[test]
    fn count_trim_noop_when_under_limit() {
        let trimmed = trim_history(entries(5), 0, 20, -1);
        assert_eq!(trimmed.len(), 5);
    }

    #[test]
    fn negative_max_entries_keeps_everything() {
        let trimmed = trim_history(entries(25), 0, -1, -1);
        assert_eq!(trimmed.len(), 25);
    }

    #[test]
    fn budget_trim_keeps_trailing_suffix_that_fits() {
        // Four entries of 4 chars each; budget 10 with 0 reserved keeps
        // the last two (8 <= 10), because the third-from-last pushes the
        // total to 12.
        let list = vec![
            HistoryEntry::user("aaaa"),
            HistoryEntry::assistant("bbbb"),
            HistoryEntry::user("cccc"),
            HistoryEntry::assistant("dddd"),
        ];
        let trimmed = trim_history(list, 0, -1, 10);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].content, "cccc");
        assert_eq!(trimmed[1].content, "dddd");
    }

    #[test]
    fn reserved_length_counts_against_budget() {
        let list = vec![HistoryEntry::user("aaaa"), HistoryEntry::assistant("bbbb")];
        // Budget 10 with 7 reserved: the newest entry alone (4) already
        // pushes 7 + 4 past 10, so nothing survives.
        let trimmed = trim_history(list, 7, -1, 10);
        assert!(trimmed.is_empty());
    }

    #[test]
    fn zero_or_negative_budget_disables_phase() {
        assert_eq!(trim_history(entries(6), 0, -1, 0).len(), 6);
        assert_eq!(trim_history(entries(6), 0, -1, -1).len(), 6);
    }

    #[test]
    fn count_then_budget_order() {
        // Count trim first (keep 3 of 6), then budget drops one more.
        let list = vec![
            HistoryEntry::user("aaaaaaaaaa"),
            HistoryEntry::assistant("bbbbbbbbbb"),
            HistoryEntry::user("cccccccccc"),
            HistoryEntry::assistant("dddd"),
            HistoryEntry::user("eeee"),
            HistoryEntry::assistant("ffff"),
        ];
        let trimmed = trim_history(list, 0, 3, 9);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].content, "eeee");
    }

    #[test]
    fn null_content_coerces_to_empty() {
        let raw = r#"[{"role":"user","content":null},{"role":"assistant","content":"ok"}]"#;
        let list: Vec<HistoryEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(list[0].content, "");
        assert_eq!(list[1].content, "ok");
    }

    #[test]
    fn images_round_trip() {
        let entry = HistoryEntry {
            role: Role::User,
            content: "look".into(),
            images: Some(vec!["https://example.com/a.jpg".into()]),
        };
        let raw = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, entry);
        // Entries without images serialize without the field.
        let plain = serde_json::to_string(&HistoryEntry::user("x")).unwrap();
        assert!(!plain.contains("images"));
    }

    #[tokio::test]
    async fn load_missing_key_is_empty() {
        let store = MemoryStore::new();
        assert!(load_history(&store, "history:1").await.is_empty());
    }

    #[tokio::test]
    async fn load_malformed_json_degrades_to_empty() {
        let store = MemoryStore::new();
        store.put("history:1", "{broken").await.unwrap();
        assert!(load_history(&store, "history:1").await.is_empty());
    }

    #[tokio::test]
    async fn load_non_array_degrades_to_empty() {
        let store = MemoryStore::new();
        store.put("history:1", r#"{"role":"user"}"#).await.unwrap();
        assert!(load_history(&store, "history:1").await.is_empty());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let store = MemoryStore::new();
        let list = entries(4);
        persist_history(&store, "history:1", &list).await.unwrap();
        assert_eq!(load_history(&store, "history:1").await, list);
    }
}
