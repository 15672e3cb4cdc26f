//! Passive intent detection: keyword rules that redirect free text to a
//! command instead of the model. Best-effort by design — no rule match
//! simply falls through to the chat fallback.

use courier_core::config::IntentRule;

/// Match `text` against the rule list. Returns the target command and the
/// synthesized argument for the first matching rule.
pub fn detect(rules: &[IntentRule], text: &str) -> Option<(String, String)> {
    let lower = text.to_lowercase();
    for rule in rules {
        let hit = rule
            .keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()));
        if !hit {
            continue;
        }

        let arg = if rule.full_text_arg {
            text.to_string()
        } else {
            rule.arg_candidates
                .iter()
                .find(|c| text.contains(c.as_str()))
                .cloned()
                .or_else(|| rule.fallback_arg.clone())
                .unwrap_or_default()
        };
        return Some((rule.command.clone(), arg));
    }
    None
}
