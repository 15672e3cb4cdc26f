//! Incremental Server-Sent-Events record decoding.
//!
//! One decoder instance accumulates `event:`/`data:` fields line by line
//! and emits a record only at the blank-line boundary (or never, if the
//! stream dies mid-record — partial records are never surfaced).

/// One decoded SSE record. `data` is the newline-join of every `data:`
/// line seen since the previous blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one framed line. Returns a record on the blank-line boundary,
    /// `None` otherwise.
    pub fn decode(&mut self, line: &str) -> Option<SseRecord> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                // Repeated blank lines between records.
                return None;
            }
            let record = SseRecord {
                event: self.event.take(),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(record);
        }

        if line.starts_with(':') {
            // Comment line (keep-alive).
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // Unknown fields (id, retry, ...) are ignored for forward
            // compatibility.
            _ => {}
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(lines: &[&str]) -> Vec<SseRecord> {
        let mut decoder = SseDecoder::new();
        lines.iter().filter_map(|l| decoder.decode(l)).collect()
    }

    #[test]
    fn single_data_record() {
        let records = decode_all(&["data: hello", ""]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, None);
        assert_eq!(records[0].data, "hello");
    }

    #[test]
    fn multi_data_lines_join_with_newline() {
        let records = decode_all(&["data: line one", "data: line two", ""]);
        assert_eq!(records[0].data, "line one\nline two");
    }

    #[test]
    fn event_field_is_captured_and_reset() {
        let records = decode_all(&[
            "event: delta",
            "data: {}",
            "",
            "data: after",
            "",
        ]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.as_deref(), Some("delta"));
        assert_eq!(records[1].event, None);
    }

    #[test]
    fn repeated_blank_lines_emit_nothing() {
        let records = decode_all(&["", "", "data: x", "", ""]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "x");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let records = decode_all(&[": keep-alive", "data: x", ""]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "x");
    }

    #[test]
    fn only_first_colon_splits_and_one_space_is_trimmed() {
        let records = decode_all(&["data:  {\"a\": 1}", ""]);
        // One leading space removed, the second preserved.
        assert_eq!(records[0].data, " {\"a\": 1}");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let records = decode_all(&["id: 7", "retry: 100", "data: x", ""]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "x");
    }

    #[test]
    fn trailing_cr_is_stripped() {
        let records = decode_all(&["data: x\r", "\r"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "x");
    }

    #[test]
    fn never_emits_mid_record() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode("event: delta").is_none());
        assert!(decoder.decode("data: one").is_none());
        assert!(decoder.decode("data: two").is_none());
        let record = decoder.decode("").unwrap();
        assert_eq!(record.data, "one\ntwo");
    }

    #[test]
    fn event_without_data_still_emits() {
        let records = decode_all(&["event: stream-start", ""]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.as_deref(), Some("stream-start"));
        assert_eq!(records[0].data, "");
    }
}
