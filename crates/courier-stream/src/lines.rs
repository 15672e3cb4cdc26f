//! Chunk-boundary-safe line framing for streamed response bodies.
//!
//! Network chunks carry no alignment guarantees: a UTF-8 sequence or a
//! `\r\n` pair can be split across two chunks. The framer carries the
//! incomplete tail (both bytes and text) between `decode` calls and only
//! ever emits whole lines.

/// Splits a byte stream into logical lines across arbitrary chunk
/// boundaries. Lines are emitted newline-exclusive.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Unterminated text carried over from the previous chunk.
    buffer: String,
    /// A chunk ended in `\r`; the next chunk may begin with `\n`.
    trailing_cr: bool,
    /// Incomplete multi-byte UTF-8 tail carried over from the previous chunk.
    partial_utf8: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, returning every line completed by it.
    ///
    /// A chunk that completes no line returns an empty vec and grows the
    /// internal buffer instead.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut text = self.decode_text(chunk);

        if self.trailing_cr {
            text.insert(0, '\r');
            self.trailing_cr = false;
        }
        if text.ends_with('\r') {
            // Defer the CR: the next chunk may start with the matching LF.
            self.trailing_cr = true;
            text.pop();
        }

        if text.is_empty() {
            return Vec::new();
        }

        let trailing_newline = text.ends_with(['\n', '\r']);
        let mut lines = split_newlines(&text);

        if lines.len() == 1 && !trailing_newline {
            self.buffer.push_str(&lines[0]);
            return Vec::new();
        }

        if !self.buffer.is_empty() {
            lines[0] = format!("{}{}", std::mem::take(&mut self.buffer), lines[0]);
        }

        if !trailing_newline {
            // The last fragment is still incomplete.
            self.buffer = lines.pop().unwrap_or_default();
        }

        lines
    }

    /// Drain the buffer as one final line. Returns a line when text is
    /// pending or when a lone CR was deferred at end-of-stream.
    pub fn flush(&mut self) -> Vec<String> {
        if self.buffer.is_empty() && !self.trailing_cr && self.partial_utf8.is_empty() {
            return Vec::new();
        }
        self.trailing_cr = false;
        let mut line = std::mem::take(&mut self.buffer);
        if !self.partial_utf8.is_empty() {
            line.push_str(&String::from_utf8_lossy(&std::mem::take(&mut self.partial_utf8)));
        }
        vec![line]
    }

    /// Decode chunk bytes as UTF-8, carrying an incomplete trailing
    /// sequence to the next call instead of mangling it.
    fn decode_text(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial_utf8);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(s) => s.to_string(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    // Incomplete sequence at the tail — keep it for later.
                    self.partial_utf8 = bytes[valid..].to_vec();
                    String::from_utf8_lossy(&bytes[..valid]).into_owned()
                } else {
                    // Genuinely invalid bytes: replace and move on.
                    String::from_utf8_lossy(&bytes).into_owned()
                }
            }
        }
    }
}

/// Split on `\r\n`, `\r` or `\n`, keeping empty fragments (a trailing
/// newline yields a trailing empty fragment, which the SSE decoder relies
/// on as its record boundary).
fn split_newlines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => out.push(std::mem::take(&mut current)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(framer: &mut LineFramer, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(framer.decode(chunk));
        }
        out.extend(framer.flush());
        out
    }

    #[test]
    fn single_chunk_two_lines() {
        let mut f = LineFramer::new();
        let lines = frame_all(&mut f, &[b"alpha\nbeta\n"]);
        assert_eq!(lines, vec!["alpha", "beta", ""]);
    }

    #[test]
    fn unterminated_tail_surfaces_on_flush() {
        let mut f = LineFramer::new();
        assert!(f.decode(b"partial").is_empty());
        assert_eq!(f.flush(), vec!["partial"]);
    }

    #[test]
    fn crlf_split_across_chunks_is_one_break() {
        let mut f = LineFramer::new();
        let mut lines = f.decode(b"one\r");
        lines.extend(f.decode(b"\ntwo\n"));
        lines.extend(f.flush());
        assert_eq!(lines, vec!["one", "two", ""]);
    }

    #[test]
    fn lone_cr_is_a_line_break() {
        let mut f = LineFramer::new();
        let lines = frame_all(&mut f, &[b"one\rtwo"]);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn pending_cr_alone_flushes_one_empty_line() {
        // A stream ending in a bare CR still owes one (empty) line.
        let mut f = LineFramer::new();
        let mut lines = f.decode(b"\r");
        assert!(lines.is_empty());
        lines.extend(f.flush());
        assert_eq!(lines, vec![""]);
    }

    #[test]
    fn multibyte_split_across_chunks() {
        let text = "héllo\nwörld\n".as_bytes();
        // Split exactly inside the two-byte 'é'.
        let mut f = LineFramer::new();
        let lines = frame_all(&mut f, &[&text[..2], &text[2..]]);
        assert_eq!(lines, vec!["héllo", "wörld", ""]);
    }

    #[test]
    fn every_split_point_matches_unsplit_framing() {
        let text = "data: {\"a\":1}\r\ndata: hé\n\nrest".as_bytes();

        let mut reference = LineFramer::new();
        let mut expected = reference.decode(text);
        expected.extend(reference.flush());

        for split in 0..=text.len() {
            let mut f = LineFramer::new();
            let mut got = f.decode(&text[..split]);
            got.extend(f.decode(&text[split..]));
            got.extend(f.flush());
            assert_eq!(got, expected, "split at byte {split}");
        }
    }

    #[test]
    fn buffer_joins_fragments_across_many_chunks() {
        let mut f = LineFramer::new();
        let lines = frame_all(&mut f, &[b"ab", b"cd", b"ef\n"]);
        assert_eq!(lines, vec!["abcdef", ""]);
    }
}
