//! Terminal line accumulation.
//!
//! Raw REPL output arrives in arbitrary chunks. [`LineBuffer::append`] strips
//! terminal control sequences, merges the first fragment into the open last
//! line and returns the sanitized chunk so the correlator sees exactly the
//! text the user sees (minus the optional timestamp).

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::VecDeque;

pub const DEFAULT_MAX_LINES: usize = 5000;

lazy_static! {
    /// CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ST`) and two-byte escapes.
    static ref ANSI_RE: Regex = Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]"
    )
    .expect("ANSI pattern compiles");
}

/// Remove escape sequences and control characters, keeping `\n` and `\t`.
pub fn sanitize(raw: &str) -> String {
    let stripped = ANSI_RE.replace_all(raw, "");
    let normalized = stripped.replace("\r\n", "\n");
    normalized
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

/// Longest escape held back waiting for its final byte.
const MAX_ESCAPE_CARRY: usize = 128;

/// Byte length of an escape sequence still open at the end of `text`.
fn open_escape_len(text: &str) -> usize {
    if let Some(pos) = text.rfind("\x1b]") {
        let body = &text[pos + 2..];
        if !body.contains('\x07') && !body.contains("\x1b\\") {
            return text.len() - pos;
        }
    }
    let pos = match text.rfind('\x1b') {
        Some(pos) => pos,
        None => return 0,
    };
    let tail = &text[pos + 1..];
    let open = match tail.strip_prefix('[') {
        Some(params) => params.chars().all(|c| ('\x20'..='\x3f').contains(&c)),
        None => tail.is_empty(),
    };
    if open {
        text.len() - pos
    } else {
        0
    }
}

fn timestamp_prefix() -> String {
    format!("[{}] ", chrono::Local::now().format("%H:%M:%S"))
}

/// Ordered display lines with an open (still growing) last line.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    show_timestamp: bool,
    /// Unterminated escape from the end of the previous chunk.
    escape_carry: String,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, false)
    }
}

impl LineBuffer {
    pub fn new(max_lines: usize, show_timestamp: bool) -> Self {
        let mut lines = VecDeque::new();
        lines.push_back(String::new());
        Self {
            lines,
            max_lines: max_lines.max(1),
            show_timestamp,
            escape_carry: String::new(),
        }
    }

    pub fn set_show_timestamp(&mut self, on: bool) {
        self.show_timestamp = on;
    }

    pub fn show_timestamp(&self) -> bool {
        self.show_timestamp
    }

    /// Append a raw chunk. Returns the sanitized chunk without timestamp.
    ///
    /// An escape sequence cut off at the end of `raw` is held back and
    /// completed by the next chunk.
    pub fn append(&mut self, raw: &str) -> String {
        let mut text = std::mem::take(&mut self.escape_carry);
        text.push_str(raw);
        let open = open_escape_len(&text);
        if open > 0 && open <= MAX_ESCAPE_CARRY {
            self.escape_carry = text.split_off(text.len() - open);
        }
        let clean = sanitize(&text);
        if clean.is_empty() {
            return clean;
        }

        let display = if self.show_timestamp && !clean.trim().is_empty() {
            format!("{}{}", timestamp_prefix(), clean)
        } else {
            clean.clone()
        };

        let mut parts = display.split('\n');
        if let Some(first) = parts.next() {
            self.open_line_mut().push_str(first);
        }
        for part in parts {
            self.lines.push_back(part.to_string());
        }
        self.enforce_cap();
        clean
    }

    /// Append a system message as its own line.
    pub fn push_system(&mut self, message: &str) {
        let open_empty = self.lines.back().map(|l| l.is_empty()).unwrap_or(true);
        if open_empty {
            self.lines.pop_back();
        }
        let text = if self.show_timestamp {
            format!("{}{}", timestamp_prefix(), message)
        } else {
            message.to_string()
        };
        self.lines.push_back(text);
        self.lines.push_back(String::new());
        self.enforce_cap();
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.lines.push_back(String::new());
    }

    /// All lines, including the open one.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines.back().map(|l| l.is_empty()).unwrap_or(true)
    }

    fn open_line_mut(&mut self) -> &mut String {
        if self.lines.is_empty() {
            self.lines.push_back(String::new());
        }
        let last = self.lines.len() - 1;
        &mut self.lines[last]
    }

    fn enforce_cap(&mut self) {
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }
}

/// Byte-to-text decoder that carries incomplete UTF-8 sequences between
/// chunks. Invalid bytes are replaced by U+FFFD.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a dangling partial sequence.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_and_controls() {
        assert_eq!(sanitize("\x1b[32mOK\x1b[0m\r\n"), "OK\n");
        assert_eq!(sanitize("a\x07b\x08c\td"), "abc\td");
        assert_eq!(sanitize("\x1b]0;title\x07>>> "), ">>> ");
        assert_eq!(sanitize("lone\rcr"), "lonecr");
    }

    #[test]
    fn escape_split_across_chunks_is_stripped() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.append("abc\x1b["), "abc");
        assert_eq!(buf.append("K>>> "), ">>> ");
        assert_eq!(buf.lines(), vec!["abc>>> "]);

        assert_eq!(buf.append("\x1b"), "");
        assert_eq!(buf.append("]0;title"), "");
        assert_eq!(buf.append("\x07ok"), "ok");
        assert_eq!(buf.append("\x1b[1"), "");
        assert_eq!(buf.append(";32m!\r\n"), "!\n");
        assert_eq!(buf.lines(), vec!["abc>>> ok!", ""]);
    }

    #[test]
    fn open_escape_detection() {
        assert_eq!(open_escape_len("plain"), 0);
        assert_eq!(open_escape_len("x\x1b"), 1);
        assert_eq!(open_escape_len("x\x1b[12;"), 5);
        assert_eq!(open_escape_len("x\x1b[0m"), 0);
        assert_eq!(open_escape_len("\x1b]0;t\x07\x1b[2"), 3);
        assert_eq!(open_escape_len("\x1b]0;t"), 5);
    }

    #[test]
    fn merges_into_open_line() {
        let mut buf = LineBuffer::default();
        buf.append("hel");
        buf.append("lo\nwor");
        buf.append("ld\n");
        assert_eq!(buf.lines(), vec!["hello", "world", ""]);
        assert_eq!(buf.text(), "hello\nworld\n");
    }

    #[test]
    fn append_returns_sanitized_chunk_without_timestamp() {
        let mut buf = LineBuffer::new(100, true);
        let out = buf.append("\x1b[1m__START_1__\x1b[0m\r\n");
        assert_eq!(out, "__START_1__\n");
        let first = &buf.lines()[0];
        assert!(first.starts_with('['));
        assert!(first.ends_with("] __START_1__"));
    }

    #[test]
    fn blank_chunks_are_not_timestamped() {
        let mut buf = LineBuffer::new(100, true);
        buf.append("\r\n");
        assert_eq!(buf.lines(), vec!["", ""]);
    }

    #[test]
    fn system_line_closes_open_line() {
        let mut buf = LineBuffer::default();
        buf.append(">>> ");
        buf.push_system("Desconectado: bye");
        assert_eq!(buf.lines(), vec![">>> ", "Desconectado: bye", ""]);

        buf.push_system("Conectando a x...");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn oldest_lines_dropped_beyond_cap() {
        let mut buf = LineBuffer::new(3, false);
        buf.append("1\n2\n3\n4\n");
        assert_eq!(buf.lines(), vec!["3", "4", ""]);
    }

    #[test]
    fn clear_resets() {
        let mut buf = LineBuffer::default();
        buf.append("x\ny");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn decoder_carries_split_utf8() {
        let mut dec = StreamDecoder::new();
        let bytes = "Conexão".as_bytes();
        let split = bytes.len() - 2;
        let a = dec.decode(&bytes[..split]);
        let b = dec.decode(&bytes[split..]);
        assert_eq!(format!("{}{}", a, b), "Conexão");
        assert_eq!(a, "Conex");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut dec = StreamDecoder::new();
        assert_eq!(dec.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(dec.decode(&[0xE2, 0x82]), "");
        assert_eq!(dec.finish(), "\u{FFFD}");
    }
}
