//! Python string-literal escaping and `repr()` decoding.

use mpyb_core::{ReplError, ReplResult};

/// Escape `text` for use inside a single-quoted Python literal.
pub fn escape_py(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// `text` as a complete single-quoted Python literal.
pub fn py_quote(text: &str) -> String {
    format!("'{}'", escape_py(text))
}

/// Reverse Python escapes inside a literal body (quotes already removed).
///
/// Unknown escapes are kept verbatim, as Python does.
pub fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('x') => push_hex(&mut out, &mut chars, 2, 'x'),
            Some('u') => push_hex(&mut out, &mut chars, 4, 'u'),
            Some('U') => push_hex(&mut out, &mut chars, 8, 'U'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn push_hex<I: Iterator<Item = char>>(
    out: &mut String,
    chars: &mut std::iter::Peekable<I>,
    width: usize,
    tag: char,
) {
    let mut digits = String::with_capacity(width);
    while digits.len() < width {
        match chars.peek() {
            Some(c) if c.is_ascii_hexdigit() => {
                digits.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    let decoded = if digits.len() == width {
        u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
    } else {
        None
    };
    match decoded {
        Some(ch) => out.push(ch),
        None => {
            out.push('\\');
            out.push(tag);
            out.push_str(&digits);
        }
    }
}

/// Decode the output of Python `repr()` on a `str` or `bytes` value.
pub fn decode_repr(repr: &str) -> ReplResult<String> {
    let trimmed = repr.trim();
    let literal = trimmed.strip_prefix('b').unwrap_or(trimmed);
    let quote = literal
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| {
            ReplError::protocol(format!("Expected a quoted repr, got: {}", preview(trimmed)))
        })?;
    if literal.len() < 2 || !literal.ends_with(quote) {
        return Err(ReplError::protocol(format!(
            "Unterminated string repr: {}",
            preview(trimmed)
        )));
    }
    Ok(unescape(&literal[1..literal.len() - 1]))
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(60).collect();
    if text.chars().count() > 60 {
        s.push_str("...");
    }
    s
}
