//! Minimal Python literal parser.
//!
//! Converts the textual form printed by the REPL (`['a', 1, True]`,
//! `{'k': None}`, `(1, 2)`) into a `serde_json::Value`. Tuples and sets
//! become arrays; non-string dict keys are stringified.

use super::escape::unescape;
use mpyb_core::{ReplError, ReplResult};
use serde_json::{Map, Number, Value};

/// Parse one complete literal. Trailing garbage is an error.
pub fn parse_literal(text: &str) -> ReplResult<Value> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(parser.error("trailing characters after literal"));
    }
    Ok(value)
}

/// Whether `text` is wrapped in a matching pair of brackets.
pub fn is_bracketed(text: &str) -> bool {
    let t = text.trim();
    matches!(
        (t.chars().next(), t.chars().last()),
        (Some('['), Some(']')) | (Some('{'), Some('}')) | (Some('('), Some(')'))
    ) && t.len() >= 2
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, msg: &str) -> ReplError {
        ReplError::protocol(format!("Python literal: {} at offset {}", msg, self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> ReplResult<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", want))),
        }
    }

    fn value(&mut self) -> ReplResult<Value> {
        self.skip_ws();
        match self.peek() {
            Some('[') => self.sequence('[', ']'),
            Some('(') => self.sequence('(', ')'),
            Some('{') => self.brace(),
            Some('\'') | Some('"') => self.string().map(Value::String),
            Some('b') if matches!(self.chars.get(self.pos + 1), Some('\'') | Some('"')) => {
                self.pos += 1;
                self.string().map(Value::String)
            }
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn keyword(&mut self) -> ReplResult<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "None" => Ok(Value::Null),
            "set" => {
                // `set()` is the repr of an empty set
                self.expect('(')?;
                self.expect(')')?;
                Ok(Value::Array(Vec::new()))
            }
            _ => {
                self.pos = start;
                Err(self.error(&format!("unknown name '{}'", word)))
            }
        }
    }

    fn number(&mut self) -> ReplResult<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '.' || c == '_'
            || ((c == '-' || c == '+') && matches!(self.chars.get(self.pos.wrapping_sub(1)), Some('e') | Some('E'))))
        {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        if let Ok(i) = raw.parse::<i64>() {
            return Ok(Value::Number(i.into()));
        }
        let unsigned = raw.trim_start_matches(['-', '+']);
        if let Some(hex) = unsigned.strip_prefix("0x") {
            if let Ok(v) = i64::from_str_radix(hex, 16) {
                let v = if raw.starts_with('-') { -v } else { v };
                return Ok(Value::Number(v.into()));
            }
        }
        raw.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                self.pos = start;
                self.error(&format!("invalid number '{}'", raw))
            })
    }

    fn string(&mut self) -> ReplResult<String> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut body = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    body.push('\\');
                    match self.bump() {
                        Some(c) => body.push(c),
                        None => return Err(self.error("unterminated escape")),
                    }
                }
                Some(c) if c == quote => break,
                Some(c) => body.push(c),
            }
        }
        Ok(unescape(&body))
    }

    fn sequence(&mut self, open: char, close: char) -> ReplResult<Value> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(Value::Array(items)),
                _ => return Err(self.error(&format!("expected ',' or '{}'", close))),
            }
        }
    }

    /// `{}` is a dict unless the first element is not followed by ':'.
    fn brace(&mut self) -> ReplResult<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        let mut set_items: Option<Vec<Value>> = None;
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                break;
            }
            let key = self.value()?;
            self.skip_ws();
            if set_items.is_none() && map.is_empty() && self.peek() != Some(':') {
                set_items = Some(Vec::new());
            }
            match set_items.as_mut() {
                Some(items) => items.push(key),
                None => {
                    self.expect(':')?;
                    let value = self.value()?;
                    map.insert(key_to_string(key), value);
                }
            }
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => break,
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
        Ok(match set_items {
            Some(items) => Value::Array(items),
            None => Value::Object(map),
        })
    }
}

fn key_to_string(key: Value) -> String {
    match key {
        Value::String(s) => s,
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(parse_literal("True").unwrap(), json!(true));
        assert_eq!(parse_literal("None").unwrap(), json!(null));
        assert_eq!(parse_literal("-42").unwrap(), json!(-42));
        assert_eq!(parse_literal("3.5").unwrap(), json!(3.5));
        assert_eq!(parse_literal("1e3").unwrap(), json!(1000.0));
        assert_eq!(parse_literal("0x4000").unwrap(), json!(16384));
    }

    #[test]
    fn test_strings_with_escapes() {
        assert_eq!(parse_literal("'it\\'s'").unwrap(), json!("it's"));
        assert_eq!(parse_literal("\"a\\nb\"").unwrap(), json!("a\nb"));
        assert_eq!(parse_literal("b'raw'").unwrap(), json!("raw"));
    }

    #[test]
    fn test_nested_containers() {
        let v = parse_literal("[('main.py', 32768, 0, 120), {'free': 1024, 'ok': True}, []]").unwrap();
        assert_eq!(
            v,
            json!([["main.py", 32768, 0, 120], {"free": 1024, "ok": true}, []])
        );
    }

    #[test]
    fn test_tuple_trailing_comma_and_sets() {
        assert_eq!(parse_literal("(1,)").unwrap(), json!([1]));
        assert_eq!(parse_literal("{1, 2}").unwrap(), json!([1, 2]));
        assert_eq!(parse_literal("set()").unwrap(), json!([]));
        assert_eq!(parse_literal("{}").unwrap(), json!({}));
        assert_eq!(parse_literal("{1: 'a'}").unwrap(), json!({"1": "a"}));
    }

    #[test]
    fn test_malformed() {
        assert!(parse_literal("[1, 2").is_err());
        assert!(parse_literal("[foo]").is_err());
        assert!(parse_literal("[1] extra").is_err());
        assert!(parse_literal("<object at 0x3ff>").is_err());
    }

    #[test]
    fn test_is_bracketed() {
        assert!(is_bracketed(" [1] "));
        assert!(is_bracketed("()"));
        assert!(!is_bracketed("[1)"));
        assert!(!is_bracketed("OK"));
        assert!(!is_bracketed("["));
    }
}
