//! Best-effort parsing of truncated JSON.
//!
//! Tool-call arguments arrive as a growing prefix of a JSON document. The
//! parser here walks that prefix and returns the most complete value it
//! describes: object members whose key is still being written are dropped,
//! unterminated strings are closed at the cut, partial literals complete to
//! their literal and partial numbers are trimmed to their longest valid
//! prefix. It never fails loudly; anything it cannot make sense of is `None`.

use memchr::memchr2;
use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 128;

enum Parsed {
    /// A complete value ending at the given byte offset.
    Complete(Value, usize),
    /// Input ended inside this value.
    Partial(Option<Value>),
    Invalid,
}

/// Parse a possibly truncated JSON text.
///
/// Returns `None` for empty, whitespace-only or malformed input.
#[must_use]
pub fn parse_partial(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    match parse_value(text, bytes, 0, 0) {
        Parsed::Complete(value, end) => {
            if skip_ws(bytes, end) == bytes.len() {
                Some(value)
            } else {
                None
            }
        }
        Parsed::Partial(value) => value,
        Parsed::Invalid => None,
    }
}

#[inline]
fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while let Some(b' ' | b'\n' | b'\r' | b'\t') = bytes.get(i) {
        i += 1;
    }
    i
}

fn parse_value(text: &str, bytes: &[u8], start: usize, depth: usize) -> Parsed {
    if depth > MAX_DEPTH {
        return Parsed::Invalid;
    }
    let i = skip_ws(bytes, start);
    let Some(&first) = bytes.get(i) else {
        return Parsed::Partial(None);
    };
    match first {
        b'{' => parse_object(text, bytes, i, depth),
        b'[' => parse_array(text, bytes, i, depth),
        b'"' => match parse_string(text, bytes, i) {
            Ok((s, end)) => Parsed::Complete(Value::String(s), end),
            Err(Some(partial)) => Parsed::Partial(Some(Value::String(partial))),
            Err(None) => Parsed::Invalid,
        },
        b't' => parse_literal(bytes, i, b"true", Value::Bool(true)),
        b'f' => parse_literal(bytes, i, b"false", Value::Bool(false)),
        b'n' => parse_literal(bytes, i, b"null", Value::Null),
        b'-' | b'0'..=b'9' => parse_number(text, bytes, i),
        _ => Parsed::Invalid,
    }
}

fn parse_object(text: &str, bytes: &[u8], start: usize, depth: usize) -> Parsed {
    let mut map = Map::new();
    let mut i = start + 1;
    let mut after_comma = false;
    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return Parsed::Partial(Some(Value::Object(map))),
            Some(b'}') if !after_comma => return Parsed::Complete(Value::Object(map), i + 1),
            Some(b'"') => {}
            Some(_) => return Parsed::Invalid,
        }

        // An unterminated key is dropped together with its member.
        let key = match parse_string(text, bytes, i) {
            Ok((key, end)) => {
                i = end;
                key
            }
            Err(Some(_)) => return Parsed::Partial(Some(Value::Object(map))),
            Err(None) => return Parsed::Invalid,
        };

        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return Parsed::Partial(Some(Value::Object(map))),
            Some(b':') => i += 1,
            Some(_) => return Parsed::Invalid,
        }

        match parse_value(text, bytes, i, depth + 1) {
            Parsed::Complete(value, end) => {
                map.insert(key, value);
                i = skip_ws(bytes, end);
            }
            Parsed::Partial(Some(value)) => {
                map.insert(key, value);
                return Parsed::Partial(Some(Value::Object(map)));
            }
            Parsed::Partial(None) => return Parsed::Partial(Some(Value::Object(map))),
            Parsed::Invalid => return Parsed::Invalid,
        }

        match bytes.get(i) {
            None => return Parsed::Partial(Some(Value::Object(map))),
            Some(b',') => {
                i += 1;
                after_comma = true;
            }
            Some(b'}') => return Parsed::Complete(Value::Object(map), i + 1),
            Some(_) => return Parsed::Invalid,
        }
    }
}

fn parse_array(text: &str, bytes: &[u8], start: usize, depth: usize) -> Parsed {
    let mut items = Vec::new();
    let mut i = start + 1;
    let mut after_comma = false;
    loop {
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return Parsed::Partial(Some(Value::Array(items))),
            Some(b']') if !after_comma => return Parsed::Complete(Value::Array(items), i + 1),
            Some(_) => {}
        }

        match parse_value(text, bytes, i, depth + 1) {
            Parsed::Complete(value, end) => {
                items.push(value);
                i = skip_ws(bytes, end);
            }
            Parsed::Partial(Some(value)) => {
                items.push(value);
                return Parsed::Partial(Some(Value::Array(items)));
            }
            Parsed::Partial(None) => return Parsed::Partial(Some(Value::Array(items))),
            Parsed::Invalid => return Parsed::Invalid,
        }

        match bytes.get(i) {
            None => return Parsed::Partial(Some(Value::Array(items))),
            Some(b',') => {
                i += 1;
                after_comma = true;
            }
            Some(b']') => return Parsed::Complete(Value::Array(items), i + 1),
            Some(_) => return Parsed::Invalid,
        }
    }
}

/// Parse the string starting at `start` (which must be a `"`).
///
/// `Ok` carries the decoded string and the offset past its closing quote.
/// `Err(Some(_))` is an unterminated string decoded up to the cut;
/// `Err(None)` is malformed.
fn parse_string(text: &str, bytes: &[u8], start: usize) -> Result<(String, usize), Option<String>> {
    let mut i = start + 1;
    loop {
        let Some(rel) = memchr2(b'"', b'\\', &bytes[i..]) else {
            return Err(decode_unterminated(&text[start..]));
        };
        i += rel;
        if bytes[i] == b'"' {
            let end = i + 1;
            return serde_json::from_str::<String>(&text[start..end])
                .map(|s| (s, end))
                .map_err(|_| None);
        }
        // Backslash: skip the escaped byte.
        i += 2;
        if i >= bytes.len() {
            return Err(decode_unterminated(&text[start..]));
        }
    }
}

/// Close an unterminated string literal (including its opening quote) and decode it.
fn decode_unterminated(literal: &str) -> Option<String> {
    let body = trim_incomplete_escape(&literal[1..]);
    let mut closed = String::with_capacity(body.len() + 2);
    closed.push('"');
    closed.push_str(body);
    closed.push('"');
    serde_json::from_str::<String>(&closed).ok()
}

/// Drop a trailing escape sequence that was cut before it finished, along
/// with a high surrogate whose low half has not arrived yet.
fn trim_incomplete_escape(body: &str) -> &str {
    let Some(pos) = last_escape(body.as_bytes()) else {
        return body;
    };
    let escape = &body.as_bytes()[pos..];
    let complete = match escape.get(1) {
        None => false,
        Some(b'u') => escape.len() >= 6,
        Some(_) => true,
    };
    if !complete {
        return trim_unpaired_surrogate(&body[..pos]);
    }
    trim_unpaired_surrogate(body)
}

fn trim_unpaired_surrogate(body: &str) -> &str {
    match last_escape(body.as_bytes()) {
        Some(pos) if is_high_surrogate_escape(&body.as_bytes()[pos..]) => &body[..pos],
        _ => body,
    }
}

/// Offset of the last backslash that starts an escape sequence.
fn last_escape(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut last = None;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            last = Some(i);
            i += 2;
        } else {
            i += 1;
        }
    }
    last
}

fn is_high_surrogate_escape(escape: &[u8]) -> bool {
    if escape.len() != 6 || escape[1] != b'u' {
        return false;
    }
    std::str::from_utf8(&escape[2..])
        .ok()
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        .is_some_and(|unit| (0xD800..=0xDBFF).contains(&unit))
}

fn parse_literal(bytes: &[u8], start: usize, literal: &[u8], value: Value) -> Parsed {
    let rest = &bytes[start..];
    if rest.starts_with(literal) {
        return Parsed::Complete(value, start + literal.len());
    }
    if literal.starts_with(rest) {
        return Parsed::Partial(Some(value));
    }
    Parsed::Invalid
}

fn parse_number(text: &str, bytes: &[u8], start: usize) -> Parsed {
    let mut end = start;
    while let Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E') = bytes.get(end) {
        end += 1;
    }
    let token = &text[start..end];
    if end < bytes.len() {
        return match parse_number_token(token) {
            Some(number) => Parsed::Complete(Value::Number(number), end),
            None => Parsed::Invalid,
        };
    }

    // The number runs to the end of input and may still be growing.
    let trimmed = token.trim_end_matches(['.', 'e', 'E', '+', '-']);
    Parsed::Partial(parse_number_token(trimmed).map(Value::Number))
}

fn parse_number_token(token: &str) -> Option<Number> {
    if token.is_empty() {
        return None;
    }
    serde_json::from_str::<Number>(token).ok()
}
