/// Literal Values - the only data channel in and out of the sandbox
///
/// **Core Responsibility:**
/// Test inputs are injected into student programs as Python source literals,
/// and program results come back as printed text. Both directions go through
/// the small literal grammar implemented here.
///
/// **Safety Properties:**
/// - `parse_literal` accepts literals only (numbers, strings, booleans, None,
///   lists, tuples, dicts); it never evaluates expressions
/// - Nesting depth is capped so hostile program output cannot blow the stack
/// - `Value::Expr` is rendered verbatim into generated programs and is therefore
///   only ever evaluated inside the sandbox, never on the host

use serde::de::Deserializer;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

/// A loosely typed value as found in test case fixtures and program output
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integer outside the `i64` range, kept as canonical decimal digits
    BigInt(String),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered key/value pairs
    Dict(Vec<(Value, Value)>),
    /// Source fragment passed through to the sandboxed program untouched
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid literal at offset {offset}: {message}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum Number<'a> {
    Int(i64),
    Big(&'a str),
    Float(f64),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Exact integer from decimal text (optional sign, digits only).
    /// Values beyond `i64` become `BigInt` instead of losing precision.
    pub fn integer(text: &str) -> Option<Value> {
        let (negative, digits) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let digits = digits.trim_start_matches('0');
        if digits.is_empty() {
            return Some(Value::Int(0));
        }
        let canonical = if negative { format!("-{}", digits) } else { digits.to_string() };
        Some(match canonical.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::BigInt(canonical),
        })
    }

    /// Render the value in Python literal syntax (the `repr` form)
    pub fn to_literal(&self) -> String {
        let mut out = String::new();
        self.write_literal(&mut out);
        out
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::BigInt(digits) => out.push_str(digits),
            Value::Float(f) => out.push_str(&float_literal(*f)),
            Value::Str(s) => quote_str(s, out),
            Value::List(items) => {
                out.push('[');
                write_items(items, out);
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                write_items(items, out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(pairs) => {
                out.push('{');
                for (idx, (key, value)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    key.write_literal(out);
                    out.push_str(": ");
                    value.write_literal(out);
                }
                out.push('}');
            }
            Value::Expr(source) => out.push_str(source),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view following Python's numeric tower (bool is an int)
    pub fn as_f64(&self) -> Option<f64> {
        match self.as_number()? {
            Number::Int(n) => Some(n as f64),
            Number::Big(digits) => digits.parse::<f64>().ok(),
            Number::Float(f) => Some(f),
        }
    }

    fn as_number(&self) -> Option<Number<'_>> {
        match self {
            Value::Bool(b) => Some(Number::Int(i64::from(*b))),
            Value::Int(n) => Some(Number::Int(*n)),
            Value::BigInt(digits) => Some(Number::Big(digits)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Equality with Python `==` semantics for literal values
    ///
    /// - `True == 1 == 1.0`
    /// - integers compare exactly at any size
    /// - lists never equal tuples
    /// - dicts compare regardless of key order
    pub fn py_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return match (a, b) {
                (Number::Int(a), Number::Int(b)) => a == b,
                (Number::Big(a), Number::Big(b)) => a == b,
                // `Big` never holds a value in the `i64` range
                (Number::Int(_), Number::Big(_)) | (Number::Big(_), Number::Int(_)) => false,
                (Number::Int(a), Number::Float(b)) | (Number::Float(b), Number::Int(a)) => {
                    a as f64 == b
                }
                (Number::Big(a), Number::Float(b)) | (Number::Float(b), Number::Big(a)) => {
                    b.is_finite() && b.fract() == 0.0 && format!("{:.0}", b) == a
                }
                (Number::Float(a), Number::Float(b)) => a == b,
            };
        }

        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .any(|(other_key, other_value)| key.py_eq(other_key) && value.py_eq(other_value))
                    })
            }
            (Value::Expr(a), Value::Expr(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_literal())
    }
}

fn write_items(items: &[Value], out: &mut String) {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        item.write_literal(out);
    }
}

fn float_literal(f: f64) -> String {
    if f.is_nan() {
        "float('nan')".to_string()
    } else if f.is_infinite() {
        let literal = if f > 0.0 { "float('inf')" } else { "-float('inf')" };
        literal.to_string()
    } else {
        // Debug formatting is the shortest round-trip form and always keeps a
        // fractional part or exponent, so Python reads it back as a float
        format!("{:?}", f)
    }
}

fn quote_str(s: &str, out: &mut String) {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

/// Parse a Python literal (the subset `ast.literal_eval` accepts for plain data)
pub fn parse_literal(text: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser { src: text, pos: 0, depth: 0 };
    parser.skip_ws();
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError { offset: self.pos, message: message.into() }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), LiteralError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", byte as char)))
        }
    }

    fn parse_value(&mut self) -> Result<Value, LiteralError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let value = match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'[') => self.parse_list(),
            Some(b'(') => self.parse_parenthesized(),
            Some(b'{') => self.parse_dict(),
            Some(b'\'') | Some(b'"') => self.parse_string().map(Value::Str),
            Some(b) if b == b'-' || b == b'+' || b == b'.' || b.is_ascii_digit() => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.parse_keyword(),
            Some(_) => Err(self.error("unexpected character")),
        };
        self.depth -= 1;
        value
    }

    /// Comma separated values up to `close`, trailing comma allowed.
    /// Returns the items and whether any comma was seen.
    fn parse_sequence(&mut self, close: u8) -> Result<(Vec<Value>, bool), LiteralError> {
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok((items, saw_comma));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    saw_comma = true;
                }
                Some(b) if b == close => {
                    self.pos += 1;
                    return Ok((items, saw_comma));
                }
                _ => return Err(self.error(format!("expected `,` or `{}`", close as char))),
            }
        }
    }

    fn parse_list(&mut self) -> Result<Value, LiteralError> {
        self.expect(b'[')?;
        let (items, _) = self.parse_sequence(b']')?;
        Ok(Value::List(items))
    }

    fn parse_parenthesized(&mut self) -> Result<Value, LiteralError> {
        self.expect(b'(')?;
        let (mut items, saw_comma) = self.parse_sequence(b')')?;
        // `(x)` is just a grouped value, `(x,)` and `()` are tuples
        if items.len() == 1 && !saw_comma {
            return Ok(items.remove(0));
        }
        Ok(Value::Tuple(items))
    }

    fn parse_dict(&mut self) -> Result<Value, LiteralError> {
        self.expect(b'{')?;
        let mut pairs = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Dict(pairs));
            }
            let key = self.parse_value()?;
            self.skip_ws();
            if self.peek() != Some(b':') {
                return Err(self.error("expected `:` (set literals are not supported)"));
            }
            self.pos += 1;
            self.skip_ws();
            let value = self.parse_value()?;
            match pairs.iter_mut().find(|pair| pair.0.py_eq(&key)) {
                Some(slot) => slot.1 = value,
                None => pairs.push((key, value)),
            }
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Dict(pairs));
                }
                _ => return Err(self.error("expected `,` or `}`")),
            }
        }
    }

    fn parse_keyword(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        match &self.src[start..self.pos] {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            other => {
                self.pos = start;
                Err(self.error(format!("`{}` is not a literal", other)))
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-') | Some(b'+')) {
            self.pos += 1;
            self.skip_ws();
        }
        let body_start = self.pos;
        let mut is_float = false;
        let mut digits = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => digits += 1,
                b'_' => {}
                b'.' => is_float = true,
                b'e' | b'E' => {
                    is_float = true;
                    if matches!(self.src.as_bytes().get(self.pos + 1), Some(b'-') | Some(b'+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
            self.pos += 1;
        }
        if digits == 0 {
            self.pos = start;
            return Err(self.error("expected a number"));
        }
        if matches!(self.peek(), Some(b) if b.is_ascii_alphabetic()) {
            return Err(self.error("unsupported numeric literal"));
        }

        let negative = self.src.as_bytes()[start] == b'-';
        let body: String = self.src[body_start..self.pos].chars().filter(|c| *c != '_').collect();
        let text = if negative { format!("-{}", body) } else { body };

        if !is_float {
            if let Some(integer) = Value::integer(&text) {
                return Ok(integer);
            }
        }
        text.parse::<f64>().map(Value::Float).map_err(|_| LiteralError {
            offset: start,
            message: format!("malformed number `{}`", &self.src[start..self.pos]),
        })
    }

    fn parse_string(&mut self) -> Result<String, LiteralError> {
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q as char,
            _ => return Err(self.error("expected a string")),
        };
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.src[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                c if c == quote => {
                    self.pos += offset + 1;
                    return Ok(out);
                }
                '\n' => {
                    self.pos += offset;
                    return Err(self.error("unterminated string"));
                }
                '\\' => {
                    let Some((_, escaped)) = chars.next() else { break };
                    match escaped {
                        '\n' => {}
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        '0' => out.push('\0'),
                        'a' => out.push('\x07'),
                        'b' => out.push('\x08'),
                        'f' => out.push('\x0c'),
                        'v' => out.push('\x0b'),
                        'x' | 'u' | 'U' => {
                            let width = match escaped {
                                'x' => 2,
                                'u' => 4,
                                _ => 8,
                            };
                            let hex: String = chars.by_ref().take(width).map(|(_, h)| h).collect();
                            let decoded = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == width)
                                .and_then(char::from_u32);
                            match decoded {
                                Some(ch) => out.push(ch),
                                None => {
                                    self.pos += offset;
                                    return Err(self.error(format!("invalid \\{} escape", escaped)));
                                }
                            }
                        }
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                c => out.push(c),
            }
        }
        self.pos = self.src.len();
        Err(self.error("unterminated string"))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::BigInt(digits) => match digits.parse::<i128>() {
                Ok(n) => serializer.serialize_i128(n),
                Err(_) => serializer.serialize_f64(digits.parse::<f64>().unwrap_or(f64::NAN)),
            },
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) | Value::Expr(s) => serializer.serialize_str(s),
            Value::List(items) | Value::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (key, value) in pairs {
                    match key {
                        Value::Str(key) => map.serialize_entry(key, value)?,
                        other => map.serialize_entry(&other.to_literal(), value)?,
                    }
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::BigInt(u.to_string())
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Dict(
                map.into_iter()
                    .map(|(key, value)| (Value::Str(key), Value::from(value)))
                    .collect(),
            ),
        }
    }
}
