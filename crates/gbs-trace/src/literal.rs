//! Reader for the literal syntax the debugger driver prints, one record per line.
//!
//! The driver writes records with its host language's `repr`, so tuples,
//! single-quoted strings and `None`/`True`/`False` have to be understood in
//! addition to plain JSON. Everything is lowered to [`serde_json::Value`];
//! tuples become arrays and dict keys are stringified.

use serde_json::{Map, Number, Value};

use crate::TraceError;

pub fn parse_literal(text: &str) -> Result<Value, TraceError> {
    let mut p = LiteralParser {
        src: text.as_bytes(),
        pos: 0,
    };
    let v = p.value()?;
    p.skip_ws();
    if p.pos != p.src.len() {
        return Err(p.err("trailing characters after literal"));
    }
    Ok(v)
}

struct LiteralParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl LiteralParser<'_> {
    fn err(&self, msg: &str) -> TraceError {
        TraceError::Literal {
            offset: self.pos,
            message: msg.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Result<Value, TraceError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.err("unexpected end of input")),
            Some(b'(') => {
                self.pos += 1;
                self.sequence(b')')
            }
            Some(b'[') => {
                self.pos += 1;
                self.sequence(b']')
            }
            Some(b'{') => {
                self.pos += 1;
                self.dict()
            }
            Some(q @ (b'\'' | b'"')) => {
                self.pos += 1;
                Ok(Value::String(self.string(q)?))
            }
            Some(b'-' | b'+' | b'0'..=b'9' | b'.') => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.word(),
            Some(_) => Err(self.err("unexpected character")),
        }
    }

    // Tuples and lists share a grammar; a trailing comma is allowed (`(1,)`).
    fn sequence(&mut self, close: u8) -> Result<Value, TraceError> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            if self.eat(b',') {
                continue;
            }
            if self.eat(close) {
                return Ok(Value::Array(items));
            }
            return Err(self.err("expected ',' or closing bracket"));
        }
    }

    fn dict(&mut self) -> Result<Value, TraceError> {
        let mut map = Map::new();
        loop {
            if self.eat(b'}') {
                return Ok(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Null => "None".to_string(),
                other => other.to_string(),
            };
            if !self.eat(b':') {
                return Err(self.err("expected ':' in dict"));
            }
            let v = self.value()?;
            map.insert(key, v);
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                return Ok(Value::Object(map));
            }
            return Err(self.err("expected ',' or '}' in dict"));
        }
    }

    fn string(&mut self, quote: u8) -> Result<String, TraceError> {
        let mut out: Vec<u8> = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated string"));
            };
            self.pos += 1;
            if c == quote {
                break;
            }
            if c != b'\\' {
                out.push(c);
                continue;
            }
            let Some(e) = self.peek() else {
                return Err(self.err("unterminated escape"));
            };
            self.pos += 1;
            match e {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'0' => out.push(0),
                b'\\' | b'\'' | b'"' => out.push(e),
                b'x' => {
                    let hex = self
                        .src
                        .get(self.pos..self.pos + 2)
                        .ok_or_else(|| self.err("truncated \\x escape"))?;
                    let hex = std::str::from_utf8(hex).map_err(|_| self.err("bad \\x escape"))?;
                    let b = u8::from_str_radix(hex, 16).map_err(|_| self.err("bad \\x escape"))?;
                    self.pos += 2;
                    // repr() only emits \x for code points below 0x100.
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(char::from(b).encode_utf8(&mut buf).as_bytes());
                }
                other => {
                    out.push(b'\\');
                    out.push(other);
                }
            }
        }
        String::from_utf8(out).map_err(|_| self.err("string is not valid UTF-8"))
    }

    fn number(&mut self) -> Result<Value, TraceError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'x' | b'X' | b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("bad number"))?;
        let (neg, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        if let Some(hex) = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            let n = i64::from_str_radix(hex, 16).map_err(|_| self.err("bad hex integer"))?;
            return Ok(Value::from(if neg { -n } else { n }));
        }
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Value::from(n));
        }
        if let Ok(n) = text.parse::<u64>() {
            return Ok(Value::from(n));
        }
        let f: f64 = text.parse().map_err(|_| self.err("bad number"))?;
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| self.err("non-finite float"))
    }

    fn word(&mut self) -> Result<Value, TraceError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        match &self.src[start..self.pos] {
            b"None" | b"null" => Ok(Value::Null),
            b"True" | b"true" => Ok(Value::Bool(true)),
            b"False" | b"false" => Ok(Value::Bool(false)),
            _ => {
                self.pos = start;
                Err(self.err("unknown bare word"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_driver_tuples() {
        let v = parse_literal("('call', None, 3, 'fib', 'fib', {'n': 10})").unwrap();
        assert_eq!(v, json!(["call", null, 3, "fib", "fib", {"n": 10}]));
    }

    #[test]
    fn reads_json_too() {
        let v = parse_literal(r#"["return", 3, "fib", 55]"#).unwrap();
        assert_eq!(v, json!(["return", 3, "fib", 55]));
    }

    #[test]
    fn string_escapes() {
        let v = parse_literal(r#"'it\'s\n"ok"'"#).unwrap();
        assert_eq!(v, json!("it's\n\"ok\""));
        let v = parse_literal(r"'\x41'").unwrap();
        assert_eq!(v, json!("A"));
    }

    #[test]
    fn numbers_and_singletons() {
        assert_eq!(parse_literal("-7").unwrap(), json!(-7));
        assert_eq!(parse_literal("0x10").unwrap(), json!(16));
        assert_eq!(parse_literal("2.5").unwrap(), json!(2.5));
        assert_eq!(parse_literal("(True, False, None,)").unwrap(), json!([true, false, null]));
    }

    #[test]
    fn dict_keys_are_stringified() {
        let v = parse_literal("{1: 'a', 'b': [1, 2]}").unwrap();
        assert_eq!(v, json!({"1": "a", "b": [1, 2]}));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_literal("('call', ").is_err());
        assert!(parse_literal("<optimized out>").is_err());
        assert!(parse_literal("(1) 2").is_err());
        assert!(parse_literal("Foo").is_err());
    }
}
