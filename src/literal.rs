//! Parser for stringified nested structures.
//!
//! Endpoints sometimes return message content as the textual form of a list
//! or dict. That text is either JSON or the Python literal spelling of the
//! same data (single quotes, `True`/`False`/`None`, tuples, trailing commas).
//! Both are accepted and produce a [`serde_json::Value`].

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Same nesting limit serde_json applies.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, PartialEq)]
#[error("invalid literal at byte {position}: {message}")]
pub struct LiteralError {
    pub position: usize,
    pub message: String,
}

pub fn parse(input: &str) -> Result<Value, LiteralError> {
    if let Ok(value) = serde_json::from_str::<Value>(input) {
        return Ok(value);
    }

    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> LiteralError {
        LiteralError {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.peek() {
            if !ch.is_whitespace() {
                break;
            }
            self.pos += ch.len_utf8();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        self.skip_ws();
        match self.bump() {
            Some(ch) if ch == want => Ok(()),
            _ => Err(self.error(&format!("expected '{want}'"))),
        }
    }

    fn value(&mut self) -> Result<Value, LiteralError> {
        self.skip_ws();
        match self.peek() {
            Some('[') => self.nested(|p| p.sequence('[', ']')),
            Some('(') => self.nested(|p| p.sequence('(', ')')),
            Some('{') => self.nested(Self::mapping),
            Some('\'') | Some('"') => self.string().map(Value::String),
            Some(ch) if ch == '-' || ch == '+' || ch == '.' || ch.is_ascii_digit() => {
                self.number()
            }
            Some(ch) if ch.is_alphabetic() => self.keyword(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Value, LiteralError>,
    ) -> Result<Value, LiteralError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn sequence(&mut self, open: char, close: char) -> Result<Value, LiteralError> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(ch) if ch == close => return Ok(Value::Array(items)),
                _ => return Err(self.error(&format!("expected ',' or '{close}'"))),
            }
        }
    }

    fn mapping(&mut self) -> Result<Value, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(key) => key,
                other => other.to_string(),
            };
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(ch) if ch == quote => return Ok(out),
                Some('\\') => self.escape(&mut out)?,
                Some(ch) => out.push(ch),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), LiteralError> {
        match self.bump() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some('x') => out.push(self.hex_char(2)?),
            Some('u') => out.push(self.hex_char(4)?),
            Some('U') => out.push(self.hex_char(8)?),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => return Err(self.error("unterminated escape")),
        }
        Ok(())
    }

    fn hex_char(&mut self, digits: usize) -> Result<char, LiteralError> {
        let end = self.pos + digits;
        let hex = self
            .src
            .get(self.pos..end)
            .ok_or_else(|| self.error("truncated escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos = end;
        char::from_u32(code).ok_or_else(|| self.error("invalid code point"))
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E' | '_') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| LiteralError {
                position: start,
                message: format!("invalid number '{text}'"),
            })
    }

    fn keyword(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        match &self.src[start..self.pos] {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "null" => Ok(Value::Null),
            word => Err(LiteralError {
                position: start,
                message: format!("unknown name '{word}'"),
            }),
        }
    }
}
