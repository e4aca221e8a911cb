use std::collections::BTreeMap;

use super::{DecodeError, Precision};
use crate::point::{FieldValue, Measurement, Point};

const MEASUREMENT_ESCAPES: &[u8] = b", ";
const KEY_ESCAPES: &[u8] = b",= ";

/// Walks one record of line protocol, `number` is the 1-based line it starts on.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    number: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, number: usize) -> Self {
        Self {
            bytes: line.as_bytes(),
            pos: 0,
            number,
        }
    }

    fn error(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::InvalidLineProtocol {
            line: self.number,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn expect(&mut self, byte: u8) -> Result<(), DecodeError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}' at column {}", byte as char, self.pos + 1)))
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    /// Reads up to the first unescaped byte of `stops`, unescaping `escapes`.
    fn read_token(&mut self, stops: &[u8], escapes: &[u8]) -> Result<String, DecodeError> {
        let mut out = Vec::new();
        while let Some(b) = self.peek() {
            if b == b'\\' {
                match self.bytes.get(self.pos + 1) {
                    Some(next) if escapes.contains(next) || *next == b'\\' => {
                        out.push(*next);
                        self.pos += 2;
                        continue;
                    }
                    _ => {}
                }
            } else if stops.contains(&b) {
                break;
            }
            out.push(b);
            self.pos += 1;
        }
        String::from_utf8(out).map_err(|_| self.error("invalid UTF-8 in token"))
    }

    fn read_quoted(&mut self) -> Result<String, DecodeError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string field")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') if matches!(self.bytes.get(self.pos + 1), Some(b'"' | b'\\')) => {
                    out.push(self.bytes[self.pos + 1]);
                    self.pos += 2;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out).map_err(|_| self.error("invalid UTF-8 in string field"))
    }

    fn parse_field_value(&self, key: &str, raw: &str) -> Result<FieldValue, DecodeError> {
        match raw {
            "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Bool(true)),
            "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Bool(false)),
            _ => {}
        }
        let invalid = || self.error(format!("invalid value {raw:?} for field {key}"));
        if let Some(int) = raw.strip_suffix('i') {
            int.parse().map(FieldValue::Int).map_err(|_| invalid())
        } else if let Some(uint) = raw.strip_suffix('u') {
            uint.parse().map(FieldValue::UInt).map_err(|_| invalid())
        } else {
            match raw.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(FieldValue::Float(f)),
                _ => Err(invalid()),
            }
        }
    }

    fn parse(mut self, precision: Precision, now: i64) -> Result<Point, DecodeError> {
        let name = self.read_token(b", ", MEASUREMENT_ESCAPES)?;
        if name.is_empty() {
            return Err(self.error("missing measurement"));
        }
        let measurement: Measurement = name.parse()?;

        let mut tags = BTreeMap::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            let key = self.read_token(b"=, ", KEY_ESCAPES)?;
            self.expect(b'=')?;
            let value = self.read_token(b", ", KEY_ESCAPES)?;
            if key.is_empty() || value.is_empty() {
                return Err(self.error("empty tag key or value"));
            }
            tags.insert(key, value);
        }

        if self.peek() != Some(b' ') {
            return Err(self.error("missing fields"));
        }
        self.skip_spaces();

        let mut fields = BTreeMap::new();
        loop {
            let key = self.read_token(b"=, ", KEY_ESCAPES)?;
            if key.is_empty() {
                return Err(self.error("empty field key"));
            }
            self.expect(b'=')?;
            let value = if self.peek() == Some(b'"') {
                FieldValue::String(self.read_quoted()?)
            } else {
                let raw = self.read_token(b", ", &[])?;
                self.parse_field_value(&key, &raw)?
            };
            fields.insert(key, value);
            if self.peek() == Some(b',') {
                self.pos += 1;
            } else {
                break;
            }
        }

        self.skip_spaces();
        let time = if self.at_end() {
            now
        } else {
            let raw = self.read_token(b" ", &[])?;
            self.skip_spaces();
            if !self.at_end() {
                return Err(self.error("unexpected data after timestamp"));
            }
            let ts = raw
                .parse::<i64>()
                .map_err(|_| self.error(format!("invalid timestamp {raw:?}")))?;
            precision.to_nanos(ts)?
        };

        Point::new(measurement, tags, fields, time).map_err(|e| self.error(e.to_string()))
    }
}

/// Splits a body into records. A newline ends a record unless it sits inside
/// a quoted field value, so multi-line stacks survive. Yields the 1-based line
/// each record starts on.
fn records(body: &str) -> Vec<(usize, &str)> {
    let bytes = body.as_bytes();
    let mut records = Vec::new();
    let mut line = 1;
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\n' => {
                line += 1;
                pos += 1;
                continue;
            }
            b' ' | b'\t' | b'\r' => {
                pos += 1;
                continue;
            }
            _ => {}
        }

        let start = pos;
        let start_line = line;
        let comment = bytes[pos] == b'#';
        let mut in_fields = false;
        let mut quoted = false;
        while pos < bytes.len() {
            match bytes[pos] {
                b'\n' if !quoted => break,
                b'\n' => line += 1,
                b'\\' if !comment => {
                    if bytes.get(pos + 1) == Some(&b'\n') {
                        line += 1;
                    }
                    pos += 1;
                }
                b'"' if in_fields && !comment => quoted = !quoted,
                b' ' if !quoted => in_fields = true,
                _ => {}
            }
            pos += 1;
        }

        if !comment {
            let end = pos.min(bytes.len());
            records.push((start_line, body[start..end].trim_end_matches([' ', '\t', '\r'])));
        }
    }
    records
}

pub fn decode_line_protocol(
    body: &str,
    precision: Precision,
    now: i64,
) -> Result<Vec<Point>, DecodeError> {
    records(body)
        .into_iter()
        .map(|(number, record)| Cursor::new(record, number).parse(precision, now))
        .collect()
}
