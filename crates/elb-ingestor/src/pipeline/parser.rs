//! Access-log line parsing
//!
//! [`RecordStream`] yields one line at a time from a claimed file and
//! [`LineParser`] turns each line into a [`LogRecord`]. Lines missing required
//! fields are rejected with [`ParseError`]; lines whose individual fields are
//! off still become records, with `raw_line` attached.

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;

use super::format::{FieldKind, FieldSpec, LogFormat};
use super::record::LogRecord;
use crate::source::LogStream;

/// A line that cannot become a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed log line ({reason}): {line}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    fn new(line: &str, reason: impl Into<String>) -> Self {
        Self {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineParser {
    format: LogFormat,
}

impl LineParser {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &LogFormat {
        &self.format
    }

    pub fn parse_line(&self, line: &str) -> Result<LogRecord, ParseError> {
        let tokens = tokenize(line).map_err(|reason| ParseError::new(line, reason))?;

        let required = self.format.required();
        if tokens.len() < required {
            return Err(ParseError::new(
                line,
                format!("expected at least {} fields, found {}", required, tokens.len()),
            ));
        }

        let specs = self.format.fields();
        let mut timestamp = None;
        let mut fields = Map::new();
        let mut partial = tokens.len() != specs.len();

        for (spec, token) in specs.iter().zip(tokens.iter()) {
            if spec.kind == FieldKind::Timestamp {
                let parsed = DateTime::parse_from_rfc3339(token).map_err(|e| {
                    ParseError::new(line, format!("invalid timestamp '{}': {}", token, e))
                })?;
                timestamp = Some(parsed.with_timezone(&Utc));
                continue;
            }
            if !extract_field(spec, token, &mut fields) {
                fields.insert(spec.name.clone(), Value::String(token.clone()));
                partial = true;
            }
        }

        // LogFormat guarantees a timestamp inside the required prefix.
        let timestamp = timestamp.ok_or_else(|| ParseError::new(line, "missing timestamp"))?;

        let mut record = LogRecord::new(timestamp, fields);
        if partial {
            record.raw_line = Some(line.to_string());
        }
        Ok(record)
    }
}

/// Insert the typed value(s) for one field. Returns false when the token does
/// not fit the field kind, leaving `fields` untouched.
fn extract_field(spec: &FieldSpec, token: &str, fields: &mut Map<String, Value>) -> bool {
    let name = &spec.name;
    match spec.kind {
        FieldKind::Timestamp => false,
        FieldKind::Text => {
            fields.insert(name.clone(), Value::String(token.to_string()));
            true
        },
        FieldKind::Float => match parse_float(token) {
            Some(value) => {
                fields.insert(name.clone(), value);
                true
            },
            None => false,
        },
        FieldKind::Integer => match parse_integer(token) {
            Some(value) => {
                fields.insert(name.clone(), value);
                true
            },
            None => false,
        },
        FieldKind::Endpoint => match parse_endpoint(token) {
            Some((ip, port)) => {
                fields.insert(format!("{}_ip", name), ip);
                fields.insert(format!("{}_port", name), port);
                true
            },
            None => false,
        },
        FieldKind::Request => match parse_request(token) {
            Some([method, url, protocol]) => {
                fields.insert("request_method".to_string(), method);
                fields.insert("request_url".to_string(), url);
                fields.insert("request_protocol".to_string(), protocol);
                true
            },
            None => false,
        },
    }
}

fn dash_or<F>(token: &str, parse: F) -> Option<Value>
where
    F: FnOnce(&str) -> Option<Value>,
{
    if token == "-" {
        Some(Value::Null)
    } else {
        parse(token)
    }
}

fn parse_float(token: &str) -> Option<Value> {
    dash_or(token, |t| {
        t.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    })
}

fn parse_integer(token: &str) -> Option<Value> {
    dash_or(token, |t| t.parse::<i64>().ok().map(Value::from))
}

fn parse_endpoint(token: &str) -> Option<(Value, Value)> {
    if token == "-" {
        return Some((Value::Null, Value::Null));
    }
    let (ip, port) = token.rsplit_once(':')?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    if ip.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((Value::String(ip.to_string()), Value::from(port)))
}

fn parse_request(token: &str) -> Option<[Value; 3]> {
    let parts: Vec<&str> = token.split_whitespace().collect();
    let [method, url, protocol] = parts.as_slice() else {
        return None;
    };
    let text = |t: &str| {
        if t == "-" {
            Value::Null
        } else {
            Value::String(t.to_string())
        }
    };
    Some([text(method), text(url), text(protocol)])
}

/// Split on spaces; double-quoted tokens may contain spaces and `\"`.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == ' ' || c == '\t' {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => token.push(escaped),
                        Some(other) => {
                            token.push('\\');
                            token.push(other);
                        },
                        None => token.push('\\'),
                    },
                    '"' => {
                        closed = true;
                        break;
                    },
                    _ => token.push(c),
                }
            }
            if !closed {
                return Err("unterminated quoted field".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' || c == '\t' {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Longest accepted line in bytes; ELB entries are far shorter.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Bytes of an oversized line kept in its [`ParseError`].
const OVERSIZED_PREVIEW_BYTES: usize = 256;

/// Lazy line reader over a claimed file.
///
/// Bytes are decoded lossily, line endings stripped and blank lines skipped.
/// Only the current line is held in memory, capped at the configured maximum;
/// a longer line is skipped to its newline and reported as a [`ParseError`].
pub struct RecordStream {
    reader: LogStream,
    buf: Vec<u8>,
    max_line: usize,
    line_number: u64,
}

impl RecordStream {
    pub fn new(reader: LogStream) -> Self {
        Self::with_max_line(reader, MAX_LINE_BYTES)
    }

    pub fn with_max_line(reader: LogStream, max_line: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            max_line,
            line_number: 0,
        }
    }

    /// Physical line number of the last line returned (1-based).
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Next non-blank line, or `Err` for a line over the length cap.
    pub async fn next_line(&mut self) -> std::io::Result<Option<Result<String, ParseError>>> {
        // Room for the line plus a CRLF terminator.
        let limit = self.max_line.saturating_add(2);

        loop {
            self.buf.clear();
            let mut consumed_any = false;
            let mut oversized = false;

            loop {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    break;
                }
                consumed_any = true;

                let (chunk, at_newline) = match available.iter().position(|b| *b == b'\n') {
                    Some(i) => (&available[..=i], true),
                    None => (available, false),
                };
                let room = limit.saturating_sub(self.buf.len());
                if chunk.len() > room {
                    oversized = true;
                }
                self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

                let used = chunk.len();
                self.reader.consume(used);
                if at_newline {
                    break;
                }
            }

            if !consumed_any {
                return Ok(None);
            }
            self.line_number += 1;

            while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                self.buf.pop();
            }
            if oversized || self.buf.len() > self.max_line {
                let preview = &self.buf[..self.buf.len().min(OVERSIZED_PREVIEW_BYTES)];
                return Ok(Some(Err(ParseError::new(
                    &String::from_utf8_lossy(preview),
                    format!("line longer than {} bytes", self.max_line),
                ))));
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(Ok(String::from_utf8_lossy(&self.buf).into_owned())));
        }
    }
}
