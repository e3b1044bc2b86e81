//! Protocol message parsing and formatting.
//!
//! This module handles the low-level grammar of Tor's control port: reply
//! line framing, `KEY=VALUE` tokens, quoted strings and command formatting.
//! Parsers work on raw bytes because quoted values may carry arbitrary
//! octets through `\NNN` escapes.

use crate::error::{Result, StatusCode, TorControlError};
use std::borrow::Cow;
use std::fmt::Write as _;

/// Position marker of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// `-`: more lines follow.
    Intermediate,
    /// `+`: a data block follows, terminated by a lone `.`.
    Data,
    /// ` `: last line of the reply.
    Final,
}

impl Position {
    /// Decode the fourth byte of a reply line.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'-' => Some(Position::Intermediate),
            b'+' => Some(Position::Data),
            b' ' => Some(Position::Final),
            _ => None,
        }
    }
}

/// Whether a reply answers a command or reports an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Reply to the command at the front of the queue.
    Sync,
    /// Asynchronous event (`6xy`).
    Async,
}

/// One decoded reply line, borrowing from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    /// The three-digit status.
    pub status: &'a str,
    /// The position marker.
    pub position: Position,
    /// Everything after the position marker.
    pub body: &'a [u8],
}

impl<'a> ReplyLine<'a> {
    /// Decode a line with its CRLF already stripped.
    pub fn parse(line: &'a [u8]) -> Result<Self> {
        if line.len() < 4 {
            return Err(TorControlError::ProtocolError(format!(
                "reply line too short: \"{}\"",
                escapify(line)
            )));
        }

        let status = &line[..3];
        if !status.iter().all(u8::is_ascii_digit) {
            return Err(TorControlError::ProtocolError(format!(
                "invalid status in reply line: \"{}\"",
                escapify(line)
            )));
        }
        let status = std::str::from_utf8(status)
            .map_err(|e| TorControlError::ProtocolError(e.to_string()))?;

        let position = Position::from_byte(line[3]).ok_or_else(|| {
            TorControlError::ProtocolError(format!(
                "invalid position marker in reply line: \"{}\"",
                escapify(line)
            ))
        })?;

        Ok(ReplyLine {
            status,
            position,
            body: &line[4..],
        })
    }

    /// Sync or async, decided by the first status digit.
    pub fn class(&self) -> ReplyClass {
        if self.status.starts_with('6') {
            ReplyClass::Async
        } else {
            ReplyClass::Sync
        }
    }

    /// The body as text, replacing invalid UTF-8.
    pub fn body_str(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.body)
    }
}

/// The terminating line of a synchronous reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalReply {
    /// The three-digit status.
    pub status: String,
    /// The body of the final line.
    pub body: String,
}

impl FinalReply {
    /// Create a reply from its parts.
    pub fn new(status: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            body: body.into(),
        }
    }

    /// `250 OK`, the only reply most commands count as success.
    pub fn is_ok(&self) -> bool {
        self.status_code() == StatusCode::Ok && self.body == "OK"
    }

    /// The status classified.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_status(&self.status)
    }

    /// Turn anything but `250 OK` into [`TorControlError::CommandRejected`].
    pub fn into_ok(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(TorControlError::rejected(self.status, self.body))
        }
    }
}

/// A parsed `KEY=VALUE` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Text before the first `=`.
    pub key: String,
    /// The value with quoting removed.
    pub value: Vec<u8>,
    /// Offset just past the token and any spaces that follow it.
    pub end: usize,
}

/// Parse a single `KEY=VALUE` token at the start of `input`.
///
/// Unquoted values run to the next space, which is consumed. Quoted values
/// are decoded with [`parse_quoted`] and every space after the closing quote
/// is consumed, so `end` points at the next token.
pub fn parse_kv(input: &[u8]) -> Result<KeyValue> {
    let eq = input
        .iter()
        .position(|&b| b == b'=')
        .ok_or_else(|| malformed_kv(input, "missing '='"))?;
    let key = String::from_utf8_lossy(&input[..eq]).into_owned();
    let vstart = eq + 1;

    if vstart == input.len() {
        return Ok(KeyValue {
            key,
            value: Vec::new(),
            end: input.len(),
        });
    }

    if input[vstart] != b'"' {
        let (vend, end) = match input[vstart..].iter().position(|&b| b == b' ') {
            Some(offset) => (vstart + offset, vstart + offset + 1),
            None => (input.len(), input.len()),
        };
        let value = &input[vstart..vend];
        if value.contains(&b'"') {
            return Err(malformed_kv(input, "stray quote in unquoted value"));
        }
        return Ok(KeyValue {
            key,
            value: value.to_vec(),
            end,
        });
    }

    let (value, consumed) = parse_quoted(&input[vstart..])?;
    let mut end = vstart + consumed;
    while input.get(end) == Some(&b' ') {
        end += 1;
    }
    Ok(KeyValue { key, value, end })
}

/// Parse a token that must span all of `input`.
pub fn parse_kv_exact(input: &[u8]) -> Result<(String, Vec<u8>)> {
    let kv = parse_kv(input)?;
    if kv.end != input.len() {
        return Err(malformed_kv(input, "trailing data after value"));
    }
    Ok((kv.key, kv.value))
}

/// Parse a space-separated run of `KEY=VALUE` tokens.
pub fn parse_kv_pairs(input: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut pairs = Vec::new();
    let mut rest = input;
    loop {
        while let [b' ', tail @ ..] = rest {
            rest = tail;
        }
        if rest.is_empty() {
            return Ok(pairs);
        }
        let kv = parse_kv(rest)?;
        rest = &rest[kv.end..];
        pairs.push((kv.key, kv.value));
    }
}

fn malformed_kv(input: &[u8], reason: &str) -> TorControlError {
    TorControlError::ParseError(format!("{reason}: \"{}\"", escapify(input)))
}

/// Decode a quoted string. `input[0]` must be the opening quote.
///
/// Returns the decoded bytes and the offset just past the closing quote.
/// Escapes are `\n`, `\r`, `\t`, `\\`, `\"`, `\'` and three-digit octal.
pub fn parse_quoted(input: &[u8]) -> Result<(Vec<u8>, usize)> {
    #[derive(Clone, Copy)]
    enum State {
        Start,
        Body,
        Backslash,
        Octal1(u32),
        Octal2(u32),
    }

    let reject = |reason: &str| {
        TorControlError::ParseError(format!("{reason} in \"{}\"", escapify(input)))
    };

    let mut state = State::Start;
    let mut value = Vec::with_capacity(input.len());
    for (i, &ch) in input.iter().enumerate() {
        state = match (state, ch) {
            (State::Start, b'"') => State::Body,
            (State::Start, _) => return Err(reject("missing opening quote")),
            (State::Body, b'"') => return Ok((value, i + 1)),
            (State::Body, b'\\') => State::Backslash,
            (State::Body, _) => {
                value.push(ch);
                State::Body
            }
            (State::Backslash, b'0'..=b'7') => State::Octal1(u32::from(ch - b'0') << 6),
            (State::Backslash, _) => {
                let unescaped = match ch {
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'\\' | b'"' | b'\'' => ch,
                    _ => return Err(reject("invalid escape")),
                };
                value.push(unescaped);
                State::Body
            }
            (State::Octal1(acc), b'0'..=b'7') => State::Octal2(acc | (u32::from(ch - b'0') << 3)),
            (State::Octal2(acc), b'0'..=b'7') => {
                // \4xx and up wrap to a single octet.
                value.push((acc | u32::from(ch - b'0')) as u8);
                State::Body
            }
            (State::Octal1(_) | State::Octal2(_), _) => {
                return Err(reject("truncated octal escape"))
            }
        };
    }
    Err(reject("unterminated quoted string"))
}

/// Encode bytes as a quoted string that [`parse_quoted`] decodes exactly.
pub fn quote_bytes(value: &[u8]) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for &b in value {
        match b {
            b'"' => quoted.push_str("\\\""),
            b'\\' => quoted.push_str("\\\\"),
            b'\n' => quoted.push_str("\\n"),
            b'\r' => quoted.push_str("\\r"),
            b'\t' => quoted.push_str("\\t"),
            0x20..=0x7e => quoted.push(char::from(b)),
            _ => {
                let _ = write!(quoted, "\\{b:03o}");
            }
        }
    }
    quoted.push('"');
    quoted
}

/// Format a command line from a keyword and arguments, without CRLF.
pub fn format_command<S: AsRef<str>>(keyword: &str, args: &[S]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg.as_ref());
    }
    cmd
}

/// Render bytes printable for logs: `\f \n \r \t` and `\xHH` for the rest.
pub fn escapify(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            0x0c => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}
