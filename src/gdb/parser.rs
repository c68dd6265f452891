//! GDB Machine Interface (MI) Parser
//!
//! Lexes MI output lines into raw records and parses record bodies into
//! [`MiValue`] trees. Typed extractors for the replies the session cares
//! about live at the bottom of the file.

use crate::gdb::error::{GdbError, ParseError};
use crate::gdb::types::*;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// The literal prompt GDB prints after each batch of records
pub const PROMPT: &str = "(gdb)";

// ============================================================================
// Value grammar
// ============================================================================

/// Parse a record body (the text after `class,`).
///
/// GDB omits the outer braces for the top-level body, so a bare run of
/// `name=value` members is accepted and returned as a hash. A body that
/// starts with `{`, `[` or `"` is parsed as that single value.
pub fn parse_value_body(input: &str) -> Result<MiValue, ParseError> {
    let mut cursor = Cursor::new(input);
    let value = match cursor.peek() {
        None => MiValue::Hash(MiHash::new()),
        Some(b'{') | Some(b'[') | Some(b'"') => cursor.value()?,
        Some(_) => MiValue::Hash(cursor.members(None)?),
    };
    if !cursor.at_end() {
        return Err(cursor.error("trailing characters after value"));
    }
    Ok(value)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(self.pos, message)
    }

    fn expect(&mut self, wanted: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(b) if b == wanted => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.error(&format!("expected '{}'", wanted as char))),
            None => Err(self.error(&format!("expected '{}', found end of input", wanted as char))),
        }
    }

    fn value(&mut self) -> Result<MiValue, ParseError> {
        match self.peek() {
            Some(b'"') => Ok(MiValue::Literal(self.literal()?)),
            Some(b'[') => self.list(),
            Some(b'{') => {
                self.pos += 1;
                if self.peek() == Some(b'}') {
                    self.pos += 1;
                    return Ok(MiValue::Hash(MiHash::new()));
                }
                let hash = self.members(Some(b'}'))?;
                self.expect(b'}')?;
                Ok(MiValue::Hash(hash))
            }
            Some(_) => Err(self.error("expected a value")),
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn list(&mut self) -> Result<MiValue, ParseError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(MiValue::List(items));
        }
        loop {
            let item = match self.peek() {
                Some(b'"') | Some(b'[') | Some(b'{') => self.value()?,
                // `name=value` inside a list: keep it as a one-member hash
                Some(_) => {
                    let name = self.identifier()?;
                    self.expect(b'=')?;
                    let value = self.value()?;
                    let mut hash = MiHash::new();
                    hash.push(name, value);
                    MiValue::Hash(hash)
                }
                None => return Err(self.error("unterminated list")),
            };
            items.push(item);
            match self.bump() {
                Some(b',') => continue,
                Some(b']') => return Ok(MiValue::List(items)),
                Some(_) => {
                    self.pos -= 1;
                    return Err(self.error("expected ',' or ']'"));
                }
                None => return Err(self.error("unterminated list")),
            }
        }
    }

    /// `name=value (,name=value)*`, stopping before `close` (or at end of
    /// input when `close` is `None`).
    fn members(&mut self, close: Option<u8>) -> Result<MiHash, ParseError> {
        let mut hash = MiHash::new();
        let mut folded: Vec<String> = Vec::new();
        loop {
            let name = self.identifier()?;
            self.expect(b'=')?;
            let value = self.value()?;
            insert_member(&mut hash, &mut folded, name, value);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b) if Some(b) == close => return Ok(hash),
                None if close.is_none() => return Ok(hash),
                None => return Err(self.error("unterminated hash")),
                Some(_) => return Err(self.error("expected ','")),
            }
        }
    }

    fn identifier(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn literal(&mut self) -> Result<String, ParseError> {
        self.expect(b'"')?;
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => return Ok(String::from_utf8_lossy(&out).into_owned()),
                Some(b'\\') => {
                    let escaped = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'e' => out.push(0x1b),
                        b'0'..=b'7' => {
                            let mut code = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((code & 0xff) as u8);
                        }
                        other => out.push(other),
                    }
                }
                Some(b) => out.push(b),
            }
        }
    }
}

/// Insert keeping names unique: a repeated name turns into a list holding
/// every value seen under it.
fn insert_member(hash: &mut MiHash, folded: &mut Vec<String>, name: String, value: MiValue) {
    match hash.get_mut(&name) {
        None => hash.push(name, value),
        Some(existing) => {
            if folded.contains(&name) {
                if let MiValue::List(items) = existing {
                    items.push(value);
                }
            } else {
                let first = std::mem::replace(existing, MiValue::List(Vec::new()));
                *existing = MiValue::List(vec![first, value]);
                folded.push(name);
            }
        }
    }
}

impl fmt::Display for MiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiValue::Literal(s) => write_literal(f, s),
            MiValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            MiValue::Hash(hash) => write!(f, "{{{}}}", hash),
        }
    }
}

/// Members without the surrounding braces, the way GDB prints a body
impl fmt::Display for MiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", member.variable, member.value)?;
        }
        Ok(())
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\{:03o}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

// ============================================================================
// Record lexing
// ============================================================================

/// Outcome of lexing one output line
#[derive(Debug, Clone, PartialEq)]
pub enum LexedLine {
    /// The `(gdb)` delimiter
    Prompt,
    Record {
        record: PendingRecord,
        /// Token text was present but not a valid integer, or a `^` record
        /// came without one
        malformed_token: bool,
    },
    /// Not MI framing at all; usually the inferior writing to the shared tty
    Unframed(String),
}

fn record_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d*)([\^*+=~@&])(.*)$").expect("record pattern is a valid regex")
    })
}

/// Split a line into token, sigil and tail. The trailing newline (and a
/// `\r` before it) must already be stripped or is stripped here.
pub fn lex_line(line: &str) -> LexedLine {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim_end() == PROMPT {
        return LexedLine::Prompt;
    }
    let Some(caps) = record_pattern().captures(line) else {
        return LexedLine::Unframed(line.to_string());
    };
    let digits = caps.get(1).map_or("", |m| m.as_str());
    let sigil_char = caps
        .get(2)
        .and_then(|m| m.as_str().chars().next())
        .unwrap_or('~');
    let Some(sigil) = Sigil::from_char(sigil_char) else {
        return LexedLine::Unframed(line.to_string());
    };
    let tail = caps.get(3).map_or("", |m| m.as_str()).to_string();

    let (token, bad_digits) = if digits.is_empty() {
        (0, false)
    } else {
        match digits.parse::<u64>() {
            Ok(t) => (t, false),
            Err(_) => (0, true),
        }
    };
    let malformed_token = bad_digits || (token == 0 && !sigil.tokenless_ok());
    LexedLine::Record {
        record: PendingRecord { token, sigil, tail },
        malformed_token,
    }
}

/// Split `class[,body]` into its parts
fn split_class(tail: &str) -> (&str, &str) {
    match tail.find(',') {
        Some(pos) => (&tail[..pos], &tail[pos + 1..]),
        None => (tail, ""),
    }
}

fn body_hash(text: &str) -> Result<MiHash, ParseError> {
    match parse_value_body(text)? {
        MiValue::Hash(hash) => Ok(hash),
        _ => Err(ParseError::new(0, "record body is not a list of results")),
    }
}

/// Parse the tail of a `^` record
pub fn parse_result_record(record: &PendingRecord) -> Result<ResultRecord, ParseError> {
    let (class_name, body) = split_class(&record.tail);
    let class = ResultClass::from_name(class_name)
        .ok_or_else(|| ParseError::new(0, format!("unknown result class '{}'", class_name)))?;
    Ok(ResultRecord {
        token: record.token,
        class,
        body: body_hash(body)?,
    })
}

/// Parse the tail of an out-of-band record into its class and body
pub fn parse_async_tail(tail: &str) -> Result<(String, MiHash), ParseError> {
    let (class_name, body) = split_class(tail);
    if class_name.is_empty() {
        return Err(ParseError::new(0, "missing async class"));
    }
    Ok((class_name.to_string(), body_hash(body)?))
}

/// Decode the quoted text of a stream record
pub fn parse_stream_text(tail: &str) -> Result<String, ParseError> {
    match parse_value_body(tail)? {
        MiValue::Literal(text) => Ok(text),
        _ => Err(ParseError::new(0, "stream record is not a string")),
    }
}

/// Quote a command argument as a C string unless it is a bare word
pub fn mi_quote(arg: &str) -> String {
    let bare = !arg.is_empty()
        && arg
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && c != '"' && c != '\\');
    if bare {
        arg.to_string()
    } else {
        MiValue::Literal(arg.to_string()).to_string()
    }
}

/// Message of a `^error` record
pub fn error_message(body: &MiHash) -> String {
    body.get_str("msg")
        .unwrap_or("Unknown error")
        .to_string()
}

// ============================================================================
// Typed extractors
// ============================================================================

fn parse_address(text: Option<&str>) -> u64 {
    text.and_then(|s| {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        }
    })
    .unwrap_or(0)
}

/// `file://` URI for the frame's source, preferring the absolute path
pub fn source_uri(tuple: &MiHash) -> Option<String> {
    if let Some(full) = tuple.get_str("fullname") {
        if full.starts_with('/') {
            return Some(format!("file://{}", full));
        }
        return Some(full.to_string());
    }
    tuple.get_str("file").map(|f| f.to_string())
}

/// Location (uri, line) of a frame tuple, used for the stop frame which
/// carries no level
pub fn parse_location(tuple: &MiHash) -> (Option<String>, Option<u32>) {
    (source_uri(tuple), tuple.get_u32("line"))
}

fn parse_arguments(args: Option<&MiValue>) -> Vec<FrameArgument> {
    args.and_then(MiValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| {
            let name = item.get_str("name")?;
            Some(FrameArgument {
                name: name.to_string(),
                value: item.get_str("value").map(|v| v.to_string()),
            })
        })
        .collect()
}

/// Frame from a `frame={...}` tuple; `None` without a level
pub fn parse_frame(tuple: &MiHash) -> Option<Frame> {
    Some(Frame {
        level: tuple.get_u32("level")?,
        address: parse_address(tuple.get_str("addr")),
        function: tuple.get_str("func").unwrap_or("??").to_string(),
        source_uri: source_uri(tuple),
        line: tuple.get_u32("line"),
        arguments: parse_arguments(tuple.get("args")),
    })
}

/// List elements are either `frame={...}` one-member hashes or bare tuples
fn unwrap_member<'a>(item: &'a MiValue, name: &str) -> Option<&'a MiHash> {
    let hash = item.as_hash()?;
    match hash.get(name).and_then(MiValue::as_hash) {
        Some(inner) => Some(inner),
        None => Some(hash),
    }
}

/// Frames of a `-stack-list-frames` reply, in order.
///
/// A frame whose level differs from its position means the reply does not
/// belong to the request; that is reported as a protocol error.
pub fn parse_stack(body: &MiHash) -> Result<Vec<Frame>, GdbError> {
    let items = body
        .get("stack")
        .and_then(MiValue::as_list)
        .ok_or_else(|| GdbError::Protocol("stack-list-frames reply has no stack".to_string()))?;
    let mut frames = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let frame = unwrap_member(item, "frame")
            .and_then(parse_frame)
            .ok_or_else(|| GdbError::Protocol(format!("unreadable frame at position {}", index)))?;
        if frame.level as usize != index {
            return Err(GdbError::Protocol(format!(
                "frame level {} reported at position {}",
                frame.level, index
            )));
        }
        frames.push(frame);
    }
    Ok(frames)
}

/// `(level, arguments)` pairs of a `-stack-list-arguments` reply
pub fn parse_stack_arguments(body: &MiHash) -> Vec<(u32, Vec<FrameArgument>)> {
    body.get("stack-args")
        .and_then(MiValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| {
            let frame = unwrap_member(item, "frame")?;
            Some((frame.get_u32("level")?, parse_arguments(frame.get("args"))))
        })
        .collect()
}

/// Names of a `-stack-list-locals 0` reply
pub fn parse_local_names(body: &MiHash) -> Vec<String> {
    body.get("locals")
        .and_then(MiValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| item.get_str("name").map(|n| n.to_string()))
        .collect()
}

/// Breakpoint from a `bkpt={...}` tuple
pub fn parse_breakpoint(tuple: &MiHash) -> Option<Breakpoint> {
    Some(Breakpoint {
        number: tuple.get_str("number")?.to_string(),
        source_uri: source_uri(tuple),
        line: tuple.get_u32("line"),
        function: tuple.get_str("func").map(|s| s.to_string()),
        enabled: tuple.get_str("enabled").map(|s| s == "y").unwrap_or(true),
    })
}

/// Reply of `-var-create`
#[derive(Debug, Clone, PartialEq)]
pub struct VarCreateReply {
    pub name: String,
    pub child_count: Option<u32>,
    pub value: Option<String>,
    pub var_type: Option<String>,
}

pub fn parse_var_create(body: &MiHash) -> Result<VarCreateReply, GdbError> {
    let name = body
        .get_str("name")
        .ok_or_else(|| GdbError::Protocol("var-create reply has no name".to_string()))?;
    Ok(VarCreateReply {
        name: name.to_string(),
        child_count: body.get_u32("numchild"),
        value: body.get_str("value").map(|s| s.to_string()),
        var_type: body.get_str("type").map(|s| s.to_string()),
    })
}

/// One child of a `-var-list-children` reply
#[derive(Debug, Clone, PartialEq)]
pub struct VarChildReply {
    pub name: String,
    pub expression: String,
    pub child_count: Option<u32>,
    pub value: Option<String>,
    pub var_type: Option<String>,
}

pub fn parse_var_children(body: &MiHash) -> Vec<VarChildReply> {
    body.get("children")
        .and_then(MiValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| {
            let child = unwrap_member(item, "child")?;
            let name = child.get_str("name")?.to_string();
            Some(VarChildReply {
                expression: child.get_str("exp").unwrap_or(&name).to_string(),
                name,
                child_count: child.get_u32("numchild"),
                value: child.get_str("value").map(|s| s.to_string()),
                var_type: child.get_str("type").map(|s| s.to_string()),
            })
        })
        .collect()
}

/// Scope state reported by `-var-update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InScope {
    Yes,
    No,
    /// The object can never be evaluated again (e.g. its library unloaded)
    Invalid,
}

/// One entry of a `-var-update` changelist
#[derive(Debug, Clone, PartialEq)]
pub struct VarChange {
    pub name: String,
    pub value: Option<String>,
    pub in_scope: InScope,
    pub type_changed: bool,
    pub new_type: Option<String>,
    pub new_child_count: Option<u32>,
}

pub fn parse_changelist(body: &MiHash) -> Vec<VarChange> {
    body.get("changelist")
        .and_then(MiValue::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|item| {
            let entry = unwrap_member(item, "varobj")?;
            let in_scope = match entry.get_str("in_scope") {
                Some("false") => InScope::No,
                Some("invalid") => InScope::Invalid,
                _ => InScope::Yes,
            };
            Some(VarChange {
                name: entry.get_str("name")?.to_string(),
                value: entry.get_str("value").map(|s| s.to_string()),
                in_scope,
                type_changed: entry.get_str("type_changed") == Some("true"),
                new_type: entry.get_str("new_type").map(|s| s.to_string()),
                new_child_count: entry.get_u32("new_num_children"),
            })
        })
        .collect()
}
