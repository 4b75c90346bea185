// bw-protocol: control-channel frame grammar and shared wire types.
//
// Frames are newline-terminated UTF-8 text:
//
//     VERB pos1 pos2 key=value key2='quoted value'
//
// Verbs are case-insensitive on input and uppercase on output.  Tokens are
// split shell-style (single/double quotes group, backslash escapes), then
// separated into positionals and keywords by the presence of `=`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const PROTOCOL_VERSION: &str = "2.0.1";

/// Default control-channel port.
pub const CONTROL_PORT: u16 = 9938;
/// Default file-transfer (HTTPS) port.
pub const TRANSFER_PORT: u16 = 9921;

// ---------------------------------------------------------------------------
// Verbs
// ---------------------------------------------------------------------------

/// Canonical verb strings.  Kept as constants rather than an enum so unknown
/// verbs pass through the codec and fail at dispatch, not at parse.
pub mod verbs {
    // registration
    pub const REGISTER: &str = "REGISTER";
    pub const AUTH: &str = "AUTH";
    pub const VER: &str = "VER";

    // keep-alive
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";

    // broadcast
    pub const START: &str = "START";
    pub const STOP: &str = "STOP";

    // file transfer
    pub const UPLOAD_TOKEN: &str = "UPLOAD_TOKEN";
    pub const DOWNLOAD_TOKEN: &str = "DOWNLOAD_TOKEN";
    pub const DOWNLOAD_URL: &str = "DOWNLOAD_URL";
    pub const STREAM_TOKEN: &str = "STREAM_TOKEN";

    // client management
    pub const KICK: &str = "KICK";

    // file management
    pub const LIST_FILES: &str = "LIST_FILES";
    pub const REMOVE_FILE: &str = "REMOVE_FILE";

    // client-originated events
    pub const BROADCAST_ENDED: &str = "BROADCAST_ENDED";

    // responses
    pub const OK: &str = "OK";
    pub const ERROR: &str = "ERROR";
    pub const REGISTER_OK: &str = "REGISTER_OK";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Unbalanced quotes or a dangling escape.  The connection stays open;
    /// the peer answers `ERROR message='…'`.
    #[error("invalid command syntax: {0}")]
    InvalidSyntax(String),
    /// Blank line; skipped by callers.
    #[error("empty frame")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid value for {field}: {value}")]
    InvalidField { field: String, value: String },
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One decoded control-channel frame.
///
/// Keyword arguments are held in a `BTreeMap` so encoding is deterministic;
/// `parse(encode(f)) == f` for every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub verb: String,
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
}

impl Frame {
    pub fn new(verb: &str) -> Self {
        Frame {
            verb: verb.to_uppercase(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kw(mut self, key: &str, value: impl ToString) -> Self {
        self.kwargs.insert(key.to_owned(), value.to_string());
        self
    }

    /// `OK`
    pub fn ok() -> Self {
        Frame::new(verbs::OK)
    }

    /// `OK message='…'`
    pub fn ok_with(message: &str) -> Self {
        Frame::new(verbs::OK).kw("message", message)
    }

    /// `ERROR message='…'`
    pub fn error(message: &str) -> Self {
        Frame::new(verbs::ERROR).kw("message", message)
    }

    pub fn is_ok(&self) -> bool {
        self.verb == verbs::OK
    }

    /// True for the simple `OK` / `ERROR` reply pair.
    pub fn is_reply(&self) -> bool {
        self.verb == verbs::OK || self.verb == verbs::ERROR
    }

    pub fn message(&self) -> &str {
        self.kwarg("message").unwrap_or("")
    }

    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    pub fn require_kwarg(&self, key: &str) -> Result<&str, ProtocolError> {
        self.kwarg(key)
            .ok_or_else(|| ProtocolError::MissingField(key.to_owned()))
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Decode one line.  The trailing newline, if present, is ignored.
    pub fn parse(line: &str) -> Result<Frame, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let tokens = split_tokens(line)?;
        let mut iter = tokens.into_iter();
        let verb = match iter.next() {
            Some(v) => v.to_uppercase(),
            None => return Err(ProtocolError::Empty),
        };

        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        for token in iter {
            match token.split_once('=') {
                Some((key, value)) => {
                    kwargs.insert(key.to_owned(), value.to_owned());
                }
                None => args.push(token),
            }
        }

        Ok(Frame { verb, args, kwargs })
    }

    /// Encode to a single line (no trailing newline).
    pub fn encode(&self) -> String {
        let mut parts = vec![self.verb.to_uppercase()];
        for arg in &self.args {
            parts.push(quote(arg));
        }
        for (key, value) in &self.kwargs {
            parts.push(format!("{key}={}", quote(value)));
        }
        parts.join(" ")
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Shell-style token split: whitespace separates tokens, single quotes group
/// literally, double quotes group with `\"` and `\\` escapes, and a backslash
/// outside quotes escapes the next character.
pub fn split_tokens(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    loop {
        let Some(c) = chars.next() else { break };
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ProtocolError::InvalidSyntax(
                                "no closing single quote".to_owned(),
                            ));
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(ProtocolError::InvalidSyntax(
                                    "no closing double quote".to_owned(),
                                ));
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ProtocolError::InvalidSyntax(
                                "no closing double quote".to_owned(),
                            ));
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(esc) => current.push(esc),
                    None => {
                        return Err(ProtocolError::InvalidSyntax(
                            "dangling escape at end of line".to_owned(),
                        ));
                    }
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | ':' | ',' | '.' | '/' | '-')
}

/// Quote a value for embedding in a frame.  Values made entirely of safe
/// characters pass through bare; anything else is single-quoted with embedded
/// single quotes rendered as `'"'"'`.
pub fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_safe_char) {
        return value.to_owned();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

// ---------------------------------------------------------------------------
// Version compatibility
// ---------------------------------------------------------------------------

/// Parse `major.minor.patch`; malformed input collapses to `(0, 0, 0)` so it
/// never matches a real version.
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version.split('.').map(|p| p.parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => (major, minor, patch),
        (Some(Ok(major)), Some(Ok(minor)), None) => (major, minor, 0),
        _ => (0, 0, 0),
    }
}

/// Two peers speak the same protocol when their major and minor components
/// match; the patch component is free to differ.
pub fn versions_compatible(a: &str, b: &str) -> bool {
    let (a_major, a_minor, _) = parse_version(a);
    let (b_major, b_minor, _) = parse_version(b);
    (a_major, a_minor) == (b_major, b_minor)
}

// ---------------------------------------------------------------------------
// Broadcast parameters
// ---------------------------------------------------------------------------

/// Everything a client needs to arm its transmitter for one file.
///
/// `start_at` is an absolute UTC epoch in seconds; `0.0` means start
/// immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastParams {
    pub filename: String,
    pub frequency: f64,
    pub ps: String,
    pub rt: String,
    pub pi: String,
    pub loop_play: bool,
    pub start_at: f64,
}

impl Default for BroadcastParams {
    fn default() -> Self {
        BroadcastParams {
            filename: String::new(),
            frequency: 90.0,
            ps: "BotWave".to_owned(),
            rt: "Broadcasting".to_owned(),
            pi: "FFFF".to_owned(),
            loop_play: false,
            start_at: 0.0,
        }
    }
}

impl BroadcastParams {
    pub fn for_file(filename: &str) -> Self {
        BroadcastParams {
            filename: filename.to_owned(),
            ..BroadcastParams::default()
        }
    }

    /// `START filename=… freq=… ps=… rt=… pi=… loop=… start_at=…`
    pub fn to_start_frame(&self) -> Frame {
        Frame::new(verbs::START)
            .kw("filename", &self.filename)
            .kw("freq", self.frequency)
            .kw("ps", &self.ps)
            .kw("rt", &self.rt)
            .kw("pi", &self.pi)
            .kw("loop", self.loop_play)
            .kw("start_at", self.start_at)
    }

    pub fn from_start_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let filename = frame.require_kwarg("filename")?.to_owned();
        let defaults = BroadcastParams::default();
        Ok(BroadcastParams {
            filename,
            frequency: parse_kwarg(frame, "freq", defaults.frequency)?,
            ps: frame.kwarg("ps").unwrap_or(&defaults.ps).to_owned(),
            rt: frame.kwarg("rt").unwrap_or(&defaults.rt).to_owned(),
            pi: frame.kwarg("pi").unwrap_or(&defaults.pi).to_owned(),
            loop_play: parse_kwarg(frame, "loop", false)?,
            start_at: parse_kwarg(frame, "start_at", 0.0)?,
        })
    }
}

fn parse_kwarg<T: std::str::FromStr>(
    frame: &Frame,
    key: &str,
    default: T,
) -> Result<T, ProtocolError> {
    match frame.kwarg(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ProtocolError::InvalidField {
            field: key.to_owned(),
            value: raw.to_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// File listings
// ---------------------------------------------------------------------------

/// One WAV file as reported by `LIST_FILES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// `YYYY-MM-DD HH:MM:SS`, client-local.
    pub modified: String,
}

/// Serialize a listing for the `files=` keyword of a `LIST_FILES` reply.
pub fn encode_file_list(files: &[FileEntry]) -> String {
    serde_json::to_string(files).unwrap_or_else(|_| "[]".to_owned())
}

pub fn decode_file_list(raw: &str) -> Result<Vec<FileEntry>, ProtocolError> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidField {
        field: "files".to_owned(),
        value: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
