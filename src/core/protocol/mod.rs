// src/core/protocol/mod.rs

//! The peer wire protocol: ASCII command lines with CRLF termination, a
//! binary blob-transfer sublayer, and binary list bodies announced through
//! `SIZE=<n>` reply fields. This module holds the line-level primitives;
//! `framing` and `lists` hold the binary sublayers.

pub mod codec;
pub mod framing;
pub mod lists;

use crate::core::errors::NetCacheError;
use std::fmt::Write as _;

pub const OK_PREFIX: &str = "OK:";
pub const ERR_PREFIX: &str = "ERR:";
pub const SIZE_FIELD: &str = "SIZE=";

// Reply tokens with protocol meaning. The `1`-suffixed variants additionally
// require the blob writer to emit a fake framed blob so the stream stays in
// lockstep.
pub const TOK_BLOB_NOT_FOUND: &str = "BLOB not found";
pub const TOK_NEED_ABORT: &str = "NEED_ABORT";
pub const TOK_NEED_ABORT1: &str = "NEED_ABORT1";
pub const TOK_HAVE_NEWER: &str = "HAVE_NEWER";
pub const TOK_HAVE_NEWER1: &str = "HAVE_NEWER1";
pub const TOK_CROSS_SYNC: &str = "CROSS_SYNC";
pub const TOK_IN_PROGRESS: &str = "IN_PROGRESS";
pub const TOK_ALL_BLOBS: &str = "ALL_BLOBS";
pub const TOK_READY: &str = "READY";

/// Verbs understood by the peer-facing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVerb {
    SyncStart,
    SyncBlobsList,
    SyncPut,
    SyncProlong,
    SyncGet,
    SyncProInfo,
    SyncCommit,
    SyncCancel,
    CopyPut,
    CopyProlong,
    CopyRemove,
    ProxyMeta,
}

impl PeerVerb {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "SYNC_START" => Some(Self::SyncStart),
            "SYNC_BLIST" => Some(Self::SyncBlobsList),
            "SYNC_PUT" => Some(Self::SyncPut),
            "SYNC_PROLONG" => Some(Self::SyncProlong),
            "SYNC_GET" => Some(Self::SyncGet),
            "SYNC_PROINFO" => Some(Self::SyncProInfo),
            "SYNC_COMMIT" => Some(Self::SyncCommit),
            "SYNC_CANCEL" => Some(Self::SyncCancel),
            "COPY_PUT" => Some(Self::CopyPut),
            "COPY_PROLONG" => Some(Self::CopyProlong),
            "COPY_RMV" => Some(Self::CopyRemove),
            "PROXY_META" => Some(Self::ProxyMeta),
            _ => None,
        }
    }
}

/// Incremental builder for outgoing command lines. Integer fields go through
/// `itoa` since command assembly sits on the mirror hot path.
pub struct CmdBuilder {
    buf: String,
}

impl CmdBuilder {
    pub fn new(verb: &str) -> Self {
        let mut buf = String::with_capacity(128);
        buf.push_str(verb);
        Self { buf }
    }

    pub fn u64(mut self, value: u64) -> Self {
        let mut fmt = itoa::Buffer::new();
        self.buf.push(' ');
        self.buf.push_str(fmt.format(value));
        self
    }

    pub fn u32(self, value: u32) -> Self {
        self.u64(value as u64)
    }

    pub fn u16(self, value: u16) -> Self {
        self.u64(value as u64)
    }

    pub fn i32(mut self, value: i32) -> Self {
        let mut fmt = itoa::Buffer::new();
        self.buf.push(' ');
        self.buf.push_str(fmt.format(value));
        self
    }

    pub fn quoted(mut self, value: &str) -> Self {
        self.buf.push(' ');
        let _ = write!(self.buf, "{}", Quoted(value));
        self
    }

    pub fn token(mut self, value: &str) -> Self {
        self.buf.push(' ');
        self.buf.push_str(value);
        self
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// Display adapter writing a double-quoted, escaped string field.
pub struct Quoted<'a>(pub &'a str);

impl std::fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("\"")?;
        for ch in self.0.chars() {
            match ch {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                _ => f.write_char(ch)?,
            }
        }
        f.write_str("\"")
    }
}

/// Splits a command or reply line into fields. Double-quoted fields may
/// contain spaces and backslash escapes; bare fields are space-delimited.
pub fn split_fields(line: &str) -> Result<Vec<String>, NetCacheError> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ')) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut field = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => field.push(escaped),
                        None => {
                            return Err(NetCacheError::Protocol(
                                "unterminated escape in quoted field".to_string(),
                            ));
                        }
                    },
                    Some(ch) => field.push(ch),
                    None => {
                        return Err(NetCacheError::Protocol(
                            "unterminated quoted field".to_string(),
                        ));
                    }
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch == ' ' {
                    break;
                }
                field.push(ch);
                chars.next();
            }
        }
        fields.push(field);
    }
    Ok(fields)
}

/// True when the reply line signals success.
pub fn is_ok_reply(line: &str) -> bool {
    line.starts_with(OK_PREFIX)
}

/// The reply text after the `OK:`/`ERR:` prefix.
pub fn reply_text(line: &str) -> &str {
    line.strip_prefix(OK_PREFIX)
        .or_else(|| line.strip_prefix(ERR_PREFIX))
        .unwrap_or(line)
        .trim()
}

/// Case-insensitive token containment check over a reply line.
pub fn contains_token(line: &str, token: &str) -> bool {
    line.to_ascii_uppercase().contains(&token.to_ascii_uppercase())
}

/// Extracts the `SIZE=<n>` field from a reply line.
pub fn parse_size(line: &str) -> Result<u64, NetCacheError> {
    let pos = line
        .find(SIZE_FIELD)
        .ok_or_else(|| NetCacheError::Protocol(format!("no SIZE field in reply: {line}")))?;
    let rest = &line[pos + SIZE_FIELD.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(NetCacheError::Protocol(format!(
            "malformed SIZE field in reply: {line}"
        )));
    }
    Ok(digits.parse()?)
}

/// Parses an unsigned integer field at `idx`, with a protocol error naming
/// the field on failure.
pub fn field_u64(fields: &[String], idx: usize, name: &str) -> Result<u64, NetCacheError> {
    fields
        .get(idx)
        .ok_or_else(|| NetCacheError::Protocol(format!("missing field {name}")))?
        .parse()
        .map_err(|_| NetCacheError::Protocol(format!("invalid field {name}")))
}

pub fn field_i32(fields: &[String], idx: usize, name: &str) -> Result<i32, NetCacheError> {
    fields
        .get(idx)
        .ok_or_else(|| NetCacheError::Protocol(format!("missing field {name}")))?
        .parse()
        .map_err(|_| NetCacheError::Protocol(format!("invalid field {name}")))
}

pub fn field_str<'a>(
    fields: &'a [String],
    idx: usize,
    name: &str,
) -> Result<&'a str, NetCacheError> {
    fields
        .get(idx)
        .map(String::as_str)
        .ok_or_else(|| NetCacheError::Protocol(format!("missing field {name}")))
}
