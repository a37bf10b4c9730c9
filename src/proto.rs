//! SBP settings protocol constants and payload definitions.
//!
//! The settings sub-protocol exchanges NUL-delimited token payloads
//! (`section\0name\0value\0type\0`) over plain SBP messages. This module
//! holds the message ids, the status code enums, and the token codec.
#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use std::error::Error;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sender id of the settings daemon. Settings traffic from any other
/// sender is rejected.
pub const DAEMON_SENDER_ID: u16 = 0x42;

/// Maximum SBP payload length, and therefore the ceiling for any
/// formatted settings message.
pub const PAYLOAD_MAX: usize = 255;

#[derive(Debug, Clone)]
pub(crate) struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "settings protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

/// SBP message ids of the settings sub-protocol.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgId {
    /// Write request, `section\0name\0value\0`.
    WRITE = 0x00a0,
    /// Enumeration request, payload is a 2-byte little-endian index.
    READ_BY_INDEX_REQ = 0x00a2,
    /// Read request, `section\0name\0`.
    READ_REQ = 0x00a4,
    /// Read reply, `section\0name\0value\0[type\0]`.
    READ_RESP = 0x00a5,
    /// End-of-enumeration marker.
    READ_BY_INDEX_DONE = 0x00a6,
    /// Enumeration reply, 2-byte index followed by a setting tuple.
    READ_BY_INDEX_RESP = 0x00a7,
    /// Owner announces a setting to the daemon.
    REGISTER = 0x00ae,
    /// Status byte followed by `section\0name\0value\0`.
    WRITE_RESP = 0x00af,
    /// Daemon acknowledges a registration with the authoritative value.
    REGISTER_RESP = 0x01af,
}

/// Result of a write request, surfaced to callers and echoed on the wire
/// as the leading byte of a `WRITE_RESP`.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteResult {
    /// Setting written.
    OK = 0,
    /// Setting value invalid.
    VALUE_REJECTED = 1,
    /// Setting does not exist.
    SETTING_REJECTED = 2,
    /// Could not parse the setting value.
    PARSE_FAILED = 3,
    /// Setting is read only.
    READ_ONLY = 4,
    /// Setting is not modifiable.
    MODIFY_DISABLED = 5,
    /// System failure while applying the setting.
    SERVICE_FAILED = 6,
    /// Request wasn't replied to in time.
    TIMEOUT = 7,
}

/// Status byte of a `REGISTER_RESP`.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationStatus {
    /// Registered, the requested value was accepted.
    OK = 0,
    /// Registered, but the daemon already had a persisted value; the
    /// echoed value is authoritative.
    OK_PERM = 1,
    /// Another process already registered this setting.
    REGISTERED = 2,
    /// The daemon could not parse the registration request.
    PARSE_FAILED = 3,
}

/// How many tokens a settings payload carried.
///
/// A payload is a run of NUL-terminated strings; counting the NULs tells
/// how far into `section`, `name`, `value`, `type` the sender got. The
/// legacy trailing empty string (two consecutive NULs at the end) is
/// tolerated as [`TokenCount::ExtraNull`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenCount {
    /// Not a settings payload: no trailing NUL, too many tokens, or
    /// tokens that are not text.
    Invalid,
    /// Zero-length payload.
    Empty,
    /// Only `section` present.
    Section,
    /// `section` and `name`.
    Name,
    /// `section`, `name` and `value`.
    Value,
    /// All four tokens.
    Type,
    /// Four tokens plus the legacy trailing empty string.
    ExtraNull,
}

/// Borrowed views of the tokens found in a payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tokens<'a> {
    /// Setting section.
    pub section: Option<&'a str>,
    /// Setting name.
    pub name: Option<&'a str>,
    /// Setting value in text form.
    pub value: Option<&'a str>,
    /// Type descriptor: `enum:A,B,C` or the type id as ASCII decimal.
    pub fmt_type: Option<&'a str>,
}

/// Parse a settings payload into its tokens, zero-copy.
///
/// Any fifth token (the legacy sentinel) is counted but not returned.
pub fn parse_tokens(buf: &[u8]) -> (TokenCount, Tokens<'_>) {
    if buf.is_empty() {
        return (TokenCount::Empty, Tokens::default());
    }
    if buf[buf.len() - 1] != 0 {
        return (TokenCount::Invalid, Tokens::default());
    }

    let mut tokens = Tokens::default();
    let mut count = 0usize;
    let mut start = 0usize;
    for (idx, &byte) in buf.iter().enumerate() {
        if byte != 0 {
            continue;
        }
        let token = match std::str::from_utf8(&buf[start..idx]) {
            Ok(s) => s,
            Err(_) => return (TokenCount::Invalid, Tokens::default()),
        };
        match count {
            0 => tokens.section = Some(token),
            1 => tokens.name = Some(token),
            2 => tokens.value = Some(token),
            3 => tokens.fmt_type = Some(token),
            _ => {}
        }
        start = idx + 1;
        count += 1;
    }

    let count = match count {
        1 => TokenCount::Section,
        2 => TokenCount::Name,
        3 => TokenCount::Value,
        4 => TokenCount::Type,
        5 => TokenCount::ExtraNull,
        _ => return (TokenCount::Invalid, Tokens::default()),
    };
    (count, tokens)
}

/// Format up to four tokens as a settings payload, stopping at the first
/// absent one. Returns `None` when the result would not fit an SBP
/// payload or a token embeds a NUL.
pub fn format_tokens(
    section: Option<&str>,
    name: Option<&str>,
    value: Option<&str>,
    fmt_type: Option<&str>,
) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    for token in [section, name, value, fmt_type] {
        let token = match token {
            Some(t) => t,
            None => break,
        };
        if token.as_bytes().contains(&0) {
            return None;
        }
        buf.extend_from_slice(token.as_bytes());
        buf.push(0);
        if buf.len() > PAYLOAD_MAX {
            return None;
        }
    }
    Some(buf)
}

/// Encode a read-by-index request payload.
pub fn index_payload(idx: u16) -> Vec<u8> {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, idx);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_and_unterminated() {
        assert_eq!(parse_tokens(b"").0, TokenCount::Empty);
        assert_eq!(parse_tokens(b"a").0, TokenCount::Invalid);
    }

    #[test]
    fn parse_token_counts() {
        let (count, tokens) = parse_tokens(b"a\0");
        assert_eq!(count, TokenCount::Section);
        assert_eq!(tokens.section, Some("a"));
        assert_eq!(tokens.name, None);

        let (count, tokens) = parse_tokens(b"a\0b\0c\0d\0");
        assert_eq!(count, TokenCount::Type);
        assert_eq!(tokens.section, Some("a"));
        assert_eq!(tokens.name, Some("b"));
        assert_eq!(tokens.value, Some("c"));
        assert_eq!(tokens.fmt_type, Some("d"));
    }

    #[test]
    fn parse_legacy_trailing_null() {
        let (count, tokens) = parse_tokens(b"a\0b\0c\0d\0\0");
        assert_eq!(count, TokenCount::ExtraNull);
        assert_eq!(tokens.fmt_type, Some("d"));
    }

    #[test]
    fn parse_too_many_tokens() {
        assert_eq!(parse_tokens(b"a\0b\0c\0d\0e\0f\0").0, TokenCount::Invalid);
    }

    #[test]
    fn parse_empty_value_is_distinct_from_missing() {
        let (count, tokens) = parse_tokens(b"a\0b\0\0");
        assert_eq!(count, TokenCount::Value);
        assert_eq!(tokens.value, Some(""));

        let (count, tokens) = parse_tokens(b"a\0b\0");
        assert_eq!(count, TokenCount::Name);
        assert_eq!(tokens.value, None);
    }

    #[test]
    fn format_then_parse_is_identity() {
        let buf = format_tokens(Some("sec"), Some("nam"), Some("val"), Some("0")).unwrap();
        assert_eq!(buf, b"sec\0nam\0val\0\x30\0");
        let (count, tokens) = parse_tokens(&buf);
        assert_eq!(count, TokenCount::Type);
        assert_eq!(tokens.section, Some("sec"));
        assert_eq!(tokens.name, Some("nam"));
        assert_eq!(tokens.value, Some("val"));
        assert_eq!(tokens.fmt_type, Some("0"));
    }

    #[test]
    fn format_stops_at_first_missing_token() {
        let buf = format_tokens(Some("sec"), Some("nam"), None, Some("0")).unwrap();
        assert_eq!(buf, b"sec\0nam\0");
    }

    #[test]
    fn format_rejects_overflow() {
        let long = "x".repeat(PAYLOAD_MAX);
        assert!(format_tokens(Some(&long), Some("n"), None, None).is_none());
    }

    #[test]
    fn index_payload_is_little_endian() {
        assert_eq!(index_payload(2), vec![0x02, 0x00]);
        assert_eq!(index_payload(0x1234), vec![0x34, 0x12]);
    }
}
