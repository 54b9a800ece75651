// SPDX-License-Identifier: GPL-3.0-or-later

//! The pytroll message envelope.
//!
//! A message is a versioned, self-describing text record:
//!
//! ```text
//! pytroll://<subject> <type> <sender> <isotime> <version> <id> [<mime> <data>]
//! ```
//!
//! For example:
//!
//! ```text
//! pytroll://DC/juhu info henry@prodsat 2010-12-01T12:21:11.123456+00:00 v1.02 \
//!     0b1aa7a4-… text/ascii jhuuuu !!!
//! ```
//!
//! The header opens with the `pytroll:/` magic word; the subject's leading
//! slash completes the familiar `pytroll://...` prefix. The `v1.02` protocol
//! writes timezone-aware timestamps and a message id; `v1.01` writes naive
//! UTC timestamps. Decoding is permissive: both timestamp forms are
//! accepted for both versions, and legacy headers without an id token are
//! assigned a fresh one.
//!
//! Note: the envelope is not optimized for BIG messages.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike, Utc};
use std::fmt;
use uuid::Uuid;

use crate::config::{MESSAGE_VERSION_CURRENT, MESSAGE_VERSION_LEGACY};
use crate::{Error, Result};

/// Magic word opening every encoded message.
pub const MAGIC: &str = "pytroll:/";

const MIME_TEXT: &str = "text/ascii";
const MIME_JSON: &str = "application/json";
const MIME_BINARY: &str = "binary/octet-stream";

/// Message payload: empty, a text blob, a structured mapping, or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// No payload.
    Empty,
    /// Raw text (`text/ascii` on the wire).
    Text(String),
    /// Structured key/value data (`application/json` on the wire).
    Json(serde_json::Value),
    /// Binary blob (`binary/octet-stream`, base64-framed on the wire).
    Binary(Vec<u8>),
}

impl MessageData {
    /// Collapse empty payload representations into [`MessageData::Empty`]
    /// so decode(encode(m)) is identity.
    fn normalized(self) -> Self {
        match self {
            MessageData::Text(ref s) if s.is_empty() => MessageData::Empty,
            MessageData::Binary(ref b) if b.is_empty() => MessageData::Empty,
            MessageData::Json(serde_json::Value::Null) => MessageData::Empty,
            other => other,
        }
    }
}

impl From<&str> for MessageData {
    fn from(s: &str) -> Self {
        MessageData::Text(s.to_string())
    }
}

impl From<String> for MessageData {
    fn from(s: String) -> Self {
        MessageData::Text(s)
    }
}

impl From<serde_json::Value> for MessageData {
    fn from(v: serde_json::Value) -> Self {
        MessageData::Json(v)
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(b: Vec<u8>) -> Self {
        MessageData::Binary(b)
    }
}

/// A pytroll message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// `/`-separated path naming what the message is about.
    pub subject: String,
    /// Short token naming the message kind (`info`, `file`, `beat`, ...).
    pub mtype: String,
    /// `user@host`, filled in at construction.
    pub sender: String,
    /// Microsecond-resolution timestamp.
    pub time: DateTime<FixedOffset>,
    /// Unique message id, never reused by the same producer.
    pub id: String,
    /// Protocol version token.
    pub version: String,
    /// Optional payload.
    pub data: MessageData,
}

impl Message {
    /// Create a message with the configured protocol version.
    ///
    /// Sender, timestamp and id are filled in automatically.
    pub fn new(subject: &str, mtype: &str, data: MessageData) -> Result<Self> {
        let version =
            crate::config::global().get_or("message_version", MESSAGE_VERSION_CURRENT);
        Self::with_version(subject, mtype, data, &version)
    }

    /// Create a message with an explicit protocol version.
    pub fn with_version(
        subject: &str,
        mtype: &str,
        data: MessageData,
        version: &str,
    ) -> Result<Self> {
        let message = Self {
            subject: subject.to_string(),
            mtype: mtype.to_string(),
            sender: local_sender(),
            time: now_micros(),
            id: Uuid::new_v4().to_string(),
            version: version.to_string(),
            data: data.normalized(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Decode a raw string into a message.
    pub fn decode(rawstr: &str) -> Result<Self> {
        let rest = rawstr.strip_prefix(MAGIC).ok_or_else(|| {
            Error::Message(format!(
                "not a '{MAGIC}' message (wrong magic word): '{}'",
                excerpt(rawstr)
            ))
        })?;

        let mut rest = rest;
        let mut header = [""; 5];
        for slot in &mut header {
            let (token, tail) = next_token(rest).ok_or_else(|| {
                Error::Message(format!("could not decode raw string: '{}'", excerpt(rawstr)))
            })?;
            *slot = token;
            rest = tail;
        }
        let [subject, mtype, sender, isotime, version] = header;

        if version != MESSAGE_VERSION_CURRENT && version != MESSAGE_VERSION_LEGACY {
            return Err(Error::Message(format!("invalid message version: '{version}'")));
        }

        // The id slot is absent in headers from legacy producers; the token
        // there is then a mime type, recognizable by its '/'.
        let id = match next_token(rest) {
            Some((token, tail)) if !token.contains('/') => {
                rest = tail;
                token.to_string()
            }
            _ => Uuid::new_v4().to_string(),
        };

        let data = match split_payload(rest) {
            None => MessageData::Empty,
            Some((mime, payload)) => decode_payload(mime, payload)?,
        };

        let message = Self {
            subject: subject.to_string(),
            mtype: mtype.to_string(),
            sender: sender.to_string(),
            time: parse_isotime(isotime)?,
            id,
            version: version.to_string(),
            data: data.normalized(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Encode the message to its raw string form.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut raw = self.head();
        match &self.data {
            MessageData::Empty => {}
            MessageData::Text(s) => {
                raw.push_str(&format!(" {MIME_TEXT} {s}"));
            }
            MessageData::Json(v) => {
                raw.push_str(&format!(" {MIME_JSON} {v}"));
            }
            MessageData::Binary(b) => {
                raw.push_str(&format!(" {MIME_BINARY} {}", BASE64.encode(b)));
            }
        }
        raw
    }

    /// The header alone (a message without its data part).
    #[must_use]
    pub fn head(&self) -> String {
        format!(
            "{MAGIC}{} {} {} {} {} {}",
            self.subject,
            self.mtype,
            self.sender,
            encode_isotime(&self.time, &self.version),
            self.version,
            self.id
        )
    }

    /// The user part of the sender, or `""`.
    #[must_use]
    pub fn user(&self) -> &str {
        match self.sender.find('@') {
            Some(i) => &self.sender[..i],
            None => "",
        }
    }

    /// The host part of the sender, or `""`.
    #[must_use]
    pub fn host(&self) -> &str {
        match self.sender.find('@') {
            Some(i) => &self.sender[i + 1..],
            None => "",
        }
    }

    fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(Error::Message("invalid subject: ''".into()));
        }
        if self.mtype.is_empty() {
            return Err(Error::Message("invalid type: ''".into()));
        }
        if self.sender.is_empty() {
            return Err(Error::Message("invalid sender: ''".into()));
        }
        if self.id.is_empty() {
            return Err(Error::Message("invalid id: ''".into()));
        }
        if self.version != MESSAGE_VERSION_CURRENT && self.version != MESSAGE_VERSION_LEGACY {
            return Err(Error::Message(format!(
                "invalid message version: '{}'",
                self.version
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// =======================================================================
// Encoding / decoding helpers
// =======================================================================

fn decode_payload(mime: &str, payload: &str) -> Result<MessageData> {
    match mime.to_ascii_lowercase().as_str() {
        MIME_TEXT => Ok(MessageData::Text(payload.to_string())),
        MIME_JSON => serde_json::from_str(payload)
            .map(MessageData::Json)
            .map_err(|_| Error::Message(format!("JSON decode failed on '{}'", excerpt(payload)))),
        MIME_BINARY => BASE64
            .decode(payload.trim())
            .map(MessageData::Binary)
            .map_err(|_| {
                Error::Message(format!("base64 decode failed on '{}'", excerpt(payload)))
            }),
        other => Err(Error::Message(format!("unknown mime-type '{other}'"))),
    }
}

fn encode_isotime(time: &DateTime<FixedOffset>, version: &str) -> String {
    if version <= MESSAGE_VERSION_LEGACY {
        // Legacy readers expect a naive UTC timestamp.
        time.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    } else {
        time.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

/// Parse an ISO-8601 timestamp, with or without zone offset, with or
/// without fractional seconds. Naive stamps are taken as UTC.
fn parse_isotime(raw: &str) -> Result<DateTime<FixedOffset>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(t.and_utc().fixed_offset());
        }
    }
    Err(Error::Message(format!(
        "invalid ISO formatted time string '{}'",
        excerpt(raw)
    )))
}

/// Split one whitespace-delimited token off the front, returning the token
/// and the remainder with leading whitespace stripped.
///
/// Header tokens only; the data block goes through [`split_payload`] so
/// its leading whitespace survives.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => Some((&s[..i], s[i..].trim_start())),
        None => Some((s, "")),
    }
}

/// Split the mime token off the front, then exactly one separator
/// character; the remainder is the payload, verbatim.
fn split_payload(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => {
            let separator = s[i..].chars().next().map_or(1, char::len_utf8);
            Some((&s[..i], &s[i + separator..]))
        }
        None => Some((s, "")),
    }
}

fn excerpt(s: &str) -> String {
    if s.chars().count() > 36 {
        let head: String = s.chars().take(36).collect();
        format!("{head} ...")
    } else {
        s.to_string()
    }
}

/// Now, truncated to microsecond resolution so encoding round-trips.
fn now_micros() -> DateTime<FixedOffset> {
    let now = Utc::now().fixed_offset();
    now.with_nanosecond(now.nanosecond() / 1000 * 1000)
        .unwrap_or(now)
}

/// Local `user@host` sender string.
fn local_sender() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{user}@{}", local_hostname())
}

fn local_hostname() -> String {
    if let Ok(output) = std::process::Command::new("hostname").output() {
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::new("/test/whatup/doc", "info", "not much to say".into()).unwrap();
        assert_eq!(format!("{}@{}", msg.user(), msg.host()), msg.sender);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode(), msg.encode());
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::new("/test/whatup/doc", "info", "not much to say".into()).unwrap();
        let expected = format!(
            "pytroll://test/whatup/doc info {} {} v1.02 {} text/ascii not much to say",
            msg.sender,
            msg.time.format("%Y-%m-%dT%H:%M:%S%.6f%:z"),
            msg.id
        );
        assert_eq!(msg.encode(), expected);
    }

    #[test]
    fn test_decode_legacy_without_id() {
        let raw = "pytroll://test/1/2/3 info ras@hawaii 2008-04-11T22:13:22.123000 v1.01 \
                   text/ascii \"what's up doc\"";
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.subject, "/test/1/2/3");
        assert_eq!(msg.mtype, "info");
        assert_eq!(msg.sender, "ras@hawaii");
        assert_eq!(msg.version, "v1.01");
        assert_eq!(msg.data, MessageData::Text("\"what's up doc\"".into()));
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_decode_json_payload() {
        let raw = "pytroll://oper/polar/direct_readout/norrköping pong sat@MERLIN \
                   2019-01-07T12:52:19.872171 v1.01 application/json {\"station\": \"norrköping\"}";
        let msg = Message::decode(raw).unwrap();
        match &msg.data {
            MessageData::Json(v) => assert_eq!(v["station"], "norrköping"),
            other => panic!("expected json payload, got {other:?}"),
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let metadata = serde_json::json!({
            "timestamp": "2010-12-03T16:28:39",
            "satellite": "metop2",
            "uri": "file://data/my/path/to/hrpt/files/myfile",
            "orbit": 1222,
            "format": "hrpt",
            "afloat": 1.2345,
        });
        let msg = Message::new("/sat/polar/smb/level1", "file", metadata.clone().into()).unwrap();
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Json(metadata));
    }

    #[test]
    fn test_binary_roundtrip() {
        let blob = vec![0u8, 1, 2, 255, 254, 127];
        let msg = Message::new("/blob", "file", blob.clone().into()).unwrap();
        assert!(msg.encode().contains("binary/octet-stream"));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Binary(blob));
    }

    #[test]
    fn test_v101_strips_zone() {
        let msg =
            Message::with_version("/test", "info", "hello".into(), "v1.01").unwrap();
        let raw = msg.encode();
        // Naive timestamp: no '+' offset in the time token.
        let time_token = raw.split_whitespace().nth(3).unwrap();
        assert!(!time_token.contains('+'));
        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.time, msg.time);
    }

    #[test]
    fn test_cross_version_decoding() {
        let legacy = Message::with_version("/a", "info", "x".into(), "v1.01").unwrap();
        let current = Message::with_version("/a", "info", "x".into(), "v1.02").unwrap();
        // Either encoded form decodes regardless of the configured version.
        assert!(Message::decode(&legacy.encode()).is_ok());
        assert!(Message::decode(&current.encode()).is_ok());
    }

    #[test]
    fn test_seconds_resolution_timestamp_accepted() {
        let raw = "pytroll://test info me@host 2011-11-14T12:51:25 v1.02";
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.time.timestamp_subsec_micros(), 0);
        assert_eq!(msg.data, MessageData::Empty);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        assert!(Message::decode("grumpf://test info me@host now v1.02").is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(Message::decode("pytroll://test info me@host").is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let raw = "pytroll://test info me@host 2011-11-14T12:51:25 v9.99";
        assert!(Message::decode(raw).is_err());
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let raw = "pytroll://test info me@host 2011-11-14T12:51:25 v1.02 video/mp4 xxx";
        assert!(Message::decode(raw).is_err());
    }

    #[test]
    fn test_bad_json_rejected() {
        let raw = "pytroll://test info me@host 2011-11-14T12:51:25 v1.01 application/json {oops";
        assert!(Message::decode(raw).is_err());
    }

    #[test]
    fn test_empty_subject_rejected() {
        assert!(Message::new("", "info", MessageData::Empty).is_err());
        assert!(Message::new("/ok", "", MessageData::Empty).is_err());
    }

    #[test]
    fn test_ids_unique() {
        let a = Message::new("/x", "info", MessageData::Empty).unwrap();
        let b = Message::new("/x", "info", MessageData::Empty).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_data_normalized() {
        let msg = Message::new("/x", "info", "".into()).unwrap();
        assert_eq!(msg.data, MessageData::Empty);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_leading_whitespace_payload_roundtrips() {
        let msg = Message::new("/x", "info", "  two leading spaces".into()).unwrap();
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Text("  two leading spaces".into()));
        assert_eq!(decoded, msg);

        // Whitespace-only payloads are data too.
        let blank = Message::new("/x", "info", "   ".into()).unwrap();
        let decoded = Message::decode(&blank.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Text("   ".into()));
    }

    #[test]
    fn test_unknown_version_rejected_at_construction() {
        let result = Message::with_version("/x", "info", "hi".into(), "v1.00");
        assert!(result.is_err());
        let result = Message::with_version("/x", "info", "hi".into(), "v9.99");
        assert!(result.is_err());
    }
}
