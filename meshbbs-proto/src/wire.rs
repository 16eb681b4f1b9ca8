//! Root framing: `<proto_name>|<version>|<type>|<payload>`.
//!
//! `proto_name` is always `advBBS`, `version` is always `1`. A stale
//! `FQ51|...` prefix from a prior protocol generation is a migration
//! artifact and is rejected at parse time rather than dispatched to any
//! compatibility path — there is no polyglot adapter here.

use crate::error::{ProtoError, Result};

pub const PROTO_NAME: &str = "advBBS";
pub const PROTO_VERSION: u8 = 1;
const LEGACY_PREFIX: &str = "FQ51";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: String,
    pub payload: String,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload: payload.into(),
        }
    }

    /// Render the frame for transmission.
    pub fn encode(&self) -> String {
        format!("{}|{}|{}|{}", PROTO_NAME, PROTO_VERSION, self.frame_type, self.payload)
    }

    /// Parse a received frame, validating the root envelope.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.starts_with(LEGACY_PREFIX) {
            return Err(ProtoError::UnsupportedVersion);
        }
        let mut parts = raw.splitn(4, '|');
        let proto = parts.next().ok_or(ProtoError::MalformedFrame)?;
        let version = parts.next().ok_or(ProtoError::MalformedFrame)?;
        let frame_type = parts.next().ok_or(ProtoError::MalformedFrame)?;
        let payload = parts.next().unwrap_or("");

        if proto != PROTO_NAME {
            return Err(ProtoError::MalformedFrame);
        }
        if version != PROTO_VERSION.to_string() {
            return Err(ProtoError::UnsupportedVersion);
        }
        Ok(Self {
            frame_type: frame_type.to_string(),
            payload: payload.to_string(),
        })
    }

    /// Split the pipe-delimited payload into its positional fields.
    pub fn fields(&self) -> Vec<&str> {
        self.payload.split('|').collect()
    }
}

/// Pipe characters in user content are never sent over the wire; this
/// substitutes them with a visually similar broken-bar before the content
/// is embedded in a frame.
pub fn escape_user_content(s: &str) -> String {
    s.replace('|', "\u{A6}")
}

pub fn unescape_user_content(s: &str) -> String {
    s.replace('\u{A6}', "|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_parses_roundtrip() {
        let frame = Frame::new("RAP_PING", "12345");
        let encoded = frame.encode();
        assert_eq!(encoded, "advBBS|1|RAP_PING|12345");
        let parsed = Frame::parse(&encoded).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn rejects_legacy_prefix() {
        assert_eq!(Frame::parse("FQ51|1|PING|x"), Err(ProtoError::UnsupportedVersion));
    }

    #[test]
    fn rejects_wrong_proto_name() {
        assert_eq!(Frame::parse("other|1|PING|x"), Err(ProtoError::MalformedFrame));
    }

    #[test]
    fn escapes_pipes_in_user_content() {
        let escaped = escape_user_content("hello|world");
        assert!(!escaped.contains('|'));
        assert_eq!(unescape_user_content(&escaped), "hello|world");
    }
}
