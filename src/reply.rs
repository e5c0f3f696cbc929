//! FTP reply parsing (RFC 959 section 4.2)

use crate::error::{FtpError, Result};
use std::fmt;

/// The class of an FTP reply, derived from the first digit of its code.
///
/// RFC 959 warns that only the first digit is reliably meaningful across
/// servers; the other two digits and the message text are for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegativeCompletion,
    PermanentNegativeCompletion,
    /// Protocol-level reply that does not fit the 1xx-5xx scheme (reserved
    /// for callers that synthesize replies, e.g. the post-disconnect QUIT
    /// reply).
    Protected,
}

impl ReplyKind {
    fn from_first_digit(digit: u8) -> Self {
        match digit {
            b'1' => ReplyKind::PositivePreliminary,
            b'2' => ReplyKind::PositiveCompletion,
            b'3' => ReplyKind::PositiveIntermediate,
            b'4' => ReplyKind::TransientNegativeCompletion,
            b'5' => ReplyKind::PermanentNegativeCompletion,
            _ => ReplyKind::Protected,
        }
    }
}

/// A single parsed FTP reply.
///
/// `code` is kept as its literal three ASCII digits rather than a parsed
/// integer, since nothing in the protocol needs arithmetic on it and
/// round-tripping the exact digits avoids a lossy u16 conversion for the
/// rare non-standard code a server might send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: [u8; 3],
    pub message: String,
    pub info_messages: String,
    pub kind: ReplyKind,
}

impl Reply {
    /// Build a reply from an already-validated 3-digit ASCII code.
    pub fn new(code: [u8; 3], message: impl Into<String>) -> Self {
        let kind = ReplyKind::from_first_digit(code[0]);
        Self {
            code,
            message: message.into(),
            info_messages: String::new(),
            kind,
        }
    }

    /// Synthesize a reply with no corresponding wire traffic, e.g. the
    /// "connection already closed" reply to a QUIT issued while
    /// disconnected.
    pub fn synthetic(code: [u8; 3], message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// The reply code as a `&str`, e.g. `"230"`.
    pub fn code_str(&self) -> &str {
        // `code` is guaranteed ASCII-digit by construction.
        std::str::from_utf8(&self.code).unwrap_or("???")
    }

    /// True for 1xx, 2xx, and 3xx replies.
    pub fn is_success(&self) -> bool {
        matches!(
            self.kind,
            ReplyKind::PositivePreliminary
                | ReplyKind::PositiveCompletion
                | ReplyKind::PositiveIntermediate
        )
    }

    /// True for 3xx replies (more input expected before the command
    /// completes, e.g. after `USER`).
    pub fn is_intermediate(&self) -> bool {
        self.kind == ReplyKind::PositiveIntermediate
    }

    /// True for 4xx or 5xx replies.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            ReplyKind::TransientNegativeCompletion | ReplyKind::PermanentNegativeCompletion
        )
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code_str(), self.message)
    }
}

fn parse_code(line: &str) -> Option<[u8; 3]> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 {
        return None;
    }
    if !bytes[0].is_ascii_digit() || !bytes[1].is_ascii_digit() || !bytes[2].is_ascii_digit() {
        return None;
    }
    Some([bytes[0], bytes[1], bytes[2]])
}

/// Reads reply lines off a line source and assembles a single [`Reply`],
/// honoring the RFC 959 multi-line continuation rule: a line of the form
/// `DDD-text` opens a multi-line reply that is closed by a later line
/// `DDD text` with the same code; any other line in between is appended
/// verbatim to `info_messages`.
pub struct ReplyParser;

impl ReplyParser {
    /// Parse one reply from `next_line`, an async line source. `next_line`
    /// returns `Ok(None)` on EOF.
    pub async fn parse<F, Fut>(mut next_line: F) -> Result<Reply>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<String>>>,
    {
        let first = next_line()
            .await?
            .ok_or(FtpError::UnexpectedDisconnect)?;

        let code = parse_code(&first)
            .ok_or_else(|| FtpError::ProtocolError(format!("malformed reply line: {first}")))?;
        let bytes = first.as_bytes();

        if bytes.len() > 3 && bytes[3] == b'-' {
            let mut info_messages = Vec::new();
            loop {
                let line = next_line()
                    .await?
                    .ok_or(FtpError::UnexpectedDisconnect)?;
                if line.as_bytes().len() > 3
                    && &line.as_bytes()[0..3] == &code[..]
                    && line.as_bytes()[3] == b' '
                {
                    let message = line[4..].to_string();
                    let mut reply = Reply::new(code, message);
                    reply.info_messages = info_messages.join("\n");
                    return Ok(reply);
                }
                info_messages.push(line);
            }
        }

        let message = if bytes.len() > 3 && bytes[3] == b' ' {
            first[4..].to_string()
        } else if bytes.len() > 3 {
            first[3..].to_string()
        } else {
            String::new()
        };
        Ok(Reply::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_lines(lines: Vec<&str>) -> Result<Reply> {
        let mut iter = lines.into_iter();
        ReplyParser::parse(move || {
            let next = iter.next().map(|s| s.to_string());
            async move { Ok(next) }
        })
        .await
    }

    #[tokio::test]
    async fn single_line_reply() {
        let reply = parse_lines(vec!["230 Logged in."]).await.unwrap();
        assert_eq!(reply.code_str(), "230");
        assert_eq!(reply.message, "Logged in.");
        assert!(reply.info_messages.is_empty());
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn multiline_reply_collects_info_messages() {
        let reply = parse_lines(vec!["211-Features:", " UTF8", " SIZE", "211 End"])
            .await
            .unwrap();
        assert_eq!(reply.code_str(), "211");
        assert_eq!(reply.message, "End");
        assert_eq!(reply.info_messages, " UTF8\n SIZE");
    }

    #[tokio::test]
    async fn eof_mid_reply_is_unexpected_disconnect() {
        let err = parse_lines(vec!["211-Features:", " UTF8"]).await.unwrap_err();
        assert!(matches!(err, FtpError::UnexpectedDisconnect));
    }

    #[tokio::test]
    async fn eof_before_any_line_is_unexpected_disconnect() {
        let err = parse_lines(vec![]).await.unwrap_err();
        assert!(matches!(err, FtpError::UnexpectedDisconnect));
    }

    #[tokio::test]
    async fn malformed_code_is_protocol_error() {
        let err = parse_lines(vec!["abc not a code"]).await.unwrap_err();
        assert!(matches!(err, FtpError::ProtocolError(_)));
    }

    #[test]
    fn classification_by_first_digit() {
        assert!(Reply::new(*b"230", "ok").is_success());
        assert!(Reply::new(*b"331", "pw").is_success());
        assert!(Reply::new(*b"331", "pw").is_intermediate());
        assert!(!Reply::new(*b"230", "ok").is_intermediate());
        assert!(Reply::new(*b"550", "no such file").is_error());
        assert!(Reply::new(*b"421", "service unavailable").is_error());
    }

    #[test]
    fn synthetic_quit_reply() {
        let reply = Reply::synthetic(*b"200", "Connection already closed.");
        assert_eq!(reply.code_str(), "200");
        assert!(reply.is_success());
    }

    #[test]
    fn display_matches_wire_format_prefix() {
        let reply = Reply::new(*b"550", "No such file.");
        assert_eq!(reply.to_string(), "550 No such file.");
    }
}
