//! Error types for avlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Validation, link, and transport failures
//! are all captured here so callers can match on them without string parsing.

use std::fmt::Write as _;

/// The error type for all avlink operations.
///
/// Every variant that originates from a command exchange carries enough
/// context (action id, request bytes, partial reply) to reproduce the
/// failure without re-running at a higher log level.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more template placeholders had no matching argument.
    ///
    /// Raised before anything is written to the link. `missing` lists every
    /// absent key in template order.
    #[error("action {action}: missing argument(s) {}", .missing.join(", "))]
    MissingArgument { action: String, missing: Vec<String> },

    /// The requested action id is not defined by the device model.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The encoded command contains characters the wire encoding cannot carry.
    #[error("cannot encode {text:?} as {encoding}")]
    Encoding { encoding: String, text: String },

    /// The link never became ready before the command's deadline.
    #[error("not connected")]
    NotConnected,

    /// The request was written but no framed line arrived before the deadline.
    #[error(
        "no response to {} {} (partial: {})",
        .action.as_deref().unwrap_or("raw command"),
        escape_bytes(.request),
        escape_bytes(.partial)
    )]
    ResponseTimeout {
        action: Option<String>,
        request: Vec<u8>,
        partial: Vec<u8>,
    },

    /// The transport failed with an I/O error; the session is unusable.
    #[error("link error: {0}")]
    Link(String),

    /// A framed line could not be associated with any known response pattern.
    #[error("action {action}: no response pattern matched {line:?}")]
    NoMatch { action: String, line: String },

    /// A device model or action definition failed validation at load time.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// A transport address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The session was closed before the request could be served.
    #[error("session closed")]
    Closed,

    /// A transport-level error (serial port, TCP socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A single transport read timed out.
    #[error("timeout waiting for data")]
    Timeout,

    /// The connection to the device was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Render bytes as a quoted string, escaping control and non-ASCII bytes.
///
/// ```
/// assert_eq!(avlink_core::error::escape_bytes(b"PWR3=1\r"), "\"PWR3=1\\r\"");
/// ```
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{:02X}", b);
            }
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_missing_argument_lists_every_key() {
        let e = Error::MissingArgument {
            action: "volume.set".into(),
            missing: vec!["zone".into(), "level".into()],
        };
        assert_eq!(
            e.to_string(),
            "action volume.set: missing argument(s) zone, level"
        );
    }

    #[test]
    fn error_display_response_timeout() {
        let e = Error::ResponseTimeout {
            action: Some("power.get".into()),
            request: b"PWR?\r".to_vec(),
            partial: b"PW".to_vec(),
        };
        assert_eq!(
            e.to_string(),
            "no response to power.get \"PWR?\\r\" (partial: \"PW\")"
        );
    }

    #[test]
    fn error_display_response_timeout_raw() {
        let e = Error::ResponseTimeout {
            action: None,
            request: vec![0x02, b'A'],
            partial: Vec::new(),
        };
        assert_eq!(
            e.to_string(),
            "no response to raw command \"\\x02A\" (partial: \"\")"
        );
    }

    #[test]
    fn error_display_no_match() {
        let e = Error::NoMatch {
            action: "power.get".into(),
            line: "ERR\r".into(),
        };
        assert_eq!(
            e.to_string(),
            "action power.get: no response pattern matched \"ERR\\r\""
        );
    }

    #[test]
    fn error_display_simple_variants() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
        assert_eq!(Error::Closed.to_string(), "session closed");
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for data");
        assert_eq!(Error::ConnectionLost.to_string(), "connection lost");
        assert_eq!(
            Error::Link("connection lost".into()).to_string(),
            "link error: connection lost"
        );
        assert_eq!(
            Error::UnknownAction("tone.set".into()).to_string(),
            "unknown action: tone.set"
        );
    }

    #[test]
    fn error_display_encoding() {
        let e = Error::Encoding {
            encoding: "ascii".into(),
            text: "VOL\u{e9}".into(),
        };
        assert_eq!(e.to_string(), "cannot encode \"VOL\u{e9}\" as ascii");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn escape_bytes_handles_controls() {
        assert_eq!(escape_bytes(b"A\r\n"), "\"A\\r\\n\"");
        assert_eq!(escape_bytes(&[0xFF]), "\"\\xFF\"");
        assert_eq!(escape_bytes(b""), "\"\"");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }
}
