//! Core types shared across avlink crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single argument value substituted into a command template.
///
/// No coercion happens beyond stringification: `Int(3)` renders as `3`,
/// `Text("on")` renders as `on`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Int(n) => write!(f, "{n}"),
            ArgValue::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! arg_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(value: $t) -> Self {
                ArgValue::Int(i64::from(value))
            }
        })*
    };
}

arg_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

/// Named arguments for an action.
///
/// ```
/// use avlink_core::Args;
///
/// let args = Args::new().with("zone", 3).with("level", 40);
/// assert_eq!(args.get("zone").map(|v| v.to_string()), Some("3".to_string()));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(BTreeMap<String, ArgValue>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ArgValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for Args {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Args(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        f.write_str("}")
    }
}

/// Character encoding used on the wire.
///
/// Most serial A/V protocols are 7-bit ASCII. Decoding never fails: bytes
/// that are not valid in the encoding are dropped (ASCII) or replaced
/// (UTF-8) so a noisy line cannot wedge the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireEncoding {
    #[default]
    #[serde(alias = "us-ascii")]
    Ascii,
    #[serde(alias = "latin-1", alias = "iso-8859-1")]
    Latin1,
    #[serde(alias = "utf-8")]
    Utf8,
}

impl WireEncoding {
    /// Encode `text`, failing if any character is outside the encoding.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        let unencodable = || Error::Encoding {
            encoding: self.to_string(),
            text: text.to_string(),
        };
        match self {
            WireEncoding::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(unencodable())
                }
            }
            WireEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| unencodable()))
                .collect(),
            WireEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }

    /// Decode bytes received from the device.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            WireEncoding::Ascii => bytes
                .iter()
                .filter(|b| b.is_ascii())
                .map(|&b| b as char)
                .collect(),
            WireEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            WireEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WireEncoding::Ascii => "ascii",
            WireEncoding::Latin1 => "latin1",
            WireEncoding::Utf8 => "utf8",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// No transport is open.
    Disconnected,
    /// The transport is being opened.
    Connecting,
    /// Open and ready for the next command.
    Idle,
    /// A command is being written.
    Sending,
    /// A command was written and its reply is pending.
    AwaitingResponse,
    /// The session was closed; terminal.
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Idle => "idle",
            LinkState::Sending => "sending",
            LinkState::AwaitingResponse => "awaiting-response",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Fields extracted from a line by a named response pattern.
///
/// Values are the raw captured strings; converting them to integers or
/// booleans is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseMatch {
    /// Fully-qualified id (`group.name`) of the action whose pattern matched.
    pub action_id: String,
    /// Capture-group name to captured text.
    pub fields: BTreeMap<String, String>,
}

/// One framed line read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// Decoded text, including the trailing EOL.
    pub text: String,
    /// `true` if this line completed a pending command.
    pub solicited: bool,
    /// The response pattern that recognized this line, if any.
    pub matched: Option<ResponseMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_value_display() {
        assert_eq!(ArgValue::from(3).to_string(), "3");
        assert_eq!(ArgValue::from(-12i64).to_string(), "-12");
        assert_eq!(ArgValue::from("on").to_string(), "on");
    }

    #[test]
    fn args_builder_and_lookup() {
        let args = Args::new().with("zone", 3u8).with("input", "HDMI1");
        assert!(args.contains("zone"));
        assert!(!args.contains("level"));
        assert_eq!(args.get("input"), Some(&ArgValue::Text("HDMI1".into())));
        assert_eq!(args.to_string(), "{input: HDMI1, zone: 3}");
    }

    #[test]
    fn args_from_iterator() {
        let args: Args = [("zone", 1), ("level", 20)].into_iter().collect();
        assert_eq!(args.iter().count(), 2);
        assert_eq!(args.get("level"), Some(&ArgValue::Int(20)));
    }

    #[test]
    fn ascii_encode_rejects_non_ascii() {
        assert_eq!(WireEncoding::Ascii.encode("PWR1\r").unwrap(), b"PWR1\r");
        let err = WireEncoding::Ascii.encode("VOL\u{e9}").unwrap_err();
        assert!(matches!(err, Error::Encoding { .. }));
    }

    #[test]
    fn latin1_encode_maps_code_points() {
        assert_eq!(WireEncoding::Latin1.encode("\u{e9}").unwrap(), vec![0xE9]);
        assert!(WireEncoding::Latin1.encode("\u{20ac}").is_err());
    }

    #[test]
    fn ascii_decode_drops_invalid_bytes() {
        assert_eq!(WireEncoding::Ascii.decode(b"PW\xFFR1\r"), "PWR1\r");
    }

    #[test]
    fn utf8_decode_is_lossy() {
        assert_eq!(WireEncoding::Utf8.decode(b"A\xFF"), "A\u{fffd}");
    }

    #[test]
    fn link_state_display() {
        assert_eq!(LinkState::AwaitingResponse.to_string(), "awaiting-response");
        assert_eq!(LinkState::Idle.to_string(), "idle");
    }
}
