//! Command encoding and line framing.
//!
//! Outbound, a [`Template`] such as `"VOL{zone}={level}\r"` is rendered
//! with named [`Args`] and encoded for the wire. Inbound, the byte stream is
//! cut into EOL-terminated lines by [`split_lines`], or incrementally by a
//! [`LineFramer`] that keeps partial lines between reads.
//!
//! Lines keep their EOL bytes. A line that is nothing but the EOL is blank
//! and is dropped.

use std::fmt::{self, Write as _};
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use avlink_core::error::{Error, Result};
use avlink_core::types::{ArgValue, Args, WireEncoding};

/// Default response line terminator.
pub const DEFAULT_EOL: &[u8] = b"\r\n";

/// Maximum bytes buffered without a complete line before the buffer is reset.
pub const MAX_BUF: usize = 8192;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field {
        name: String,
        width: usize,
        zero_pad: bool,
    },
}

/// A parsed command template.
///
/// Placeholders are `{name}` or `{name:width}` / `{name:0width}`; `{{` and
/// `}}` are literal braces. A name may appear more than once; it is listed
/// once in [`params`](Template::params).
///
/// ```
/// use avlink_core::Args;
/// use avlink_link::frame::Template;
///
/// let t = Template::parse("VOL{zone}={level:03}\r").unwrap();
/// assert_eq!(t.params(), ["zone", "level"]);
/// let text = t.render(&Args::new().with("zone", 2).with("level", 7)).unwrap();
/// assert_eq!(text, "VOL2=007\r");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    params: Vec<String>,
}

impl Template {
    /// Parse a template, rejecting malformed placeholders.
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidDefinition(format!("template {source:?}: {why}"));

        let mut segments = Vec::new();
        let mut params: Vec<String> = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched '}'")),
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(invalid("nested '{'")),
                            Some(ch) => body.push(ch),
                            None => return Err(invalid("unterminated placeholder")),
                        }
                    }
                    let (name, spec) = match body.split_once(':') {
                        Some((name, spec)) => (name, Some(spec)),
                        None => (body.as_str(), None),
                    };
                    if !is_identifier(name) {
                        return Err(invalid(&format!("placeholder {{{body}}} needs a name")));
                    }
                    let (width, zero_pad) = match spec {
                        None | Some("") => (0, false),
                        Some(spec) => {
                            let zero_pad = spec.starts_with('0') && spec.len() > 1;
                            let width = spec
                                .parse::<usize>()
                                .map_err(|_| invalid(&format!("unsupported format {spec:?}")))?;
                            (width, zero_pad)
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    if !params.iter().any(|p| p == name) {
                        params.push(name.to_string());
                    }
                    segments.push(Segment::Field {
                        name: name.to_string(),
                        width,
                        zero_pad,
                    });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Template {
            source: source.to_string(),
            segments,
            params,
        })
    }

    /// The template text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of first appearance, each listed once.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Every placeholder name with no value in `args`, in template order.
    pub fn missing(&self, args: &Args) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| !args.contains(p))
            .cloned()
            .collect()
    }

    /// Substitute `args` into the template.
    ///
    /// Fails with [`Error::MissingArgument`] naming every absent key; the
    /// error's `action` is the template source, which callers usually
    /// replace with an action id. Extra arguments are ignored.
    pub fn render(&self, args: &Args) -> Result<String> {
        let missing = self.missing(args);
        if !missing.is_empty() {
            return Err(Error::MissingArgument {
                action: self.source.clone(),
                missing,
            });
        }

        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field {
                    name,
                    width,
                    zero_pad,
                } => {
                    let Some(value) = args.get(name) else {
                        continue;
                    };
                    let _ = match (value, *zero_pad) {
                        (ArgValue::Int(n), true) => write!(out, "{:0width$}", n, width = *width),
                        (ArgValue::Int(n), false) => write!(out, "{:>width$}", n, width = *width),
                        (ArgValue::Text(s), _) => write!(out, "{:<width$}", s, width = *width),
                    };
                }
            }
        }
        Ok(out)
    }

    /// Render and encode for the wire.
    pub fn encode(&self, args: &Args, encoding: WireEncoding) -> Result<Vec<u8>> {
        encoding.encode(&self.render(args)?)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Line splitting
// ---------------------------------------------------------------------------

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Ranges of the complete, non-blank lines in `buf`, and the number of bytes
/// they (plus skipped and blank bytes) account for.
fn line_ranges(buf: &[u8], eol: &[u8], skip: usize) -> (Vec<Range<usize>>, usize) {
    let mut lines = Vec::new();
    if eol.is_empty() || buf.len() < skip {
        return (lines, 0);
    }

    let mut start = skip;
    let mut consumed = 0;
    while let Some(pos) = find(&buf[start..], eol) {
        let end = start + pos + eol.len();
        if pos > 0 {
            lines.push(start..end);
        }
        start = end;
        consumed = end;
    }
    (lines, consumed)
}

/// Split `buf` into complete lines terminated by `eol`.
///
/// The first `skip` bytes are ignored (devices that echo part of a command
/// before answering) and are not part of any line. Returns the lines in
/// order, each including its EOL, and the unconsumed remainder that starts
/// a line still to come. Blank lines are dropped. If fewer than `skip`
/// bytes are buffered, nothing is consumed.
///
/// ```
/// use avlink_link::frame::split_lines;
///
/// let (lines, rest) = split_lines(b"PWR1\r\n\r\nVOL4", b"\r\n", 0);
/// assert_eq!(lines, vec![&b"PWR1\r\n"[..]]);
/// assert_eq!(rest, b"VOL4");
/// ```
pub fn split_lines<'a>(buf: &'a [u8], eol: &[u8], skip: usize) -> (Vec<&'a [u8]>, &'a [u8]) {
    let (ranges, consumed) = line_ranges(buf, eol, skip);
    let lines = ranges.into_iter().map(|r| &buf[r]).collect();
    (lines, &buf[consumed..])
}

/// Incremental line framer over a byte stream.
///
/// Bytes are appended with [`push`](LineFramer::push); every line completed
/// by the new bytes is returned. Partial lines stay buffered until their EOL
/// arrives, however the stream was chunked.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    eol: Vec<u8>,
    skip: usize,
    max_len: usize,
}

impl LineFramer {
    /// A framer for `eol`; an empty `eol` falls back to [`DEFAULT_EOL`].
    pub fn new(eol: &[u8]) -> Self {
        let eol = if eol.is_empty() { DEFAULT_EOL } else { eol };
        LineFramer {
            buf: BytesMut::with_capacity(256),
            eol: eol.to_vec(),
            skip: 0,
            max_len: MAX_BUF,
        }
    }

    /// Cap on buffered bytes without a complete line.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn eol(&self) -> &[u8] {
        &self.eol
    }

    /// Ignore the next `skip` bytes before looking for the first line.
    pub fn set_skip(&mut self, skip: usize) {
        self.skip = skip;
    }

    /// Append bytes and return every line they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);

        let (ranges, consumed) = line_ranges(&self.buf, &self.eol, self.skip);
        let lines = if consumed > 0 {
            self.skip = 0;
            let frozen = self.buf.split_to(consumed).freeze();
            ranges.into_iter().map(|r| frozen.slice(r)).collect()
        } else {
            Vec::new()
        };

        if self.buf.len() > self.max_len {
            tracing::warn!(
                len = self.buf.len(),
                "line buffer overflow without EOL, resetting"
            );
            self.buf.clear();
            self.skip = 0;
        }
        lines
    }

    /// Bytes of the line currently being assembled.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any partial line and pending skip, returning the dropped bytes.
    pub fn clear(&mut self) -> Vec<u8> {
        self.skip = 0;
        self.buf.split().to_vec()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // -----------------------------------------------------------------------
    // Template parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_collects_params_in_order() {
        let t = Template::parse("VOL{zone}={level}\r").unwrap();
        assert_eq!(t.params(), ["zone", "level"]);
        assert_eq!(t.source(), "VOL{zone}={level}\r");
    }

    #[test]
    fn parse_lists_repeated_name_once() {
        let t = Template::parse("{zone}:{zone}").unwrap();
        assert_eq!(t.params(), ["zone"]);
        let text = t.render(&Args::new().with("zone", 4)).unwrap();
        assert_eq!(text, "4:4");
    }

    #[test]
    fn parse_literal_template_has_no_params() {
        let t = Template::parse("PWR?\r").unwrap();
        assert!(t.params().is_empty());
        assert_eq!(t.render(&Args::new()).unwrap(), "PWR?\r");
    }

    #[test]
    fn parse_escaped_braces() {
        let t = Template::parse("{{{name}}}").unwrap();
        assert_eq!(t.params(), ["name"]);
        assert_eq!(t.render(&Args::new().with("name", "x")).unwrap(), "{x}");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["{", "}", "{}", "{0}", "{a{b}}", "{zone:x}", "{zone!r}", "{1st}"] {
            let result = Template::parse(bad);
            assert!(
                matches!(result, Err(Error::InvalidDefinition(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Template rendering
    // -----------------------------------------------------------------------

    #[test]
    fn render_power_on() {
        let t = Template::parse("PWR{zone}=1\r").unwrap();
        let bytes = t
            .encode(&Args::new().with("zone", 3), WireEncoding::Ascii)
            .unwrap();
        assert_eq!(bytes, b"PWR3=1\r");
    }

    #[test]
    fn render_reports_every_missing_key() {
        let t = Template::parse("VOL{zone}={level}\r").unwrap();
        match t.render(&Args::new()) {
            Err(Error::MissingArgument { missing, .. }) => {
                assert_eq!(missing, vec!["zone".to_string(), "level".to_string()]);
            }
            other => panic!("expected MissingArgument, got {other:?}"),
        }
    }

    #[test]
    fn render_ignores_extra_args() {
        let t = Template::parse("MUTE{zone}\r").unwrap();
        let args = Args::new().with("zone", 1).with("unused", 9);
        assert_eq!(t.render(&args).unwrap(), "MUTE1\r");
    }

    #[test]
    fn render_width_specs() {
        let t = Template::parse("[{a:03}][{b:3}][{c:4}]").unwrap();
        let args = Args::new().with("a", 7).with("b", 7).with("c", "x");
        assert_eq!(t.render(&args).unwrap(), "[007][  7][x   ]");
    }

    #[test]
    fn render_negative_zero_padded() {
        let t = Template::parse("TRIM{db:03}").unwrap();
        assert_eq!(t.render(&Args::new().with("db", -5)).unwrap(), "TRIM-05");
    }

    #[test]
    fn encode_rejects_non_ascii_argument() {
        let t = Template::parse("NAME{text}\r").unwrap();
        let result = t.encode(&Args::new().with("text", "Caf\u{e9}"), WireEncoding::Ascii);
        assert!(matches!(result, Err(Error::Encoding { .. })));

        let latin1 = t
            .encode(&Args::new().with("text", "Caf\u{e9}"), WireEncoding::Latin1)
            .unwrap();
        assert_eq!(latin1, b"NAMECaf\xE9\r");
    }

    // -----------------------------------------------------------------------
    // split_lines
    // -----------------------------------------------------------------------

    #[test]
    fn split_returns_lines_and_remainder() {
        let (lines, rest) = split_lines(b"A\r\nB\r\nC", b"\r\n", 0);
        assert_eq!(lines, vec![&b"A\r\n"[..], &b"B\r\n"[..]]);
        assert_eq!(rest, b"C");
    }

    #[test]
    fn split_drops_blank_lines() {
        let (lines, rest) = split_lines(b"\r\nA\r\n\r\n\r\nB\r\n", b"\r\n", 0);
        assert_eq!(lines, vec![&b"A\r\n"[..], &b"B\r\n"[..]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn split_bare_cr_eol() {
        let (lines, rest) = split_lines(b"PWR3=1\rVOL", b"\r", 0);
        assert_eq!(lines, vec![&b"PWR3=1\r"[..]]);
        assert_eq!(rest, b"VOL");
    }

    #[test]
    fn split_incomplete_returns_everything_as_remainder() {
        let (lines, rest) = split_lines(b"PWR3=1", b"\r", 0);
        assert!(lines.is_empty());
        assert_eq!(rest, b"PWR3=1");
    }

    #[test]
    fn split_skip_ignores_echo() {
        // The echoed "PWR?\r" would otherwise frame as its own line.
        let (lines, rest) = split_lines(b"PWR?\rPWR1\r", b"\r", 5);
        assert_eq!(lines, vec![&b"PWR1\r"[..]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn split_skip_longer_than_buffer_consumes_nothing() {
        let (lines, rest) = split_lines(b"PW", b"\r", 5);
        assert!(lines.is_empty());
        assert_eq!(rest, b"PW");
    }

    #[test]
    fn split_eol_spanning_skip_boundary_is_not_matched() {
        // Skip ends between '\r' and '\n', so the first EOL is the second one.
        let (lines, _) = split_lines(b"AB\r\nCD\r\n", b"\r\n", 3);
        assert_eq!(lines, vec![&b"\nCD\r\n"[..]]);
    }

    #[test]
    fn split_empty_eol_frames_nothing() {
        let (lines, rest) = split_lines(b"abc", b"", 0);
        assert!(lines.is_empty());
        assert_eq!(rest, b"abc");
    }

    // -----------------------------------------------------------------------
    // LineFramer
    // -----------------------------------------------------------------------

    #[test]
    fn framer_joins_partial_reads() {
        let mut framer = LineFramer::new(b"\r");
        assert!(framer.push(b"PW").is_empty());
        assert_eq!(framer.pending(), b"PW");
        let lines = framer.push(b"R3=1\r");
        assert_eq!(lines, vec![Bytes::from_static(b"PWR3=1\r")]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn framer_eol_split_across_reads() {
        let mut framer = LineFramer::new(b"\r\n");
        assert!(framer.push(b"A\r").is_empty());
        assert_eq!(framer.push(b"\nB\r\n").len(), 2);
    }

    #[test]
    fn framer_skip_applies_to_first_line_only() {
        let mut framer = LineFramer::new(b"\r");
        framer.set_skip(4);
        assert!(framer.push(b"PWR").is_empty());
        let lines = framer.push(b"?PWR1\rPWR2\r");
        assert_eq!(
            lines,
            vec![Bytes::from_static(b"PWR1\r"), Bytes::from_static(b"PWR2\r")]
        );
        let lines = framer.push(b"ZZZZPWR3\r");
        assert_eq!(lines, vec![Bytes::from_static(b"ZZZZPWR3\r")]);
    }

    #[test]
    fn framer_clear_returns_partial() {
        let mut framer = LineFramer::new(b"\r");
        framer.set_skip(2);
        framer.push(b"abc");
        assert_eq!(framer.clear(), b"abc");
        assert!(framer.pending().is_empty());
        assert_eq!(framer.push(b"x\r"), vec![Bytes::from_static(b"x\r")]);
    }

    #[test]
    fn framer_overflow_resets() {
        let mut framer = LineFramer::new(b"\r").with_max_len(8);
        assert!(framer.push(b"0123456789").is_empty());
        assert!(framer.pending().is_empty());
        assert_eq!(framer.push(b"ok\r"), vec![Bytes::from_static(b"ok\r")]);
    }

    #[test]
    fn framer_empty_eol_uses_default() {
        let framer = LineFramer::new(b"");
        assert_eq!(framer.eol(), DEFAULT_EOL);
    }

    /// Whatever the read boundaries, the same lines come out.
    #[test]
    fn framer_round_trip_across_any_chunking() {
        let lines: Vec<&[u8]> = vec![b"PWR3=1", b"VOL2=-30", b"SRC1=HDMI 2", b"X"];
        for eol in [&b"\r"[..], &b"\r\n"[..], &b"\n"[..]] {
            let mut stream = Vec::new();
            for line in &lines {
                stream.extend_from_slice(line);
                stream.extend_from_slice(eol);
            }
            let expected: Vec<Vec<u8>> = lines
                .iter()
                .map(|l| [*l, eol].concat())
                .collect();

            // Uniform chunk sizes, then an irregular cycling pattern.
            let mut patterns: Vec<Vec<usize>> = (1..=stream.len()).map(|n| vec![n]).collect();
            patterns.push(vec![1, 3, 2, 7, 1, 1, 5]);
            patterns.push(vec![2, 1]);

            for pattern in patterns {
                let mut framer = LineFramer::new(eol);
                let mut got: Vec<Vec<u8>> = Vec::new();
                let mut offset = 0;
                let mut sizes = pattern.iter().cycle();
                while offset < stream.len() {
                    let size = (*sizes.next().unwrap()).min(stream.len() - offset);
                    for line in framer.push(&stream[offset..offset + size]) {
                        got.push(line.to_vec());
                    }
                    offset += size;
                }
                assert_eq!(got, expected, "eol {eol:?}, chunks {pattern:?}");
                assert!(framer.pending().is_empty());
            }
        }
    }
}
