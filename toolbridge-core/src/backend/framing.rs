//! Newline-delimited JSON framing for stream backends.
//!
//! Pure functions only. The stream pump feeds raw chunks into a
//! [`LineBuffer`] and decodes each complete line with [`decode_line`].

use serde_json::Value;

use crate::error::FramingError;
use crate::jsonrpc::{format_message, parse_message};

/// Maximum length of one inbound line (16 MiB).
///
/// Checked before JSON parsing so a runaway backend cannot make the
/// gateway build an arbitrarily large value tree.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
///
/// Chunks may split a line (or a multi-byte character) anywhere; bytes are
/// held until the terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Set while discarding the remainder of an oversized line.
    skipping: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// terminator (a trailing `\r` is also removed).
    ///
    /// Lines that are not valid UTF-8 are decoded lossily. A line that grows
    /// beyond [`MAX_LINE_BYTES`] is dropped with a warning.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.skipping {
                self.skipping = false;
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(head);
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            lines.push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
        }

        if !self.skipping {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    max_bytes = MAX_LINE_BYTES,
                    "inbound line exceeds maximum size, discarding"
                );
                self.buf.clear();
                self.skipping = true;
            }
        }

        lines
    }

    /// Bytes held for an unterminated line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Decode one line into an envelope object.
///
/// # Errors
///
/// [`FramingError::MessageTooLarge`] before parsing, then whatever
/// [`parse_message`] reports.
pub fn decode_line(line: &str) -> Result<Value, FramingError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(FramingError::MessageTooLarge {
            max_bytes: MAX_LINE_BYTES,
        });
    }
    parse_message(line)
}

/// Encode an envelope as one newline-terminated line.
pub fn encode_line(value: &Value) -> Vec<u8> {
    let mut line = format_message(value).into_bytes();
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.pending_len(), 5);
        assert_eq!(buf.push(b"1}\n{\"b\":2}\n{\"c\""), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.push(b":3}\r\n"), vec!["{\"c\":3}"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_multibyte_char_split() {
        let text = "{\"t\":\"é\"}\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut buf = LineBuffer::new();
        assert!(buf.push(&text[..split]).is_empty());
        assert_eq!(buf.push(&text[split..]), vec!["{\"t\":\"é\"}"]);
    }

    #[test]
    fn test_decode_line() {
        let value = decode_line("  {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}  ").unwrap();
        assert_eq!(value["id"], 1);
        assert!(matches!(
            decode_line("not json"),
            Err(FramingError::MalformedJson { .. })
        ));
        assert!(matches!(decode_line("[1]"), Err(FramingError::UnsupportedBatch)));
        assert!(matches!(decode_line(""), Err(FramingError::MalformedJson { .. })));
    }

    #[test]
    fn test_encode_line_is_single_line() {
        let line = encode_line(&json!({"jsonrpc": "2.0", "method": "m", "params": {"s": "a\nb"}}));
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    proptest! {
        #[test]
        fn prop_chunking_preserves_lines(
            lines in proptest::collection::vec("[a-zA-Z0-9 {}:\"é]{0,40}", 0..20),
            cuts in proptest::collection::vec(0usize..1000, 0..30),
        ) {
            let stream: Vec<u8> = lines.iter().flat_map(|l| format!("{l}\n").into_bytes()).collect();
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut buf = LineBuffer::new();
            let mut out = Vec::new();
            for w in points.windows(2) {
                out.extend(buf.push(&stream[w[0]..w[1]]));
            }
            prop_assert_eq!(out, lines);
            prop_assert_eq!(buf.pending_len(), 0);
        }
    }
}
