// SerialCollect - core/framer.rs
//
// Turns raw bytes from the line source into trimmed, non-empty text lines.
// Core layer: no I/O, fed by whatever reader thread owns the device.
//
// Bytes are decoded first (multi-byte UTF-8 sequences split across reads are
// carried over to the next chunk), then appended to a partial-line buffer
// that is cut at every delimiter. The text after the last delimiter is an
// in-progress line and is kept for the next chunk.

use crate::util::constants;
use crate::util::error::SourceError;

/// Text encodings the framer can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Ascii,
    Latin1,
}

impl TextEncoding {
    /// Resolve an encoding name from configuration (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, SourceError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            _ => Err(SourceError::UnsupportedEncoding {
                encoding: name.to_string(),
            }),
        }
    }

    /// Encode outbound text. Characters outside the encoding's range are
    /// masked (ascii) or replaced with `?` (latin1).
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Ascii => text.chars().map(|c| (c as u32 & 0x7f) as u8).collect(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

/// Delimiter-based line framer with bounded buffering.
#[derive(Debug)]
pub struct LineFramer {
    delimiter: String,
    encoding: TextEncoding,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending_bytes: Vec<u8>,
    /// Decoded text after the last delimiter.
    partial: String,
    max_partial_bytes: usize,
}

impl LineFramer {
    /// An empty delimiter falls back to `\n`.
    pub fn new(delimiter: &str, encoding: TextEncoding) -> Self {
        let delimiter = if delimiter.is_empty() {
            constants::DEFAULT_LINE_DELIMITER.to_string()
        } else {
            delimiter.to_string()
        };
        Self {
            delimiter,
            encoding,
            pending_bytes: Vec::new(),
            partial: String::new(),
            max_partial_bytes: constants::MAX_PARTIAL_LINE_BYTES,
        }
    }

    pub fn with_max_partial_bytes(mut self, max: usize) -> Self {
        self.max_partial_bytes = max.max(1);
        self
    }

    /// Feed raw bytes; returns every line completed by this chunk.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = match self.encoding {
            TextEncoding::Utf8 => self.decode_utf8(bytes),
            TextEncoding::Ascii => bytes.iter().map(|b| (b & 0x7f) as char).collect(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        self.push_str(&text)
    }

    /// Feed already-decoded text; returns every line completed by it.
    pub fn push_str(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find(&self.delimiter) {
            let line = self.partial[..pos].trim().to_string();
            self.partial.drain(..pos + self.delimiter.len());
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.partial.len() > self.max_partial_bytes {
            tracing::warn!(
                bytes = self.partial.len(),
                max = self.max_partial_bytes,
                "No delimiter within the partial-line limit; discarding buffered text"
            );
            self.partial.clear();
        }

        lines
    }

    /// Return the buffered in-progress line, if any, and reset.
    /// Called when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        if !self.pending_bytes.is_empty() {
            self.partial.push('\u{FFFD}');
            self.pending_bytes.clear();
        }
        let line = std::mem::take(&mut self.partial).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    /// Discard all buffered state.
    pub fn reset(&mut self) {
        self.pending_bytes.clear();
        self.partial.clear();
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending_bytes);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(n) => {
                            out.push('\u{FFFD}');
                            rest = &after[n..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            self.pending_bytes = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_and_keeps_partial_line() {
        let mut framer = LineFramer::new("\n", TextEncoding::Utf8);
        assert_eq!(framer.push_str("1,2,3\n4,5"), vec!["1,2,3"]);
        assert_eq!(framer.push_str(",6\n"), vec!["4,5,6"]);
        assert!(framer.flush().is_none());
    }

    #[test]
    fn test_trims_crlf_and_drops_empty_lines() {
        let mut framer = LineFramer::new("\n", TextEncoding::Utf8);
        let lines = framer.push_bytes(b"  a \r\n\r\n\nb\r\n");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn test_multi_char_delimiter() {
        let mut framer = LineFramer::new("||", TextEncoding::Utf8);
        assert_eq!(framer.push_str("x|"), Vec::<String>::new());
        assert_eq!(framer.push_str("|y||z"), vec!["x", "y"]);
        assert_eq!(framer.flush().as_deref(), Some("z"));
    }

    #[test]
    fn test_utf8_sequence_split_across_reads() {
        let mut framer = LineFramer::new("\n", TextEncoding::Utf8);
        let bytes = "temp=21°C\n".as_bytes();
        // Split inside the two-byte encoding of the degree sign.
        let cut = bytes.iter().position(|&b| b == 0xC2).unwrap() + 1;
        assert!(framer.push_bytes(&bytes[..cut]).is_empty());
        assert_eq!(framer.push_bytes(&bytes[cut..]), vec!["temp=21°C"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new("\n", TextEncoding::Utf8);
        let lines = framer.push_bytes(b"a\xFFb\n");
        assert_eq!(lines, vec!["a\u{FFFD}b"]);
    }

    #[test]
    fn test_latin1_and_ascii_decoding() {
        let mut latin = LineFramer::new("\n", TextEncoding::Latin1);
        assert_eq!(latin.push_bytes(b"caf\xE9\n"), vec!["café"]);

        let mut ascii = LineFramer::new("\n", TextEncoding::Ascii);
        assert_eq!(ascii.push_bytes(b"\xC1BC\n"), vec!["ABC"]);
    }

    #[test]
    fn test_partial_buffer_is_bounded() {
        let mut framer = LineFramer::new("\n", TextEncoding::Utf8).with_max_partial_bytes(8);
        assert!(framer.push_str("0123456789").is_empty());
        // The oversized fragment was discarded; the next line is clean.
        assert_eq!(framer.push_str("ok\n"), vec!["ok"]);
    }

    #[test]
    fn test_encode_outbound_text() {
        assert_eq!(TextEncoding::Utf8.encode("é\n"), "é\n".as_bytes());
        assert_eq!(TextEncoding::Latin1.encode("é€"), vec![0xE9, b'?']);
        assert_eq!(TextEncoding::Ascii.encode("AT"), b"AT".to_vec());
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(TextEncoding::from_name("UTF-8").unwrap(), TextEncoding::Utf8);
        assert_eq!(TextEncoding::from_name("iso-8859-1").unwrap(), TextEncoding::Latin1);
        assert!(TextEncoding::from_name("utf-16").is_err());
    }
}
