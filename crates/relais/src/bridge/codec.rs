//! Newline-delimited JSON codec for host communication.
//!
//! Each frame is one compact JSON document followed by `\n`. Works over any
//! AsyncRead/AsyncWrite (child pipes, sockets, in-memory duplex streams).
//!
//! Decoding yields `Result<T, MalformedLine>` items: a line that is not a valid
//! message is reported to the caller without ending the stream, so the host can
//! skip it and the client can treat it as a crash. Only framing violations
//! (oversized lines, read errors) surface as `io::Error`.

use std::fmt;
use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single line, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const PREVIEW_CHARS: usize = 120;

/// A line that could not be decoded as a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed line ({reason}): {preview}")]
pub struct MalformedLine {
    /// Lossy, truncated copy of the offending bytes for diagnostics.
    pub preview: String,
    pub reason: String,
}

impl MalformedLine {
    fn new(raw: &[u8], reason: impl fmt::Display) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        Self {
            preview,
            reason: reason.to_string(),
        }
    }

    fn unterminated(raw: &[u8]) -> Self {
        Self::new(raw, "unterminated line at end of stream")
    }
}

/// Codec that frames messages with `\n` and serializes with JSON.
pub struct JsonLinesCodec<T> {
    max_line_bytes: usize,
    /// Bytes of the buffer already scanned for a newline.
    scanned: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            scanned: 0,
            _phantom: PhantomData,
        }
    }

    fn too_long(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", self.max_line_bytes),
        )
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    fn parse(line: &[u8]) -> Result<T, MalformedLine> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        serde_json::from_slice(line).map_err(|e| MalformedLine::new(line, e))
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, MalformedLine>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let unscanned = src.get(self.scanned..).unwrap_or_default();
        match unscanned.iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline_at = self.scanned + offset;
                self.scanned = 0;
                if newline_at > self.max_line_bytes {
                    return Err(self.too_long());
                }
                let frame = src.split_to(newline_at + 1);
                let line = frame.strip_suffix(b"\n").unwrap_or(&frame);
                Ok(Some(Self::parse(line)))
            }
            None => {
                if src.len() > self.max_line_bytes {
                    return Err(self.too_long());
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // A writer that died mid-line leaves a fragment behind. Even if the
        // fragment happens to parse, it was never committed with a newline.
        let fragment = src.split_to(src.len());
        Ok(Some(Err(MalformedLine::unterminated(&fragment))))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Compact JSON escapes control characters, so the payload never
        // contains a raw newline.
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_line_bytes {
            return Err(self.too_long());
        }
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
