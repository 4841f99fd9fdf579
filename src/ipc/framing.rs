//! Message framing over the raw TCP byte stream.
//!
//! Two wire formats are supported:
//!
//! - [`Framing::ContentLength`]: HTTP-style headers, the same scheme the
//!   Language Server Protocol uses. Header parsing is case-insensitive and
//!   handles both CRLF and LF line endings.
//!
//!   ```text
//!   Content-Length: <length>\r\n
//!   \r\n
//!   <message-body>
//!   ```
//!
//! - [`Framing::Json`] (default): bare JSON documents written back to back
//!   with no delimiter. This is what the CAD-side plugin speaks. Boundaries
//!   are found with an incremental bracket scan that remembers its position
//!   between reads, so each byte is scanned once, several documents in one
//!   read are all delivered, and a trailing partial document waits for more
//!   bytes. Only a completed document is handed to the JSON parser.
//!   Top-level scalars fall back to re-parsing the buffer on every read.
//!
//! Inbound bytes go through a [`FrameDecoder`], which owns the receive
//! buffer. Outbound messages are written with [`write_message`].

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Upper bound for a Content-Length header block.
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Wire framing used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Unframed JSON documents, back to back.
    #[default]
    Json,
    /// `Content-Length` header framing. The peer must be built for it.
    ContentLength,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Json => f.write_str("json"),
            Framing::ContentLength => f.write_str("content-length"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "raw" => Ok(Framing::Json),
            "content-length" | "contentlength" | "lsp" => Ok(Framing::ContentLength),
            other => Err(format!(
                "unknown framing '{}' (expected 'json' or 'content-length')",
                other
            )),
        }
    }
}

/// Encode a message body for the wire.
pub fn encode_message(framing: Framing, body: &str) -> Vec<u8> {
    match framing {
        Framing::Json => body.as_bytes().to_vec(),
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            let mut out = Vec::with_capacity(header.len() + body.len());
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(body.as_bytes());
            out
        }
    }
}

/// Write one framed message and flush.
///
/// The frame is written with a single `write_all` so concurrent writers
/// serialised by a mutex never interleave partial frames.
pub async fn write_message<W>(writer: &mut W, framing: Framing, body: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(framing, body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Incremental decoder that owns the receive buffer.
///
/// Feed raw chunks with [`extend`](Self::extend), then call
/// [`next_message`](Self::next_message) until it returns `Ok(None)`.
/// Each received byte is examined a constant number of times, so decoding
/// cost is linear in the message size however it is chunked.
///
/// # Errors
///
/// A decode error means the offending bytes were dropped. The decoder stays
/// usable; callers log the error and keep pulling.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    /// Body length of a frame whose header was already consumed.
    body_len: Option<usize>,
    /// Progress through a partial bare-JSON document.
    scan: JsonScan,
}

/// Bracket-depth scanner state for bare-JSON documents.
///
/// Tracks string and escape state so brackets inside strings are ignored.
#[derive(Debug, Default)]
struct JsonScan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonScan {
    /// Advance over `buf` from the last position; returns the end offset of
    /// the top-level document once its closing bracket is seen.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.pos < buf.len() {
            let byte = buf[self.pos];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            body_len: None,
            scan: JsonScan::default(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Append a received chunk to the buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet resolved into a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.body_len = None;
        self.scan = JsonScan::default();
    }

    /// Extract the next complete message, if the buffer holds one.
    pub fn next_message(&mut self) -> Result<Option<Value>> {
        match self.framing {
            Framing::Json => self.next_json(),
            Framing::ContentLength => self.next_content_length(),
        }
    }

    fn next_json(&mut self) -> Result<Option<Value>> {
        let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
            // Nothing but whitespace
            self.clear();
            return Ok(None);
        };
        if start > 0 {
            self.buffer.drain(..start);
            self.scan.pos = self.scan.pos.saturating_sub(start);
        }

        // Scalars at top level are rare; let serde find their end
        if !matches!(self.buffer[0], b'{' | b'[') {
            return self.next_json_scalar();
        }

        let Some(end) = self.scan.advance(&self.buffer) else {
            if self.buffer.len() > MAX_MESSAGE_SIZE {
                let size = self.buffer.len();
                self.clear();
                return Err(anyhow!(
                    "Buffered message size {} exceeds maximum {} bytes",
                    size,
                    MAX_MESSAGE_SIZE
                ));
            }
            // Partial document, wait for more bytes
            return Ok(None);
        };

        self.scan = JsonScan::default();
        match serde_json::from_slice(&self.buffer[..end]) {
            Ok(value) => {
                self.buffer.drain(..end);
                Ok(Some(value))
            }
            Err(e) => {
                let dropped = self.buffer.len();
                self.clear();
                Err(anyhow!(e).context(format!("Malformed message, dropped {} bytes", dropped)))
            }
        }
    }

    fn next_json_scalar(&mut self) -> Result<Option<Value>> {
        let (next, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => {
                self.clear();
                Ok(None)
            }
            Some(Ok(value)) => {
                self.buffer.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                let dropped = self.buffer.len();
                self.clear();
                Err(anyhow!(e).context(format!("Malformed message, dropped {} bytes", dropped)))
            }
        }
    }

    fn next_content_length(&mut self) -> Result<Option<Value>> {
        let size = match self.body_len {
            Some(size) => size,
            None => match self.take_header()? {
                Some(size) => size,
                None => return Ok(None),
            },
        };

        if self.buffer.len() < size {
            return Ok(None);
        }

        self.body_len = None;
        let body: Vec<u8> = self.buffer.drain(..size).collect();
        let text = std::str::from_utf8(&body).context("Message body is not valid UTF-8")?;
        let value = serde_json::from_str(text).context("Message body is not valid JSON")?;
        Ok(Some(value))
    }

    /// Parse and consume a header block, remembering the body length.
    fn take_header(&mut self) -> Result<Option<usize>> {
        let window = self.buffer.len().min(MAX_HEADER_SIZE + 4);
        let Some((header_len, body_start)) = find_header_end(&self.buffer[..window]) else {
            if self.buffer.len() > MAX_HEADER_SIZE {
                self.clear();
                return Err(anyhow!(
                    "Header block exceeds maximum {} bytes",
                    MAX_HEADER_SIZE
                ));
            }
            return Ok(None);
        };

        let size = match parse_content_length(&self.buffer[..header_len]) {
            Ok(size) => size,
            Err(e) => {
                // Stream position is unknown past a bad header
                self.clear();
                return Err(e);
            }
        };

        if size > MAX_MESSAGE_SIZE {
            self.clear();
            return Err(anyhow!(
                "Message size {} exceeds maximum {} bytes",
                size,
                MAX_MESSAGE_SIZE
            ));
        }

        self.buffer.drain(..body_start);
        self.body_len = Some(size);
        Ok(Some(size))
    }
}

/// Locate the blank line ending the header block.
///
/// Returns `(header_len, body_start)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| (pos, pos + 4));
    let lf = find(buf, b"\n\n").map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract the Content-Length value from a header block.
fn parse_content_length(header: &[u8]) -> Result<usize> {
    let header = std::str::from_utf8(header).context("Header block is not valid UTF-8")?;
    let mut content_length = None;

    for line in header.lines() {
        let trimmed = line.trim();
        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }
    }

    content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))
}
