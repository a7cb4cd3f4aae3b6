//! Framing for the worker's stdio streams.
//!
//! Requests go out as one JSON object per line. The worker's output is read
//! leniently: a message is either a bare JSON line or a
//! `Content-Length: N\r\n\r\n{json}` frame (which is what tsserver actually
//! emits). [`FrameReader`] accepts both, [`FrameWriter`] writes lines.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum message size (64 MiB). Project-wide navigation replies can be big.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("worker stream I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("message of {len} bytes exceeds maximum {max}")]
    Oversized { len: usize, max: usize },
    #[error("invalid Content-Length value: {0:?}")]
    BadContentLength(String),
    #[error("unexpected EOF inside a framed message")]
    UnexpectedEof,
    #[error("invalid JSON from worker: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads worker messages from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Read one line into `self.line`, giving up once it outgrows a frame.
    /// Returns the number of bytes read; 0 at EOF.
    async fn read_bounded_line(&mut self) -> Result<usize, CodecError> {
        self.line.clear();
        let limit = self.max_frame_bytes as u64 + 1;
        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut self.line)
            .await?;
        if bytes_read as u64 == limit && !self.line.ends_with('\n') {
            return Err(CodecError::Oversized {
                len: bytes_read,
                max: self.max_frame_bytes,
            });
        }
        Ok(bytes_read)
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean EOF between messages. Blank lines
    /// between messages are skipped.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        loop {
            if self.read_bounded_line().await? == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(len) = parse_content_length(trimmed)? {
                return self.read_framed_body(len).await.map(Some);
            }
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }

    /// Skip the remaining header lines, then read exactly `len` body bytes.
    async fn read_framed_body(&mut self, len: usize) -> Result<serde_json::Value, CodecError> {
        loop {
            if self.read_bounded_line().await? == 0 {
                return Err(CodecError::UnexpectedEof);
            }
            if self.line.trim().is_empty() {
                break;
            }
            // Other headers (Content-Type) are ignored.
        }

        if len > self.max_frame_bytes {
            return Err(CodecError::Oversized {
                len,
                max: self.max_frame_bytes,
            });
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::UnexpectedEof
            } else {
                CodecError::Io(e)
            }
        })?;

        Ok(serde_json::from_slice(&body)?)
    }
}

/// `Some(len)` if the line is a `Content-Length` header (case-insensitive).
fn parse_content_length(line: &str) -> Result<Option<usize>, CodecError> {
    let Some((key, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !key.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| CodecError::BadContentLength(value.trim().to_string()))
}

/// Writes newline-delimited JSON messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), CodecError> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
