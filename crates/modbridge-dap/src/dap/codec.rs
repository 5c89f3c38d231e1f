//! `Content-Length` framing for DAP messages.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use std::io;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{messages::Request, MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, DapError>;

async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<String>> {
    let mut buf = Vec::<u8>::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(DapError::Protocol(format!(
                "DAP header line exceeds maximum size ({max_len} bytes)"
            )));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline_pos.is_some() {
            break;
        }
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| DapError::Protocol("DAP header line is not UTF-8".to_string()))
}

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next framed message body. Returns `Ok(None)` on a clean EOF
    /// between messages.
    pub async fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header_line = false;

        loop {
            let Some(line) = read_line_limited(&mut self.reader, MAX_DAP_HEADER_LINE_BYTES).await?
            else {
                if !saw_header_line {
                    return Ok(None);
                }
                return Err(DapError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while reading DAP headers",
                )));
            };
            saw_header_line = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }

            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };

            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|e| {
                    DapError::Protocol(format!("invalid Content-Length {value:?}: {e}"))
                })?);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol("missing Content-Length header".to_string()));
        };
        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(DapError::Protocol(format!(
                "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(bytes) = self.read_raw().await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice::<Value>(&bytes)?))
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value::<Request>(value)?))
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The underlying stream, for writing bytes that bypass framing.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        self.write_message(value).await
    }

    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", bytes.len()).as_bytes())
            .await?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
