//! Line framing for the control channel.
//!
//! Both directions are newline-delimited. A control frame is a line that
//! contains [`SENTINEL`] followed by a single JSON object; every other byte the
//! target writes is program output. The hook writes through the same stdout as
//! the scripts it debugs, so a frame may start in the middle of a line after a
//! `print` that did not end with a newline.

use bytes::BytesMut;
use serde::Serialize;
use tokio_util::codec::Decoder;

use super::types::{Command, Result, TargetFrame};

/// Reserved prefix that marks a control frame.
pub const SENTINEL: &str = "\u{1}DBG:";

/// Default cap for a single line before it is flushed as output in chunks.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// One unit produced by [`LineCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A full line with the terminator (`\n` or `\r\n`) stripped.
    Complete(String),
    /// A slice of a line that exceeded the length cap. Never a control frame.
    Partial(String),
    /// A control frame that exceeded the length cap. Everything after the
    /// first `max_len` bytes was dropped up to the line terminator.
    Oversized {
        /// Start of the JSON payload, for diagnostics.
        head: String,
        /// Length of the whole frame, sentinel included.
        len: usize,
    },
}

/// Splits a byte stream into lines, chunking overlong ones instead of failing.
///
/// Unlike `tokio_util::codec::LinesCodec::new_with_max_length`, which discards
/// oversized lines, runaway program output is still forwarded to the client.
/// Chunks are cut on UTF-8 character boundaries.
///
/// A codec built with [`LineCodec::control`] also recognises overlong control
/// frames. Those are never chunked into output: the codec keeps their head,
/// skips the rest of the line and reports a single [`Line::Oversized`].
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_len: usize,
    frames: bool,
    /// Bytes already scanned for `\n` in the current buffer.
    next_index: usize,
    /// The current line already had a prefix flushed as [`Line::Partial`].
    in_partial: bool,
    /// An overlong control frame is being skipped.
    discarding: Option<Discard>,
}

#[derive(Debug, Clone)]
struct Discard {
    head: String,
    len: usize,
}

impl LineCodec {
    /// A codec for streams that carry only program output.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            frames: false,
            next_index: 0,
            in_partial: false,
            discarding: None,
        }
    }

    /// A codec for the stream that carries control frames.
    pub fn control(max_len: usize) -> Self {
        Self {
            frames: true,
            ..Self::new(max_len)
        }
    }

    /// Where to cut an overlong line: at most `max_len` bytes, never inside
    /// a UTF-8 sequence and never inside a possible sentinel prefix.
    fn cut_point(&self, buf: &[u8]) -> usize {
        let mut cut = self.max_len;
        while cut > 0 && self.max_len - cut < 3 && is_continuation(buf[cut]) {
            cut -= 1;
        }
        if cut == 0 {
            // The cap is narrower than the first character: keep it whole.
            cut = self.max_len;
            while cut < buf.len() && cut - self.max_len < 3 && is_continuation(buf[cut]) {
                cut += 1;
            }
        }
        if self.frames {
            let sentinel = SENTINEL.as_bytes();
            let held = (1..sentinel.len())
                .rev()
                .find(|n| *n < cut && buf[..cut].ends_with(&sentinel[..*n]));
            if let Some(held) = held {
                cut -= held;
            }
        }
        cut
    }

    fn skip_oversized(&mut self, buf: &mut BytesMut, eof: bool) -> Option<Line> {
        let discard = self.discarding.as_mut()?;
        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                discard.len += strip_cr(&buf[..pos]).len();
                let _ = buf.split_to(pos + 1);
            }
            None => {
                discard.len += buf.len();
                buf.clear();
                if !eof {
                    return None;
                }
            }
        }
        self.next_index = 0;
        self.in_partial = false;
        self.discarding
            .take()
            .map(|Discard { head, len }| Line::Oversized { head, len })
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

fn utf8_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn strip_cr(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

fn find_sentinel(bytes: &[u8]) -> Option<usize> {
    let sentinel = SENTINEL.as_bytes();
    bytes.windows(sentinel.len()).position(|window| window == sentinel)
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
        if self.discarding.is_some() {
            return Ok(self.skip_oversized(buf, false));
        }

        let scan_end = buf.len().min(self.max_len + 1);
        let newline = buf[self.next_index.min(scan_end)..scan_end]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| offset + self.next_index.min(scan_end));

        if let Some(pos) = newline {
            if self.frames && self.in_partial {
                // A frame following output that was already flushed in chunks.
                match find_sentinel(&buf[..pos]) {
                    Some(0) => self.in_partial = false,
                    Some(start) => {
                        let chunk = buf.split_to(start);
                        self.next_index = 0;
                        self.in_partial = false;
                        return Ok(Some(Line::Partial(utf8_lossy(&chunk))));
                    }
                    None => {}
                }
            }
            let line = buf.split_to(pos + 1);
            self.next_index = 0;
            let text = utf8_lossy(strip_cr(&line[..pos]));
            let was_partial = std::mem::replace(&mut self.in_partial, false);
            return Ok(Some(if was_partial {
                Line::Partial(text)
            } else {
                Line::Complete(text)
            }));
        }

        if buf.len() > self.max_len {
            let mut cut = self.cut_point(buf);
            if self.frames {
                match find_sentinel(&buf[..]) {
                    Some(0) => {
                        let head = &buf[SENTINEL.len()..self.max_len.max(SENTINEL.len())];
                        self.discarding = Some(Discard {
                            head: utf8_lossy(head),
                            len: 0,
                        });
                        return Ok(self.skip_oversized(buf, false));
                    }
                    Some(pos) => cut = cut.min(pos),
                    None => {}
                }
            }
            let chunk = buf.split_to(cut);
            self.next_index = 0;
            self.in_partial = true;
            return Ok(Some(Line::Partial(utf8_lossy(&chunk))));
        }

        self.next_index = buf.len();
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
        if self.discarding.is_some() {
            return Ok(self.skip_oversized(buf, true));
        }
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Trailing data without a newline: the process exited mid-line.
        let rest = buf.split_to(buf.len());
        self.next_index = 0;
        let was_partial = std::mem::replace(&mut self.in_partial, false);
        let text = utf8_lossy(strip_cr(&rest));
        Ok(Some(if was_partial {
            Line::Partial(text)
        } else {
            Line::Complete(text)
        }))
    }
}

/// Result of interpreting one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(TargetFrame),
    Output(String),
    Malformed { line: String, error: String },
    /// A control frame too long to read. `kind` is its tag when the kept head
    /// shows it.
    Oversized { kind: Option<String>, len: usize },
}

/// Interpret a line read from the target.
///
/// Returns up to two items: output text preceding the sentinel (if any) and
/// then the frame itself.
pub fn decode_line(line: &Line) -> Vec<Decoded> {
    let text = match line {
        Line::Partial(text) => return vec![Decoded::Output(text.clone())],
        Line::Oversized { head, len } => {
            return vec![Decoded::Oversized {
                kind: frame_kind(head).map(str::to_string),
                len: *len,
            }]
        }
        Line::Complete(text) => text,
    };

    let Some(pos) = text.find(SENTINEL) else {
        return vec![Decoded::Output(text.clone())];
    };

    let mut out = Vec::with_capacity(2);
    if pos > 0 {
        out.push(Decoded::Output(text[..pos].to_string()));
    }
    let payload = &text[pos + SENTINEL.len()..];
    match serde_json::from_str::<TargetFrame>(payload) {
        Ok(frame) => out.push(Decoded::Frame(frame)),
        Err(err) => out.push(Decoded::Malformed {
            line: payload.to_string(),
            error: err.to_string(),
        }),
    }
    out
}

/// The `kind` tag of a frame, read from the start of its JSON without parsing
/// the rest.
fn frame_kind(head: &str) -> Option<&str> {
    let rest = head.trim_start().strip_prefix('{')?.trim_start();
    let rest = rest.strip_prefix(r#""kind""#)?.trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    rest.find('"').map(|end| &rest[..end])
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut line = Vec::with_capacity(SENTINEL.len() + json.len() + 1);
    line.extend_from_slice(SENTINEL.as_bytes());
    line.extend_from_slice(&json);
    line.push(b'\n');
    Ok(line)
}

/// Encode an adapter -> target command as one line.
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    encode_line(command)
}

/// Encode a target -> adapter frame as one line.
pub fn encode_frame(frame: &TargetFrame) -> Result<Vec<u8>> {
    encode_line(frame)
}

/// Parse a command line as received by the target side.
pub fn decode_command(line: &str) -> std::result::Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(payload) = line.strip_prefix(SENTINEL) else {
        return Err(format!("missing control sentinel: {line:?}"));
    };
    serde_json::from_str(payload).map_err(|err| err.to_string())
}
