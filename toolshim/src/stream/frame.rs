// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// SSE framing
//
// Splits an event-stream byte sequence into blank-line terminated frames.
// Bytes are buffered raw and decoded only once a frame is complete, so a
// multibyte character split across network chunks never decodes lossily.

use std::borrow::Cow;

use serde_json::Value;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Frames that grow past this many bytes without a terminator are passed
/// through in pieces, unparsed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Accumulates raw bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
    /// Bytes before this offset hold no terminator start.
    scanned: usize,
    /// Inside a frame that exceeded `MAX_FRAME_BYTES`.
    oversized: bool,
}

impl FrameSplitter {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, if the buffer holds a frame terminator.
    ///
    /// An oversized frame comes out as partial frames instead, the last one
    /// ending with the frame's terminator.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if let Some((end, terminator_len)) = find_terminator(&self.buf, self.scanned) {
            let rest = self.buf.split_off(end + terminator_len);
            let mut raw = std::mem::replace(&mut self.buf, rest);
            self.scanned = 0;
            if std::mem::take(&mut self.oversized) {
                return Some(Frame::partial(raw));
            }
            let terminator = raw.split_off(end);
            return Some(Frame { raw, terminator });
        }

        // The last three bytes may begin a terminator.
        self.scanned = self.buf.len().saturating_sub(3);
        if self.buf.len() > MAX_FRAME_BYTES || (self.oversized && self.scanned > 0) {
            if !self.oversized {
                tracing::warn!(
                    limit = MAX_FRAME_BYTES,
                    "stream frame too large, forwarding unparsed"
                );
                self.oversized = true;
            }
            let rest = self.buf.split_off(self.scanned);
            self.scanned = 0;
            return Some(Frame::partial(std::mem::replace(&mut self.buf, rest)));
        }
        None
    }

    /// Whether buffered bytes belong to an oversized frame.
    pub fn is_oversized(&self) -> bool {
        self.oversized
    }

    /// Drain whatever is buffered, terminated or not.
    pub fn take_remainder(&mut self) -> Vec<u8> {
        self.scanned = 0;
        self.oversized = false;
        std::mem::take(&mut self.buf)
    }
}

/// Position and length of the earliest `\n\n` or `\r\n\r\n` at or after `from`.
fn find_terminator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let buf_from = &buf[from.min(buf.len())..];
    let lf = find(buf_from, b"\n\n").map(|i| (from + i, 2));
    let crlf = find(buf_from, b"\r\n\r\n").map(|i| (from + i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// What a frame carries, judged by its `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// The `[DONE]` sentinel.
    Done,
    /// A JSON chunk with an object at `choices[0]`.
    Payload(Value),
    /// Anything else: comments, event-only frames, unparsable or unexpected data.
    Raw,
}

/// One SSE frame: its lines and the blank-line terminator that ended it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    raw: Vec<u8>,
    terminator: Vec<u8>,
}

impl Frame {
    /// A frame cut off by the end of the stream. It gets a terminator so that
    /// events emitted after it stay well framed.
    pub fn unterminated(mut raw: Vec<u8>, crlf: bool) -> Self {
        while raw.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            raw.pop();
        }
        Self {
            raw,
            terminator: terminator(crlf).as_bytes().to_vec(),
        }
    }

    /// A piece of an oversized frame, forwarded as is.
    fn partial(raw: Vec<u8>) -> Self {
        Self {
            raw,
            terminator: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.terminator.is_empty()
    }

    pub fn is_crlf(&self) -> bool {
        self.terminator.starts_with(b"\r")
    }

    fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Payload lines joined with `\n`, or `None` when the frame has none.
    pub fn data(&self) -> Option<String> {
        let text = self.text();
        let lines: Vec<&str> = text.split('\n').filter_map(data_value).collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    pub fn kind(&self) -> FrameKind {
        if self.is_partial() {
            return FrameKind::Raw;
        }
        let Some(data) = self.data() else {
            return FrameKind::Raw;
        };
        if data.trim() == DONE_SENTINEL {
            return FrameKind::Done;
        }
        match serde_json::from_str::<Value>(&data) {
            Ok(value) if is_chunk_shape(&value) => FrameKind::Payload(value),
            Ok(_) => FrameKind::Raw,
            Err(e) => {
                tracing::debug!(error = %e, "forwarding unparsable stream frame");
                FrameKind::Raw
            }
        }
    }

    /// The frame exactly as received.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + self.terminator.len());
        out.extend_from_slice(&self.raw);
        out.extend_from_slice(&self.terminator);
        out
    }

    /// The frame with its data lines replaced by a single line carrying
    /// `payload`. Other lines (`event:`, `id:`, comments) keep their place.
    pub fn rewrite(&self, payload: &Value) -> Vec<u8> {
        let eol = if self.is_crlf() { "\r\n" } else { "\n" };
        let text = self.text();
        let mut lines: Vec<Cow<'_, str>> = Vec::new();
        let mut wrote_data = false;
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if data_value(line).is_some() {
                if !wrote_data {
                    lines.push(Cow::Owned(format!("data: {payload}")));
                    wrote_data = true;
                }
            } else {
                lines.push(Cow::Borrowed(line));
            }
        }
        let mut out = lines.join(eol).into_bytes();
        out.extend_from_slice(&self.terminator);
        out
    }
}

/// A new frame carrying `payload`.
pub fn synthesize(payload: &Value, crlf: bool) -> Vec<u8> {
    format!("data: {payload}{}", terminator(crlf)).into_bytes()
}

fn terminator(crlf: bool) -> &'static str {
    if crlf {
        "\r\n\r\n"
    } else {
        "\n\n"
    }
}

fn data_value(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn is_chunk_shape(value: &Value) -> bool {
    value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .is_some_and(Value::is_object)
}
