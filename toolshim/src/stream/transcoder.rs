// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Streaming transcoder
//
// Rewrites an upstream chat-completion event stream so marker-delimited
// tool calls never reach the client as text. Text flows through as it
// arrives, except for a short tail that could be the start of a call
// marker. Once the marker is seen, everything after it is buffered and
// parsed when the stream ends; the recovered calls are emitted as one
// synthetic `delta.tool_calls` event ahead of the sentinel.

use std::borrow::Cow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde_json::{json, Value};

use super::frame::{synthesize, Frame, FrameKind, FrameSplitter};
use crate::message::ToolCall;
use crate::parser::ToolProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Forwarding text, watching for the call marker.
    Scanning,
    /// Call marker seen; text goes to the tool buffer.
    Buffering,
    /// Sentinel seen or stream closed. Remaining bytes pass through.
    Done,
}

/// Per-request transcoder state. Not shared across requests.
pub struct StreamTranscoder {
    protocol: Arc<ToolProtocol>,
    frames: FrameSplitter,
    phase: Phase,
    /// Suffix of forwarded-so-far text that may begin the call marker.
    pending_tail: String,
    /// Trailing whitespace of safe text, sent once more text follows.
    held_space: String,
    /// Whether any non-whitespace text went downstream.
    sent_text: bool,
    /// Everything from the call marker onward.
    tool_buffer: String,
    /// Latest payload, used as the template for synthesized events.
    last_envelope: Option<Value>,
    crlf: bool,
    emitted_calls: usize,
    request_id: String,
}

impl StreamTranscoder {
    pub fn new(protocol: Arc<ToolProtocol>) -> Self {
        Self {
            protocol,
            frames: FrameSplitter::default(),
            phase: Phase::Scanning,
            pending_tail: String::new(),
            held_space: String::new(),
            sent_text: false,
            tool_buffer: String::new(),
            last_envelope: None,
            crlf: false,
            emitted_calls: 0,
            request_id: String::new(),
        }
    }

    /// Tag log lines with the owning request.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of tool calls emitted so far.
    pub fn emitted_calls(&self) -> usize {
        self.emitted_calls
    }

    /// Feed one upstream chunk and return the bytes to send downstream.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        if self.phase == Phase::Done {
            return Bytes::copy_from_slice(chunk);
        }

        self.frames.push(chunk);
        let mut out = Vec::new();
        while self.phase != Phase::Done {
            let Some(frame) = self.frames.next_frame() else {
                break;
            };
            self.handle_frame(frame, &mut out);
        }
        if self.phase == Phase::Done {
            out.extend(self.frames.take_remainder());
        }
        Bytes::from(out)
    }

    /// Upstream ended. Processes a trailing unterminated frame, then flushes
    /// buffered text and calls without adding a sentinel.
    pub fn finish(&mut self) -> Bytes {
        let mut out = Vec::new();
        let oversized = self.frames.is_oversized();
        let rest = self.frames.take_remainder();

        if self.phase == Phase::Done {
            out.extend(rest);
            return Bytes::from(out);
        }

        if oversized {
            out.extend(Frame::unterminated(rest, self.crlf).to_bytes());
        } else if !rest.iter().all(u8::is_ascii_whitespace) {
            self.handle_frame(Frame::unterminated(rest, self.crlf), &mut out);
        }
        if self.phase != Phase::Done {
            self.flush(&mut out);
            self.phase = Phase::Done;
        }
        Bytes::from(out)
    }

    fn handle_frame(&mut self, frame: Frame, out: &mut Vec<u8>) {
        if !frame.is_partial() {
            self.crlf = frame.is_crlf();
        }

        let mut payload = match frame.kind() {
            FrameKind::Done => {
                self.flush(out);
                out.extend(frame.to_bytes());
                self.phase = Phase::Done;
                return;
            }
            FrameKind::Raw => {
                out.extend(frame.to_bytes());
                return;
            }
            FrameKind::Payload(payload) => payload,
        };

        self.last_envelope = Some(payload.clone());

        let text = match delta_content(&payload) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => {
                out.extend(frame.to_bytes());
                return;
            }
        };

        let forward = match self.phase {
            Phase::Buffering => {
                self.tool_buffer.push_str(&text);
                String::new()
            }
            _ => {
                let safe = self.scan(&text);
                self.release(safe)
            }
        };

        if forward == text {
            out.extend(frame.to_bytes());
            return;
        }
        set_delta_content(&mut payload, (!forward.is_empty()).then_some(forward));
        out.extend(frame.rewrite(&payload));
    }

    /// Join `text` onto the held tail and return the part that is safe to send.
    fn scan(&mut self, text: &str) -> String {
        let protocol = Arc::clone(&self.protocol);
        let marker = protocol.markers().call_start.as_str();

        let mut combined = std::mem::take(&mut self.pending_tail);
        combined.push_str(text);

        if let Some(pos) = combined.find(marker) {
            self.tool_buffer = combined.split_off(pos);
            self.phase = Phase::Buffering;
            tracing::debug!(request_id = %self.request_id, "tool call marker detected in stream");
            return combined;
        }

        let keep = holdback_len(&combined, marker);
        self.pending_tail = combined.split_off(combined.len() - keep);
        combined
    }

    /// Prepend held whitespace to `safe` and hold back its own trailing
    /// whitespace, which is dropped if a call region follows.
    fn release(&mut self, safe: String) -> String {
        let mut text = std::mem::take(&mut self.held_space);
        text.push_str(&safe);
        let keep = text.len() - text.trim_end().len();
        self.held_space = text.split_off(text.len() - keep);
        self.sent_text |= !text.is_empty();
        text
    }

    /// Text still owed downstream once the stream ends, with the same edge
    /// trimming the non-stream finisher applies around call regions.
    fn residual(&mut self) -> (String, Vec<ToolCall>) {
        let held = std::mem::take(&mut self.held_space);
        if self.phase != Phase::Buffering {
            return (held + &std::mem::take(&mut self.pending_tail), Vec::new());
        }

        let buffer = std::mem::take(&mut self.tool_buffer);
        let (calls, rest) = self.protocol.extract(&buffer);
        let text = match rest {
            // No region matched: the marker was ordinary text.
            Cow::Borrowed(raw) => held + raw,
            Cow::Owned(rest) if rest.trim().is_empty() => String::new(),
            Cow::Owned(rest) if self.sent_text => held + rest.trim_end(),
            Cow::Owned(rest) => rest.trim().to_string(),
        };
        (text, calls)
    }

    /// Emit whatever is held back: residual text as a content event, then
    /// parsed calls as a tool-call event.
    fn flush(&mut self, out: &mut Vec<u8>) {
        let (residual, calls) = self.residual();
        let residual = (!residual.is_empty()).then_some(residual);

        let Some(envelope) = self.last_envelope.as_ref() else {
            return;
        };

        if let Some(text) = residual {
            out.extend(synthesize(&patch(envelope, json!({"content": text})), self.crlf));
        }
        if !calls.is_empty() {
            let deltas: Vec<Value> = calls.iter().map(ToolCall::to_delta_json).collect();
            out.extend(synthesize(
                &patch(envelope, json!({"tool_calls": deltas})),
                self.crlf,
            ));
            self.emitted_calls += calls.len();
            tracing::debug!(
                request_id = %self.request_id,
                tool_calls = calls.len(),
                "emitted tool call event"
            );
        }
    }
}

/// Longest suffix of `text` that is a strict prefix of `marker`.
pub fn holdback_len(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && marker.starts_with(&text[start..])
        })
        .unwrap_or(0)
}

fn delta_content(payload: &Value) -> Option<&str> {
    payload
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
}

fn set_delta_content(payload: &mut Value, content: Option<String>) {
    if let Some(delta) = payload
        .pointer_mut("/choices/0/delta")
        .and_then(Value::as_object_mut)
    {
        match content {
            Some(text) => {
                delta.insert("content".to_string(), Value::String(text));
            }
            None => {
                delta.remove("content");
            }
        }
    }
}

/// Copy of `envelope` whose first choice carries only `delta`.
fn patch(envelope: &Value, delta: Value) -> Value {
    let mut event = envelope.clone();
    if let Some(obj) = event.as_object_mut() {
        obj.remove("usage");
    }
    if let Some(choice) = event
        .pointer_mut("/choices/0")
        .and_then(Value::as_object_mut)
    {
        choice.insert("delta".to_string(), delta);
        choice.insert("finish_reason".to_string(), Value::Null);
    }
    event
}

// ---------------------------------------------------------------------------
// Async adapter
// ---------------------------------------------------------------------------

/// Drive `transcoder` over an upstream byte stream.
///
/// Pull-based: one upstream chunk is read per downstream poll, so a slow
/// client throttles upstream reads and dropping the returned stream drops
/// the upstream along with any buffered tool text. An upstream error or
/// `idle_timeout` without a chunk ends the stream with a best-effort flush.
pub fn transcode<S, E>(
    input: S,
    transcoder: StreamTranscoder,
    idle_timeout: Duration,
) -> Pin<Box<dyn Stream<Item = Bytes> + Send>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let input: Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>> = Box::pin(input);
    let state = Some((input, transcoder));

    let stream = futures_util::stream::unfold(state, move |state| async move {
        let (mut input, mut transcoder) = state?;
        loop {
            let out = match tokio::time::timeout(idle_timeout, input.next()).await {
                Ok(Some(Ok(chunk))) => transcoder.push(&chunk),
                Ok(Some(Err(e))) => {
                    tracing::warn!(
                        request_id = %transcoder.request_id,
                        error = %e,
                        "upstream stream failed, flushing"
                    );
                    return Some((transcoder.finish(), None));
                }
                Ok(None) => {
                    if transcoder.phase() != Phase::Done {
                        tracing::debug!(
                            request_id = %transcoder.request_id,
                            "upstream closed without sentinel, flushing"
                        );
                    }
                    return Some((transcoder.finish(), None));
                }
                Err(_) => {
                    tracing::warn!(
                        request_id = %transcoder.request_id,
                        idle_timeout_ms = idle_timeout.as_millis() as u64,
                        "upstream stream idle, flushing"
                    );
                    return Some((transcoder.finish(), None));
                }
            };
            if !out.is_empty() {
                return Some((out, Some((input, transcoder))));
            }
        }
    })
    .filter(|b| futures_util::future::ready(!b.is_empty()));

    Box::pin(stream)
}
