// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Request tracing
//
// Optional per-request record of what the proxy received, sent upstream,
// got back, and returned. One JSON line per phase in
// `<dir>/<request_id>.jsonl`. Files are written on a dedicated thread so
// recording never blocks the async runtime. Write failures are logged and
// swallowed.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    ClientRequest,
    UpstreamRequest,
    UpstreamResponse,
    ClientResponse,
}

impl TracePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TracePhase::ClientRequest => "client_request",
            TracePhase::UpstreamRequest => "upstream_request",
            TracePhase::UpstreamResponse => "upstream_response",
            TracePhase::ClientResponse => "client_response",
        }
    }
}

/// Destination for trace records.
pub trait TraceSink: Send + Sync {
    /// Whether records are kept at all. Callers skip building payloads when false.
    fn enabled(&self) -> bool {
        true
    }

    fn record(&self, request_id: &str, phase: TracePhase, payload: &Value);
}

/// Discards everything.
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn enabled(&self) -> bool {
        false
    }

    fn record(&self, _request_id: &str, _phase: TracePhase, _payload: &Value) {}
}

enum WriterCommand {
    Append { request_id: String, line: String },
    Flush(oneshot::Sender<()>),
}

/// Appends JSON lines to one file per request.
///
/// Records are queued to a writer thread in call order. The thread exits
/// once the sink is dropped and the queue is drained.
pub struct FileTraceSink {
    queue: mpsc::UnboundedSender<WriterCommand>,
}

impl FileTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (queue, mut commands) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("toolshim-trace".to_string())
            .spawn(move || {
                while let Some(command) = commands.blocking_recv() {
                    match command {
                        WriterCommand::Append { request_id, line } => {
                            if let Err(e) = append(&dir, &request_id, &line) {
                                tracing::warn!(request_id = %request_id, error = %e, "failed to write trace entry");
                            }
                        }
                        WriterCommand::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self { queue })
    }

    /// Wait until every record queued so far is on disk.
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.queue.send(WriterCommand::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }
}

fn append(dir: &Path, request_id: &str, line: &str) -> std::io::Result<()> {
    let path = dir.join(format!("{request_id}.jsonl"));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

impl TraceSink for FileTraceSink {
    fn record(&self, request_id: &str, phase: TracePhase, payload: &Value) {
        let entry = json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "request_id": request_id,
            "phase": phase.as_str(),
            "payload": payload,
        });
        let command = WriterCommand::Append {
            request_id: request_id.to_string(),
            line: entry.to_string(),
        };
        if self.queue.send(command).is_err() {
            tracing::warn!(request_id, "trace writer stopped; dropping entry");
        }
    }
}

/// Payload for a body that may or may not be JSON.
pub fn body_payload(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
