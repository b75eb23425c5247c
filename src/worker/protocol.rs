//! Line-delimited JSON protocol spoken with the embedding worker.
//!
//! Each message is one JSON object terminated by `\n`. The worker answers a
//! request with zero or more `{"status":"processing"}` heartbeats followed by
//! exactly one terminal frame (embedding, batch, error, or an ack such as a
//! health report).

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::error::EmbedError;

/// Upper bound on a single response line (a 4096-dim batch of 512 is ~40MB).
pub const MAX_LINE_BYTES: u64 = 100 * 1024 * 1024;

/// Status string the worker uses for heartbeats.
pub const STATUS_PROCESSING: &str = "processing";

/// Requests understood by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    /// `{"type":"embed","text":"...","requestId":"..."}`
    Embed {
        text: String,
        request_id: Option<String>,
    },
    /// `{"texts":[...]}`
    Batch { texts: Vec<String> },
    /// `{"type":"health"}`
    Health,
    /// `{"type":"get_dimension"}`
    GetDimension,
    /// `{"shutdown":true}`
    Shutdown,
    /// `{"type":"kys"}`, the client heartbeat a worker expects while it is in use.
    Keepalive,
}

impl WorkerRequest {
    pub fn embed(text: impl Into<String>) -> Self {
        WorkerRequest::Embed {
            text: text.into(),
            request_id: None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerRequest::Embed { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Returns a copy tagged with `request_id` (only embed requests carry ids).
    pub fn with_request_id(&self, id: impl Into<String>) -> Self {
        match self {
            WorkerRequest::Embed { text, .. } => WorkerRequest::Embed {
                text: text.clone(),
                request_id: Some(id.into()),
            },
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            WorkerRequest::Embed { text, request_id } => {
                let mut obj = json!({ "type": "embed", "text": text });
                if let Some(id) = request_id {
                    obj["requestId"] = Value::String(id.clone());
                }
                obj
            }
            WorkerRequest::Batch { texts } => json!({ "texts": texts }),
            WorkerRequest::Health => json!({ "type": "health" }),
            WorkerRequest::GetDimension => json!({ "type": "get_dimension" }),
            WorkerRequest::Shutdown => json!({ "shutdown": true }),
            WorkerRequest::Keepalive => json!({ "type": "kys" }),
        }
    }
}

/// Encode a request as a single newline-terminated line.
pub fn encode_request(request: &WorkerRequest) -> Result<Vec<u8>, EmbedError> {
    let mut line = serde_json::to_vec(&request.to_json())
        .map_err(|e| EmbedError::Protocol(format!("failed to encode request: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

/// One decoded line from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFrame {
    /// Progress signal; resets the idle timer and is never terminal.
    Heartbeat {
        text_length: Option<usize>,
        request_id: Option<String>,
    },
    Embedding {
        vector: Vec<f64>,
        request_id: Option<String>,
    },
    Batch {
        vectors: Vec<Vec<f64>>,
    },
    Error {
        message: String,
        request_id: Option<String>,
    },
    /// Any other terminal object (health report, dimension info, shutdown ack).
    Ack {
        status: Option<String>,
        body: Map<String, Value>,
    },
}

impl WorkerFrame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, WorkerFrame::Heartbeat { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerFrame::Heartbeat { request_id, .. }
            | WorkerFrame::Embedding { request_id, .. }
            | WorkerFrame::Error { request_id, .. } => request_id.as_deref(),
            WorkerFrame::Ack { body, .. } => body.get("requestId").and_then(Value::as_str),
            WorkerFrame::Batch { .. } => None,
        }
    }

    /// Turn an error frame into `EmbedError::Worker`, passing others through.
    pub fn into_result(self) -> Result<WorkerFrame, EmbedError> {
        match self {
            WorkerFrame::Error { message, .. } => Err(EmbedError::Worker(message)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    text_length: Option<usize>,
    #[serde(default)]
    embedding: Option<Vec<f64>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
}

/// Decode one response line.
pub fn decode_frame(line: &str) -> Result<WorkerFrame, EmbedError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| EmbedError::Protocol(format!("invalid JSON from worker: {e}")))?;
    let Value::Object(body) = value else {
        return Err(EmbedError::Protocol(format!(
            "expected JSON object from worker, got: {}",
            truncate(line, 120)
        )));
    };
    let raw: RawFrame = serde_json::from_value(Value::Object(body.clone()))
        .map_err(|e| EmbedError::Protocol(format!("malformed worker frame: {e}")))?;

    if let Some(error) = raw.error {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(WorkerFrame::Error {
            message,
            request_id: raw.request_id,
        });
    }
    if let Some(vector) = raw.embedding {
        return Ok(WorkerFrame::Embedding {
            vector,
            request_id: raw.request_id,
        });
    }
    if let Some(vectors) = raw.embeddings {
        return Ok(WorkerFrame::Batch { vectors });
    }
    if raw.status.as_deref() == Some(STATUS_PROCESSING) {
        return Ok(WorkerFrame::Heartbeat {
            text_length: raw.text_length,
            request_id: raw.request_id,
        });
    }
    Ok(WorkerFrame::Ack {
        status: raw.status,
        body,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Buffered frame reader over one side of a socket.
///
/// The socket's read timeout is the idle timeout: every successful read
/// restarts it, so heartbeats keep a long computation alive.
pub struct FrameReader {
    reader: BufReader<UnixStream>,
    socket: PathBuf,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(stream: UnixStream, socket: &Path) -> Self {
        Self {
            reader: BufReader::new(stream),
            socket: socket.to_path_buf(),
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn set_idle_timeout(&self, idle: Duration) -> Result<(), EmbedError> {
        let idle = (!idle.is_zero()).then_some(idle);
        self.reader
            .get_ref()
            .set_read_timeout(idle)
            .map_err(|e| EmbedError::transport(&self.socket, e))
    }

    /// Read the next non-empty line and decode it.
    pub fn read_frame(&mut self, idle: Duration) -> Result<WorkerFrame, EmbedError> {
        loop {
            self.buf.clear();
            let result = (&mut self.reader)
                .take(MAX_LINE_BYTES)
                .read_until(b'\n', &mut self.buf);
            let read = result.map_err(|e| self.map_io(e, idle))?;
            if read == 0 {
                return Err(EmbedError::connection_lost(&self.socket));
            }
            if self.buf.last() != Some(&b'\n') {
                if read as u64 >= MAX_LINE_BYTES {
                    return Err(EmbedError::Protocol(format!(
                        "response line exceeds {MAX_LINE_BYTES} bytes"
                    )));
                }
                // EOF in the middle of a line.
                return Err(EmbedError::connection_lost(&self.socket));
            }
            let line = std::str::from_utf8(&self.buf)
                .map_err(|e| EmbedError::Protocol(format!("non UTF-8 response: {e}")))?
                .trim();
            if line.is_empty() {
                continue;
            }
            return decode_frame(line);
        }
    }

    fn map_io(&self, err: std::io::Error, idle: Duration) -> EmbedError {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                EmbedError::IdleTimeout {
                    socket: self.socket.clone(),
                    idle,
                }
            }
            _ => EmbedError::transport(&self.socket, err),
        }
    }
}

/// Write an encoded request, mapping failures to transport errors.
pub fn write_request(
    stream: &mut UnixStream,
    socket: &Path,
    line: &[u8],
) -> Result<(), EmbedError> {
    stream
        .write_all(line)
        .and_then(|()| stream.flush())
        .map_err(|e| EmbedError::transport(socket, e))
}
