//! Newline-delimited JSON-RPC 2.0 over a worker's stdio.
//!
//! A `StdioChannel` owns the write half (worker stdin) and a reader task over
//! the read half (worker stdout). Responses are matched to pending requests
//! by id, so concurrent requests on the same channel are fine. The reader
//! keeps draining stdout until EOF even if nobody is waiting on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Errors from a single exchange on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Timed out after {}ms waiting for response", .0.as_millis())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON serialization error: {0}")]
    Json(String),

    #[error("Server returned error: code={code}, message={message}")]
    Rpc { code: i64, message: String },
}

/// JSON-RPC 2.0 request or notification (no id).
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// Any inbound message. Only responses (id plus result or error) are dispatched.
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

type Reply = Result<Value, ChannelError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Request/response channel over a worker's stdin/stdout.
pub struct StdioChannel {
    label: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioChannel {
    /// Attach to a reader/writer pair and start the dispatch task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(read_loop(
            label.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            label,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader: Mutex::new(Some(task)),
        }
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        if let Err(e) = self.write_message(&message).await {
            self.lock_pending().remove(&id);
            return Err(e);
        }
        trace!(channel = %self.label, id, method, "Sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply: the reader went away.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        };
        self.write_message(&message).await
    }

    /// Drop the write half and fail outstanding requests.
    ///
    /// The reader keeps draining until the worker closes its stdout.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(channel = %self.label, error = %e, "Error closing worker stdin");
            }
        }
        fail_pending(&self.pending);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write_message(&self, message: &JsonRpcRequest<'_>) -> Result<(), ChannelError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| ChannelError::Json(e.to_string()))?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StdioChannel {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for StdioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioChannel")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(label: String, reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    // Byte-based so non-UTF-8 noise on stdout does not end the reader.
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::with_capacity(4096);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(channel = %label, "Worker closed stdout");
                break;
            }
            Ok(_) => dispatch(&label, String::from_utf8_lossy(&buf).trim(), &pending),
            Err(e) => {
                debug!(channel = %label, error = %e, "Error reading worker stdout");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
}

fn dispatch(label: &str, line: &str, pending: &PendingMap) {
    if line.is_empty() {
        return;
    }

    let message: JsonRpcMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(_) => {
            debug!(channel = %label, line, "Skipping non-JSON-RPC output");
            return;
        }
    };

    if let Some(method) = message.method {
        debug!(channel = %label, method = %method, "Ignoring server-initiated message");
        return;
    }

    let Some(id) = message.id.as_ref().and_then(Value::as_u64) else {
        debug!(channel = %label, line, "Skipping response without numeric id");
        return;
    };

    let sender = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    let Some(sender) = sender else {
        debug!(channel = %label, id, "Skipping response with no pending request");
        return;
    };

    let reply = match (message.error, message.result) {
        (Some(err), _) => Err(ChannelError::Rpc {
            code: err.code,
            message: err.message,
        }),
        (None, result) => Ok(result.unwrap_or(Value::Null)),
    };
    // The requester may have timed out in the meantime.
    let _ = sender.send(reply);
}

fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (_, sender) in drained {
        let _ = sender.send(Err(ChannelError::Closed));
    }
}
