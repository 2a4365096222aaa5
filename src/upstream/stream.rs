//! Streaming channel to a worker
//!
//! Maintains one WebSocket connection to a worker's `/ws` endpoint and
//! turns its textual messages into a totally ordered sequence of
//! [`StreamEvent`]s. Binary frames (preview snapshots) are ignored at this
//! layer. The connection is single-tenant while lent out by the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info};

use crate::types::{GatewayError, Result};

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Parsed progress message from the worker
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Preamble naming nodes that will be served from the worker's cache
    ExecutionCached {
        prompt_id: String,
        nodes: Vec<String>,
    },
    /// A node started executing; `node: None` signals normal completion
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    /// A node finished and produced output
    Executed { prompt_id: String, node: String },
    /// The submission failed on the worker
    ExecutionError { prompt_id: String, message: String },
    /// Queue status; an empty remaining queue implies completion by cache
    Status { queue_remaining: Option<u64> },
    /// Any other textual message, kept for logging only
    Other { kind: String },
}

/// Parse one textual worker message into an event. Unparseable text is
/// dropped (returns None); the stream stays usable.
pub fn parse_event(text: &str) -> Option<StreamEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    let event = match kind {
        "execution_cached" => StreamEvent::ExecutionCached {
            prompt_id: data.get("prompt_id")?.as_str()?.to_string(),
            nodes: data
                .get("nodes")
                .and_then(|n| n.as_array())
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|n| n.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        },
        "executing" => StreamEvent::Executing {
            prompt_id: data
                .get("prompt_id")
                .and_then(|p| p.as_str())
                .map(str::to_string),
            node: data
                .get("node")
                .and_then(|n| n.as_str())
                .map(str::to_string),
        },
        "executed" => StreamEvent::Executed {
            prompt_id: data.get("prompt_id")?.as_str()?.to_string(),
            node: data.get("node")?.as_str()?.to_string(),
        },
        "execution_error" => StreamEvent::ExecutionError {
            prompt_id: data.get("prompt_id")?.as_str()?.to_string(),
            message: data
                .get("exception_message")
                .and_then(|m| m.as_str())
                .unwrap_or("execution error")
                .to_string(),
        },
        "status" => StreamEvent::Status {
            queue_remaining: data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(|q| q.as_u64()),
        },
        other => StreamEvent::Other {
            kind: other.to_string(),
        },
    };
    Some(event)
}

/// One live streaming connection to a worker
pub struct WorkerStream {
    pub id: u64,
    pub worker_id: String,
    /// Client token bound to this connection; submissions monitored over
    /// this stream must use the same token.
    client_id: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    sink: Arc<Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: AtomicU64,
}

impl std::fmt::Debug for WorkerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerStream")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl WorkerStream {
    /// Open a new streaming connection with a bounded handshake deadline
    pub async fn connect(
        id: u64,
        worker_id: &str,
        ws_url: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{ws_url}?clientId={client_id}");

        let host = url.split("//").nth(1).unwrap_or("localhost").to_string();
        let request = Request::builder()
            .uri(url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| GatewayError::Internal(format!("Failed to build request: {e}")))?;

        let connect = connect_async_with_config(request, None, false);
        let (ws, _) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| {
                GatewayError::Transport(format!("Stream connect to {worker_id} timed out"))
            })?
            .map_err(|e| {
                GatewayError::Transport(format!("Stream connect to {worker_id} failed: {e}"))
            })?;

        let (sink, ws_stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let read_sink = Arc::clone(&sink);
        let read_connected = Arc::clone(&connected);
        let read_worker = worker_id.to_string();
        tokio::spawn(async move {
            read_loop(id, read_worker, ws_stream, read_sink, read_connected, events_tx).await;
        });

        info!(worker = %worker_id, stream_id = id, "Stream connected");
        let now = Instant::now();
        Ok(Self {
            id,
            worker_id: worker_id.to_string(),
            client_id,
            events: events_rx,
            sink,
            connected,
            created_at: now,
            last_used_at: now,
            use_count: AtomicU64::new(0),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Mark the start of a lease
    pub fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Next event in arrival order. Returns None once the connection is
    /// gone and all buffered events are drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Discard events buffered while the stream sat idle
    pub fn drain(&mut self) {
        while self.events.try_recv().is_ok() {}
    }

    /// Liveness probe used by the pool maintenance tick
    pub async fn ping(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| GatewayError::Transport(format!("Ping failed: {e}")))
    }

    /// Handles for pinging without taking the stream out of the pool
    pub(crate) fn liveness_handle(&self) -> (u64, Arc<Mutex<WsSink>>, Arc<AtomicBool>) {
        (self.id, Arc::clone(&self.sink), Arc::clone(&self.connected))
    }

    /// Requested shutdown: close the socket without reconnect
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// Receive loop for one connection. Textual messages become events, binary
/// frames are ignored, pings are answered. Exits when the socket closes.
async fn read_loop(
    stream_id: u64,
    worker_id: String,
    mut ws_stream: futures_util::stream::SplitStream<
        WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    >,
    sink: Arc<Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
) {
    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_event(&text) {
                    if events_tx.send(event).is_err() {
                        // Receiver dropped: the stream object is gone
                        break;
                    }
                }
            }
            Ok(Message::Binary(data)) => {
                // Preview frames are not consumed at this layer
                debug!(
                    worker = %worker_id,
                    stream_id,
                    len = data.len(),
                    "Ignoring binary frame"
                );
            }
            Ok(Message::Ping(data)) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(frame)) => {
                info!(worker = %worker_id, stream_id, frame = ?frame, "Stream closed by worker");
                break;
            }
            Err(e) => {
                error!(worker = %worker_id, stream_id, "Stream error: {e}");
                break;
            }
            _ => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!(worker = %worker_id, stream_id, "Stream read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_executing_completion() {
        let event =
            parse_event(r#"{"type":"executing","data":{"node":null,"prompt_id":"abc"}}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Executing {
                prompt_id: Some("abc".to_string()),
                node: None,
            }
        );
    }

    #[test]
    fn test_parse_executing_node() {
        let event =
            parse_event(r#"{"type":"executing","data":{"node":"4","prompt_id":"abc"}}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Executing {
                prompt_id: Some("abc".to_string()),
                node: Some("4".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_status_queue_remaining() {
        let event = parse_event(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":0}}}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Status {
                queue_remaining: Some(0)
            }
        );
    }

    #[test]
    fn test_parse_execution_cached() {
        let event = parse_event(
            r#"{"type":"execution_cached","data":{"nodes":["1","2"],"prompt_id":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::ExecutionCached {
                prompt_id: "abc".to_string(),
                nodes: vec!["1".to_string(), "2".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_execution_error() {
        let event = parse_event(
            r#"{"type":"execution_error","data":{"prompt_id":"abc","exception_message":"OOM"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::ExecutionError {
                prompt_id: "abc".to_string(),
                message: "OOM".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_unknown_type_kept_as_other() {
        let event = parse_event(r#"{"type":"progress","data":{"value":3}}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Other {
                kind: "progress".to_string()
            }
        );
    }

    #[test]
    fn test_parse_garbage_dropped() {
        assert!(parse_event("not json").is_none());
        assert!(parse_event(r#"{"data":{}}"#).is_none());
    }
}
