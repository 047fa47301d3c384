use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use foundry_protocol::{EventKind, StreamEvent};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Write-through event channel feeding one SSE response.
///
/// The channel holds a single event, so producers wait until the previous event
/// has been handed to the response body. Once the peer is gone sends fail and are
/// dropped; producers keep running. At most one terminal event is delivered.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminal: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                tx,
                terminal: Arc::new(AtomicBool::new(false)),
                detached: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub async fn emit(&self, kind: EventKind, data: Value) {
        if let Some(event) = self.admit(kind, data) {
            if self.tx.send(event).await.is_err() {
                self.mark_detached();
            }
        }
    }

    /// Same as [`EventSink::emit`] for code running on a blocking thread.
    pub fn emit_blocking(&self, kind: EventKind, data: Value) {
        if let Some(event) = self.admit(kind, data) {
            if self.tx.blocking_send(event).is_err() {
                self.mark_detached();
            }
        }
    }

    pub async fn fail(&self, failure: CommandFailure) {
        self.emit(EventKind::CommandError, failure.into_data()).await;
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    fn admit(&self, kind: EventKind, data: Value) -> Option<StreamEvent> {
        if self.terminal.load(Ordering::SeqCst) {
            debug!(kind = kind.as_str(), "dropping event after terminal event");
            return None;
        }
        if kind.is_terminal() && self.terminal.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(StreamEvent::new(kind, data))
    }

    fn mark_detached(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            debug!("event stream peer disconnected; continuing without output");
        }
    }
}

/// Payload of a terminal `command_error`.
#[derive(Debug, Clone)]
pub(crate) struct CommandFailure {
    pub code: &'static str,
    pub message: String,
    pub extra: Map<String, Value>,
}

impl CommandFailure {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn into_data(self) -> Value {
        let mut map = self.extra;
        map.insert("code".into(), json!(self.code));
        map.insert("message".into(), json!(self.message));
        Value::Object(map)
    }
}

/// Render the receiving half as `text/event-stream`: `event: <type>` plus the
/// serialized event as `data`.
pub(crate) fn sse_response(rx: mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(SseEvent::default().event(event.kind.as_str()).data(data))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

#[cfg(test)]
pub(crate) async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    while let Some(ev) = rx.recv().await {
        out.push(ev);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_first_terminal_event_is_delivered() {
        let (sink, rx) = EventSink::channel();
        let producer = tokio::spawn(async move {
            sink.emit(EventKind::CommandStart, json!({})).await;
            sink.emit(EventKind::CommandComplete, json!({"exit_code": 0})).await;
            sink.fail(CommandFailure::new("late", "after completion")).await;
            sink.emit(EventKind::CommandOutput, json!({"line": "x"})).await;
            assert!(sink.terminal_sent());
        });
        let events = collect(rx).await;
        producer.await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::CommandStart, EventKind::CommandComplete]);
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_stop_producer() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        for i in 0..5 {
            sink.emit(EventKind::CommandOutput, json!({"line_number": i})).await;
        }
        sink.emit(EventKind::CommandComplete, json!({})).await;
        assert!(sink.terminal_sent());
    }

    #[test]
    fn failure_payload_carries_code_and_extras() {
        let data = CommandFailure::new("command_failed", "exit 3")
            .with("exit_code", json!(3))
            .into_data();
        assert_eq!(data["code"], "command_failed");
        assert_eq!(data["message"], "exit 3");
        assert_eq!(data["exit_code"], 3);
    }
}
