//! Debug inspection surface, served on a separate listener only when the
//! `DEBUG` environment variable is set. Forbidden in production.
//!
//! Endpoints: `/sessions`, `/api/sessions/status`, `/logs`, and
//! `/api/logs/stream` (server-sent events tailing the in-process log ring).

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use mudgate_core::{GateError, GateResult};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::session::{SessionManager, SessionSummary};

/// Bounded ring of recent log lines plus a broadcast feed for live tails.
pub struct LogRing {
    buffer: std::sync::Mutex<VecDeque<String>>,
    feed: broadcast::Sender<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (feed, _) = broadcast::channel(256);
        Arc::new(Self {
            buffer: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            feed,
            capacity,
        })
    }

    fn push(&self, line: String) {
        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(line.clone());
        }
        let _ = self.feed.send(line);
    }

    pub fn recent(&self) -> Vec<String> {
        self.buffer
            .lock()
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }
}

/// A `tracing` layer that mirrors formatted events into a [`LogRing`].
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        self.ring.push(format!(
            "{} {} {}{}",
            meta.level(),
            meta.target(),
            visitor.message,
            visitor.fields
        ));
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[derive(Clone)]
struct DebugState {
    manager: Arc<SessionManager>,
    ring: Arc<LogRing>,
}

/// Serve the debug router until the process exits.
pub async fn serve(
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    ring: Arc<LogRing>,
) -> GateResult<()> {
    let app = Router::new()
        .route("/sessions", get(sessions))
        .route("/api/sessions/status", get(status))
        .route("/logs", get(logs))
        .route("/api/logs/stream", get(logs_stream))
        .with_state(DebugState { manager, ring });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GateError::Other(format!("debug bind {addr} failed: {e}")))?;
    info!(addr = %addr, "debug surface listening");
    axum::serve(listener, app).await.map_err(GateError::Io)
}

async fn sessions(State(state): State<DebugState>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.summaries().await)
}

async fn status(State(state): State<DebugState>) -> Json<serde_json::Value> {
    let summaries = state.manager.summaries().await;
    Json(json!({
        "total_sessions": state.manager.session_count().await,
        "total_clients": state.manager.client_count().await,
        "sessions": summaries,
    }))
}

async fn logs(State(state): State<DebugState>) -> String {
    state.ring.recent().join("\n")
}

async fn logs_stream(
    State(state): State<DebugState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let live = state.ring.subscribe();
    let backlog = state.ring.recent();

    let stream = futures_util::stream::iter(
        backlog
            .into_iter()
            .map(|line| Ok(Event::default().data(line))),
    )
    .chain(futures_util::stream::unfold(live, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((Ok(Event::default().data(line)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_lines() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.recent(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn subscribers_see_new_lines() {
        let ring = LogRing::new(8);
        let mut rx = ring.subscribe();
        ring.push("hello".to_string());
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }
}
