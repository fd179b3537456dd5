//! Transport handles shared between the connection layer and sessions.

pub mod websocket;

use mudgate_core::Envelope;
use tokio::sync::mpsc;
use tracing::trace;

/// A request to close the peer with a specific WebSocket code.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Why a frame could not be queued to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is at the high-water mark.
    Full,
    /// The writer task is gone.
    Closed,
}

/// Handle to one attached frame channel.
///
/// Cloned into the owning session's attached set; all writes go through the
/// bounded outbound queue drained by the connection's writer task, so a slow
/// peer never blocks the session dispatch loop.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    id: u64,
    frames: mpsc::Sender<String>,
    closer: mpsc::Sender<CloseRequest>,
}

impl TransportHandle {
    pub fn new(
        id: u64,
        frames: mpsc::Sender<String>,
        closer: mpsc::Sender<CloseRequest>,
    ) -> Self {
        Self { id, frames, closer }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame, stamping `meta.serverTs`.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        let wire = match envelope.encode_stamped() {
            Ok(wire) => wire,
            Err(e) => {
                // Serialization of server-built frames cannot fail in practice.
                trace!(transport = self.id, error = %e, "frame encode failed");
                return Ok(());
            }
        };
        self.frames.try_send(wire).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the writer task to close the peer. Best-effort and idempotent.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.closer.try_send(CloseRequest {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A transport backed by plain channels, for session-level tests.
    pub fn channel_transport(
        id: u64,
        capacity: usize,
    ) -> (
        TransportHandle,
        mpsc::Receiver<String>,
        mpsc::Receiver<CloseRequest>,
    ) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = mpsc::channel(4);
        (
            TransportHandle::new(id, frame_tx, close_tx),
            frame_rx,
            close_rx,
        )
    }
}
