//! Core server: accepts WebSocket connections and runs the per-connection
//! frame loop — init handshake, rate limiting, and dispatch into sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use mudgate_core::{close, messages, ClientMessage, Envelope, GateError, GateResult, RateWindow};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::session::{AttachOutcome, Session, SessionManager};
use crate::sounds::SoundEngine;
use crate::transport::websocket::{self, WsConnection};
use crate::transport::TransportHandle;

pub struct GateServer {
    cfg: Arc<GateConfig>,
    manager: Arc<SessionManager>,
    next_conn_id: AtomicU64,
}

impl GateServer {
    pub fn new(cfg: Arc<GateConfig>, engine: SoundEngine) -> Self {
        let manager = Arc::new(SessionManager::new(cfg.clone(), Arc::new(engine)));
        Self {
            cfg,
            manager,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    /// Bind the listener, start the sweeper, and serve connections forever.
    pub async fn run(self: Arc<Self>) -> GateResult<()> {
        let (addr, mut conn_rx) = websocket::start_listener(self.cfg.listen).await?;

        tokio::spawn(self.manager.clone().run_sweeper());

        info!(
            addr = %addr,
            mud_host = %self.cfg.mud_host,
            mud_port = self.cfg.mud_port,
            "mudgate ready"
        );

        while let Some(conn) = conn_rx.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(conn).await;
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    /// The per-connection frame loop. Runs until the peer goes away or a
    /// protocol violation closes the transport.
    async fn handle_connection(&self, conn: WsConnection) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        debug!(conn = conn_id, remote = %conn.remote_addr, "connection open");

        let (sink, mut stream) = conn.ws_stream.split();
        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(self.cfg.transport_write_highwater);
        let (close_tx, close_rx) = tokio::sync::mpsc::channel(4);
        let _writer = websocket::spawn_writer(sink, frame_rx, close_rx);
        let transport = TransportHandle::new(conn_id, frame_tx, close_tx);

        let mut rate = RateWindow::new(self.cfg.rate_max_frames, self.cfg.rate_window);
        let mut attachment: Option<Arc<Session>> = None;

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    debug!(conn = conn_id, error = %e, "read error");
                    break;
                }
            };

            if matches!(message, Message::Text(_) | Message::Binary(_)) && !rate.allow() {
                warn!(conn = conn_id, "frame rate limit exceeded");
                transport.close(close::TRY_AGAIN, "rate limited");
                break;
            }

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => {
                    let _ = transport.send(messages::error("text frames only"));
                    continue;
                }
            };

            let envelope = match Envelope::decode(text.as_str()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(conn = conn_id, error = %e, "rejecting frame");
                    let _ = transport.send(messages::error(&e.to_string()));
                    transport.close(close::POLICY, "protocol violation");
                    break;
                }
            };

            let request = match ClientMessage::from_envelope(&envelope) {
                Ok(request) => request,
                Err(GateError::UnknownType(kind)) => {
                    debug!(conn = conn_id, kind = %kind, "ignoring unknown frame type");
                    let _ = transport.send(messages::error(&format!("unknown type: {kind}")));
                    continue;
                }
                Err(e) => {
                    let _ = transport.send(messages::error(&e.to_string()));
                    continue;
                }
            };

            match request {
                ClientMessage::Init { public_id, owner } => {
                    // A second init on the same transport is destructive:
                    // the prior attachment goes first.
                    if let Some(previous) = attachment.take() {
                        previous.detach(conn_id).await;
                    }
                    match self
                        .manager
                        .attach(transport.clone(), public_id.as_deref(), owner.as_deref())
                        .await
                    {
                        AttachOutcome::Attached {
                            session,
                            status,
                            state,
                            history,
                        } => {
                            let _ = transport.send(messages::init_ok(
                                session.public_id(),
                                session.owner(),
                                status,
                                history.is_some(),
                            ));
                            if let Some(content) = history.as_deref() {
                                let _ = transport.send(messages::history(content));
                            }
                            let _ = transport.send(messages::state(state));
                            attachment = Some(session);
                        }
                        AttachOutcome::Rejected {
                            reason,
                            message,
                            close_code,
                        } => {
                            let frame = if close_code == close::MAX_SESSIONS {
                                messages::error(reason)
                            } else {
                                messages::session_invalid(reason, message)
                            };
                            let _ = transport.send(frame);
                            transport.close(close_code, reason);
                            break;
                        }
                    }
                }

                request => {
                    let Some(session) = attachment.as_ref() else {
                        let _ = transport.send(messages::error("init required"));
                        transport.close(close::POLICY, "init required");
                        break;
                    };
                    match request {
                        ClientMessage::Connect => session.request_connect().await,
                        ClientMessage::Disconnect => session.request_disconnect().await,
                        ClientMessage::Command { value } => {
                            session.submit_command(&transport, &value).await
                        }
                        ClientMessage::Login { username, password } => {
                            session.submit_login(&transport, &username, &password).await
                        }
                        ClientMessage::Init { .. } => unreachable!("handled above"),
                    }
                }
            }
        }

        if let Some(session) = attachment.take() {
            session.detach(conn_id).await;
        }
        debug!(conn = conn_id, "connection closed");
    }
}
