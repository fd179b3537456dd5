//! WebSocket listener and writer task, using tokio-tungstenite.
//!
//! The listener accepts TCP connections and runs the WebSocket handshake on
//! each; accepted connections are handed to the server over a channel. Each
//! connection then gets one writer task that drains the transport's outbound
//! frame queue into the sink, so session fan-out never awaits the peer.

use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use mudgate_core::{GateError, GateResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::CloseRequest;

/// A handle to an accepted WebSocket connection.
pub struct WsConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GateResult<(SocketAddr, mpsc::Receiver<WsConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Other(format!("bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WsConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WsConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Spawn the writer task for one connection.
///
/// Drains queued text frames into the sink; a close request preempts pending
/// frames and terminates the task after emitting the close frame.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut frames: mpsc::Receiver<String>,
    mut closes: mpsc::Receiver<CloseRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                Some(req) = closes.recv() => {
                    debug!(code = req.code, reason = %req.reason, "closing transport");
                    let frame = CloseFrame {
                        code: CloseCode::from(req.code),
                        reason: req.reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }

                maybe = frames.recv() => match maybe {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // All senders dropped: the connection is done.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    })
}
