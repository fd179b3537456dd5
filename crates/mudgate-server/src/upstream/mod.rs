//! Byte-stream connector to the remote MUD.
//!
//! The connector does not interpret the stream: no protocol decoding, no
//! ANSI stripping. It exposes raw read chunks plus a serialized write path;
//! partial-line assembly belongs to the session.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Size of one read from the upstream socket.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the command channel feeding the writer task. A full channel
/// is reported to callers as back-pressure.
const WRITE_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream connect timed out")]
    Timeout,

    #[error("upstream connection closed")]
    Closed,

    #[error("upstream write back-pressured")]
    Backpressure,

    #[error("upstream io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write-side handle to an open upstream connection.
///
/// Writes are serialized through an internal task that owns the socket's
/// write half; `close` is idempotent and unblocks any pending reader.
#[derive(Debug)]
pub struct Upstream {
    commands: mpsc::Sender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

/// Read-side handle, yielding raw byte chunks until EOF, error, or close.
pub struct UpstreamReader {
    half: OwnedReadHalf,
    closed: watch::Receiver<bool>,
}

impl Upstream {
    /// Open a TCP connection to `host:port`, bounded by `deadline`.
    pub async fn open(
        host: &str,
        port: u16,
        deadline: Duration,
        write_timeout: Duration,
    ) -> Result<(Upstream, UpstreamReader), UpstreamError> {
        let stream = tokio::time::timeout(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (read_half, mut write_half) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

        let writer_closed = closed_tx.clone();
        let mut writer_closed_rx = closed_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = async { let _ = writer_closed_rx.wait_for(|c| *c).await; } => {
                        let _ = write_half.shutdown().await;
                        break;
                    }

                    maybe = cmd_rx.recv() => match maybe {
                        Some(bytes) => {
                            match tokio::time::timeout(write_timeout, write_half.write_all(&bytes))
                                .await
                            {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(error = %e, "upstream write failed");
                                    let _ = writer_closed.send(true);
                                    break;
                                }
                                Err(_) => {
                                    warn!("upstream write stalled past timeout");
                                    let _ = writer_closed.send(true);
                                    let _ = write_half.shutdown().await;
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("upstream writer task ended");
        });

        Ok((
            Upstream {
                commands: cmd_tx,
                closed: closed_tx,
            },
            UpstreamReader {
                half: read_half,
                closed: closed_rx,
            },
        ))
    }

    /// Queue bytes for the writer task.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), UpstreamError> {
        if *self.closed.borrow() {
            return Err(UpstreamError::Closed);
        }
        self.commands.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UpstreamError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => UpstreamError::Closed,
        })
    }

    /// Close the connection. Idempotent; in-flight reads and writes observe
    /// [`UpstreamError::Closed`].
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}

impl UpstreamReader {
    /// Read the next raw chunk. `Ok(None)` on EOF; `Err(Closed)` after a
    /// local `close`.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UpstreamError> {
        if *self.closed.borrow() {
            return Err(UpstreamError::Closed);
        }
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut closed = self.closed.clone();
        tokio::select! {
            res = self.half.read(&mut buf) => match res {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(e) => Err(UpstreamError::Io(e)),
            },
            _ = closed.wait_for(|c| *c) => Err(UpstreamError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn echo_peer() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"welcome\n").await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        received.extend_from_slice(&buf[..n]);
                        if received.ends_with(b"quit\n") {
                            break;
                        }
                    }
                }
            }
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn open_read_write_close() {
        let (addr, peer) = echo_peer().await;
        let (up, mut reader) = Upstream::open(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let chunk = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, b"welcome\n");

        up.write(b"look\n".to_vec()).unwrap();
        up.write(b"quit\n".to_vec()).unwrap();

        let received = peer.await.unwrap();
        assert_eq!(received, b"look\nquit\n");

        up.close();
        up.close(); // idempotent
        assert!(matches!(
            reader.next_chunk().await,
            Err(UpstreamError::Closed)
        ));
        assert!(matches!(
            up.write(b"late\n".to_vec()),
            Err(UpstreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Hold the socket open without sending anything.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let (up, mut reader) = Upstream::open(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            up.close();
        });

        assert!(matches!(
            reader.next_chunk().await,
            Err(UpstreamError::Closed)
        ));
        closer.await.unwrap();
        accept.abort();
    }

    #[tokio::test]
    async fn unreachable_host_reported() {
        // Port 1 on loopback is never listening in the test environment.
        let result = Upstream::open(
            "127.0.0.1",
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(UpstreamError::Unreachable(_))));
    }

    #[tokio::test]
    async fn eof_reported_as_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (_up, mut reader) = Upstream::open(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(reader.next_chunk().await.unwrap().is_none());
    }
}
