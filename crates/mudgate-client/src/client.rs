//! The gateway client: one background task owning the WebSocket, a
//! directive channel in, an event channel out.
//!
//! Link lifecycle is an explicit four-state machine. `UserPaused` (manual
//! disconnect) suppresses auto-reconnect until `resume`; any other drop
//! redials with bounded backoff, re-presenting the stored identity so the
//! server recovers the session.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use mudgate_core::{now_ms, Envelope, GateError, GateResult};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffConfig};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the gateway (`ws://host:port`).
    pub url: String,
    /// Identifier stamped into `meta.client` on every frame.
    pub client_label: String,
    /// Commands retained while the link is down.
    pub pending_max: usize,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_label: "mudgate-client".to_string(),
            pending_max: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Link lifecycle as seen by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Manual disconnect; auto-reconnect is off until `resume`.
    UserPaused,
}

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum ClientEvent {
    /// `init_ok` landed; the session is live (created or recovered).
    Ready {
        public_id: String,
        owner: String,
        status: String,
        has_history: bool,
    },
    /// Any other server frame (`line`, `history`, `state`, `sound`,
    /// `system`, `confirm`, `session_invalid`, `error`).
    Frame(Envelope),
    Link(LinkState),
    /// The reconnect attempt budget is spent.
    GaveUp,
}

#[derive(Debug)]
enum Directive {
    Command(String),
    Login { username: String, password: String },
    Connect,
    Disconnect,
    Resume,
    Shutdown,
}

/// Handle to the background client task.
#[derive(Clone)]
pub struct GateClient {
    directives: mpsc::Sender<Directive>,
}

impl GateClient {
    /// Spawn the client task; events arrive on the returned receiver.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (directive_tx, directive_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let runner = Runner {
            pending: PendingQueue::new(config.pending_max),
            backoff: Backoff::new(config.backoff.clone()),
            config,
            identity: None,
            directives: directive_rx,
            events: event_tx,
            link: LinkState::Disconnected,
        };
        tokio::spawn(runner.run());

        (
            Self {
                directives: directive_tx,
            },
            event_rx,
        )
    }

    pub async fn submit_command(&self, value: &str) -> GateResult<()> {
        self.send(Directive::Command(value.to_string())).await
    }

    pub async fn submit_login(&self, username: &str, password: &str) -> GateResult<()> {
        self.send(Directive::Login {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// Ask the gateway to open its upstream connection.
    pub async fn request_connect(&self) -> GateResult<()> {
        self.send(Directive::Connect).await
    }

    /// Manual disconnect: pauses the link (`UserPaused`), no auto-reconnect.
    pub async fn request_disconnect(&self) -> GateResult<()> {
        self.send(Directive::Disconnect).await
    }

    /// Leave `UserPaused` and redial.
    pub async fn resume(&self) -> GateResult<()> {
        self.send(Directive::Resume).await
    }

    /// Stop the background task. Cancels any scheduled reconnect.
    pub async fn shutdown(&self) {
        let _ = self.directives.send(Directive::Shutdown).await;
    }

    async fn send(&self, directive: Directive) -> GateResult<()> {
        self.directives
            .send(directive)
            .await
            .map_err(|_| GateError::Closed)
    }
}

/// Bounded FIFO of commands awaiting a live link.
#[derive(Debug)]
struct PendingQueue {
    items: VecDeque<String>,
    max: usize,
}

impl PendingQueue {
    fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    /// Queue a command; refuses (returns `false`) at capacity.
    fn push(&mut self, value: String) -> bool {
        if self.items.len() >= self.max {
            return false;
        }
        self.items.push_back(value);
        true
    }

    fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    fn unpop(&mut self, value: String) {
        self.items.push_front(value);
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone)]
struct Identity {
    public_id: String,
    owner: String,
}

enum Outcome {
    Retry,
    Paused,
    Shutdown,
}

struct Runner {
    config: ClientConfig,
    identity: Option<Identity>,
    pending: PendingQueue,
    backoff: Backoff,
    directives: mpsc::Receiver<Directive>,
    events: mpsc::Sender<ClientEvent>,
    link: LinkState,
}

impl Runner {
    async fn run(mut self) {
        loop {
            if self.link == LinkState::UserPaused {
                if !self.park().await {
                    return;
                }
            }

            let Some(ws) = self.dial().await else {
                return;
            };

            match self.drive(ws).await {
                Outcome::Retry => self.set_link(LinkState::Reconnecting).await,
                Outcome::Paused => self.set_link(LinkState::UserPaused).await,
                Outcome::Shutdown => return,
            }
        }
    }

    /// Wait in `UserPaused` until resumed. Returns `false` on shutdown.
    async fn park(&mut self) -> bool {
        loop {
            match self.directives.recv().await {
                Some(Directive::Resume) => {
                    self.set_link(LinkState::Reconnecting).await;
                    return true;
                }
                Some(Directive::Command(value)) => self.queue_command(value).await,
                Some(Directive::Shutdown) | None => return false,
                Some(_) => {}
            }
        }
    }

    /// Dial with bounded backoff. `None` means shutdown or budget spent.
    /// A successful connect restores the full attempt budget.
    async fn dial(&mut self) -> Option<Ws> {
        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    self.backoff.reset();
                    return Some(ws);
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "dial failed");
                    let Some(delay) = self.backoff.next_delay() else {
                        let _ = self.events.send(ClientEvent::GaveUp).await;
                        self.set_link(LinkState::Disconnected).await;
                        return None;
                    };
                    self.set_link(LinkState::Reconnecting).await;
                    debug!(attempt = self.backoff.attempts_made(), delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                    if !self.sleep_absorbing_directives(delay).await {
                        return None;
                    }
                    if self.link == LinkState::UserPaused {
                        return self.resume_or_stop().await;
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay while still queuing commands. Returns
    /// `false` on shutdown; a `Disconnect` flips the link to `UserPaused`.
    async fn sleep_absorbing_directives(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                directive = self.directives.recv() => match directive {
                    Some(Directive::Command(value)) => self.queue_command(value).await,
                    Some(Directive::Disconnect) => self.link = LinkState::UserPaused,
                    Some(Directive::Shutdown) | None => return false,
                    Some(_) => {}
                }
            }
        }
    }

    /// After a pause during backoff: park until resume, then restart dial.
    async fn resume_or_stop(&mut self) -> Option<Ws> {
        let _ = self.events.send(ClientEvent::Link(LinkState::UserPaused)).await;
        if self.park().await {
            Box::pin(self.dial()).await
        } else {
            None
        }
    }

    /// One connected episode: init handshake, then frame/directive pumping.
    async fn drive(&mut self, mut ws: Ws) -> Outcome {
        let init_payload = match &self.identity {
            Some(id) => json!({ "publicId": id.public_id, "owner": id.owner }),
            None => json!({}),
        };
        let init = self.frame("init", init_payload);
        if send_frame(&mut ws, &init).await.is_err() {
            return Outcome::Retry;
        }

        loop {
            tokio::select! {
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::decode(text.as_str()) {
                            Ok(envelope) => self.handle_frame(&mut ws, envelope).await,
                            Err(e) => debug!(error = %e, "dropping malformed server frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Outcome::Retry,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "transport error");
                        return Outcome::Retry;
                    }
                },

                directive = self.directives.recv() => match directive {
                    Some(Directive::Command(value)) => {
                        if self.link == LinkState::Connected {
                            let frame = self.frame("command", json!({ "value": value }));
                            if send_frame(&mut ws, &frame).await.is_err() {
                                self.queue_command(value).await;
                                return Outcome::Retry;
                            }
                        } else {
                            self.queue_command(value).await;
                        }
                    }
                    Some(Directive::Login { username, password }) => {
                        let frame = self.frame(
                            "login",
                            json!({ "username": username, "password": password }),
                        );
                        if send_frame(&mut ws, &frame).await.is_err() {
                            return Outcome::Retry;
                        }
                    }
                    Some(Directive::Connect) => {
                        let frame = self.frame("connect", json!({}));
                        if send_frame(&mut ws, &frame).await.is_err() {
                            return Outcome::Retry;
                        }
                    }
                    Some(Directive::Disconnect) => {
                        let frame = self.frame("disconnect", json!({}));
                        let _ = send_frame(&mut ws, &frame).await;
                        let _ = ws.close(None).await;
                        return Outcome::Paused;
                    }
                    Some(Directive::Resume) => {}
                    Some(Directive::Shutdown) | None => {
                        let _ = ws.close(None).await;
                        return Outcome::Shutdown;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, ws: &mut Ws, envelope: Envelope) {
        match envelope.kind.as_str() {
            "init_ok" => {
                let public_id = envelope.str_field("publicId").unwrap_or_default().to_string();
                let owner = envelope.str_field("owner").unwrap_or_default().to_string();
                let status = envelope.str_field("status").unwrap_or_default().to_string();
                let has_history = envelope
                    .payload
                    .get("hasHistory")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                self.identity = Some(Identity {
                    public_id: public_id.clone(),
                    owner: owner.clone(),
                });
                self.set_link(LinkState::Connected).await;
                let _ = self
                    .events
                    .send(ClientEvent::Ready {
                        public_id,
                        owner,
                        status,
                        has_history,
                    })
                    .await;

                // Everything queued during the outage goes out before any
                // newly submitted command.
                while let Some(value) = self.pending.pop() {
                    let frame = self.frame("command", json!({ "value": value }));
                    if send_frame(ws, &frame).await.is_err() {
                        self.pending.unpop(value);
                        break;
                    }
                }
            }
            "session_invalid" => {
                // Our identity is stale; the next init starts fresh.
                warn!(
                    reason = envelope.str_field("reason").unwrap_or("unknown"),
                    "session invalidated by server"
                );
                self.identity = None;
                let _ = self.events.send(ClientEvent::Frame(envelope)).await;
            }
            _ => {
                let _ = self.events.send(ClientEvent::Frame(envelope)).await;
            }
        }
    }

    async fn queue_command(&mut self, value: String) {
        if !self.pending.push(value) {
            warn!(max = self.pending.max, "pending queue full, dropping command");
        } else {
            debug!(queued = self.pending.len(), "command queued for recovery");
        }
    }

    async fn set_link(&mut self, link: LinkState) {
        if self.link == link {
            return;
        }
        self.link = link;
        let _ = self.events.send(ClientEvent::Link(link)).await;
    }

    fn frame(&self, kind: &str, payload: serde_json::Value) -> Envelope {
        let mut envelope = Envelope::new(kind, payload);
        envelope.meta.client_ts = Some(now_ms());
        envelope.meta.client = Some(self.config.client_label.clone());
        envelope
    }
}

async fn send_frame(ws: &mut Ws, envelope: &Envelope) -> GateResult<()> {
    let wire = envelope.encode()?;
    ws.send(Message::Text(wire.into()))
        .await
        .map_err(|e| GateError::Other(format!("send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn pending_queue_is_bounded_fifo() {
        let mut queue = PendingQueue::new(2);
        assert!(queue.push("a".into()));
        assert!(queue.push("b".into()));
        assert!(!queue.push("c".into()));
        assert_eq!(queue.pop().as_deref(), Some("a"));
        queue.unpop("a".into());
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn frames_carry_client_meta() {
        let runner_config = ClientConfig::new("ws://unused");
        let runner = Runner {
            pending: PendingQueue::new(4),
            backoff: Backoff::new(runner_config.backoff.clone()),
            config: runner_config,
            identity: None,
            directives: mpsc::channel(1).1,
            events: mpsc::channel(1).0,
            link: LinkState::Disconnected,
        };
        let frame = runner.frame("command", json!({ "value": "look" }));
        assert_eq!(frame.kind, "command");
        assert!(frame.meta.client_ts.is_some());
        assert_eq!(frame.meta.client.as_deref(), Some("mudgate-client"));
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.expect("frame").expect("ok") {
                Message::Text(text) => return text.to_string(),
                Message::Close(_) => panic!("closed early"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn commands_queued_before_init_ok_flush_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let init = Envelope::decode(&next_text(&mut ws).await).unwrap();
            assert_eq!(init.kind, "init");
            assert!(init.str_field("publicId").is_none());

            // Hold the reply so the client's submissions land in its queue.
            tokio::time::sleep(Duration::from_millis(150)).await;
            let reply = Envelope::new(
                "init_ok",
                json!({
                    "publicId": "p1",
                    "owner": "o1",
                    "status": "created",
                    "hasHistory": false,
                }),
            );
            ws.send(Message::Text(reply.encode().unwrap().into()))
                .await
                .unwrap();

            let first = Envelope::decode(&next_text(&mut ws).await).unwrap();
            let second = Envelope::decode(&next_text(&mut ws).await).unwrap();
            (
                first.str_field("value").unwrap().to_string(),
                second.str_field("value").unwrap().to_string(),
            )
        });

        let (client, mut events) = GateClient::start(ClientConfig::new(format!("ws://{addr}")));
        client.submit_command("look").await.unwrap();
        client.submit_command("smile").await.unwrap();

        let (first, second) = server.await.unwrap();
        assert_eq!(first, "look");
        assert_eq!(second, "smile");

        // The Ready event carries the assigned identity.
        let ready = loop {
            match events.recv().await.expect("event") {
                ClientEvent::Ready { public_id, .. } => break public_id,
                _ => continue,
            }
        };
        assert_eq!(ready, "p1");

        client.shutdown().await;
    }
}
