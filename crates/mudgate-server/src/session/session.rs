//! The per-user session: state machine, history, pending-command queue, and
//! multiplexer between one upstream connection and any number of attached
//! transports.
//!
//! All mutable state lives behind one `tokio::sync::Mutex`; every entry
//! point locks it, so upstream lines, transport commands, and sweep
//! eviction are serialized per session. Fan-out never awaits a peer: frames
//! go through each transport's bounded outbound queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use mudgate_core::{close, messages, Envelope, SessionState};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::session::detect;
use crate::session::history::History;
use crate::sounds::SoundEngine;
use crate::transport::{SendError, TransportHandle};
use crate::upstream::{Upstream, UpstreamError, UpstreamReader};

/// What a freshly attached transport needs to catch up.
#[derive(Debug)]
pub struct AttachSnapshot {
    pub state: SessionState,
    /// Retained history, `None` when empty.
    pub history: Option<String>,
}

/// Point-in-time view for the debug surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub public_id: String,
    pub state: SessionState,
    pub clients: usize,
    pub history_lines: usize,
    pub history_bytes: usize,
    pub pending_commands: usize,
    pub idle_secs: u64,
    pub username_hint: Option<String>,
}

pub struct Session {
    public_id: String,
    owner: String,
    cfg: Arc<GateConfig>,
    engine: Arc<SoundEngine>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    history: History,
    partial: String,
    pending: VecDeque<String>,
    transports: Vec<TransportHandle>,
    last_activity: Instant,
    credentials_hint: Option<String>,
    upstream: Option<Arc<Upstream>>,
    connected_at: Option<Instant>,
    login_in_flight: bool,
    /// Bumped on every successful connect; stale reader tasks see a
    /// mismatch and stand down.
    epoch: u64,
    /// Set by the sweeper; attach fails afterwards.
    evicted: bool,
}

impl Session {
    pub fn new(cfg: Arc<GateConfig>, engine: Arc<SoundEngine>) -> Self {
        let public_id = uuid::Uuid::new_v4().to_string();
        let owner = generate_owner_secret();
        info!(public_id = %public_id, "session created");
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                history: History::new(cfg.history_max_bytes, cfg.history_max_lines),
                partial: String::new(),
                pending: VecDeque::new(),
                transports: Vec::new(),
                last_activity: Instant::now(),
                credentials_hint: None,
                upstream: None,
                connected_at: None,
                login_in_flight: false,
                epoch: 0,
                evicted: false,
            }),
            public_id,
            owner,
            cfg,
            engine,
        }
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Constant-shape owner check; a missing claim never matches.
    pub fn owner_matches(&self, claim: Option<&str>) -> bool {
        claim == Some(self.owner.as_str())
    }

    // ── Attachment ───────────────────────────────────────────────────

    /// Attach a transport, returning the catch-up snapshot. Fails when the
    /// session has been evicted by the sweeper in the meantime.
    pub async fn attach(&self, transport: TransportHandle) -> Result<AttachSnapshot, ()> {
        let mut inner = self.inner.lock().await;
        if inner.evicted {
            return Err(());
        }
        let id = transport.id();
        inner.transports.retain(|t| t.id() != id);
        inner.transports.push(transport);
        inner.last_activity = Instant::now();
        debug!(public_id = %self.public_id, transport = id, clients = inner.transports.len(), "transport attached");

        // A recovered peer's queued commands go out before anything new.
        self.flush_pending(&mut inner);

        Ok(AttachSnapshot {
            state: inner.state,
            history: (!inner.history.is_empty()).then(|| inner.history.concat()),
        })
    }

    pub async fn detach(&self, transport_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.transports.retain(|t| t.id() != transport_id);
        inner.last_activity = Instant::now();
        debug!(public_id = %self.public_id, transport = transport_id, clients = inner.transports.len(), "transport detached");
    }

    // ── Client-driven operations ─────────────────────────────────────

    /// Open the upstream connection. Allowed only from `DISCONNECTED`.
    pub async fn request_connect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.evicted || inner.state != SessionState::Disconnected {
                return;
            }
            inner.last_activity = Instant::now();
            self.set_state(&mut inner, SessionState::Connecting);
        }

        let opened = Upstream::open(
            &self.cfg.mud_host,
            self.cfg.mud_port,
            self.cfg.connect_timeout,
            self.cfg.write_timeout,
        )
        .await;

        match opened {
            Ok((upstream, reader)) => {
                let upstream = Arc::new(upstream);
                let mut inner = self.inner.lock().await;
                if inner.state != SessionState::Connecting {
                    // Disconnected (or evicted) while we were dialing.
                    upstream.close();
                    return;
                }
                inner.epoch += 1;
                let epoch = inner.epoch;
                inner.upstream = Some(upstream);
                inner.connected_at = Some(Instant::now());
                inner.login_in_flight = false;
                info!(public_id = %self.public_id, host = %self.cfg.mud_host, port = self.cfg.mud_port, "upstream connected");
                self.set_state(&mut inner, SessionState::Connected);
                self.flush_pending(&mut inner);
                drop(inner);

                let session = Arc::clone(self);
                tokio::spawn(async move { session.read_loop(reader, epoch).await });
            }
            Err(e) => {
                warn!(public_id = %self.public_id, error = %e, "upstream connect failed");
                let mut inner = self.inner.lock().await;
                if inner.state == SessionState::Connecting {
                    self.set_state(&mut inner, SessionState::Disconnected);
                    self.fan_out(
                        &mut inner,
                        messages::system("Failed to connect to the game server"),
                    );
                }
            }
        }
    }

    /// Close the upstream gracefully and return to `DISCONNECTED`. The
    /// session shell survives until idle eviction.
    pub async fn request_disconnect(&self) {
        let upstream = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Disconnected {
                return;
            }
            inner.last_activity = Instant::now();
            inner.credentials_hint = None;
            inner.pending.clear();
            inner.login_in_flight = false;
            inner.upstream.take()
        };

        if let Some(upstream) = upstream {
            // Give the game a chance to see the quit before the socket drops.
            let _ = upstream.write(b"quit\n".to_vec());
            tokio::time::sleep(self.cfg.quit_grace).await;
            upstream.close();
        }

        let mut inner = self.inner.lock().await;
        inner.connected_at = None;
        inner.partial.clear();
        self.set_state(&mut inner, SessionState::Disconnected);
        info!(public_id = %self.public_id, "upstream disconnected by user");
    }

    /// Forward a command, splitting on `;` into separate lines. Queued while
    /// `CONNECTING` or back-pressured; refused with `error{queue_full}` when
    /// the queue is at capacity.
    pub async fn submit_command(&self, via: &TransportHandle, value: &str) {
        let pieces = split_commands(value);
        if pieces.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        match inner.state {
            SessionState::Connected | SessionState::AwaitingLogin => {
                self.flush_pending(&mut inner);
                let mut queued_from = None;
                for (i, cmd) in pieces.iter().enumerate() {
                    match self.write_line(&inner, cmd) {
                        Ok(()) => {}
                        Err(UpstreamError::Backpressure) => {
                            queued_from = Some(i);
                            break;
                        }
                        Err(e) => {
                            debug!(public_id = %self.public_id, error = %e, "command write failed");
                            let _ = via.send(messages::error("upstream write failed"));
                            return;
                        }
                    }
                }
                if let Some(start) = queued_from {
                    for cmd in &pieces[start..] {
                        if !self.enqueue_pending(&mut inner, via, cmd) {
                            break;
                        }
                    }
                }
            }
            SessionState::Connecting | SessionState::Reconnecting => {
                for cmd in &pieces {
                    if !self.enqueue_pending(&mut inner, via, cmd) {
                        break;
                    }
                }
            }
            SessionState::Disconnected => {
                let _ = via.send(messages::system("Not connected"));
            }
        }
    }

    /// Send credentials. Only the username is retained, as a hint.
    pub async fn submit_login(&self, via: &TransportHandle, username: &str, password: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        let ready = matches!(
            inner.state,
            SessionState::Connected | SessionState::AwaitingLogin
        ) && inner.upstream.is_some();
        if !ready {
            let _ = via.send(messages::system("Not connected"));
            return;
        }

        inner.credentials_hint = Some(username.to_string());
        inner.login_in_flight = true;
        debug!(public_id = %self.public_id, "sending login sequence");
        for value in [username, password] {
            if let Err(e) = self.write_line(&inner, value) {
                warn!(public_id = %self.public_id, error = %e, "login write failed");
                let _ = via.send(messages::error("upstream write failed"));
                return;
            }
        }
    }

    // ── Upstream ingestion ───────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, mut reader: UpstreamReader, epoch: u64) {
        let mut tick = tokio::time::interval(self.cfg.partial_flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = reader.next_chunk() => match result {
                    Ok(Some(chunk)) => {
                        if !self.ingest_chunk(&chunk, epoch).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        self.upstream_gone(epoch, "Connection closed by the game server").await;
                        break;
                    }
                    // Local close: state was already settled by the closer.
                    Err(UpstreamError::Closed) => break,
                    Err(e) => {
                        self.upstream_gone(epoch, &format!("Connection error: {e}")).await;
                        break;
                    }
                },
                _ = tick.tick() => self.flush_partial_prompt(epoch).await,
            }
        }
        debug!(public_id = %self.public_id, epoch, "upstream reader ended");
    }

    /// Feed raw upstream bytes through partial-line assembly. Returns
    /// `false` when the read loop should stop.
    pub(crate) async fn ingest_chunk(&self, bytes: &[u8], epoch: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.evicted || inner.epoch != epoch {
            return false;
        }
        inner.last_activity = Instant::now();
        inner.partial.push_str(&String::from_utf8_lossy(bytes));

        let mut saw_disconnect = false;
        while let Some(pos) = inner.partial.find('\n') {
            let raw: String = inner.partial[..pos].to_string();
            inner.partial.drain(..=pos);
            if self.deliver_line(&mut inner, &raw) {
                saw_disconnect = true;
                break;
            }
        }

        if saw_disconnect {
            if let Some(upstream) = inner.upstream.take() {
                upstream.close();
            }
            inner.connected_at = None;
            inner.login_in_flight = false;
            self.set_state(&mut inner, SessionState::Disconnected);
            self.fan_out(
                &mut inner,
                messages::system("Disconnected by the game server"),
            );
            return false;
        }

        // A large prompt-looking fragment is promoted without waiting for
        // the timer; anything past the hard cap is flushed unconditionally.
        if inner.partial.len() > self.cfg.partial_prompt_bytes && detect::is_prompt(&inner.partial)
        {
            let raw = std::mem::take(&mut inner.partial);
            self.deliver_line(&mut inner, &raw);
        } else if inner.partial.len() > self.cfg.partial_buffer_max {
            let raw = std::mem::take(&mut inner.partial);
            self.deliver_line(&mut inner, &raw);
        }
        true
    }

    /// Timer path: flush the partial buffer as a synthetic line iff it looks
    /// like a prompt.
    async fn flush_partial_prompt(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.evicted || inner.epoch != epoch || inner.partial.is_empty() {
            return;
        }
        if detect::is_prompt(&inner.partial) {
            let raw = std::mem::take(&mut inner.partial);
            self.deliver_line(&mut inner, &raw);
        }
    }

    /// Deliver one complete line: history, sound evaluation, fan-out, and
    /// prompt-driven state transitions. Returns whether the line carries the
    /// upstream disconnect marker.
    fn deliver_line(&self, inner: &mut Inner, raw: &str) -> bool {
        let trimmed = raw.trim_end();
        inner.history.push(trimmed);

        let sounds = self.engine.process_line(raw);
        let frame = if sounds.gag {
            messages::gagged_line(trimmed)
        } else {
            messages::line(trimmed)
        };
        self.fan_out(inner, frame);
        if !sounds.events.is_empty() {
            self.fan_out(inner, messages::sound(&sounds.events));
        }
        if detect::is_confirm(trimmed) {
            self.fan_out(inner, messages::confirm(trimmed));
        }

        if detect::is_prompt(trimmed) {
            let in_grace = inner
                .connected_at
                .is_some_and(|t| t.elapsed() <= self.cfg.login_grace);
            if inner.state == SessionState::Connected && (in_grace || inner.login_in_flight) {
                self.set_state(inner, SessionState::AwaitingLogin);
            }
        } else if inner.login_in_flight && !trimmed.is_empty() {
            // First substantive line after the credentials went out.
            inner.login_in_flight = false;
            if inner.state == SessionState::AwaitingLogin {
                self.set_state(inner, SessionState::Connected);
            }
        }

        detect::is_disconnect(trimmed)
    }

    /// The upstream went away underneath us (EOF or error).
    async fn upstream_gone(&self, epoch: u64, message: &str) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch
            || inner.state == SessionState::Disconnected
            || inner.upstream.is_none()
        {
            return;
        }
        if let Some(upstream) = inner.upstream.take() {
            upstream.close();
        }
        inner.connected_at = None;
        inner.login_in_flight = false;
        if !inner.partial.is_empty() {
            let raw = std::mem::take(&mut inner.partial);
            self.deliver_line(&mut inner, &raw);
        }
        self.set_state(&mut inner, SessionState::Disconnected);
        self.fan_out(&mut inner, messages::system(message));
        info!(public_id = %self.public_id, "upstream lost");
    }

    // ── Eviction & inspection ────────────────────────────────────────

    /// Evict if the transport set is empty and the idle timeout elapsed.
    /// Serializes against in-flight attach via the session lock.
    pub async fn try_evict(&self, idle_timeout: std::time::Duration) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.transports.is_empty() || inner.last_activity.elapsed() <= idle_timeout {
            return false;
        }
        inner.evicted = true;
        if let Some(upstream) = inner.upstream.take() {
            upstream.close();
        }
        inner.state = SessionState::Disconnected;
        true
    }

    /// Unconditional teardown at process shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.evicted = true;
        if let Some(upstream) = inner.upstream.take() {
            upstream.close();
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.transports.len()
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            public_id: self.public_id.clone(),
            state: inner.state,
            clients: inner.transports.len(),
            history_lines: inner.history.line_count(),
            history_bytes: inner.history.byte_len(),
            pending_commands: inner.pending.len(),
            idle_secs: inner.last_activity.elapsed().as_secs(),
            username_hint: inner.credentials_hint.clone(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Broadcast to every attached transport; a transport whose queue is
    /// full or gone is dropped and closed.
    fn fan_out(&self, inner: &mut Inner, envelope: Envelope) {
        let public_id = &self.public_id;
        inner.transports.retain(|t| match t.send(envelope.clone()) {
            Ok(()) => true,
            Err(SendError::Full) => {
                warn!(public_id = %public_id, transport = t.id(), "transport over high-water, dropping");
                t.close(close::TRY_AGAIN, "write queue overflow");
                false
            }
            Err(SendError::Closed) => {
                t.close(close::WRITE_ERROR, "transport write failed");
                false
            }
        });
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state == state {
            return;
        }
        debug!(public_id = %self.public_id, from = %inner.state, to = %state, "state change");
        inner.state = state;
        self.fan_out(inner, messages::state(state));
    }

    /// Write one command line (newline-terminated) to the upstream.
    fn write_line(&self, inner: &Inner, value: &str) -> Result<(), UpstreamError> {
        let Some(upstream) = inner.upstream.as_ref() else {
            return Err(UpstreamError::Closed);
        };
        let value = self.clamp_command(value);
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(b'\n');
        upstream.write(bytes)
    }

    fn enqueue_pending(&self, inner: &mut Inner, via: &TransportHandle, cmd: &str) -> bool {
        if inner.pending.len() >= self.cfg.command_queue_max {
            warn!(public_id = %self.public_id, "pending command queue full");
            let _ = via.send(messages::error("queue_full"));
            return false;
        }
        inner.pending.push_back(cmd.to_string());
        true
    }

    /// Drain queued commands in arrival order while the upstream accepts
    /// them. Stops on back-pressure; gives up silently when closed (the
    /// reader path reports the loss).
    fn flush_pending(&self, inner: &mut Inner) {
        if !matches!(
            inner.state,
            SessionState::Connected | SessionState::AwaitingLogin
        ) {
            return;
        }
        while let Some(front) = inner.pending.front() {
            match self.write_line(inner, front) {
                Ok(()) => {
                    inner.pending.pop_front();
                }
                Err(_) => break,
            }
        }
    }

    fn clamp_command<'a>(&self, cmd: &'a str) -> &'a str {
        let max = self.cfg.command_max_bytes;
        if cmd.len() <= max {
            return cmd;
        }
        warn!(public_id = %self.public_id, len = cmd.len(), max, "command too long, truncating");
        let mut end = max;
        while !cmd.is_char_boundary(end) {
            end -= 1;
        }
        &cmd[..end]
    }
}

/// Split user input on `;` into trimmed, non-empty command lines.
pub fn split_commands(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 32 random bytes, hex-encoded: the session's ownership secret.
fn generate_owner_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateConfig, Overrides};
    use crate::transport::testing::channel_transport;
    use tokio::sync::mpsc;

    fn test_config() -> Arc<GateConfig> {
        Arc::new(GateConfig::load(None, Overrides::default()).unwrap())
    }

    fn test_session(engine: SoundEngine) -> Arc<Session> {
        Arc::new(Session::new(test_config(), Arc::new(engine)))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let wire = rx.recv().await.expect("frame");
        serde_json::from_str(&wire).unwrap()
    }

    #[test]
    fn command_splitting() {
        assert_eq!(
            split_commands("look; smile; say hi"),
            vec!["look", "smile", "say hi"]
        );
        assert_eq!(split_commands("; ;  ;"), Vec::<String>::new());
        assert_eq!(split_commands("north"), vec!["north"]);
    }

    #[test]
    fn owner_matching() {
        let session = test_session(SoundEngine::empty());
        let owner = session.owner().to_string();
        assert!(session.owner_matches(Some(&owner)));
        assert!(!session.owner_matches(Some("wrong")));
        assert!(!session.owner_matches(None));
    }

    #[tokio::test]
    async fn partial_line_assembly() {
        let session = test_session(SoundEngine::empty());
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport).await.unwrap();

        assert!(session.ingest_chunk(b"hello ", 0).await);
        assert!(session.ingest_chunk(b"world\nhi\n", 0).await);

        let first = next_frame(&mut rx).await;
        assert_eq!(first["type"], "line");
        assert_eq!(first["payload"]["content"], "hello world");
        let second = next_frame(&mut rx).await;
        assert_eq!(second["payload"]["content"], "hi");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_transport_in_order() {
        let session = test_session(SoundEngine::empty());
        let (t1, mut rx1, _c1) = channel_transport(1, 64);
        let (t2, mut rx2, _c2) = channel_transport(2, 64);
        session.attach(t1).await.unwrap();
        session.attach(t2).await.unwrap();

        session.ingest_chunk(b"one\ntwo\n", 0).await;

        for rx in [&mut rx1, &mut rx2] {
            let a = next_frame(rx).await;
            let b = next_frame(rx).await;
            assert_eq!(a["payload"]["content"], "one");
            assert_eq!(b["payload"]["content"], "two");
        }
    }

    #[tokio::test]
    async fn sound_events_follow_their_line() {
        let engine = SoundEngine::new(
            crate::sounds::rules::parse_rules(
                r#"
                [[rules]]
                trigger = "^You hear (.*) howl$"
                send = '''
                play(channel="fx", path="wolf_%1.wav", volume=80)
                '''
                "#,
            )
            .unwrap(),
        );
        let session = test_session(engine);
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport).await.unwrap();

        session.ingest_chunk(b"You hear grey howl\n", 0).await;

        let line = next_frame(&mut rx).await;
        assert_eq!(line["type"], "line");
        assert_eq!(line["payload"]["content"], "You hear grey howl");
        let sound = next_frame(&mut rx).await;
        assert_eq!(sound["type"], "sound");
        let events = sound["payload"]["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["action"], "play");
        assert_eq!(events[0]["path"], "wolf_grey.wav");
        assert_eq!(events[0]["volume"], 80);
    }

    #[tokio::test]
    async fn confirm_prompt_emits_confirm_frame() {
        let session = test_session(SoundEngine::empty());
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport).await.unwrap();

        session
            .ingest_chunk(b"Are you sure you'd like to do this?\n", 0)
            .await;

        assert_eq!(next_frame(&mut rx).await["type"], "line");
        assert_eq!(next_frame(&mut rx).await["type"], "confirm");
    }

    #[tokio::test]
    async fn disconnect_marker_tears_down() {
        let session = test_session(SoundEngine::empty());
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport).await.unwrap();
        {
            let mut inner = session.inner.lock().await;
            inner.state = SessionState::Connected;
        }

        let keep_going = session.ingest_chunk(b"*** Disconnected ***\n", 0).await;
        assert!(!keep_going);

        assert_eq!(next_frame(&mut rx).await["type"], "line");
        let state = next_frame(&mut rx).await;
        assert_eq!(state["type"], "state");
        assert_eq!(state["payload"]["value"], "DISCONNECTED");
        assert_eq!(next_frame(&mut rx).await["type"], "system");
    }

    #[tokio::test]
    async fn history_snapshot_on_late_attach() {
        let session = test_session(SoundEngine::empty());
        let (t1, _rx1, _c1) = channel_transport(1, 64);
        session.attach(t1).await.unwrap();
        session.ingest_chunk(b"first\nsecond\n", 0).await;

        let (t2, _rx2, _c2) = channel_transport(2, 64);
        let snapshot = session.attach(t2).await.unwrap();
        assert_eq!(snapshot.history.as_deref(), Some("first\nsecond"));
    }

    #[tokio::test]
    async fn queue_full_refuses_new_commands() {
        let session = test_session(SoundEngine::empty());
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport.clone()).await.unwrap();
        {
            let mut inner = session.inner.lock().await;
            inner.state = SessionState::Connecting;
        }

        for i in 0..10 {
            session.submit_command(&transport, &format!("cmd{i}")).await;
        }
        session.submit_command(&transport, "one too many").await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"]["message"], "queue_full");
        assert_eq!(session.inner.lock().await.pending.len(), 10);
    }

    #[tokio::test]
    async fn commands_while_disconnected_get_a_notice() {
        let session = test_session(SoundEngine::empty());
        let (transport, mut rx, _closes) = channel_transport(1, 64);
        session.attach(transport.clone()).await.unwrap();

        session.submit_command(&transport, "look").await;
        assert_eq!(next_frame(&mut rx).await["type"], "system");
    }

    #[tokio::test]
    async fn pending_commands_drain_in_order_before_new_ones() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            while received.len() < b"c1\nc2\nc3\n".len() {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let session = test_session(SoundEngine::empty());
        let (transport, _rx, _closes) = channel_transport(1, 64);
        session.attach(transport.clone()).await.unwrap();

        // Queue while "connecting", then hand the session a live upstream.
        {
            let mut inner = session.inner.lock().await;
            inner.state = SessionState::Connecting;
        }
        session.submit_command(&transport, "c1").await;
        session.submit_command(&transport, "c2").await;

        let (upstream, _reader) = Upstream::open(
            &addr.ip().to_string(),
            addr.port(),
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        {
            let mut inner = session.inner.lock().await;
            inner.upstream = Some(Arc::new(upstream));
            inner.state = SessionState::Connected;
        }

        session.submit_command(&transport, "c3").await;

        assert_eq!(peer.await.unwrap(), b"c1\nc2\nc3\n");
        assert!(session.inner.lock().await.pending.is_empty());
    }

    #[tokio::test]
    async fn full_transport_queue_is_dropped_with_1013() {
        let session = test_session(SoundEngine::empty());
        // Queue capacity of 1: the second frame overflows.
        let (transport, _rx, mut closes) = channel_transport(1, 1);
        session.attach(transport).await.unwrap();

        session.ingest_chunk(b"one\ntwo\n", 0).await;

        let request = closes.recv().await.unwrap();
        assert_eq!(request.code, close::TRY_AGAIN);
        assert_eq!(session.client_count().await, 0);
    }

    #[tokio::test]
    async fn eviction_blocks_late_attach() {
        let session = test_session(SoundEngine::empty());
        assert!(session.try_evict(std::time::Duration::ZERO).await);
        let (transport, _rx, _closes) = channel_transport(1, 64);
        assert!(session.attach(transport).await.is_err());
    }

    #[tokio::test]
    async fn attached_session_is_not_evicted() {
        let session = test_session(SoundEngine::empty());
        let (transport, _rx, _closes) = channel_transport(1, 64);
        session.attach(transport).await.unwrap();
        assert!(!session.try_evict(std::time::Duration::ZERO).await);
    }
}
