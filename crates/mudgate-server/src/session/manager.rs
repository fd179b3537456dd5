//! Process-wide session registry: identity enforcement, attachment, and
//! periodic eviction of idle sessions.
//!
//! The manager mutex guards only the id→session map; it is never held
//! across session-internal awaits, so a slow session cannot stall attach
//! traffic for everyone else.

use std::collections::HashMap;
use std::sync::Arc;

use mudgate_core::{close, AttachStatus, SessionState};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::session::session::{Session, SessionSummary};
use crate::sounds::SoundEngine;
use crate::transport::TransportHandle;

/// Result of an `init` attachment attempt.
pub enum AttachOutcome {
    Attached {
        session: Arc<Session>,
        status: AttachStatus,
        state: SessionState,
        /// Retained history for `status=recovered`, when any.
        history: Option<String>,
    },
    Rejected {
        reason: &'static str,
        message: &'static str,
        close_code: u16,
    },
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cfg: Arc<GateConfig>,
    engine: Arc<SoundEngine>,
}

impl SessionManager {
    pub fn new(cfg: Arc<GateConfig>, engine: Arc<SoundEngine>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cfg,
            engine,
        }
    }

    /// Handle an `init` frame: recover an owned session, or create a fresh
    /// one. Ownership rules:
    ///
    ///   - known id + matching owner → recovered;
    ///   - known id + missing/wrong owner → rejected, close 4003;
    ///   - unknown id presented *with* an owner → rejected, close 4003
    ///     (the peer's session is gone; it must re-init fresh);
    ///   - no id, or unknown id without an owner → created.
    pub async fn attach(
        &self,
        transport: TransportHandle,
        public_id: Option<&str>,
        owner: Option<&str>,
    ) -> AttachOutcome {
        if let Some(id) = public_id {
            let existing = { self.sessions.lock().await.get(id).cloned() };
            if let Some(session) = existing {
                if !session.owner_matches(owner) {
                    warn!(public_id = %id, "owner mismatch on attach");
                    return AttachOutcome::Rejected {
                        reason: "owner_mismatch",
                        message: "Session belongs to another client",
                        close_code: close::SESSION_INVALID,
                    };
                }
                match session.attach(transport.clone()).await {
                    Ok(snapshot) => {
                        info!(public_id = %id, "session recovered");
                        return AttachOutcome::Attached {
                            session,
                            status: AttachStatus::Recovered,
                            state: snapshot.state,
                            history: snapshot.history,
                        };
                    }
                    // Swept between lookup and attach: same as unknown.
                    Err(()) => {
                        debug!(public_id = %id, "session evicted during attach");
                    }
                }
            }
            if owner.is_some() {
                return AttachOutcome::Rejected {
                    reason: "unknown_session",
                    message: "Session no longer exists",
                    close_code: close::SESSION_INVALID,
                };
            }
        }

        self.create_and_attach(transport).await
    }

    async fn create_and_attach(&self, transport: TransportHandle) -> AttachOutcome {
        let session = {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() >= self.cfg.max_sessions {
                warn!(max = self.cfg.max_sessions, "session cap reached");
                return AttachOutcome::Rejected {
                    reason: "max_sessions",
                    message: "Too many active sessions",
                    close_code: close::MAX_SESSIONS,
                };
            }
            let session = Arc::new(Session::new(self.cfg.clone(), self.engine.clone()));
            sessions.insert(session.public_id().to_string(), session.clone());
            session
        };

        match session.attach(transport).await {
            Ok(snapshot) => AttachOutcome::Attached {
                session,
                status: AttachStatus::Created,
                state: snapshot.state,
                history: snapshot.history,
            },
            // A brand-new session cannot be evicted before first attach;
            // treat it as a transient failure.
            Err(()) => AttachOutcome::Rejected {
                reason: "internal",
                message: "Session unavailable",
                close_code: close::SESSION_INVALID,
            },
        }
    }

    /// One eviction pass: sessions with no attached transports idle past the
    /// timeout are torn down and removed. Returns the evicted ids.
    pub async fn sweep_once(&self) -> Vec<String> {
        let candidates: Vec<Arc<Session>> =
            { self.sessions.lock().await.values().cloned().collect() };

        let mut evicted = Vec::new();
        for session in candidates {
            if session.try_evict(self.cfg.idle_timeout).await {
                evicted.push(session.public_id().to_string());
            }
        }

        if !evicted.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for id in &evicted {
                sessions.remove(id);
                info!(public_id = %id, "session evicted (idle)");
            }
        }
        evicted
    }

    /// Run `sweep_once` forever at the configured interval.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.cfg.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = self.sweep_once().await;
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "sweep removed sessions");
            }
        }
    }

    /// Close every session's upstream at process shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> =
            { self.sessions.lock().await.values().cloned().collect() };
        for session in sessions {
            session.shutdown().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn client_count(&self) -> usize {
        let sessions: Vec<Arc<Session>> =
            { self.sessions.lock().await.values().cloned().collect() };
        let mut total = 0;
        for session in sessions {
            total += session.client_count().await;
        }
        total
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> =
            { self.sessions.lock().await.values().cloned().collect() };
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.summary().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::transport::testing::channel_transport;

    fn manager_with(overrides: Overrides) -> Arc<SessionManager> {
        let cfg = Arc::new(GateConfig::load(None, overrides).unwrap());
        Arc::new(SessionManager::new(cfg, Arc::new(SoundEngine::empty())))
    }

    fn manager() -> Arc<SessionManager> {
        manager_with(Overrides::default())
    }

    #[tokio::test]
    async fn create_then_recover() {
        let manager = manager();
        let (t1, _rx1, _c1) = channel_transport(1, 64);
        let AttachOutcome::Attached { session, status, .. } =
            manager.attach(t1, None, None).await
        else {
            panic!("expected attach");
        };
        assert_eq!(status, AttachStatus::Created);

        let public_id = session.public_id().to_string();
        let owner = session.owner().to_string();
        session.detach(1).await;

        let (t2, _rx2, _c2) = channel_transport(2, 64);
        let AttachOutcome::Attached { status, history, .. } = manager
            .attach(t2, Some(&public_id), Some(&owner))
            .await
        else {
            panic!("expected recovery");
        };
        assert_eq!(status, AttachStatus::Recovered);
        assert!(history.is_none());
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn owner_mismatch_is_rejected() {
        let manager = manager();
        let (t1, _rx1, _c1) = channel_transport(1, 64);
        let AttachOutcome::Attached { session, .. } = manager.attach(t1, None, None).await else {
            panic!("expected attach");
        };
        let public_id = session.public_id().to_string();

        for claim in [Some("wrong"), None] {
            let (t, _rx, _c) = channel_transport(9, 64);
            let AttachOutcome::Rejected { reason, close_code, .. } =
                manager.attach(t, Some(&public_id), claim).await
            else {
                panic!("expected rejection");
            };
            assert_eq!(reason, "owner_mismatch");
            assert_eq!(close_code, close::SESSION_INVALID);
        }
    }

    #[tokio::test]
    async fn unknown_id_with_owner_is_rejected() {
        let manager = manager();
        let (t, _rx, _c) = channel_transport(1, 64);
        let AttachOutcome::Rejected { reason, close_code, .. } = manager
            .attach(t, Some("no-such-session"), Some("stale-owner"))
            .await
        else {
            panic!("expected rejection");
        };
        assert_eq!(reason, "unknown_session");
        assert_eq!(close_code, close::SESSION_INVALID);
    }

    #[tokio::test]
    async fn unknown_id_without_owner_creates_fresh() {
        let manager = manager();
        let (t, _rx, _c) = channel_transport(1, 64);
        let AttachOutcome::Attached { session, status, .. } = manager
            .attach(t, Some("never-seen-before"), None)
            .await
        else {
            panic!("expected attach");
        };
        assert_eq!(status, AttachStatus::Created);
        // A synthesized id, not the requested one.
        assert_ne!(session.public_id(), "never-seen-before");
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let manager = manager_with(Overrides {
            max_sessions: Some(1),
            ..Overrides::default()
        });
        let (t1, _rx1, _c1) = channel_transport(1, 64);
        assert!(matches!(
            manager.attach(t1, None, None).await,
            AttachOutcome::Attached { .. }
        ));

        let (t2, _rx2, _c2) = channel_transport(2, 64);
        let AttachOutcome::Rejected { reason, close_code, .. } =
            manager.attach(t2, None, None).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(reason, "max_sessions");
        assert_eq!(close_code, close::MAX_SESSIONS);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_detached_sessions() {
        let manager = manager_with(Overrides {
            idle_timeout_secs: Some(0),
            ..Overrides::default()
        });
        let (t1, _rx1, _c1) = channel_transport(1, 64);
        let AttachOutcome::Attached { session, .. } = manager.attach(t1, None, None).await else {
            panic!("expected attach");
        };

        // Still attached: survives the sweep.
        assert!(manager.sweep_once().await.is_empty());

        session.detach(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let evicted = manager.sweep_once().await;
        assert_eq!(evicted, vec![session.public_id().to_string()]);
        assert_eq!(manager.session_count().await, 0);

        // A late init for the evicted id (without owner) starts fresh.
        let (t2, _rx2, _c2) = channel_transport(2, 64);
        assert!(matches!(
            manager.attach(t2, Some(session.public_id()), None).await,
            AttachOutcome::Attached {
                status: AttachStatus::Created,
                ..
            }
        ));
    }
}
