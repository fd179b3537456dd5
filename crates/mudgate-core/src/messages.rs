//! Message taxonomy for the gateway frame channel.
//!
//! Client → server: `init`, `connect`, `disconnect`, `command`, `login`.
//! Server → client: `init_ok`, `session_invalid`, `state`, `history`,
//! `line`, `system`, `sound`, `confirm`, `error`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::envelope::Envelope;
use crate::error::{GateError, GateResult};

/// Connection state of a session as seen on the wire.
///
/// `Reconnecting` is only ever produced client-side; the server reports the
/// other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingLogin,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::AwaitingLogin => "AWAITING_LOGIN",
            SessionState::Reconnecting => "RECONNECTING",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported in `init_ok.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Created,
    Recovered,
}

impl AttachStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachStatus::Created => "created",
            AttachStatus::Recovered => "recovered",
        }
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Init {
        public_id: Option<String>,
        owner: Option<String>,
    },
    Connect,
    Disconnect,
    Command {
        value: String,
    },
    Login {
        username: String,
        password: String,
    },
}

impl ClientMessage {
    /// Interpret a decoded envelope as a client request.
    ///
    /// Missing string fields default to empty, matching the lenient read
    /// path of the wire contract; an unknown `type` is an error the caller
    /// reports without tearing the transport down.
    pub fn from_envelope(env: &Envelope) -> GateResult<Self> {
        let owned = |key: &str| env.str_field(key).map(str::to_string);
        match env.kind.as_str() {
            "init" => Ok(ClientMessage::Init {
                public_id: owned("publicId").filter(|s| !s.is_empty()),
                owner: owned("owner").filter(|s| !s.is_empty()),
            }),
            "connect" => Ok(ClientMessage::Connect),
            "disconnect" => Ok(ClientMessage::Disconnect),
            "command" => Ok(ClientMessage::Command {
                value: owned("value").unwrap_or_default(),
            }),
            "login" => Ok(ClientMessage::Login {
                username: owned("username").unwrap_or_default(),
                password: owned("password").unwrap_or_default(),
            }),
            other => Err(GateError::UnknownType(other.to_string())),
        }
    }
}

/// Whether a sound event starts or stops playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundAction {
    Play,
    Stop,
}

/// One structured audio event, forwarded verbatim inside a `sound` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundEvent {
    pub action: SoundAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

// ── Server frame constructors ────────────────────────────────────────────

pub fn init_ok(
    public_id: &str,
    owner: &str,
    status: AttachStatus,
    has_history: bool,
) -> Envelope {
    Envelope::new(
        "init_ok",
        json!({
            "publicId": public_id,
            "owner": owner,
            "status": status.as_str(),
            "hasHistory": has_history,
        }),
    )
}

pub fn session_invalid(reason: &str, message: &str) -> Envelope {
    Envelope::new(
        "session_invalid",
        json!({ "reason": reason, "message": message }),
    )
}

pub fn state(value: SessionState) -> Envelope {
    Envelope::new("state", json!({ "value": value.as_str() }))
}

pub fn history(content: &str) -> Envelope {
    Envelope::new("history", json!({ "content": content }))
}

pub fn line(content: &str) -> Envelope {
    Envelope::new("line", json!({ "content": content }))
}

/// A `line` frame flagged as gagged by a sound rule. Delivery still happens
/// (ordering and history guarantees hold); hiding it is the peer's call.
pub fn gagged_line(content: &str) -> Envelope {
    Envelope::new("line", json!({ "content": content, "gag": true }))
}

pub fn system(message: &str) -> Envelope {
    Envelope::new("system", json!({ "message": message }))
}

pub fn sound(events: &[SoundEvent]) -> Envelope {
    Envelope::new(
        "sound",
        json!({ "events": serde_json::to_value(events).unwrap_or_default() }),
    )
}

pub fn confirm(message: &str) -> Envelope {
    Envelope::new("confirm", json!({ "message": message }))
}

pub fn error(message: &str) -> Envelope {
    Envelope::new("error", json!({ "message": message }))
}
