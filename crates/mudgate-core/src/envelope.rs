//! JSON envelope framing for the gateway frame channel.
//!
//! Wire shape is always `{type, payload, meta}` — one JSON object per text
//! frame, UTF-8, at most [`MAX_FRAME_BYTES`] raw bytes. Legacy peers send
//! flat messages (`{"type":"init","publicId":"…"}`); the read path promotes
//! the known flat keys into `payload`. The enveloped form is the only one
//! ever emitted.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GateError, GateResult};

/// Maximum raw frame size accepted on the read path.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Well-known WebSocket close codes used by the broker.
pub mod close {
    /// Normal close.
    pub const NORMAL: u16 = 1000;
    /// Policy violation (bad init, malformed or oversized frames).
    pub const POLICY: u16 = 1008;
    /// Transport write error.
    pub const WRITE_ERROR: u16 = 1011;
    /// Rate limited / back-pressured — try again later.
    pub const TRY_AGAIN: u16 = 1013;
    /// Owner mismatch or session invalidated.
    pub const SESSION_INVALID: u16 = 4003;
    /// Session cap reached.
    pub const MAX_SESSIONS: u16 = 4008;
}

/// Flat top-level keys that legacy peers send instead of a `payload` object.
const LEGACY_PAYLOAD_KEYS: [&str; 8] = [
    "publicId", "owner", "value", "content", "message", "username", "password", "reason",
];

/// Frame metadata. Clients stamp `clientTs`/`client`; the server stamps
/// `serverTs` on every outgoing frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "clientTs", default, skip_serializing_if = "Option::is_none")]
    pub client_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(rename = "serverTs", default, skip_serializing_if = "Option::is_none")]
    pub server_ts: Option<i64>,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub meta: Meta,
}

impl Envelope {
    /// Build an envelope from a type tag and a JSON object payload. A
    /// non-object payload is treated as empty; callers pass
    /// `serde_json::json!({…})` literals.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            payload,
            meta: Meta::default(),
        }
    }

    /// Decode a raw text frame, enforcing the size cap and tolerating the
    /// legacy flat layout.
    pub fn decode(raw: &str) -> GateResult<Self> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(GateError::Oversized(raw.len()));
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|e| GateError::Malformed(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(GateError::Malformed("frame is not a JSON object".into()));
        };

        let kind = match obj.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(GateError::Malformed("missing or invalid 'type'".into())),
        };

        let mut payload = match obj.remove("payload") {
            Some(Value::Object(map)) => map,
            None | Some(Value::Null) => Map::new(),
            Some(_) => return Err(GateError::Malformed("'payload' is not an object".into())),
        };

        // Promote recognized flat keys; the enveloped form wins on conflict.
        for key in LEGACY_PAYLOAD_KEYS {
            if let Some(value) = obj.remove(key) {
                payload.entry(key.to_string()).or_insert(value);
            }
        }

        let meta = match obj.remove("meta") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| GateError::Malformed(format!("invalid 'meta': {e}")))?,
            None => Meta::default(),
        };

        Ok(Self { kind, payload, meta })
    }

    /// Serialize to a wire string, stamping `meta.serverTs`.
    pub fn encode_stamped(mut self) -> GateResult<String> {
        self.meta.server_ts = Some(now_ms());
        self.encode()
    }

    /// Serialize to a wire string as-is.
    pub fn encode(&self) -> GateResult<String> {
        serde_json::to_string(self).map_err(|e| GateError::Malformed(e.to_string()))
    }

    /// Fetch a string field from the payload, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
