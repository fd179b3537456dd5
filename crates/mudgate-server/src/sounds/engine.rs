//! Per-line evaluation of compiled sound rules.
//!
//! Stateless per line: every rule trigger is tested in declaration order;
//! on match the send block runs left to right, accumulating channel, pan,
//! volume and delay into a cursor and emitting one event per `play`/`stop`.
//! `%1`–`%9` in string arguments interpolate the trigger's capture groups.

use std::path::Path;
use std::sync::LazyLock;

use mudgate_core::{GateResult, SoundAction, SoundEvent};
use regex_lite::{Captures, Regex};
use tracing::warn;

use super::rules::{load_rules, Scalar, SendCall, SendOp, SoundRule};

static ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("static pattern"));
static ANSI_OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07]*\x07").expect("static pattern"));

/// Result of evaluating one upstream line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineSounds {
    pub events: Vec<SoundEvent>,
    /// At least one matching rule carried the `gag` flag. Delivery is not
    /// suppressed broker-side; the flag rides along as a rendering hint.
    pub gag: bool,
}

pub struct SoundEngine {
    rules: Vec<SoundRule>,
}

impl SoundEngine {
    pub fn new(rules: Vec<SoundRule>) -> Self {
        Self { rules }
    }

    /// An engine with no rules; every line evaluates to nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Load the rule document at `path`.
    pub fn load(path: &Path) -> GateResult<Self> {
        Ok(Self::new(load_rules(path)?))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every rule against `line` (pre-trim, as read from upstream).
    pub fn process_line(&self, line: &str) -> LineSounds {
        let normalized = normalize_line(line);
        if normalized.trim().is_empty() {
            return LineSounds::default();
        }

        let mut out = LineSounds::default();
        let mut sound_seq = 0u32;
        for rule in &self.rules {
            for caps in rule.trigger.captures_iter(&normalized) {
                out.gag |= rule.gag;
                evaluate_send(&rule.calls, &caps, &mut sound_seq, &mut out.events);
            }
        }
        out
    }
}

/// Strip carriage returns, newlines, and ANSI color/OSC sequences before
/// matching, so triggers are written against plain text.
fn normalize_line(line: &str) -> String {
    let text = line.replace(['\r', '\n'], "");
    let text = ANSI_CSI.replace_all(&text, "");
    ANSI_OSC.replace_all(&text, "").into_owned()
}

/// Accumulator for the event under construction.
#[derive(Debug, Default, Clone)]
struct Cursor {
    channel: Option<String>,
    pan: Option<i32>,
    volume: Option<u32>,
    delay_ms: u64,
    sound_id: Option<String>,
}

fn evaluate_send(
    calls: &[SendCall],
    caps: &Captures<'_>,
    sound_seq: &mut u32,
    events: &mut Vec<SoundEvent>,
) {
    // Plays are full volume unless the block says otherwise.
    let mut cursor = Cursor {
        volume: Some(100),
        ..Cursor::default()
    };

    for call in calls {
        match call.op {
            SendOp::Channel => {
                cursor.channel = string_arg(call.named("name").or(call.positional(0)), caps);
            }
            SendOp::Volume => {
                cursor.volume = int_arg(call.named("value").or(call.positional(0))).map(|n| n as u32);
            }
            SendOp::Pan => {
                cursor.pan = int_arg(call.named("value").or(call.positional(0))).map(|n| n as i32);
            }
            SendOp::Delay => {
                cursor.delay_ms = int_arg(call.named("ms").or(call.positional(0)))
                    .map(|n| n.max(0) as u64)
                    .unwrap_or(0);
            }
            SendOp::SoundId => {
                cursor.sound_id = string_arg(call.named("id").or(call.positional(0)), caps);
            }
            SendOp::Play => {
                let path = string_arg(call.named("path").or(call.positional(0)), caps);
                let Some(path) = path else {
                    warn!("play call without a path, skipping");
                    continue;
                };
                let sound_id = string_arg(call.named("sound_id"), caps)
                    .or_else(|| cursor.sound_id.take())
                    .unwrap_or_else(|| {
                        *sound_seq += 1;
                        format!("s{sound_seq}")
                    });
                events.push(SoundEvent {
                    action: SoundAction::Play,
                    channel: string_arg(call.named("channel"), caps).or(cursor.channel.clone()),
                    path: Some(path),
                    delay_ms: int_arg(call.named("delay_ms"))
                        .map(|n| n.max(0) as u64)
                        .unwrap_or(cursor.delay_ms),
                    pan: int_arg(call.named("pan")).map(|n| n as i32).or(cursor.pan),
                    volume: int_arg(call.named("volume"))
                        .map(|n| n as u32)
                        .or(cursor.volume),
                    sound_id: Some(sound_id),
                    target: None,
                });
            }
            SendOp::Stop => {
                events.push(SoundEvent {
                    action: SoundAction::Stop,
                    channel: string_arg(call.named("channel"), caps).or(cursor.channel.clone()),
                    path: None,
                    delay_ms: cursor.delay_ms,
                    pan: None,
                    volume: None,
                    sound_id: None,
                    target: string_arg(call.named("target").or(call.positional(0)), caps),
                });
            }
        }
    }
}

fn string_arg(scalar: Option<&Scalar>, caps: &Captures<'_>) -> Option<String> {
    match scalar {
        Some(Scalar::Str(s)) => Some(interpolate(s, caps)),
        Some(Scalar::Int(n)) => Some(n.to_string()),
        Some(Scalar::Float(f)) => Some(f.to_string()),
        None => None,
    }
}

fn int_arg(scalar: Option<&Scalar>) -> Option<i64> {
    scalar.and_then(Scalar::as_i64)
}

/// Replace `%1`–`%9` with the corresponding capture group (empty when the
/// group did not participate in the match).
fn interpolate(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '%' {
            if let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                if (1..=9).contains(&d) {
                    chars.next();
                    out.push_str(caps.get(d as usize).map(|m| m.as_str()).unwrap_or(""));
                    continue;
                }
            }
        }
        out.push(ch);
    }
    out
}
