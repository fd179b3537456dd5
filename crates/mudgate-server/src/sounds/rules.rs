//! Sound rule document parser.
//!
//! The document is TOML: an array of `[[rules]]` tables, each with a regex
//! `trigger`, an optional `gag` flag, and a `send` block — a line-oriented
//! stream of named calls. The recognized calls are `play`, `stop`, `delay`,
//! `pan`, `volume`, `channel`, `sound_id`; anything else (including the
//! legacy scripting constructs some rule exports carry) is skipped with a
//! warning, never fatal. A rule whose trigger does not compile is dropped
//! with a warning.

use std::path::Path;
use std::sync::LazyLock;

use mudgate_core::{GateError, GateResult};
use regex_lite::Regex;
use serde::Deserialize;
use tracing::{info, warn};

/// Raw document shape. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    trigger: String,
    #[serde(default)]
    gag: bool,
    #[serde(default)]
    send: String,
}

/// One compiled rule.
#[derive(Debug)]
pub struct SoundRule {
    pub trigger: Regex,
    pub gag: bool,
    pub calls: Vec<SendCall>,
}

/// Recognized send-block operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Play,
    Stop,
    Delay,
    Pan,
    Volume,
    Channel,
    SoundId,
}

impl SendOp {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "play" => Some(SendOp::Play),
            "stop" => Some(SendOp::Stop),
            "delay" => Some(SendOp::Delay),
            "pan" => Some(SendOp::Pan),
            "volume" => Some(SendOp::Volume),
            "channel" => Some(SendOp::Channel),
            "sound_id" => Some(SendOp::SoundId),
            _ => None,
        }
    }
}

/// A scalar argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Float(f) => Some(*f as i64),
            Scalar::Str(_) => None,
        }
    }
}

/// One call argument, positionally or `key=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub name: Option<String>,
    pub value: Scalar,
}

/// One parsed send-block call.
#[derive(Debug, Clone, PartialEq)]
pub struct SendCall {
    pub op: SendOp,
    pub args: Vec<CallArg>,
}

impl SendCall {
    /// The argument bound to `name`, if any.
    pub fn named(&self, name: &str) -> Option<&Scalar> {
        self.args
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .map(|a| &a.value)
    }

    /// The n-th positional (unnamed) argument.
    pub fn positional(&self, index: usize) -> Option<&Scalar> {
        self.args
            .iter()
            .filter(|a| a.name.is_none())
            .nth(index)
            .map(|a| &a.value)
    }
}

static CALL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").expect("static pattern")
});

static NAMED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+)$").expect("static pattern"));

static INT_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+$").expect("static pattern"));

static FLOAT_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+\.\d+$").expect("static pattern"));

/// Load and compile a rule document from disk.
pub fn load_rules(path: &Path) -> GateResult<Vec<SoundRule>> {
    let content = std::fs::read_to_string(path)?;
    let rules = parse_rules(&content)?;
    info!(path = %path.display(), count = rules.len(), "sound rules loaded");
    Ok(rules)
}

/// Parse a rule document from a TOML string.
pub fn parse_rules(content: &str) -> GateResult<Vec<SoundRule>> {
    let doc: RuleDoc = toml::from_str(content)
        .map_err(|e| GateError::Other(format!("rule document parse error: {e}")))?;

    let mut rules = Vec::with_capacity(doc.rules.len());
    for (index, spec) in doc.rules.into_iter().enumerate() {
        let trigger = match Regex::new(&spec.trigger) {
            Ok(re) => re,
            Err(e) => {
                warn!(rule = index, trigger = %spec.trigger, error = %e, "dropping rule with invalid trigger");
                continue;
            }
        };
        rules.push(SoundRule {
            trigger,
            gag: spec.gag,
            calls: parse_send_block(&spec.send),
        });
    }
    Ok(rules)
}

/// Parse the line-oriented call stream of a `send` block.
fn parse_send_block(send: &str) -> Vec<SendCall> {
    let mut calls = Vec::new();
    for raw in send.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("--") {
            continue;
        }
        match parse_call(line) {
            Some(call) => calls.push(call),
            None => warn!(line, "skipping unrecognized send call"),
        }
    }
    calls
}

fn parse_call(line: &str) -> Option<SendCall> {
    let caps = CALL_SHAPE.captures(line)?;
    let op = SendOp::from_name(&caps[1])?;
    let args = split_args(&caps[2])
        .iter()
        .map(|raw| parse_arg(raw))
        .collect();
    Some(SendCall { op, args })
}

/// Split an argument list on top-level commas, respecting quotes.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut quote: Option<char> = None;

    for ch in args.chars() {
        match quote {
            Some(q) => {
                buf.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                buf.push(ch);
            }
            None if ch == ',' => {
                if !buf.trim().is_empty() {
                    out.push(buf.trim().to_string());
                }
                buf.clear();
            }
            None => buf.push(ch),
        }
    }
    if !buf.trim().is_empty() {
        out.push(buf.trim().to_string());
    }
    out
}

fn parse_arg(raw: &str) -> CallArg {
    // A quoted value containing '=' never matches: the name part must start
    // with an identifier character.
    if let Some(caps) = NAMED_ARG.captures(raw) {
        return CallArg {
            name: Some(caps[1].to_string()),
            value: parse_scalar(caps[2].trim()),
        };
    }
    CallArg {
        name: None,
        value: parse_scalar(raw),
    }
}

fn parse_scalar(raw: &str) -> Scalar {
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
        {
            return Scalar::Str(raw[1..raw.len() - 1].to_string());
        }
    }
    if INT_LITERAL.is_match(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return Scalar::Int(n);
        }
    }
    if FLOAT_LITERAL.is_match(raw) {
        if let Ok(f) = raw.parse::<f64>() {
            return Scalar::Float(f);
        }
    }
    // Bare words (e.g. a stop target) are carried as opaque strings.
    Scalar::Str(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_positional_args() {
        let call = parse_call(r#"play(channel="fx", path="wolf_%1.wav", volume=80)"#).unwrap();
        assert_eq!(call.op, SendOp::Play);
        assert_eq!(call.named("channel"), Some(&Scalar::Str("fx".into())));
        assert_eq!(call.named("volume"), Some(&Scalar::Int(80)));

        let call = parse_call(r#"play("howl.wav")"#).unwrap();
        assert_eq!(call.positional(0), Some(&Scalar::Str("howl.wav".into())));
    }

    #[test]
    fn comma_inside_quotes_is_not_a_separator() {
        let call = parse_call(r#"play("a,b.wav", volume=50)"#).unwrap();
        assert_eq!(call.positional(0), Some(&Scalar::Str("a,b.wav".into())));
        assert_eq!(call.named("volume"), Some(&Scalar::Int(50)));
    }

    #[test]
    fn unrecognized_calls_are_skipped() {
        let calls = parse_send_block(
            "if x == 1 then\nExecute(\"dance\")\nplay(\"ok.wav\")\nend\nnot a call at all",
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, SendOp::Play);
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let calls = parse_send_block("# comment\n-- legacy comment\n\nstop()\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, SendOp::Stop);
    }

    #[test]
    fn document_parses_and_bad_triggers_drop() {
        let rules = parse_rules(
            r#"
            [[rules]]
            trigger = "^You hear (.*) howl$"
            send = '''
            play(channel="fx", path="wolf_%1.wav", volume=80)
            '''

            [[rules]]
            trigger = "([unclosed"
            send = "play(\"x.wav\")"

            [[rules]]
            trigger = "^It is raining"
            gag = true
            extra_key = "ignored"
            send = ""
            "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(!rules[0].gag);
        assert_eq!(rules[0].calls.len(), 1);
        assert!(rules[1].gag);
        assert!(rules[1].calls.is_empty());
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_rules("this is not toml [").is_err());
    }

    #[test]
    fn bare_word_argument_is_a_string() {
        let call = parse_call("stop(ambient)").unwrap();
        assert_eq!(call.positional(0), Some(&Scalar::Str("ambient".into())));
    }
}
