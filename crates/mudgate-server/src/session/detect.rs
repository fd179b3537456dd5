//! Pattern detection over upstream text: credential prompts, confirmation
//! prompts, and the server-side disconnect marker.
//!
//! These patterns are part of the external contract; clients rely on the
//! resulting `state` and `confirm` frames for UX hints.

use std::sync::LazyLock;

use regex_lite::Regex;

/// Case-insensitive substrings that indicate the upstream is waiting for
/// credentials or menu input.
const PROMPT_MARKERS: [&str; 5] = ["[input]", "name:", "login:", "password:", "senha:"];

/// Marker emitted by the upstream when it drops the player.
const DISCONNECT_MARKER: &str = "*** Disconnected ***";

static CONFIRM_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\[?are you sure you'd like to do this\?\]?$"#).expect("static pattern")
});

static CONFIRM_YES_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\[?enter "yes" or "no"\]?"#).expect("static pattern"));

/// Whether `text` (a line or the partial buffer) looks like an input prompt.
pub fn is_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    PROMPT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Whether a complete line asks the player for a yes/no confirmation.
pub fn is_confirm(line: &str) -> bool {
    let trimmed = line.trim();
    CONFIRM_QUESTION.is_match(trimmed) || CONFIRM_YES_NO.is_match(trimmed)
}

/// Whether a line carries the upstream's disconnect marker.
pub fn is_disconnect(line: &str) -> bool {
    line.contains(DISCONNECT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_markers_match_case_insensitively() {
        assert!(is_prompt("What is your Name: "));
        assert!(is_prompt("[Input]"));
        assert!(is_prompt("Password:"));
        assert!(is_prompt("Senha: "));
        assert!(is_prompt("login:"));
        assert!(!is_prompt("The wolf howls in the distance."));
    }

    #[test]
    fn prompt_matches_inside_partial_buffer() {
        assert!(is_prompt("By what name do you wish to be known? name:"));
    }

    #[test]
    fn confirm_question_with_optional_brackets() {
        assert!(is_confirm("Are you sure you'd like to do this?"));
        assert!(is_confirm("[Are you sure you'd like to do this?]"));
        assert!(is_confirm(r#"Please enter "yes" or "no":"#));
        assert!(!is_confirm("Are you sure about the weather?"));
    }

    #[test]
    fn disconnect_marker() {
        assert!(is_disconnect("*** Disconnected ***"));
        assert!(is_disconnect("  *** Disconnected ***  "));
        assert!(!is_disconnect("Disconnected"));
    }
}
