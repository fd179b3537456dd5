//! Sound-event engine: evaluates a rule document against upstream lines and
//! emits structured audio events for attached clients.

pub mod engine;
pub mod rules;

pub use engine::{LineSounds, SoundEngine};
pub use rules::{load_rules, SoundRule};
