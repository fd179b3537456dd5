//! Session lifecycle: the per-user session, bounded history, prompt
//! detection, and the process-wide manager.

pub mod detect;
pub mod history;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::{AttachOutcome, SessionManager};
pub use session::{AttachSnapshot, Session, SessionSummary};
