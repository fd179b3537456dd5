//! mudgate-client: client side of the gateway's reconnection & recovery
//! contract.
//!
//! Maintains a session identity (`publicId` + `owner`) across transport
//! drops, redials with bounded truncated-exponential backoff plus jitter,
//! queues commands while the link is down, and flushes them after a
//! successful `init_ok` — before anything submitted later.

pub mod backoff;
pub mod client;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{ClientConfig, ClientEvent, GateClient, LinkState};
